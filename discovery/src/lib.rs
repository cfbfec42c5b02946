//! Tool discovery workflow: interrogates an unknown MCP server for its
//! tool set, behind an idempotent TTL cache keyed by a caller-provided
//! cache token. Clients poll the workflow through a query handler.

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod cache;
mod workflow;

pub use cache::DiscoveryCache;
pub use cache::DiscoveryCacheEntry;
pub use workflow::DISCOVERY_TIMEOUT;
pub use workflow::DiscoveryError;
pub use workflow::DiscoveryErrorCode;
pub use workflow::DiscoveryInput;
pub use workflow::DiscoveryReport;
pub use workflow::DiscoveryStatus;
pub use workflow::DiscoveryWorkflow;
pub use workflow::GroupDiscoveryResult;
pub use workflow::ServerDiscoveryOutcome;
