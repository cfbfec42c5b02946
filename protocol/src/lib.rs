//! Wire types shared across the ShipSec execution runtime: component
//! definitions and their typed port contracts, runner specifications,
//! terminal chunk records, node-IO records and telemetry envelopes.
//!
//! Everything here serializes with camelCase field names; these are the
//! exact shapes persisted by the ingestors and streamed to live viewers.

mod component;
mod ports;
mod retry;
mod runner;
mod telemetry;
mod terminal;

pub use component::ComponentCategory;
pub use component::ComponentDefinition;
pub use component::ComponentId;
pub use component::ComponentIdError;
pub use component::ToolProviderSpec;
pub use ports::Binding;
pub use ports::Contract;
pub use ports::ContractViolation;
pub use ports::PortSpec;
pub use ports::PortType;
pub use retry::RetryPolicy;
pub use runner::ContainerSpec;
pub use runner::NetworkMode;
pub use runner::RunnerKind;
pub use runner::RunnerSpec;
pub use runner::VolumeMount;
pub use telemetry::LogLevel;
pub use telemetry::LogRecord;
pub use telemetry::NodeIoCompletion;
pub use telemetry::NodeIoRecord;
pub use telemetry::ProgressEvent;
pub use terminal::TerminalChunk;
pub use terminal::TerminalStream;
