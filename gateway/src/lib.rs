//! Reverse-MCP gateway: aggregates tools registered by workflow nodes and
//! by external MCP servers, and routes `tools/list` / `tools/call` from
//! connected agents to the right provider.
//!
//! Every request presents a signed session token scoping it to one run and
//! a set of tool-provider node ids.

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod registry;
mod server;
mod token;

pub use registry::ToolRegistration;
pub use registry::ToolRegistry;
pub use server::GatewayState;
pub use server::LocalToolRouter;
pub use server::router;
pub use token::SESSION_TOKEN_TTL;
pub use token::SessionClaims;
pub use token::TokenSigner;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}
