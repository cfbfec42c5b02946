//! Transport-agnostic MCP client used by the gateway, the discovery
//! workflow and agent tool nodes.
//!
//! Four transports are supported: streamable HTTP, SSE, WebSocket and
//! stdio subprocesses. [`McpService`] layers a connection pool with idle
//! eviction on top of the raw [`McpClient`].

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

mod client;
mod pool;

pub use client::McpClient;
pub use client::McpClientError;
pub use pool::DiscoveredTool;
pub use pool::HealthStatus;
pub use pool::McpService;
pub use pool::CALL_TOOL_TIMEOUT;
pub use pool::HEALTH_CHECK_TIMEOUT;
pub use pool::LIST_TOOLS_TIMEOUT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Sse,
    Websocket,
    Stdio,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Http => write!(f, "http"),
            TransportKind::Sse => write!(f, "sse"),
            TransportKind::Websocket => write!(f, "websocket"),
            TransportKind::Stdio => write!(f, "stdio"),
        }
    }
}

/// Connection instructions for one MCP server. `endpoint` backs the HTTP
/// family, `command`/`args`/`env` back stdio; `headers` are resolved
/// (secrets already substituted) before they reach this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    pub server_id: String,
    pub transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}
