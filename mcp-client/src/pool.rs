use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use mcp_types::CallToolResult;

use crate::McpClient;
use crate::McpClientError;
use crate::McpServerConfig;

/// Bound on `tools/list` during a health probe.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on `tools/list` during discovery.
pub const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on a single `tools/call`.
pub const CALL_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Idle connections older than this are evicted by the sweeper.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(300);
const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Tool surface reported by discovery: name plus whatever the provider
/// documented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum HealthStatus {
    Healthy { tool_count: usize },
    Unhealthy { reason: String },
}

struct PoolEntry {
    client: Arc<McpClient>,
    last_used: Instant,
}

/// Pooled MCP client service. One entry per server id; a single sweeper
/// task closes entries idle past the TTL.
pub struct McpService {
    entries: Mutex<HashMap<String, PoolEntry>>,
    idle_ttl: Duration,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl McpService {
    pub fn new() -> Arc<Self> {
        Self::with_idle_ttl(DEFAULT_IDLE_TTL)
    }

    pub fn with_idle_ttl(idle_ttl: Duration) -> Arc<Self> {
        let service = Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            idle_ttl,
            sweeper: StdMutex::new(None),
        });

        // The sweeper holds a weak reference so dropping the service also
        // retires the task.
        let weak = Arc::downgrade(&service);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(service) = weak.upgrade() else {
                    break;
                };
                service.sweep().await;
            }
        });
        if let Ok(mut sweeper) = service.sweeper.lock() {
            *sweeper = Some(handle);
        }

        service
    }

    pub(crate) async fn sweep(&self) {
        let mut evicted = Vec::new();
        {
            let mut entries = self.entries.lock().await;
            let now = Instant::now();
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.last_used) >= self.idle_ttl)
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                if let Some(entry) = entries.remove(&id) {
                    evicted.push((id, entry.client));
                }
            }
        }
        for (id, client) in evicted {
            debug!(server = %id, "evicting idle mcp connection");
            client.close().await;
        }
    }

    async fn get_or_connect(
        &self,
        config: &McpServerConfig,
    ) -> Result<Arc<McpClient>, McpClientError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&config.server_id) {
            entry.last_used = Instant::now();
            return Ok(entry.client.clone());
        }

        let client = Arc::new(McpClient::connect(config).await?);
        info!(server = %config.server_id, transport = %config.transport, "mcp connection opened");
        entries.insert(
            config.server_id.clone(),
            PoolEntry {
                client: client.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(client)
    }

    async fn evict(&self, server_id: &str) {
        let removed = self.entries.lock().await.remove(server_id);
        if let Some(entry) = removed {
            entry.client.close().await;
        }
    }

    /// Probe the server: open (or reuse) the connection and list tools
    /// within the health bound. Any failure evicts the cached connection.
    pub async fn health_check(&self, config: &McpServerConfig) -> HealthStatus {
        let probe = async {
            let client = self.get_or_connect(config).await?;
            client.list_tools(HEALTH_CHECK_TIMEOUT).await
        };
        match probe.await {
            Ok(result) => HealthStatus::Healthy {
                tool_count: result.tools.len(),
            },
            Err(err) => {
                warn!(server = %config.server_id, "health check failed: {err}");
                self.evict(&config.server_id).await;
                HealthStatus::Unhealthy {
                    reason: err.to_string(),
                }
            }
        }
    }

    pub async fn discover_tools(
        &self,
        config: &McpServerConfig,
    ) -> Result<Vec<DiscoveredTool>, McpClientError> {
        let client = self.get_or_connect(config).await?;
        let result = client.list_tools(LIST_TOOLS_TIMEOUT).await?;
        let tools = result
            .tools
            .into_iter()
            .map(|tool| DiscoveredTool {
                name: tool.name,
                description: tool.description,
                input_schema: serde_json::to_value(tool.input_schema).ok(),
            })
            .collect();
        Ok(tools)
    }

    pub async fn call_tool(
        &self,
        config: &McpServerConfig,
        name: String,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, McpClientError> {
        let client = self.get_or_connect(config).await?;
        client.call_tool(name, arguments, CALL_TOOL_TIMEOUT).await
    }

    pub async fn disconnect(&self, server_id: &str) {
        self.evict(server_id).await;
    }

    /// Stop the sweeper and close every pooled connection.
    pub async fn cleanup(&self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
        let drained: Vec<(String, Arc<McpClient>)> = {
            let mut entries = self.entries.lock().await;
            entries
                .drain()
                .map(|(id, entry)| (id, entry.client))
                .collect()
        };
        for (id, client) in drained {
            debug!(server = %id, "closing pooled mcp connection");
            client.close().await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn pooled_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn age_entry(&self, server_id: &str, by: Duration) {
        if let Some(entry) = self.entries.lock().await.get_mut(server_id) {
            entry.last_used = Instant::now() - by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransportKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::body_partial_json;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    async fn mock_mcp_server(tools: Value) -> MockServer {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(json!({"method": "initialize"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "mock", "version": "0"},
                    "protocolVersion": "2025-03-26"
                }
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(
                json!({"method": "notifications/initialized"}),
            ))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(json!({"method": "tools/list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "result": {"tools": tools}
            })))
            .mount(&server)
            .await;

        server
    }

    fn config(server: &MockServer, server_id: &str) -> McpServerConfig {
        McpServerConfig {
            server_id: server_id.to_string(),
            transport: TransportKind::Http,
            endpoint: Some(format!("{}/mcp", server.uri())),
            command: None,
            args: Vec::new(),
            env: None,
            headers: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn discovers_tools_over_streamable_http() {
        let server = mock_mcp_server(json!([
            {"name": "port-scan", "description": "TCP scan", "inputSchema": {"type": "object"}},
            {"name": "dns-lookup", "inputSchema": {"type": "object"}}
        ]))
        .await;

        let service = McpService::new();
        let tools = service.discover_tools(&config(&server, "probe")).await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "port-scan");
        assert_eq!(tools[0].description.as_deref(), Some("TCP scan"));
        service.cleanup().await;
    }

    #[tokio::test]
    async fn health_check_reports_tool_count_and_reuses_the_connection() {
        let server = mock_mcp_server(json!([{"name": "probe", "inputSchema": {"type": "object"}}]))
            .await;

        let service = McpService::new();
        let status = service.health_check(&config(&server, "probe")).await;
        assert_eq!(status, HealthStatus::Healthy { tool_count: 1 });
        assert_eq!(service.pooled_count().await, 1);
        service.cleanup().await;
    }

    #[tokio::test]
    async fn failed_health_check_evicts_the_connection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let service = McpService::new();
        let status = service.health_check(&config(&server, "flaky")).await;
        assert!(matches!(status, HealthStatus::Unhealthy { .. }));
        assert_eq!(service.pooled_count().await, 0);
        service.cleanup().await;
    }

    #[tokio::test]
    async fn sweep_evicts_entries_idle_past_the_ttl() {
        let server = mock_mcp_server(json!([])).await;

        let service = McpService::with_idle_ttl(Duration::from_secs(300));
        service
            .discover_tools(&config(&server, "probe"))
            .await
            .unwrap();
        assert_eq!(service.pooled_count().await, 1);

        // Still fresh: nothing to evict.
        service.sweep().await;
        assert_eq!(service.pooled_count().await, 1);

        service.age_entry("probe", Duration::from_secs(301)).await;
        service.sweep().await;
        assert_eq!(service.pooled_count().await, 0);
        service.cleanup().await;
    }

    #[tokio::test]
    async fn disconnect_removes_a_single_server() {
        let server = mock_mcp_server(json!([])).await;

        let service = McpService::new();
        service
            .discover_tools(&config(&server, "a"))
            .await
            .unwrap();
        service
            .discover_tools(&config(&server, "b"))
            .await
            .unwrap();
        assert_eq!(service.pooled_count().await, 2);

        service.disconnect("a").await;
        assert_eq!(service.pooled_count().await, 1);
        service.cleanup().await;
    }
}
