use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use shipsec_mcp_client::DiscoveredTool;
use shipsec_mcp_client::McpClientError;
use shipsec_mcp_client::McpServerConfig;
use shipsec_mcp_client::McpService;
use shipsec_mcp_client::TransportKind;

use crate::cache::DiscoveryCache;

/// Bound on one server's discovery, connect included.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryInput {
    pub transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_token: Option<String>,
    /// Image that packages a stdio server, when it is containerized.
    /// Recorded for the caller; spawning happens through `command`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

impl DiscoveryInput {
    /// Pool key: explicit id, else the endpoint or command string.
    fn effective_server_id(&self) -> String {
        self.server_id
            .clone()
            .or_else(|| self.endpoint.clone())
            .or_else(|| self.command.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Failure classification surfaced through the poll query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveryErrorCode {
    /// The request never reached a server: endpoint/command missing for
    /// the chosen transport.
    InvalidInput,
    /// The server answered with an error result; retrying will not help.
    NonRetryableFailure,
    /// Transport failure or timeout; a retry may succeed.
    ActivityFailure,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct DiscoveryError {
    pub code: DiscoveryErrorCode,
    pub message: String,
}

impl DiscoveryError {
    fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            code: DiscoveryErrorCode::InvalidInput,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiscoveryStatus {
    Running,
    Completed,
    Failed,
}

/// Snapshot returned by the `getDiscoveryResult` query handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryReport {
    pub status: DiscoveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<DiscoveredTool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<DiscoveryErrorCode>,
}

impl DiscoveryReport {
    fn running() -> Self {
        Self {
            status: DiscoveryStatus::Running,
            tools: None,
            tool_count: None,
            error: None,
            error_code: None,
        }
    }

    fn completed(tools: Vec<DiscoveredTool>) -> Self {
        Self {
            status: DiscoveryStatus::Completed,
            tool_count: Some(tools.len()),
            tools: Some(tools),
            error: None,
            error_code: None,
        }
    }

    fn failed(error: &DiscoveryError) -> Self {
        Self {
            status: DiscoveryStatus::Failed,
            tools: None,
            tool_count: None,
            error: Some(error.message.clone()),
            error_code: Some(error.code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDiscoveryOutcome {
    pub server_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<DiscoveredTool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<DiscoveryErrorCode>,
}

/// Group discovery keeps the envelope `completed` even when individual
/// servers fail; each entry reports its own outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDiscoveryResult {
    pub status: DiscoveryStatus,
    pub servers: Vec<ServerDiscoveryOutcome>,
}

pub struct DiscoveryWorkflow {
    workflow_id: String,
    service: Arc<McpService>,
    cache: Arc<DiscoveryCache>,
    report: Mutex<DiscoveryReport>,
}

impl DiscoveryWorkflow {
    pub fn new(workflow_id: &str, service: Arc<McpService>, cache: Arc<DiscoveryCache>) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            service,
            cache,
            report: Mutex::new(DiscoveryReport::running()),
        }
    }

    /// Query handler: current status for polling clients.
    pub fn get_discovery_result(&self) -> DiscoveryReport {
        match self.report.lock() {
            Ok(report) => report.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_report(&self, report: DiscoveryReport) {
        match self.report.lock() {
            Ok(mut guard) => *guard = report,
            Err(poisoned) => *poisoned.into_inner() = report,
        }
    }

    pub async fn run(&self, input: DiscoveryInput) -> Result<DiscoveryReport, DiscoveryError> {
        match self.discover(&input).await {
            Ok(tools) => {
                let report = DiscoveryReport::completed(tools);
                self.set_report(report.clone());
                Ok(report)
            }
            Err(err) => {
                self.set_report(DiscoveryReport::failed(&err));
                Err(err)
            }
        }
    }

    async fn discover(&self, input: &DiscoveryInput) -> Result<Vec<DiscoveredTool>, DiscoveryError> {
        validate(input)?;

        if let Some(cache_token) = &input.cache_token {
            if let Some(entry) = self.cache.get(cache_token) {
                debug!(
                    workflow = %self.workflow_id,
                    cache_token = %cache_token,
                    "discovery served from cache"
                );
                return Ok(entry.tools);
            }
        }

        let config = to_server_config(input);
        let tools = match timeout(DISCOVERY_TIMEOUT, self.service.discover_tools(&config)).await {
            Ok(Ok(tools)) => tools,
            Ok(Err(err)) => {
                // An error result from the server itself will not get
                // better on retry; broken transports might.
                let code = match &err {
                    McpClientError::Rpc(_) => DiscoveryErrorCode::NonRetryableFailure,
                    _ => DiscoveryErrorCode::ActivityFailure,
                };
                return Err(DiscoveryError {
                    code,
                    message: format!("discovery failed: {err}"),
                });
            }
            Err(_) => {
                return Err(DiscoveryError {
                    code: DiscoveryErrorCode::ActivityFailure,
                    message: format!("discovery timed out after {DISCOVERY_TIMEOUT:?}"),
                });
            }
        };

        if let Some(cache_token) = &input.cache_token {
            // A lost cache write only costs a future re-discovery.
            let entry = self.cache.put(cache_token, &self.workflow_id, tools.clone());
            debug!(
                workflow = %self.workflow_id,
                cache_token = %cache_token,
                expires_at = %entry.expires_at,
                "discovery result cached"
            );
        }

        Ok(tools)
    }

    /// Discover a whole list of servers; partial failures land in the
    /// per-server entries.
    pub async fn run_group(&self, inputs: Vec<DiscoveryInput>) -> GroupDiscoveryResult {
        let mut servers = Vec::with_capacity(inputs.len());
        for input in inputs {
            let server_id = input.effective_server_id();
            match self.discover(&input).await {
                Ok(tools) => servers.push(ServerDiscoveryOutcome {
                    server_id,
                    tool_count: Some(tools.len()),
                    tools: Some(tools),
                    error: None,
                    error_code: None,
                }),
                Err(err) => servers.push(ServerDiscoveryOutcome {
                    server_id,
                    tools: None,
                    tool_count: None,
                    error: Some(err.message.clone()),
                    error_code: Some(err.code),
                }),
            }
        }
        GroupDiscoveryResult {
            status: DiscoveryStatus::Completed,
            servers,
        }
    }
}

fn validate(input: &DiscoveryInput) -> Result<(), DiscoveryError> {
    match input.transport {
        TransportKind::Http | TransportKind::Sse | TransportKind::Websocket => {
            if input.endpoint.as_deref().unwrap_or("").is_empty() {
                return Err(DiscoveryError::invalid_input(format!(
                    "{} transport requires an endpoint",
                    input.transport
                )));
            }
        }
        TransportKind::Stdio => {
            if input.command.as_deref().unwrap_or("").is_empty() {
                return Err(DiscoveryError::invalid_input(
                    "stdio transport requires a command",
                ));
            }
        }
    }
    Ok(())
}

fn to_server_config(input: &DiscoveryInput) -> McpServerConfig {
    McpServerConfig {
        server_id: input.effective_server_id(),
        transport: input.transport,
        endpoint: input.endpoint.clone(),
        command: input.command.clone(),
        args: input.args.clone(),
        env: None,
        headers: input.headers.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::body_partial_json;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    async fn mock_mcp_server() -> MockServer {
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
                "result": {"tools": [
                    {"name": "a", "inputSchema": {"type": "object"}},
                    {"name": "b", "inputSchema": {"type": "object"}},
                    {"name": "c", "inputSchema": {"type": "object"}}
                ]}
            })))
            .mount(&server)
            .await;

        server
    }

    fn http_input(server: &MockServer, cache_token: Option<&str>) -> DiscoveryInput {
        DiscoveryInput {
            transport: TransportKind::Http,
            endpoint: Some(format!("{}/mcp", server.uri())),
            command: None,
            args: Vec::new(),
            headers: HashMap::new(),
            cache_token: cache_token.map(str::to_string),
            image: None,
            server_id: Some("srv".to_string()),
        }
    }

    fn workflow(service: Arc<McpService>, cache: Arc<DiscoveryCache>) -> DiscoveryWorkflow {
        DiscoveryWorkflow::new("wf-1", service, cache)
    }

    #[tokio::test]
    async fn completes_with_tools_and_count() {
        let server = mock_mcp_server().await;
        let wf = workflow(McpService::new(), Arc::new(DiscoveryCache::default()));

        let report = wf.run(http_input(&server, None)).await.unwrap();
        assert_eq!(report.status, DiscoveryStatus::Completed);
        assert_eq!(report.tool_count, Some(3));
        assert_eq!(
            report
                .tools
                .unwrap()
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(wf.get_discovery_result().status, DiscoveryStatus::Completed);
    }

    #[tokio::test]
    async fn cached_rerun_skips_the_transport() {
        let server = mock_mcp_server().await;
        let service = McpService::new();
        let cache = Arc::new(DiscoveryCache::default());

        let wf = workflow(service.clone(), cache.clone());
        let first = wf.run(http_input(&server, Some("T1"))).await.unwrap();

        let requests_after_first = server.received_requests().await.unwrap().len();

        // A fresh service proves the cache, not the pool, served the rerun.
        let wf2 = workflow(McpService::new(), cache);
        let second = wf2.run(http_input(&server, Some("T1"))).await.unwrap();

        assert_eq!(first.tools, second.tools);
        let requests_after_second = server.received_requests().await.unwrap().len();
        assert_eq!(requests_after_first, requests_after_second);
    }

    #[tokio::test]
    async fn http_without_endpoint_is_invalid_input() {
        let wf = workflow(McpService::new(), Arc::new(DiscoveryCache::default()));
        let input = DiscoveryInput {
            transport: TransportKind::Http,
            endpoint: None,
            command: None,
            args: Vec::new(),
            headers: HashMap::new(),
            cache_token: None,
            image: None,
            server_id: None,
        };

        let err = wf.run(input).await.unwrap_err();
        assert_eq!(err.code, DiscoveryErrorCode::InvalidInput);

        let report = wf.get_discovery_result();
        assert_eq!(report.status, DiscoveryStatus::Failed);
        assert_eq!(report.error_code, Some(DiscoveryErrorCode::InvalidInput));
    }

    #[tokio::test]
    async fn stdio_without_command_is_invalid_input() {
        let wf = workflow(McpService::new(), Arc::new(DiscoveryCache::default()));
        let input = DiscoveryInput {
            transport: TransportKind::Stdio,
            endpoint: None,
            command: None,
            args: Vec::new(),
            headers: HashMap::new(),
            cache_token: None,
            image: None,
            server_id: None,
        };
        let err = wf.run(input).await.unwrap_err();
        assert_eq!(err.code, DiscoveryErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn transport_failures_report_activity_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let wf = workflow(McpService::new(), Arc::new(DiscoveryCache::default()));
        let err = wf.run(http_input(&server, None)).await.unwrap_err();
        assert_eq!(err.code, DiscoveryErrorCode::ActivityFailure);
    }

    #[tokio::test]
    async fn server_side_errors_report_non_retryable_failure() {
        // Handshake succeeds, then the server rejects tools/list with a
        // JSON-RPC error result.
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
                "error": {"code": -32603, "message": "tool catalog unavailable"}
            })))
            .mount(&server)
            .await;

        let wf = workflow(McpService::new(), Arc::new(DiscoveryCache::default()));
        let err = wf.run(http_input(&server, None)).await.unwrap_err();
        assert_eq!(err.code, DiscoveryErrorCode::NonRetryableFailure);
        assert!(err.message.contains("tool catalog unavailable"));

        let report = wf.get_discovery_result();
        assert_eq!(
            report.error_code,
            Some(DiscoveryErrorCode::NonRetryableFailure)
        );
    }

    #[tokio::test]
    async fn group_discovery_reports_partial_failures_per_entry() {
        let good = mock_mcp_server().await;
        let wf = workflow(McpService::new(), Arc::new(DiscoveryCache::default()));

        let bad = DiscoveryInput {
            transport: TransportKind::Stdio,
            endpoint: None,
            command: None,
            args: Vec::new(),
            headers: HashMap::new(),
            cache_token: None,
            image: None,
            server_id: Some("broken".to_string()),
        };

        let result = wf.run_group(vec![http_input(&good, None), bad]).await;
        assert_eq!(result.status, DiscoveryStatus::Completed);
        assert_eq!(result.servers.len(), 2);
        assert_eq!(result.servers[0].tool_count, Some(3));
        assert_eq!(
            result.servers[1].error_code,
            Some(DiscoveryErrorCode::InvalidInput)
        );
    }
}
