//! Wiring for the `shipsec` binary: constructs the process-wide services
//! (component registry, MCP pool, terminal hub, ingestors) in one place
//! and drives the selected subcommand.

mod cli;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use anyhow::anyhow;
use axum::Json;
use axum::extract::Query;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
pub use cli::Cli;
pub use cli::Command;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use mcp_types::CallToolResult;
use mcp_types::ContentBlock;
use shipsec_core::activity::ActivityEnvironment;
use shipsec_core::activity::ActivityRequest;
use shipsec_core::activity::NodeIoSink;
use shipsec_core::activity::run_node_activity;
use shipsec_core::builtins::default_components;
use shipsec_core::config::RuntimeConfig;
use shipsec_core::context::ExecutionContext;
use shipsec_core::error::ShipsecErr;
use shipsec_core::registry::ComponentRegistry;
use shipsec_core::terminal::TerminalHub;
use shipsec_discovery::DiscoveryCache;
use shipsec_discovery::DiscoveryInput;
use shipsec_discovery::DiscoveryWorkflow;
use shipsec_gateway::GatewayState;
use shipsec_gateway::LocalToolRouter;
use shipsec_gateway::TokenSigner;
use shipsec_gateway::ToolRegistration;
use shipsec_gateway::ToolRegistry;
use shipsec_ingest::AuditError;
use shipsec_ingest::AuditQuery;
use shipsec_ingest::AuditRecord;
use shipsec_ingest::AuditStore;
use shipsec_ingest::ConsumerConfig;
use shipsec_ingest::IngestorKind;
use shipsec_ingest::InMemoryAuditStore;
use shipsec_ingest::InMemoryTelemetryStore;
use shipsec_ingest::LogTopicRecord;
use shipsec_ingest::NodeIoMessage;
use shipsec_ingest::emit_audit;
use shipsec_ingest::spawn_event_ingestor;
use shipsec_ingest::spawn_log_ingestor;
use shipsec_ingest::spawn_node_io_ingestor;
use shipsec_mcp_client::McpService;
use shipsec_protocol::ComponentId;
use shipsec_protocol::NodeIoCompletion;
use shipsec_protocol::NodeIoRecord;
use shipsec_webhook::StartOutcome;
use shipsec_webhook::WebhookState;
use shipsec_webhook::WorkflowStarter;

pub async fn run_main(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Serve { port } => serve(port).await,
        Command::RunComponent {
            component,
            params,
            inputs,
            run_id,
            node_ref,
            organization,
        } => {
            run_component(
                &component,
                &params,
                &inputs,
                &run_id,
                &node_ref,
                &organization,
            )
            .await
        }
        Command::Discover {
            transport,
            endpoint,
            command,
            args,
            headers,
            cache_token,
        } => discover(transport, endpoint, command, args, headers, cache_token).await,
    }
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

/// Starts workflows in-process; duplicate ids collapse, mirroring the
/// orchestrator's behavior in a single-process deployment.
struct InProcessWorkflowStarter {
    seen: std::sync::Mutex<std::collections::HashSet<String>>,
    audit: Arc<dyn AuditStore>,
}

impl InProcessWorkflowStarter {
    fn new(audit: Arc<dyn AuditStore>) -> Self {
        Self {
            seen: std::sync::Mutex::new(std::collections::HashSet::new()),
            audit,
        }
    }
}

impl WorkflowStarter for InProcessWorkflowStarter {
    fn start_workflow<'a>(
        &'a self,
        workflow_id: &'a str,
        args: Value,
    ) -> BoxFuture<'a, Result<StartOutcome, String>> {
        Box::pin(async move {
            let inserted = {
                let mut seen = match self.seen.lock() {
                    Ok(seen) => seen,
                    Err(poisoned) => poisoned.into_inner(),
                };
                seen.insert(workflow_id.to_string())
            };
            if !inserted {
                return Ok(StartOutcome::AlreadyRunning);
            }

            info!(workflow_id, "workflow started");
            emit_audit(
                self.audit.clone(),
                AuditRecord {
                    id: uuid_like_id(),
                    organization_id: "dev".to_string(),
                    resource_type: "workflow".to_string(),
                    resource_id: workflow_id.to_string(),
                    action: "workflow.start".to_string(),
                    actor_id: None,
                    metadata: Some(args),
                    created_at: chrono::Utc::now(),
                },
            );
            Ok(StartOutcome::Started)
        })
    }
}

fn uuid_like_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Executes locally-registered tools by running the component that
/// declares the matching tool-provider name.
struct ComponentToolRouter {
    registry: Arc<ComponentRegistry>,
}

impl LocalToolRouter for ComponentToolRouter {
    fn call_tool<'a>(
        &'a self,
        registration: &'a ToolRegistration,
        arguments: Option<Value>,
    ) -> BoxFuture<'a, Result<CallToolResult, String>> {
        Box::pin(async move {
            let component = self
                .registry
                .iter()
                .find(|component| {
                    component
                        .definition
                        .tool_provider
                        .as_ref()
                        .is_some_and(|tp| tp.tool_name == registration.tool_name)
                })
                .ok_or_else(|| {
                    format!("no component provides tool `{}`", registration.tool_name)
                })?;
            let handler = component
                .handler
                .as_ref()
                .ok_or_else(|| format!("tool `{}` has no handler", registration.tool_name))?;

            let params = match arguments {
                Some(Value::Object(map)) => map,
                None => serde_json::Map::new(),
                Some(other) => return Err(format!("tool arguments must be an object, got {other}")),
            };

            let ctx = ExecutionContext::new(
                &registration.run_id,
                &registration.node_id,
                "tool-call",
            );
            let outputs = handler(params, ctx).await.map_err(|err| err.to_string())?;
            let rendered = serde_json::to_string(&Value::Object(outputs))
                .map_err(|err| format!("output serialization failed: {err}"))?;
            Ok(CallToolResult {
                content: vec![ContentBlock::text(rendered)],
                is_error: None,
                structured_content: None,
            })
        })
    }
}

async fn serve(port: u16) -> anyhow::Result<()> {
    let config = RuntimeConfig::from_env().context("runtime configuration")?;
    let registry = Arc::new(
        ComponentRegistry::build(default_components()?, config.production)
            .context("component catalog")?,
    );

    let mcp = McpService::new();
    let gateway_state = Arc::new(GatewayState {
        signer: TokenSigner::new(config.internal_token.clone().into_bytes()),
        internal_token: config.internal_token.clone(),
        registry: Arc::new(ToolRegistry::default()),
        mcp: mcp.clone(),
        local_router: Arc::new(ComponentToolRouter {
            registry: registry.clone(),
        }),
    });

    let audit: Arc<InMemoryAuditStore> = Arc::new(InMemoryAuditStore::default());
    let webhook_secret = std::env::var("GITHUB_WEBHOOK_SECRET").ok();
    let webhook_state = Arc::new(WebhookState::new(
        webhook_secret,
        config.production,
        "app",
        Arc::new(InProcessWorkflowStarter::new(audit.clone())),
    ));

    let app = shipsec_gateway::router(gateway_state)
        .merge(shipsec_webhook::router(webhook_state))
        .merge(audit_router(audit));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(
        port,
        components = registry.len(),
        instance = config.instance.as_deref().unwrap_or("-"),
        "shipsec runtime listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    mcp.cleanup().await;
    Ok(())
}

fn audit_router(store: Arc<InMemoryAuditStore>) -> axum::Router {
    axum::Router::new()
        .route("/audit-logs", get(list_audit_logs))
        .with_state(store)
}

async fn list_audit_logs(
    State(store): State<Arc<InMemoryAuditStore>>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Response {
    let organization_id = headers
        .get("x-organization-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("dev");
    match store.list(organization_id, &query) {
        Ok(page) => Json(page).into_response(),
        Err(err @ (AuditError::InvalidLimit(_) | AuditError::InvalidCursor)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": err.to_string()})),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// run-component
// ---------------------------------------------------------------------------

struct ChannelNodeIoSink {
    tx: mpsc::Sender<NodeIoMessage>,
}

impl NodeIoSink for ChannelNodeIoSink {
    fn record_start(&self, record: NodeIoRecord) {
        if self.tx.try_send(NodeIoMessage::Start(record)).is_err() {
            warn!("node-io topic full; start record dropped");
        }
    }

    fn record_completion(&self, run_id: &str, node_ref: &str, completion: NodeIoCompletion) {
        let message = NodeIoMessage::Completion {
            run_id: run_id.to_string(),
            node_ref: node_ref.to_string(),
            completion,
        };
        if self.tx.try_send(message).is_err() {
            warn!("node-io topic full; completion record dropped");
        }
    }
}

/// Instance-scoped defaults, overridable with the deployment's
/// `<PREFIX>_KAFKA_GROUP_ID` / `<PREFIX>_KAFKA_CLIENT_ID` variables.
fn consumer_config(kind: IngestorKind, env_prefix: &str, instance: Option<&str>) -> ConsumerConfig {
    let mut config = ConsumerConfig::new(kind, instance);
    if let Ok(group_id) = std::env::var(format!("{env_prefix}_KAFKA_GROUP_ID")) {
        config = config.with_group_id(group_id);
    }
    if let Ok(client_id) = std::env::var(format!("{env_prefix}_KAFKA_CLIENT_ID")) {
        config = config.with_client_id(client_id);
    }
    config
}

fn parse_record(raw: &str, what: &str) -> anyhow::Result<serde_json::Map<String, Value>> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("parsing {what} JSON"))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("{what} must be a JSON object, got {other}")),
    }
}

async fn run_component(
    component: &str,
    params: &str,
    inputs: &str,
    run_id: &str,
    node_ref: &str,
    organization: &str,
) -> anyhow::Result<()> {
    let component_id = ComponentId::parse(component)?;
    let params = parse_record(params, "--params")?;
    let inputs = parse_record(inputs, "--inputs")?;

    let registry = Arc::new(ComponentRegistry::build(default_components()?, false)?);
    let store = Arc::new(InMemoryTelemetryStore::default());
    let hub = Arc::new(TerminalHub::default());
    let instance = std::env::var("SHIPSEC_INSTANCE").ok();

    let (log_tx, log_rx) = mpsc::channel(1024);
    let (event_tx, event_rx) = mpsc::channel(1024);
    let (node_tx, node_rx) = mpsc::channel(64);
    let handles: Vec<JoinHandle<()>> = vec![
        spawn_log_ingestor(
            consumer_config(IngestorKind::Logs, "LOG", instance.as_deref()),
            log_rx,
            store.clone(),
        ),
        spawn_event_ingestor(
            consumer_config(IngestorKind::Events, "EVENT", instance.as_deref()),
            event_rx,
            store.clone(),
        ),
        spawn_node_io_ingestor(
            consumer_config(IngestorKind::NodeIo, "NODE_IO", instance.as_deref()),
            node_rx,
            store.clone(),
        ),
    ];

    let terminal_log_tx = log_tx.clone();
    let terminal_hub = hub.clone();
    let env = ActivityEnvironment {
        registry,
        secrets: Arc::new(shipsec_core::secrets::InMemorySecretStore::default()),
        node_io: Arc::new(ChannelNodeIoSink { tx: node_tx }),
        progress: Some(Arc::new(move |event| {
            let _ = event_tx.try_send(event);
        })),
        logs: Some(Arc::new(move |record| {
            let _ = log_tx.try_send(LogTopicRecord::Log(record));
        })),
        terminal: Some(Arc::new(move |chunk| {
            terminal_hub.publish(chunk.clone());
            terminal_log_tx
                .try_send(LogTopicRecord::Terminal(chunk))
                .map_err(|err| err.to_string())
        })),
    };

    let request = ActivityRequest {
        run_id: run_id.to_string(),
        node_ref: node_ref.to_string(),
        organization_id: organization.to_string(),
        component_id,
        inputs,
        params,
        metadata: HashMap::new(),
    };

    let outcome = run_node_activity(&env, request, CancellationToken::new()).await;

    // Dropping the environment closes the topics so the ingestors drain
    // and exit before we read the store.
    drop(env);
    for handle in handles {
        let _ = handle.await;
    }

    let outputs = outcome?;
    info!(
        terminal_chunks = store.terminal_chunks(run_id, node_ref).len(),
        log_lines = store.logs(run_id).len(),
        progress_events = store.events(run_id).len(),
        "activity finished"
    );
    println!("{}", serde_json::to_string_pretty(&Value::Object(outputs))?);
    Ok(())
}

// ---------------------------------------------------------------------------
// discover
// ---------------------------------------------------------------------------

async fn discover(
    transport: cli::TransportArg,
    endpoint: Option<String>,
    command: Option<String>,
    args: Vec<String>,
    headers: Vec<String>,
    cache_token: Option<String>,
) -> anyhow::Result<()> {
    let mut header_map = HashMap::new();
    for header in headers {
        let (key, value) = header
            .split_once('=')
            .ok_or_else(|| anyhow!("--header must be `key=value`, got `{header}`"))?;
        header_map.insert(key.to_string(), value.to_string());
    }

    let input = DiscoveryInput {
        transport: transport.into(),
        endpoint,
        command,
        args,
        headers: header_map,
        cache_token,
        image: None,
        server_id: None,
    };

    let service = McpService::new();
    let workflow = DiscoveryWorkflow::new(
        "discover-cli",
        service.clone(),
        Arc::new(DiscoveryCache::default()),
    );
    let result = workflow.run(input).await;
    service.cleanup().await;

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            let report = workflow.get_discovery_result();
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Err(anyhow!("discovery failed: {err}"));
        }
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Exit code for the process: 0 success, 1 uncaught error, 124 timeout.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<ShipsecErr>() {
        Some(ShipsecErr::Timeout { .. }) => 124,
        _ => 1,
    }
}
