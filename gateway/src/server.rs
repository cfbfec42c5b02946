use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::post;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::info;
use tracing::warn;

use mcp_types::CallToolRequestParams;
use mcp_types::CallToolResult;
use mcp_types::ClientRequest;
use mcp_types::ContentBlock;
use mcp_types::InitializeResult;
use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCError;
use mcp_types::JSONRPCErrorError;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCRequest;
use mcp_types::JSONRPCResponse;
use mcp_types::ListToolsResult;
use mcp_types::METHOD_NOT_FOUND_ERROR_CODE;
use mcp_types::MCP_SCHEMA_VERSION;
use mcp_types::RequestId;
use mcp_types::ServerCapabilities;
use mcp_types::ServerCapabilitiesTools;
use mcp_types::Tool;
use mcp_types::ToolInputSchema;
use shipsec_mcp_client::McpService;

use crate::GatewayError;
use crate::registry::ToolRegistration;
use crate::registry::ToolRegistry;
use crate::token::SessionClaims;
use crate::token::TokenSigner;

/// Separates the external server slug from the tool name in a prefixed
/// tool id, e.g. `probe__dns-lookup`.
const EXTERNAL_TOOL_DELIMITER: &str = "__";

/// Bytes of tool output logged in the per-call trace.
const OUTPUT_PREVIEW_BYTES: usize = 200;

/// Executes locally-registered tools on behalf of a calling agent. The
/// activity layer provides the implementation; the gateway stays
/// transport-only.
pub trait LocalToolRouter: Send + Sync {
    fn call_tool<'a>(
        &'a self,
        registration: &'a ToolRegistration,
        arguments: Option<Value>,
    ) -> BoxFuture<'a, Result<CallToolResult, String>>;
}

pub struct GatewayState {
    pub signer: TokenSigner,
    pub internal_token: String,
    pub registry: Arc<ToolRegistry>,
    pub mcp: Arc<McpService>,
    pub local_router: Arc<dyn LocalToolRouter>,
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/internal/mcp/generate-token", post(generate_token))
        .route("/internal/mcp/register-local", post(register_local))
        .route("/internal/mcp", post(mcp_endpoint))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateTokenRequest {
    run_id: String,
    #[serde(default)]
    organization_id: Option<String>,
    allowed_node_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct GenerateTokenResponse {
    token: String,
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": message}))).into_response()
}

async fn generate_token(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(request): Json<GenerateTokenRequest>,
) -> Response {
    let presented = headers
        .get("x-internal-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented
        .as_bytes()
        .ct_eq(state.internal_token.as_bytes())
        .unwrap_u8()
        != 1
    {
        return unauthorized("invalid internal token");
    }

    match state.signer.issue(
        &request.run_id,
        request.organization_id,
        request.allowed_node_ids,
    ) {
        Ok(token) => Json(GenerateTokenResponse { token }).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

fn bearer_claims(state: &GatewayState, headers: &HeaderMap) -> Result<SessionClaims, GatewayError> {
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::Auth("missing bearer token".to_string()))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| GatewayError::Auth("missing bearer token".to_string()))?;
    state.signer.verify(token)
}

async fn register_local(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(registration): Json<ToolRegistration>,
) -> Response {
    let claims = match bearer_claims(&state, &headers) {
        Ok(claims) => claims,
        Err(err) => return unauthorized(&err.to_string()),
    };
    if claims.run_id != registration.run_id {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "registration run does not match session"})),
        )
            .into_response();
    }

    info!(
        run_id = %registration.run_id,
        node_id = %registration.node_id,
        tool = %registration.tool_name,
        "registered local tool"
    );
    state.registry.register_local(registration);
    Json(json!({"ok": true})).into_response()
}

async fn mcp_endpoint(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(message): Json<JSONRPCMessage>,
) -> Response {
    let claims = match bearer_claims(&state, &headers) {
        Ok(claims) => claims,
        Err(err) => return unauthorized(&err.to_string()),
    };

    match message {
        JSONRPCMessage::Request(request) => {
            let response = handle_request(&state, &claims, request).await;
            Json(response).into_response()
        }
        JSONRPCMessage::Notification(_) => StatusCode::ACCEPTED.into_response(),
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "expected a request or notification"})),
        )
            .into_response(),
    }
}

async fn handle_request(
    state: &GatewayState,
    claims: &SessionClaims,
    request: JSONRPCRequest,
) -> JSONRPCMessage {
    let id = request.id.clone();
    let parsed = match ClientRequest::try_from(request) {
        Ok(parsed) => parsed,
        Err(err) => {
            return error_message(
                id,
                METHOD_NOT_FOUND_ERROR_CODE,
                format!("unsupported method: {err}"),
            );
        }
    };

    let result = match parsed {
        ClientRequest::Initialize(_params) => serde_json::to_value(InitializeResult {
            capabilities: ServerCapabilities {
                tools: Some(ServerCapabilitiesTools {
                    list_changed: Some(false),
                }),
            },
            server_info: mcp_types::Implementation {
                name: "shipsec-gateway".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            protocol_version: MCP_SCHEMA_VERSION.to_string(),
            instructions: None,
        }),
        ClientRequest::Ping => Ok(json!({})),
        ClientRequest::ListTools(_params) => {
            serde_json::to_value(aggregate_tools(state, claims).await)
        }
        ClientRequest::CallTool(params) => {
            serde_json::to_value(dispatch_tool_call(state, claims, params).await)
        }
    };

    match result {
        Ok(result) => JSONRPCMessage::Response(JSONRPCResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        }),
        Err(err) => error_message(
            id,
            mcp_types::INTERNAL_ERROR_CODE,
            format!("serialization failure: {err}"),
        ),
    }
}

fn error_message(id: RequestId, code: i64, message: String) -> JSONRPCMessage {
    JSONRPCMessage::Error(JSONRPCError {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id,
        error: JSONRPCErrorError {
            code,
            message,
            data: None,
        },
    })
}

/// Union of local registrations and external server tools for the
/// caller's scope. External names are prefixed `<serverSlug>__<tool>`;
/// servers that fail to enumerate are skipped, not fatal.
async fn aggregate_tools(state: &GatewayState, claims: &SessionClaims) -> ListToolsResult {
    let mut tools: Vec<Tool> = state
        .registry
        .local_tools(&claims.run_id, &claims.allowed_node_ids)
        .into_iter()
        .map(local_tool_to_mcp)
        .collect();

    for config in state
        .registry
        .external_servers(&claims.run_id, &claims.allowed_node_ids)
    {
        match state.mcp.discover_tools(&config).await {
            Ok(discovered) => {
                for tool in discovered {
                    tools.push(Tool {
                        name: format!(
                            "{}{EXTERNAL_TOOL_DELIMITER}{}",
                            config.server_id, tool.name
                        ),
                        description: tool.description,
                        input_schema: tool
                            .input_schema
                            .and_then(|schema| serde_json::from_value(schema).ok())
                            .unwrap_or_default(),
                    });
                }
            }
            Err(err) => {
                warn!(server = %config.server_id, "external tool discovery failed: {err}");
            }
        }
    }

    ListToolsResult {
        tools,
        next_cursor: None,
    }
}

fn local_tool_to_mcp(registration: ToolRegistration) -> Tool {
    let input_schema: ToolInputSchema =
        serde_json::from_value(registration.input_schema).unwrap_or_default();
    Tool {
        name: registration.tool_name,
        description: registration.description,
        input_schema,
    }
}

fn error_result(message: String) -> CallToolResult {
    CallToolResult {
        content: vec![ContentBlock::text(message)],
        is_error: Some(true),
        structured_content: None,
    }
}

/// Route one `tools/call`: prefixed names forward to the external server
/// through the pooled client, bare names go to the local router. Failures
/// come back as MCP error results so agents can keep going.
async fn dispatch_tool_call(
    state: &GatewayState,
    claims: &SessionClaims,
    params: CallToolRequestParams,
) -> CallToolResult {
    let started = Instant::now();
    let tool_name = params.name.clone();

    let result = route_tool_call(state, claims, params).await;
    let (result, success) = match result {
        Ok(result) => {
            let success = !result.is_error.unwrap_or(false);
            (result, success)
        }
        Err(message) => (error_result(message), false),
    };

    info!(
        tool = %tool_name,
        duration_ms = started.elapsed().as_millis() as u64,
        success,
        preview = %output_preview(&result),
        "mcp tool call"
    );
    result
}

async fn route_tool_call(
    state: &GatewayState,
    claims: &SessionClaims,
    params: CallToolRequestParams,
) -> Result<CallToolResult, String> {
    if let Some((slug, tool)) = params.name.split_once(EXTERNAL_TOOL_DELIMITER) {
        let config = state
            .registry
            .external_servers(&claims.run_id, &claims.allowed_node_ids)
            .into_iter()
            .find(|config| config.server_id == slug);
        if let Some(config) = config {
            return state
                .mcp
                .call_tool(&config, tool.to_string(), params.arguments)
                .await
                .map_err(|err| format!("external tool call failed: {err}"));
        }
        // A double underscore can legitimately appear in a local tool
        // name; fall through to the local lookup.
    }

    let registration = state
        .registry
        .find_local(&claims.run_id, &claims.allowed_node_ids, &params.name)
        .ok_or_else(|| format!("unknown tool `{}` for this session", params.name))?;
    state
        .local_router
        .call_tool(&registration, params.arguments)
        .await
}

fn output_preview(result: &CallToolResult) -> String {
    let text = result.content.iter().find_map(|block| match block {
        ContentBlock::Text(text) => Some(text.text.as_str()),
        _ => None,
    });
    let Some(text) = text else {
        return String::new();
    };
    if text.len() <= OUTPUT_PREVIEW_BYTES {
        return text.to_string();
    }
    let mut end = OUTPUT_PREVIEW_BYTES;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
