//! Types for the subset of the Model Context Protocol spoken by the
//! execution runtime: the JSON-RPC 2.0 envelope plus the `initialize`,
//! `tools/list` and `tools/call` exchanges.
//!
//! Every request type implements [`ModelContextProtocolRequest`] so callers
//! can name the method string and its params/result pair in one place.

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_SCHEMA_VERSION: &str = "2025-03-26";

/// JSON-RPC error codes used by the runtime.
pub const INVALID_REQUEST_ERROR_CODE: i64 = -32600;
pub const METHOD_NOT_FOUND_ERROR_CODE: i64 = -32601;
pub const INVALID_PARAMS_ERROR_CODE: i64 = -32602;
pub const INTERNAL_ERROR_CODE: i64 = -32603;

/// Result payload of a JSON-RPC response. MCP results are always objects,
/// but the envelope does not constrain them further.
pub type Result = serde_json::Value;

pub trait ModelContextProtocolRequest {
    const METHOD: &'static str;
    type Params: DeserializeOwned + Serialize + Send + Sync;
    type Result: DeserializeOwned + Serialize + Send + Sync;
}

pub trait ModelContextProtocolNotification {
    const METHOD: &'static str;
    type Params: DeserializeOwned + Serialize + Send + Sync;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Integer(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JSONRPCMessage {
    Request(JSONRPCRequest),
    Notification(JSONRPCNotification),
    Response(JSONRPCResponse),
    Error(JSONRPCError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: Result,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCError {
    pub jsonrpc: String,
    pub id: RequestId,
    pub error: JSONRPCErrorError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCErrorError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// initialize
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum InitializeRequest {}

impl ModelContextProtocolRequest for InitializeRequest {
    const METHOD: &'static str = "initialize";
    type Params = InitializeRequestParams;
    type Result = InitializeResult;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequestParams {
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
    pub protocol_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    pub protocol_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ServerCapabilitiesTools>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilitiesTools {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InitializedNotification {}

impl ModelContextProtocolNotification for InitializedNotification {
    const METHOD: &'static str = "notifications/initialized";
    type Params = Option<serde_json::Value>;
}

// ---------------------------------------------------------------------------
// ping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum PingRequest {}

impl ModelContextProtocolRequest for PingRequest {
    const METHOD: &'static str = "ping";
    type Params = Option<serde_json::Value>;
    type Result = serde_json::Value;
}

// ---------------------------------------------------------------------------
// tools/list
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ListToolsRequest {}

impl ModelContextProtocolRequest for ListToolsRequest {
    const METHOD: &'static str = "tools/list";
    type Params = Option<ListToolsRequestParams>;
    type Result = ListToolsResult;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsRequestParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: ToolInputSchema,
}

/// JSON Schema describing a tool's arguments. Providers send arbitrary
/// schemas; only the object skeleton is modeled and everything else is
/// preserved verbatim in `properties`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInputSchema {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
}

impl Default for ToolInputSchema {
    fn default() -> Self {
        Self {
            r#type: "object".to_string(),
            properties: None,
            required: None,
        }
    }
}

// ---------------------------------------------------------------------------
// tools/call
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum CallToolRequest {}

impl ModelContextProtocolRequest for CallToolRequest {
    const METHOD: &'static str = "tools/call";
    type Params = CallToolRequestParams;
    type Result = CallToolResult;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolRequestParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<serde_json::Value>,
}

/// Tool results are polymorphic: text, binary blobs, or provider-specific
/// shapes the runtime passes through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentBlock {
    Text(TextContent),
    Blob(BlobContent),
    Other(serde_json::Value),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text(TextContent {
            r#type: "text".to_string(),
            text: text.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    #[serde(rename = "type")]
    pub r#type: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobContent {
    #[serde(rename = "type")]
    pub r#type: String,
    pub mime_type: String,
    pub data: String,
}

// ---------------------------------------------------------------------------
// Server-side request dispatch
// ---------------------------------------------------------------------------

/// A parsed client request, ready for dispatch on the server side.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Initialize(InitializeRequestParams),
    Ping,
    ListTools(Option<ListToolsRequestParams>),
    CallTool(CallToolRequestParams),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientRequestParseError {
    pub method: String,
    pub message: String,
}

impl std::fmt::Display for ClientRequestParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid `{}` request: {}", self.method, self.message)
    }
}

impl std::error::Error for ClientRequestParseError {}

impl TryFrom<JSONRPCRequest> for ClientRequest {
    type Error = ClientRequestParseError;

    fn try_from(request: JSONRPCRequest) -> std::result::Result<Self, Self::Error> {
        fn params<T: DeserializeOwned>(
            method: &str,
            params: Option<serde_json::Value>,
        ) -> std::result::Result<T, ClientRequestParseError> {
            serde_json::from_value(params.unwrap_or(serde_json::Value::Null)).map_err(|err| {
                ClientRequestParseError {
                    method: method.to_string(),
                    message: err.to_string(),
                }
            })
        }

        match request.method.as_str() {
            InitializeRequest::METHOD => Ok(ClientRequest::Initialize(params(
                &request.method,
                request.params,
            )?)),
            PingRequest::METHOD => Ok(ClientRequest::Ping),
            ListToolsRequest::METHOD => Ok(ClientRequest::ListTools(params(
                &request.method,
                request.params,
            )?)),
            CallToolRequest::METHOD => Ok(ClientRequest::CallTool(params(
                &request.method,
                request.params,
            )?)),
            other => Err(ClientRequestParseError {
                method: other.to_string(),
                message: "unknown method".to_string(),
            }),
        }
    }
}
