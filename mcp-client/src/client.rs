use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::SinkExt;
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::debug;
use tracing::warn;

use mcp_types::CallToolRequest;
use mcp_types::CallToolRequestParams;
use mcp_types::CallToolResult;
use mcp_types::ClientCapabilities;
use mcp_types::Implementation;
use mcp_types::InitializeRequest;
use mcp_types::InitializeRequestParams;
use mcp_types::InitializeResult;
use mcp_types::InitializedNotification;
use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCErrorError;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCRequest;
use mcp_types::ListToolsRequest;
use mcp_types::ListToolsResult;
use mcp_types::MCP_SCHEMA_VERSION;
use mcp_types::ModelContextProtocolNotification;
use mcp_types::ModelContextProtocolRequest;
use mcp_types::RequestId;

use crate::McpServerConfig;
use crate::TransportKind;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum McpClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request `{method}` timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("server returned an error: {} (code {})", .0.message, .0.code)]
    Rpc(JSONRPCErrorError),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

type PendingMap =
    Arc<Mutex<HashMap<RequestId, oneshot::Sender<Result<Value, JSONRPCErrorError>>>>>;

/// Duplex state shared by the stdio and WebSocket transports: outgoing
/// frames go through a channel, responses are matched to callers by id.
struct ChannelTransport {
    outgoing_tx: mpsc::Sender<JSONRPCMessage>,
    pending: PendingMap,
    tasks: Vec<JoinHandle<()>>,
    child: Mutex<Option<Child>>,
}

/// Request-per-call state shared by the streamable HTTP and SSE
/// transports.
struct HttpTransport {
    http: reqwest::Client,
    endpoint: String,
    headers: HashMap<String, String>,
    sse: bool,
}

enum Transport {
    Channel(ChannelTransport),
    Http(HttpTransport),
}

/// MCP client over one server connection. Construct with
/// [`McpClient::connect`]; the handshake (`initialize` +
/// `notifications/initialized`) has already completed once it returns.
pub struct McpClient {
    transport: Transport,
    next_id: AtomicI64,
    server_id: String,
}

impl McpClient {
    /// Open a connection for `config` and run the MCP handshake. On any
    /// failure the half-open connection is torn down before the error
    /// propagates.
    pub async fn connect(config: &McpServerConfig) -> Result<Self, McpClientError> {
        let client = Self::open(config).await?;
        match timeout(HANDSHAKE_TIMEOUT, client.handshake()).await {
            Ok(Ok(_)) => Ok(client),
            Ok(Err(err)) => {
                client.close().await;
                Err(err)
            }
            Err(_) => {
                client.close().await;
                Err(McpClientError::Timeout {
                    method: InitializeRequest::METHOD.to_string(),
                    timeout: HANDSHAKE_TIMEOUT,
                })
            }
        }
    }

    async fn open(config: &McpServerConfig) -> Result<Self, McpClientError> {
        let transport = match config.transport {
            TransportKind::Stdio => {
                let command = config.command.clone().ok_or_else(|| {
                    McpClientError::Config("stdio transport requires `command`".to_string())
                })?;
                Transport::Channel(
                    spawn_stdio(&command, &config.args, config.env.as_ref()).await?,
                )
            }
            TransportKind::Websocket => {
                let endpoint = config.endpoint.clone().ok_or_else(|| {
                    McpClientError::Config("websocket transport requires `endpoint`".to_string())
                })?;
                Transport::Channel(connect_websocket(&endpoint, &config.headers).await?)
            }
            TransportKind::Http | TransportKind::Sse => {
                let endpoint = config.endpoint.clone().ok_or_else(|| {
                    McpClientError::Config(format!(
                        "{} transport requires `endpoint`",
                        config.transport
                    ))
                })?;
                Transport::Http(HttpTransport {
                    http: reqwest::Client::new(),
                    endpoint,
                    headers: config.headers.clone(),
                    sse: config.transport == TransportKind::Sse,
                })
            }
        };

        Ok(Self {
            transport,
            next_id: AtomicI64::new(1),
            server_id: config.server_id.clone(),
        })
    }

    async fn handshake(&self) -> Result<InitializeResult, McpClientError> {
        let params = InitializeRequestParams {
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "shipsec-runtime".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            protocol_version: MCP_SCHEMA_VERSION.to_string(),
        };
        let result = self
            .request(
                InitializeRequest::METHOD,
                Some(serde_json::to_value(params)?),
                HANDSHAKE_TIMEOUT,
            )
            .await?;
        let initialized: InitializeResult = serde_json::from_value(result)?;
        self.notify(InitializedNotification::METHOD, None).await?;
        debug!(
            server = %self.server_id,
            server_info = %initialized.server_info.name,
            "mcp handshake complete"
        );
        Ok(initialized)
    }

    pub async fn list_tools(
        &self,
        request_timeout: Duration,
    ) -> Result<ListToolsResult, McpClientError> {
        let result = self
            .request(ListToolsRequest::METHOD, None, request_timeout)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn call_tool(
        &self,
        name: String,
        arguments: Option<Value>,
        request_timeout: Duration,
    ) -> Result<CallToolResult, McpClientError> {
        let params = CallToolRequestParams { name, arguments };
        let result = self
            .request(
                CallToolRequest::METHOD,
                Some(serde_json::to_value(params)?),
                request_timeout,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        request_timeout: Duration,
    ) -> Result<Value, McpClientError> {
        let id = RequestId::Integer(self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = JSONRPCRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.clone(),
            method: method.to_string(),
            params,
        };

        match &self.transport {
            Transport::Channel(channel) => {
                let (tx, rx) = oneshot::channel();
                channel.pending.lock().await.insert(id.clone(), tx);

                if channel
                    .outgoing_tx
                    .send(JSONRPCMessage::Request(request))
                    .await
                    .is_err()
                {
                    channel.pending.lock().await.remove(&id);
                    return Err(McpClientError::Transport(
                        "connection closed while sending".to_string(),
                    ));
                }

                match timeout(request_timeout, rx).await {
                    Ok(Ok(Ok(result))) => Ok(result),
                    Ok(Ok(Err(rpc_err))) => Err(McpClientError::Rpc(rpc_err)),
                    Ok(Err(_)) => Err(McpClientError::Transport(
                        "connection closed before response".to_string(),
                    )),
                    Err(_) => {
                        channel.pending.lock().await.remove(&id);
                        Err(McpClientError::Timeout {
                            method: method.to_string(),
                            timeout: request_timeout,
                        })
                    }
                }
            }
            Transport::Http(http) => {
                match timeout(request_timeout, http_round_trip(http, &request)).await {
                    Ok(result) => result,
                    Err(_) => Err(McpClientError::Timeout {
                        method: method.to_string(),
                        timeout: request_timeout,
                    }),
                }
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpClientError> {
        let notification = JSONRPCNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        };
        match &self.transport {
            Transport::Channel(channel) => channel
                .outgoing_tx
                .send(JSONRPCMessage::Notification(notification))
                .await
                .map_err(|_| {
                    McpClientError::Transport("connection closed while notifying".to_string())
                }),
            Transport::Http(http) => {
                let mut builder = http.http.post(&http.endpoint).json(&notification);
                for (key, value) in &http.headers {
                    builder = builder.header(key, value);
                }
                builder.send().await?.error_for_status()?;
                Ok(())
            }
        }
    }

    /// Tear the connection down: abort I/O tasks, kill a stdio child,
    /// drop pending callers.
    pub async fn close(&self) {
        if let Transport::Channel(channel) = &self.transport {
            for task in &channel.tasks {
                task.abort();
            }
            if let Some(mut child) = channel.child.lock().await.take() {
                if let Err(err) = child.start_kill() {
                    warn!(server = %self.server_id, "failed to kill mcp server process: {err}");
                }
            }
            channel.pending.lock().await.clear();
        }
    }
}

/// Route one incoming message to the caller waiting on its id.
async fn dispatch_incoming(pending: &PendingMap, message: JSONRPCMessage) {
    match message {
        JSONRPCMessage::Response(response) => {
            if let Some(tx) = pending.lock().await.remove(&response.id) {
                let _ = tx.send(Ok(response.result));
            } else {
                warn!("response for unknown request id {:?}", response.id);
            }
        }
        JSONRPCMessage::Error(error) => {
            if let Some(tx) = pending.lock().await.remove(&error.id) {
                let _ = tx.send(Err(error.error));
            } else {
                warn!("error for unknown request id {:?}", error.id);
            }
        }
        // Server-initiated requests and notifications are not part of the
        // runtime's client role.
        JSONRPCMessage::Request(request) => {
            debug!("ignoring server-initiated request `{}`", request.method);
        }
        JSONRPCMessage::Notification(notification) => {
            debug!("ignoring server notification `{}`", notification.method);
        }
    }
}

async fn spawn_stdio(
    command: &str,
    args: &[String],
    env: Option<&HashMap<String, String>>,
) -> Result<ChannelTransport, McpClientError> {
    let mut cmd = Command::new(command);
    cmd.args(args);
    if let Some(env) = env {
        cmd.envs(env);
    }
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::null());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let stdin = child.stdin.take().ok_or_else(|| {
        McpClientError::Transport("child stdin unexpectedly unavailable".to_string())
    })?;
    let stdout = child.stdout.take().ok_or_else(|| {
        McpClientError::Transport("child stdout unexpectedly unavailable".to_string())
    })?;

    let pending: PendingMap = Arc::default();
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JSONRPCMessage>(128);

    // Writer: serialize outgoing frames as newline-delimited JSON.
    let writer_handle = tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(message) = outgoing_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    warn!("failed to serialize outgoing message: {err}");
                    continue;
                }
            };
            if stdin.write_all(json.as_bytes()).await.is_err()
                || stdin.write_all(b"\n").await.is_err()
                || stdin.flush().await.is_err()
            {
                break;
            }
        }
    });

    // Reader: one JSON-RPC message per line.
    let reader_pending = pending.clone();
    let reader_handle = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match serde_json::from_str::<JSONRPCMessage>(&line) {
                Ok(message) => dispatch_incoming(&reader_pending, message).await,
                Err(err) => warn!("failed to deserialize incoming message: {err}"),
            }
        }
        debug!("stdio reader finished (EOF)");
    });

    Ok(ChannelTransport {
        outgoing_tx,
        pending,
        tasks: vec![writer_handle, reader_handle],
        child: Mutex::new(Some(child)),
    })
}

async fn connect_websocket(
    endpoint: &str,
    headers: &HashMap<String, String>,
) -> Result<ChannelTransport, McpClientError> {
    let mut request = endpoint
        .into_client_request()
        .map_err(|err| McpClientError::Transport(err.to_string()))?;
    for (key, value) in headers {
        let name = key
            .parse::<tokio_tungstenite::tungstenite::http::HeaderName>()
            .map_err(|err| McpClientError::Transport(format!("bad header `{key}`: {err}")))?;
        let value = value
            .parse::<tokio_tungstenite::tungstenite::http::HeaderValue>()
            .map_err(|_| McpClientError::Transport(format!("bad value for header `{key}`")))?;
        request.headers_mut().insert(name, value);
    }

    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|err| McpClientError::Transport(err.to_string()))?;
    let (mut sink, mut source) = stream.split();

    let pending: PendingMap = Arc::default();
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JSONRPCMessage>(128);

    let writer_handle = tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    warn!("failed to serialize outgoing message: {err}");
                    continue;
                }
            };
            if sink.send(Message::text(json)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader_pending = pending.clone();
    let reader_handle = tokio::spawn(async move {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<JSONRPCMessage>(text.as_str()) {
                        Ok(message) => dispatch_incoming(&reader_pending, message).await,
                        Err(err) => warn!("failed to deserialize incoming message: {err}"),
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        debug!("websocket reader finished");
    });

    Ok(ChannelTransport {
        outgoing_tx,
        pending,
        tasks: vec![writer_handle, reader_handle],
        child: Mutex::new(None),
    })
}

/// POST one request. Streamable-HTTP servers answer with a JSON body; SSE
/// servers answer with an event stream we scan for the matching response.
async fn http_round_trip(
    http: &HttpTransport,
    request: &JSONRPCRequest,
) -> Result<Value, McpClientError> {
    let mut builder = http
        .http
        .post(&http.endpoint)
        .json(request)
        .header("Accept", "application/json, text/event-stream");
    for (key, value) in &http.headers {
        builder = builder.header(key, value);
    }
    let response = builder.send().await?.error_for_status()?;

    let is_event_stream = http.sse
        || response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));

    if is_event_stream {
        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.map_err(|err| McpClientError::Transport(err.to_string()))?;
            let message: JSONRPCMessage = match serde_json::from_str(&event.data) {
                Ok(message) => message,
                Err(_) => continue,
            };
            match message {
                JSONRPCMessage::Response(response) if response.id == request.id => {
                    return Ok(response.result);
                }
                JSONRPCMessage::Error(error) if error.id == request.id => {
                    return Err(McpClientError::Rpc(error.error));
                }
                _ => {}
            }
        }
        Err(McpClientError::Transport(
            "event stream ended before response".to_string(),
        ))
    } else {
        let message: JSONRPCMessage = response.json().await?;
        match message {
            JSONRPCMessage::Response(response) if response.id == request.id => Ok(response.result),
            JSONRPCMessage::Error(error) if error.id == request.id => {
                Err(McpClientError::Rpc(error.error))
            }
            other => Err(McpClientError::Transport(format!(
                "unexpected response message: {other:?}"
            ))),
        }
    }
}
