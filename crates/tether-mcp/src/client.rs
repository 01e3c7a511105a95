//! MCP client: the protocol state of one provider connection.
//!
//! Assigns request ids, correlates responses by id, dispatches notifications,
//! enforces per-request timeouts and performs the initialize handshake.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::McpError;
use crate::jsonrpc::{Incoming, JsonRpcNotification, JsonRpcRequest, classify};
use crate::transport::{DefaultTransportFactory, Transport, TransportEvent, TransportFactory};

/// MCP protocol version we support.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const INITIALIZED: &str = "notifications/initialized";
const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";

/// Events published by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The provider announced it finished initializing.
    Initialized,
    ToolsListChanged,
    ResourcesListChanged,
    /// Any other provider notification.
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// The transport went away underneath the client. Not published for a
    /// caller-initiated [`McpClient::disconnect`].
    Disconnected { reason: String },
}

/// Information about a tool exposed by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema", rename = "inputSchema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// Identity this client advertises during the handshake.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Parameters of the `initialize` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: ClientInfo,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: ClientInfo {
                name: "tether".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// What the provider reported back from `initialize`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Deserialization helper for `tools/list`.
#[derive(Deserialize)]
struct ToolsListResult {
    tools: Vec<ToolInfo>,
    #[serde(default, rename = "nextCursor")]
    next_cursor: Option<String>,
}

/// A request waiting for its response.
struct PendingRequest {
    method: String,
    responder: oneshot::Sender<Result<Value, McpError>>,
}

/// A live transport plus the task reading from it.
struct Link {
    transport: Arc<dyn Transport>,
    dispatcher: JoinHandle<()>,
}

/// State shared between the client handle and its dispatcher task.
struct Shared {
    name: String,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    link: Mutex<Option<Link>>,
    connected: AtomicBool,
    initialized: AtomicBool,
    events: broadcast::Sender<ClientEvent>,
}

/// Client for a single provider.
pub struct McpClient {
    config: ServerConfig,
    factory: Arc<dyn TransportFactory>,
    shared: Arc<Shared>,
    server_info: Mutex<Option<InitializeResult>>,
    /// Stops every dispatcher this client started once the client is dropped.
    dropped: CancellationToken,
}

impl McpClient {
    /// A client that reaches the provider over stdio or http.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_factory(config, Arc::new(DefaultTransportFactory))
    }

    /// A client whose transport is opened by `factory`.
    pub fn with_factory(config: ServerConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                name: config.name.clone(),
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                link: Mutex::new(None),
                connected: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                events,
            }),
            config,
            factory,
            server_info: Mutex::new(None),
            dropped: CancellationToken::new(),
        }
    }

    /// Get the provider name.
    pub fn server_name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
    }

    /// Subscribe to notifications and disconnects.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Number of requests still waiting for a response.
    pub async fn pending_count(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    /// What the provider reported during the handshake.
    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.lock().await.clone()
    }

    /// Open the transport and start dispatching incoming messages.
    pub async fn connect(&self) -> Result<(), McpError> {
        let mut link = self.shared.link.lock().await;
        if link.is_some() {
            return Err(McpError::AlreadyConnected {
                name: self.shared.name.clone(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let transport: Arc<dyn Transport> = Arc::from(self.factory.open(&self.config, tx).await?);
        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&self.shared),
            rx,
            self.dropped.child_token(),
        ));
        *link = Some(Link {
            transport,
            dispatcher,
        });
        self.shared.connected.store(true, Ordering::SeqCst);

        tracing::debug!("MCP server '{}' connected", self.shared.name);
        Ok(())
    }

    /// Run the handshake: `initialize`, then the initialized notification.
    pub async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult, McpError> {
        let result = self
            .send_request("initialize", Some(serde_json::to_value(&params)?))
            .await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("Failed to parse initialize result: {e}")))?;

        self.notify(INITIALIZED, None).await?;
        self.shared.initialized.store(true, Ordering::SeqCst);

        tracing::info!(
            "MCP server '{}' initialized (protocol {})",
            self.shared.name,
            init.protocol_version
        );
        *self.server_info.lock().await = Some(init.clone());
        Ok(init)
    }

    /// Send a request using the configured per-request timeout.
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.send_request_with_timeout(method, params, self.config.timeout_ms)
            .await
    }

    /// Send a request and wait up to `timeout_ms` for the matching response.
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout_ms: u64,
    ) -> Result<Value, McpError> {
        let transport = self.transport().await?;

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let serialized = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                responder: tx,
            },
        );

        // The deadline covers the send too: an HTTP send is the whole round trip.
        let exchange = async {
            match transport.send(serialized).await {
                Ok(()) => rx.await.unwrap_or_else(|_| {
                    Err(McpError::Disconnected {
                        name: self.shared.name.clone(),
                        method: method.to_string(),
                    })
                }),
                Err(e) => Err(e),
            }
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), exchange).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                self.shared.pending.lock().await.remove(&id);
                Err(e)
            }
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                Err(McpError::Timeout {
                    name: self.shared.name.clone(),
                    method: method.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Send a notification (fire-and-forget, no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let transport = self.transport().await?;
        let serialized = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        let timeout_ms = self.config.timeout_ms;
        tokio::time::timeout(Duration::from_millis(timeout_ms), transport.send(serialized))
            .await
            .unwrap_or_else(|_| {
                Err(McpError::Timeout {
                    name: self.shared.name.clone(),
                    method: method.to_string(),
                    timeout_ms,
                })
            })
    }

    /// Reject every pending request, close the transport and return to the
    /// not-connected state. Calling this on a disconnected client is a no-op.
    pub async fn disconnect(&self) {
        let link = self.shared.link.lock().await.take();
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.initialized.store(false, Ordering::SeqCst);

        let Some(link) = link else {
            return;
        };
        link.dispatcher.abort();
        let rejected = self.shared.reject_pending().await;
        link.transport.close().await;

        tracing::debug!(
            "MCP server '{}' disconnected ({} pending requests rejected)",
            self.shared.name,
            rejected
        );
    }

    pub async fn ping(&self) -> Result<(), McpError> {
        self.send_request("ping", None).await.map(|_| ())
    }

    /// Fetch every tool the provider exposes, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, McpError> {
        self.ensure_initialized()?;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.send_request("tools/list", params).await?;
            let page: ToolsListResult = serde_json::from_value(result).map_err(|e| {
                McpError::Protocol(format!("Failed to parse tools/list response: {e}"))
            })?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    /// Call a tool on this provider. The raw `tools/call` result is returned.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<Value, McpError> {
        self.ensure_initialized()?;
        let params = json!({
            "name": tool_name,
            "arguments": arguments,
        });
        self.send_request("tools/call", Some(params)).await
    }

    pub async fn list_resources(&self) -> Result<Value, McpError> {
        self.ensure_initialized()?;
        self.send_request("resources/list", None).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Value, McpError> {
        self.ensure_initialized()?;
        self.send_request("resources/read", Some(json!({ "uri": uri })))
            .await
    }

    pub async fn list_prompts(&self) -> Result<Value, McpError> {
        self.ensure_initialized()?;
        self.send_request("prompts/list", None).await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<Value, McpError> {
        self.ensure_initialized()?;
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        self.send_request("prompts/get", Some(params)).await
    }

    fn ensure_initialized(&self) -> Result<(), McpError> {
        if !self.is_connected() {
            return Err(McpError::NotConnected {
                name: self.shared.name.clone(),
            });
        }
        if !self.is_initialized() {
            return Err(McpError::NotInitialized {
                name: self.shared.name.clone(),
            });
        }
        Ok(())
    }

    async fn transport(&self) -> Result<Arc<dyn Transport>, McpError> {
        let not_connected = || McpError::NotConnected {
            name: self.shared.name.clone(),
        };
        if !self.is_connected() {
            return Err(not_connected());
        }
        self.shared
            .link
            .lock()
            .await
            .as_ref()
            .map(|link| Arc::clone(&link.transport))
            .ok_or_else(not_connected)
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        // The dispatcher holds the shared state, and with it the transport.
        self.dropped.cancel();
    }
}

impl Shared {
    /// Fail every pending request with `Disconnected`. Returns how many.
    async fn reject_pending(&self) -> usize {
        let drained: Vec<PendingRequest> = self
            .pending
            .lock()
            .await
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.responder.send(Err(McpError::Disconnected {
                name: self.name.clone(),
                method: pending.method,
            }));
        }
        count
    }

    async fn handle_message(&self, raw: &str) {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Dropping unparsable message from '{}': {e}", self.name);
                return;
            }
        };

        match classify(&value) {
            Incoming::Response { id: Some(id), outcome } => {
                let pending = self.pending.lock().await.remove(&id);
                match pending {
                    Some(pending) => {
                        let result = outcome.map_err(|err| McpError::JsonRpc {
                            server: self.name.clone(),
                            code: err.code,
                            message: err.message,
                        });
                        let _ = pending.responder.send(result);
                    }
                    None => tracing::warn!(
                        "Dropping response for unknown request id {} from '{}'",
                        id,
                        self.name
                    ),
                }
            }
            Incoming::Response { id: None, .. } => {
                tracing::warn!("Dropping response with foreign id from '{}'", self.name);
            }
            Incoming::Notification { method, params } => self.handle_notification(method, params),
            Incoming::Ignored => {
                tracing::debug!("Ignoring message from '{}': {}", self.name, raw);
            }
        }
    }

    fn handle_notification(&self, method: String, params: Option<Value>) {
        let event = match method.as_str() {
            "initialized" | INITIALIZED => ClientEvent::Initialized,
            TOOLS_LIST_CHANGED => ClientEvent::ToolsListChanged,
            RESOURCES_LIST_CHANGED => ClientEvent::ResourcesListChanged,
            _ => ClientEvent::Notification { method, params },
        };
        tracing::debug!("Notification from '{}': {:?}", self.name, event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn on_transport_closed(&self, reason: String) {
        let link = self.link.lock().await.take();
        let Some(link) = link else {
            return;
        };
        self.connected.store(false, Ordering::SeqCst);
        self.initialized.store(false, Ordering::SeqCst);
        let rejected = self.reject_pending().await;
        link.transport.close().await;

        tracing::warn!(
            "MCP server '{}' disconnected: {} ({} pending requests rejected)",
            self.name,
            reason,
            rejected
        );
        let _ = self.events.send(ClientEvent::Disconnected { reason });
    }
}

/// Reads transport events until the transport closes or the client is dropped.
async fn dispatch(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    dropped: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = dropped.cancelled() => return,
            event = rx.recv() => event,
        };
        match event {
            Some(TransportEvent::Message(raw)) => shared.handle_message(&raw).await,
            Some(TransportEvent::Closed { reason }) => {
                shared.on_transport_closed(reason).await;
                return;
            }
            None => {
                shared
                    .on_transport_closed("transport dropped".to_string())
                    .await;
                return;
            }
        }
    }
}
