//! In-process providers.
//!
//! An [`InProcessProvider`] answers requests from a Rust closure instead of a
//! child process or HTTP endpoint. It goes through the same client code path
//! as a real provider (serialization, id correlation, notifications), which
//! makes it suitable for embedding local tools in a pool and for scripting
//! provider behaviour in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde_json::{Value, json};

use crate::client::PROTOCOL_VERSION;
use crate::config::ServerConfig;
use crate::error::McpError;
use crate::jsonrpc::{Incoming, JsonRpcError, JsonRpcNotification, JsonRpcResponse, classify};
use crate::transport::{
    EventSender, Transport, TransportEvent, TransportFactory, TransportFuture,
};

/// How an in-process provider answers one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Result(Value),
    Error(JsonRpcError),
    /// Never answer.
    Silent,
    /// Answer after a delay.
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    pub fn delayed(delay: Duration, reply: Reply) -> Self {
        Reply::Delayed(delay, Box::new(reply))
    }

    /// Collapse nested delays into one total delay and a final answer.
    fn flatten(self) -> (Duration, Reply) {
        match self {
            Reply::Delayed(delay, inner) => {
                let (rest, reply) = inner.flatten();
                (delay + rest, reply)
            }
            other => (Duration::ZERO, other),
        }
    }
}

type Handler = dyn Fn(&str, Option<&Value>) -> Reply + Send + Sync;

struct ProviderState {
    name: String,
    handler: Box<Handler>,
    tools: Arc<RwLock<Vec<Value>>>,
    link: Mutex<Option<EventSender>>,
    received: Mutex<Vec<(String, Option<Value>)>>,
    refuse: AtomicBool,
    connections: AtomicUsize,
}

/// A provider implemented by a closure.
#[derive(Clone)]
pub struct InProcessProvider {
    state: Arc<ProviderState>,
}

impl InProcessProvider {
    /// A provider whose every request is answered by `handler(method, params)`.
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&str, Option<&Value>) -> Reply + Send + Sync + 'static,
    {
        Self::build(name.into(), Arc::new(RwLock::new(Vec::new())), Box::new(handler))
    }

    /// A provider that handles the handshake, `ping` and `tools/list` itself
    /// and routes `tools/call` to `call(tool_name, arguments)`.
    pub fn with_tools<F>(name: impl Into<String>, tools: Vec<Value>, call: F) -> Self
    where
        F: Fn(&str, &Value) -> Reply + Send + Sync + 'static,
    {
        let name = name.into();
        let tools = Arc::new(RwLock::new(tools));
        let listed = Arc::clone(&tools);
        let server_name = name.clone();
        let handler = move |method: &str, params: Option<&Value>| match method {
            "initialize" => Reply::Result(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": server_name, "version": "0.0.0"},
            })),
            "ping" => Reply::Result(json!({})),
            "tools/list" => {
                let tools = listed.read().unwrap_or_else(PoisonError::into_inner).clone();
                Reply::Result(json!({ "tools": tools }))
            }
            "tools/call" => {
                let tool = params
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let empty = json!({});
                let args = params.and_then(|p| p.get("arguments")).unwrap_or(&empty);
                call(tool, args)
            }
            other => Reply::Error(JsonRpcError::method_not_found(other)),
        };
        Self::build(name, tools, Box::new(handler))
    }

    fn build(name: String, tools: Arc<RwLock<Vec<Value>>>, handler: Box<Handler>) -> Self {
        Self {
            state: Arc::new(ProviderState {
                name,
                handler,
                tools,
                link: Mutex::new(None),
                received: Mutex::new(Vec::new()),
                refuse: AtomicBool::new(false),
                connections: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Replace the advertised tool list (only meaningful for
    /// [`with_tools`](Self::with_tools) providers).
    pub fn set_tools(&self, tools: Vec<Value>) {
        *self.state.tools.write().unwrap_or_else(PoisonError::into_inner) = tools;
    }

    /// Push a notification to the connected client. Returns `false` when no
    /// client is attached.
    pub fn notify(&self, method: &str, params: Option<Value>) -> bool {
        let Ok(message) = serde_json::to_string(&JsonRpcNotification::new(method, params)) else {
            return false;
        };
        self.with_link(|link| link.send(TransportEvent::Message(message)).is_ok())
    }

    /// Simulate the provider going away underneath the client.
    pub fn crash(&self) -> bool {
        let link = self.state.link.lock().unwrap_or_else(PoisonError::into_inner).take();
        link.is_some_and(|link| {
            link.send(TransportEvent::Closed {
                reason: "provider crashed".into(),
            })
            .is_ok()
        })
    }

    /// While set, new connection attempts fail.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of transports opened to this provider so far.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Methods received so far, requests and notifications, in order.
    pub fn received_methods(&self) -> Vec<String> {
        self.received().into_iter().map(|(method, _)| method).collect()
    }

    /// How many times `method` was received.
    pub fn calls(&self, method: &str) -> usize {
        self.received().iter().filter(|(m, _)| m == method).count()
    }

    /// Params of the most recent `method` message.
    pub fn last_params(&self, method: &str) -> Option<Value> {
        self.received()
            .into_iter()
            .rev()
            .find(|(m, _)| m == method)
            .and_then(|(_, params)| params)
    }

    fn received(&self) -> Vec<(String, Option<Value>)> {
        self.state.received.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn with_link(&self, f: impl FnOnce(&EventSender) -> bool) -> bool {
        let link = self.state.link.lock().unwrap_or_else(PoisonError::into_inner);
        link.as_ref().is_some_and(f)
    }

    fn attach(&self, events: EventSender) -> Result<InProcessTransport, McpError> {
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(McpError::Transport {
                name: self.state.name.clone(),
                message: "connection refused".into(),
            });
        }
        *self.state.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(events.clone());
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        Ok(InProcessTransport {
            state: Arc::clone(&self.state),
            events,
            open: AtomicBool::new(true),
        })
    }
}

/// Client-side end of an in-process provider.
pub struct InProcessTransport {
    state: Arc<ProviderState>,
    events: EventSender,
    open: AtomicBool,
}

impl InProcessTransport {
    fn deliver(&self, message: String) -> Result<(), McpError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(McpError::Transport {
                name: self.state.name.clone(),
                message: "transport closed".into(),
            });
        }

        let value: Value = serde_json::from_str(&message)?;
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = value.get("params").cloned();
        self.state
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((method.clone(), params.clone()));

        // Only requests get answers
        let Some(id) = value.get("id").cloned() else {
            return Ok(());
        };
        if classify(&value) != Incoming::Ignored {
            return Ok(());
        }

        let (delay, reply) = (self.state.handler)(&method, params.as_ref()).flatten();
        let response = match reply {
            Reply::Result(result) => JsonRpcResponse::success(id, result),
            Reply::Error(error) => JsonRpcResponse::failure(id, error),
            Reply::Silent | Reply::Delayed(..) => return Ok(()),
        };
        let line = serde_json::to_string(&response)?;

        if delay.is_zero() {
            let _ = self.events.send(TransportEvent::Message(line));
        } else {
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(TransportEvent::Message(line));
            });
        }
        Ok(())
    }
}

impl Transport for InProcessTransport {
    fn send(&self, message: String) -> TransportFuture<'_, Result<(), McpError>> {
        Box::pin(async move { self.deliver(message) })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.open.store(false, Ordering::SeqCst);
        })
    }
}

/// Opens transports to in-process providers by connection name.
#[derive(Clone, Default)]
pub struct InProcessFactory {
    providers: HashMap<String, InProcessProvider>,
}

impl InProcessFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve connections named after `provider`.
    pub fn register(&mut self, provider: InProcessProvider) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn with(mut self, provider: InProcessProvider) -> Self {
        self.register(provider);
        self
    }
}

impl TransportFactory for InProcessFactory {
    fn open<'a>(
        &'a self,
        config: &'a ServerConfig,
        events: EventSender,
    ) -> TransportFuture<'a, Result<Box<dyn Transport>, McpError>> {
        Box::pin(async move {
            let provider =
                self.providers
                    .get(&config.name)
                    .ok_or_else(|| McpError::Transport {
                        name: config.name.clone(),
                        message: "no in-process provider registered".into(),
                    })?;
            let transport: Box<dyn Transport> = Box::new(provider.attach(events)?);
            Ok(transport)
        })
    }
}
