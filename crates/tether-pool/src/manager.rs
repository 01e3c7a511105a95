//! Connection manager: orchestrates connections to many providers.
//!
//! Each configured provider gets one bookkeeping entry whose status
//! moves through [`ConnectionStatus`]. Lost connections are retried with
//! exponential backoff by supervised tasks, ready connections are pinged on
//! an interval, and a merged tool registry routes `call_tool` to a provider
//! chosen by the configured strategy.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tether_mcp::{
    ClientEvent, DefaultTransportFactory, InitializeParams, McpClient, McpError, ServerConfig,
    ToolInfo, TransportFactory, TransportKind,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backoff::ReconnectPolicy;
use crate::balance::{Balancer, Candidate, LoadBalanceStrategy};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::events::ManagerEvent;
use crate::registry::ToolRegistry;
use crate::status::ConnectionStatus;

const EVENT_CAPACITY: usize = 128;

/// Point-in-time view of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub name: String,
    pub status: ConnectionStatus,
    pub transport: TransportKind,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub request_count: u64,
    pub error_count: u64,
    pub retry_count: u32,
    pub in_flight: u64,
}

/// Point-in-time view of the whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub ready: usize,
    pub tool_count: usize,
    pub strategy: LoadBalanceStrategy,
    pub connections: Vec<ConnectionSnapshot>,
}

/// Outcome of [`ConnectionManager::initialize`].
#[derive(Debug, Default)]
pub struct InitReport {
    pub connected: Vec<String>,
    pub failed: Vec<(String, PoolError)>,
}

impl InitReport {
    pub fn all_connected(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of one health-check round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: Vec<String>,
    pub failed: Vec<String>,
}

/// A tool result and the connection that produced it.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub connection: String,
    pub result: Value,
}

struct ConnectionInfo {
    config: ServerConfig,
    client: Option<Arc<McpClient>>,
    status: ConnectionStatus,
    connected_at: Option<DateTime<Utc>>,
    last_activity: Option<DateTime<Utc>>,
    request_count: u64,
    error_count: u64,
    retry_count: u32,
    in_flight: u64,
    /// Bumped on every connect attempt; events from older clients are ignored.
    epoch: u64,
    retry: Option<CancellationToken>,
    watcher: Option<JoinHandle<()>>,
}

impl ConnectionInfo {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            client: None,
            status: ConnectionStatus::Disconnected,
            connected_at: None,
            last_activity: None,
            request_count: 0,
            error_count: 0,
            retry_count: 0,
            in_flight: 0,
            epoch: 0,
            retry: None,
            watcher: None,
        }
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            name: self.config.name.clone(),
            status: self.status,
            transport: self.config.transport,
            connected_at: self.connected_at,
            last_activity: self.last_activity,
            request_count: self.request_count,
            error_count: self.error_count,
            retry_count: self.retry_count,
            in_flight: self.in_flight,
        }
    }

    /// Stop background work for this entry and hand back the client so the
    /// caller can disconnect it outside the lock.
    fn detach(&mut self) -> Option<Arc<McpClient>> {
        if let Some(token) = self.retry.take() {
            token.cancel();
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.client.take()
    }
}

/// Look up `name` and check that it still belongs to connect attempt `epoch`.
fn current<'a>(
    connections: &'a mut BTreeMap<String, ConnectionInfo>,
    name: &str,
    epoch: u64,
) -> Result<&'a mut ConnectionInfo, PoolError> {
    let info = connections
        .get_mut(name)
        .ok_or_else(|| PoolError::UnknownConnection {
            name: name.to_string(),
        })?;
    if info.epoch != epoch {
        return Err(PoolError::Superseded {
            name: name.to_string(),
        });
    }
    Ok(info)
}

struct Inner {
    config: PoolConfig,
    factory: Arc<dyn TransportFactory>,
    /// Kept in name order so tie-breaking is deterministic.
    connections: Mutex<BTreeMap<String, ConnectionInfo>>,
    registry: RwLock<ToolRegistry>,
    balancer: Balancer,
    events: broadcast::Sender<ManagerEvent>,
    shutdown: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
    next_epoch: AtomicU64,
}

/// Manages connections to multiple providers.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// A manager that reaches providers over stdio or HTTP.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_transport_factory(config, Arc::new(DefaultTransportFactory))
    }

    pub fn with_transport_factory(config: PoolConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let balancer = Balancer::new(config.load_balance_strategy);
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                connections: Mutex::new(BTreeMap::new()),
                registry: RwLock::new(ToolRegistry::default()),
                balancer,
                events,
                shutdown: CancellationToken::new(),
                health_task: Mutex::new(None),
                next_epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Bring up every configured provider concurrently.
    ///
    /// Providers that fail to start are reported and left in `error`; the
    /// pool continues with whatever came up. Starts health checks and builds
    /// the tool registry afterwards.
    pub async fn initialize(&self) -> InitReport {
        let mut report = InitReport::default();
        let max = self.inner.config.max_connections;

        let names: Vec<String> = {
            let mut connections = self.inner.connections.lock().await;
            let mut names = Vec::new();
            for config in &self.inner.config.servers {
                let name = config.name.clone();
                if connections.contains_key(&name) {
                    report.failed.push((
                        name.clone(),
                        PoolError::DuplicateConnection { name },
                    ));
                    continue;
                }
                if connections.len() >= max {
                    report.failed.push((name, PoolError::PoolFull { max }));
                    continue;
                }
                connections.insert(name.clone(), ConnectionInfo::new(config.clone()));
                self.inner
                    .emit(ManagerEvent::ConnectionAdded { name: name.clone() });
                names.push(name);
            }
            names
        };

        let results = join_all(names.iter().map(|name| self.inner.connect_server(name))).await;
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(()) => report.connected.push(name),
                Err(e) => {
                    tracing::warn!("Failed to start MCP server '{}': {}", name, e);
                    report.failed.push((name, e));
                }
            }
        }

        if let Some(handle) = self.inner.start_health_checks() {
            if let Some(previous) = self.inner.health_task.lock().await.replace(handle) {
                previous.abort();
            }
        }
        self.inner.refresh_registry().await;

        tracing::info!(
            "Connection manager ready: {}/{} MCP servers connected",
            report.connected.len(),
            report.connected.len() + report.failed.len()
        );
        report
    }

    /// Add and connect a provider. On failure the entry is removed again.
    pub async fn add_connection(&self, config: ServerConfig) -> Result<(), PoolError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }
        config.validate().map_err(|source| PoolError::Provider {
            connection: config.name.clone(),
            source,
        })?;

        let name = config.name.clone();
        {
            let mut connections = self.inner.connections.lock().await;
            if connections.contains_key(&name) {
                return Err(PoolError::DuplicateConnection { name });
            }
            let max = self.inner.config.max_connections;
            if connections.len() >= max {
                return Err(PoolError::PoolFull { max });
            }
            connections.insert(name.clone(), ConnectionInfo::new(config));
        }
        self.inner
            .emit(ManagerEvent::ConnectionAdded { name: name.clone() });

        if let Err(e) = self.inner.connect_server(&name).await {
            let removed = self.inner.connections.lock().await.remove(&name);
            if let Some(mut info) = removed {
                if let Some(client) = info.detach() {
                    client.disconnect().await;
                }
                self.inner.emit(ManagerEvent::ConnectionRemoved { name });
            }
            return Err(e);
        }

        tracing::info!("Added MCP server '{}'", name);
        self.inner.refresh_registry().await;
        Ok(())
    }

    /// Disconnect and forget a provider.
    pub async fn remove_connection(&self, name: &str) -> Result<(), PoolError> {
        let mut info = self
            .inner
            .connections
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| PoolError::UnknownConnection {
                name: name.to_string(),
            })?;

        if let Some(client) = info.detach() {
            client.disconnect().await;
        }
        tracing::info!("Removed MCP server '{}'", name);
        self.inner.emit(ManagerEvent::ConnectionRemoved {
            name: name.to_string(),
        });
        self.inner.refresh_registry().await;
        Ok(())
    }

    /// (Re)connect a provider now, regardless of its current retry state.
    ///
    /// Cancels any scheduled retry and resets the retry budget. A ready
    /// connection is torn down and brought up again.
    pub async fn connect_server(&self, name: &str) -> Result<(), PoolError> {
        {
            let mut connections = self.inner.connections.lock().await;
            let info = connections
                .get_mut(name)
                .ok_or_else(|| PoolError::UnknownConnection {
                    name: name.to_string(),
                })?;
            if let Some(token) = info.retry.take() {
                token.cancel();
            }
            info.retry_count = 0;
            if info.status.is_ready() {
                self.inner.transition(info, ConnectionStatus::Disconnected);
            }
        }
        self.inner.connect_server(name).await?;
        self.inner.refresh_registry().await;
        Ok(())
    }

    /// Pick a ready connection, restricted to providers of `tool` when given.
    ///
    /// `None` means nothing can serve the request right now, including the
    /// case of a tool no connection advertises.
    pub async fn get_available_connection(&self, tool: Option<&str>) -> Option<String> {
        self.inner.select_connection(tool).await
    }

    /// Route a tool call to a provider chosen by the load-balancing strategy.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolCallOutcome, PoolError> {
        self.inner.call_tool(tool, arguments).await
    }

    /// The live client for `name`, if it is connected.
    pub async fn client(&self, name: &str) -> Option<Arc<McpClient>> {
        let connections = self.inner.connections.lock().await;
        connections.get(name).and_then(|info| info.client.clone())
    }

    /// Every tool advertised by at least one ready connection.
    pub async fn tools(&self) -> Vec<ToolInfo> {
        self.inner.registry.read().await.tools()
    }

    pub async fn tool_providers(&self, tool: &str) -> Vec<String> {
        self.inner
            .registry
            .read()
            .await
            .providers(tool)
            .map(<[String]>::to_vec)
            .unwrap_or_default()
    }

    /// Re-list tools from every ready connection. Returns the tool count.
    pub async fn refresh_tool_registry(&self) -> usize {
        self.inner.refresh_registry().await
    }

    /// Ping every ready connection once.
    pub async fn check_health(&self) -> HealthReport {
        self.inner.check_health().await
    }

    pub async fn connection_status(&self, name: &str) -> Option<ConnectionStatus> {
        let connections = self.inner.connections.lock().await;
        connections.get(name).map(|info| info.status)
    }

    pub async fn status(&self) -> PoolStatus {
        let tool_count = self.inner.registry.read().await.len();
        let connections: Vec<ConnectionSnapshot> = self
            .inner
            .connections
            .lock()
            .await
            .values()
            .map(ConnectionInfo::snapshot)
            .collect();
        PoolStatus {
            total: connections.len(),
            ready: connections.iter().filter(|c| c.status.is_ready()).count(),
            tool_count,
            strategy: self.inner.balancer.strategy(),
            connections,
        }
    }

    /// Stop health checks and reconnects, then disconnect every provider.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(handle) = self.inner.health_task.lock().await.take() {
            handle.abort();
        }

        let drained = std::mem::take(&mut *self.inner.connections.lock().await);
        for (name, mut info) in drained {
            if let Some(client) = info.detach() {
                client.disconnect().await;
            }
            tracing::debug!("Disconnected MCP server '{}'", name);
            self.inner.emit(ManagerEvent::ConnectionRemoved { name });
        }

        *self.inner.registry.write().await = ToolRegistry::default();
        self.inner
            .emit(ManagerEvent::RegistryChanged { tool_count: 0 });
        tracing::info!("Connection manager shut down");
    }
}

impl Inner {
    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    /// Apply a status change if the state machine allows it.
    fn transition(&self, info: &mut ConnectionInfo, next: ConnectionStatus) -> bool {
        let from = info.status;
        if from == next {
            return true;
        }
        if !from.can_transition_to(next) {
            tracing::warn!(
                "Ignoring invalid transition for '{}': {} -> {}",
                info.name(),
                from,
                next
            );
            return false;
        }
        info.status = next;
        tracing::debug!("Connection '{}': {} -> {}", info.name(), from, next);
        self.emit(ManagerEvent::StatusChanged {
            name: info.config.name.clone(),
            from,
            to: next,
        });
        true
    }

    async fn advance(&self, name: &str, epoch: u64, next: ConnectionStatus) -> Result<(), PoolError> {
        let mut connections = self.connections.lock().await;
        let info = current(&mut connections, name, epoch)?;
        if self.transition(info, next) {
            Ok(())
        } else {
            Err(PoolError::Busy {
                name: name.to_string(),
                status: info.status,
            })
        }
    }

    async fn connect_server(self: &Arc<Self>, name: &str) -> Result<(), PoolError> {
        if self.shutdown.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }

        let (config, epoch, stale) = {
            let mut connections = self.connections.lock().await;
            let info = connections
                .get_mut(name)
                .ok_or_else(|| PoolError::UnknownConnection {
                    name: name.to_string(),
                })?;
            if !self.transition(info, ConnectionStatus::Connecting) {
                return Err(PoolError::Busy {
                    name: name.to_string(),
                    status: info.status,
                });
            }
            info.epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(watcher) = info.watcher.take() {
                watcher.abort();
            }
            (info.config.clone(), info.epoch, info.client.take())
        };
        if let Some(stale) = stale {
            stale.disconnect().await;
        }

        let client = Arc::new(McpClient::with_factory(config, Arc::clone(&self.factory)));
        let events = client.subscribe();
        let timeout_ms = self.config.connection_timeout_ms;
        let result = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.handshake(name, epoch, &client),
        )
        .await
        .unwrap_or_else(|_| {
            Err(PoolError::ConnectTimeout {
                name: name.to_string(),
                timeout_ms,
            })
        });

        if let Err(e) = result {
            self.record_failure(name, epoch, &e).await;
            client.disconnect().await;
            return Err(e);
        }

        let installed = {
            let mut connections = self.connections.lock().await;
            match current(&mut connections, name, epoch) {
                Ok(info) => {
                    if self.transition(info, ConnectionStatus::Ready) {
                        let now = Utc::now();
                        info.retry_count = 0;
                        info.retry = None;
                        info.connected_at = Some(now);
                        info.last_activity = Some(now);
                        info.client = Some(Arc::clone(&client));
                        info.watcher = Some(self.spawn_watcher(name.to_string(), epoch, events));
                        Ok(())
                    } else {
                        Err(PoolError::Busy {
                            name: name.to_string(),
                            status: info.status,
                        })
                    }
                }
                Err(e) => Err(e),
            }
        };
        if let Err(e) = installed {
            client.disconnect().await;
            return Err(e);
        }

        let server = client
            .server_info()
            .await
            .and_then(|info| info.server_info)
            .map(|s| s.name)
            .unwrap_or_else(|| "unknown".to_string());
        tracing::info!("MCP server '{}' connected ({})", name, server);
        Ok(())
    }

    async fn handshake(&self, name: &str, epoch: u64, client: &McpClient) -> Result<(), PoolError> {
        let provider = |source: McpError| PoolError::Provider {
            connection: name.to_string(),
            source,
        };
        client.connect().await.map_err(provider)?;
        self.advance(name, epoch, ConnectionStatus::Connected).await?;
        self.advance(name, epoch, ConnectionStatus::Initializing)
            .await?;
        client
            .initialize(InitializeParams::default())
            .await
            .map_err(provider)?;
        Ok(())
    }

    async fn record_failure(&self, name: &str, epoch: u64, error: &PoolError) {
        let mut connections = self.connections.lock().await;
        if let Ok(info) = current(&mut connections, name, epoch) {
            info.error_count += 1;
            self.transition(info, ConnectionStatus::Error);
        }
        if !error.is_stale() {
            tracing::warn!("Failed to connect MCP server '{}': {}", name, error);
        }
    }

    /// Follow a client's events for as long as it is the current client.
    fn spawn_watcher(
        self: &Arc<Self>,
        name: String,
        epoch: u64,
        mut events: broadcast::Receiver<ClientEvent>,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Missed {} events from MCP server '{}'", skipped, name);
                        continue;
                    }
                    Err(RecvError::Closed) => return,
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match event {
                    ClientEvent::Disconnected { reason } => {
                        inner.on_disconnect(&name, epoch, &reason).await;
                        return;
                    }
                    ClientEvent::ToolsListChanged => {
                        inner.refresh_registry().await;
                    }
                    ClientEvent::ResourcesListChanged => {
                        inner.emit(ManagerEvent::ResourcesChanged { name: name.clone() });
                    }
                    ClientEvent::Initialized | ClientEvent::Notification { .. } => {}
                }
            }
        })
    }

    async fn on_disconnect(self: &Arc<Self>, name: &str, epoch: u64, reason: &str) {
        let client = {
            let mut connections = self.connections.lock().await;
            let Ok(info) = current(&mut connections, name, epoch) else {
                return;
            };
            // Called from the watcher itself; drop the handle without aborting.
            info.watcher = None;
            if !self.transition(info, ConnectionStatus::Disconnected) {
                return;
            }
            info.client.take()
        };

        tracing::warn!("MCP server '{}' disconnected: {}", name, reason);
        if let Some(client) = client {
            client.disconnect().await;
        }
        self.refresh_registry().await;
        self.schedule_reconnect(name.to_string());
    }

    /// Decide whether and when to retry `name`, updating its bookkeeping.
    async fn plan_reconnect(&self, name: &str) -> Option<(CancellationToken, Duration)> {
        let mut connections = self.connections.lock().await;
        let info = connections.get_mut(name)?;
        if !matches!(
            info.status,
            ConnectionStatus::Disconnected | ConnectionStatus::Error
        ) {
            return None;
        }
        if !info.config.auto_reconnect {
            tracing::info!("Auto-reconnect disabled for MCP server '{}'", name);
            return None;
        }

        let policy = ReconnectPolicy::from_config(&info.config);
        let Some((attempt, delay)) = policy.next_attempt(info.retry_count) else {
            self.transition(info, ConnectionStatus::Error);
            tracing::error!(
                "Giving up on MCP server '{}' after {} reconnect attempts",
                name,
                info.retry_count
            );
            self.emit(ManagerEvent::ReconnectExhausted {
                name: name.to_string(),
                attempts: info.retry_count,
            });
            return None;
        };

        if !self.transition(info, ConnectionStatus::Reconnecting) {
            return None;
        }
        info.retry_count = attempt;
        let token = self.shutdown.child_token();
        if let Some(previous) = info.retry.replace(token.clone()) {
            previous.cancel();
        }

        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            "Reconnecting to MCP server '{}' in {}ms (attempt {}/{})",
            name,
            delay_ms,
            attempt,
            policy.max_retries
        );
        self.emit(ManagerEvent::ReconnectScheduled {
            name: name.to_string(),
            attempt,
            delay_ms,
        });
        Some((token, delay))
    }

    /// Spawn a supervised retry for `name`. Failed attempts schedule the next
    /// one until the retry budget is spent.
    fn schedule_reconnect(self: &Arc<Self>, name: String) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let Some((token, delay)) = inner.plan_reconnect(&name).await else {
                return;
            };
            drop(inner);

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(inner) = weak.upgrade() else {
                return;
            };
            match inner.connect_server(&name).await {
                Ok(()) => {
                    tracing::info!("Reconnected to MCP server '{}'", name);
                    inner.refresh_registry().await;
                }
                Err(e) if e.is_stale() => {
                    tracing::debug!("Abandoning reconnect of '{}': {}", name, e);
                }
                Err(_) => inner.schedule_reconnect(name),
            }
        });
    }

    fn start_health_checks(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let interval_ms = self.config.health_check_interval_ms;
        if interval_ms == 0 {
            return None;
        }
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        Some(tokio::spawn(async move {
            let period = Duration::from_millis(interval_ms);
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.check_health().await;
            }
        }))
    }

    async fn check_health(self: &Arc<Self>) -> HealthReport {
        let targets: Vec<(String, u64, Arc<McpClient>)> = {
            let connections = self.connections.lock().await;
            connections
                .values()
                .filter(|info| info.status.is_ready())
                .filter_map(|info| {
                    let client = info.client.as_ref()?;
                    Some((info.config.name.clone(), info.epoch, Arc::clone(client)))
                })
                .collect()
        };

        let pings = join_all(targets.into_iter().map(|(name, epoch, client)| async move {
            let result = client.ping().await;
            (name, epoch, client, result)
        }))
        .await;

        let mut report = HealthReport::default();
        let mut dropped = Vec::new();
        {
            let mut connections = self.connections.lock().await;
            for (name, epoch, client, result) in pings {
                let Ok(info) = current(&mut connections, &name, epoch) else {
                    continue;
                };
                match result {
                    Ok(()) => {
                        info.last_activity = Some(Utc::now());
                        report.healthy.push(name);
                    }
                    Err(e) => {
                        if !info.status.is_ready() {
                            continue;
                        }
                        tracing::warn!("Health check failed for MCP server '{}': {}", name, e);
                        info.error_count += 1;
                        self.transition(info, ConnectionStatus::Error);
                        if let Some(watcher) = info.watcher.take() {
                            watcher.abort();
                        }
                        info.client = None;
                        dropped.push(client);
                        report.failed.push(name);
                    }
                }
            }
        }

        for client in dropped {
            client.disconnect().await;
        }
        if !report.failed.is_empty() {
            self.refresh_registry().await;
            for name in &report.failed {
                self.schedule_reconnect(name.clone());
            }
        }
        report
    }

    async fn refresh_registry(&self) -> usize {
        let targets: Vec<(String, Arc<McpClient>)> = {
            let connections = self.connections.lock().await;
            connections
                .values()
                .filter(|info| info.status.is_ready())
                .filter_map(|info| {
                    let client = info.client.as_ref()?;
                    Some((info.config.name.clone(), Arc::clone(client)))
                })
                .collect()
        };

        let listed = join_all(targets.into_iter().map(|(name, client)| async move {
            let result = client.list_tools().await;
            (name, result)
        }))
        .await;

        let lists = listed.into_iter().filter_map(|(name, result)| match result {
            Ok(tools) => {
                tracing::debug!("MCP server '{}' offers {} tools", name, tools.len());
                Some((name, tools))
            }
            Err(e) => {
                tracing::warn!("Failed to list tools from MCP server '{}': {}", name, e);
                None
            }
        });
        let registry = ToolRegistry::build(lists);
        let tool_count = registry.len();
        *self.registry.write().await = registry;

        tracing::debug!("Tool registry rebuilt with {} tools", tool_count);
        self.emit(ManagerEvent::RegistryChanged { tool_count });
        tool_count
    }

    async fn select_connection(&self, tool: Option<&str>) -> Option<String> {
        let registry = self.registry.read().await;
        let connections = self.connections.lock().await;

        let eligible: Vec<&ConnectionInfo> = match tool {
            Some(tool) => registry
                .providers(tool)?
                .iter()
                .filter_map(|name| connections.get(name))
                .filter(|info| info.status.is_ready())
                .collect(),
            None => connections
                .values()
                .filter(|info| info.status.is_ready())
                .collect(),
        };
        let candidates: Vec<Candidate<'_>> = eligible
            .iter()
            .map(|info| Candidate {
                name: info.name(),
                request_count: info.request_count,
                in_flight: info.in_flight,
            })
            .collect();

        let index = self.balancer.pick(&candidates)?;
        candidates.get(index).map(|c| c.name.to_string())
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolCallOutcome, PoolError> {
        let no_provider = || PoolError::NoProvider {
            tool: tool.to_string(),
        };
        let connection = self
            .select_connection(Some(tool))
            .await
            .ok_or_else(no_provider)?;

        let client = {
            let mut connections = self.connections.lock().await;
            let info = connections
                .get_mut(&connection)
                .filter(|info| info.status.is_ready())
                .ok_or_else(no_provider)?;
            let client = info.client.clone().ok_or_else(no_provider)?;
            info.request_count += 1;
            info.in_flight += 1;
            info.last_activity = Some(Utc::now());
            client
        };

        tracing::debug!("Calling tool '{}' on '{}'", tool, connection);
        let result = client.call_tool(tool, arguments).await;

        {
            let mut connections = self.connections.lock().await;
            if let Some(info) = connections.get_mut(&connection) {
                info.in_flight = info.in_flight.saturating_sub(1);
                if result.is_err() {
                    info.error_count += 1;
                }
            }
        }

        match result {
            Ok(result) => Ok(ToolCallOutcome { connection, result }),
            Err(source) => {
                tracing::warn!("Tool '{}' failed on '{}': {}", tool, connection, source);
                Err(PoolError::Provider { connection, source })
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.health_task.get_mut().take() {
            handle.abort();
        }
        for info in self.connections.get_mut().values_mut() {
            drop(info.detach());
        }
    }
}
