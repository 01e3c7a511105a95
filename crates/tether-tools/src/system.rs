//! Tool system: the application-facing facade over a connection pool.
//!
//! Keeps a definition per discovered tool, validates arguments before they
//! leave the process, post-processes results, and records metrics and an
//! execution history for every call that reaches a provider.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tether_pool::{ConnectionManager, ManagerEvent, PoolStatus};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::chain::{ChainOptions, ChainOutcome, ChainStep, merge_into};
use crate::config::ToolSystemConfig;
use crate::error::ToolSystemError;
use crate::history::{ExecutionContext, ExecutionHistory, ExecutionResult};
use crate::metrics::{MetricsRegistry, MetricsSnapshot, ToolMetrics};
use crate::validation::{self, ValidationOutcome, ValidationRule, rules_from_schema};

const EVENT_CAPACITY: usize = 128;

pub type ProcessorError = Box<dyn std::error::Error + Send + Sync>;

/// Rewrites a successful tool result. An error falls back to the raw result.
pub type PostProcessor =
    Arc<dyn Fn(Value, &ExecutionContext) -> Result<Value, ProcessorError> + Send + Sync>;

/// A tool known to the system.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    /// First time the tool was seen; kept across refreshes.
    pub registered_at: DateTime<Utc>,
    /// Connections advertising the tool at the last refresh.
    pub providers: Vec<String>,
    #[serde(skip)]
    pub rules: Vec<ValidationRule>,
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub skip_validation: bool,
    pub session_id: Option<String>,
    pub metadata: Map<String, Value>,
}

/// Subscribe with [`ToolSystem::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolEvent {
    ToolsRefreshed {
        count: usize,
    },
    CallCompleted {
        tool: String,
        success: bool,
        duration_ms: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSystemStatus {
    pub tool_count: usize,
    pub history_len: usize,
    pub total_calls: u64,
    pub success_rate: f64,
    pub pool: PoolStatus,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

struct Inner {
    config: ToolSystemConfig,
    manager: ConnectionManager,
    tools: RwLock<BTreeMap<String, ToolDefinition>>,
    /// Hand-set rules; replace the derived rules for that tool.
    manual_rules: RwLock<HashMap<String, Vec<ValidationRule>>>,
    post_processors: RwLock<HashMap<String, PostProcessor>>,
    metrics: Mutex<MetricsRegistry>,
    history: Mutex<ExecutionHistory>,
    events: broadcast::Sender<ToolEvent>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

/// Application entry point for calling tools across a provider pool.
#[derive(Clone)]
pub struct ToolSystem {
    inner: Arc<Inner>,
}

impl ToolSystem {
    pub fn new(manager: ConnectionManager, config: ToolSystemConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let history = ExecutionHistory::new(config.history_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                manager,
                tools: RwLock::new(BTreeMap::new()),
                manual_rules: RwLock::new(HashMap::new()),
                post_processors: RwLock::new(HashMap::new()),
                metrics: Mutex::new(MetricsRegistry::default()),
                history: Mutex::new(history),
                events,
                refresher: Mutex::new(None),
            }),
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    pub fn config(&self) -> &ToolSystemConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ToolEvent> {
        self.inner.events.subscribe()
    }

    /// Load tool definitions from the pool and, with `auto_refresh`, keep
    /// them in sync with the pool's registry. Returns the tool count.
    pub async fn initialize(&self) -> usize {
        // Subscribe before loading so a change during the load is not missed
        let follow = self.inner.config.auto_refresh && lock(&self.inner.refresher).is_none();
        let events = follow.then(|| self.inner.manager.subscribe());

        let count = self.inner.refresh().await;
        if let Some(events) = events {
            let mut refresher = lock(&self.inner.refresher);
            if refresher.is_none() {
                *refresher = Some(spawn_refresher(&self.inner, events));
            }
        }
        count
    }

    /// Reload tool definitions now.
    pub async fn refresh_tools(&self) -> usize {
        self.inner.refresh().await
    }

    pub fn tools(&self) -> Vec<ToolDefinition> {
        read(&self.inner.tools).values().cloned().collect()
    }

    pub fn tool(&self, name: &str) -> Option<ToolDefinition> {
        read(&self.inner.tools).get(name).cloned()
    }

    /// Replace the rules for `tool`, overriding any derived from its schema.
    pub fn set_validation_rules(&self, tool: impl Into<String>, rules: Vec<ValidationRule>) {
        write(&self.inner.manual_rules).insert(tool.into(), rules);
    }

    /// Drop hand-set rules for `tool`, falling back to schema-derived ones.
    pub fn clear_validation_rules(&self, tool: &str) {
        write(&self.inner.manual_rules).remove(tool);
    }

    pub fn register_post_processor<F>(&self, tool: impl Into<String>, processor: F)
    where
        F: Fn(Value, &ExecutionContext) -> Result<Value, ProcessorError> + Send + Sync + 'static,
    {
        write(&self.inner.post_processors).insert(tool.into(), Arc::new(processor));
    }

    pub fn remove_post_processor(&self, tool: &str) {
        write(&self.inner.post_processors).remove(tool);
    }

    /// Check `args` against the rules in effect for `tool`. Unknown tools and
    /// tools without rules accept any object.
    pub fn validate_args(&self, tool: &str, args: &Value) -> ValidationOutcome {
        validation::validate_args(&self.inner.rules_for(tool), args)
    }

    /// Validate, route and record one tool call.
    ///
    /// Validation failures return before anything is sent and are not
    /// recorded. Provider and routing failures are recorded and metered, then
    /// returned.
    pub async fn call_tool(
        &self,
        name: &str,
        args: Value,
        options: CallOptions,
    ) -> Result<ExecutionResult, ToolSystemError> {
        if !read(&self.inner.tools).contains_key(name) {
            return Err(ToolSystemError::UnknownTool {
                name: name.to_string(),
            });
        }

        let args = if options.skip_validation {
            args
        } else {
            let outcome = self.validate_args(name, &args);
            if !outcome.valid {
                tracing::debug!("Rejected call to '{}': {}", name, outcome.errors.join("; "));
                return Err(ToolSystemError::Validation {
                    tool: name.to_string(),
                    errors: outcome.errors,
                });
            }
            outcome.processed_args
        };

        let mut context = ExecutionContext {
            tool_name: name.to_string(),
            args: args.clone(),
            connection_name: None,
            session_id: options.session_id,
            metadata: options.metadata,
            start_time: Utc::now(),
        };
        let started = Instant::now();
        let outcome = self.inner.manager.call_tool(name, args).await;
        let duration_ms = elapsed_ms(started);

        match outcome {
            Ok(outcome) => {
                context.connection_name = Some(outcome.connection);
                let data = self.inner.post_process(name, outcome.result, &context);
                let result = ExecutionResult::succeeded(data, duration_ms, context);
                self.inner.record(&result);
                Ok(result)
            }
            Err(e) => {
                context.connection_name = e.connection().map(str::to_string);
                let result = ExecutionResult::failed(e.to_string(), duration_ms, context);
                self.inner.record(&result);
                Err(e.into())
            }
        }
    }

    /// Run `steps` one after another, feeding each step's object result into
    /// the data later steps map their arguments from.
    pub async fn execute_tool_chain(
        &self,
        steps: &[ChainStep],
        initial_data: Value,
        options: ChainOptions,
    ) -> Result<ChainOutcome, ToolSystemError> {
        let mut data = initial_data;
        let mut results: Vec<ExecutionResult> = Vec::with_capacity(steps.len());

        for (index, step) in steps.iter().enumerate() {
            let args = step.arguments(&data, &results);
            let mut metadata = Map::new();
            metadata.insert("chain_step".to_string(), json!(index));
            let call = CallOptions {
                skip_validation: options.skip_validation,
                session_id: options.session_id.clone(),
                metadata,
            };

            match self.call_tool(&step.tool, args.clone(), call).await {
                Ok(result) => {
                    if let Some(output) = &result.data {
                        merge_into(&mut data, output);
                    }
                    results.push(result);
                }
                Err(e) if options.continue_on_error => {
                    tracing::warn!("Chain step {} ('{}') failed, continuing: {}", index, step.tool, e);
                    let mut context = ExecutionContext::new(step.tool.clone(), args);
                    context.session_id = options.session_id.clone();
                    results.push(ExecutionResult::failed(e.to_string(), 0, context));
                }
                Err(e) => {
                    return Err(ToolSystemError::ChainAborted {
                        step: index,
                        tool: step.tool.clone(),
                        results,
                        source: Box::new(e),
                    });
                }
            }
        }

        Ok(ChainOutcome { results, data })
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        lock(&self.inner.metrics).snapshot()
    }

    pub fn tool_metrics(&self, tool: &str) -> Option<ToolMetrics> {
        lock(&self.inner.metrics).tool(tool).cloned()
    }

    pub fn reset_metrics(&self) {
        lock(&self.inner.metrics).reset();
    }

    /// The last `limit` execution records (all when `None`), oldest first.
    pub fn history(&self, limit: Option<usize>) -> Vec<ExecutionResult> {
        lock(&self.inner.history).recent(limit)
    }

    pub fn clear_history(&self) {
        lock(&self.inner.history).clear();
    }

    pub async fn status(&self) -> ToolSystemStatus {
        let pool = self.inner.manager.status().await;
        let metrics = self.metrics();
        ToolSystemStatus {
            tool_count: read(&self.inner.tools).len(),
            history_len: lock(&self.inner.history).len(),
            total_calls: metrics.total_calls,
            success_rate: metrics.success_rate,
            pool,
        }
    }

    /// Stop following the pool and shut the pool down.
    pub async fn shutdown(&self) {
        if let Some(handle) = lock(&self.inner.refresher).take() {
            handle.abort();
        }
        self.inner.manager.shutdown().await;
        write(&self.inner.tools).clear();
    }
}

impl Inner {
    fn emit(&self, event: ToolEvent) {
        let _ = self.events.send(event);
    }

    fn rules_for(&self, tool: &str) -> Vec<ValidationRule> {
        if let Some(rules) = read(&self.manual_rules).get(tool) {
            return rules.clone();
        }
        read(&self.tools)
            .get(tool)
            .map(|definition| definition.rules.clone())
            .unwrap_or_default()
    }

    async fn refresh(&self) -> usize {
        let listed = self.manager.tools().await;
        let mut discovered = Vec::with_capacity(listed.len());
        for tool in listed {
            let providers = self.manager.tool_providers(&tool.name).await;
            discovered.push((tool, providers));
        }

        let now = Utc::now();
        let count = {
            let mut tools = write(&self.tools);
            let previous = std::mem::take(&mut *tools);
            for (tool, providers) in discovered {
                let rules = if self.config.schema_validation {
                    rules_from_schema(&tool.input_schema)
                } else {
                    Vec::new()
                };
                let registered_at = previous
                    .get(&tool.name)
                    .map_or(now, |existing| existing.registered_at);
                tools.insert(
                    tool.name.clone(),
                    ToolDefinition {
                        name: tool.name,
                        description: tool.description,
                        input_schema: tool.input_schema,
                        registered_at,
                        providers,
                        rules,
                    },
                );
            }
            tools.len()
        };

        tracing::info!("Tool system loaded {} tools", count);
        self.emit(ToolEvent::ToolsRefreshed { count });
        count
    }

    fn post_process(&self, tool: &str, raw: Value, context: &ExecutionContext) -> Value {
        let processor = read(&self.post_processors).get(tool).cloned();
        let Some(processor) = processor else {
            return raw;
        };
        match processor(raw.clone(), context) {
            Ok(processed) => processed,
            Err(e) => {
                tracing::warn!("Post-processor for '{}' failed, using raw result: {}", tool, e);
                raw
            }
        }
    }

    fn record(&self, result: &ExecutionResult) {
        let tool = &result.context.tool_name;
        lock(&self.metrics).record(tool, result.success, result.duration_ms);
        lock(&self.history).push(result.clone());
        tracing::debug!(
            "Tool '{}' {} in {}ms",
            tool,
            if result.success { "succeeded" } else { "failed" },
            result.duration_ms
        );
        self.emit(ToolEvent::CallCompleted {
            tool: tool.clone(),
            success: result.success,
            duration_ms: result.duration_ms,
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let refresher = self
            .refresher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = refresher.take() {
            handle.abort();
        }
    }
}

/// Reload definitions whenever the pool rebuilds its registry.
fn spawn_refresher(
    inner: &Arc<Inner>,
    mut events: broadcast::Receiver<ManagerEvent>,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ManagerEvent::RegistryChanged { .. }) | Err(RecvError::Lagged(_)) => {}
                Ok(_) => continue,
                Err(RecvError::Closed) => return,
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.refresh().await;
        }
    })
}
