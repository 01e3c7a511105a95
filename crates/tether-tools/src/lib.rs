//! Tool system on top of a provider pool.
//!
//! [`ToolSystem`] discovers tools through a
//! [`ConnectionManager`](tether_pool::ConnectionManager), validates call
//! arguments against rules derived from each tool's input schema, runs
//! optional post-processors, keeps per-tool metrics and a bounded execution
//! history, and executes multi-step tool chains.

pub mod chain;
pub mod config;
pub mod error;
pub mod history;
pub mod metrics;
pub mod system;
pub mod validation;

pub use chain::{ChainOptions, ChainOutcome, ChainStep, DataMapping, MappingFn};
pub use config::ToolSystemConfig;
pub use error::ToolSystemError;
pub use history::{ExecutionContext, ExecutionHistory, ExecutionResult};
pub use metrics::{MetricsRegistry, MetricsSnapshot, ToolMetrics};
pub use system::{
    CallOptions, PostProcessor, ProcessorError, ToolDefinition, ToolEvent, ToolSystem,
    ToolSystemStatus,
};
pub use validation::{
    CustomValidator, FieldType, ValidationOutcome, ValidationRule, rules_from_schema,
    validate_args,
};
