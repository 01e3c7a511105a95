//! Tool chains: sequential calls with data carried from step to step.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::history::ExecutionResult;

/// Computes extra arguments from the chain's accumulated data and the results
/// so far.
pub type MappingFn = Arc<dyn Fn(&Value, &[ExecutionResult]) -> Value + Send + Sync>;

/// How a step derives arguments from earlier steps.
#[derive(Clone)]
pub enum DataMapping {
    Fn(MappingFn),
    /// `target argument -> source field` in the accumulated data.
    Rename(BTreeMap<String, String>),
}

impl fmt::Debug for DataMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataMapping::Fn(_) => f.write_str("DataMapping::Fn(..)"),
            DataMapping::Rename(fields) => f.debug_tuple("DataMapping::Rename").field(fields).finish(),
        }
    }
}

impl DataMapping {
    pub fn from_fn<F>(mapping: F) -> Self
    where
        F: Fn(&Value, &[ExecutionResult]) -> Value + Send + Sync + 'static,
    {
        DataMapping::Fn(Arc::new(mapping))
    }

    pub fn rename<I, T, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (T, S)>,
        T: Into<String>,
        S: Into<String>,
    {
        DataMapping::Rename(
            fields
                .into_iter()
                .map(|(target, source)| (target.into(), source.into()))
                .collect(),
        )
    }

    /// Arguments contributed by this mapping. Non-object output from a
    /// mapping function contributes nothing.
    pub fn apply(&self, data: &Value, results: &[ExecutionResult]) -> Map<String, Value> {
        match self {
            DataMapping::Fn(mapping) => match mapping(data, results) {
                Value::Object(args) => args,
                other => {
                    tracing::warn!("Ignoring non-object data mapping output: {}", other);
                    Map::new()
                }
            },
            DataMapping::Rename(fields) => fields
                .iter()
                .filter_map(|(target, source)| {
                    data.get(source).map(|value| (target.clone(), value.clone()))
                })
                .collect(),
        }
    }
}

/// One step of a chain.
#[derive(Debug, Clone)]
pub struct ChainStep {
    pub tool: String,
    /// Static arguments; mapped arguments override them key by key.
    pub args: Map<String, Value>,
    pub mapping: Option<DataMapping>,
}

impl ChainStep {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args: Map::new(),
            mapping: None,
        }
    }

    /// Static arguments. Anything other than an object is ignored.
    pub fn with_args(mut self, args: Value) -> Self {
        if let Value::Object(args) = args {
            self.args = args;
        }
        self
    }

    pub fn with_mapping(mut self, mapping: DataMapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    /// Effective arguments for this step.
    pub fn arguments(&self, data: &Value, results: &[ExecutionResult]) -> Value {
        let mut args = self.args.clone();
        if let Some(mapping) = &self.mapping {
            args.extend(mapping.apply(data, results));
        }
        Value::Object(args)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChainOptions {
    /// Record a failed step and keep going instead of aborting.
    pub continue_on_error: bool,
    pub skip_validation: bool,
    pub session_id: Option<String>,
}

/// Results of a completed chain.
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    /// One entry per step, in order.
    pub results: Vec<ExecutionResult>,
    /// Initial data with every successful object result merged in.
    pub data: Value,
}

/// Shallow-merge an object result into the accumulated data.
pub(crate) fn merge_into(data: &mut Value, result: &Value) {
    let Value::Object(fields) = result else {
        return;
    };
    if !data.is_object() {
        *data = Value::Object(Map::new());
    }
    if let Value::Object(target) = data {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    }
}
