//! Execution records and the bounded history they are kept in.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Who called what, where, and when.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionContext {
    pub tool_name: String,
    pub args: Value,
    /// Connection that served the call, when one was selected.
    pub connection_name: Option<String>,
    pub session_id: Option<String>,
    pub metadata: Map<String, Value>,
    pub start_time: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            args,
            connection_name: None,
            session_id: None,
            metadata: Map::new(),
            start_time: Utc::now(),
        }
    }
}

/// Outcome of one tool call. Also the unit stored in [`ExecutionHistory`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub context: ExecutionContext,
}

impl ExecutionResult {
    pub fn succeeded(data: Value, duration_ms: u64, context: ExecutionContext) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            duration_ms,
            context,
        }
    }

    pub fn failed(error: impl Into<String>, duration_ms: u64, context: ExecutionContext) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            duration_ms,
            context,
        }
    }
}

/// Most recent executions, oldest first.
///
/// When a push takes the history past capacity it is trimmed to half
/// capacity in one go, never below the record just pushed.
#[derive(Debug)]
pub struct ExecutionHistory {
    records: VecDeque<ExecutionResult>,
    capacity: usize,
}

impl ExecutionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, record: ExecutionResult) {
        self.records.push_back(record);
        if self.records.len() > self.capacity {
            // The newest record always survives, even at capacity 1
            let keep = (self.capacity / 2).max(1);
            let excess = self.records.len() - keep;
            self.records.drain(..excess);
        }
    }

    /// The last `limit` records (all when `None`), oldest first.
    pub fn recent(&self, limit: Option<usize>) -> Vec<ExecutionResult> {
        let skip = limit.map_or(0, |n| self.records.len().saturating_sub(n));
        self.records.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
