//! Tool system configuration.

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_history_capacity() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSystemConfig {
    /// Derive validation rules from each tool's `inputSchema`.
    #[serde(default = "default_true")]
    pub schema_validation: bool,
    /// Soft cap on retained execution records.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Reload tool definitions whenever the pool's registry changes.
    #[serde(default = "default_true")]
    pub auto_refresh: bool,
}

impl Default for ToolSystemConfig {
    fn default() -> Self {
        Self {
            schema_validation: true,
            history_capacity: default_history_capacity(),
            auto_refresh: true,
        }
    }
}
