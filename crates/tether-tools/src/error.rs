use tether_pool::PoolError;

use crate::history::ExecutionResult;

#[derive(Debug, thiserror::Error)]
pub enum ToolSystemError {
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Invalid arguments for '{tool}': {}", .errors.join("; "))]
    Validation { tool: String, errors: Vec<String> },

    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A chain step failed without `continue_on_error`. `results` holds the
    /// steps that ran before it.
    #[error("Tool chain aborted at step {step} ('{tool}'): {source}")]
    ChainAborted {
        step: usize,
        tool: String,
        results: Vec<ExecutionResult>,
        #[source]
        source: Box<ToolSystemError>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_joined() {
        let err = ToolSystemError::Validation {
            tool: "navigate".into(),
            errors: vec!["url is required".into(), "width must be of type integer".into()],
        };
        assert_eq!(
            err.to_string(),
            "Invalid arguments for 'navigate': url is required; width must be of type integer"
        );
    }

    #[test]
    fn pool_errors_pass_through() {
        let err = ToolSystemError::from(PoolError::NoProvider { tool: "x".into() });
        assert_eq!(err.to_string(), "No ready connection provides tool 'x'");
    }

    #[test]
    fn chain_abort_wraps_step_error() {
        let err = ToolSystemError::ChainAborted {
            step: 1,
            tool: "B".into(),
            results: Vec::new(),
            source: Box::new(ToolSystemError::UnknownTool { name: "B".into() }),
        };
        assert!(err.to_string().contains("step 1"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
