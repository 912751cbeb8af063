//! Error taxonomy: validation (pre-start, fatal), execution (run- and block-level), handler.

use thiserror::Error;

/// Structural problem in a workflow document. Detected before execution starts;
/// the engine never begins a run against an invalid workflow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("workflow has no starter block")]
    MissingStarter,
    #[error("workflow has {0} starter blocks, expected exactly one")]
    MultipleStarters(usize),
    #[error("starter block {0} is disabled")]
    DisabledStarter(String),
    #[error("starter block {0} has incoming connections")]
    StarterHasIncoming(String),
    #[error("duplicate block id: {0}")]
    DuplicateBlockId(String),
    #[error("connection {conn_source} -> {target} references unknown block: {missing}")]
    DanglingConnection {
        conn_source: String,
        target: String,
        missing: String,
    },
    #[error("loop {loop_id}: {message}")]
    InvalidLoop { loop_id: String, message: String },
    #[error("parallel {parallel_id}: {message}")]
    InvalidParallel {
        parallel_id: String,
        message: String,
    },
}

/// Runtime failure. Block-level kinds (`Reference`, `Input`, `Handler`) are recorded
/// in the failing block's state and routed along error edges; the rest abort the run.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// A `<...>` reference could not be resolved against the current context.
    #[error("{0}")]
    Reference(String),
    /// A resolved input failed schema-driven coercion.
    #[error("invalid value for input {param}: {message}")]
    Input { param: String, message: String },
    /// A handler returned or threw an error.
    #[error("{message}")]
    Handler { message: String, status: u16 },
    /// Loop configuration unusable at loop entry (e.g. forEach over an empty collection).
    #[error("loop {loop_id}: {message}")]
    LoopConfig { loop_id: String, message: String },
    #[error("cancelled")]
    Cancelled,
    #[error("iteration limit exceeded")]
    IterationLimit,
    /// Invariant violation inside the engine.
    #[error("{0}")]
    Internal(String),
}

impl ExecutionError {
    /// HTTP-ish status carried into the block's error output.
    pub fn status(&self) -> u16 {
        match self {
            ExecutionError::Handler { status, .. } => *status,
            _ => 500,
        }
    }

    /// Whether this error aborts the whole run instead of being recorded on one block.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExecutionError::LoopConfig { .. }
                | ExecutionError::Cancelled
                | ExecutionError::IterationLimit
                | ExecutionError::Internal(_)
        )
    }
}

/// Error returned by a block handler. `status` defaults to 500 when unset.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub status: Option<u16>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
        }
    }
}

impl From<HandlerError> for ExecutionError {
    fn from(e: HandlerError) -> Self {
        ExecutionError::Handler {
            message: e.message,
            status: e.status.unwrap_or(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_status_defaults_to_500() {
        let e: ExecutionError = HandlerError::new("boom").into();
        assert_eq!(e.status(), 500);
        let e: ExecutionError = HandlerError::with_status("nope", 404).into();
        assert_eq!(e.status(), 404);
    }

    #[test]
    fn block_level_errors_are_not_fatal() {
        assert!(!ExecutionError::Reference("x".into()).is_fatal());
        assert!(
            !ExecutionError::Handler {
                message: "x".into(),
                status: 500
            }
            .is_fatal()
        );
        assert!(ExecutionError::Cancelled.is_fatal());
        assert!(
            ExecutionError::LoopConfig {
                loop_id: "l".into(),
                message: "empty".into()
            }
            .is_fatal()
        );
    }
}
