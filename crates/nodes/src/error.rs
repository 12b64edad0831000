//! Backend-level error type.

use thiserror::Error;

/// Errors returned by a backend call.
///
/// The task executor uses the variant to decide retry behaviour:
/// - `Retryable`: transient failure (transport, 5xx, function-reported error);
///   the call is attempted again while the task has retries left.
/// - `Fatal`: permanent failure (4xx, malformed input); returned at once.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Transient failure; the executor should retry the call.
    #[error("retryable backend error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal backend error: {0}")]
    Fatal(String),
}

impl NodeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Retryable(_))
    }

    /// The bare message, without the retryable/fatal prefix.
    pub fn message(&self) -> &str {
        match self {
            NodeError::Retryable(msg) | NodeError::Fatal(msg) => msg,
        }
    }
}
