//! Evaluation error taxonomy
//!
//! Structured errors for workspace setup, agent backends, subprocess
//! timeouts, and external collaborators. Only `Config` is allowed to
//! reach the process boundary; everything else is absorbed at the
//! attempt or instance level.

use thiserror::Error;

/// Result type alias for evaluation operations
pub type EvalResult<T> = Result<T, EvalError>;

/// Errors that can occur while evaluating an instance
#[derive(Error, Debug)]
pub enum EvalError {
    /// Invalid knob or missing external binary. Fatal; nonzero exit.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Workspace acquisition failed (clone / fetch / checkout).
    #[error("workspace setup failed during {operation}: {message}")]
    Setup { operation: String, message: String },

    /// `git diff` failed or timed out. Fatal to the attempt.
    #[error("git diff failed: {message}")]
    Diff { message: String },

    /// Model endpoint refused the connection or dropped the socket.
    /// Retried with fixed backoff before collapsing to `AgentFatal`.
    #[error("agent backend transient failure: {message}")]
    AgentTransient { message: String },

    /// Unrecoverable agent exception. The attempt records status "error".
    #[error("agent backend failed: {message}")]
    AgentFatal { message: String },

    /// A subprocess exceeded its deadline.
    #[error("{tool} timed out after {seconds}s")]
    ToolTimeout { tool: String, seconds: u64 },

    /// GraphRAG collaborator RPC failed. Demoted to a no-op by callers.
    #[error("graphrag service unavailable: {message}")]
    GraphRagUnavailable { message: String },

    /// IO error wrapper
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EvalError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a workspace setup error
    pub fn setup(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Setup {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a diff error
    pub fn diff(message: impl Into<String>) -> Self {
        Self::Diff {
            message: message.into(),
        }
    }

    /// Create a transient agent error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::AgentTransient {
            message: message.into(),
        }
    }

    /// Create a fatal agent error
    pub fn agent(message: impl Into<String>) -> Self {
        Self::AgentFatal {
            message: message.into(),
        }
    }

    /// Create a tool timeout error
    pub fn timeout(tool: impl Into<String>, seconds: u64) -> Self {
        Self::ToolTimeout {
            tool: tool.into(),
            seconds,
        }
    }

    /// Create a graphrag error
    pub fn graphrag(message: impl Into<String>) -> Self {
        Self::GraphRagUnavailable {
            message: message.into(),
        }
    }

    /// Whether the driver's fixed-backoff retry policy applies.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::AgentTransient { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EvalError::setup("clone", "remote hung up");
        assert!(err.to_string().contains("clone"));
        assert!(err.to_string().contains("remote hung up"));

        let err = EvalError::timeout("pytest", 180);
        assert!(err.to_string().contains("pytest"));
        assert!(err.to_string().contains("180"));
    }

    #[test]
    fn test_is_transient() {
        assert!(EvalError::transient("connection refused").is_transient());
        assert!(!EvalError::agent("model rejected request").is_transient());
        assert!(!EvalError::config("bad flag").is_transient());

        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: EvalError = io_err.into();
        assert!(err.is_transient());
    }
}
