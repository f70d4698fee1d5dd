use thiserror::Error;

/// Top-level error type for the TubeLens orchestrator.
#[derive(Debug, Error)]
pub enum LensError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session state corrupted: {0}")]
    SessionCorrupted(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid params for tool '{tool}': {message}")]
    InvalidParams { tool: String, message: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("session recovery failed: {0}")]
    RecoveryFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Error a tool handler may return to say whether a retry could help.
///
/// Handlers that fail with any other error type are treated as
/// non-recoverable.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ToolFailure {
    pub message: String,
    pub recoverable: bool,
}

impl ToolFailure {
    /// A transient failure (timeout, upstream 5xx); may be retried.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: true,
        }
    }

    /// A permanent failure; retrying with the same params will not help.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: false,
        }
    }

    /// Extract the message and recoverability from a handler error.
    pub fn classify(err: &anyhow::Error) -> (String, bool) {
        match err.downcast_ref::<ToolFailure>() {
            Some(failure) => (failure.message.clone(), failure.recoverable),
            None => (format!("{err:#}"), false),
        }
    }
}
