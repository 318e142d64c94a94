use thiserror::Error;

/// Convenience alias for Results using [`MeshError`].
pub type Result<T> = std::result::Result<T, MeshError>;

/// Error taxonomy for the gateway/agent fabric.
///
/// Each variant maps to a stable wire-level code via [`MeshError::code`] so that
/// a user-visible failure carries a short message without leaking internals.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("agent offline: {0}")]
    AgentOffline(String),

    #[error("budget exceeded: estimated {estimated}, max {max}")]
    BudgetExceeded { estimated: f64, max: f64 },

    #[error("transient network error: {0}")]
    NetworkTransient(String),

    #[error("operation timed out: {message}")]
    Timeout { message: String },

    #[error("internal error: {0}")]
    InternalMsg(String),

    #[error("configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MeshError {
    /// Stable wire-level error code from the error kind taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            MeshError::AuthFailed(_) => "AUTH_FAILED",
            MeshError::Forbidden(_) => "FORBIDDEN",
            MeshError::NotFound(_) => "NOT_FOUND",
            MeshError::RateLimited(_) => "RATE_LIMITED",
            MeshError::Validation(_) => "VALIDATION_ERROR",
            MeshError::AgentOffline(_) => "AGENT_OFFLINE",
            MeshError::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            MeshError::NetworkTransient(_) | MeshError::WebSocket(_) => "NETWORK_TRANSIENT",
            MeshError::Timeout { .. } => "TIMEOUT",
            MeshError::InternalMsg(_)
            | MeshError::ConfigError(_)
            | MeshError::Serialization(_)
            | MeshError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether a failing task should be surfaced to its originator as retryable.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            MeshError::NetworkTransient(_) | MeshError::Timeout { .. } | MeshError::WebSocket(_)
        )
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        MeshError::InternalMsg(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        MeshError::Timeout {
            message: msg.into(),
        }
    }
}
