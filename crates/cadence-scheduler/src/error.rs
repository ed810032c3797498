use thiserror::Error;

/// Errors that can occur within the dispatch core.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cron expression could not be parsed or never fires.
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    /// The transport already holds a live instance with this id.
    #[error("Task instance already exists: {id} (group {group})")]
    Conflict { group: String, id: String },

    /// The distributed lock could not be acquired within its retry budget.
    #[error("Lock {key} not acquired after {attempts} attempt(s)")]
    LockTimeout { key: String, attempts: u32 },

    /// A caller-supplied handler or the HTTP callback reported failure.
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Communication failure with the queue transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Communication failure with the KV / registry store.
    #[error("Store error: {0}")]
    Store(String),

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Submission parameters are missing or contradict each other.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// No periodic task record with the given uid exists in the registry.
    #[error("Periodic task not found: {uid}")]
    NotFound { uid: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,
}

impl SchedulerError {
    /// Short error code string for structured logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidExpression { .. } => "INVALID_EXPRESSION",
            SchedulerError::Conflict { .. } => "CONFLICT",
            SchedulerError::LockTimeout { .. } => "LOCK_TIMEOUT",
            SchedulerError::Handler(_) => "HANDLER_ERROR",
            SchedulerError::Transport(_) => "TRANSPORT_ERROR",
            SchedulerError::Store(_) => "STORE_ERROR",
            SchedulerError::Database(_) => "STORE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::InvalidOptions(_) => "INVALID_OPTIONS",
            SchedulerError::NotFound { .. } => "NOT_FOUND",
            SchedulerError::Cancelled => "CANCELLED",
            SchedulerError::DeadlineExceeded => "DEADLINE_EXCEEDED",
        }
    }

    /// Whether a background cycle that hit this error can simply try again on
    /// its next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Conflict { .. }
                | SchedulerError::LockTimeout { .. }
                | SchedulerError::Transport(_)
                | SchedulerError::Store(_)
                | SchedulerError::Database(_)
                | SchedulerError::DeadlineExceeded
        )
    }
}

/// Failure reported by a task handler.
///
/// Handlers return this instead of [`SchedulerError`] so user code does not
/// need to know the dispatch core's taxonomy; the dispatcher wraps it into
/// [`SchedulerError::Handler`] before the transport sees it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
