//! Error types shared by every Habitflow crate.

/// Top-level error type for the reminder engine and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum HabitflowError {
    /// Configuration could not be read, parsed or validated.
    #[error("config error: {0}")]
    Config(String),

    /// Task store read/write failure.
    #[error("store error: {0}")]
    Store(String),

    /// SQLite failure (open, migrate, query).
    #[error("database error: {0}")]
    Database(String),

    /// Dispatch queue failure.
    #[error("queue error: {0}")]
    Queue(String),

    /// The dispatch queue is not available in this process.
    #[error("dispatch queue is disabled")]
    QueueDisabled,

    /// A delivery channel rejected or failed to send a message.
    #[error("delivery error: {0}")]
    Delivery(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HabitflowError {
    /// Errors worth retrying on the next tick without operator attention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Database(_) | Self::Queue(_) | Self::Io(_)
        )
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, HabitflowError>;
