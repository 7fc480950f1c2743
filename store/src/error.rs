//! Unified error handling for the store.

use crate::queue::CommandError;

/// Store error type.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The object has no data in the local datastore. Expected during normal
    /// operation and not logged as an error.
    #[error("Object is not in the local datastore")]
    CacheMiss,

    // Storage faults
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    // Storage engine contract
    #[error("Database is already open")]
    AlreadyOpen,

    #[error("Database is already closed")]
    AlreadyClosed,

    #[error("Database is not open")]
    NotOpen,

    #[error("A transaction is already open")]
    TransactionAlreadyOpen,

    #[error("No transaction is open")]
    NoTransaction,

    #[error("Statement expects {expected} arguments, got {got}")]
    InvalidArgumentCount { expected: usize, got: usize },

    #[error("Invalid statement: {0}")]
    InvalidSql(String),

    #[error("Engine error: {0}")]
    Engine(#[from] mooring_engine::Error),
}

impl StoreError {
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, StoreError::CacheMiss)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Terminal outcome of a queued command that did not succeed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// The remote service rejected the command for good.
    #[error("Command failed: {0}")]
    Command(#[from] CommandError),

    /// The command targeted an object that was deleted before it was ever
    /// created remotely, so it was never sent.
    #[error("Command pruned: target was deleted before it was created")]
    Pruned,

    /// Retries were exhausted.
    #[error("Command dropped after {attempts} attempts: {last}")]
    Dropped { attempts: u32, last: CommandError },

    /// The queue stopped or was reset before the command completed.
    #[error("Queue terminated before the command completed")]
    Terminated,

    /// Local bookkeeping for the command failed.
    #[error("Store error: {0}")]
    Store(String),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        QueueError::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StoreError::InvalidArgumentCount {
            expected: 2,
            got: 1,
        };
        assert_eq!(err.to_string(), "Statement expects 2 arguments, got 1");
        assert!(StoreError::CacheMiss.is_cache_miss());
        assert!(!StoreError::NotOpen.is_cache_miss());

        let err = QueueError::Dropped {
            attempts: 5,
            last: CommandError::Retryable("timeout".into()),
        };
        assert_eq!(
            err.to_string(),
            "Command dropped after 5 attempts: Retryable failure: timeout"
        );
    }

    #[test]
    fn json_errors_are_corruption() {
        let err: StoreError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}
