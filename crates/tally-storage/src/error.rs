use tally_common::error::MetricError;
use tally_common::types::MetricKind;

/// Errors that can occur within the storage layer.
///
/// # Examples
///
/// ```rust
/// use tally_common::types::MetricKind;
/// use tally_storage::error::StoreError;
///
/// let err = StoreError::NotFound {
///     name: "PollCount".to_string(),
///     kind: MetricKind::Counter,
/// };
/// assert!(err.to_string().contains("PollCount"));
/// assert!(err.is_client_error());
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No value stored under this name and kind.
    #[error("Storage: {kind} {name} not found")]
    NotFound { name: String, kind: MetricKind },

    /// The name is already stored under the other kind.
    #[error("Storage: {name} is stored as {stored}, cannot update as {requested}")]
    KindMismatch {
        name: String,
        stored: MetricKind,
        requested: MetricKind,
    },

    /// The metric itself is malformed.
    #[error("Storage: invalid metric: {0}")]
    Invalid(#[from] MetricError),

    /// Accumulating the delta would overflow the counter.
    #[error("Storage: counter {0} would overflow")]
    Overflow(String),

    /// Snapshot file read/write failure.
    #[error("Storage: I/O error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The store has been closed.
    #[error("Storage: store is closed")]
    Closed,
}

impl StoreError {
    /// Whether the caller sent something wrong, as opposed to the store
    /// failing.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound { .. }
                | StoreError::KindMismatch { .. }
                | StoreError::Invalid(_)
                | StoreError::Overflow(_)
        )
    }
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;
