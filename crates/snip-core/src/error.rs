use thiserror::Error;

/// Errors raised by storage backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage operation timed out: {0}")]
    Timeout(String),
    #[error("storage query failed: {0}")]
    Query(String),
    #[error("stored data is invalid: {0}")]
    InvalidData(String),
    #[error("could not find a free short code after {attempts} attempts")]
    Exhausted { attempts: usize },
    #[error("storage operation cancelled")]
    Cancelled,
    #[error("storage operation failed: {0}")]
    Operation(String),
}

/// Errors surfaced by the shortener service to its callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShortenerError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid short code: {0}")]
    InvalidShortCode(String),
    /// The original URL was shortened before; `short_url` points at the
    /// existing mapping.
    #[error("conflict: url already shortened as {short_url}")]
    Conflict { short_url: String },
    #[error("short code not found: {0}")]
    NotFound(String),
    #[error("short code has been deleted: {0}")]
    Deleted(String),
    #[error("storage error: {0}")]
    Storage(StorageError),
    #[error("task submission failed: {0}")]
    Task(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl ShortenerError {
    /// Returns `true` for errors caused by malformed caller input.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidUrl(_) | Self::InvalidShortCode(_))
    }
}

impl From<StorageError> for ShortenerError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::Cancelled => Self::Cancelled,
            other => Self::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_stays_distinct_from_storage_failures() {
        assert_eq!(
            ShortenerError::from(StorageError::Cancelled),
            ShortenerError::Cancelled
        );
        assert!(matches!(
            ShortenerError::from(StorageError::Unavailable("down".into())),
            ShortenerError::Storage(StorageError::Unavailable(_))
        ));
    }

    #[test]
    fn validation_errors() {
        assert!(ShortenerError::InvalidUrl("x".into()).is_validation());
        assert!(ShortenerError::InvalidShortCode("x".into()).is_validation());
        assert!(!ShortenerError::NotFound("x".into()).is_validation());
    }
}
