//! Error taxonomy for the consumer path.

use thiserror::Error;

/// Result type for offset and dead-letter storage operations
pub type StateResult<T> = Result<T, StateError>;

/// Errors from the durable consumer-state stores (offsets, dead letters)
#[derive(Error, Debug)]
pub enum StateError {
    /// Database operation failed (connection, query execution, etc.)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Outcome classification for a single envelope apply.
///
/// The split drives the redelivery contract: transient failures withhold the
/// offset and are retried by redelivery, permanent failures are retried a
/// bounded number of times and then routed to the dead-letter sink so they
/// cannot block the partition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumeError {
    /// Store unreachable, lock/version contention, caught panic. Retried
    /// automatically because the offset is not committed.
    #[error("transient apply failure: {0}")]
    Transient(String),

    /// Deterministic failure (malformed payload, shape violation, update on
    /// a never-created entity). Retrying cannot succeed.
    #[error("permanent apply failure: {0}")]
    Permanent(String),
}

impl ConsumeError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        ConsumeError::Transient(err.to_string())
    }

    pub fn permanent(err: impl std::fmt::Display) -> Self {
        ConsumeError::Permanent(err.to_string())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ConsumeError::Permanent(_))
    }
}

impl From<sqlx::Error> for ConsumeError {
    fn from(err: sqlx::Error) -> Self {
        // Store failures are retryable by definition; the row may be
        // reachable on the next delivery.
        ConsumeError::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(!ConsumeError::transient("pool timed out").is_permanent());
        assert!(ConsumeError::permanent("bad payload").is_permanent());
    }

    #[test]
    fn test_sqlx_errors_are_transient() {
        let err: ConsumeError = sqlx::Error::PoolTimedOut.into();
        assert!(!err.is_permanent());
    }
}
