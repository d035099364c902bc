//! Error types for the consume dedup library

use std::time::Duration;
use thiserror::Error;

/// Result type for dedup operations
pub type DedupResult<T> = Result<T, DedupError>;

/// Errors that can occur while guarding message consumption
#[derive(Error, Debug)]
pub enum DedupError {
    /// Redis command failed (connection refused, script error, etc.)
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Database operation failed (connection, query execution, etc.)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Backend did not answer within the configured deadline.
    ///
    /// The claim state is unknown; callers must defer the message.
    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    /// Dedup key validation failed (empty, too long)
    #[error("Invalid dedup key: {0}")]
    InvalidKey(String),

    /// Message carries neither a unique id nor a delivery id
    #[error("Message has no derivable dedup key")]
    MissingKey,

    /// Guard configuration is invalid
    #[error("Invalid dedup configuration: {0}")]
    Config(String),

    /// Backend returned a record that could not be decoded
    #[error("Corrupt dedup record: {0}")]
    CorruptRecord(String),

    /// Environment variables could not be parsed into settings
    #[error("Environment error: {0}")]
    Env(#[from] envy::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl DedupError {
    /// Check if error is transient (should retry the delivery later)
    ///
    /// A transient error never tells us whether a claim happened, so the
    /// host should answer the bus with "retry later".
    pub fn is_transient(&self) -> bool {
        match self {
            DedupError::Timeout(_) => true,
            DedupError::Redis(err) => redis_is_transient(err),
            DedupError::Database(err) => sqlx_is_transient(err),
            // Context-wrapped backend errors keep their own classification
            DedupError::Other(err) => {
                if let Some(sqlx_err) = err.downcast_ref::<sqlx::Error>() {
                    sqlx_is_transient(sqlx_err)
                } else if let Some(redis_err) = err.downcast_ref::<redis::RedisError>() {
                    redis_is_transient(redis_err)
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

fn redis_is_transient(err: &redis::RedisError) -> bool {
    err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
}

fn sqlx_is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_transient() {
        assert!(DedupError::Timeout(Duration::from_millis(10)).is_transient());
        assert!(DedupError::Database(sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn test_key_errors_are_not_transient() {
        assert!(!DedupError::MissingKey.is_transient());
        assert!(!DedupError::InvalidKey("empty".to_string()).is_transient());
        assert!(!DedupError::Config("bad".to_string()).is_transient());
    }

    #[test]
    fn test_context_wrapped_errors_keep_classification() {
        use anyhow::Context;

        let pool_timeout: DedupError = Err::<(), _>(sqlx::Error::PoolTimedOut)
            .context("Failed to claim dedup record")
            .unwrap_err()
            .into();
        assert!(pool_timeout.is_transient());

        let bad_sql: DedupError = Err::<(), _>(sqlx::Error::Protocol(
            "syntax error at or near \"SELEC\"".to_string(),
        ))
        .context("Failed to claim dedup record")
        .unwrap_err()
        .into();
        assert!(!bad_sql.is_transient());

        let refused: DedupError = Err::<(), _>(redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        )))
        .context("Failed to claim dedup key")
        .unwrap_err()
        .into();
        assert!(refused.is_transient());

        assert!(!DedupError::Other(anyhow::anyhow!("unexpected")).is_transient());
    }
}
