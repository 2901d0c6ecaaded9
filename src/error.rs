//! Error types for subject rate limiting
use std::fmt;
use std::time::Duration;

/// Boxed error returned by pluggable collaborators (notifiers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error surfaced by [`Rater::handle_event`](crate::Rater::handle_event).
#[derive(Debug, Clone)]
pub enum RaterError<E> {
    /// The subject's leaky bucket was torn down while the event was waiting for capacity.
    BucketClosed { key: String },
    /// The downstream action failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for RaterError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BucketClosed { key } => {
                write!(f, "throttle bucket for subject {} closed while waiting", key)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RaterError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> RaterError<E> {
    /// Check if this error is due to a torn-down throttle bucket
    pub fn is_bucket_closed(&self) -> bool {
        matches!(self, Self::BucketClosed { .. })
    }
    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors produced when validating a rater configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The window must last between one second and one year.
    #[error("period must be between 1s and 365 days (got {0:?})")]
    InvalidPeriod(Duration),
    /// At least one call per window must be allowed.
    #[error("after_handle_count must be > 0 (got {0})")]
    InvalidAfterHandleCount(u32),
    /// Notifications need a positive warning budget.
    #[error("warnings_count must be > 0 when notifications are enabled (got {0})")]
    InvalidWarningsCount(u32),
    /// The bucket refill window has to close before the subject window does.
    #[error("sem_period must be > 0 and lower than period ({sem_period:?} >= {period:?})")]
    InvalidSemPeriod {
        /// Requested refill window.
        sem_period: Duration,
        /// Subject window.
        period: Duration,
    },
}

/// Errors from [`LeakyBucket`](crate::LeakyBucket).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketError {
    /// `max_rate` must be positive.
    #[error("max_rate must be > 0")]
    InvalidRate,
    /// `period` must be positive.
    #[error("period must be > 0")]
    InvalidPeriod,
    /// The bucket was closed; waiters are released with this error.
    #[error("bucket closed")]
    Closed,
}

/// Errors from a [`StateCodec`](crate::store::StateCodec).
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    /// Stored bytes do not have the expected shape.
    #[error("malformed state payload: expected {expected} bytes, got {got}")]
    Length {
        /// Required payload size.
        expected: usize,
        /// Actual payload size.
        got: usize,
    },
    /// JSON encoding or decoding failed.
    #[cfg(feature = "serde")]
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
