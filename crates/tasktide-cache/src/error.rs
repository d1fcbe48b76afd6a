//! Error types for the cache and warming subsystem.
//!
//! A cache miss is not an error for readers: `Cache::get` returns `Ok(None)`.
//! [`CacheError::Miss`] only exists for callers that explicitly require a value
//! (see [`crate::CacheExt::require_value`]).

use std::time::Duration;

use crate::circuit_breaker::CircuitOpen;
use crate::config::WarmingMode;
use crate::distributed::JobType;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur across the cache boundary.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The key is not present in any tier.
    #[error("Cache miss: {key}")]
    Miss {
        /// The key that was looked up.
        key: String,
    },

    /// The remote tier (or job queue backend) could not be reached.
    #[error("Cache unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// The circuit breaker rejected the call without attempting it.
    #[error("Circuit breaker is open, retry after {retry_after:?}")]
    BreakerOpen {
        /// Time left until the breaker admits a trial call.
        retry_after: Duration,
    },

    /// The job type is not available in the active warming mode.
    #[error("{job_type} jobs are not supported in {mode} mode")]
    JobUnsupported {
        /// The rejected job type.
        job_type: JobType,
        /// The active warming mode.
        mode: WarmingMode,
    },

    /// A value could not be encoded or decoded.
    #[error("Serialization failure: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
    },

    /// A distributed job could not be routed or executed.
    #[error("Job queue error: {message}")]
    Queue {
        /// Description of the failure.
        message: String,
    },

    /// Configuration was rejected.
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },
}

impl CacheError {
    /// Creates a new `Miss` error.
    #[must_use]
    pub fn miss(key: impl Into<String>) -> Self {
        Self::Miss { key: key.into() }
    }

    /// Creates a new `Unavailable` error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a new `JobUnsupported` error.
    #[must_use]
    pub fn job_unsupported(job_type: JobType, mode: WarmingMode) -> Self {
        Self::JobUnsupported { job_type, mode }
    }

    /// Creates a new `Serialization` error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new `Queue` error.
    #[must_use]
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidConfig` error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a cache miss.
    #[must_use]
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss { .. })
    }

    /// Returns `true` if the circuit breaker rejected the call.
    #[must_use]
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, Self::BreakerOpen { .. })
    }

    /// Returns `true` if this is an unsupported job type error.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::JobUnsupported { .. })
    }

    /// Returns `true` if repeating the operation later may succeed.
    ///
    /// `BreakerOpen` is transient: the breaker admits a trial call once its
    /// timeout has elapsed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::BreakerOpen { .. } | Self::Queue { .. }
        )
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Miss { .. } => ErrorCategory::Miss,
            Self::Unavailable { .. } | Self::Queue { .. } => ErrorCategory::Backend,
            Self::BreakerOpen { .. } => ErrorCategory::Rejected,
            Self::JobUnsupported { .. } => ErrorCategory::Unsupported,
            Self::Serialization { .. } => ErrorCategory::Serialization,
            Self::InvalidConfig { .. } => ErrorCategory::Configuration,
        }
    }
}

/// Coarse error classification used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Miss,
    Backend,
    Rejected,
    Unsupported,
    Serialization,
    Configuration,
}

impl ErrorCategory {
    /// Label value for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Miss => "miss",
            Self::Backend => "backend",
            Self::Rejected => "rejected",
            Self::Unsupported => "unsupported",
            Self::Serialization => "serialization",
            Self::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<CircuitOpen> for CacheError {
    fn from(open: CircuitOpen) -> Self {
        Self::BreakerOpen {
            retry_after: open.retry_after,
        }
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        Self::unavailable(format!("redis error: {err}"))
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::unavailable(format!("failed to get Redis connection: {err}"))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for CacheError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CacheError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_open_is_retryable() {
        let err = CacheError::from(CircuitOpen {
            retry_after: Duration::from_millis(40),
        });
        assert!(err.is_breaker_open());
        assert!(err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::Rejected);
    }

    #[test]
    fn test_unsupported_message_names_mode() {
        let err = CacheError::job_unsupported(JobType::Eviction, WarmingMode::Legacy);
        assert!(err.is_unsupported());
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "eviction jobs are not supported in legacy mode"
        );
    }

    #[test]
    fn test_miss_is_distinct_from_failure() {
        let miss = CacheError::miss("user:1");
        assert!(miss.is_miss());
        assert_eq!(miss.category(), ErrorCategory::Miss);
        assert!(!CacheError::unavailable("down").is_miss());
    }
}
