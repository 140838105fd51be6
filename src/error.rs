//! Vedrfolnir error types

use std::time::Duration;

/// Vedrfolnir error types.
///
/// Cloneable: a single provider outcome is delivered to every subscriber of
/// a batch, so the error has to be copied once per waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ThrottlerError {
    // Provider/network errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Provider answered with HTTP 429 (or an equivalent signal).
    #[error("rate limit reached, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authentication failed")]
    AuthenticationFailed,

    // Retry bookkeeping
    #[error("maximum retry count exceeded ({attempts} of {max} attempts)")]
    MaxRetryCountExceeded { attempts: u32, max: u32 },

    #[error("maximum task lifetime exceeded ({lifetime:?})")]
    MaxTaskLifetimeExceeded { lifetime: Duration },

    /// Caller-side wait elapsed. The underlying batch keeps running.
    #[error("timed out after {0:?} waiting for task result")]
    Timeout(Duration),

    /// Any other failure raised by a task's `create`.
    #[error("task failed: {0}")]
    Task(String),

    // Registration errors
    #[error("task not registered: {0}")]
    TaskNotRegistered(String),

    #[error("task already registered: {0}")]
    DuplicateTask(String),

    #[error("task registered with different parameter/output types: {0}")]
    TaskTypeMismatch(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The throttler was stopped (or the result sink dropped) before the
    /// request could be executed.
    #[error("throttler stopped")]
    Stopped,
}

impl ThrottlerError {
    /// Whether this error is a provider-side rate-limit rejection.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ThrottlerError::RateLimited { .. })
    }

    /// Provider-supplied retry-after hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ThrottlerError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Whether this error terminated a retry sequence.
    pub fn is_terminal_retry(&self) -> bool {
        matches!(
            self,
            ThrottlerError::MaxRetryCountExceeded { .. }
                | ThrottlerError::MaxTaskLifetimeExceeded { .. }
        )
    }
}

impl From<reqwest::Error> for ThrottlerError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            ThrottlerError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ThrottlerError::Http(err.to_string())
        }
    }
}

/// Result type alias for Vedrfolnir operations
pub type Result<T> = std::result::Result<T, ThrottlerError>;
