use std::time::Duration;

use thiserror::Error;

/// Outcome classification for a single remote call.
///
/// Decided once inside the client so downstream code never re-interprets raw
/// transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The remote service answered "too many requests". `retry_after` is the
    /// server-indicated delay when one was sent.
    #[error("rate limited by remote{}", fmt_retry_after(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// Network failure, timeout, or an unexpected status. Retryable.
    #[error("transient error: {0}")]
    Transient(String),

    /// The entity does not exist remotely. Terminal.
    #[error("entity not found")]
    NotFound,

    /// The request itself was rejected. Terminal.
    #[error("validation error: {0}")]
    Validation(String),
}

fn fmt_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}

impl CallError {
    /// `true` for outcomes that a retry could plausibly fix.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(CallError::Transient("reset".into()).is_retryable());
        assert!(CallError::RateLimited { retry_after: None }.is_retryable());
        assert!(!CallError::NotFound.is_retryable());
        assert!(!CallError::Validation("bad id".into()).is_retryable());
    }

    #[test]
    fn rate_limited_display_includes_delay() {
        let err = CallError::RateLimited {
            retry_after: Some(Duration::from_secs(120)),
        };
        assert_eq!(err.to_string(), "rate limited by remote (retry after 120s)");
        let err = CallError::RateLimited { retry_after: None };
        assert_eq!(err.to_string(), "rate limited by remote");
    }
}
