use std::time::Duration;

use strata_config::RetryConfig;

use super::{BackendError, BackendResult};
use crate::{EngineError, Result};

/// Exponential backoff with jitter for transient backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
            retry_max_delay_ms: config.retry_max_delay_ms,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts; for tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            retry_delay_ms: 0,
            retry_max_delay_ms: 0,
        }
    }
}

/// Run `f`, retrying transient failures up to `policy.max_retries` times.
///
/// Permanent errors are returned at once as [`EngineError::Backend`];
/// running out of retries yields [`EngineError::TransientBackend`].
pub fn with_retry<T>(
    policy: &RetryPolicy,
    operation: &'static str,
    name: &str,
    mut f: impl FnMut() -> BackendResult<T>,
) -> Result<T> {
    let mut delay_ms = policy.retry_delay_ms;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 && delay_ms > 0 {
            let jitter = rand::random::<u64>() % delay_ms.max(1);
            std::thread::sleep(Duration::from_millis(delay_ms + jitter));
            delay_ms = (delay_ms * 2).min(policy.retry_max_delay_ms);
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                tracing::warn!(
                    "{operation} {name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    policy.max_retries,
                );
            }
            Err(e) if e.is_transient() => {
                return Err(EngineError::TransientBackend {
                    operation,
                    name: name.to_string(),
                    attempts: attempt + 1,
                    source: e,
                });
            }
            Err(e) => return Err(EngineError::Backend(e)),
        }
    }
    // max_retries + 1 attempts always end in one of the returns above.
    Err(EngineError::Backend(BackendError::InvalidTarget(format!(
        "{operation} {name}: retry loop exhausted"
    ))))
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn timeout() -> BackendError {
        BackendError::Transient(io::Error::new(io::ErrorKind::TimedOut, "slow"))
    }

    #[test]
    fn test_recovers_after_transient_failures() {
        let mut calls = 0;
        let value = with_retry(&RetryPolicy::immediate(3), "put", "v1", || {
            calls += 1;
            if calls < 3 {
                Err(timeout())
            } else {
                Ok(42)
            }
        })
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_exhaustion_reports_attempts() {
        let mut calls = 0;
        let err = with_retry(&RetryPolicy::immediate(2), "put", "v1", || -> BackendResult<()> {
            calls += 1;
            Err(timeout())
        })
        .unwrap_err();
        assert_eq!(calls, 3);
        match err {
            EngineError::TransientBackend { attempts, operation, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(operation, "put");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_permanent_errors_are_not_retried() {
        let mut calls = 0;
        let err = with_retry(&RetryPolicy::immediate(5), "get", "v1", || -> BackendResult<()> {
            calls += 1;
            Err(BackendError::NotFound("v1".into()))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, EngineError::Backend(BackendError::NotFound(_))));
    }

    #[test]
    fn test_retryable_io_kinds() {
        assert!(is_retryable_io(&io::Error::new(io::ErrorKind::ConnectionReset, "r")));
        assert!(!is_retryable_io(&io::Error::new(io::ErrorKind::NotFound, "n")));
    }
}
