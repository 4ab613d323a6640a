use std::io;
use std::path::Path;
use std::time::Duration;

use traffic_core::config::StorageConfig;
use traffic_core::{TrafficError, TrafficResult};
use tracing::warn;

/// Bounded retry with exponential backoff for filesystem operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Run `f` until it succeeds or the attempts are exhausted. The final
    /// failure is reported as [`TrafficError::Storage`].
    ///
    /// The backoff sleeps the calling thread; storage calls are synchronous
    /// and short, and only failing attempts pay for it.
    pub fn run<T>(
        &self,
        op: &'static str,
        path: &Path,
        mut f: impl FnMut() -> io::Result<T>,
    ) -> TrafficResult<T> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    metrics::counter!("traffic.storage_retries").increment(1);
                    warn!(
                        op,
                        path = %path.display(),
                        attempt,
                        error = %e,
                        "Storage operation failed, retrying"
                    );
                    std::thread::sleep(self.backoff * 2u32.saturating_pow(attempt - 1));
                    attempt += 1;
                }
                Err(e) => return Err(TrafficError::storage(op, path, e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let result = fast_policy(3).run("write", Path::new("x"), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(io::Error::new(io::ErrorKind::Other, "transient"))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_exhaustion_is_storage_error() {
        let calls = Cell::new(0);
        let result: TrafficResult<()> = fast_policy(3).run("write", Path::new("x"), || {
            calls.set(calls.get() + 1);
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
        });
        assert!(matches!(result, Err(TrafficError::Storage { op: "write", .. })));
        assert_eq!(calls.get(), 3);
    }
}
