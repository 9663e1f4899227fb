//! Retry with exponential backoff for source reads.
//!
//! Pages fetched from the source store are retried when the failure looks
//! transient (timeouts, resets, 5xx, rate limits). Writes to the target are
//! not retried here: they run inside the migration transaction, and a lost
//! connection takes the transaction with it.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Retry settings as they appear in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrySettings {
    /// Maximum number of retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter.
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Creates a config with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Calculates the delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);

        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.add_jitter {
            capped_delay + capped_delay * 0.25 * rand_jitter()
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }

    /// Delay before retrying after `error`; honours a rate-limit hint up to `max_delay`.
    fn delay_after(&self, attempt: u32, error: &Error) -> Duration {
        let backoff = self.delay_for_attempt(attempt);
        match error {
            Error::RateLimit(secs) => backoff.max(Duration::from_secs(*secs).min(self.max_delay)),
            _ => backoff,
        }
    }
}

/// Pseudo-random jitter in `[0, 1)` from the clock's sub-second nanos.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Determines if an error is retryable.
///
/// Only transport-level failures qualify. Errors describing a single row
/// (decode failures, key conflicts) are never retried even when their text
/// happens to contain something that looks like a status code.
pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::RateLimit(_) | Error::Io(_) => true,
        Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        #[cfg(feature = "postgres")]
        Error::Database(e) => matches!(
            e,
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
        ),
        Error::SourceConnection(msg) | Error::Extraction(msg) => is_retryable_message(msg),
        _ => false,
    }
}

fn is_retryable_message(message: &str) -> bool {
    let msg = message.to_lowercase();

    let is_rate_limit =
        msg.contains("429") || msg.contains("rate limit") || msg.contains("too many requests");

    let is_transient = msg.contains("timeout")
        || msg.contains("connection refused")
        || msg.contains("connection reset")
        || msg.contains("temporary");

    let is_server_error = ["500", "502", "503", "504"]
        .iter()
        .any(|code| msg.contains(code))
        || msg.contains("internal server error")
        || msg.contains("bad gateway")
        || msg.contains("service unavailable");

    is_rate_limit || is_transient || is_server_error
}

/// Executes an async operation, retrying transient failures.
///
/// Returns the first success, the first non-retryable error, or the last
/// error once `max_retries` is exhausted.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("{}: succeeded after {} retries", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) if is_retryable_error(&e) && attempt < config.max_retries => {
                attempt += 1;
                let delay = config.delay_after(attempt, &e);
                warn!(
                    "{}: retryable error (attempt {}/{}), waiting {:?}: {}",
                    operation_name,
                    attempt,
                    config.max_retries + 1,
                    delay,
                    e
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            add_jitter: false,
        }
    }

    #[test]
    fn test_settings_defaults_from_yaml() {
        let settings: RetrySettings = serde_yaml::from_str("max_retries: 7").unwrap();
        assert_eq!(settings.max_retries, 7);
        assert_eq!(settings.initial_delay_ms, 500);
        assert_eq!(settings.max_delay_ms, 30_000);
    }

    #[test]
    fn test_config_from_settings() {
        let config = RetryConfig::from(&RetrySettings {
            max_retries: 2,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
        });
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.initial_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_delay_for_attempt_exponential() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(100),
            add_jitter: false,
            ..RetryConfig::default()
        };

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(10),
            backoff_multiplier: 10.0,
            max_delay: Duration::from_secs(30),
            add_jitter: false,
            ..RetryConfig::default()
        };
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(30));
    }

    #[test]
    fn test_rate_limit_hint_is_capped() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(2),
            add_jitter: false,
            ..RetryConfig::default()
        };
        assert_eq!(
            config.delay_after(1, &Error::RateLimit(60)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_retryable_messages() {
        for msg in [
            "HTTP 429 Too Many Requests",
            "Connection timeout after 30s",
            "MongoDB error 503: Service Unavailable",
            "connection reset by peer",
        ] {
            assert!(
                is_retryable_error(&Error::SourceConnection(msg.to_string())),
                "{msg}"
            );
        }
    }

    #[test]
    fn test_not_retryable() {
        assert!(!is_retryable_error(&Error::Authentication(
            "HTTP 401 Unauthorized".to_string()
        )));
        assert!(!is_retryable_error(&Error::SourceConnection(
            "HTTP 404 Not Found".to_string()
        )));
        assert!(!is_retryable_error(&Error::Config("bad".to_string())));
    }

    #[test]
    fn test_row_errors_never_retry_even_with_status_like_text() {
        let err = Error::Decode {
            collection: "things",
            reason: "thing '503' has no user".to_string(),
        };
        assert!(!is_retryable_error(&err));
    }

    #[test]
    fn test_io_error_is_retryable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(is_retryable_error(&Error::Io(io_err)));
    }

    #[tokio::test]
    async fn test_with_retry_success_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_retry(&fast_config(3), "page", || {
            let count = counter.clone();
            async move {
                if count.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::SourceConnection("HTTP 502 Bad Gateway".to_string()))
                } else {
                    Ok::<_, Error>("page")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "page");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = with_retry(&fast_config(2), "page", || {
            let count = counter.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err(Error::SourceConnection("connection refused".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_non_retryable_error_no_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = with_retry(&fast_config(5), "page", || {
            let count = counter.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err(Error::Authentication("HTTP 401 Unauthorized".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Authentication(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
