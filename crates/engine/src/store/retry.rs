//! Bounded exponential backoff for transient store contention.

use rand::Rng;
use std::time::{Duration, Instant};

use crate::types::EngineError;

/// Backoff policy: 50 ms initial, doubling with ~10% jitter, capped at 2 s
/// per interval and 10 s total elapsed.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: 0.1,
            max_interval: Duration::from_secs(2),
            max_elapsed: Duration::from_secs(10),
        }
    }
}

/// Mutable backoff state for one operation.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    next_interval: Duration,
    started: Instant,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            policy: policy.clone(),
            next_interval: policy.initial_interval,
            started: Instant::now(),
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The delay to sleep before the next attempt, or `None` once the
    /// elapsed budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.started.elapsed() >= self.policy.max_elapsed {
            return None;
        }
        self.attempts += 1;

        let base = self.next_interval;
        let jittered = apply_jitter(base, self.policy.jitter);

        let scaled = base.as_secs_f64() * self.policy.multiplier;
        self.next_interval = Duration::from_secs_f64(scaled).min(self.policy.max_interval);

        // Never sleep past the elapsed budget.
        let remaining = self.policy.max_elapsed.saturating_sub(self.started.elapsed());
        Some(jittered.min(remaining))
    }
}

fn apply_jitter(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    let spread = base.as_secs_f64() * jitter;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
}

/// Run `op` with exponential backoff on retryable errors. The closure runs to
/// completion exactly once on success; on a retryable failure it may have run
/// and rolled back several times; on a permanent failure it ran at most once
/// more than the retryable attempts before it.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, EngineError>>,
{
    let mut backoff = Backoff::new(policy);
    loop {
        match op().await {
            Err(e) if e.is_retryable() => match backoff.next_delay() {
                Some(delay) => {
                    tracing::debug!(
                        code = e.code(),
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "transient store error; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::warn!(code = e.code(), "retry budget exhausted");
                    return Err(e);
                }
            },
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn busy_error() -> EngineError {
        EngineError::Storage(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy,
                extended_code: rusqlite::ffi::SQLITE_BUSY,
            },
            Some("database is locked".into()),
        ))
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            multiplier: 2.0,
            jitter: 0.0,
            max_interval: Duration::from_millis(4),
            max_elapsed: Duration::from_millis(200),
        }
    }

    #[test]
    fn intervals_double_up_to_cap() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        let mut backoff = Backoff::new(&policy);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(50)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&fast_policy(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(busy_error())
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(&fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::validation("nope")) }
        })
        .await;
        assert!(matches!(result, Err(EngineError::Validation { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_last_error() {
        let result: Result<(), _> = with_backoff(&fast_policy(), || async { Err(busy_error()) }).await;
        assert!(matches!(result, Err(ref e) if e.code() == "BUSY"));
    }
}
