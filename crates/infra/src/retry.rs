//! Bounded retry for lock contention.
//!
//! A contended unit of work (row lock timeout, deadlock, serialization
//! failure) has already rolled back, so it is replayed from scratch. Replays
//! back off exponentially up to a cap, and each pause is drawn from the upper
//! half of the current ceiling so two writers that deadlocked against each
//! other do not wake up in lockstep.

use std::future::Future;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::error::ServiceResult;

/// How often, and how patiently, contended units of work are replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Replays after the first attempt; 0 disables retrying.
    pub max_retries: u32,
    /// Pause ceiling before the first replay; doubles per further replay.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Same ceiling for every replay.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::new(max_retries, delay, delay)
    }

    /// Upper bound of the pause before replay number `replay` (1-indexed).
    fn ceiling(&self, replay: u32) -> Duration {
        let factor = 1u32
            .checked_shl(replay.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Pause in `[ceiling / 2, ceiling]`, spread by the random tail of a v7 uuid.
    fn pause(&self, replay: u32) -> Duration {
        let ceiling = self.ceiling(replay);
        let floor = ceiling / 2;
        let spread = u32::from(Uuid::now_v7().as_bytes()[15]);
        floor + (ceiling - floor).saturating_mul(spread) / 255
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy
/// is exhausted. Each attempt must open its own unit of work.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> ServiceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<T>>,
{
    let mut replay = 0u32;
    loop {
        match op().await {
            Err(err) if err.is_retryable() && replay < policy.max_retries => {
                replay += 1;
                let pause = policy.pause(replay);
                warn!(
                    operation,
                    replay,
                    pause_ms = pause.as_millis() as u64,
                    error = %err,
                    "contention, replaying unit of work"
                );
                tokio::time::sleep(pause).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use stockledger_core::DomainError;

    use super::*;
    use crate::error::ServiceError;
    use crate::store::StoreError;

    #[test]
    fn pause_ceiling_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10), Duration::from_millis(35));
        assert_eq!(policy.ceiling(1), Duration::from_millis(10));
        assert_eq!(policy.ceiling(2), Duration::from_millis(20));
        assert_eq!(policy.ceiling(3), Duration::from_millis(35));
        assert_eq!(policy.ceiling(64), Duration::from_millis(35));
    }

    #[test]
    fn pauses_stay_in_the_upper_half_of_the_ceiling() {
        let policy = RetryPolicy::new(5, Duration::from_millis(40), Duration::from_secs(1));
        for replay in 1..=5 {
            let ceiling = policy.ceiling(replay);
            let pause = policy.pause(replay);
            assert!(pause >= ceiling / 2 && pause <= ceiling, "{pause:?} vs {ceiling:?}");
        }
        assert_eq!(RetryPolicy::fixed(1, Duration::ZERO).pause(1), Duration::ZERO);
    }

    #[tokio::test]
    async fn retries_contention_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));

        let out = with_retry(&policy, "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ServiceError::from(StoreError::Contention("lock timeout".into())))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(2, Duration::from_millis(1));

        let err = with_retry(&policy, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ServiceError::from(StoreError::Contention("deadlock".into())))
        })
        .await
        .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn business_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let _ = with_retry(&policy, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ServiceError::from(DomainError::validation("quantity")))
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
