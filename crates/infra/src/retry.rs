//! Bounded retry with exponential backoff for transient failures.

use std::time::Duration;

use tracing::warn;

use medipaw_core::{DomainError, DomainResult};

/// How hard to try before escalating a transient failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(25),
        }
    }
}

/// Run `op`, retrying only [`DomainError::Transient`] failures.
///
/// Deterministic errors (validation, conflicts, security) surface
/// immediately; a transient error that survives all attempts is returned
/// as-is for the caller to escalate.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    mut op: impl FnMut() -> DomainResult<T>,
) -> DomainResult<T> {
    let mut delay = policy.base_delay;
    let mut attempt = 1;

    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.attempts => {
                warn!(attempt, %err, "transient failure, backing off");
                std::thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&quick_policy(), || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DomainError::transient("blip"))
            } else {
                Ok(42)
            }
        });

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: DomainResult<()> = with_retry(&quick_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DomainError::transient("still down"))
        });

        assert!(matches!(result, Err(DomainError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn deterministic_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: DomainResult<()> = with_retry(&quick_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DomainError::conflict("lost the race"))
        });

        assert!(matches!(result, Err(DomainError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
