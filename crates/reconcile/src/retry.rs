//! Bounded retry for optimistic-concurrency conflicts.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tracing::debug;

/// Exponential backoff with a fixed number of attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub steps: u32,
    pub initial: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { steps: 4, initial: Duration::from_millis(10), factor: 5.0 }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(steps: u32) -> Self { Self { steps, initial: Duration::ZERO, factor: 1.0 } }

    /// The sleeps taken between attempts, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let factor = if self.factor.is_finite() && self.factor > 0.0 { self.factor } else { 1.0 };
        std::iter::successors(Some(self.initial), move |d| Some(d.mul_f64(factor)))
            .take(self.steps.saturating_sub(1) as usize)
    }
}

/// Run `op` until it succeeds, fails with a non-conflict error, or the policy runs out.
///
/// `op` must perform the whole read-merge-write cycle; it is called again from scratch
/// after every conflict. On exhaustion the last conflict is returned.
pub async fn retry_on_conflict<T, E, F, Fut, P>(policy: &RetryPolicy, is_conflict: P, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut delays = policy.delays();
    let mut attempt = 1u32;
    loop {
        match op().await {
            Err(e) if is_conflict(&e) => match delays.next() {
                Some(delay) => {
                    counter!("gatex_conflict_retries_total", 1u64);
                    debug!(attempt, ?delay, "write conflict; re-running read-merge-write");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(e),
            },
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum E { Conflict, Boom }

    #[test]
    fn default_delays_grow_by_factor() {
        let d: Vec<_> = RetryPolicy::default().delays().collect();
        assert_eq!(d, vec![Duration::from_millis(10), Duration::from_millis(50), Duration::from_millis(250)]);
        assert_eq!(RetryPolicy::immediate(1).delays().count(), 0);
        assert_eq!(RetryPolicy::immediate(0).delays().count(), 0);
    }

    #[tokio::test]
    async fn succeeds_after_conflicts() {
        let calls = AtomicU32::new(0);
        let res: Result<u32, E> = retry_on_conflict(&RetryPolicy::immediate(4), |e| *e == E::Conflict, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 { Err(E::Conflict) } else { Ok(n) }
        })
        .await;
        assert_eq!(res, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_conflict() {
        let calls = AtomicU32::new(0);
        let res: Result<(), E> = retry_on_conflict(&RetryPolicy::immediate(3), |e| *e == E::Conflict, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(E::Conflict)
        })
        .await;
        assert_eq!(res, Err(E::Conflict));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let res: Result<(), E> = retry_on_conflict(&RetryPolicy::immediate(5), |e| *e == E::Conflict, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(E::Boom)
        })
        .await;
        assert_eq!(res, Err(E::Boom));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
