//! Per-camera circuit breaker with exponential backoff.
//!
//! Wraps every capture attempt. After `max_failures` consecutive failures the
//! breaker opens and rejects calls until the current backoff has elapsed; a
//! half-open probe window then requires `required_successes` consecutive
//! successes to close again.

use parking_lot::Mutex;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

const REQUIRED_HALF_OPEN_SUCCESSES: u32 = 3;
const MIN_INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(600);
const BACKOFF_MULTIPLIER: u32 = 2;

/// Breaker state with per-state data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed {
        failures: u32,
    },
    Open {
        opened_at: Instant,
        /// How long this open period lasts before a half-open probe.
        wait: Duration,
    },
    HalfOpen {
        successes: u32,
    },
}

impl BreakerState {
    pub fn name(&self) -> &'static str {
        match self {
            BreakerState::Closed { .. } => "closed",
            BreakerState::Open { .. } => "open",
            BreakerState::HalfOpen { .. } => "half_open",
        }
    }

    /// Numeric encoding for the state gauge (0=closed, 1=open, 2=half-open).
    pub fn as_gauge(&self) -> i64 {
        match self {
            BreakerState::Closed { .. } => 0,
            BreakerState::Open { .. } => 1,
            BreakerState::HalfOpen { .. } => 2,
        }
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The breaker is open; the wrapped operation was not attempted.
    #[error("circuit breaker {name} is open")]
    Open { name: String },

    /// The wrapped operation ran and failed; its error is propagated
    /// unchanged.
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }
}

/// Breaker statistics snapshot.
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub total_successes: u64,
    pub total_failures: u64,
    pub current_backoff: Duration,
    pub time_until_retry: Duration,
}

struct Inner {
    state: BreakerState,
    // Backoff to apply at the NEXT opening; doubles on each opening, resets
    // on close.
    current_backoff: Duration,
    total_successes: u64,
    total_failures: u64,
    last_transition: Instant,
}

/// Three-state failure gate guarding one camera's capture path.
pub struct CircuitBreaker {
    name: String,
    max_failures: u32,
    required_successes: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, max_failures: u32, reset_timeout: Duration) -> Self {
        let initial_backoff = (reset_timeout / 2).max(MIN_INITIAL_BACKOFF);
        Self {
            name: name.into(),
            max_failures: max_failures.max(1),
            required_successes: REQUIRED_HALF_OPEN_SUCCESSES,
            initial_backoff,
            max_backoff: MAX_BACKOFF,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed { failures: 0 },
                current_backoff: initial_backoff,
                total_successes: 0,
                total_failures: 0,
                last_transition: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a call may proceed. An expired open period transitions to
    /// half-open and admits the probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed { .. } | BreakerState::HalfOpen { .. } => true,
            BreakerState::Open { opened_at, wait } => {
                if opened_at.elapsed() >= wait {
                    self.transition(&mut inner, BreakerState::HalfOpen { successes: 0 });
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Run `f` under the breaker. Rejects synchronously with
    /// [`CircuitError::Open`] when not allowed; otherwise records the outcome
    /// and propagates `f`'s error unchanged.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.allow() {
            return Err(CircuitError::Open {
                name: self.name.clone(),
            });
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(CircuitError::Inner(err))
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;

        match inner.state {
            BreakerState::Closed { .. } => {
                inner.state = BreakerState::Closed { failures: 0 };
            }
            BreakerState::HalfOpen { successes } => {
                let successes = successes + 1;
                if successes >= self.required_successes {
                    inner.current_backoff = self.initial_backoff;
                    self.transition(&mut inner, BreakerState::Closed { failures: 0 });
                } else {
                    inner.state = BreakerState::HalfOpen { successes };
                }
            }
            BreakerState::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;

        match inner.state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.max_failures {
                    self.open(&mut inner);
                } else {
                    inner.state = BreakerState::Closed { failures };
                }
            }
            BreakerState::HalfOpen { .. } => {
                self.open(&mut inner);
            }
            BreakerState::Open { .. } => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        let time_until_retry = match inner.state {
            BreakerState::Open { opened_at, wait } => wait.saturating_sub(opened_at.elapsed()),
            _ => Duration::ZERO,
        };
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            current_backoff: inner.current_backoff,
            time_until_retry,
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.current_backoff = self.initial_backoff;
        self.transition(&mut inner, BreakerState::Closed { failures: 0 });
    }

    // The open period uses the backoff accumulated so far; the stored value
    // doubles (clamped) for the next opening.
    fn open(&self, inner: &mut Inner) {
        let wait = inner.current_backoff;
        inner.current_backoff = (wait * BACKOFF_MULTIPLIER).min(self.max_backoff);
        self.transition(
            inner,
            BreakerState::Open {
                opened_at: Instant::now(),
                wait,
            },
        );
    }

    fn transition(&self, inner: &mut Inner, new_state: BreakerState) {
        if inner.state.name() != new_state.name() {
            info!(
                breaker = %self.name,
                from = inner.state.name(),
                to = new_state.name(),
                next_backoff_secs = inner.current_backoff.as_secs(),
                "circuit breaker state changed"
            );
            inner.last_transition = Instant::now();
        }
        inner.state = new_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_breaker(max_failures: u32) -> CircuitBreaker {
        CircuitBreaker::new("cam-test", max_failures, Duration::from_secs(60))
    }

    fn force_open_elapsed(breaker: &CircuitBreaker) {
        // Rewind the open period so the next allow() admits a probe.
        let mut inner = breaker.inner.lock();
        if let BreakerState::Open { wait, .. } = inner.state {
            inner.state = BreakerState::Open {
                opened_at: Instant::now() - wait,
                wait,
            };
        }
    }

    #[test]
    fn test_closed_allows_and_success_resets_failures() {
        let breaker = create_breaker(3);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow());
        assert!(matches!(
            breaker.state(),
            BreakerState::Closed { failures: 2 }
        ));
    }

    #[test]
    fn test_opens_after_max_failures() {
        let breaker = create_breaker(5);
        for _ in 0..4 {
            breaker.record_failure();
            assert!(breaker.allow());
        }
        breaker.record_failure();
        assert!(matches!(breaker.state(), BreakerState::Open { .. }));
        assert!(!breaker.allow());
    }

    #[test]
    fn test_first_open_waits_initial_backoff() {
        let breaker = create_breaker(1);
        breaker.record_failure();
        match breaker.state() {
            BreakerState::Open { wait, .. } => {
                assert_eq!(wait, Duration::from_secs(30));
            }
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[test]
    fn test_half_open_failure_doubles_backoff() {
        let breaker = create_breaker(1);
        breaker.record_failure();
        force_open_elapsed(&breaker);
        assert!(breaker.allow());
        assert!(matches!(breaker.state(), BreakerState::HalfOpen { .. }));

        breaker.record_failure();
        match breaker.state() {
            BreakerState::Open { wait, .. } => {
                assert_eq!(wait, Duration::from_secs(60));
            }
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[test]
    fn test_backoff_clamped_at_max() {
        let breaker = create_breaker(1);
        for _ in 0..12 {
            breaker.record_failure();
            force_open_elapsed(&breaker);
            assert!(breaker.allow());
        }
        breaker.record_failure();
        match breaker.state() {
            BreakerState::Open { wait, .. } => assert!(wait <= MAX_BACKOFF),
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[test]
    fn test_half_open_closes_after_required_successes() {
        let breaker = create_breaker(1);
        breaker.record_failure();
        force_open_elapsed(&breaker);
        assert!(breaker.allow());

        breaker.record_success();
        breaker.record_success();
        assert!(matches!(
            breaker.state(),
            BreakerState::HalfOpen { successes: 2 }
        ));

        breaker.record_success();
        assert!(matches!(breaker.state(), BreakerState::Closed { .. }));
        // Backoff reset: next open waits the initial value again.
        assert_eq!(breaker.stats().current_backoff, Duration::from_secs(30));
    }

    #[test]
    fn test_initial_backoff_floor() {
        let breaker = CircuitBreaker::new("floor", 1, Duration::from_secs(4));
        assert_eq!(breaker.initial_backoff, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_call_rejects_when_open() {
        let breaker = create_breaker(1);
        let result: Result<(), _> = breaker
            .call(|| async { Err::<(), _>(std::io::Error::other("boom")) })
            .await;
        assert!(matches!(result, Err(CircuitError::Inner(_))));

        let result = breaker.call(|| async { Ok::<_, std::io::Error>(42) }).await;
        match result {
            Err(err) => assert!(err.is_open()),
            Ok(_) => panic!("expected rejection while open"),
        }
    }

    #[tokio::test]
    async fn test_call_propagates_inner_error_unchanged() {
        let breaker = create_breaker(5);
        let result: Result<(), _> = breaker
            .call(|| async { Err::<(), _>(std::io::Error::other("decode failed")) })
            .await;
        match result {
            Err(CircuitError::Inner(err)) => {
                assert_eq!(err.to_string(), "decode failed");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
