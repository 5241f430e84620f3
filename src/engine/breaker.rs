//! Circuit breaker guarding workflow dispatch
//!
//! Three states. Closed counts failures and trips at the threshold; Open
//! rejects until the cooldown elapses, then admits exactly one HalfOpen
//! probe; the probe's outcome closes or re-opens the breaker.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker state. Gauge encoding: 0 closed, 1 open, 2 half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn gauge_value(&self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => f.write_str("closed"),
            BreakerState::Open => f.write_str("open"),
            BreakerState::HalfOpen => f.write_str("half-open"),
        }
    }
}

struct Inner {
    state: BreakerState,
    failures: u32,
    last_tripped: Option<Instant>,
    probe_in_flight: bool,
}

type StateChangeFn = Box<dyn Fn(BreakerState) + Send + Sync>;

pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
    on_change: Option<StateChangeFn>,
}

impl CircuitBreaker {
    pub const DEFAULT_THRESHOLD: u32 = 3;
    pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                last_tripped: None,
                probe_in_flight: false,
            }),
            on_change: None,
        }
    }

    /// Invoke `f` on every state change. Called under the lock, so keep it
    /// cheap and non-reentrant.
    pub fn with_on_change(mut self, f: impl Fn(BreakerState) + Send + Sync + 'static) -> Self {
        self.on_change = Some(Box::new(f));
        self
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        if inner.state != to {
            inner.state = to;
            if let Some(f) = &self.on_change {
                f(to);
            }
        }
    }

    /// Whether a call may proceed. In HalfOpen only the single probe is
    /// admitted; concurrent callers are rejected.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = inner
                    .last_tripped
                    .map_or(true, |at| at.elapsed() > self.cooldown);
                if cooled {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => inner.failures = 0,
            BreakerState::HalfOpen => {
                inner.failures = 0;
                inner.probe_in_flight = false;
                self.transition(&mut inner, BreakerState::Closed);
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.threshold {
                    inner.last_tripped = Some(Instant::now());
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.last_tripped = Some(Instant::now());
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD, Self::DEFAULT_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_open_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        assert!(breaker.allow());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn success_resets_closed_counter() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.allow()); // the probe
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(!breaker.allow()); // concurrent caller rejected

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn failed_probe_reopens_with_fresh_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn on_change_fires_per_transition() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let changes = Arc::new(AtomicUsize::new(0));
        let seen = changes.clone();
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0))
            .with_on_change(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });

        breaker.record_failure(); // closed -> open
        std::thread::sleep(Duration::from_millis(5));
        breaker.allow(); // open -> half-open
        breaker.record_success(); // half-open -> closed
        assert_eq!(changes.load(Ordering::SeqCst), 3);
    }
}
