//! Rolling per-provider health tracking
//!
//! Every dispatch outcome and prober probe feeds one state machine per
//! provider:
//!
//! ```text
//! healthy --3 consecutive errors--> degraded
//! degraded --10 consecutive errors or 429 cooldown--> down
//! down --first success after cooldown--> degraded
//! degraded --5 consecutive successes--> healthy
//! ```
//!
//! Latency is an exponentially weighted moving average (alpha = 0.2) the
//! routing engine reads when filtering and scoring candidates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::models::{HealthLevel, HealthState};

use super::events::{Event, EventBus, EventKind};

const EWMA_ALPHA: f64 = 0.2;
const DEGRADE_AFTER_ERRORS: u32 = 3;
const DOWN_AFTER_ERRORS: u32 = 10;
const RECOVER_AFTER_SUCCESSES: u32 = 5;

pub struct HealthTracker {
    states: Mutex<HashMap<String, HealthState>>,
    bus: Arc<EventBus>,
}

impl HealthTracker {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            bus,
        }
    }

    pub fn record_success(&self, provider_id: &str, latency_ms: u64) {
        let mut states = self.states.lock().expect("health lock poisoned");
        let state = states.entry(provider_id.to_string()).or_default();
        let before = state.level;
        let now = Utc::now();

        state.consec_errors = 0;
        state.consec_successes += 1;
        state.last_success_at = Some(now);
        state.rolling_avg_latency_ms = if state.rolling_avg_latency_ms == 0.0 {
            latency_ms as f64
        } else {
            EWMA_ALPHA * latency_ms as f64 + (1.0 - EWMA_ALPHA) * state.rolling_avg_latency_ms
        };

        match state.level {
            HealthLevel::Down => {
                let cooled = state.cooldown_until.map_or(true, |until| now >= until);
                if cooled {
                    state.level = HealthLevel::Degraded;
                    state.consec_successes = 1;
                    state.cooldown_until = None;
                }
            }
            HealthLevel::Degraded => {
                if state.consec_successes >= RECOVER_AFTER_SUCCESSES {
                    state.level = HealthLevel::Healthy;
                }
            }
            HealthLevel::Healthy => {}
        }

        let after = state.level;
        drop(states);
        self.emit_change(provider_id, before, after);
    }

    /// Record a failed call. A 429-driven cooldown forces the provider down
    /// until the cooldown elapses.
    pub fn record_failure(&self, provider_id: &str, error: &str, cooldown: Option<Duration>) {
        let mut states = self.states.lock().expect("health lock poisoned");
        let state = states.entry(provider_id.to_string()).or_default();
        let before = state.level;
        let now = Utc::now();

        state.consec_successes = 0;
        state.consec_errors += 1;
        state.last_error = Some(error.to_string());
        state.last_error_at = Some(now);

        if let Some(cooldown) = cooldown {
            state.cooldown_until = Some(
                now + chrono::Duration::from_std(cooldown)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            );
        }

        match state.level {
            HealthLevel::Healthy => {
                if state.consec_errors >= DEGRADE_AFTER_ERRORS {
                    state.level = HealthLevel::Degraded;
                }
            }
            HealthLevel::Degraded => {
                if state.consec_errors >= DOWN_AFTER_ERRORS || cooldown.is_some() {
                    state.level = HealthLevel::Down;
                }
            }
            HealthLevel::Down => {}
        }

        let after = state.level;
        drop(states);
        self.emit_change(provider_id, before, after);
    }

    fn emit_change(&self, provider_id: &str, before: HealthLevel, after: HealthLevel) {
        if before != after {
            info!(provider = provider_id, from = %before, to = %after, "provider health changed");
            self.bus.publish(Event::new(
                EventKind::HealthChanged,
                serde_json::json!({
                    "provider_id": provider_id,
                    "from": before.as_str(),
                    "to": after.as_str(),
                }),
            ));
        }
    }

    pub fn level(&self, provider_id: &str) -> HealthLevel {
        self.states
            .lock()
            .expect("health lock poisoned")
            .get(provider_id)
            .map(|s| s.level)
            .unwrap_or(HealthLevel::Healthy)
    }

    pub fn avg_latency_ms(&self, provider_id: &str) -> f64 {
        self.states
            .lock()
            .expect("health lock poisoned")
            .get(provider_id)
            .map(|s| s.rolling_avg_latency_ms)
            .unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> HashMap<String, HealthState> {
        self.states.lock().expect("health lock poisoned").clone()
    }
}

/// Background prober: polls each adapter's declared health endpoint and
/// records the outcome as a synthetic probe.
pub async fn run_prober(
    tracker: Arc<HealthTracker>,
    endpoints: Vec<(String, String)>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "health prober could not build HTTP client");
            return;
        }
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {
                debug!("health prober stopping");
                return;
            }
        }

        for (provider_id, url) in &endpoints {
            let started = std::time::Instant::now();
            match client.get(url).send().await {
                Ok(response) if response.status().is_success() => {
                    tracker.record_success(provider_id, started.elapsed().as_millis() as u64);
                }
                Ok(response) => {
                    tracker.record_failure(
                        provider_id,
                        &format!("health probe HTTP {}", response.status()),
                        None,
                    );
                }
                Err(e) => {
                    tracker.record_failure(provider_id, &format!("health probe: {e}"), None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> HealthTracker {
        HealthTracker::new(Arc::new(EventBus::new()))
    }

    #[test]
    fn degrades_after_three_consecutive_errors() {
        let t = tracker();
        for _ in 0..2 {
            t.record_failure("p", "boom", None);
        }
        assert_eq!(t.level("p"), HealthLevel::Healthy);
        t.record_failure("p", "boom", None);
        assert_eq!(t.level("p"), HealthLevel::Degraded);
    }

    #[test]
    fn goes_down_after_ten_errors_and_recovers_through_degraded() {
        let t = tracker();
        for _ in 0..10 {
            t.record_failure("p", "boom", None);
        }
        assert_eq!(t.level("p"), HealthLevel::Down);

        // down -> healthy only via degraded
        t.record_success("p", 50);
        assert_eq!(t.level("p"), HealthLevel::Degraded);
        for _ in 0..4 {
            t.record_success("p", 50);
        }
        assert_eq!(t.level("p"), HealthLevel::Healthy);
    }

    #[test]
    fn rate_limit_cooldown_forces_down_and_blocks_early_recovery() {
        let t = tracker();
        for _ in 0..3 {
            t.record_failure("p", "boom", None);
        }
        t.record_failure("p", "429", Some(Duration::from_secs(60)));
        assert_eq!(t.level("p"), HealthLevel::Down);

        // Success before the cooldown elapses keeps the provider down.
        t.record_success("p", 10);
        assert_eq!(t.level("p"), HealthLevel::Down);
    }

    #[test]
    fn latency_is_ewma() {
        let t = tracker();
        t.record_success("p", 100);
        assert!((t.avg_latency_ms("p") - 100.0).abs() < 1e-9);
        t.record_success("p", 200);
        assert!((t.avg_latency_ms("p") - 120.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_provider_defaults_healthy() {
        assert_eq!(tracker().level("nope"), HealthLevel::Healthy);
    }
}
