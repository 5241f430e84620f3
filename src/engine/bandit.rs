//! Thompson-sampling exploration policy
//!
//! Per (model, token-bucket) arm the policy keeps a Beta(alpha, beta)
//! posterior over success probability and a running mean/variance of
//! reward. Candidate scoring in `normal` mode samples a reward estimate
//! from the posterior and adds it to the score, scaled by the exploration
//! temperature.
//!
//! The refresher rebuilds the whole arm table from `reward_logs` and swaps
//! it in atomically, so samplers never see a half-updated posterior.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rand::Rng;
use rand_distr::{Beta, Distribution, Normal};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::storage::{RewardSummary, Store};

pub const DEFAULT_TEMPERATURE: f64 = 0.3;
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Posterior state for one (model, token-bucket) arm.
#[derive(Debug, Clone, Copy)]
pub struct ArmPosterior {
    pub alpha: f64,
    pub beta: f64,
    pub mean: f64,
    pub var: f64,
    pub count: u64,
}

impl ArmPosterior {
    /// Uninformative prior for arms with no observations: Beta(1,1) and a
    /// wide reward guess, so new arms get explored.
    pub fn prior() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            mean: 0.5,
            var: 0.25,
            count: 0,
        }
    }

    pub fn from_summary(summary: &RewardSummary) -> Self {
        let count = summary.count.max(1) as f64;
        let mean = summary.sum_reward / count;
        let var = (summary.sum_reward_sq / count - mean * mean).max(0.0);
        Self {
            alpha: 1.0 + summary.successes as f64,
            beta: 1.0 + summary.failures as f64,
            mean,
            var,
            count: summary.count,
        }
    }

    /// Draw one Thompson sample: success probability from the Beta
    /// posterior times a reward drawn around the running mean.
    fn sample(&self, rng: &mut impl Rng) -> f64 {
        let p = match Beta::new(self.alpha, self.beta) {
            Ok(dist) => dist.sample(rng),
            Err(_) => self.alpha / (self.alpha + self.beta),
        };
        let sd = (self.var / self.count.max(1) as f64).sqrt();
        let reward = if sd > 0.0 {
            match Normal::new(self.mean, sd) {
                Ok(dist) => dist.sample(rng),
                Err(_) => self.mean,
            }
        } else {
            self.mean
        };
        (p * reward).clamp(0.0, 1.0)
    }
}

pub struct BanditPolicy {
    temperature: f64,
    arms: Mutex<HashMap<(String, String), ArmPosterior>>,
}

impl BanditPolicy {
    pub fn new(temperature: f64) -> Self {
        Self {
            temperature,
            arms: Mutex::new(HashMap::new()),
        }
    }

    /// Exploration bonus for a candidate in the given token bucket.
    pub fn bonus(&self, model_id: &str, token_bucket: &str) -> f64 {
        if self.temperature == 0.0 {
            return 0.0;
        }
        let posterior = {
            let arms = self.arms.lock().expect("bandit lock poisoned");
            arms.get(&(model_id.to_string(), token_bucket.to_string()))
                .copied()
                .unwrap_or_else(ArmPosterior::prior)
        };
        self.temperature * posterior.sample(&mut rand::thread_rng())
    }

    /// Swap in a freshly built arm table.
    pub fn replace(&self, arms: HashMap<(String, String), ArmPosterior>) {
        *self.arms.lock().expect("bandit lock poisoned") = arms;
    }

    pub fn arm(&self, model_id: &str, token_bucket: &str) -> Option<ArmPosterior> {
        self.arms
            .lock()
            .expect("bandit lock poisoned")
            .get(&(model_id.to_string(), token_bucket.to_string()))
            .copied()
    }

    /// Rebuild the posterior table from the reward log.
    pub async fn refresh(&self, store: &dyn Store) {
        let since = Utc.timestamp_millis_opt(0).single().unwrap_or_else(Utc::now);
        match store.reward_summaries(since).await {
            Ok(summaries) => {
                let arms: HashMap<(String, String), ArmPosterior> = summaries
                    .iter()
                    .map(|s| {
                        (
                            (s.model_id.clone(), s.token_bucket.clone()),
                            ArmPosterior::from_summary(s),
                        )
                    })
                    .collect();
                debug!(arms = arms.len(), "bandit posteriors refreshed");
                self.replace(arms);
            }
            Err(e) => warn!(error = %e, "bandit refresh failed"),
        }
    }
}

/// Background loop: refresh the policy from the reward log every interval.
pub async fn run_refresher(
    policy: Arc<BanditPolicy>,
    store: Arc<dyn Store>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => policy.refresh(store.as_ref()).await,
            _ = stop.changed() => {
                debug!("bandit refresher stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_temperature_means_no_bonus() {
        let policy = BanditPolicy::new(0.0);
        assert_eq!(policy.bonus("m", "s"), 0.0);
    }

    #[test]
    fn bonus_is_bounded_by_temperature() {
        let policy = BanditPolicy::new(0.3);
        for _ in 0..100 {
            let bonus = policy.bonus("m", "s");
            assert!((0.0..=0.3).contains(&bonus));
        }
    }

    #[test]
    fn posterior_from_summary_matches_formulas() {
        let posterior = ArmPosterior::from_summary(&RewardSummary {
            model_id: "m".into(),
            token_bucket: "s".into(),
            successes: 8,
            failures: 2,
            sum_reward: 6.0,
            sum_reward_sq: 4.0,
            count: 10,
        });
        assert_eq!(posterior.alpha, 9.0);
        assert_eq!(posterior.beta, 3.0);
        assert!((posterior.mean - 0.6).abs() < 1e-9);
        assert!((posterior.var - (0.4 - 0.36)).abs() < 1e-9);
    }

    #[test]
    fn strong_arm_samples_higher_on_average() {
        let policy = BanditPolicy::new(1.0);
        let mut arms = HashMap::new();
        arms.insert(
            ("good".to_string(), "s".to_string()),
            ArmPosterior {
                alpha: 100.0,
                beta: 1.0,
                mean: 0.9,
                var: 0.01,
                count: 100,
            },
        );
        arms.insert(
            ("bad".to_string(), "s".to_string()),
            ArmPosterior {
                alpha: 1.0,
                beta: 100.0,
                mean: 0.1,
                var: 0.01,
                count: 100,
            },
        );
        policy.replace(arms);

        let average = |model: &str| -> f64 {
            (0..300).map(|_| policy.bonus(model, "s")).sum::<f64>() / 300.0
        };
        assert!(average("good") > average("bad"));
    }
}
