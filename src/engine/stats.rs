//! In-memory windowed per-model metrics
//!
//! A rolling window of request samples per model, summarized on demand.
//! This feeds operator introspection; the durable counterpart is the
//! request log and the time-series store.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    success: bool,
    latency_ms: u64,
    cost_usd: f64,
}

/// Summary over the current window for one model.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ModelStats {
    pub count: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub total_cost_usd: f64,
}

pub struct StatsAggregator {
    window: Duration,
    inner: Mutex<HashMap<String, VecDeque<Sample>>>,
}

impl StatsAggregator {
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, model_id: &str, success: bool, latency_ms: u64, cost_usd: f64) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        let samples = inner.entry(model_id.to_string()).or_default();
        samples.push_back(Sample {
            at: Instant::now(),
            success,
            latency_ms,
            cost_usd,
        });
        Self::expire(samples, self.window);
    }

    fn expire(samples: &mut VecDeque<Sample>, window: Duration) {
        while let Some(front) = samples.front() {
            if front.at.elapsed() > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn summary(&self, model_id: &str) -> ModelStats {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        match inner.get_mut(model_id) {
            Some(samples) => {
                Self::expire(samples, self.window);
                summarize(samples)
            }
            None => ModelStats::default(),
        }
    }

    pub fn all(&self) -> HashMap<String, ModelStats> {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner
            .iter_mut()
            .map(|(id, samples)| {
                Self::expire(samples, self.window);
                (id.clone(), summarize(samples))
            })
            .collect()
    }
}

fn summarize(samples: &VecDeque<Sample>) -> ModelStats {
    if samples.is_empty() {
        return ModelStats::default();
    }
    let count = samples.len() as u64;
    let successes = samples.iter().filter(|s| s.success).count() as f64;
    let latency_sum: u64 = samples.iter().map(|s| s.latency_ms).sum();
    let cost_sum: f64 = samples.iter().map(|s| s.cost_usd).sum();
    ModelStats {
        count,
        success_rate: successes / count as f64,
        avg_latency_ms: latency_sum as f64 / count as f64,
        total_cost_usd: cost_sum,
    }
}

/// Scalar reward for one completed request, in [0, 1].
///
/// Success earns 1.0 minus budget-relative latency and cost penalties;
/// failure earns 0. With no budgets set, a success is a flat 1.0.
pub fn compute_reward(
    success: bool,
    latency_ms: u64,
    latency_budget_ms: u64,
    cost_usd: f64,
    budget_usd: f64,
) -> f64 {
    if !success {
        return 0.0;
    }
    let latency_penalty = if latency_budget_ms > 0 {
        0.5 * (latency_ms as f64 / latency_budget_ms as f64).min(1.0)
    } else {
        0.0
    };
    let cost_penalty = if budget_usd > 0.0 {
        0.5 * (cost_usd / budget_usd).min(1.0)
    } else {
        0.0
    };
    (1.0 - latency_penalty - cost_penalty).max(0.0)
}
