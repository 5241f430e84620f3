//! Rolling per-provider health state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse provider health level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Down,
}

impl HealthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Degraded => "degraded",
            HealthLevel::Down => "down",
        }
    }

    /// Gauge encoding: 0 down, 1 degraded, 2 healthy.
    pub fn gauge_value(&self) -> i64 {
        match self {
            HealthLevel::Down => 0,
            HealthLevel::Degraded => 1,
            HealthLevel::Healthy => 2,
        }
    }
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rolling health state for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthState {
    pub level: HealthLevel,
    pub consec_errors: u32,
    /// Consecutive successes while degraded; drives recovery to healthy.
    pub consec_successes: u32,
    /// Exponentially weighted moving average, alpha = 0.2.
    pub rolling_avg_latency_ms: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            level: HealthLevel::Healthy,
            consec_errors: 0,
            consec_successes: 0,
            rolling_avg_latency_ms: 0.0,
            last_success_at: None,
            last_error: None,
            last_error_at: None,
            cooldown_until: None,
        }
    }
}
