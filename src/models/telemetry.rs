//! Telemetry rows: request log, reward log, audit log, time-series points

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RouteMode;

/// One row in `request_logs`, written after every dispatched request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub timestamp: DateTime<Utc>,
    pub model_id: String,
    pub provider_id: String,
    pub mode: RouteMode,
    pub estimated_cost_usd: f64,
    pub latency_ms: u64,
    pub status: u16,
    pub error_class: Option<String>,
    pub request_id: String,
    pub api_key_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// One row in `reward_logs`; the bandit refresher aggregates these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub model_id: String,
    pub provider_id: String,
    pub mode: RouteMode,
    pub estimated_tokens: u64,
    /// Context feature of the bandit: xs, s, m, l, xl.
    pub token_bucket: String,
    pub latency_budget_ms: u64,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub success: bool,
    pub error_class: Option<String>,
    pub reward: f64,
}

/// One row in `audit_logs`, written on admin-grade mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub detail: String,
}

impl AuditLogEntry {
    pub fn new(actor: impl Into<String>, action: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            detail: detail.into(),
        }
    }
}

/// One point in the embedded time-series store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub metric: String,
    pub model_id: String,
    pub provider_id: String,
    pub value: f64,
}
