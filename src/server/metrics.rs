//! Prometheus metrics
//!
//! The registry is created per server instance; metric names are part of
//! the stable operator interface and must not change.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    pub requests_total: IntCounterVec,
    pub request_latency_ms: HistogramVec,
    pub cost_usd_total: prometheus::CounterVec,
    pub tokens_total: IntCounterVec,
    pub rate_limited_total: IntCounter,
    pub temporal_up: IntGauge,
    pub temporal_circuit_state: IntGauge,
    pub temporal_fallback_total: IntCounter,
    pub provider_health_state: IntGaugeVec,
    pub heartbeat_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("tokenhub_requests_total", "Dispatched requests"),
            &["mode", "model", "provider", "status"],
        )
        .expect("valid metric");
        let request_latency_ms = HistogramVec::new(
            HistogramOpts::new("tokenhub_request_latency_ms", "Request latency in ms").buckets(
                prometheus::exponential_buckets(10.0, 2.0, 10).expect("valid buckets"),
            ),
            &["mode", "model", "provider"],
        )
        .expect("valid metric");
        let cost_usd_total = prometheus::CounterVec::new(
            Opts::new("tokenhub_cost_usd_total", "Estimated upstream cost in USD"),
            &["model", "provider"],
        )
        .expect("valid metric");
        let tokens_total = IntCounterVec::new(
            Opts::new("tokenhub_tokens_total", "Tokens by kind"),
            &["model", "provider", "kind"],
        )
        .expect("valid metric");
        let rate_limited_total = IntCounter::new(
            "tokenhub_rate_limited_total",
            "Requests denied by a rate limiter",
        )
        .expect("valid metric");
        let temporal_up = IntGauge::new(
            "tokenhub_temporal_up",
            "Whether a workflow dispatcher is configured",
        )
        .expect("valid metric");
        let temporal_circuit_state = IntGauge::new(
            "tokenhub_temporal_circuit_state",
            "Dispatch breaker state: 0 closed, 1 open, 2 half-open",
        )
        .expect("valid metric");
        let temporal_fallback_total = IntCounter::new(
            "tokenhub_temporal_fallback_total",
            "Dispatches that fell back to the in-process engine",
        )
        .expect("valid metric");
        let provider_health_state = IntGaugeVec::new(
            Opts::new(
                "tokenhub_provider_health_state",
                "Provider health: 0 down, 1 degraded, 2 healthy",
            ),
            &["provider_id"],
        )
        .expect("valid metric");
        let heartbeat_total =
            IntCounter::new("tokenhub_heartbeat_total", "Heartbeat ticks").expect("valid metric");

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(request_latency_ms.clone()),
            Box::new(cost_usd_total.clone()),
            Box::new(tokens_total.clone()),
            Box::new(rate_limited_total.clone()),
            Box::new(temporal_up.clone()),
            Box::new(temporal_circuit_state.clone()),
            Box::new(temporal_fallback_total.clone()),
            Box::new(provider_health_state.clone()),
            Box::new(heartbeat_total.clone()),
        ] {
            registry.register(collector).expect("unique metric");
        }

        Self {
            registry,
            requests_total,
            request_latency_ms,
            cost_usd_total,
            tokens_total,
            rate_limited_total,
            temporal_up,
            temporal_circuit_state,
            temporal_fallback_total,
            provider_health_state,
            heartbeat_total,
        }
    }

    /// Sync the per-provider health gauges from a tracker snapshot.
    pub fn provider_health_gauges(
        &self,
        states: &std::collections::HashMap<String, crate::models::HealthState>,
    ) {
        for (provider_id, state) in states {
            self.provider_health_state
                .with_label_values(&[provider_id])
                .set(state.level.gauge_value());
        }
    }

    /// Prometheus exposition text.
    pub fn render(&self) -> String {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if TextEncoder::new().encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
