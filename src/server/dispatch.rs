//! Workflow dispatch behind the circuit breaker
//!
//! When an external workflow engine is configured, non-streaming requests
//! run as a SelectModel → SendToProvider → LogResult workflow through the
//! [`WorkflowDispatcher`] trait. The breaker guards every handoff; any
//! failure records on the breaker and the request falls back to in-process
//! engine dispatch, incrementing the fallback counter. The core works the
//! same with no dispatcher configured.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::engine::{
    CircuitBreaker, DispatchOutcome, Event, EventBus, EventKind, RouteError, RoutePolicy,
    RoutingEngine,
};
use crate::llm::ChatRequest;

use super::metrics::Metrics;

/// External workflow engine capable of running a routed dispatch.
#[async_trait]
pub trait WorkflowDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        request: &ChatRequest,
        override_model: Option<&str>,
        policy: &RoutePolicy,
    ) -> Result<DispatchOutcome, RouteError>;
}

pub struct DispatchRouter {
    engine: Arc<RoutingEngine>,
    workflow: Option<Arc<dyn WorkflowDispatcher>>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<Metrics>,
    bus: Arc<EventBus>,
}

impl DispatchRouter {
    pub fn new(
        engine: Arc<RoutingEngine>,
        workflow: Option<Arc<dyn WorkflowDispatcher>>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<Metrics>,
        bus: Arc<EventBus>,
    ) -> Self {
        metrics.temporal_up.set(workflow.is_some() as i64);
        metrics
            .temporal_circuit_state
            .set(breaker.state().gauge_value());
        Self {
            engine,
            workflow,
            breaker,
            metrics,
            bus,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Dispatch one non-streaming request, preferring the workflow path
    /// while the breaker allows it.
    pub async fn dispatch(
        &self,
        request: &ChatRequest,
        override_model: Option<&str>,
        policy: &RoutePolicy,
    ) -> Result<DispatchOutcome, RouteError> {
        if let Some(workflow) = &self.workflow {
            if self.breaker.allow() {
                match workflow.dispatch(request, override_model, policy).await {
                    Ok(outcome) => {
                        self.breaker.record_success();
                        self.bus.publish(
                            Event::new(
                                EventKind::ActivityCompleted,
                                serde_json::json!({
                                    "model_id": outcome.decision.model_id,
                                    "provider_id": outcome.decision.provider_id,
                                }),
                            )
                            .with_request_id(request.id.to_string()),
                        );
                        return Ok(outcome);
                    }
                    Err(err) => {
                        self.breaker.record_failure();
                        self.metrics.temporal_fallback_total.inc();
                        warn!(
                            request_id = %request.id,
                            error = %err,
                            "workflow dispatch failed, falling back to engine"
                        );
                    }
                }
            } else {
                self.metrics.temporal_fallback_total.inc();
            }
        }
        self.engine.dispatch(request, override_model, policy).await
    }
}
