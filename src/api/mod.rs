// Ingress pipeline for TokenHub
// The stateless per-request orchestrator: middleware chain, OpenAI-shaped
// handlers, rate limiting and idempotency replay.

//! # API Module
//!
//! The HTTP-facing half of TokenHub. Requests pass through the middleware
//! chain (request id, access log, panic recovery, CORS, per-IP limit,
//! idempotency, auth, scope, budget, per-key limit) before reaching the
//! handlers, which hand off to the engine layer for routing and dispatch.

pub mod handlers;
pub mod idempotency;
pub mod middleware;
pub mod ratelimit;
pub mod types;


pub use idempotency::IdempotencyCache;
pub use middleware::RequestId;
pub use ratelimit::RateLimiter;
pub use types::{ApiError, ChatCompletionRequest, RoutingOptions};
