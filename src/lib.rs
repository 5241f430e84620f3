// TokenHub - Rust Edition
// A reverse-proxy and control plane for LLM inference: OpenAI-compatible
// ingress, policy- and reward-driven routing, per-key authentication,
// rate limits and monthly budgets.

//! # TokenHub Library
//!
//! This is the library root for TokenHub. The binary in `bin/server.rs` is
//! a thin wrapper around [`server::run`].
//!
//! ## Layering
//!
//! ```text
//! Client (OpenAI-compatible)
//!        ↓ HTTP
//! API layer (api) ← middleware chain, handlers, rate limiting, idempotency
//!        ↓ function calls
//! Engine layer (engine) ← routing, bandit, health, breaker, storage, vault
//!        ↓ trait calls
//! Provider adapters (llm) ← OpenAI, Anthropic, vLLM upstreams
//! ```
//!
//! The `models` module holds the domain records shared by every layer;
//! `config` is the environment-driven configuration; `server` assembles
//! the application and owns the process lifecycle.

pub mod api;
pub mod config;
pub mod engine;
pub mod llm;
pub mod models;
pub mod server;

pub use config::Config;
pub use engine::{
    ApiKeyManager, BanditPolicy, BudgetChecker, CircuitBreaker, Decision, EventBus, HealthTracker,
    RoutePolicy, RoutingEngine, SqliteStore, Store, Vault,
};
pub use server::{build_router, run, AppState};
