// Core engine for TokenHub
// Routing, health, exploration, persistence and the observability spine.

//! # Engine Module
//!
//! The engine layer holds everything between the HTTP surface and the
//! upstream adapters:
//!
//! ```text
//! Ingress (api module)
//!        ↓ select / dispatch
//! RoutingEngine ← filtering, scoring, bandit, retry, escalation
//!        ↓ reads                       ↓ writes
//! HealthTracker, BanditPolicy     WriteQueue → Store (SQLite)
//!        ↑ probes / refresh            ↑ flush
//! background loops            TimeSeriesStore, logs
//! ```
//!
//! The engine exclusively owns the in-memory model/adapter tables; the
//! store is the durable source of truth and hydrates the engine at start.

pub mod bandit;
pub mod breaker;
pub mod budget;
pub mod credentials;
pub mod events;
pub mod health;
pub mod keys;
pub mod pricing;
pub mod routing;
pub mod sqlite_storage;
pub mod stats;
pub mod storage;
pub mod tsdb;
pub mod vault;

pub use bandit::BanditPolicy;
pub use breaker::{BreakerState, CircuitBreaker};
pub use budget::{BudgetChecker, BudgetError};
pub use events::{Event, EventBus, EventKind};
pub use health::HealthTracker;
pub use keys::{ApiKeyManager, KeyError, NewKey};
pub use routing::{
    estimate_tokens, token_bucket, Decision, DispatchOutcome, RouteError, RoutePolicy,
    RoutingEngine,
};
pub use sqlite_storage::SqliteStore;
pub use stats::{compute_reward, StatsAggregator};
pub use storage::{Store, StoreError, WriteJob, WriteQueue};
pub use tsdb::{TimeSeriesStore, TsQuery};
pub use vault::{Vault, VaultError};
