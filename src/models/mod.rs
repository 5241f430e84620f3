// Core domain models for TokenHub
// These are the records shared between the routing engine, the ingress
// pipeline and the persistent store.

//! # Domain Models Module
//!
//! This module contains the core domain records for TokenHub. The routing
//! engine owns the canonical in-memory copies; the store is the durable
//! source of truth and hydrates the engine at startup.
//!
//! ## Module Organization
//!
//! - [`model`]: upstream models and providers, pricing metadata
//! - [`api_key`]: persisted API-key records (hash only, never plaintext)
//! - [`telemetry`]: request/reward/audit log rows and time-series points
//! - [`routing`]: routing modes and the persisted routing-config singleton
//! - [`health`]: rolling per-provider health state

pub mod api_key;
pub mod health;
pub mod model;
pub mod routing;
pub mod telemetry;

pub use api_key::ApiKeyRecord;
pub use health::{HealthLevel, HealthState};
pub use model::{CredentialSource, Model, PricingSource, Provider, ProviderKind};
pub use routing::{RouteMode, RoutingConfig};
pub use telemetry::{AuditLogEntry, RequestLogEntry, RewardEntry, TimeSeriesPoint};
