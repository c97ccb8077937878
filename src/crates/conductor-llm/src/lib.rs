//! LLM provider layer for conductor.
//!
//! This crate defines the provider-agnostic contract the workflow engine
//! speaks to language-model backends, plus everything needed to keep a fleet
//! of backends healthy:
//!
//! - [`Provider`] — the adapter trait (`initialize` / `health_check` /
//!   `generate` / `close`). Adapters report errors as strings starting with
//!   `"Error: "` so the failover classifier works uniformly across backends
//!   that do and do not surface typed errors.
//! - [`ProviderRegistry`] — factory registration and a `provider:model`
//!   keyed instance cache with bounded initialization probes.
//! - [`FailoverManager`] — classifies failures, applies per-reason
//!   cooldowns, and retries across health-weighted fallback candidates.
//! - [`ModelTierManager`] — category-aware tier tables consulted by the
//!   failover candidate selection.
//! - [`MockProvider`] — a deterministic simulation backend used by the test
//!   suites and available as the `"simulation"` provider type.

pub mod config;
pub mod error;
pub mod failover;
pub mod health;
pub mod mock;
pub mod provider;
pub mod registry;
pub mod thinking;
pub mod tiers;

pub use config::{ProviderCatalog, ProviderEntry};
pub use error::{LlmError, Result};
pub use failover::{FailoverCallback, FailoverConfig, FailoverManager, FailoverOutcome};
pub use health::{FailoverReason, ProviderHealth};
pub use mock::MockProvider;
pub use provider::{GenerateRequest, Provider, ThoughtSink};
pub use registry::ProviderRegistry;
pub use thinking::{strip_thinking, ThoughtStream};
pub use tiers::{infer_category, ModelTierManager, TaskCategory};
