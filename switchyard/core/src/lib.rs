//! Switchyard Core - Adaptive Request Routing
//!
//! Routes inference requests across direct provider connections and
//! broker-mediated connections. Each request is classified into a routing
//! context, a healthy route is chosen (deterministically for emergencies,
//! by Thompson sampling otherwise), and failures fall back to the next-best
//! route within the request's deadline.
//!
//! # Key Types
//!
//! - [`IntelligentRouter`]: decides, executes and learns
//! - [`RequestClassifier`]: request metadata to [`RoutingContext`]
//! - [`HealthMonitor`]: per-route circuit breakers and health scores
//! - [`BanditOptimizer`]: per-context Thompson sampling
//! - [`FallbackController`]: deadline-bounded execution with one fallback hop
//! - [`PerformanceTracker`]: rolling windows, efficiency and alerts
//! - [`ProviderAdapter`] / [`HealthProbe`]: the external collaborators
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use switchyard_core::{load_config, IntelligentRouter, RequestMetadata};
//!
//! let config = load_config()?;
//! let router = IntelligentRouter::from_config(Arc::new(MyAdapter::new()), &config)?;
//!
//! let metadata = RequestMetadata::new("fraud_check").with_domain("payments");
//! let response = router.execute_request(&metadata, serde_json::json!({"q": "..."})).await?;
//! println!("served by {}", response.route_id);
//! ```
//!
//! # Module Overview
//!
//! - [`routing`]: classifier, health, bandit, fallback, metrics and the router
//! - [`provider`]: provider adapter and health probe traits
//! - [`config`]: TOML and environment configuration
//! - [`clock`]: injectable time source
//! - [`logging`]: tracing subscriber setup

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod config;
pub mod logging;
pub mod provider;
pub mod routing;

// Routing exports
pub use routing::{
    AlertSink, BanditOptimizer, BudgetTier, CircuitPhase, CircuitState, DeadlineBudget,
    DecisionRecord, FallbackController, HealthMonitor, HealthSnapshot, IntelligentRouter, Outcome,
    PathKind, PerformanceTracker, Priority, RequestClassifier, RequestMetadata, Route,
    RouteCapabilities, RoutedResponse, RouterBuilder, RouterConfig, RouterStats, RoutingContext,
    RoutingDecision, RoutingError, SelectionMode,
};

// Provider exports
pub use provider::{HealthProbe, ProviderAdapter, ProviderError, ProviderReply, ProviderRequest};

// Clock exports
pub use clock::{Clock, ManualClock, SystemClock};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, RoutingSettings, SwitchyardConfig, SwitchyardToml,
};
