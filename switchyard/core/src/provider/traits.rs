//! Provider Traits
//!
//! Interfaces to the external collaborators that execute requests and check
//! route health.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::routing::{Route, RoutingContext};

/// One attempt handed to a provider adapter
#[derive(Clone, Debug)]
pub struct ProviderRequest {
    /// Request identifier (shared by primary and fallback attempts)
    pub request_id: String,
    /// Opaque request body
    pub payload: Value,
    /// Time left before the request's deadline, when it is enforced
    pub remaining_budget: Option<Duration>,
    /// Classified context of the request
    pub context: RoutingContext,
}

/// Successful provider response
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderReply {
    /// Opaque response body
    pub payload: Value,
    /// Cost in minor currency units
    pub cost_units: u64,
}

impl ProviderReply {
    /// Reply with a payload and cost
    pub fn new(payload: Value, cost_units: u64) -> Self {
        Self {
            payload,
            cost_units,
        }
    }
}

/// Failed provider call
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ProviderError {
    /// Whether retrying on another route may help
    pub transient: bool,
    /// Cost incurred before the failure
    pub cost_units: u64,
    /// Underlying error
    pub error: anyhow::Error,
}

impl ProviderError {
    /// Error worth a fallback attempt (timeouts, 5xx, rate limits)
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        Self {
            transient: true,
            cost_units: 0,
            error: error.into(),
        }
    }

    /// Error no other route will fix (bad request, content rejected)
    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        Self {
            transient: false,
            cost_units: 0,
            error: error.into(),
        }
    }

    /// Attach the cost incurred
    #[must_use]
    pub fn with_cost(mut self, cost_units: u64) -> Self {
        self.cost_units = cost_units;
        self
    }
}

/// Executes requests against a route's backend
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Send one attempt. The adapter should honor `remaining_budget` where it
    /// can; the router abandons the attempt when the budget runs out either way.
    async fn invoke(
        &self,
        route: &Route,
        request: &ProviderRequest,
    ) -> Result<ProviderReply, ProviderError>;
}

/// Synthetic health check for a route
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Whether the route currently answers
    async fn probe(&self, route_id: &str) -> bool;
}
