//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use switchyard_core::{
    BudgetTier, HealthProbe, IntelligentRouter, ManualClock, PathKind, Priority, ProviderAdapter,
    ProviderError, ProviderReply, ProviderRequest, Route, RoutingContext,
};

/// What a scripted attempt does after its delay
#[derive(Clone, Copy, Debug)]
pub enum Reply {
    Ok(u64),
    Transient,
    Permanent,
}

/// Provider adapter driven by per-route scripts
#[derive(Default)]
pub struct ScriptedAdapter {
    defaults: Mutex<HashMap<String, (Duration, Reply)>>,
    queued: Mutex<HashMap<String, VecDeque<(Duration, Reply)>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_default(&self, route_id: &str, delay_ms: u64, reply: Reply) {
        self.defaults
            .lock()
            .insert(route_id.to_string(), (Duration::from_millis(delay_ms), reply));
    }

    pub fn push(&self, route_id: &str, delay_ms: u64, reply: Reply) {
        self.queued
            .lock()
            .entry(route_id.to_string())
            .or_default()
            .push_back((Duration::from_millis(delay_ms), reply));
    }

    pub fn calls(&self, route_id: &str) -> usize {
        self.calls.lock().get(route_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    async fn invoke(
        &self,
        route: &Route,
        _request: &ProviderRequest,
    ) -> Result<ProviderReply, ProviderError> {
        let id = route.id();
        *self.calls.lock().entry(id.clone()).or_insert(0) += 1;

        let step = self
            .queued
            .lock()
            .get_mut(&id)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.defaults.lock().get(&id).copied());
        let Some((delay, reply)) = step else {
            return Err(ProviderError::permanent(anyhow::anyhow!("unscripted route {id}")));
        };

        tokio::time::sleep(delay).await;
        match reply {
            Reply::Ok(cost) => Ok(ProviderReply::new(json!({ "served_by": id }), cost)),
            Reply::Transient => Err(ProviderError::transient(anyhow::anyhow!("{id} unavailable"))),
            Reply::Permanent => Err(ProviderError::permanent(anyhow::anyhow!("{id} rejected request"))),
        }
    }
}

/// Health probe with a fixed answer per route
#[derive(Default)]
pub struct FixedProbe {
    healthy: Mutex<HashMap<String, bool>>,
}

impl FixedProbe {
    pub fn set(&self, route_id: &str, healthy: bool) {
        self.healthy.lock().insert(route_id.to_string(), healthy);
    }
}

#[async_trait]
impl HealthProbe for FixedProbe {
    async fn probe(&self, route_id: &str) -> bool {
        self.healthy.lock().get(route_id).copied().unwrap_or(false)
    }
}

pub fn direct(provider: &str, latency_ms: u64) -> Route {
    Route::new(PathKind::Direct, provider).with_latency_ms(latency_ms)
}

pub fn broker(provider: &str, latency_ms: u64) -> Route {
    Route::new(PathKind::Broker, provider).with_latency_ms(latency_ms)
}

pub fn context(priority: Priority, domain: &str) -> RoutingContext {
    RoutingContext::new(
        "integration",
        priority,
        domain,
        BudgetTier::Standard,
        priority.default_sla(),
        false,
    )
}

/// Router on a manual clock with a fixed seed
pub fn manual_router(
    adapter: Arc<ScriptedAdapter>,
    routes: Vec<Route>,
) -> (IntelligentRouter, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let router = IntelligentRouter::builder(adapter)
        .with_clock(clock.clone())
        .with_seed(42)
        .with_routes(routes)
        .build()
        .expect("default settings are valid");
    (router, clock)
}

/// Router on tokio time (use with paused time) with a fixed seed
pub fn tokio_router(adapter: Arc<ScriptedAdapter>, routes: Vec<Route>) -> IntelligentRouter {
    IntelligentRouter::builder(adapter)
        .with_seed(42)
        .with_routes(routes)
        .build()
        .expect("default settings are valid")
}
