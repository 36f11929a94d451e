//! Scripted collaborators for unit tests

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;

use super::types::Route;
use crate::provider::{HealthProbe, ProviderAdapter, ProviderError, ProviderReply, ProviderRequest};

#[derive(Clone, Copy, Debug)]
pub enum StepResult {
    Ok { cost_units: u64 },
    Transient,
    Permanent,
}

/// One scripted provider response
#[derive(Clone, Copy, Debug)]
pub struct Step {
    pub delay: Duration,
    pub result: StepResult,
}

impl Step {
    pub fn ok(delay_ms: u64, cost_units: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            result: StepResult::Ok { cost_units },
        }
    }

    pub fn transient(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            result: StepResult::Transient,
        }
    }

    pub fn permanent(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            result: StepResult::Permanent,
        }
    }
}

/// Provider that replays queued steps per route, then a per-route default
#[derive(Default)]
pub struct ScriptedProvider {
    defaults: HashMap<String, Step>,
    queued: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: DashMap<String, usize>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, route_id: &str, step: Step) -> Self {
        self.defaults.insert(route_id.to_string(), step);
        self
    }

    pub fn push(&self, route_id: &str, step: Step) {
        self.queued
            .lock()
            .entry(route_id.to_string())
            .or_default()
            .push_back(step);
    }

    pub fn calls(&self, route_id: &str) -> usize {
        self.calls.get(route_id).map_or(0, |c| *c)
    }

    fn next_step(&self, route_id: &str) -> Option<Step> {
        self.queued
            .lock()
            .get_mut(route_id)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.defaults.get(route_id).copied())
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    async fn invoke(
        &self,
        route: &Route,
        _request: &ProviderRequest,
    ) -> Result<ProviderReply, ProviderError> {
        let route_id = route.id();
        *self.calls.entry(route_id.clone()).or_insert(0) += 1;

        let Some(step) = self.next_step(&route_id) else {
            return Err(ProviderError::permanent(anyhow::anyhow!("no script for {route_id}")));
        };
        tokio::time::sleep(step.delay).await;

        match step.result {
            StepResult::Ok { cost_units } => {
                Ok(ProviderReply::new(json!({ "route": route_id }), cost_units))
            }
            StepResult::Transient => Err(ProviderError::transient(anyhow::anyhow!("503 from {route_id}"))),
            StepResult::Permanent => Err(ProviderError::permanent(anyhow::anyhow!("400 from {route_id}"))),
        }
    }
}

/// Probe with fixed answers per route (unknown routes are unhealthy)
#[derive(Default)]
pub struct StaticProbe {
    answers: DashMap<String, bool>,
    probed: Mutex<Vec<String>>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, route_id: &str, healthy: bool) {
        self.answers.insert(route_id.to_string(), healthy);
    }

    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().clone()
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn probe(&self, route_id: &str) -> bool {
        self.probed.lock().push(route_id.to_string());
        self.answers.get(route_id).is_some_and(|h| *h)
    }
}
