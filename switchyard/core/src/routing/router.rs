//! Intelligent Router
//!
//! The main entry point for routing requests. Coordinates the classifier,
//! health monitor, bandit optimizer, fallback controller and performance
//! tracker.
//!
//! # Usage
//!
//! ```ignore
//! let router = IntelligentRouter::builder(provider)
//!     .with_settings(config.settings.clone())
//!     .with_routes(config.routes.clone())
//!     .build()?;
//!
//! let response = router.execute(context, payload).await?;
//! ```
//!
//! # Decision Flow
//!
//! 1. Candidates = registered routes that satisfy the context's capabilities
//!    and are available (circuit not open). With none available the router
//!    either widens to every matching route (degraded mode) or fails with
//!    `NoRouteAvailable`.
//! 2. Emergency requests take the candidate with the lowest expected latency.
//!    Everything else is sampled from the bandit's weights.
//! 3. The remaining candidates become the ranked fallback list.
//! 4. After execution every attempt is fed back into health, bandit and
//!    metrics, and the decision is appended to the decision log.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::bandit::{BanditOptimizer, RandomSource, SeededRandom};
use super::classifier::{RequestClassifier, RequestMetadata};
use super::error::RoutingError;
use super::fallback::{DeadlineBudget, ExecutionPlan, FallbackController, RoutedResponse};
use super::health::{CircuitPhase, HealthMonitor, HealthSnapshot};
use super::metrics::{
    AlertSink, PerformanceTracker, RouteWindows, RoutingEfficiency, TrackerConfig, TracingAlertSink,
};
use super::types::{ContextKey, Outcome, Priority, Route, RoutingContext, RoutingDecision, SelectionMode};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, RoutingSettings, SwitchyardConfig};
use crate::provider::{HealthProbe, ProviderAdapter};

// ============================================================================
// Configuration
// ============================================================================

/// Router-level switches
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouterConfig {
    /// Route to open circuits when no healthy candidate matches
    pub allow_degraded: bool,
    /// Decisions kept in the in-memory log
    pub decision_log_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            allow_degraded: true,
            decision_log_capacity: 1024,
        }
    }
}

// ============================================================================
// Decision Log and Stats
// ============================================================================

/// One executed decision with everything that happened to it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// The decision as finally resolved (fallback flag updated)
    pub decision: RoutingDecision,
    /// Every attempt outcome
    pub outcomes: Vec<Outcome>,
    /// Terminal error kind, if the request failed
    pub error_kind: Option<String>,
    /// Terminal error message, if the request failed
    pub error: Option<String>,
    /// Wall-clock time across all attempts
    pub elapsed_ms: u64,
    /// Whether the request finished within its deadline plus grace
    pub within_sla: bool,
}

/// Monitoring view of one route
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteStats {
    /// Route definition
    pub route: Route,
    /// Circuit breaker and health score
    pub health: Option<HealthSnapshot>,
    /// Rolling latency/success/cost windows
    pub latency: Option<RouteWindows>,
    /// Success rate over the last hour (health window when no samples)
    pub success_rate: f64,
    /// Expected bandit weight per context key
    pub bandit_weights: BTreeMap<String, f64>,
}

/// Monitoring export
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouterStats {
    /// Per-route view keyed by route id
    pub per_route: BTreeMap<String, RouteStats>,
    /// Expected weights keyed by context key, then route id
    pub per_context: BTreeMap<String, BTreeMap<String, f64>>,
    /// Preferred/exploration/fallback split
    pub efficiency: RoutingEfficiency,
    /// Alerts delivered so far
    pub alerts_fired: u64,
}

impl RouterStats {
    /// Pretty JSON rendering
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be represented in JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles an [`IntelligentRouter`] from its collaborators
pub struct RouterBuilder {
    provider: Arc<dyn ProviderAdapter>,
    settings: RoutingSettings,
    clock: Arc<dyn Clock>,
    rng: Option<Box<dyn RandomSource>>,
    alert_sink: Arc<dyn AlertSink>,
    tracker_config: TrackerConfig,
    classifier: Option<RequestClassifier>,
    routes: Vec<Route>,
}

impl RouterBuilder {
    fn new(provider: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            provider,
            settings: RoutingSettings::default(),
            clock: Arc::new(SystemClock),
            rng: None,
            alert_sink: Arc::new(TracingAlertSink),
            tracker_config: TrackerConfig::default(),
            classifier: None,
            routes: Vec::new(),
        }
    }

    /// Tunables
    #[must_use]
    pub fn with_settings(mut self, settings: RoutingSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Time source
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Random source for Thompson sampling
    #[must_use]
    pub fn with_random_source(mut self, rng: Box<dyn RandomSource>) -> Self {
        self.rng = Some(rng);
        self
    }

    /// Seeded random source (reproducible decisions)
    #[must_use]
    pub fn with_seed(self, seed: u64) -> Self {
        self.with_random_source(Box::new(SeededRandom::with_seed(seed)))
    }

    /// Alert destination
    #[must_use]
    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = sink;
        self
    }

    /// Alert thresholds and window caps
    #[must_use]
    pub fn with_tracker_config(mut self, config: TrackerConfig) -> Self {
        self.tracker_config = config;
        self
    }

    /// Classifier with custom operation mappings (its SLA table is replaced
    /// by the settings)
    #[must_use]
    pub fn with_classifier(mut self, classifier: RequestClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Routes to register on build
    #[must_use]
    pub fn with_routes(mut self, routes: Vec<Route>) -> Self {
        self.routes = routes;
        self
    }

    /// Validate the settings and build the router
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for out-of-range settings.
    pub fn build(self) -> Result<IntelligentRouter, ConfigError> {
        self.settings.validate()?;

        let settings = self.settings;
        let clock = self.clock;
        let health = Arc::new(HealthMonitor::new(settings.health_config(), clock.clone()));
        let rng = self
            .rng
            .unwrap_or_else(|| Box::new(SeededRandom::from_entropy()));
        let classifier = self.classifier.unwrap_or_default();
        classifier.set_sla_table(settings.sla);

        let router = IntelligentRouter {
            provider: self.provider,
            classifier,
            bandit: BanditOptimizer::new(settings.bandit_config(), rng),
            fallback: FallbackController::new(settings.fallback_config(), health.clone(), clock.clone()),
            tracker: PerformanceTracker::new(self.tracker_config, clock.clone(), self.alert_sink),
            health,
            clock,
            routes: RwLock::new(BTreeMap::new()),
            config: RwLock::new(settings.router_config()),
            settings: RwLock::new(settings),
            decision_log: Mutex::new(VecDeque::new()),
        };

        for route in self.routes {
            router.register_route(route);
        }

        Ok(router)
    }
}

// ============================================================================
// Intelligent Router
// ============================================================================

/// A decision together with the routes it resolved to (primary first)
struct Plan {
    decision: RoutingDecision,
    routes: Vec<Route>,
}

/// The main router
pub struct IntelligentRouter {
    provider: Arc<dyn ProviderAdapter>,
    classifier: RequestClassifier,
    health: Arc<HealthMonitor>,
    bandit: BanditOptimizer,
    fallback: FallbackController,
    tracker: PerformanceTracker,
    clock: Arc<dyn Clock>,
    /// Registered routes keyed by id (ordered for stable iteration)
    routes: RwLock<BTreeMap<String, Route>>,
    config: RwLock<RouterConfig>,
    settings: RwLock<RoutingSettings>,
    decision_log: Mutex<VecDeque<DecisionRecord>>,
}

impl std::fmt::Debug for IntelligentRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntelligentRouter")
            .field("routes", &self.routes.read().keys().collect::<Vec<_>>())
            .field("config", &*self.config.read())
            .finish_non_exhaustive()
    }
}

impl IntelligentRouter {
    /// Start building a router around a provider adapter
    pub fn builder(provider: Arc<dyn ProviderAdapter>) -> RouterBuilder {
        RouterBuilder::new(provider)
    }

    /// Router from loaded configuration (settings plus route table)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for out-of-range settings.
    pub fn from_config(
        provider: Arc<dyn ProviderAdapter>,
        config: &SwitchyardConfig,
    ) -> Result<Self, ConfigError> {
        Self::builder(provider)
            .with_settings(config.settings.clone())
            .with_routes(config.routes.clone())
            .build()
    }

    /// Get the health monitor
    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Get the bandit optimizer
    pub fn bandit(&self) -> &BanditOptimizer {
        &self.bandit
    }

    /// Get the performance tracker
    pub fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }

    /// Get the request classifier
    pub fn classifier(&self) -> &RequestClassifier {
        &self.classifier
    }

    /// Current settings
    #[must_use]
    pub fn settings(&self) -> RoutingSettings {
        self.settings.read().clone()
    }

    // ------------------------------------------------------------------------
    // Route registry
    // ------------------------------------------------------------------------

    /// Register (or update) a route; returns its id. Re-registering keeps
    /// the route's health and learned arms.
    pub fn register_route(&self, route: Route) -> String {
        let id = route.id();
        self.health
            .register(id.clone(), route.capabilities.default_latency_ms);
        let replaced = self.routes.write().insert(id.clone(), route).is_some();
        tracing::info!(route = %id, replaced, "Registered route");
        id
    }

    /// Remove a route. Its health and metric windows are dropped; bandit
    /// arms stay but are never consulted for unregistered routes.
    pub fn deregister_route(&self, route_id: &str) -> bool {
        let removed = self.routes.write().remove(route_id).is_some();
        if removed {
            self.health.deregister(route_id);
            self.tracker.remove_route(route_id);
            tracing::info!(route = %route_id, "Deregistered route");
        }
        removed
    }

    /// Registered routes, sorted by id
    #[must_use]
    pub fn routes(&self) -> Vec<Route> {
        self.routes.read().values().cloned().collect()
    }

    // ------------------------------------------------------------------------
    // Decisions
    // ------------------------------------------------------------------------

    fn expected_latency(&self, key: &ContextKey, route: &Route) -> f64 {
        self.bandit
            .expected_latency_ms(key, &route.id())
            .unwrap_or(route.capabilities.default_latency_ms as f64)
    }

    fn candidate_summary(&self, candidates: &[Route]) -> String {
        candidates
            .iter()
            .map(|r| {
                let id = r.id();
                let phase = self
                    .health
                    .phase(&id)
                    .map_or("unknown", |p| p.as_str());
                let score = self.health.health_score(&id).unwrap_or(0.0);
                format!("{id}={phase}({score:.0})")
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn plan(&self, context: &RoutingContext) -> Result<Plan, RoutingError> {
        let key = context.context_key();
        let matching: Vec<Route> = self
            .routes
            .read()
            .values()
            .filter(|r| r.supports(context))
            .cloned()
            .collect();

        if matching.is_empty() {
            return Err(RoutingError::NoRouteAvailable {
                context_key: key.to_string(),
            });
        }

        let available: Vec<Route> = matching
            .iter()
            .filter(|r| self.health.is_available(&r.id()))
            .cloned()
            .collect();

        let (candidates, degraded) = if !available.is_empty() {
            (available, false)
        } else if self.config.read().allow_degraded {
            tracing::warn!(
                context = %key,
                routes = matching.len(),
                "No healthy route - routing in degraded mode"
            );
            (matching, true)
        } else {
            return Err(RoutingError::NoRouteAvailable {
                context_key: key.to_string(),
            });
        };

        let ids: Vec<String> = candidates.iter().map(Route::id).collect();
        let health_summary = self.candidate_summary(&candidates);

        let (selection, ordered, reasoning) = if context.priority() == Priority::Emergency {
            // Safety first: lowest expected latency, no exploration
            let mut ranked: Vec<(f64, Route)> = candidates
                .into_iter()
                .map(|r| (self.expected_latency(&key, &r), r))
                .collect();
            ranked.sort_by(|(la, ra), (lb, rb)| {
                la.total_cmp(lb).then_with(|| ra.id().cmp(&rb.id()))
            });
            let latencies = ranked
                .iter()
                .map(|(l, r)| format!("{}={l:.0}ms", r.id()))
                .collect::<Vec<_>>()
                .join(", ");
            let chosen = ranked.first().map(|(_, r)| r.id()).unwrap_or_default();
            let reasoning = format!(
                "{}: chose {chosen} with the lowest expected latency; latencies [{latencies}]; candidates [{health_summary}]",
                SelectionMode::EmergencyDeterministic
            );
            (
                SelectionMode::EmergencyDeterministic,
                ranked.into_iter().map(|(_, r)| r).collect::<Vec<_>>(),
                reasoning,
            )
        } else if candidates.len() == 1 {
            let reasoning = format!(
                "{}: only {} matches; candidates [{health_summary}]",
                SelectionMode::SingleCandidate,
                ids[0]
            );
            (SelectionMode::SingleCandidate, candidates, reasoning)
        } else {
            let weights = self.bandit.get_weights(&key, &ids);
            let chosen = self
                .bandit
                .sample_route(&weights)
                .unwrap_or_else(|| ids[0].clone());
            let mut ordered = Vec::with_capacity(candidates.len());
            for id in std::iter::once(chosen.clone())
                .chain(weights.ranked().into_iter().filter(|id| *id != chosen))
            {
                if let Some(route) = candidates.iter().find(|r| r.id() == id) {
                    ordered.push(route.clone());
                }
            }
            let reasoning = format!(
                "{}: chose {chosen}; weights [{weights}]; candidates [{health_summary}]",
                SelectionMode::BanditSampled
            );
            (SelectionMode::BanditSampled, ordered, reasoning)
        };

        let chosen_route = ordered
            .first()
            .map(Route::id)
            .ok_or_else(|| RoutingError::NoRouteAvailable {
                context_key: key.to_string(),
            })?;

        let decision = RoutingDecision {
            request_id: uuid::Uuid::new_v4().to_string(),
            preferred_route: self.bandit.preferred_among(&key, &ids),
            alternatives: ordered.iter().skip(1).map(Route::id).collect(),
            context_key: key,
            chosen_route,
            fallback_used: false,
            reasoning: if degraded {
                format!("degraded: {reasoning}")
            } else {
                reasoning
            },
            selection,
            degraded,
            timestamp: chrono::Utc::now(),
        };

        Ok(Plan {
            decision,
            routes: ordered,
        })
    }

    /// Pick a route for a context without executing it
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::NoRouteAvailable`] when no registered route
    /// can serve the context.
    pub fn decide(&self, context: &RoutingContext) -> Result<RoutingDecision, RoutingError> {
        self.plan(context).map(|p| p.decision)
    }

    /// Decide and log the decision
    ///
    /// # Errors
    ///
    /// Same as [`IntelligentRouter::decide`].
    pub fn route(&self, context: &RoutingContext) -> Result<RoutingDecision, RoutingError> {
        let decision = self.decide(context)?;
        tracing::info!(
            request_id = %decision.request_id,
            context = %decision.context_key,
            route = %decision.chosen_route,
            selection = %decision.selection,
            degraded = decision.degraded,
            "Routing decision made"
        );
        Ok(decision)
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Decide, execute with fallback, and feed every outcome back
    ///
    /// # Errors
    ///
    /// `NoRouteAvailable` before execution; `RouteTimeout`,
    /// `RouteExecutionFailed` or `ExhaustedRoutes` (with the attempt trace)
    /// after it.
    pub async fn execute(
        &self,
        context: RoutingContext,
        payload: Value,
    ) -> Result<RoutedResponse, RoutingError> {
        // The budget starts before the decision so decision time counts
        let budget = DeadlineBudget::for_context(&context, self.clock.now());
        let Plan {
            mut decision,
            routes,
        } = self.plan(&context).inspect_err(|e| {
            tracing::warn!(context = %context.context_key(), error = %e, "Routing failed");
        })?;
        let Some((primary, alternatives)) = routes.split_first() else {
            return Err(RoutingError::NoRouteAvailable {
                context_key: decision.context_key.to_string(),
            });
        };

        tracing::debug!(
            request_id = %decision.request_id,
            route = %decision.chosen_route,
            selection = %decision.selection,
            reasoning = %decision.reasoning,
            "Executing routing decision"
        );

        let report = self
            .fallback
            .execute(
                ExecutionPlan {
                    request_id: &decision.request_id,
                    context: &context,
                    primary,
                    alternatives,
                    degraded: decision.degraded,
                    payload: &payload,
                    budget,
                },
                self.provider.as_ref(),
            )
            .await;

        for outcome in &report.outcomes {
            self.record_outcome(outcome);
        }
        self.tracker.record_decision(
            &decision.chosen_route,
            decision.preferred_route.as_deref(),
            report.fallback_used,
        );

        decision.fallback_used = report.fallback_used;
        let (error_kind, error) = match &report.result {
            Ok(_) => (None, None),
            Err(e) => (Some(e.kind().to_string()), Some(e.to_string())),
        };
        self.push_record(DecisionRecord {
            decision,
            outcomes: report.outcomes,
            error_kind,
            error,
            elapsed_ms: report.elapsed.as_millis() as u64,
            within_sla: report.within_sla,
        });

        report.result
    }

    /// Classify raw metadata, then execute
    ///
    /// # Errors
    ///
    /// `InvalidContext` for malformed metadata (never retried), otherwise as
    /// [`IntelligentRouter::execute`].
    pub async fn execute_request(
        &self,
        metadata: &RequestMetadata,
        payload: Value,
    ) -> Result<RoutedResponse, RoutingError> {
        let context = self.classifier.classify(metadata)?;
        self.execute(context, payload).await
    }

    /// Feed one outcome into health, bandit and metrics. Also the entry
    /// point for outcomes observed outside [`IntelligentRouter::execute`].
    pub fn record_outcome(&self, outcome: &Outcome) {
        if let Some(phase) =
            self.health
                .record_outcome(&outcome.route_id, outcome.success, outcome.latency_ms)
        {
            tracing::trace!(route = %outcome.route_id, phase = %phase, "Recorded outcome");
        }
        self.bandit.record_outcome(outcome);
        self.tracker.record_outcome(outcome);
    }

    fn push_record(&self, record: DecisionRecord) {
        let capacity = self.config.read().decision_log_capacity;
        let mut log = self.decision_log.lock();
        log.push_back(record);
        while log.len() > capacity {
            log.pop_front();
        }
    }

    /// The most recent `n` decision records, oldest first
    #[must_use]
    pub fn recent_decisions(&self, n: usize) -> Vec<DecisionRecord> {
        let log = self.decision_log.lock();
        let skip = log.len().saturating_sub(n);
        log.iter().skip(skip).cloned().collect()
    }

    // ------------------------------------------------------------------------
    // Monitoring
    // ------------------------------------------------------------------------

    /// Monitoring export. Reads only; two calls with no new outcomes (and no
    /// time passing) return identical values.
    #[must_use]
    pub fn get_stats(&self) -> RouterStats {
        let routes = self.routes();
        let route_ids: Vec<String> = routes.iter().map(Route::id).collect();

        let mut per_context = BTreeMap::new();
        for key in self.bandit.context_keys() {
            let tried: Vec<String> = self
                .bandit
                .arms_for_context(&key)
                .into_iter()
                .map(|a| a.route_id)
                .filter(|id| route_ids.contains(id))
                .collect();
            if tried.is_empty() {
                continue;
            }
            let weights: BTreeMap<String, f64> = self
                .bandit
                .expected_weights(&key, &tried)
                .iter()
                .map(|(id, w)| (id.to_string(), w))
                .collect();
            per_context.insert(key.to_string(), weights);
        }

        let per_route = routes
            .into_iter()
            .map(|route| {
                let id = route.id();
                let health = self.health.snapshot(&id);
                let latency = self.tracker.route_windows(&id);
                let success_rate = match (&latency, &health) {
                    (Some(w), _) if w.one_hour.samples > 0 => w.one_hour.success_rate,
                    (_, Some(h)) => h.success_rate,
                    _ => 1.0,
                };
                let bandit_weights = per_context
                    .iter()
                    .filter_map(|(ctx, weights)| weights.get(&id).map(|w| (ctx.clone(), *w)))
                    .collect();
                let stats = RouteStats {
                    route,
                    health,
                    latency,
                    success_rate,
                    bandit_weights,
                };
                (id, stats)
            })
            .collect();

        RouterStats {
            per_route,
            per_context,
            efficiency: self.tracker.efficiency(),
            alerts_fired: self.tracker.alerts_fired(),
        }
    }

    /// Prometheus text exposition (tracker metrics plus circuit gauges)
    #[must_use]
    pub fn prometheus(&self) -> String {
        let mut output = self.tracker.to_prometheus();

        output.push_str(
            "\n# HELP switchyard_route_health_score Composite route health 0-100\n\
             # TYPE switchyard_route_health_score gauge\n",
        );
        let snapshots = self.health.all_snapshots();
        for s in &snapshots {
            let _ = writeln!(
                output,
                "switchyard_route_health_score{{route=\"{}\"}} {:.1}",
                s.route_id, s.health_score
            );
        }

        output.push_str(
            "\n# HELP switchyard_circuit_open Whether the route's circuit is open\n\
             # TYPE switchyard_circuit_open gauge\n",
        );
        for s in &snapshots {
            let _ = writeln!(
                output,
                "switchyard_circuit_open{{route=\"{}\"}} {}",
                s.route_id,
                u8::from(s.phase == CircuitPhase::Open)
            );
        }

        output
    }

    // ------------------------------------------------------------------------
    // Hot reload
    // ------------------------------------------------------------------------

    /// Swap in new tunables without losing learned state
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] and leaves the router
    /// untouched if the settings are out of range.
    pub fn apply_settings(&self, settings: &RoutingSettings) -> Result<(), ConfigError> {
        settings.validate()?;

        self.classifier.set_sla_table(settings.sla);
        self.health.set_config(settings.health_config());
        self.bandit.set_config(settings.bandit_config());
        self.fallback.set_config(settings.fallback_config());
        *self.config.write() = settings.router_config();
        *self.settings.write() = settings.clone();

        {
            let mut log = self.decision_log.lock();
            while log.len() > settings.decision_log_capacity {
                log.pop_front();
            }
        }

        tracing::info!(
            failure_threshold = settings.failure_threshold,
            cooldown_ms = settings.cooldown_period.as_millis() as u64,
            exploration_floor = settings.exploration_floor,
            "Routing settings applied"
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Health probing
    // ------------------------------------------------------------------------

    /// One probe sweep over routes waiting for a half-open probe. Returns
    /// the resulting phase for each probed route.
    pub async fn probe_routes(&self, probe: &dyn HealthProbe) -> Vec<(String, CircuitPhase)> {
        let timeout = self.health.config().probe_timeout;
        let mut results = Vec::new();

        for route_id in self.health.routes_due_for_probe() {
            if !self.health.begin_attempt(&route_id) {
                continue;
            }
            let healthy = tokio::time::timeout(timeout, probe.probe(&route_id))
                .await
                .unwrap_or(false);
            if let Some(phase) = self.health.record_probe(&route_id, healthy) {
                tracing::debug!(route = %route_id, healthy, phase = %phase, "Health probe completed");
                results.push((route_id, phase));
            }
        }

        results
    }

    /// Run probe sweeps every `interval` until the handle is aborted or the
    /// router is dropped
    pub fn spawn_health_prober(
        self: &Arc<Self>,
        probe: Arc<dyn HealthProbe>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let router: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(router) = router.upgrade() else {
                    break;
                };
                router.probe_routes(probe.as_ref()).await;
            }
            tracing::debug!("Health prober stopped");
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
