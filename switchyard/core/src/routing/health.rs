//! Route Health Tracking and Circuit Breaker
//!
//! Tracks per-route success/failure/latency history and isolates failing
//! routes with a circuit breaker:
//!
//! ```text
//! +--------+  5 consecutive failures   +-------+   cooldown elapsed   +-----------+
//! | Closed | ------------------------> | Open  | -------------------> | Half-Open |
//! +--------+  or window rate < 80%     +-------+                      +-----------+
//!     ^                                    ^      probe fails,             |
//!     |                                    +----- cooldown doubles --------+
//!     |               probe succeeds                                       |
//!     +--------------------------------------------------------------------+
//! ```
//!
//! - **Closed**: normal operation
//! - **Open**: route excluded from candidacy
//! - **Half-Open**: one probe at a time (live request or synthetic check)
//!
//! # Thread Safety
//!
//! Each route's state lives behind its own mutex inside a `DashMap`, so every
//! read-modify-write for one route is serialized while different routes never
//! share a lock. Open routes become Half-Open lazily, on the first read after
//! the cooldown.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::clock::{Clock, SystemClock};

// ============================================================================
// Circuit Breaker State
// ============================================================================

/// Circuit breaker state with the data each state needs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Isolated until `since + cooldown`
    Open {
        /// When the circuit opened
        since: Instant,
        /// How long to stay open
        cooldown: Duration,
    },

    /// Probing; `probe_deadline` is set while a probe is in flight
    HalfOpen {
        /// When the in-flight probe is considered lost
        probe_deadline: Option<Instant>,
    },
}

impl CircuitState {
    /// Data-free view of the state
    #[must_use]
    pub fn phase(&self) -> CircuitPhase {
        match self {
            Self::Closed => CircuitPhase::Closed,
            Self::Open { .. } => CircuitPhase::Open,
            Self::HalfOpen { .. } => CircuitPhase::HalfOpen,
        }
    }
}

/// Circuit breaker phase, for reporting and admin overrides
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    /// Normal operation
    Closed,
    /// Route isolated
    Open,
    /// Route probing
    HalfOpen,
}

impl CircuitPhase {
    /// Lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Health Configuration
// ============================================================================

/// Configuration for health tracking behavior
#[derive(Clone, Debug, PartialEq)]
pub struct HealthConfig {
    /// Consecutive failures (inside `failure_window`) that open the circuit
    pub failure_threshold: u32,

    /// Sliding window for failure counting and success rate
    pub failure_window: Duration,

    /// Window success rate below which the circuit opens (0.0 - 1.0)
    pub min_success_rate: f64,

    /// Samples required in the window before the success rate can trip
    pub min_window_samples: usize,

    /// Base time to stay open before probing
    pub cooldown_period: Duration,

    /// Cap for the exponentially backed-off cooldown
    pub max_cooldown: Duration,

    /// How long a half-open probe may stay in flight before another is admitted
    pub probe_timeout: Duration,

    /// Alpha for the latency moving average (0.0 - 1.0)
    pub latency_ema_alpha: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            min_success_rate: 0.8,
            min_window_samples: 10,
            cooldown_period: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(10),
            latency_ema_alpha: 0.3,
        }
    }
}

impl HealthConfig {
    /// Cooldown after the `trips`-th consecutive re-open (0 = first trip)
    #[must_use]
    pub fn cooldown_for_trip(&self, trips: u32) -> Duration {
        let factor = 2u32.saturating_pow(trips.min(16));
        self.cooldown_period
            .saturating_mul(factor)
            .min(self.max_cooldown)
    }
}

// ============================================================================
// Route Health
// ============================================================================

/// Health state for a single route
#[derive(Debug)]
pub struct RouteHealth {
    route_id: String,
    target_latency_ms: u64,
    state: CircuitState,
    consecutive_failures: u32,
    /// (time, success) samples inside the failure window
    window: VecDeque<(Instant, bool)>,
    last_failure: Option<Instant>,
    last_probe: Option<Instant>,
    /// Re-opens since the circuit last closed; drives cooldown backoff
    trips: u32,
    latency_ema_ms: Option<f64>,
    total_successes: u64,
    total_failures: u64,
}

impl RouteHealth {
    /// Fresh, closed health record
    pub fn new(route_id: impl Into<String>, target_latency_ms: u64) -> Self {
        Self {
            route_id: route_id.into(),
            target_latency_ms: target_latency_ms.max(1),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            window: VecDeque::new(),
            last_failure: None,
            last_probe: None,
            trips: 0,
            latency_ema_ms: None,
            total_successes: 0,
            total_failures: 0,
        }
    }

    /// Current state, after applying any due Open -> HalfOpen transition
    pub fn state(&mut self, now: Instant, config: &HealthConfig) -> CircuitState {
        self.refresh(now, config);
        self.state
    }

    fn refresh(&mut self, now: Instant, config: &HealthConfig) {
        while let Some(&(at, _)) = self.window.front() {
            if now.saturating_duration_since(at) > config.failure_window {
                self.window.pop_front();
            } else {
                break;
            }
        }

        if let CircuitState::Open { since, cooldown } = self.state {
            if now.saturating_duration_since(since) >= cooldown {
                self.state = CircuitState::HalfOpen {
                    probe_deadline: None,
                };
                tracing::info!(route = %self.route_id, "Circuit breaker transitioning to half-open");
            }
        }
    }

    /// Whether a request may be sent now (Closed, or HalfOpen with a free probe slot)
    pub fn is_available(&mut self, now: Instant, config: &HealthConfig) -> bool {
        match self.state(now, config) {
            CircuitState::Closed => true,
            CircuitState::Open { .. } => false,
            CircuitState::HalfOpen { probe_deadline } => {
                probe_deadline.is_none_or(|deadline| deadline <= now)
            }
        }
    }

    /// Register an attempt about to start. In HalfOpen this claims the probe
    /// slot; returns false if the route should not be attempted.
    pub fn begin_attempt(&mut self, now: Instant, config: &HealthConfig) -> bool {
        if !self.is_available(now, config) {
            return false;
        }
        if let CircuitState::HalfOpen { .. } = self.state {
            self.state = CircuitState::HalfOpen {
                probe_deadline: Some(now + config.probe_timeout),
            };
            self.last_probe = Some(now);
        }
        true
    }

    /// Record an attempt result. `latency_ms` is `None` for synthetic probes.
    pub fn record(
        &mut self,
        now: Instant,
        success: bool,
        latency_ms: Option<u64>,
        config: &HealthConfig,
    ) -> CircuitPhase {
        self.refresh(now, config);

        self.window.push_back((now, success));
        if let Some(ms) = latency_ms {
            let sample = ms as f64;
            self.latency_ema_ms = Some(match self.latency_ema_ms {
                Some(ema) => config.latency_ema_alpha * sample + (1.0 - config.latency_ema_alpha) * ema,
                None => sample,
            });
        }

        if success {
            self.total_successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.total_failures += 1;
            let stale = self
                .last_failure
                .is_some_and(|t| now.saturating_duration_since(t) > config.failure_window);
            if stale {
                self.consecutive_failures = 0;
            }
            self.consecutive_failures += 1;
            self.last_failure = Some(now);
        }

        match self.state {
            CircuitState::Closed => {
                if !success && self.should_trip(config) {
                    self.trips = 0;
                    self.open(now, config);
                }
            }
            CircuitState::HalfOpen { .. } => {
                self.last_probe = Some(now);
                if success {
                    self.close(now);
                } else {
                    self.trips = self.trips.saturating_add(1);
                    self.open(now, config);
                }
            }
            // Late results from requests started before the trip
            CircuitState::Open { .. } => {}
        }

        self.state.phase()
    }

    fn should_trip(&self, config: &HealthConfig) -> bool {
        if self.consecutive_failures >= config.failure_threshold {
            return true;
        }
        self.window.len() >= config.min_window_samples
            && self.window_success_rate() < config.min_success_rate
    }

    fn open(&mut self, now: Instant, config: &HealthConfig) {
        let cooldown = config.cooldown_for_trip(self.trips);
        self.state = CircuitState::Open {
            since: now,
            cooldown,
        };
        tracing::warn!(
            route = %self.route_id,
            consecutive_failures = self.consecutive_failures,
            success_rate = self.window_success_rate(),
            cooldown_ms = cooldown.as_millis() as u64,
            "Circuit breaker opened - route isolated"
        );
    }

    fn close(&mut self, now: Instant) {
        self.state = CircuitState::Closed;
        self.trips = 0;
        self.consecutive_failures = 0;
        self.window.clear();
        self.window.push_back((now, true));
        tracing::info!(route = %self.route_id, "Circuit breaker closed - route recovered");
    }

    /// Success rate over the window (1.0 when empty)
    #[must_use]
    pub fn window_success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let ok = self.window.iter().filter(|(_, s)| *s).count();
        ok as f64 / self.window.len() as f64
    }

    /// Composite score 0-100: success rate (50%), latency vs target (30%),
    /// failure recency (20%). Open routes score 0. Recency advances in whole
    /// seconds.
    pub fn health_score(&mut self, now: Instant, config: &HealthConfig) -> f64 {
        if let CircuitState::Open { .. } = self.state(now, config) {
            return 0.0;
        }

        let success = self.window_success_rate();
        let latency = match self.latency_ema_ms {
            Some(ema) if ema > 0.0 => (self.target_latency_ms as f64 / ema).min(1.0),
            _ => 1.0,
        };
        // Whole seconds, so repeated reads between events agree
        let recency = match self.last_failure {
            None => 1.0,
            Some(t) => {
                let window = config.failure_window.as_secs_f64().max(1.0);
                (whole_secs_since(now, t) as f64 / window).min(1.0)
            }
        };

        100.0 * (0.5 * success + 0.3 * latency + 0.2 * recency)
    }

    fn force(&mut self, now: Instant, phase: CircuitPhase, config: &HealthConfig) {
        self.state = match phase {
            CircuitPhase::Closed => {
                self.consecutive_failures = 0;
                self.trips = 0;
                CircuitState::Closed
            }
            CircuitPhase::Open => CircuitState::Open {
                since: now,
                cooldown: config.cooldown_for_trip(self.trips),
            },
            CircuitPhase::HalfOpen => CircuitState::HalfOpen {
                probe_deadline: None,
            },
        };
    }

    fn snapshot(&mut self, now: Instant, config: &HealthConfig) -> HealthSnapshot {
        let state = self.state(now, config);
        let cooldown_remaining_secs = match state {
            CircuitState::Open { since, cooldown } => {
                let left = (since + cooldown).saturating_duration_since(now);
                Some(left.as_secs() + u64::from(left.subsec_nanos() > 0))
            }
            _ => None,
        };
        HealthSnapshot {
            route_id: self.route_id.clone(),
            phase: state.phase(),
            health_score: self.health_score(now, config),
            success_rate: self.window_success_rate(),
            window_samples: self.window.len(),
            consecutive_failures: self.consecutive_failures,
            latency_ema_ms: self.latency_ema_ms,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            cooldown_remaining_secs,
            secs_since_last_failure: self.last_failure.map(|t| whole_secs_since(now, t)),
            secs_since_last_probe: self.last_probe.map(|t| whole_secs_since(now, t)),
        }
    }
}

fn whole_secs_since(now: Instant, then: Instant) -> u64 {
    now.saturating_duration_since(then).as_secs()
}

// ============================================================================
// Health Snapshot
// ============================================================================

/// Immutable view of one route's health at a point in time
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Route identifier
    pub route_id: String,
    /// Circuit phase
    pub phase: CircuitPhase,
    /// Composite score 0-100
    pub health_score: f64,
    /// Success rate in the sliding window (0.0 - 1.0)
    pub success_rate: f64,
    /// Samples in the sliding window
    pub window_samples: usize,
    /// Consecutive failures
    pub consecutive_failures: u32,
    /// Latency moving average (ms)
    pub latency_ema_ms: Option<f64>,
    /// Lifetime successes
    pub total_successes: u64,
    /// Lifetime failures
    pub total_failures: u64,
    /// Seconds left before probing (rounded up), when open
    pub cooldown_remaining_secs: Option<u64>,
    /// Whole seconds since the last failure
    pub secs_since_last_failure: Option<u64>,
    /// Whole seconds since the last probe
    pub secs_since_last_probe: Option<u64>,
}

// ============================================================================
// Health Monitor
// ============================================================================

/// Health state for every registered route
pub struct HealthMonitor {
    routes: DashMap<String, Arc<Mutex<RouteHealth>>>,
    config: RwLock<HealthConfig>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("routes", &self.routes.len())
            .field("config", &*self.config.read())
            .finish()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default(), Arc::new(SystemClock))
    }
}

impl HealthMonitor {
    /// Create a monitor
    pub fn new(config: HealthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            routes: DashMap::new(),
            config: RwLock::new(config),
            clock,
        }
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> HealthConfig {
        self.config.read().clone()
    }

    /// Replace the configuration; existing state is kept
    pub fn set_config(&self, config: HealthConfig) {
        *self.config.write() = config;
    }

    /// Start tracking a route. Re-registering keeps existing state and only
    /// updates the latency target.
    pub fn register(&self, route_id: impl Into<String>, target_latency_ms: u64) {
        let route_id = route_id.into();
        self.routes
            .entry(route_id.clone())
            .and_modify(|h| h.lock().target_latency_ms = target_latency_ms.max(1))
            .or_insert_with(|| Arc::new(Mutex::new(RouteHealth::new(route_id, target_latency_ms))));
    }

    /// Stop tracking a route
    pub fn deregister(&self, route_id: &str) -> bool {
        self.routes.remove(route_id).is_some()
    }

    /// Whether a route is tracked
    #[must_use]
    pub fn contains(&self, route_id: &str) -> bool {
        self.routes.contains_key(route_id)
    }

    /// Number of tracked routes
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    fn with_route<T>(
        &self,
        route_id: &str,
        f: impl FnOnce(&mut RouteHealth, Instant, &HealthConfig) -> T,
    ) -> Option<T> {
        // Clone the Arc so the shard lock is released before the route lock is taken
        let entry = self.routes.get(route_id).map(|e| Arc::clone(e.value()))?;
        let config = self.config.read().clone();
        let now = self.clock.now();
        let mut health = entry.lock();
        Some(f(&mut health, now, &config))
    }

    /// Circuit phase of a route
    #[must_use]
    pub fn phase(&self, route_id: &str) -> Option<CircuitPhase> {
        self.with_route(route_id, |h, now, cfg| h.state(now, cfg).phase())
    }

    /// Full circuit state of a route
    #[must_use]
    pub fn state(&self, route_id: &str) -> Option<CircuitState> {
        self.with_route(route_id, |h, now, cfg| h.state(now, cfg))
    }

    /// Whether the route is isolated. Unknown routes count as open.
    #[must_use]
    pub fn is_open(&self, route_id: &str) -> bool {
        self.phase(route_id)
            .is_none_or(|p| p == CircuitPhase::Open)
    }

    /// Whether the route may take a request right now
    #[must_use]
    pub fn is_available(&self, route_id: &str) -> bool {
        self.with_route(route_id, |h, now, cfg| h.is_available(now, cfg))
            .unwrap_or(false)
    }

    /// Claim the route for an attempt (takes the probe slot when half-open)
    pub fn begin_attempt(&self, route_id: &str) -> bool {
        self.with_route(route_id, |h, now, cfg| h.begin_attempt(now, cfg))
            .unwrap_or(false)
    }

    /// Record a live request outcome; returns the resulting phase
    pub fn record_outcome(&self, route_id: &str, success: bool, latency_ms: u64) -> Option<CircuitPhase> {
        self.with_route(route_id, |h, now, cfg| {
            h.record(now, success, Some(latency_ms), cfg)
        })
    }

    /// Record a synthetic probe result; returns the resulting phase
    pub fn record_probe(&self, route_id: &str, healthy: bool) -> Option<CircuitPhase> {
        self.with_route(route_id, |h, now, cfg| h.record(now, healthy, None, cfg))
    }

    /// Composite health score 0-100
    #[must_use]
    pub fn health_score(&self, route_id: &str) -> Option<f64> {
        self.with_route(route_id, |h, now, cfg| h.health_score(now, cfg))
    }

    /// Snapshot of one route
    #[must_use]
    pub fn snapshot(&self, route_id: &str) -> Option<HealthSnapshot> {
        self.with_route(route_id, |h, now, cfg| h.snapshot(now, cfg))
    }

    /// Snapshots of every route, sorted by route id
    #[must_use]
    pub fn all_snapshots(&self) -> Vec<HealthSnapshot> {
        let mut ids: Vec<String> = self.routes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids.iter().filter_map(|id| self.snapshot(id)).collect()
    }

    /// Routes waiting for a probe: half-open (including open past cooldown)
    /// with no probe in flight
    #[must_use]
    pub fn routes_due_for_probe(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.routes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids.into_iter()
            .filter(|id| {
                self.with_route(id, |h, now, cfg| {
                    matches!(h.state(now, cfg), CircuitState::HalfOpen { .. })
                        && h.is_available(now, cfg)
                })
                .unwrap_or(false)
            })
            .collect()
    }

    /// Force a route into a phase (admin/testing)
    pub fn force_state(&self, route_id: &str, phase: CircuitPhase) -> bool {
        self.with_route(route_id, |h, now, cfg| {
            tracing::info!(route = %route_id, phase = %phase, "Circuit breaker state forced");
            h.force(now, phase, cfg);
        })
        .is_some()
    }

    /// Discard all history for a route
    pub fn reset(&self, route_id: &str) -> bool {
        self.with_route(route_id, |h, _, _| {
            *h = RouteHealth::new(h.route_id.clone(), h.target_latency_ms);
        })
        .is_some()
    }
}
