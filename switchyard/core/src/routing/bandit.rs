//! Thompson Sampling Bandit Optimizer
//!
//! One arm per (context key, route). Each arm keeps success/failure counts
//! that parameterize a Beta(successes + 1, failures + 1) posterior over the
//! route's success rate in that context.
//!
//! ## Weights
//!
//! 1. Draw θᵢ ~ Beta(sᵢ + 1, fᵢ + 1) for every eligible route
//! 2. Normalize the draws into a distribution
//! 3. Routes with fewer than `min_trials` trials get a guaranteed
//!    `exploration_floor` share; the rest of the mass is scaled down to make
//!    room, so the weights still sum to 1
//!
//! The random source is injected so decisions are reproducible in tests.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::prelude::*;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};

use super::types::{ContextKey, Outcome};

// ============================================================================
// Random Source
// ============================================================================

/// Pluggable source of randomness for sampling
pub trait RandomSource: Send {
    /// Draw from Beta(alpha, beta)
    fn sample_beta(&mut self, alpha: f64, beta: f64) -> f64;

    /// Uniform draw from [0, 1)
    fn next_f64(&mut self) -> f64;
}

/// `StdRng`-backed random source
#[derive(Debug)]
pub struct SeededRandom {
    rng: StdRng,
}

impl SeededRandom {
    /// Reproducible source
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Source seeded from the OS
    #[must_use]
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl RandomSource for SeededRandom {
    fn sample_beta(&mut self, alpha: f64, beta: f64) -> f64 {
        if alpha <= 0.0 || beta <= 0.0 {
            return 0.5;
        }
        match Beta::new(alpha, beta) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(_) => 0.5,
        }
    }

    fn next_f64(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Bandit tuning
#[derive(Clone, Debug, PartialEq)]
pub struct BanditConfig {
    /// Weight of the newest sample in latency/cost moving averages
    pub ema_decay: f64,

    /// Trials below which a route gets the exploration floor
    pub min_trials: u64,

    /// Guaranteed share for under-tried routes (0.0 - 0.5)
    pub exploration_floor: f64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            ema_decay: 0.1,
            min_trials: 5,
            exploration_floor: 0.05,
        }
    }
}

// ============================================================================
// Bandit Arm
// ============================================================================

/// Statistics for one route within one context
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BanditArm {
    /// Context the arm belongs to
    pub context_key: ContextKey,
    /// Route the arm measures
    pub route_id: String,
    /// Successful attempts
    pub successes: u64,
    /// Failed attempts
    pub failures: u64,
    /// Latency moving average over successful attempts (ms)
    pub latency_ema_ms: Option<f64>,
    /// Cost moving average (minor units)
    pub cost_ema: Option<f64>,
}

impl BanditArm {
    /// Empty arm
    pub fn new(context_key: ContextKey, route_id: impl Into<String>) -> Self {
        Self {
            context_key,
            route_id: route_id.into(),
            successes: 0,
            failures: 0,
            latency_ema_ms: None,
            cost_ema: None,
        }
    }

    /// successes + failures
    #[must_use]
    pub fn trials(&self) -> u64 {
        self.successes + self.failures
    }

    /// Beta alpha parameter
    #[must_use]
    pub fn alpha(&self) -> f64 {
        self.successes as f64 + 1.0
    }

    /// Beta beta parameter
    #[must_use]
    pub fn beta(&self) -> f64 {
        self.failures as f64 + 1.0
    }

    /// Posterior mean success rate
    #[must_use]
    pub fn posterior_mean(&self) -> f64 {
        self.alpha() / (self.alpha() + self.beta())
    }

    fn update(&mut self, outcome: &Outcome, decay: f64) {
        if outcome.success {
            self.successes += 1;
            self.latency_ema_ms = Some(ema(self.latency_ema_ms, outcome.latency_ms as f64, decay));
        } else {
            self.failures += 1;
        }
        self.cost_ema = Some(ema(self.cost_ema, outcome.cost_units as f64, decay));
    }
}

fn ema(current: Option<f64>, sample: f64, decay: f64) -> f64 {
    match current {
        Some(value) => decay * sample + (1.0 - decay) * value,
        None => sample,
    }
}

// ============================================================================
// Route Weights
// ============================================================================

/// Traffic allocation over eligible routes; sums to 1 when non-empty
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteWeights {
    entries: Vec<(String, f64)>,
}

impl RouteWeights {
    /// Weight of a route
    #[must_use]
    pub fn get(&self, route_id: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(id, _)| id == route_id)
            .map(|(_, w)| *w)
    }

    /// (route, weight) pairs in candidate order
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(id, w)| (id.as_str(), *w))
    }

    /// Sum of weights
    #[must_use]
    pub fn total(&self) -> f64 {
        self.entries.iter().map(|(_, w)| w).sum()
    }

    /// Number of routes
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no routes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Route whose cumulative weight interval contains `u` (in [0, 1))
    #[must_use]
    pub fn pick(&self, u: f64) -> Option<&str> {
        let mut cumulative = 0.0;
        for (id, w) in &self.entries {
            cumulative += w;
            if u < cumulative {
                return Some(id.as_str());
            }
        }
        // Rounding can leave the last interval a hair short
        self.entries.last().map(|(id, _)| id.as_str())
    }

    /// Routes ordered by weight, heaviest first (ties by id)
    #[must_use]
    pub fn ranked(&self) -> Vec<String> {
        let mut sorted = self.entries.clone();
        sorted.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        sorted.into_iter().map(|(id, _)| id).collect()
    }
}

impl std::fmt::Display for RouteWeights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (id, w)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{id}={w:.3}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Bandit Optimizer
// ============================================================================

type ArmKey = (ContextKey, String);

/// Per-(context, route) Thompson sampling
pub struct BanditOptimizer {
    arms: DashMap<ArmKey, BanditArm>,
    config: RwLock<BanditConfig>,
    rng: Mutex<Box<dyn RandomSource>>,
}

impl std::fmt::Debug for BanditOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BanditOptimizer")
            .field("arms", &self.arms.len())
            .field("config", &*self.config.read())
            .finish()
    }
}

impl Default for BanditOptimizer {
    fn default() -> Self {
        Self::new(BanditConfig::default(), Box::new(SeededRandom::from_entropy()))
    }
}

impl BanditOptimizer {
    /// Create an optimizer with an injected random source
    pub fn new(config: BanditConfig, rng: Box<dyn RandomSource>) -> Self {
        Self {
            arms: DashMap::new(),
            config: RwLock::new(config),
            rng: Mutex::new(rng),
        }
    }

    /// Reproducible optimizer (tests)
    #[must_use]
    pub fn with_seed(config: BanditConfig, seed: u64) -> Self {
        Self::new(config, Box::new(SeededRandom::with_seed(seed)))
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> BanditConfig {
        self.config.read().clone()
    }

    /// Replace configuration; learned arms are kept
    pub fn set_config(&self, config: BanditConfig) {
        *self.config.write() = config;
    }

    /// Fold one outcome into its arm, creating the arm on first use
    pub fn record_outcome(&self, outcome: &Outcome) {
        let decay = self.config.read().ema_decay;
        self.arms
            .entry((outcome.context_key.clone(), outcome.route_id.clone()))
            .or_insert_with(|| BanditArm::new(outcome.context_key.clone(), outcome.route_id.clone()))
            .update(outcome, decay);
    }

    /// Copy of one arm
    #[must_use]
    pub fn arm(&self, context_key: &ContextKey, route_id: &str) -> Option<BanditArm> {
        self.arms
            .get(&(context_key.clone(), route_id.to_string()))
            .map(|a| a.value().clone())
    }

    /// All arms for a context, sorted by route id
    #[must_use]
    pub fn arms_for_context(&self, context_key: &ContextKey) -> Vec<BanditArm> {
        let mut arms: Vec<BanditArm> = self
            .arms
            .iter()
            .filter(|e| &e.key().0 == context_key)
            .map(|e| e.value().clone())
            .collect();
        arms.sort_by(|a, b| a.route_id.cmp(&b.route_id));
        arms
    }

    /// Number of arms across all contexts
    #[must_use]
    pub fn arm_count(&self) -> usize {
        self.arms.len()
    }

    /// Every context key with at least one arm, sorted
    #[must_use]
    pub fn context_keys(&self) -> Vec<ContextKey> {
        let mut keys: Vec<ContextKey> = self.arms.iter().map(|e| e.key().0.clone()).collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Seed an arm with prior counts (warm start, tests)
    pub fn seed_arm(&self, context_key: &ContextKey, route_id: &str, successes: u64, failures: u64) {
        let mut arm = self
            .arms
            .entry((context_key.clone(), route_id.to_string()))
            .or_insert_with(|| BanditArm::new(context_key.clone(), route_id));
        arm.successes = successes;
        arm.failures = failures;
    }

    /// Latency moving average for a route in a context, once it has served
    /// a request successfully
    #[must_use]
    pub fn expected_latency_ms(&self, context_key: &ContextKey, route_id: &str) -> Option<f64> {
        self.arm(context_key, route_id)
            .and_then(|a| a.latency_ema_ms)
    }

    fn counts(&self, context_key: &ContextKey, routes: &[String]) -> Vec<(u64, u64)> {
        routes
            .iter()
            .map(|id| {
                self.arm(context_key, id)
                    .map_or((0, 0), |a| (a.successes, a.failures))
            })
            .collect()
    }

    /// Sampled traffic allocation over `eligible` (Thompson sampling)
    pub fn get_weights(&self, context_key: &ContextKey, eligible: &[String]) -> RouteWeights {
        let counts = self.counts(context_key, eligible);
        let draws: Vec<f64> = {
            let mut rng = self.rng.lock();
            counts
                .iter()
                .map(|&(s, f)| rng.sample_beta(s as f64 + 1.0, f as f64 + 1.0))
                .collect()
        };
        self.allocate(eligible, &counts, &draws)
    }

    /// Deterministic allocation from posterior means; used for reporting
    #[must_use]
    pub fn expected_weights(&self, context_key: &ContextKey, eligible: &[String]) -> RouteWeights {
        let counts = self.counts(context_key, eligible);
        let means: Vec<f64> = counts
            .iter()
            .map(|&(s, f)| (s as f64 + 1.0) / ((s + f) as f64 + 2.0))
            .collect();
        self.allocate(eligible, &counts, &means)
    }

    fn allocate(&self, routes: &[String], counts: &[(u64, u64)], scores: &[f64]) -> RouteWeights {
        let n = routes.len();
        if n == 0 {
            return RouteWeights::default();
        }
        if n == 1 {
            return RouteWeights {
                entries: vec![(routes[0].clone(), 1.0)],
            };
        }

        let sum: f64 = scores.iter().map(|s| s.max(0.0)).sum();
        let normalized: Vec<f64> = if sum > 0.0 && sum.is_finite() {
            scores.iter().map(|s| s.max(0.0) / sum).collect()
        } else {
            vec![1.0 / n as f64; n]
        };

        let config = self.config.read();
        let under_tried: Vec<bool> = counts
            .iter()
            .map(|&(s, f)| s + f < config.min_trials)
            .collect();
        let starved = under_tried.iter().filter(|u| **u).count();
        let floor = if starved == 0 {
            0.0
        } else {
            config.exploration_floor.min(1.0 / starved as f64)
        };
        let remaining = 1.0 - floor * starved as f64;

        let entries = routes
            .iter()
            .zip(normalized)
            .zip(under_tried)
            .map(|((id, p), starved)| {
                let w = remaining * p + if starved { floor } else { 0.0 };
                (id.clone(), w)
            })
            .collect();

        RouteWeights { entries }
    }

    /// Draw a route from a weight distribution
    pub fn sample_route(&self, weights: &RouteWeights) -> Option<String> {
        let u = self.rng.lock().next_f64();
        weights.pick(u).map(str::to_string)
    }

    /// Route with the highest posterior mean among the context's arms.
    /// Diagnostics only.
    #[must_use]
    pub fn get_best_arm(&self, context_key: &ContextKey) -> Option<(String, f64)> {
        self.arms_for_context(context_key)
            .into_iter()
            .map(|a| {
                let mean = a.posterior_mean();
                (a.route_id, mean)
            })
            .fold(None, |best, (id, mean)| match best {
                Some((_, best_mean)) if best_mean >= mean => best,
                _ => Some((id, mean)),
            })
    }

    /// Candidate with the highest posterior mean (untried routes count as 0.5)
    #[must_use]
    pub fn preferred_among(&self, context_key: &ContextKey, candidates: &[String]) -> Option<String> {
        let counts = self.counts(context_key, candidates);
        candidates
            .iter()
            .zip(counts)
            .map(|(id, (s, f))| (id, (s as f64 + 1.0) / ((s + f) as f64 + 2.0)))
            .fold(None::<(&String, f64)>, |best, (id, mean)| match best {
                Some((best_id, best_mean))
                    if best_mean > mean || (best_mean == mean && best_id <= id) =>
                {
                    best
                }
                _ => Some((id, mean)),
            })
            .map(|(id, _)| id.clone())
    }
}
