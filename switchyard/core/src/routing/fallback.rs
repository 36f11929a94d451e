//! Fallback Execution
//!
//! Runs a routing decision against the provider adapter and substitutes the
//! next-best route when the primary fails or runs out of time.
//!
//! # Flow
//!
//! ```text
//! primary route ──ok──────────────────────────────> response
//!      │
//!      └─ timeout / transient error
//!             │ residual budget >= min attempt window?
//!             ├─ no ──> fail fast
//!             └─ yes ─> next untried, non-open alternative ──ok──> response
//!                              │
//!                              └─ fails ──> ExhaustedRoutes (full trace)
//! ```
//!
//! A route whose breaker refuses the attempt (circuit opened since the
//! decision, or its single half-open trial already claimed by another
//! request) is never called; the next alternative takes its place.
//!
//! The remaining time is carried as an explicit [`DeadlineBudget`]. For
//! emergency and critical requests every attempt is bounded by the budget and
//! abandoned when it runs out (the provider call may keep running in the
//! background, but its result is ignored). For standard requests the
//! deadline is advisory: overruns are logged, not cut short.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::time::Instant;

use super::error::{AttemptFailure, AttemptTrace, FailureReason, RoutingError};
use super::health::HealthMonitor;
use super::types::{Outcome, Route, RoutingContext};
use crate::clock::Clock;
use crate::provider::{ProviderAdapter, ProviderRequest};

// ============================================================================
// Configuration
// ============================================================================

/// Fallback policy
#[derive(Clone, Debug, PartialEq)]
pub struct FallbackConfig {
    /// Substitute routes tried after the primary fails; settings
    /// validation keeps this at 0 or 1
    pub max_hops: usize,

    /// Tolerance past the deadline still counted as meeting the SLA
    pub grace_margin: Duration,

    /// Smallest residual budget worth a fallback attempt
    pub min_attempt_window: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_hops: 1,
            grace_margin: Duration::from_millis(500),
            min_attempt_window: Duration::from_millis(200),
        }
    }
}

// ============================================================================
// Deadline Budget
// ============================================================================

/// Wall-clock budget for one request, threaded through every attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeadlineBudget {
    started: Instant,
    deadline: Duration,
    enforced: bool,
}

impl DeadlineBudget {
    /// Budget starting at `started`
    #[must_use]
    pub fn new(started: Instant, deadline: Duration, enforced: bool) -> Self {
        Self {
            started,
            deadline,
            enforced,
        }
    }

    /// Budget for a context: its SLA deadline, enforced for emergency/critical
    #[must_use]
    pub fn for_context(context: &RoutingContext, started: Instant) -> Self {
        Self::new(
            started,
            context.sla_deadline(),
            context.priority().enforces_deadline(),
        )
    }

    /// Total budget
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Whether attempts are cut off at the deadline
    #[must_use]
    pub fn is_enforced(&self) -> bool {
        self.enforced
    }

    /// Time spent so far
    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// Time left (zero once expired)
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_sub(self.elapsed(now))
    }

    /// Whether the deadline has passed
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.elapsed(now) >= self.deadline
    }
}

// ============================================================================
// Execution Report
// ============================================================================

/// What to execute for one request
#[derive(Clone, Copy, Debug)]
pub struct ExecutionPlan<'a> {
    /// Request identifier shared by every attempt
    pub request_id: &'a str,
    /// Classified request
    pub context: &'a RoutingContext,
    /// Route chosen by the router
    pub primary: &'a Route,
    /// Substitutes, best first
    pub alternatives: &'a [Route],
    /// Whether candidates were chosen without health filtering
    pub degraded: bool,
    /// Request body
    pub payload: &'a Value,
    /// Time budget
    pub budget: DeadlineBudget,
}

/// Successful routed response
#[derive(Clone, Debug, PartialEq)]
pub struct RoutedResponse {
    /// Request identifier
    pub request_id: String,
    /// Route that produced the response
    pub route_id: String,
    /// Response body
    pub payload: Value,
    /// Cost of the successful attempt
    pub cost_units: u64,
    /// Latency of the successful attempt (ms)
    pub latency_ms: u64,
    /// Whether a fallback route produced the response
    pub fallback_used: bool,
}

/// Everything that happened while executing one decision
#[derive(Debug)]
pub struct ExecutionReport {
    /// One outcome per attempt, in order
    pub outcomes: Vec<Outcome>,
    /// Final result
    pub result: Result<RoutedResponse, RoutingError>,
    /// Whether execution moved past the primary route
    pub fallback_used: bool,
    /// Total wall-clock time
    pub elapsed: Duration,
    /// Whether total time stayed within deadline + grace margin
    pub within_sla: bool,
}

// ============================================================================
// Fallback Controller
// ============================================================================

/// Executes decisions with at most `max_hops` substitutions
pub struct FallbackController {
    config: RwLock<FallbackConfig>,
    health: Arc<HealthMonitor>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FallbackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackController")
            .field("config", &*self.config.read())
            .finish()
    }
}

impl FallbackController {
    /// Create a controller
    pub fn new(config: FallbackConfig, health: Arc<HealthMonitor>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: RwLock::new(config),
            health,
            clock,
        }
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> FallbackConfig {
        self.config.read().clone()
    }

    /// Replace configuration
    pub fn set_config(&self, config: FallbackConfig) {
        *self.config.write() = config;
    }

    /// Pick the next route to try: first alternative not yet visited and,
    /// unless running degraded, not isolated by its circuit breaker.
    fn next_candidate<'a>(
        &self,
        alternatives: &'a [Route],
        visited: &[String],
        degraded: bool,
    ) -> Option<&'a Route> {
        alternatives.iter().find(|route| {
            let id = route.id();
            !visited.contains(&id) && (degraded || self.health.is_available(&id))
        })
    }

    /// Execute the plan's primary route, falling back to its alternatives.
    pub async fn execute(
        &self,
        plan: ExecutionPlan<'_>,
        provider: &dyn ProviderAdapter,
    ) -> ExecutionReport {
        let ExecutionPlan {
            request_id,
            context,
            primary,
            alternatives,
            degraded,
            payload,
            budget,
        } = plan;
        let config = self.config();
        let context_key = context.context_key();
        let mut trace = AttemptTrace::new();
        let mut outcomes = Vec::new();
        let mut visited: Vec<String> = Vec::new();
        let mut current = Some(primary);
        let mut hops = 0usize;

        let result = loop {
            let Some(route) = current else {
                if trace.is_empty() {
                    break Err(RoutingError::NoRouteAvailable {
                        context_key: context_key.to_string(),
                    });
                }
                break Err(RoutingError::from_trace(std::mem::take(&mut trace)));
            };
            let route_id = route.id();
            visited.push(route_id.clone());

            // Degraded plans attempt open circuits too
            if !self.health.begin_attempt(&route_id) && !degraded {
                tracing::debug!(
                    request_id = %request_id,
                    route = %route_id,
                    "Route refused the attempt (open circuit or half-open slot taken)"
                );
                current = if hops < config.max_hops {
                    self.next_candidate(alternatives, &visited, degraded)
                } else {
                    None
                };
                if let Some(next) = current {
                    hops += 1;
                    tracing::info!(
                        request_id = %request_id,
                        from = %route_id,
                        to = %next.id(),
                        "Substituting refused route"
                    );
                }
                continue;
            }

            let attempt_start = self.clock.now();
            let remaining = budget.remaining(attempt_start);
            let request = ProviderRequest {
                request_id: request_id.to_string(),
                payload: payload.clone(),
                remaining_budget: budget.is_enforced().then_some(remaining),
                context: context.clone(),
            };

            let attempt = if budget.is_enforced() {
                tokio::time::timeout(remaining, provider.invoke(route, &request))
                    .await
                    .ok()
            } else {
                Some(provider.invoke(route, &request).await)
            };
            let latency_ms = self
                .clock
                .now()
                .saturating_duration_since(attempt_start)
                .as_millis() as u64;

            let (reason, cost_units) = match attempt {
                Some(Ok(reply)) => {
                    outcomes.push(Outcome::new(
                        request_id,
                        &route_id,
                        context_key.clone(),
                        true,
                        latency_ms,
                        reply.cost_units,
                    ));
                    break Ok(RoutedResponse {
                        request_id: request_id.to_string(),
                        route_id,
                        payload: reply.payload,
                        cost_units: reply.cost_units,
                        latency_ms,
                        fallback_used: hops > 0,
                    });
                }
                Some(Err(err)) => (
                    FailureReason::Provider {
                        message: format!("{:#}", err.error),
                        transient: err.transient,
                    },
                    err.cost_units,
                ),
                None => (FailureReason::Timeout, 0),
            };

            outcomes.push(Outcome::new(
                request_id,
                &route_id,
                context_key.clone(),
                false,
                latency_ms,
                cost_units,
            ));
            tracing::debug!(
                request_id = %request_id,
                route = %route_id,
                latency_ms,
                reason = %reason,
                "Route attempt failed"
            );
            trace.push(AttemptFailure {
                route_id: route_id.clone(),
                path_kind: route.path_kind,
                elapsed_ms: latency_ms,
                reason: reason.clone(),
            });

            let retryable = !matches!(reason, FailureReason::Provider { transient: false, .. });
            if !retryable || hops >= config.max_hops {
                current = None;
                continue;
            }

            let now = self.clock.now();
            if budget.is_enforced() && budget.remaining(now) < config.min_attempt_window {
                tracing::warn!(
                    request_id = %request_id,
                    route = %route_id,
                    remaining_ms = budget.remaining(now).as_millis() as u64,
                    "Residual budget below minimum attempt window - failing fast"
                );
                current = None;
                continue;
            }

            current = self.next_candidate(alternatives, &visited, degraded);
            if let Some(next) = current {
                hops += 1;
                tracing::info!(
                    request_id = %request_id,
                    from = %route_id,
                    to = %next.id(),
                    "Falling back to alternate route"
                );
            }
        };

        let elapsed = budget.elapsed(self.clock.now());
        let within_sla = elapsed <= budget.deadline() + config.grace_margin;
        if !budget.is_enforced() && elapsed > budget.deadline() {
            tracing::warn!(
                request_id = %request_id,
                elapsed_ms = elapsed.as_millis() as u64,
                deadline_ms = budget.deadline().as_millis() as u64,
                "Advisory deadline exceeded"
            );
        }
        if let Err(err) = &result {
            tracing::warn!(request_id = %request_id, error = %err, "Request failed on every attempted route");
        }

        ExecutionReport {
            fallback_used: hops > 0,
            outcomes,
            result,
            elapsed,
            within_sla,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::routing::health::{CircuitPhase, HealthConfig};
    use crate::routing::test_utils::{ScriptedProvider, Step};
    use crate::routing::types::{BudgetTier, PathKind, Priority};
    use serde_json::json;

    fn context(priority: Priority) -> RoutingContext {
        RoutingContext::new(
            "test",
            priority,
            "general",
            BudgetTier::Standard,
            priority.default_sla(),
            false,
        )
    }

    fn setup() -> (FallbackController, Arc<HealthMonitor>, Route, Route) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let health = Arc::new(HealthMonitor::new(HealthConfig::default(), clock.clone()));
        let a = Route::new(PathKind::Direct, "a");
        let b = Route::new(PathKind::Broker, "b");
        health.register(a.id(), 1_000);
        health.register(b.id(), 1_000);
        let controller = FallbackController::new(FallbackConfig::default(), health.clone(), clock);
        (controller, health, a, b)
    }

    async fn run(
        controller: &FallbackController,
        provider: &ScriptedProvider,
        priority: Priority,
        a: &Route,
        b: &Route,
    ) -> ExecutionReport {
        let ctx = context(priority);
        let budget = DeadlineBudget::for_context(&ctx, Instant::now());
        let payload = json!({"q": 1});
        let plan = ExecutionPlan {
            request_id: "req-1",
            context: &ctx,
            primary: a,
            alternatives: std::slice::from_ref(b),
            degraded: false,
            payload: &payload,
            budget,
        };
        controller.execute(plan, provider).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_success() {
        let (controller, _, a, b) = setup();
        let provider = ScriptedProvider::new().with_default(&a.id(), Step::ok(100, 7));

        let report = run(&controller, &provider, Priority::Critical, &a, &b).await;
        let response = report.result.unwrap();
        assert_eq!(response.route_id, "direct:a");
        assert_eq!(response.cost_units, 7);
        assert!(!response.fallback_used);
        assert_eq!(report.outcomes.len(), 1);
        assert!(report.outcomes[0].success);
        assert!(report.within_sla);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_after_transient_failure() {
        let (controller, _, a, b) = setup();
        let provider = ScriptedProvider::new()
            .with_default(&a.id(), Step::transient(50))
            .with_default(&b.id(), Step::ok(200, 3));

        let report = run(&controller, &provider, Priority::Critical, &a, &b).await;
        let response = report.result.unwrap();
        assert_eq!(response.route_id, "broker:b");
        assert!(response.fallback_used);
        assert!(report.fallback_used);
        assert_eq!(report.outcomes.len(), 2);
        assert!(!report.outcomes[0].success);
        assert_eq!(report.outcomes[0].request_id, report.outcomes[1].request_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let (controller, _, a, b) = setup();
        let provider = ScriptedProvider::new()
            .with_default(&a.id(), Step::permanent(10))
            .with_default(&b.id(), Step::ok(10, 1));

        let report = run(&controller, &provider, Priority::Critical, &a, &b).await;
        let err = report.result.unwrap_err();
        assert!(matches!(err, RoutingError::RouteExecutionFailed { ref route_id, .. } if route_id == "direct:a"));
        assert_eq!(provider.calls(&b.id()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_fail_exhausts_with_trace() {
        let (controller, _, a, b) = setup();
        let provider = ScriptedProvider::new()
            .with_default(&a.id(), Step::transient(100))
            .with_default(&b.id(), Step::transient(100));

        let report = run(&controller, &provider, Priority::Emergency, &a, &b).await;
        let err = report.result.unwrap_err();
        let trace = err.trace().unwrap();
        assert!(matches!(err, RoutingError::ExhaustedRoutes { .. }));
        let tried: Vec<_> = trace.route_ids().collect();
        assert_eq!(tried, vec!["direct:a", "broker:b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_consuming_budget_fails_fast() {
        let (controller, _, a, b) = setup();
        // Primary hangs past the emergency deadline
        let provider = ScriptedProvider::new()
            .with_default(&a.id(), Step::ok(60_000, 1))
            .with_default(&b.id(), Step::ok(100, 1));

        let ctx = context(Priority::Emergency);
        let budget = DeadlineBudget::new(Instant::now(), Duration::from_secs(5), true);
        let payload = json!(null);
        let plan = ExecutionPlan {
            request_id: "req-2",
            context: &ctx,
            primary: &a,
            alternatives: std::slice::from_ref(&b),
            degraded: false,
            payload: &payload,
            budget,
        };
        let report = controller.execute(plan, &provider).await;

        // Nothing left for a second attempt
        let err = report.result.unwrap_err();
        assert!(matches!(err, RoutingError::RouteTimeout { .. }));
        assert_eq!(provider.calls(&b.id()), 0);
        assert!(report.elapsed <= Duration::from_secs(5) + Duration::from_millis(500));
        assert!(report.within_sla);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_alternative_is_skipped() {
        let (controller, health, a, b) = setup();
        health.force_state(&b.id(), CircuitPhase::Open);
        let provider = ScriptedProvider::new()
            .with_default(&a.id(), Step::transient(10))
            .with_default(&b.id(), Step::ok(10, 1));

        let report = run(&controller, &provider, Priority::Critical, &a, &b).await;
        assert!(matches!(report.result, Err(RoutingError::RouteExecutionFailed { .. })));
        assert_eq!(provider.calls(&b.id()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claimed_half_open_route_is_not_called() {
        let (controller, health, a, b) = setup();
        health.force_state(&a.id(), CircuitPhase::HalfOpen);
        // Another request already holds the single half-open trial
        assert!(health.begin_attempt(&a.id()));
        assert!(!health.is_available(&a.id()));

        let provider = ScriptedProvider::new()
            .with_default(&a.id(), Step::ok(10, 1))
            .with_default(&b.id(), Step::ok(20, 2));

        let report = run(&controller, &provider, Priority::Critical, &a, &b).await;
        let response = report.result.unwrap();
        assert_eq!(response.route_id, "broker:b");
        assert!(response.fallback_used);
        assert!(report.fallback_used);
        assert_eq!(provider.calls(&a.id()), 0);
        assert_eq!(provider.calls(&b.id()), 1);
        // Only the real attempt produces an outcome
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].route_id, "broker:b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_primary_without_alternative() {
        let (controller, health, a, _) = setup();
        health.force_state(&a.id(), CircuitPhase::HalfOpen);
        assert!(health.begin_attempt(&a.id()));
        let provider = ScriptedProvider::new().with_default(&a.id(), Step::ok(10, 1));

        let ctx = context(Priority::Critical);
        let payload = json!(null);
        let plan = ExecutionPlan {
            request_id: "req-3",
            context: &ctx,
            primary: &a,
            alternatives: &[],
            degraded: false,
            payload: &payload,
            budget: DeadlineBudget::for_context(&ctx, Instant::now()),
        };
        let report = controller.execute(plan, &provider).await;

        assert!(matches!(report.result, Err(RoutingError::NoRouteAvailable { .. })));
        assert_eq!(provider.calls(&a.id()), 0);
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_standard_deadline_is_advisory() {
        let (controller, _, a, b) = setup();
        let provider = ScriptedProvider::new().with_default(&a.id(), Step::ok(45_000, 1));

        let report = run(&controller, &provider, Priority::Standard, &a, &b).await;
        assert!(report.result.is_ok());
        assert!(report.elapsed >= Duration::from_secs(45));
        assert!(!report.within_sla);
    }

    #[test]
    fn test_budget_arithmetic() {
        let start = Instant::now();
        let budget = DeadlineBudget::new(start, Duration::from_millis(1_000), true);
        assert_eq!(budget.remaining(start), Duration::from_millis(1_000));
        let later = start + Duration::from_millis(1_200);
        assert_eq!(budget.remaining(later), Duration::ZERO);
        assert!(budget.is_expired(later));
        assert_eq!(budget.elapsed(later), Duration::from_millis(1_200));
    }
}
