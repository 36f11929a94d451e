//! End-to-end routing behavior: selection, isolation, recovery, learning

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{broker, context, direct, manual_router, FixedProbe, ScriptedAdapter};
use pretty_assertions::assert_eq;
use switchyard_core::{CircuitPhase, Outcome, Priority, RoutingError, SelectionMode};

// ============================================================================
// Emergency Selection
// ============================================================================

#[test]
fn emergency_selects_fastest_healthy_route_deterministically() {
    let adapter = Arc::new(ScriptedAdapter::new());
    let (router, _clock) = manual_router(
        adapter,
        vec![direct("alpha", 2_000), broker("beta", 900)],
    );

    // beta is faster but isolated
    router.health().force_state("broker:beta", CircuitPhase::Open);

    let ctx = context(Priority::Emergency, "general");
    assert_eq!(ctx.sla_deadline(), Duration::from_millis(5_000));

    for _ in 0..50 {
        let decision = router.route(&ctx).unwrap();
        assert_eq!(decision.chosen_route, "direct:alpha");
        assert_eq!(decision.selection, SelectionMode::EmergencyDeterministic);
        assert!(decision.reasoning.starts_with("emergency-deterministic"));
        assert!(!decision.alternatives.contains(&"broker:beta".to_string()));
    }
}

// ============================================================================
// Circuit Breaker
// ============================================================================

#[test]
fn five_failures_isolate_route_until_cooldown_and_probe_recovers_it() {
    let adapter = Arc::new(ScriptedAdapter::new());
    let (router, clock) = manual_router(
        adapter,
        vec![direct("alpha", 500), broker("beta", 800)],
    );
    let ctx = context(Priority::Standard, "general");
    let key = ctx.context_key();

    for i in 0..4 {
        router.record_outcome(&Outcome::new(format!("r{i}"), "direct:alpha", key.clone(), false, 100, 0));
        clock.advance(Duration::from_secs(5));
    }
    assert_eq!(router.health().phase("direct:alpha"), Some(CircuitPhase::Closed));

    router.record_outcome(&Outcome::new("r4", "direct:alpha", key.clone(), false, 100, 0));
    assert_eq!(router.health().phase("direct:alpha"), Some(CircuitPhase::Open));

    // Excluded from every decision while open
    for _ in 0..100 {
        let decision = router.decide(&ctx).unwrap();
        assert_eq!(decision.chosen_route, "broker:beta");
        assert!(decision.alternatives.is_empty());
    }

    clock.advance(Duration::from_secs(29));
    assert_eq!(router.health().phase("direct:alpha"), Some(CircuitPhase::Open));

    clock.advance(Duration::from_secs(2));
    assert_eq!(router.health().phase("direct:alpha"), Some(CircuitPhase::HalfOpen));
    assert!(router.health().is_available("direct:alpha"));

    let probe = FixedProbe::default();
    probe.set("direct:alpha", true);
    let results = tokio_test::block_on(router.probe_routes(&probe));

    assert_eq!(results, vec![("direct:alpha".to_string(), CircuitPhase::Closed)]);
    assert_eq!(router.health().phase("direct:alpha"), Some(CircuitPhase::Closed));
}

#[test]
fn failed_probe_reopens_with_longer_cooldown() {
    let adapter = Arc::new(ScriptedAdapter::new());
    let (router, clock) = manual_router(adapter, vec![direct("alpha", 500)]);
    let key = context(Priority::Standard, "general").context_key();

    for i in 0..5 {
        router.record_outcome(&Outcome::new(format!("r{i}"), "direct:alpha", key.clone(), false, 100, 0));
    }
    clock.advance(Duration::from_secs(31));
    assert_eq!(router.health().phase("direct:alpha"), Some(CircuitPhase::HalfOpen));

    router.health().record_probe("direct:alpha", false);
    assert_eq!(router.health().phase("direct:alpha"), Some(CircuitPhase::Open));

    // Backoff doubles the cooldown to 60s
    clock.advance(Duration::from_secs(45));
    assert_eq!(router.health().phase("direct:alpha"), Some(CircuitPhase::Open));
    clock.advance(Duration::from_secs(16));
    assert_eq!(router.health().phase("direct:alpha"), Some(CircuitPhase::HalfOpen));
}

// ============================================================================
// Degraded Mode
// ============================================================================

#[test]
fn all_routes_open_degrades_or_fails() {
    let adapter = Arc::new(ScriptedAdapter::new());
    let (router, _clock) = manual_router(
        adapter,
        vec![direct("alpha", 500), broker("beta", 800)],
    );
    router.health().force_state("direct:alpha", CircuitPhase::Open);
    router.health().force_state("broker:beta", CircuitPhase::Open);

    let ctx = context(Priority::Standard, "general");
    let decision = router.route(&ctx).unwrap();
    assert!(decision.degraded);

    let mut settings = router.settings();
    settings.allow_degraded = false;
    router.apply_settings(&settings).unwrap();

    match router.route(&ctx) {
        Err(RoutingError::NoRouteAvailable { context_key }) => {
            assert_eq!(context_key, "standard|general|standard");
        }
        other => panic!("expected NoRouteAvailable, got {other:?}"),
    }
}

// ============================================================================
// Bandit Learning
// ============================================================================

#[test]
fn better_arm_is_selected_more_often() {
    let adapter = Arc::new(ScriptedAdapter::new());
    let (router, _clock) = manual_router(
        adapter,
        vec![direct("route-a", 500), broker("route-b", 500)],
    );
    let ctx = context(Priority::Standard, "domainX");
    let key = ctx.context_key();
    assert_eq!(key.as_str(), "standard|domainX|standard");

    router.bandit().seed_arm(&key, "direct:route-a", 80, 20);
    router.bandit().seed_arm(&key, "broker:route-b", 40, 60);

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..2_000 {
        let decision = router.decide(&ctx).unwrap();
        *counts.entry(decision.chosen_route).or_default() += 1;
    }

    let a = counts.get("direct:route-a").copied().unwrap_or(0);
    let b = counts.get("broker:route-b").copied().unwrap_or(0);
    assert_eq!(a + b, 2_000);
    assert!(a > b, "route-a chosen {a} times, route-b {b} times");

    let (best, mean) = router.bandit().get_best_arm(&key).unwrap();
    assert_eq!(best, "direct:route-a");
    assert!(mean > 0.75);
}

#[test]
fn weights_sum_to_one_and_untried_routes_get_the_floor() {
    let adapter = Arc::new(ScriptedAdapter::new());
    let (router, _clock) = manual_router(
        adapter,
        vec![direct("a", 500), broker("b", 500), direct("c", 500)],
    );
    let key = context(Priority::Critical, "general").context_key();
    router.bandit().seed_arm(&key, "direct:a", 500, 0);
    router.bandit().seed_arm(&key, "broker:b", 400, 100);

    let eligible = vec![
        "direct:a".to_string(),
        "broker:b".to_string(),
        "direct:c".to_string(),
    ];
    for _ in 0..200 {
        let weights = router.bandit().get_weights(&key, &eligible);
        assert!((weights.total() - 1.0).abs() < 1e-9);
        assert!(weights.get("direct:c").unwrap() >= 0.05 - 1e-12);
    }
}

// ============================================================================
// Monitoring Export
// ============================================================================

#[test]
fn stats_are_idempotent_without_new_outcomes() {
    let adapter = Arc::new(ScriptedAdapter::new());
    let (router, clock) = manual_router(
        adapter,
        vec![direct("alpha", 500), broker("beta", 800)],
    );
    let key = context(Priority::Standard, "general").context_key();

    for i in 0..30u64 {
        let route = if i % 2 == 0 { "direct:alpha" } else { "broker:beta" };
        router.record_outcome(&Outcome::new(format!("r{i}"), route, key.clone(), i % 7 != 0, 100 + i * 3, 4));
        clock.advance(Duration::from_millis(250));
    }

    let first = router.get_stats();
    let second = router.get_stats();
    assert_eq!(first, second);
    assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());

    let alpha = &first.per_route["direct:alpha"];
    let latency = alpha.latency.as_ref().unwrap();
    assert_eq!(latency.one_minute.samples, 15);
    assert!(latency.one_minute.p50_ms <= latency.one_minute.p95_ms);
    assert!(latency.one_minute.p95_ms <= latency.one_minute.p99_ms);

    let weights = &first.per_context[key.as_str()];
    let total: f64 = weights.values().sum();
    assert!((total - 1.0).abs() < 1e-9);
}
