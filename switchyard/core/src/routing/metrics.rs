//! Performance and Cost Tracking
//!
//! Aggregates outcomes into rolling 1-minute / 5-minute / 1-hour windows per
//! route, measures how often decisions followed the bandit's preferred route,
//! and raises alerts when a route regresses against its own baseline:
//!
//! - p95 latency over the last minute at least doubles the baseline p95
//! - fallback rate over the last five minutes exceeds 10%
//! - average cost per request over the last minute exceeds 150% of baseline
//!
//! The baseline is the rest of the hour: samples older than one minute.
//! Each (alert kind, route) fires at most once per alert cooldown.
//!
//! Outcomes land in per-second slots holding a log-linear latency histogram.
//! Each span keeps running totals that slots leave as they age, so recording
//! never rescans the hour and a busy route keeps all of it.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::types::Outcome;
use crate::clock::{Clock, SystemClock};

const ONE_MINUTE: Duration = Duration::from_secs(60);
const FIVE_MINUTES: Duration = Duration::from_secs(300);
const ONE_HOUR: Duration = Duration::from_secs(3_600);

// ============================================================================
// Counter
// ============================================================================

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Tracker tuning
#[derive(Clone, Debug, PartialEq)]
pub struct TrackerConfig {
    /// Recent/baseline p95 ratio that raises a latency alert
    pub latency_alert_factor: f64,

    /// Fallback share of recent decisions that raises an alert
    pub fallback_alert_rate: f64,

    /// Decisions needed in the 5-minute window before the fallback rate counts
    pub min_decisions_for_alert: usize,

    /// Recent/baseline average cost ratio that raises a cost alert
    pub cost_alert_factor: f64,

    /// Samples needed in the recent window before latency/cost alerts
    pub min_recent_samples: usize,

    /// Samples needed in the baseline before latency/cost alerts
    pub min_baseline_samples: usize,

    /// Minimum gap between two alerts of the same kind for the same route
    pub alert_cooldown: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            latency_alert_factor: 2.0,
            fallback_alert_rate: 0.10,
            min_decisions_for_alert: 20,
            cost_alert_factor: 1.5,
            min_recent_samples: 5,
            min_baseline_samples: 20,
            alert_cooldown: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// Alerts
// ============================================================================

/// What an alert is about
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// p95 latency regression
    LatencyRegression,
    /// Too many decisions needed a fallback
    FallbackRate,
    /// Cost per request regression
    CostOverrun,
}

/// Threshold breach reported to monitoring
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Alert kind
    pub kind: AlertKind,
    /// Affected route (fallback-rate alerts are global)
    pub route_id: Option<String>,
    /// Observed value
    pub observed: f64,
    /// Baseline or threshold it was compared against
    pub baseline: f64,
    /// When the alert fired
    pub timestamp: DateTime<Utc>,
}

impl std::fmt::Display for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let route = self.route_id.as_deref().unwrap_or("*");
        match self.kind {
            AlertKind::LatencyRegression => write!(
                f,
                "p95 latency on {route} is {:.0}ms against a {:.0}ms baseline",
                self.observed, self.baseline
            ),
            AlertKind::FallbackRate => write!(
                f,
                "fallback rate {:.1}% exceeds {:.1}%",
                self.observed * 100.0,
                self.baseline * 100.0
            ),
            AlertKind::CostOverrun => write!(
                f,
                "cost per request on {route} is {:.1} against a {:.1} baseline",
                self.observed, self.baseline
            ),
        }
    }
}

/// External monitoring collaborator that receives alerts
pub trait AlertSink: Send + Sync {
    /// Deliver one alert
    fn emit(&self, alert: &Alert);
}

/// Default sink: a `warn` event per alert
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, alert: &Alert) {
        tracing::warn!(
            kind = ?alert.kind,
            route = alert.route_id.as_deref().unwrap_or("*"),
            observed = alert.observed,
            baseline = alert.baseline,
            "Routing alert: {}",
            alert
        );
    }
}

// ============================================================================
// Latency Histogram
// ============================================================================

/// Latencies below `1 << LINEAR_BITS` ms get a bucket each
const LINEAR_BITS: u32 = 5;
const LINEAR_BUCKETS: u64 = 1 << LINEAR_BITS;
/// Each power of two above the linear range splits into 16 buckets, so a
/// bucket floor is within 6.25% of every value it holds
const SUB_BUCKET_BITS: u32 = 4;
/// Slower samples share the top bucket
const MAX_TRACKED_MS: u64 = (1 << 24) - 1;
const BUCKETS: usize = bucket_index(MAX_TRACKED_MS) + 1;

const fn bucket_index(latency_ms: u64) -> usize {
    let v = if latency_ms > MAX_TRACKED_MS {
        MAX_TRACKED_MS
    } else {
        latency_ms
    };
    if v < LINEAR_BUCKETS {
        return v as usize;
    }
    let msb = 63 - v.leading_zeros();
    let sub = (v >> (msb - SUB_BUCKET_BITS)) - (1 << SUB_BUCKET_BITS);
    let octave = (msb - LINEAR_BITS) as u64;
    (LINEAR_BUCKETS + (octave << SUB_BUCKET_BITS) + sub) as usize
}

/// Smallest latency that lands in `index`
fn bucket_floor(index: usize) -> u64 {
    let i = index as u64;
    if i < LINEAR_BUCKETS {
        return i;
    }
    let offset = i - LINEAR_BUCKETS;
    let octave = offset >> SUB_BUCKET_BITS;
    let sub = offset & ((1 << SUB_BUCKET_BITS) - 1);
    ((1 << SUB_BUCKET_BITS) + sub) << (octave + u64::from(LINEAR_BITS - SUB_BUCKET_BITS))
}

/// Nearest-rank percentile over bucket counts holding `total` samples
/// (0 when empty)
fn percentile(counts: impl Iterator<Item = u64>, total: u64, p: f64) -> u64 {
    if total == 0 {
        return 0;
    }
    let rank = ((p / 100.0) * total as f64).ceil().clamp(1.0, total as f64) as u64;
    let mut seen = 0u64;
    for (index, count) in counts.enumerate() {
        seen += count;
        if seen >= rank {
            return bucket_floor(index);
        }
    }
    bucket_floor(BUCKETS - 1)
}

// ============================================================================
// Rolling Windows
// ============================================================================

/// Outcomes recorded during one second, with a sparse latency histogram
#[derive(Clone, Debug)]
struct Slot {
    second: u64,
    count: u64,
    successes: u64,
    cost: u64,
    /// (bucket index, count), sorted by index
    buckets: Vec<(u16, u64)>,
}

impl Slot {
    fn new(second: u64) -> Self {
        Self {
            second,
            count: 0,
            successes: 0,
            cost: 0,
            buckets: Vec::new(),
        }
    }

    fn add(&mut self, latency_ms: u64, success: bool, cost_units: u64) {
        self.count += 1;
        self.successes += u64::from(success);
        self.cost = self.cost.saturating_add(cost_units);
        let index = bucket_index(latency_ms) as u16;
        match self.buckets.binary_search_by_key(&index, |(i, _)| *i) {
            Ok(pos) => self.buckets[pos].1 += 1,
            Err(pos) => self.buckets.insert(pos, (index, 1)),
        }
    }
}

/// Dense running totals for one span
#[derive(Clone, Debug)]
struct Totals {
    count: u64,
    successes: u64,
    cost: u64,
    buckets: Vec<u64>,
}

impl Default for Totals {
    fn default() -> Self {
        Self {
            count: 0,
            successes: 0,
            cost: 0,
            buckets: vec![0; BUCKETS],
        }
    }
}

impl Totals {
    fn add(&mut self, latency_ms: u64, success: bool, cost_units: u64) {
        self.count += 1;
        self.successes += u64::from(success);
        self.cost = self.cost.saturating_add(cost_units);
        self.buckets[bucket_index(latency_ms)] += 1;
    }

    fn remove(&mut self, slot: &Slot) {
        self.count -= slot.count;
        self.successes -= slot.successes;
        self.cost = self.cost.saturating_sub(slot.cost);
        for &(index, count) in &slot.buckets {
            self.buckets[usize::from(index)] -= count;
        }
    }

    fn p95(&self) -> u64 {
        percentile(self.buckets.iter().copied(), self.count, 95.0)
    }

    fn stats(&self) -> WindowStats {
        let n = self.count;
        let at = |p| percentile(self.buckets.iter().copied(), n, p);
        WindowStats {
            samples: n,
            success_rate: if n == 0 { 1.0 } else { self.successes as f64 / n as f64 },
            p50_ms: at(50.0),
            p95_ms: at(95.0),
            p99_ms: at(99.0),
            total_cost: self.cost,
        }
    }
}

/// Running totals over the slots younger than `span_secs`
#[derive(Debug)]
struct Span {
    span_secs: u64,
    /// Sequence number of the oldest slot still inside the span
    start_seq: u64,
    totals: Totals,
}

impl Span {
    fn new(span: Duration) -> Self {
        Self {
            span_secs: span.as_secs(),
            start_seq: 0,
            totals: Totals::default(),
        }
    }
}

const MINUTE: usize = 0;
const FIVE: usize = 1;
const HOUR: usize = 2;

/// Per-second slots for the last hour plus running totals per span.
/// Recording is constant work; slots leave a span as the clock passes them.
#[derive(Debug)]
struct RouteWindow {
    slots: VecDeque<Slot>,
    /// Sequence number of `slots[0]`
    first_seq: u64,
    spans: [Span; 3],
}

impl Default for RouteWindow {
    fn default() -> Self {
        Self {
            slots: VecDeque::new(),
            first_seq: 0,
            spans: [
                Span::new(ONE_MINUTE),
                Span::new(FIVE_MINUTES),
                Span::new(ONE_HOUR),
            ],
        }
    }
}

impl RouteWindow {
    /// Retire slots that fell out of each span at `now_sec`
    fn advance(&mut self, now_sec: u64) {
        for span in &mut self.spans {
            while let Some(slot) = self.slots.get((span.start_seq - self.first_seq) as usize) {
                if slot.second + span.span_secs > now_sec {
                    break;
                }
                span.totals.remove(slot);
                span.start_seq += 1;
            }
        }
        while self.first_seq < self.spans[HOUR].start_seq {
            self.slots.pop_front();
            self.first_seq += 1;
        }
    }

    fn record(&mut self, now_sec: u64, latency_ms: u64, success: bool, cost_units: u64) {
        self.advance(now_sec);
        match self.slots.back_mut() {
            Some(slot) if slot.second >= now_sec => slot.add(latency_ms, success, cost_units),
            _ => {
                let mut slot = Slot::new(now_sec);
                slot.add(latency_ms, success, cost_units);
                self.slots.push_back(slot);
            }
        }
        for span in &mut self.spans {
            span.totals.add(latency_ms, success, cost_units);
        }
    }

    fn recent(&self) -> &Totals {
        &self.spans[MINUTE].totals
    }

    /// Samples in the hour but not the last minute
    fn baseline_count(&self) -> u64 {
        self.spans[HOUR].totals.count - self.spans[MINUTE].totals.count
    }

    fn baseline_cost(&self) -> u64 {
        self.spans[HOUR]
            .totals
            .cost
            .saturating_sub(self.spans[MINUTE].totals.cost)
    }

    fn baseline_p95(&self) -> u64 {
        let hour = &self.spans[HOUR].totals.buckets;
        let minute = &self.spans[MINUTE].totals.buckets;
        let counts = hour.iter().zip(minute).map(|(h, m)| h - m);
        percentile(counts, self.baseline_count(), 95.0)
    }

    fn windows(&self) -> RouteWindows {
        RouteWindows {
            one_minute: self.spans[MINUTE].totals.stats(),
            five_minutes: self.spans[FIVE].totals.stats(),
            one_hour: self.spans[HOUR].totals.stats(),
        }
    }
}

/// Aggregates for one route over one window. Percentiles are reported as
/// the floor of their histogram bucket.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    /// Outcomes in the window
    pub samples: u64,
    /// Success rate (1.0 when empty)
    pub success_rate: f64,
    /// Median latency (ms)
    pub p50_ms: u64,
    /// 95th percentile latency (ms)
    pub p95_ms: u64,
    /// 99th percentile latency (ms)
    pub p99_ms: u64,
    /// Total cost in minor units
    pub total_cost: u64,
}

/// 1-minute, 5-minute and 1-hour aggregates for one route
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteWindows {
    /// Last minute
    pub one_minute: WindowStats,
    /// Last five minutes
    pub five_minutes: WindowStats,
    /// Last hour
    pub one_hour: WindowStats,
}

/// Decisions from the last five minutes with a running fallback count
#[derive(Debug, Default)]
struct DecisionWindow {
    entries: VecDeque<(Instant, bool)>,
    fallbacks: usize,
}

impl DecisionWindow {
    fn push(&mut self, now: Instant, fallback_used: bool) {
        self.entries.push_back((now, fallback_used));
        self.fallbacks += usize::from(fallback_used);
        while let Some(&(at, fallback)) = self.entries.front() {
            if now.saturating_duration_since(at) <= FIVE_MINUTES {
                break;
            }
            self.entries.pop_front();
            self.fallbacks -= usize::from(fallback);
        }
    }
}

// ============================================================================
// Routing Efficiency
// ============================================================================

/// How decisions relate to the bandit's preferred route
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingEfficiency {
    /// Decisions executed
    pub decisions: u64,
    /// Served by the preferred route without fallback
    pub preferred: u64,
    /// Served by a non-preferred route without fallback
    pub exploration: u64,
    /// Needed a fallback attempt
    pub fallback: u64,
    /// preferred / decisions (1.0 when no decisions)
    pub efficiency: f64,
}

// ============================================================================
// Performance Tracker
// ============================================================================

/// Rolling per-route metrics, efficiency accounting and alerting
pub struct PerformanceTracker {
    config: TrackerConfig,
    windows: DashMap<String, Mutex<RouteWindow>>,
    recent_decisions: Mutex<DecisionWindow>,
    /// Zero point for per-second slots
    epoch: Instant,
    decisions: Counter,
    preferred: Counter,
    exploration: Counter,
    fallback: Counter,
    outcomes: Counter,
    failures: Counter,
    alerts: Counter,
    last_alert: DashMap<(AlertKind, Option<String>), Instant>,
    sink: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PerformanceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceTracker")
            .field("routes", &self.windows.len())
            .field("decisions", &self.decisions.get())
            .finish()
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new(
            TrackerConfig::default(),
            Arc::new(SystemClock),
            Arc::new(TracingAlertSink),
        )
    }
}

impl PerformanceTracker {
    /// Create a tracker
    pub fn new(config: TrackerConfig, clock: Arc<dyn Clock>, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            recent_decisions: Mutex::new(DecisionWindow::default()),
            epoch: clock.now(),
            decisions: Counter::new(),
            preferred: Counter::new(),
            exploration: Counter::new(),
            fallback: Counter::new(),
            outcomes: Counter::new(),
            failures: Counter::new(),
            alerts: Counter::new(),
            last_alert: DashMap::new(),
            sink,
            clock,
        }
    }

    /// Tracker configuration
    #[must_use]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn second(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_secs()
    }

    /// Fold one attempt outcome into its route's windows
    pub fn record_outcome(&self, outcome: &Outcome) {
        let now = self.clock.now();
        self.outcomes.inc();
        if !outcome.success {
            self.failures.inc();
        }

        let entry = self
            .windows
            .entry(outcome.route_id.clone())
            .or_insert_with(|| Mutex::new(RouteWindow::default()));
        let pending = {
            let mut window = entry.lock();
            window.record(
                self.second(now),
                outcome.latency_ms,
                outcome.success,
                outcome.cost_units,
            );
            self.check_route(&outcome.route_id, &window)
        };
        drop(entry);

        for alert in pending {
            self.fire(alert, now);
        }
    }

    /// Count one executed decision
    pub fn record_decision(&self, chosen_route: &str, preferred_route: Option<&str>, fallback_used: bool) {
        let now = self.clock.now();
        self.decisions.inc();
        if fallback_used {
            self.fallback.inc();
        } else if preferred_route.is_none_or(|p| p == chosen_route) {
            self.preferred.inc();
        } else {
            self.exploration.inc();
        }

        let rate = {
            let mut recent = self.recent_decisions.lock();
            recent.push(now, fallback_used);
            let n = recent.entries.len();
            (n >= self.config.min_decisions_for_alert).then(|| recent.fallbacks as f64 / n as f64)
        };

        if let Some(rate) = rate {
            if rate > self.config.fallback_alert_rate {
                self.fire(
                    Alert {
                        kind: AlertKind::FallbackRate,
                        route_id: None,
                        observed: rate,
                        baseline: self.config.fallback_alert_rate,
                        timestamp: Utc::now(),
                    },
                    now,
                );
            }
        }
    }

    /// Compare the last minute against the rest of the hour
    fn check_route(&self, route_id: &str, window: &RouteWindow) -> Vec<Alert> {
        let recent = window.recent();
        let baseline_count = window.baseline_count();
        if recent.count < self.config.min_recent_samples as u64
            || baseline_count < self.config.min_baseline_samples as u64
        {
            return Vec::new();
        }

        let mut alerts = Vec::new();
        let recent_p95 = recent.p95();
        let baseline_p95 = window.baseline_p95();

        if baseline_p95 > 0
            && recent_p95 as f64 >= self.config.latency_alert_factor * baseline_p95 as f64
        {
            alerts.push(Alert {
                kind: AlertKind::LatencyRegression,
                route_id: Some(route_id.to_string()),
                observed: recent_p95 as f64,
                baseline: baseline_p95 as f64,
                timestamp: Utc::now(),
            });
        }

        let recent_cost = recent.cost as f64 / recent.count as f64;
        let baseline_cost = window.baseline_cost() as f64 / baseline_count as f64;
        if baseline_cost > 0.0 && recent_cost > self.config.cost_alert_factor * baseline_cost {
            alerts.push(Alert {
                kind: AlertKind::CostOverrun,
                route_id: Some(route_id.to_string()),
                observed: recent_cost,
                baseline: baseline_cost,
                timestamp: Utc::now(),
            });
        }

        alerts
    }

    fn fire(&self, alert: Alert, now: Instant) {
        let key = (alert.kind, alert.route_id.clone());
        let cooldown = self.config.alert_cooldown;
        let mut suppressed = false;
        self.last_alert
            .entry(key)
            .and_modify(|last| {
                if now.saturating_duration_since(*last) < cooldown {
                    suppressed = true;
                } else {
                    *last = now;
                }
            })
            .or_insert(now);
        if suppressed {
            return;
        }
        self.alerts.inc();
        self.sink.emit(&alert);
    }

    /// Rolling aggregates for a route
    #[must_use]
    pub fn route_windows(&self, route_id: &str) -> Option<RouteWindows> {
        let now = self.clock.now();
        let entry = self.windows.get(route_id)?;
        let mut window = entry.lock();
        window.advance(self.second(now));
        Some(window.windows())
    }

    /// Drop a route's windows
    pub fn remove_route(&self, route_id: &str) {
        self.windows.remove(route_id);
    }

    /// Preferred / exploration / fallback accounting
    #[must_use]
    pub fn efficiency(&self) -> RoutingEfficiency {
        let decisions = self.decisions.get();
        let preferred = self.preferred.get();
        RoutingEfficiency {
            decisions,
            preferred,
            exploration: self.exploration.get(),
            fallback: self.fallback.get(),
            efficiency: if decisions == 0 {
                1.0
            } else {
                preferred as f64 / decisions as f64
            },
        }
    }

    /// Alerts delivered to the sink so far
    #[must_use]
    pub fn alerts_fired(&self) -> u64 {
        self.alerts.get()
    }

    /// Prometheus text exposition of counters and per-route hourly windows
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        let efficiency = self.efficiency();

        let _ = write!(
            output,
            "# HELP switchyard_decisions_total Executed routing decisions\n\
             # TYPE switchyard_decisions_total counter\n\
             switchyard_decisions_total{{kind=\"preferred\"}} {}\n\
             switchyard_decisions_total{{kind=\"exploration\"}} {}\n\
             switchyard_decisions_total{{kind=\"fallback\"}} {}\n\n",
            efficiency.preferred, efficiency.exploration, efficiency.fallback
        );

        let _ = write!(
            output,
            "# HELP switchyard_routing_efficiency Share of decisions served by the preferred route\n\
             # TYPE switchyard_routing_efficiency gauge\n\
             switchyard_routing_efficiency {:.4}\n\n",
            efficiency.efficiency
        );

        let _ = write!(
            output,
            "# HELP switchyard_attempts_total Route attempts\n\
             # TYPE switchyard_attempts_total counter\n\
             switchyard_attempts_total {}\n\
             switchyard_attempt_failures_total {}\n\
             switchyard_alerts_total {}\n\n",
            self.outcomes.get(),
            self.failures.get(),
            self.alerts.get()
        );

        let mut routes: Vec<String> = self.windows.iter().map(|e| e.key().clone()).collect();
        routes.sort();
        for route in routes {
            let Some(windows) = self.route_windows(&route) else {
                continue;
            };
            let hour = windows.one_hour;
            let _ = writeln!(output, "switchyard_route_latency_ms{{route=\"{route}\",quantile=\"0.5\"}} {}", hour.p50_ms);
            let _ = writeln!(output, "switchyard_route_latency_ms{{route=\"{route}\",quantile=\"0.95\"}} {}", hour.p95_ms);
            let _ = writeln!(output, "switchyard_route_latency_ms{{route=\"{route}\",quantile=\"0.99\"}} {}", hour.p99_ms);
            let _ = writeln!(output, "switchyard_route_success_rate{{route=\"{route}\"}} {:.4}", hour.success_rate);
            let _ = writeln!(output, "switchyard_route_cost_total{{route=\"{route}\"}} {}", hour.total_cost);
        }

        output
    }
}
