//! Routing Types
//!
//! Core data model shared by the classifier, router, health monitor, bandit
//! optimizer and performance tracker.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Priority
// ============================================================================

/// Priority class of a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Safety-critical; never explored, strict deadline
    Emergency,
    /// Latency-sensitive; strict deadline
    Critical,
    /// Everything else; deadline is advisory
    Standard,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Standard
    }
}

impl Priority {
    /// Default SLA deadline for this priority
    #[must_use]
    pub fn default_sla(&self) -> Duration {
        match self {
            Self::Emergency => Duration::from_millis(5_000),
            Self::Critical => Duration::from_millis(10_000),
            Self::Standard => Duration::from_millis(30_000),
        }
    }

    /// Whether the SLA deadline is enforced (attempts are abandoned when it passes)
    #[must_use]
    pub fn enforces_deadline(&self) -> bool {
        matches!(self, Self::Emergency | Self::Critical)
    }

    /// Lowercase name used in context keys
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::Critical => "critical",
            Self::Standard => "standard",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "emergency" => Ok(Self::Emergency),
            "critical" => Ok(Self::Critical),
            "standard" => Ok(Self::Standard),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

// ============================================================================
// Budget Tier
// ============================================================================

/// Spend class of a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetTier {
    /// Cheapest acceptable route
    Economy,
    /// Default spend
    Standard,
    /// Spend freely
    Premium,
}

impl Default for BudgetTier {
    fn default() -> Self {
        Self::Standard
    }
}

impl BudgetTier {
    /// Lowercase name used in context keys
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Economy => "economy",
            Self::Standard => "standard",
            Self::Premium => "premium",
        }
    }
}

impl fmt::Display for BudgetTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BudgetTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "economy" | "low" => Ok(Self::Economy),
            "standard" | "default" => Ok(Self::Standard),
            "premium" | "high" => Ok(Self::Premium),
            other => Err(format!("unknown budget tier: {other}")),
        }
    }
}

// ============================================================================
// Routing Context
// ============================================================================

/// Classified shape of a request. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingContext {
    operation_type: String,
    priority: Priority,
    domain: String,
    budget_tier: BudgetTier,
    sla_deadline_ms: u64,
    require_tools: bool,
}

impl RoutingContext {
    /// Build a context. Prefer [`RequestClassifier`](super::classifier::RequestClassifier)
    /// for raw input; this constructor trusts its arguments.
    pub fn new(
        operation_type: impl Into<String>,
        priority: Priority,
        domain: impl Into<String>,
        budget_tier: BudgetTier,
        sla_deadline: Duration,
        require_tools: bool,
    ) -> Self {
        Self {
            operation_type: operation_type.into(),
            priority,
            domain: domain.into(),
            budget_tier,
            sla_deadline_ms: sla_deadline.as_millis() as u64,
            require_tools,
        }
    }

    /// Operation type as supplied by the caller
    #[must_use]
    pub fn operation_type(&self) -> &str {
        &self.operation_type
    }

    /// Priority class
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Domain tag
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Budget tier
    #[must_use]
    pub fn budget_tier(&self) -> BudgetTier {
        self.budget_tier
    }

    /// SLA deadline
    #[must_use]
    pub fn sla_deadline(&self) -> Duration {
        Duration::from_millis(self.sla_deadline_ms)
    }

    /// Whether the request needs tool calling
    #[must_use]
    pub fn require_tools(&self) -> bool {
        self.require_tools
    }

    /// Key used to group bandit statistics: `priority|domain|budgetTier`
    #[must_use]
    pub fn context_key(&self) -> ContextKey {
        ContextKey(format!(
            "{}|{}|{}",
            self.priority, self.domain, self.budget_tier
        ))
    }
}

/// Bandit grouping key derived from a [`RoutingContext`]
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextKey(String);

impl ContextKey {
    /// Wrap a raw key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Raw key
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Routes
// ============================================================================

/// Connection path to a provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathKind {
    /// Low-latency direct connection
    Direct,
    /// Broker-mediated connection
    Broker,
}

impl PathKind {
    /// Lowercase name used in route ids
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Broker => "broker",
        }
    }
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PathKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "broker" => Ok(Self::Broker),
            other => Err(format!("unknown path kind: {other}")),
        }
    }
}

/// What a route can do
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteCapabilities {
    /// Whether the route supports tool/function calling
    pub supports_tools: bool,

    /// Maximum tokens per request
    pub max_tokens: u32,

    /// Expected latency before any observations exist (ms)
    pub default_latency_ms: u64,

    /// Cost per request in minor currency units
    pub cost_per_unit: u64,

    /// Domains served; empty means every domain
    #[serde(default)]
    pub domains: Vec<String>,
}

impl Default for RouteCapabilities {
    fn default() -> Self {
        Self {
            supports_tools: false,
            max_tokens: 4096,
            default_latency_ms: 1_000,
            cost_per_unit: 0,
            domains: Vec::new(),
        }
    }
}

/// A connection path to a backend provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Direct or broker-mediated
    pub path_kind: PathKind,

    /// Backend provider identifier
    pub provider_id: String,

    /// Capability description
    pub capabilities: RouteCapabilities,
}

impl Route {
    /// Create a route with default capabilities
    pub fn new(path_kind: PathKind, provider_id: impl Into<String>) -> Self {
        Self {
            path_kind,
            provider_id: provider_id.into(),
            capabilities: RouteCapabilities::default(),
        }
    }

    /// Set tool support
    #[must_use]
    pub fn with_tools(mut self, supports_tools: bool) -> Self {
        self.capabilities.supports_tools = supports_tools;
        self
    }

    /// Set expected latency
    #[must_use]
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.capabilities.default_latency_ms = latency_ms;
        self
    }

    /// Set per-request cost
    #[must_use]
    pub fn with_cost(mut self, cost_per_unit: u64) -> Self {
        self.capabilities.cost_per_unit = cost_per_unit;
        self
    }

    /// Restrict the route to the given domains
    #[must_use]
    pub fn with_domains(mut self, domains: Vec<String>) -> Self {
        self.capabilities.domains = domains;
        self
    }

    /// Stable identifier: `path:provider`
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}:{}", self.path_kind, self.provider_id)
    }

    /// Whether capabilities satisfy the context (tooling and domain)
    #[must_use]
    pub fn supports(&self, context: &RoutingContext) -> bool {
        if context.require_tools() && !self.capabilities.supports_tools {
            return false;
        }
        self.capabilities.domains.is_empty()
            || self
                .capabilities
                .domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(context.domain()))
    }
}

// ============================================================================
// Outcomes and Decisions
// ============================================================================

/// Result of one attempt against one route. Immutable event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Request this attempt belongs to
    pub request_id: String,

    /// Route that was attempted
    pub route_id: String,

    /// Bandit context the request was classified into
    pub context_key: ContextKey,

    /// Whether the attempt succeeded
    pub success: bool,

    /// Wall-clock latency of the attempt (ms)
    pub latency_ms: u64,

    /// Cost in minor currency units
    pub cost_units: u64,

    /// When the attempt resolved
    pub timestamp: DateTime<Utc>,
}

impl Outcome {
    /// Build an outcome stamped with the current time
    pub fn new(
        request_id: impl Into<String>,
        route_id: impl Into<String>,
        context_key: ContextKey,
        success: bool,
        latency_ms: u64,
        cost_units: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            route_id: route_id.into(),
            context_key,
            success,
            latency_ms,
            cost_units,
            timestamp: Utc::now(),
        }
    }
}

/// How the chosen route was selected
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionMode {
    /// Lowest expected latency, no exploration
    EmergencyDeterministic,
    /// Sampled proportionally to Thompson weights
    BanditSampled,
    /// Only one candidate existed
    SingleCandidate,
}

impl SelectionMode {
    /// Label used in reasoning strings
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmergencyDeterministic => "emergency-deterministic",
            Self::BanditSampled => "bandit-sampled",
            Self::SingleCandidate => "single-candidate",
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The router's choice for one request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Request identifier
    pub request_id: String,

    /// Bandit context
    pub context_key: ContextKey,

    /// Route selected as primary
    pub chosen_route: String,

    /// Whether execution ended on a fallback route
    pub fallback_used: bool,

    /// Human-readable explanation (weights and candidate health)
    pub reasoning: String,

    /// How the route was selected
    pub selection: SelectionMode,

    /// Route with the highest posterior mean among candidates, if any
    pub preferred_route: Option<String>,

    /// Remaining candidates, best first, for the fallback controller
    pub alternatives: Vec<String>,

    /// Whether health filtering was bypassed because every match was open
    pub degraded: bool,

    /// When the decision was made
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_sla_table() {
        assert_eq!(Priority::Emergency.default_sla(), Duration::from_millis(5_000));
        assert_eq!(Priority::Critical.default_sla(), Duration::from_millis(10_000));
        assert_eq!(Priority::Standard.default_sla(), Duration::from_millis(30_000));
        assert!(Priority::Emergency.enforces_deadline());
        assert!(!Priority::Standard.enforces_deadline());
    }

    #[test]
    fn test_context_key_format() {
        let ctx = RoutingContext::new(
            "chat",
            Priority::Standard,
            "domainX",
            BudgetTier::Standard,
            Duration::from_secs(30),
            false,
        );
        assert_eq!(ctx.context_key().as_str(), "standard|domainX|standard");
    }

    #[test]
    fn test_route_capability_matching() {
        let tools = RoutingContext::new(
            "agent",
            Priority::Critical,
            "finance",
            BudgetTier::Premium,
            Duration::from_secs(10),
            true,
        );

        let plain = Route::new(PathKind::Direct, "alpha");
        assert!(!plain.supports(&tools));

        let tooled = Route::new(PathKind::Broker, "beta").with_tools(true);
        assert!(tooled.supports(&tools));

        let other_domain = Route::new(PathKind::Broker, "gamma")
            .with_tools(true)
            .with_domains(vec!["medical".to_string()]);
        assert!(!other_domain.supports(&tools));

        let same_domain = Route::new(PathKind::Broker, "delta")
            .with_tools(true)
            .with_domains(vec!["Finance".to_string()]);
        assert!(same_domain.supports(&tools));
    }

    #[test]
    fn test_route_id() {
        let route = Route::new(PathKind::Broker, "openrouter");
        assert_eq!(route.id(), "broker:openrouter");
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("EMERGENCY".parse::<Priority>(), Ok(Priority::Emergency));
        assert!("urgent".parse::<Priority>().is_err());
        assert_eq!("high".parse::<BudgetTier>(), Ok(BudgetTier::Premium));
        assert_eq!("direct".parse::<PathKind>(), Ok(PathKind::Direct));
    }
}
