//! Request Classification
//!
//! Maps raw request metadata into an immutable [`RoutingContext`]. Pure and
//! non-blocking; the only failure is [`RoutingError::InvalidContext`].

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::error::RoutingError;
use super::types::{BudgetTier, Priority, RoutingContext};

/// Domain used when the caller does not supply one
pub const DEFAULT_DOMAIN: &str = "general";

/// Built-in operation types with a non-standard priority
const OPERATION_PRIORITIES: &[(&str, Priority)] = &[
    ("emergency_dispatch", Priority::Emergency),
    ("incident_response", Priority::Emergency),
    ("patient_alert", Priority::Emergency),
    ("safety_check", Priority::Emergency),
    ("fraud_check", Priority::Critical),
    ("realtime_chat", Priority::Critical),
    ("trade_execution", Priority::Critical),
    ("voice_response", Priority::Critical),
    ("batch_summary", Priority::Standard),
    ("chat", Priority::Standard),
    ("report_generation", Priority::Standard),
];

// ============================================================================
// SLA Table
// ============================================================================

/// Maximum SLA deadline per priority
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaTable {
    /// Emergency deadline
    #[serde(with = "duration_ms")]
    pub emergency: Duration,
    /// Critical deadline
    #[serde(with = "duration_ms")]
    pub critical: Duration,
    /// Standard deadline
    #[serde(with = "duration_ms")]
    pub standard: Duration,
}

impl Default for SlaTable {
    fn default() -> Self {
        Self {
            emergency: Priority::Emergency.default_sla(),
            critical: Priority::Critical.default_sla(),
            standard: Priority::Standard.default_sla(),
        }
    }
}

impl SlaTable {
    /// Deadline for a priority
    #[must_use]
    pub fn deadline(&self, priority: Priority) -> Duration {
        match priority {
            Priority::Emergency => self.emergency,
            Priority::Critical => self.critical,
            Priority::Standard => self.standard,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

// ============================================================================
// Request Metadata
// ============================================================================

/// Raw, unvalidated request description supplied by callers
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Operation type (required)
    pub operation_type: String,

    /// Explicit priority; derived from the operation type when absent
    #[serde(default)]
    pub priority: Option<String>,

    /// Domain tag; defaults to [`DEFAULT_DOMAIN`]
    #[serde(default)]
    pub domain: Option<String>,

    /// Budget tier; defaults to standard
    #[serde(default)]
    pub budget_tier: Option<String>,

    /// Tighter deadline than the priority's table value (ms)
    #[serde(default)]
    pub sla_deadline_ms: Option<u64>,

    /// Whether the request needs tool calling
    #[serde(default)]
    pub require_tools: bool,
}

impl RequestMetadata {
    /// Metadata for an operation type
    pub fn new(operation_type: impl Into<String>) -> Self {
        Self {
            operation_type: operation_type.into(),
            ..Default::default()
        }
    }

    /// Set an explicit priority
    #[must_use]
    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    /// Set the domain tag
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Set the budget tier
    #[must_use]
    pub fn with_budget_tier(mut self, tier: impl Into<String>) -> Self {
        self.budget_tier = Some(tier.into());
        self
    }

    /// Request a tighter deadline
    #[must_use]
    pub fn with_sla_deadline_ms(mut self, ms: u64) -> Self {
        self.sla_deadline_ms = Some(ms);
        self
    }

    /// Require tool calling
    #[must_use]
    pub fn with_tools(mut self) -> Self {
        self.require_tools = true;
        self
    }
}

// ============================================================================
// Classifier
// ============================================================================

/// Stateless mapping from metadata to routing context.
///
/// The SLA table is hot-reloadable; reads take a short read lock.
#[derive(Debug)]
pub struct RequestClassifier {
    sla: RwLock<SlaTable>,
    operations: HashMap<String, Priority>,
}

impl Default for RequestClassifier {
    fn default() -> Self {
        Self::new(SlaTable::default())
    }
}

impl RequestClassifier {
    /// Classifier with the built-in operation table
    #[must_use]
    pub fn new(sla: SlaTable) -> Self {
        let operations = OPERATION_PRIORITIES
            .iter()
            .map(|(op, p)| ((*op).to_string(), *p))
            .collect();
        Self {
            sla: RwLock::new(sla),
            operations,
        }
    }

    /// Map an additional operation type to a priority
    #[must_use]
    pub fn with_operation(mut self, operation_type: impl Into<String>, priority: Priority) -> Self {
        self.operations
            .insert(operation_type.into().to_ascii_lowercase(), priority);
        self
    }

    /// Current SLA table
    #[must_use]
    pub fn sla_table(&self) -> SlaTable {
        *self.sla.read()
    }

    /// Replace the SLA table
    pub fn set_sla_table(&self, sla: SlaTable) {
        *self.sla.write() = sla;
    }

    /// Priority for an operation type; unknown types are standard
    #[must_use]
    pub fn priority_for(&self, operation_type: &str) -> Priority {
        self.operations
            .get(&operation_type.trim().to_ascii_lowercase())
            .copied()
            .unwrap_or_default()
    }

    /// Classify raw metadata
    pub fn classify(&self, metadata: &RequestMetadata) -> Result<RoutingContext, RoutingError> {
        let operation_type = metadata.operation_type.trim();
        if operation_type.is_empty() {
            return Err(RoutingError::InvalidContext(
                "operation type is empty".to_string(),
            ));
        }

        let priority = match metadata.priority.as_deref() {
            Some(raw) => raw.parse::<Priority>().map_err(RoutingError::InvalidContext)?,
            None => self.priority_for(operation_type),
        };

        let domain = match metadata.domain.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_DOMAIN.to_string(),
            Some(d) if d.contains('|') => {
                return Err(RoutingError::InvalidContext(format!(
                    "domain must not contain '|': {d}"
                )));
            }
            Some(d) => d.to_string(),
        };

        let budget_tier = match metadata.budget_tier.as_deref() {
            Some(raw) => raw
                .parse::<BudgetTier>()
                .map_err(RoutingError::InvalidContext)?,
            None => BudgetTier::default(),
        };

        let ceiling = self.sla.read().deadline(priority);
        let sla_deadline = match metadata.sla_deadline_ms {
            Some(0) => {
                return Err(RoutingError::InvalidContext(
                    "SLA deadline must be positive".to_string(),
                ));
            }
            Some(ms) => Duration::from_millis(ms).min(ceiling),
            None => ceiling,
        };

        Ok(RoutingContext::new(
            operation_type,
            priority,
            domain,
            budget_tier,
            sla_deadline,
            metadata.require_tools,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_table() {
        let classifier = RequestClassifier::default();

        let ctx = classifier
            .classify(&RequestMetadata::new("emergency_dispatch"))
            .unwrap();
        assert_eq!(ctx.priority(), Priority::Emergency);
        assert_eq!(ctx.sla_deadline(), Duration::from_millis(5_000));
        assert_eq!(ctx.domain(), DEFAULT_DOMAIN);
        assert_eq!(ctx.budget_tier(), BudgetTier::Standard);

        let ctx = classifier.classify(&RequestMetadata::new("fraud_check")).unwrap();
        assert_eq!(ctx.priority(), Priority::Critical);
        assert_eq!(ctx.sla_deadline(), Duration::from_millis(10_000));
    }

    #[test]
    fn test_unknown_operation_is_standard() {
        let classifier = RequestClassifier::default();
        let ctx = classifier
            .classify(&RequestMetadata::new("compose_haiku"))
            .unwrap();
        assert_eq!(ctx.priority(), Priority::Standard);
        assert_eq!(ctx.sla_deadline(), Duration::from_millis(30_000));
    }

    #[test]
    fn test_explicit_fields() {
        let classifier = RequestClassifier::default();
        let meta = RequestMetadata::new("chat")
            .with_priority("critical")
            .with_domain("finance")
            .with_budget_tier("premium")
            .with_tools();
        let ctx = classifier.classify(&meta).unwrap();
        assert_eq!(ctx.priority(), Priority::Critical);
        assert!(ctx.require_tools());
        assert_eq!(ctx.context_key().as_str(), "critical|finance|premium");
    }

    #[test]
    fn test_deadline_override_is_clamped() {
        let classifier = RequestClassifier::default();

        let tighter = RequestMetadata::new("emergency_dispatch").with_sla_deadline_ms(1_500);
        assert_eq!(
            classifier.classify(&tighter).unwrap().sla_deadline(),
            Duration::from_millis(1_500)
        );

        let looser = RequestMetadata::new("emergency_dispatch").with_sla_deadline_ms(60_000);
        assert_eq!(
            classifier.classify(&looser).unwrap().sla_deadline(),
            Duration::from_millis(5_000)
        );
    }

    #[test]
    fn test_malformed_input() {
        let classifier = RequestClassifier::default();

        let cases = vec![
            RequestMetadata::new("   "),
            RequestMetadata::new("chat").with_priority("urgent"),
            RequestMetadata::new("chat").with_budget_tier("free"),
            RequestMetadata::new("chat").with_domain("a|b"),
            RequestMetadata::new("chat").with_sla_deadline_ms(0),
        ];
        for meta in cases {
            let err = classifier.classify(&meta).unwrap_err();
            assert!(matches!(err, RoutingError::InvalidContext(_)), "{meta:?}");
        }
    }

    #[test]
    fn test_sla_table_reload() {
        let classifier = RequestClassifier::default().with_operation("Triage", Priority::Emergency);
        classifier.set_sla_table(SlaTable {
            emergency: Duration::from_millis(3_000),
            ..SlaTable::default()
        });
        let ctx = classifier.classify(&RequestMetadata::new("triage")).unwrap();
        assert_eq!(ctx.priority(), Priority::Emergency);
        assert_eq!(ctx.sla_deadline(), Duration::from_millis(3_000));
    }
}
