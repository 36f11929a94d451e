//! Adaptive Request Routing
//!
//! Routes each request over one of two path kinds (direct to a provider, or
//! through a broker) and learns which route works best per request shape.
//!
//! # Architecture
//!
//! ```text
//!  RequestMetadata
//!        |
//!        v
//! +-------------------+
//! | RequestClassifier |  <-- priority, domain, budget tier, SLA deadline
//! +---------+---------+
//!           | RoutingContext
//!           v
//! +-------------------+     +-----------------+
//! | IntelligentRouter | <-- | HealthMonitor   |  circuit breaker per route
//! |                   | <-- | BanditOptimizer |  Thompson sampling per context
//! +---------+---------+     +-----------------+
//!           | RoutingDecision
//!           v
//! +--------------------+
//! | FallbackController |  <-- deadline budget, one fallback hop
//! +---------+----------+
//!           | Outcomes
//!           v
//!   health + bandit + PerformanceTracker
//! ```
//!
//! # Design Principles
//!
//! 1. **SLA first**: emergency requests never explore
//! 2. **Isolation**: failing routes are cut off until a probe succeeds
//! 3. **Per-key state**: no global lock on the request path
//! 4. **Nothing lost**: every decision and attempt is recorded

pub mod bandit;
pub mod classifier;
pub mod error;
pub mod fallback;
pub mod health;
pub mod metrics;
pub mod router;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use bandit::*;
pub use classifier::*;
pub use error::*;
pub use fallback::*;
pub use health::*;
pub use metrics::*;
pub use router::*;
pub use types::*;
