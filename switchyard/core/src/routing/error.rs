//! Routing Errors
//!
//! Terminal errors surfaced to callers. Circuit-breaker trips are not errors;
//! they only change which routes are candidates.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::PathKind;

/// Why a single attempt failed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The remaining deadline budget ran out before the provider answered
    Timeout,
    /// The provider reported an error
    Provider {
        /// Provider error message
        message: String,
        /// Whether the provider considered the error transient
        transient: bool,
    },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "deadline exceeded"),
            Self::Provider { message, transient } => {
                if *transient {
                    write!(f, "transient provider error: {message}")
                } else {
                    write!(f, "provider error: {message}")
                }
            }
        }
    }
}

/// One failed attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFailure {
    /// Route that was attempted
    pub route_id: String,
    /// Connection path of that route
    pub path_kind: PathKind,
    /// Time spent on the attempt (ms)
    pub elapsed_ms: u64,
    /// What went wrong
    pub reason: FailureReason,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} after {}ms: {}", self.route_id, self.elapsed_ms, self.reason)
    }
}

/// Ordered list of failed attempts for one request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptTrace {
    /// Attempts in the order they were made
    pub attempts: Vec<AttemptFailure>,
}

impl AttemptTrace {
    /// Empty trace
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a failed attempt
    pub fn push(&mut self, failure: AttemptFailure) {
        self.attempts.push(failure);
    }

    /// Number of failed attempts
    #[must_use]
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    /// Whether nothing failed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// Route ids in attempt order
    pub fn route_ids(&self) -> impl Iterator<Item = &str> {
        self.attempts.iter().map(|a| a.route_id.as_str())
    }

    /// Last failed attempt
    #[must_use]
    pub fn last(&self) -> Option<&AttemptFailure> {
        self.attempts.last()
    }
}

impl fmt::Display for AttemptTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempts.is_empty() {
            return write!(f, "no attempts");
        }
        for (i, attempt) in self.attempts.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "[{}] {}", i + 1, attempt)?;
        }
        Ok(())
    }
}

/// Errors surfaced by the router
#[derive(Debug, Error)]
pub enum RoutingError {
    /// No registered route satisfies the context's capabilities
    #[error("no route available for context {context_key}")]
    NoRouteAvailable {
        /// Context key of the rejected request
        context_key: String,
    },

    /// Deadline exceeded on a specific route
    #[error("route {route_id} timed out ({trace})")]
    RouteTimeout {
        /// Route that timed out
        route_id: String,
        /// Every attempt made for the request
        trace: AttemptTrace,
    },

    /// Provider-level failure on a specific route
    #[error("route {route_id} failed ({trace})")]
    RouteExecutionFailed {
        /// Route that failed
        route_id: String,
        /// Every attempt made for the request
        trace: AttemptTrace,
    },

    /// Primary and fallback both failed
    #[error("all routes exhausted ({trace})")]
    ExhaustedRoutes {
        /// Every attempt made for the request
        trace: AttemptTrace,
    },

    /// Malformed classifier input
    #[error("invalid routing context: {0}")]
    InvalidContext(String),
}

impl RoutingError {
    /// Whether a caller may reasonably resubmit the request
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidContext(_) | Self::NoRouteAvailable { .. }
        )
    }

    /// Attempt trace, for errors raised after execution started
    #[must_use]
    pub fn trace(&self) -> Option<&AttemptTrace> {
        match self {
            Self::RouteTimeout { trace, .. }
            | Self::RouteExecutionFailed { trace, .. }
            | Self::ExhaustedRoutes { trace } => Some(trace),
            Self::NoRouteAvailable { .. } | Self::InvalidContext(_) => None,
        }
    }

    /// Short machine-readable name
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoRouteAvailable { .. } => "no_route_available",
            Self::RouteTimeout { .. } => "route_timeout",
            Self::RouteExecutionFailed { .. } => "route_execution_failed",
            Self::ExhaustedRoutes { .. } => "exhausted_routes",
            Self::InvalidContext(_) => "invalid_context",
        }
    }

    /// Build the terminal error for a failed execution.
    ///
    /// A single failed attempt keeps its specific kind; more than one is
    /// reported as exhaustion.
    pub(crate) fn from_trace(trace: AttemptTrace) -> Self {
        let single = match trace.attempts.as_slice() {
            [only] => Some((only.route_id.clone(), only.reason == FailureReason::Timeout)),
            _ => None,
        };
        match single {
            Some((route_id, true)) => Self::RouteTimeout { route_id, trace },
            Some((route_id, false)) => Self::RouteExecutionFailed { route_id, trace },
            None => Self::ExhaustedRoutes { trace },
        }
    }
}
