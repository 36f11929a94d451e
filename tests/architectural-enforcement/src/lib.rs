//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural
//! principles of the routing core:
//! - No sleep() calls in production code (routing awaits I/O and timers,
//!   never wall-clock naps)
//!
//! These tests are designed to catch violations early in the development cycle.

use std::path::{Path, PathBuf};

/// Source directories scanned by the enforcement tests, relative to the
/// workspace root
pub const PRODUCTION_SOURCE_DIRS: &[&str] = &["switchyard/core/src"];

/// Workspace root, resolved from this package's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Absolute path of a workspace-relative directory
#[must_use]
pub fn workspace_path(relative: &str) -> PathBuf {
    workspace_root().join(relative)
}
