//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production routing code MUST NOT call sleep methods. Deadlines
//! are enforced with `tokio::time::timeout` against an explicit budget and
//! periodic work uses `tokio::time::interval`.
//! **Exceptions**: test code (`#[cfg(test)]` modules, `test_utils.rs`)

use std::fs;
use std::path::Path;

use architectural_enforcement::{workspace_path, PRODUCTION_SOURCE_DIRS};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_sleep_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {}", violation);
        }

        eprintln!("\n✅ ACCEPTABLE sleep uses:");
        eprintln!("  - Test code (#[cfg(test)] modules, test_utils.rs)");
        eprintln!("  - Periodic tasks using tokio::time::interval()");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep while waiting for a route to recover (use the circuit breaker)");
        eprintln!("  - Sleep to pace fallback attempts (use the deadline budget)");
        eprintln!("  - Sleep in polling loops");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

/// The scan must actually see the routing sources
#[test]
fn test_production_sources_are_scanned() {
    for dir in PRODUCTION_SOURCE_DIRS {
        let path = workspace_path(dir);
        assert!(path.exists(), "missing source directory {}", path.display());
        assert!(
            rust_files(&path) > 0,
            "no Rust files found under {}",
            path.display()
        );
    }
}

/// Find all sleep() calls in production code
fn find_sleep_violations() -> Vec<String> {
    let mut violations = Vec::new();

    for dir in PRODUCTION_SOURCE_DIRS {
        check_directory(
            &workspace_path(dir),
            &mut violations,
            &SleepPolicy { allow_tests: true },
        );
    }

    violations
}

struct SleepPolicy {
    allow_tests: bool,
}

fn rust_files(path: &Path) -> usize {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .count()
}

fn check_directory(path: &Path, violations: &mut Vec<String>, policy: &SleepPolicy) {
    if !path.exists() {
        return;
    }

    for entry in walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.path().extension().and_then(|s| s.to_str()) != Some("rs") {
            continue;
        }
        // Scripted test doubles live here and are compiled only for tests
        if policy.allow_tests && entry.path().ends_with("test_utils.rs") {
            continue;
        }
        check_file(entry.path(), violations, policy);
    }
}

fn check_file(path: &Path, violations: &mut Vec<String>, policy: &SleepPolicy) {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return,
    };

    let lines: Vec<&str> = content.lines().collect();
    let test_module_start = if policy.allow_tests {
        find_test_module_start(&lines)
    } else {
        None
    };

    for (idx, line) in lines.iter().enumerate() {
        let line_number = idx + 1;

        if test_module_start.is_some_and(|start| idx >= start) {
            break;
        }

        // Skip comments
        let code_part = line.split("//").next().unwrap_or(line);

        // Check for sleep calls
        if code_part.contains("::sleep(") || code_part.contains(".sleep(") {
            // Check if it's in a test function
            if policy.allow_tests && is_in_test_function(&lines, idx) {
                continue;
            }

            // Check if it's using tokio::time::interval (acceptable)
            if is_interval_pattern(&lines, idx) {
                continue;
            }

            violations.push(format!(
                "{}:{} - {}",
                path.display(),
                line_number,
                line.trim()
            ));
        }
    }
}

/// Index of the `#[cfg(test)]` attribute that opens the trailing
/// `mod tests { ... }` block
fn find_test_module_start(lines: &[&str]) -> Option<usize> {
    lines.windows(2).position(|pair| {
        pair[0].trim().starts_with("#[cfg(test)]") && pair[1].trim().starts_with("mod tests")
    })
}

/// Check if line is inside a test function
fn is_in_test_function(lines: &[&str], current_idx: usize) -> bool {
    // Scan backwards for #[test] or #[tokio::test]
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();

        if (line.starts_with("fn ") || line.starts_with("async fn ")) && !line.contains("test") {
            return false; // Found a non-test function first
        }

        if line.starts_with("#[test]") || line.starts_with("#[tokio::test") {
            return true;
        }

        // Stop at module boundaries
        if line.starts_with("mod ") || line.starts_with("impl ") {
            return false;
        }
    }
    false
}

/// Check if this is tokio::time::interval pattern (acceptable for periodic tasks)
fn is_interval_pattern(lines: &[&str], current_idx: usize) -> bool {
    // Look backwards for interval usage
    let context_range = current_idx.saturating_sub(20)..current_idx;

    for i in context_range {
        let line = lines[i];
        if line.contains("ticker.tick()")
            || line.contains("interval.tick()")
            || line.contains("tokio::time::interval")
        {
            return true;
        }
    }

    // Also check forward a bit
    let forward_range = current_idx..std::cmp::min(current_idx + 5, lines.len());
    for i in forward_range {
        let line = lines[i];
        if line.contains("ticker.tick()") || line.contains("interval.tick()") {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_outside_test_is_detected() {
        let test_code = vec![
            "fn wait_for_recovery() {",
            "    tokio::time::sleep(Duration::from_millis(10)).await;",
            "}",
        ];

        assert!(
            !is_in_test_function(&test_code, 1),
            "Should detect this is not a test"
        );
        assert!(!is_interval_pattern(&test_code, 1));
    }

    #[test]
    fn test_sleep_inside_test_is_allowed() {
        let test_code = vec![
            "#[tokio::test(start_paused = true)]",
            "async fn test_deadline() {",
            "    tokio::time::sleep(Duration::from_secs(1)).await;",
            "}",
        ];

        assert!(is_in_test_function(&test_code, 2));
    }

    #[test]
    fn test_trailing_test_module_is_found() {
        let test_code = vec![
            "#[cfg(test)]",
            "mod test_utils;",
            "pub fn route() {}",
            "",
            "#[cfg(test)]",
            "mod tests {",
            "    async fn helper() { tokio::time::sleep(d).await; }",
            "}",
        ];

        assert_eq!(find_test_module_start(&test_code), Some(4));
    }

    #[test]
    fn test_interval_detection() {
        let test_code = vec![
            "let mut ticker = tokio::time::interval(period);",
            "loop {",
            "    ticker.tick().await;",
            "    probe.sleep(0);",
            "}",
        ];

        assert!(is_interval_pattern(&test_code, 3));
    }
}
