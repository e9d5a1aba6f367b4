//! Report emission: a human-readable summary to stdout, and optionally the
//! full [`questrunner_core::RunResult`] as JSON to a file.

use anyhow::{Context, Result};
use questrunner_core::RunResult;
use std::path::Path;

/// Prints a one-screen summary of a run, in the vein of a test runner's
/// console output: per-request pass/fail counts, then the aggregate totals.
pub fn print_summary(result: &RunResult) {
    println!("Collection: {} ({})", result.collection_name, result.collection_id);
    println!("Duration:   {}ms", result.duration_ms);
    println!();

    if let Some(errors) = &result.validation_errors {
        println!("Validation failed with {} error(s):", errors.len());
        for error in errors {
            let location = error
                .location
                .map(|loc| format!(" ({}:{})", loc.line, loc.column))
                .unwrap_or_default();
            println!("  [{:?}] {}{}", error.source, error.message, location);
        }
        return;
    }

    for record in &result.request_results {
        let status = if let Some(reason) = &record.script_error {
            format!("SKIPPED: {reason}")
        } else {
            let passed = record.tests.iter().filter(|t| t.passed).count();
            let failed = record.tests.iter().filter(|t| !t.passed && !t.skipped).count();
            format!("{passed} passed, {failed} failed")
        };
        println!("  {} [iter {}] — {status}", record.path, record.iteration);
        for test in &record.tests {
            let mark = if test.skipped {
                "SKIP"
            } else if test.passed {
                "PASS"
            } else {
                "FAIL"
            };
            println!("      [{mark}] {}", test.name);
            if let Some(error) = &test.error {
                println!("            {error}");
            }
        }
    }

    println!();
    println!(
        "Tests: {} total, {} passed, {} failed, {} skipped",
        result.total_tests, result.passed_tests, result.failed_tests, result.skipped_tests
    );
    if result.aborted {
        println!("ABORTED: {}", result.abort_reason.as_deref().unwrap_or("unknown reason"));
    }
}

/// Writes the full [`RunResult`] as pretty-printed JSON to `path`.
pub async fn write_json_report(result: &RunResult, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("failed to serialize run result")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("failed to write report to {}", path.display()))?;
    Ok(())
}

/// The process exit code a run's outcome maps to: non-zero when anything
/// failed, was aborted, or the collection never ran due to validation.
pub fn exit_code(result: &RunResult) -> i32 {
    if result.validation_errors.is_some() || result.aborted || result.failed_tests > 0 {
        1
    } else {
        0
    }
}
