//! Targeted test gate
//!
//! Runs named pytest subsets (FAIL_TO_PASS, and a PASS_TO_PASS smoke
//! slice) inside the workspace under a hard wall-clock bound, and
//! reduces the output to pass/fail counts. Counters parsed from the
//! output always win; the exit code is only a fallback when pytest
//! printed no summary at all.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::RunConfig;
use crate::exec::{command, run_with_timeout};

/// Exit code reported for a subset that hit the deadline.
const TIMEOUT_RETURNCODE: i32 = 124;

/// How much subset output is retained for logs.
const OUTPUT_EXCERPT_BYTES: usize = 2000;

static PASSED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+passed").unwrap());
static FAILED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+failed").unwrap());

/// Outcome of one pytest subset run.
#[derive(Debug, Clone)]
pub struct SubsetOutcome {
    pub passed: usize,
    pub failed: usize,
    pub returncode: i32,
    pub output: String,
}

/// Targeted test results for one candidate patch.
///
/// All-null when test checks were not required; `clean_resolution` is
/// defined only when both subsets actually ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestMetrics {
    pub f2p_total: usize,
    pub f2p_passed: Option<usize>,
    pub f2p_failed: Option<usize>,
    pub f2p_pass_rate: Option<f64>,
    pub f2p_all_passed: bool,
    pub p2p_smoke_total: Option<usize>,
    pub p2p_smoke_failures: Option<usize>,
    pub clean_resolution: Option<bool>,
}

impl TestMetrics {
    /// The untested skeleton: totals known, everything else null.
    pub fn skeleton(f2p_total: usize) -> Self {
        Self {
            f2p_total,
            f2p_passed: None,
            f2p_failed: None,
            f2p_pass_rate: None,
            f2p_all_passed: false,
            p2p_smoke_total: None,
            p2p_smoke_failures: None,
            clean_resolution: None,
        }
    }
}

/// Runs pytest subsets with a bounded deadline.
#[derive(Debug, Clone)]
pub struct TestGate {
    program: String,
    timeout: Duration,
    smoke_count: usize,
}

impl TestGate {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            program: "pytest".to_string(),
            timeout: config.pytest_timeout,
            smoke_count: config.p2p_smoke_count,
        }
    }

    /// Override the test runner binary (integration tests use a stub).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Run `pytest -q <tests...>` and reduce to counts.
    pub async fn run_subset(&self, workspace: &Path, tests: &[String]) -> SubsetOutcome {
        let mut args: Vec<&str> = vec!["-q"];
        args.extend(tests.iter().map(String::as_str));

        let mut cmd = command(&self.program, &args, workspace);
        let out = match run_with_timeout(&mut cmd, self.timeout).await {
            Ok(out) => out,
            Err(e) => {
                warn!(tests = tests.len(), "pytest execution error: {e}");
                return SubsetOutcome {
                    passed: 0,
                    failed: tests.len(),
                    returncode: 1,
                    output: e.to_string(),
                };
            }
        };

        if out.timed_out {
            warn!(tests = tests.len(), "pytest timed out");
            return SubsetOutcome {
                passed: 0,
                failed: tests.len(),
                returncode: TIMEOUT_RETURNCODE,
                output: "timeout".to_string(),
            };
        }

        let combined = out.combined();
        let returncode = out.status.unwrap_or(1);
        let (passed, failed) = reduce_counts(&combined, returncode, tests.len());
        SubsetOutcome {
            passed,
            failed,
            returncode,
            output: excerpt(&combined),
        }
    }

    /// Evaluate a candidate against the target test sets.
    pub async fn evaluate(
        &self,
        workspace: &Path,
        fail_to_pass: &[String],
        pass_to_pass: &[String],
        require: bool,
    ) -> TestMetrics {
        let mut metrics = TestMetrics::skeleton(fail_to_pass.len());
        if !require {
            return metrics;
        }

        if !fail_to_pass.is_empty() {
            let f2p = self.run_subset(workspace, fail_to_pass).await;
            metrics.f2p_passed = Some(f2p.passed);
            metrics.f2p_failed = Some(f2p.failed);
            metrics.f2p_pass_rate = Some(f2p.passed as f64 / fail_to_pass.len().max(1) as f64);
            metrics.f2p_all_passed = f2p.failed == 0;
        }

        let smoke = &pass_to_pass[..pass_to_pass.len().min(self.smoke_count)];
        if !smoke.is_empty() {
            let p2p = self.run_subset(workspace, smoke).await;
            metrics.p2p_smoke_total = Some(smoke.len());
            metrics.p2p_smoke_failures = Some(p2p.failed);
        }

        if metrics.f2p_all_passed {
            if let Some(failures) = metrics.p2p_smoke_failures {
                metrics.clean_resolution = Some(failures == 0);
            }
        }
        metrics
    }
}

/// Parse `N passed` / `N failed` counters from combined output.
pub fn parse_pytest_counts(output: &str) -> (usize, usize) {
    let passed = PASSED_RE
        .captures(output)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0);
    let failed = FAILED_RE
        .captures(output)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0);
    (passed, failed)
}

/// Counters first; exit code only when no counter appeared; clamp to
/// the number of requested tests.
fn reduce_counts(output: &str, returncode: i32, requested: usize) -> (usize, usize) {
    let (mut passed, mut failed) = parse_pytest_counts(output);
    if passed + failed == 0 {
        if returncode == 0 {
            passed = requested;
        } else {
            failed = requested.max(1);
        }
    }
    (passed.min(requested), failed.min(requested))
}

fn excerpt(output: &str) -> String {
    if output.len() <= OUTPUT_EXCERPT_BYTES {
        output.to_string()
    } else {
        let end = output
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= OUTPUT_EXCERPT_BYTES)
            .last()
            .unwrap_or(0);
        output[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_counts() {
        assert_eq!(parse_pytest_counts("3 passed, 1 failed in 0.5s"), (3, 1));
        assert_eq!(parse_pytest_counts("5 passed in 1.2s"), (5, 0));
        assert_eq!(parse_pytest_counts("2 failed in 0.1s"), (0, 2));
        assert_eq!(parse_pytest_counts("no summary here"), (0, 0));
    }

    #[test]
    fn test_reduce_counts_counters_win_over_returncode() {
        // Nonzero exit but a passed counter present: counters win.
        assert_eq!(reduce_counts("4 passed in 1s", 2, 4), (4, 0));
    }

    #[test]
    fn test_reduce_counts_returncode_fallback() {
        assert_eq!(reduce_counts("collected nothing", 0, 3), (3, 0));
        assert_eq!(reduce_counts("import error", 2, 3), (0, 3));
        // Even zero requested tests report one failure on a bad exit.
        assert_eq!(reduce_counts("boom", 1, 0), (0, 0));
    }

    #[test]
    fn test_reduce_counts_clamped_to_requested() {
        // Parametrized tests can report more results than node IDs.
        assert_eq!(reduce_counts("12 passed, 9 failed", 1, 2), (2, 2));
    }

    #[tokio::test]
    async fn test_evaluate_not_required_returns_skeleton() {
        let gate = TestGate {
            program: "pytest".to_string(),
            timeout: Duration::from_secs(5),
            smoke_count: 10,
        };
        let metrics = gate
            .evaluate(
                &std::env::temp_dir(),
                &["tests/test_a.py::test_x".to_string()],
                &["tests/test_b.py::test_y".to_string()],
                false,
            )
            .await;
        assert_eq!(metrics.f2p_total, 1);
        assert!(metrics.f2p_passed.is_none());
        assert!(metrics.f2p_pass_rate.is_none());
        assert!(metrics.p2p_smoke_failures.is_none());
        assert!(metrics.clean_resolution.is_none());
        assert!(!metrics.f2p_all_passed);
    }

    #[tokio::test]
    async fn test_empty_f2p_never_synthesizes_a_pass() {
        let gate = TestGate {
            program: "pytest".to_string(),
            timeout: Duration::from_secs(5),
            smoke_count: 10,
        };
        let metrics = gate.evaluate(&std::env::temp_dir(), &[], &[], true).await;
        assert_eq!(metrics.f2p_total, 0);
        assert!(metrics.f2p_pass_rate.is_none());
        assert!(!metrics.f2p_all_passed);
        assert!(metrics.clean_resolution.is_none());
    }
}
