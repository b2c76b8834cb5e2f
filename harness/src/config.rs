//! Run configuration
//!
//! All knobs for one evaluation invocation. Defaults match the vanilla
//! profile; every knob can be overridden from the environment
//! (`SWE_*` variables) and the CLI layers its flags on top.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EvalError;

/// Loop-control policy for the agent driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopPolicy {
    /// No detection, no warnings; the agent runs to the step limit.
    Off,
    /// Detection runs and warnings are injected, but no aborts.
    Warn,
    /// Detected non-progress terminates the run with status "LoopAborted".
    Strict,
}

impl FromStr for LoopPolicy {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "warn" => Ok(Self::Warn),
            "strict" => Ok(Self::Strict),
            other => Err(EvalError::config(format!(
                "unknown loop policy '{other}' (expected off, warn, or strict)"
            ))),
        }
    }
}

impl std::fmt::Display for LoopPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Warn => write!(f, "warn"),
            Self::Strict => write!(f, "strict"),
        }
    }
}

/// Evaluation mode flags, derived from the selected variant.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalMode {
    /// Append the test-first appendix and enable test-repair rounds.
    pub tdd_mode: bool,
    /// Build the code graph and run impacted-test repair rounds.
    pub use_graphrag: bool,
}

impl EvalMode {
    /// Whether targeted test runs are required after each agent run.
    pub fn requires_tests(&self) -> bool {
        self.tdd_mode || self.use_graphrag
    }
}

/// Immutable per-invocation configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Maximum end-to-end attempts per instance.
    pub max_attempts: u32,
    /// Maximum model calls per agent run.
    pub step_limit: u32,
    /// Cost ceiling per agent run; 0 disables cost accounting.
    pub cost_limit: f64,
    /// Loop-control policy.
    pub loop_policy: LoopPolicy,
    /// Test-repair rounds within one attempt (TDD / GraphRAG modes).
    pub max_fix_iterations: u32,
    /// Compile-only repair rounds within one attempt.
    pub max_compile_fix_iterations: u32,
    /// Enable the per-file python compile gate.
    pub patch_compile_gate: bool,

    /// Consecutive search commands (find/grep/rg/ls) before abort.
    pub search_streak_limit: u32,
    /// Consecutive unchanged non-empty diff signatures before abort.
    pub no_diff_streak_limit: u32,
    /// Consecutive identical failing commands before abort.
    pub repeated_fail_limit: u32,
    /// Consecutive failing `sed -i` commands before abort.
    pub sed_fail_limit: u32,

    /// How many PASS_TO_PASS tests form the smoke subset.
    pub p2p_smoke_count: usize,
    /// Wall-clock bound for each pytest subset run.
    pub pytest_timeout: Duration,

    /// Total changed-line ceiling; 0 disables the check.
    pub max_changed_lines: usize,
    /// Changed-file ceiling (strictly greater fails).
    pub max_files_changed: usize,
    /// Max repetitions of one nonblank added line before rejection.
    pub duplicate_line_threshold: usize,
    /// `removed > ratio * added` (with removed > 50) rejects the patch.
    pub catastrophic_deletion_ratio: usize,

    /// Wall-clock bound for `git clone`.
    pub clone_timeout: Duration,
    /// Wall-clock bound for `git checkout` and other quick git calls.
    pub git_timeout: Duration,
    /// Wall-clock bound for one python compile check.
    pub compile_timeout: Duration,
}

fn u32_from_env(var: &str, default: u32) -> u32 {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn usize_from_env(var: &str, default: usize) -> usize {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_attempts: u32_from_env("SWE_MAX_ATTEMPTS", 3).max(1),
            step_limit: u32_from_env("SWE_STEP_LIMIT", 30).max(1),
            cost_limit: 0.0,
            loop_policy: std::env::var("SWE_LOOP_POLICY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(LoopPolicy::Strict),
            max_fix_iterations: u32_from_env("SWE_MAX_FIX_ITERATIONS", 0),
            max_compile_fix_iterations: u32_from_env("SWE_MAX_COMPILE_FIX_ITERATIONS", 2),
            patch_compile_gate: std::env::var("SWE_PATCH_COMPILE_GATE")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("off"))
                .unwrap_or(true),
            search_streak_limit: u32_from_env("SWE_SEARCH_STREAK_LIMIT", 8),
            no_diff_streak_limit: u32_from_env("SWE_NO_DIFF_STREAK_LIMIT", 8),
            repeated_fail_limit: u32_from_env("SWE_REPEATED_FAIL_LIMIT", 3),
            sed_fail_limit: u32_from_env("SWE_SED_FAIL_LIMIT", 2),
            p2p_smoke_count: usize_from_env("SWE_P2P_SMOKE_COUNT", 10),
            pytest_timeout: Duration::from_secs(u32_from_env("SWE_PYTEST_TIMEOUT", 180) as u64),
            max_changed_lines: usize_from_env("SWE_MAX_CHANGED_LINES", 200),
            max_files_changed: usize_from_env("SWE_MAX_FILES_CHANGED", 3),
            duplicate_line_threshold: usize_from_env("SWE_DUPLICATE_LINE_THRESHOLD", 4),
            catastrophic_deletion_ratio: usize_from_env("SWE_CATASTROPHIC_DELETION_RATIO", 5),
            clone_timeout: Duration::from_secs(300),
            git_timeout: Duration::from_secs(30),
            compile_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        std::env::remove_var("SWE_MAX_ATTEMPTS");
        std::env::remove_var("SWE_LOOP_POLICY");
        let config = RunConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.step_limit, 30);
        assert_eq!(config.loop_policy, LoopPolicy::Strict);
        assert_eq!(config.max_fix_iterations, 0);
        assert_eq!(config.max_compile_fix_iterations, 2);
        assert!(config.patch_compile_gate);
        assert_eq!(config.p2p_smoke_count, 10);
        assert_eq!(config.max_changed_lines, 200);
        assert_eq!(config.max_files_changed, 3);
    }

    #[test]
    fn test_loop_policy_parse() {
        assert_eq!("off".parse::<LoopPolicy>().unwrap(), LoopPolicy::Off);
        assert_eq!("WARN".parse::<LoopPolicy>().unwrap(), LoopPolicy::Warn);
        assert_eq!(" strict ".parse::<LoopPolicy>().unwrap(), LoopPolicy::Strict);
        assert!("lenient".parse::<LoopPolicy>().is_err());
    }

    #[test]
    fn test_mode_requires_tests() {
        assert!(!EvalMode::default().requires_tests());
        assert!(EvalMode {
            tdd_mode: true,
            use_graphrag: false
        }
        .requires_tests());
        assert!(EvalMode {
            tdd_mode: false,
            use_graphrag: true
        }
        .requires_tests());
    }
}
