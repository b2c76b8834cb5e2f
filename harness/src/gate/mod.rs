//! Patch quality gate
//!
//! Decides whether a diff is structurally and syntactically fit to
//! submit. Structural rules run first over the raw diff text; the
//! python compile gate runs after, against the working tree. A `fail`
//! decision zeroes the candidate's prediction upstream; that is
//! normal control flow, not an error.

pub mod compile;

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
pub use compile::{CompileCheck, CompileGateReport};

/// Markers that flag an added line as unfinished work.
const PLACEHOLDER_MARKERS: [&str; 4] = ["TODO", "FIXME", "Placeholder", "NotImplementedError"];

/// Removed-line floor below which the deletion-ratio rule never fires.
const DELETION_RATIO_FLOOR: usize = 50;

static DEF_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)\s*:").unwrap()
});

/// Decision severity, ordered info < warn < fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Fail,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// Measured properties of the diff, reported alongside the decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateMetrics {
    pub files_changed: usize,
    pub added_lines: usize,
    pub removed_lines: usize,
    pub changed_lines_total: usize,
    pub changed_lines_limit: usize,
    pub duplicate_line_max: usize,
    pub signature_change_detected: bool,
    pub python_files_changed: usize,
    pub compile_checked: usize,
    pub compile_failed: usize,
    pub compile_preexisting: usize,
}

/// Aggregate accept/warn/reject verdict over one diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityDecision {
    pub valid: bool,
    pub severity: Severity,
    /// Comma-joined reason tags, `"ok"` when clean.
    pub reason: String,
    pub fail_reasons: Vec<String>,
    pub warn_reasons: Vec<String>,
    pub metrics: GateMetrics,
    pub compile_gate: CompileGateReport,
    /// The evaluated diff; not serialized (the prediction carries it).
    #[serde(skip)]
    pub diff: String,
}

impl QualityDecision {
    /// The diff to submit: empty when the gate rejected.
    pub fn accepted_diff(&self) -> &str {
        if self.valid {
            &self.diff
        } else {
            ""
        }
    }

    /// Whether any fail reason carries the given tag prefix.
    pub fn has_fail_tag(&self, tag: &str) -> bool {
        self.fail_reasons.iter().any(|r| r.starts_with(tag))
    }
}

/// Structural + syntactic patch validation.
#[derive(Debug, Clone)]
pub struct QualityGate {
    max_files_changed: usize,
    max_changed_lines: usize,
    duplicate_line_threshold: usize,
    catastrophic_deletion_ratio: usize,
    compile_gate_enabled: bool,
    compile_timeout: Duration,
}

impl QualityGate {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            max_files_changed: config.max_files_changed,
            max_changed_lines: config.max_changed_lines,
            duplicate_line_threshold: config.duplicate_line_threshold,
            catastrophic_deletion_ratio: config.catastrophic_deletion_ratio,
            compile_gate_enabled: config.patch_compile_gate,
            compile_timeout: config.compile_timeout,
        }
    }

    /// Evaluate a diff. `changed_py_files` are the differ's changed
    /// `.py` paths, consumed by the compile gate.
    pub async fn evaluate(
        &self,
        workspace: &Path,
        diff: &str,
        changed_py_files: &[String],
    ) -> QualityDecision {
        let (mut fail_reasons, mut warn_reasons, mut metrics) = self.structural(diff);

        let compile_gate = if self.compile_gate_enabled {
            let report =
                compile::check_compile_gate(workspace, changed_py_files, self.compile_timeout)
                    .await;
            if !report.compile_failed_files.is_empty() {
                fail_reasons.push(format!(
                    "syntax_compile_failed:{}",
                    report.compile_failed_files.join("|")
                ));
            }
            if report.compile_skipped_preexisting > 0 {
                warn_reasons.push(format!(
                    "compile_preexisting_failures:{}",
                    report.compile_skipped_preexisting
                ));
            }
            report
        } else {
            CompileGateReport::default()
        };

        metrics.python_files_changed = compile_gate.python_files_changed;
        metrics.compile_checked = compile_gate.compile_checked;
        metrics.compile_failed = compile_gate.compile_failed;
        metrics.compile_preexisting = compile_gate.compile_skipped_preexisting;

        let (valid, severity, reason) = if !fail_reasons.is_empty() {
            (false, Severity::Fail, fail_reasons.join(","))
        } else if !warn_reasons.is_empty() {
            (true, Severity::Warn, warn_reasons.join(","))
        } else {
            (true, Severity::Info, "ok".to_string())
        };

        QualityDecision {
            valid,
            severity,
            reason,
            fail_reasons,
            warn_reasons,
            metrics,
            compile_gate,
            diff: diff.to_string(),
        }
    }

    /// Structural rules over the raw diff text. Pure; no subprocesses.
    fn structural(&self, diff: &str) -> (Vec<String>, Vec<String>, GateMetrics) {
        let mut fail_reasons = Vec::new();
        let mut warn_reasons = Vec::new();

        if diff.trim().is_empty() {
            fail_reasons.push("empty_diff".to_string());
        }

        let files_changed = diff
            .lines()
            .filter(|l| l.starts_with("diff --git "))
            .count();
        if files_changed > self.max_files_changed {
            fail_reasons.push(format!("too_many_files:{files_changed}"));
        }

        let added_lines: Vec<&str> = diff
            .lines()
            .filter(|l| l.starts_with('+') && !l.starts_with("+++"))
            .map(|l| &l[1..])
            .collect();
        let removed_count = diff
            .lines()
            .filter(|l| l.starts_with('-') && !l.starts_with("---") && l.len() > 1)
            .count();
        let added_count = added_lines.len();
        let changed_total = added_count + removed_count;

        if self.max_changed_lines > 0 && changed_total > self.max_changed_lines {
            fail_reasons.push(format!(
                "too_many_changed_lines:{changed_total}_limit_{}",
                self.max_changed_lines
            ));
        }

        if removed_count > DELETION_RATIO_FLOOR
            && added_count > 0
            && removed_count > self.catastrophic_deletion_ratio * added_count
        {
            fail_reasons.push(format!(
                "catastrophic_deletion:{removed_count}_removed_vs_{added_count}_added"
            ));
        }

        let mut repeats: HashMap<&str, usize> = HashMap::new();
        for line in &added_lines {
            let normalized = line.trim();
            if !normalized.is_empty() {
                *repeats.entry(normalized).or_insert(0) += 1;
            }
        }
        let duplicate_line_max = repeats.values().copied().max().unwrap_or(0);
        if duplicate_line_max >= self.duplicate_line_threshold {
            fail_reasons.push(format!("repetitive_code:max_repeat={duplicate_line_max}"));
        }

        if added_lines
            .iter()
            .any(|l| PLACEHOLDER_MARKERS.iter().any(|m| l.contains(m)))
        {
            fail_reasons.push("placeholder_code".to_string());
        }

        let signature_change_detected = detect_signature_change(diff);
        if signature_change_detected {
            warn_reasons.push("potential_signature_change".to_string());
        }

        let metrics = GateMetrics {
            files_changed,
            added_lines: added_count,
            removed_lines: removed_count,
            changed_lines_total: changed_total,
            changed_lines_limit: self.max_changed_lines,
            duplicate_line_max,
            signature_change_detected,
            ..GateMetrics::default()
        };

        (fail_reasons, warn_reasons, metrics)
    }
}

/// Compare `def name(params):` headers across removed and added lines.
///
/// A warning (never a failure): the agent may legitimately change a
/// signature, but the reviewer round should know it happened. Fires
/// when a kept def's parameter shape changed, or when defs vanish or
/// appear one-sidedly.
fn detect_signature_change(diff: &str) -> bool {
    let mut removed: HashMap<String, Vec<String>> = HashMap::new();
    let mut removed_any = false;
    let mut added_any = false;

    for line in diff.lines() {
        let (is_removed, rest) = if let Some(rest) = line.strip_prefix('-') {
            if line.starts_with("---") {
                continue;
            }
            (true, rest)
        } else if let Some(rest) = line.strip_prefix('+') {
            if line.starts_with("+++") {
                continue;
            }
            (false, rest)
        } else {
            continue;
        };
        let Some(caps) = DEF_HEADER_RE.captures(rest) else {
            continue;
        };
        let name = caps[1].to_string();
        let params: String = caps[2].split_whitespace().collect();
        if is_removed {
            removed_any = true;
            removed.entry(name).or_default().push(params);
        } else {
            added_any = true;
            if let Some(previous) = removed.get(&name) {
                if !previous.contains(&params) {
                    return true;
                }
            }
        }
    }

    // One-sided def churn: a def deleted with no replacement, or a new
    // def with no removal, also counts as a shape change.
    removed_any != added_any && (removed_any || added_any)
}
