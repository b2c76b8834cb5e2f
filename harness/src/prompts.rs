//! Task text construction
//!
//! The task text is the `{{task}}` value the backend renders into its
//! instance template. Repair rounds and retries reshape it here; no
//! other state flows between rounds or attempts.

use crate::gate::CompileGateReport;
use crate::graphrag::FailedImpactedTest;
use crate::report::AttemptSummary;
use crate::testgate::TestMetrics;

/// At most this many failing files / tests are named in repair prompts.
const REPAIR_LIST_LIMIT: usize = 10;

/// Base task: problem statement plus optional hints.
pub fn format_task(problem_statement: &str, hints_text: &str) -> String {
    let mut task = problem_statement.to_string();
    if !hints_text.is_empty() {
        task.push_str(&format!("\n\n## Hints\n\n{hints_text}"));
    }
    task
}

/// Task for attempt `attempt_idx`, with retry guidance from the prior
/// attempt's recorded reasons. Text-level only: nothing else crosses
/// the attempt boundary.
pub fn format_retry_task(
    problem_statement: &str,
    hints_text: &str,
    attempt_idx: u32,
    max_attempts: u32,
    prev: Option<&AttemptSummary>,
) -> String {
    let mut task = format_task(problem_statement, hints_text);
    if attempt_idx <= 1 {
        return task;
    }

    task.push_str("\n\n## Retry Guidance\n");
    task.push_str(&format!(
        "Retry attempt {attempt_idx}/{max_attempts}. Use a different edit strategy than before.\n"
    ));
    task.push_str("Keep commands short and avoid repeating previously failing command patterns.\n");

    let Some(prev) = prev else {
        return task;
    };

    if !prev.patch_gate_reason.is_empty() {
        task.push_str(&format!(
            "Previous patch gate result: {}.\n",
            prev.patch_gate_reason
        ));
    }
    if !prev.loop_abort_reason.is_empty() {
        task.push_str(&format!(
            "Previous loop abort: {}. Change approach immediately.\n",
            prev.loop_abort_reason
        ));
    }
    if prev.patch_gate_reason.contains("syntax_compile_failed") {
        task.push_str(
            "If syntax failed, first fix the reported failing file(s), then run py_compile before submit.\n",
        );
    }

    task
}

/// Compile-repair round: name the failing files and their errors.
pub fn format_compile_failure_task(
    problem_statement: &str,
    hints_text: &str,
    compile_gate: &CompileGateReport,
) -> String {
    let mut task = format_task(problem_statement, hints_text);
    task.push_str(
        "\n\n## Compile Repair Round\n\n\
         Your previous patch failed Python syntax compile checks.\n\
         Fix the compile errors first, with minimal targeted edits, then submit again.\n",
    );

    if !compile_gate.compile_failed_files.is_empty() {
        task.push_str("\nFailing files:\n");
        for file in compile_gate.compile_failed_files.iter().take(REPAIR_LIST_LIMIT) {
            let error = compile_gate
                .details
                .iter()
                .find(|d| &d.file == file)
                .map(|d| d.current_error.as_str())
                .unwrap_or("unknown");
            task.push_str(&format!("- {file}: {error}\n"));
        }
    }

    task.push_str(
        "\nRequirements:\n\
         1. Do not add placeholders.\n\
         2. Keep public signatures stable.\n\
         3. Make only minimal edits needed to restore compilable Python syntax.\n\
         4. First, edit one failing file directly; do not spend steps on broad repo searches.\n\
         5. Before submitting, run `python3 -m py_compile <failing_file.py>` for the changed failing files.\n",
    );
    task
}

/// Test-repair round: report the FAIL_TO_PASS shortfall.
pub fn format_test_failure_task(
    problem_statement: &str,
    hints_text: &str,
    metrics: &TestMetrics,
) -> String {
    let mut task = format_task(problem_statement, hints_text);
    task.push_str(&format!(
        "\n\n## Repair Round\n\n\
         Your previous patch did not pass the required target tests.\n\
         - FAIL_TO_PASS passed: {}/{}\n\
         Produce a minimal correction patch and re-verify before submission.\n\
         If an edit command fails repeatedly, switch to a different editing method immediately.\n",
        metrics.f2p_passed.unwrap_or(0),
        metrics.f2p_total
    ));
    task
}

/// GraphRAG-repair round: name the failing impacted tests.
pub fn format_graphrag_failure_task(
    problem_statement: &str,
    hints_text: &str,
    failed_tests: &[FailedImpactedTest],
) -> String {
    let mut task = format_task(problem_statement, hints_text);
    task.push_str(
        "\n\n## GraphRAG Impacted Test Failures\n\
         The following impacted tests are failing. Fix regressions with minimal code edits.\n",
    );
    for test in failed_tests.iter().take(REPAIR_LIST_LIMIT) {
        let name = test
            .full_name
            .as_deref()
            .unwrap_or(test.test_name.as_str());
        let error = test.error.as_deref().unwrap_or("");
        let error_excerpt: String = error.chars().take(200).collect();
        task.push_str(&format!("- {name}: {error_excerpt}\n"));
    }
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::CompileCheck;

    #[test]
    fn test_first_attempt_has_no_guidance() {
        let task = format_retry_task("Fix the bug", "", 1, 3, None);
        assert_eq!(task, "Fix the bug");
    }

    #[test]
    fn test_hints_appended() {
        let task = format_task("Fix the bug", "check div()");
        assert!(task.contains("## Hints"));
        assert!(task.contains("check div()"));
    }

    #[test]
    fn test_retry_guidance_carries_prior_reasons() {
        let prev = AttemptSummary {
            attempt: 1,
            status: "LoopAborted".to_string(),
            patch_chars: 0,
            steps: 12,
            loop_abort_reason: "search_only_streak:8".to_string(),
            f2p_pass_rate: None,
            p2p_smoke_failures: None,
            clean_resolution: None,
            patch_gate_valid: false,
            patch_gate_reason: "empty_diff".to_string(),
            patch_gate_severity: "fail".to_string(),
            compile_fix_rounds: 0,
            error: None,
        };
        let task = format_retry_task("Fix the bug", "", 2, 3, Some(&prev));
        assert!(task.contains("Retry attempt 2/3"));
        assert!(task.contains("empty_diff"));
        assert!(task.contains("search_only_streak:8"));
    }

    #[test]
    fn test_syntax_failure_gets_py_compile_hint() {
        let prev = AttemptSummary {
            attempt: 1,
            status: "Submitted".to_string(),
            patch_chars: 0,
            steps: 8,
            loop_abort_reason: String::new(),
            f2p_pass_rate: None,
            p2p_smoke_failures: None,
            clean_resolution: None,
            patch_gate_valid: false,
            patch_gate_reason: "syntax_compile_failed:x/y.py".to_string(),
            patch_gate_severity: "fail".to_string(),
            compile_fix_rounds: 2,
            error: None,
        };
        let task = format_retry_task("Fix the bug", "", 3, 3, Some(&prev));
        assert!(task.contains("py_compile"));
    }

    #[test]
    fn test_compile_failure_task_names_files() {
        let report = CompileGateReport {
            enabled: true,
            compile_failed: 1,
            compile_failed_files: vec!["pkg/mod.py".to_string()],
            details: vec![CompileCheck {
                file: "pkg/mod.py".to_string(),
                current_error: "SyntaxError:invalid syntax@12:5".to_string(),
                baseline_error: "ok".to_string(),
            }],
            ..CompileGateReport::default()
        };
        let task = format_compile_failure_task("Fix the bug", "", &report);
        assert!(task.contains("Compile Repair Round"));
        assert!(task.contains("pkg/mod.py: SyntaxError:invalid syntax@12:5"));
    }

    #[test]
    fn test_test_failure_task_reports_shortfall() {
        let mut metrics = TestMetrics::skeleton(4);
        metrics.f2p_passed = Some(1);
        let task = format_test_failure_task("Fix the bug", "", &metrics);
        assert!(task.contains("FAIL_TO_PASS passed: 1/4"));
    }
}
