//! Attempt controller
//!
//! One end-to-end attempt: acquire a workspace, drive the agent, gate
//! the patch, run targeted tests, and loop through bounded repair
//! rounds before emitting a Candidate. The workspace dies with the
//! attempt on every exit path.

use tracing::{info, warn};

use crate::config::{EvalMode, RunConfig};
use crate::dataset::Task;
use crate::differ::PatchDiffer;
use crate::driver::{AgentDriver, BackendFactory, DriverReport};
use crate::error::{EvalError, EvalResult};
use crate::gate::QualityGate;
use crate::graphrag::{GraphRagSession, GraphRagSummary};
use crate::instance_log::InstanceLog;
use crate::prompts;
use crate::report::{AttemptSummary, Candidate};
use crate::testgate::TestGate;
use crate::workspace::RepoWorkspace;

/// Impact threshold for the GraphRAG impacted-test run.
const IMPACT_THRESHOLD: f64 = 0.3;

/// Cap on impacted tests executed per repair round.
const IMPACT_MAX_TESTS: u64 = 50;

/// Run one attempt and emit a Candidate.
///
/// Errors reaching the caller mean no candidate exists for this
/// attempt (setup failure, diff failure, or an agent failure with no
/// partial diff worth gating); the orchestrator records them in the
/// attempt summaries and moves on.
#[allow(clippy::too_many_arguments)]
pub async fn run_attempt(
    config: &RunConfig,
    mode: EvalMode,
    factory: &dyn BackendFactory,
    task: &Task,
    attempt_idx: u32,
    prev: Option<&AttemptSummary>,
    graphrag: Option<&GraphRagSession>,
    log: &InstanceLog,
) -> EvalResult<Candidate> {
    log.log(attempt_idx, format!("=== START {} ===", task.instance_id));
    log.log(
        attempt_idx,
        format!(
            "Repo: {}  Commit: {}",
            task.repo,
            &task.base_commit[..task.base_commit.len().min(8)]
        ),
    );

    let workspace = RepoWorkspace::acquire(&task.repo, &task.base_commit, config).await?;
    log.log(
        attempt_idx,
        format!("Repo cloned to: {}", workspace.path().display()),
    );

    let mut graph_meta = GraphRagSummary::default();
    if let Some(session) = graphrag {
        log.log(attempt_idx, "Building GraphRAG index...");
        match session
            .build_graph(&task.repo, &task.base_commit, workspace.path())
            .await
        {
            Ok(built) => {
                graph_meta.graph_built = built.success;
                graph_meta.graph_nodes = built.nodes_created;
                graph_meta.graph_rels = built.relationships_created;
                log.log(
                    attempt_idx,
                    format!(
                        "GraphRAG build success={} nodes={} rels={}",
                        built.success, built.nodes_created, built.relationships_created
                    ),
                );
            }
            Err(e) => {
                // Graph trouble never fails the attempt.
                warn!(instance = %task.instance_id, "graphrag build failed: {e}");
                log.log(attempt_idx, format!("GraphRAG build failed: {e}"));
            }
        }
    }

    let mut task_text = prompts::format_retry_task(
        &task.problem_statement,
        &task.hints_text,
        attempt_idx,
        config.max_attempts,
        prev,
    );

    let differ = PatchDiffer::new(config.git_timeout);
    let gate = QualityGate::from_config(config);
    let test_gate = TestGate::from_config(config);

    let mut fix_round: u32 = 0;
    let max_fix_rounds = if mode.requires_tests() {
        config.max_fix_iterations
    } else {
        0
    };
    let mut compile_fix_round: u32 = 0;
    let max_compile_fix_rounds = if config.patch_compile_gate {
        config.max_compile_fix_iterations
    } else {
        0
    };

    let (report, decision, metrics) = loop {
        let mut backend = factory.create(workspace.path()).await?;
        let mut driver = AgentDriver::new(config, workspace.path()).await;

        let report = match driver.run(backend.as_mut(), &task_text).await {
            Ok(report) => report,
            Err(e) => {
                // A fatal agent error still gates whatever diff exists;
                // with a clean tree there is nothing to salvage.
                let diff = differ.diff(workspace.path()).await.unwrap_or_default();
                if diff.trim().is_empty() {
                    return Err(e);
                }
                log.log(
                    attempt_idx,
                    format!("Agent failed with partial diff on disk: {e}"),
                );
                DriverReport {
                    status: "error".to_string(),
                    message: e.to_string(),
                    steps: backend.n_calls(),
                    cost: backend.cost(),
                    elapsed: 0.0,
                    format_errors: 0,
                    timeouts: 0,
                    loop_abort_reason: String::new(),
                }
            }
        };
        log.log(
            attempt_idx,
            format!(
                "Agent finished: status={}  steps={}  format_errors={}  timeouts={}",
                report.status, report.steps, report.format_errors, report.timeouts
            ),
        );
        if !report.loop_abort_reason.is_empty() {
            log.log(
                attempt_idx,
                format!("Loop abort reason: {}", report.loop_abort_reason),
            );
        }

        let diff = differ.diff(workspace.path()).await?;
        let changed_py = differ.changed_files(workspace.path()).await?;
        let decision = gate.evaluate(workspace.path(), &diff, &changed_py).await;
        log.log(
            attempt_idx,
            format!(
                "PATCH_GATE_RESULT valid={} severity={} reason={}",
                decision.valid, decision.severity, decision.reason
            ),
        );
        if decision.compile_gate.enabled {
            log.log(
                attempt_idx,
                format!(
                    "PATCH_GATE_COMPILE checked={} failed={} preexisting={} failed_files={:?}",
                    decision.compile_gate.compile_checked,
                    decision.compile_gate.compile_failed,
                    decision.compile_gate.compile_skipped_preexisting,
                    decision.compile_gate.compile_failed_files
                ),
            );
        }

        if decision.compile_gate.compile_failed > 0 {
            if compile_fix_round < max_compile_fix_rounds {
                compile_fix_round += 1;
                task_text = prompts::format_compile_failure_task(
                    &task.problem_statement,
                    &task.hints_text,
                    &decision.compile_gate,
                );
                log.log(
                    attempt_idx,
                    format!(
                        "Continuing with compile-repair round {compile_fix_round}/{max_compile_fix_rounds}"
                    ),
                );
                continue;
            }
            log.log(
                attempt_idx,
                format!(
                    "Compile-repair rounds exhausted ({compile_fix_round}/{max_compile_fix_rounds})"
                ),
            );
        }

        let metrics = test_gate
            .evaluate(
                workspace.path(),
                &task.fail_to_pass,
                &task.pass_to_pass,
                mode.requires_tests(),
            )
            .await;
        if let (Some(passed), Some(failed)) = (metrics.f2p_passed, metrics.f2p_failed) {
            log.log(
                attempt_idx,
                format!(
                    "F2P check: passed={passed} failed={failed} total={}",
                    metrics.f2p_total
                ),
            );
        }
        if let Some(failures) = metrics.p2p_smoke_failures {
            log.log(
                attempt_idx,
                format!(
                    "P2P smoke: failed={failures} total={}",
                    metrics.p2p_smoke_total.unwrap_or(0)
                ),
            );
        }

        // Exactly one repair path per round: the impacted-test check
        // (when GraphRAG owns the patch) or the F2P shortfall check.
        // A round that triggers neither exits the loop.
        if mode.use_graphrag && !decision.accepted_diff().is_empty() {
            if let Some(session) = graphrag {
                let changed = differ.changed_files(workspace.path()).await?;
                if !changed.is_empty() {
                    match session
                        .run_impacted_tests(
                            workspace.path(),
                            &changed,
                            IMPACT_THRESHOLD,
                            IMPACT_MAX_TESTS,
                        )
                        .await
                    {
                        Ok(impacted) => {
                            graph_meta.impacted_total = impacted.total_impacted;
                            graph_meta.impacted_run = impacted.tests_run;
                            graph_meta.impacted_failed = impacted.failed;
                            graph_meta.impacted_failed_tests = impacted.failed_tests.clone();
                            log.log(
                                attempt_idx,
                                format!(
                                    "GraphRAG iterative tests: run={} failed={}",
                                    impacted.tests_run, impacted.failed
                                ),
                            );
                            if impacted.failed > 0 && fix_round < max_fix_rounds {
                                fix_round += 1;
                                task_text = prompts::format_graphrag_failure_task(
                                    &task.problem_statement,
                                    &task.hints_text,
                                    &impacted.failed_tests,
                                );
                                log.log(
                                    attempt_idx,
                                    format!(
                                        "Continuing with GraphRAG repair round {fix_round}/{max_fix_rounds}"
                                    ),
                                );
                                continue;
                            }
                        }
                        Err(e) => {
                            log.log(attempt_idx, format!("GraphRAG impacted test loop failed: {e}"));
                        }
                    }
                }
            }
        } else if mode.requires_tests()
            && fix_round < max_fix_rounds
            && metrics.f2p_total > 0
            && !metrics.f2p_all_passed
        {
            fix_round += 1;
            task_text = prompts::format_test_failure_task(
                &task.problem_statement,
                &task.hints_text,
                &metrics,
            );
            log.log(
                attempt_idx,
                format!("Continuing with test-fix round {fix_round}/{max_fix_rounds}"),
            );
            continue;
        }

        break (report, decision, metrics);
    };

    let prediction = decision.accepted_diff().to_string();
    log.log(attempt_idx, format!("Patch: {} chars", prediction.len()));
    info!(
        instance = %task.instance_id,
        attempt = attempt_idx,
        status = %report.status,
        patch_chars = prediction.len(),
        "attempt complete"
    );

    Ok(Candidate {
        attempt: attempt_idx,
        prediction,
        status: report.status,
        message: report.message,
        steps: report.steps,
        cost: report.cost,
        elapsed: report.elapsed,
        format_errors: report.format_errors,
        timeouts: report.timeouts,
        loop_abort_reason: report.loop_abort_reason,
        compile_fix_rounds: compile_fix_round,
        quality: decision,
        tests: metrics,
        graphrag: graph_meta,
    })
    // workspace drops here; the attempt leaves nothing behind
}

/// Guard run before any attempt: required external binaries.
pub async fn preflight(config: &RunConfig) -> EvalResult<()> {
    use crate::exec::{command, run_with_timeout};
    use std::time::Duration;

    let cwd = std::env::temp_dir();
    let git = run_with_timeout(
        &mut command("git", &["--version"], &cwd),
        Duration::from_secs(10),
    )
    .await;
    if !matches!(git, Ok(ref out) if out.success()) {
        return Err(EvalError::config("git is not available on PATH"));
    }

    if config.patch_compile_gate {
        let python = run_with_timeout(
            &mut command("python3", &["--version"], &cwd),
            Duration::from_secs(10),
        )
        .await;
        if !matches!(python, Ok(ref out) if out.success()) {
            return Err(EvalError::config(
                "python3 is required for the patch compile gate (or disable it with --patch-compile-gate off)",
            ));
        }
    }

    Ok(())
}
