//! Instance orchestrator
//!
//! Runs up to `max_attempts` attempt controllers in strict sequence,
//! keeps the best candidate under the lexicographic score, and stops
//! early on a clean (or compile-valid submitted) candidate. An
//! instance where every attempt failed still yields a prediction: a
//! degenerate record with the failure trail in its summaries.

use tracing::{error, info};

use crate::attempt::run_attempt;
use crate::config::{EvalMode, RunConfig};
use crate::dataset::Task;
use crate::driver::BackendFactory;
use crate::graphrag::GraphRagSession;
use crate::instance_log::InstanceLog;
use crate::report::{AttemptSummary, Candidate, CandidateScore, Prediction};

/// Whether this candidate ends the attempt loop immediately.
fn early_stop(candidate: &Candidate) -> Option<&'static str> {
    if candidate.tests.clean_resolution == Some(true) && !candidate.prediction.is_empty() {
        return Some("clean candidate found");
    }
    let compile_valid_submitted = candidate.status == "Submitted"
        && !candidate.prediction.is_empty()
        && candidate.quality.valid
        && !candidate.quality.reason.contains("syntax_compile_failed");
    if compile_valid_submitted {
        return Some("compile-valid submitted patch found");
    }
    None
}

/// Evaluate one instance end to end.
pub async fn run_instance(
    config: &RunConfig,
    mode: EvalMode,
    factory: &dyn BackendFactory,
    graphrag: Option<&GraphRagSession>,
    task: &Task,
    log: &InstanceLog,
) -> Prediction {
    let mut summaries: Vec<AttemptSummary> = Vec::new();
    let mut best: Option<(CandidateScore, Candidate)> = None;

    for attempt_idx in 1..=config.max_attempts {
        let prev = summaries.last();
        match run_attempt(
            config,
            mode,
            factory,
            task,
            attempt_idx,
            prev,
            graphrag,
            log,
        )
        .await
        {
            Ok(candidate) => {
                summaries.push(AttemptSummary::from_candidate(&candidate));
                let stop = early_stop(&candidate);

                let score = CandidateScore::of(&candidate);
                let improved = best
                    .as_ref()
                    .map(|(best_score, _)| score > *best_score)
                    .unwrap_or(true);
                if improved {
                    log.log(attempt_idx, "New best candidate selected");
                    best = Some((score, candidate));
                }

                if let Some(reason) = stop {
                    log.log(attempt_idx, format!("Early stop: {reason}."));
                    break;
                }
            }
            Err(e) => {
                error!(
                    instance = %task.instance_id,
                    attempt = attempt_idx,
                    "attempt failed: {e}"
                );
                log.log(attempt_idx, format!("EXCEPTION: {e}"));
                summaries.push(AttemptSummary::from_error(attempt_idx, &e.to_string()));
            }
        }
    }

    match best {
        Some((_, candidate)) => {
            info!(
                instance = %task.instance_id,
                attempts_used = summaries.len(),
                best_attempt = candidate.attempt,
                patch_chars = candidate.prediction.len(),
                "instance complete"
            );
            Prediction::from_best(&task.instance_id, &candidate, summaries)
        }
        None => {
            error!(instance = %task.instance_id, "no attempt completed");
            log.log(0, "No successful attempt; emitting degenerate prediction");
            Prediction::no_attempt_completed(&task.instance_id, summaries)
        }
    }
}
