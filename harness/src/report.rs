//! Candidates, attempt summaries, and predictions
//!
//! The Candidate is the full record of one attempt; the Prediction is
//! the serializable per-instance record handed to downstream scoring.
//! Candidate scoring is a pure function of the record.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::gate::QualityDecision;
use crate::graphrag::GraphRagSummary;
use crate::testgate::TestMetrics;

/// Everything one attempt produced.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub attempt: u32,
    /// Final unified diff; empty when the gate rejected.
    pub prediction: String,
    pub status: String,
    pub message: String,
    pub steps: u32,
    pub cost: f64,
    pub elapsed: f64,
    pub format_errors: u32,
    pub timeouts: u32,
    pub loop_abort_reason: String,
    pub compile_fix_rounds: u32,
    pub quality: QualityDecision,
    pub tests: TestMetrics,
    pub graphrag: GraphRagSummary,
}

/// Condensed view of one attempt, carried in the Prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub attempt: u32,
    pub status: String,
    pub patch_chars: usize,
    pub steps: u32,
    pub loop_abort_reason: String,
    pub f2p_pass_rate: Option<f64>,
    pub p2p_smoke_failures: Option<usize>,
    pub clean_resolution: Option<bool>,
    pub patch_gate_valid: bool,
    pub patch_gate_reason: String,
    pub patch_gate_severity: String,
    pub compile_fix_rounds: u32,
    /// Set when the attempt itself failed before producing a candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AttemptSummary {
    pub fn from_candidate(c: &Candidate) -> Self {
        Self {
            attempt: c.attempt,
            status: c.status.clone(),
            patch_chars: c.prediction.len(),
            steps: c.steps,
            loop_abort_reason: c.loop_abort_reason.clone(),
            f2p_pass_rate: c.tests.f2p_pass_rate,
            p2p_smoke_failures: c.tests.p2p_smoke_failures,
            clean_resolution: c.tests.clean_resolution,
            patch_gate_valid: c.quality.valid,
            patch_gate_reason: c.quality.reason.clone(),
            patch_gate_severity: c.quality.severity.to_string(),
            compile_fix_rounds: c.compile_fix_rounds,
            error: None,
        }
    }

    /// Summary for an attempt that threw before emitting a candidate.
    pub fn from_error(attempt: u32, error: &str) -> Self {
        Self {
            attempt,
            status: "error".to_string(),
            patch_chars: 0,
            steps: 0,
            loop_abort_reason: String::new(),
            f2p_pass_rate: None,
            p2p_smoke_failures: None,
            clean_resolution: None,
            patch_gate_valid: false,
            patch_gate_reason: String::new(),
            patch_gate_severity: String::new(),
            compile_fix_rounds: 0,
            error: Some(error.to_string()),
        }
    }
}

/// Per-instance record emitted for downstream scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub instance_id: String,
    pub prediction: String,
    pub status: String,
    pub message: String,
    pub steps: u32,
    pub cost: f64,
    pub elapsed: f64,
    pub format_errors: u32,
    pub timeouts: u32,
    pub attempts_used: usize,
    pub loop_abort_reason: String,
    pub f2p_pass_rate: Option<f64>,
    pub p2p_smoke_failures: Option<usize>,
    pub clean_resolution: Option<bool>,
    pub patch_gate_valid: bool,
    pub patch_gate_reason: String,
    pub patch_gate_severity: String,
    pub compile_fix_rounds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempt_summaries: Vec<AttemptSummary>,
    pub graphrag: GraphRagSummary,
}

impl Prediction {
    pub fn from_best(
        instance_id: &str,
        best: &Candidate,
        attempt_summaries: Vec<AttemptSummary>,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            prediction: best.prediction.clone(),
            status: best.status.clone(),
            message: best.message.clone(),
            steps: best.steps,
            cost: best.cost,
            elapsed: best.elapsed,
            format_errors: best.format_errors,
            timeouts: best.timeouts,
            attempts_used: attempt_summaries.len(),
            loop_abort_reason: best.loop_abort_reason.clone(),
            f2p_pass_rate: best.tests.f2p_pass_rate,
            p2p_smoke_failures: best.tests.p2p_smoke_failures,
            clean_resolution: best.tests.clean_resolution,
            patch_gate_valid: best.quality.valid,
            patch_gate_reason: best.quality.reason.clone(),
            patch_gate_severity: best.quality.severity.to_string(),
            compile_fix_rounds: best.compile_fix_rounds,
            error: None,
            attempt_summaries,
            graphrag: best.graphrag.clone(),
        }
    }

    /// Degenerate record for an instance where no attempt completed.
    pub fn no_attempt_completed(
        instance_id: &str,
        attempt_summaries: Vec<AttemptSummary>,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            prediction: String::new(),
            status: "error".to_string(),
            message: String::new(),
            steps: 0,
            cost: 0.0,
            elapsed: 0.0,
            format_errors: 0,
            timeouts: 0,
            attempts_used: attempt_summaries.len(),
            loop_abort_reason: String::new(),
            f2p_pass_rate: None,
            p2p_smoke_failures: None,
            clean_resolution: None,
            patch_gate_valid: false,
            patch_gate_reason: "no_attempt_completed".to_string(),
            patch_gate_severity: "fail".to_string(),
            compile_fix_rounds: 0,
            error: Some("no successful attempt".to_string()),
            attempt_summaries,
            graphrag: GraphRagSummary::default(),
        }
    }
}

/// Lexicographic candidate score, higher wins.
///
/// Order: non-empty patch, F2P pass rate (nulls as 0), fewer smoke
/// failures, no loop abort, smaller patch as the final tiebreak.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateScore {
    non_empty: u8,
    f2p_rate: f64,
    p2p_penalty: i64,
    loop_penalty: i64,
    patch_chars: i64,
}

impl CandidateScore {
    pub fn of(candidate: &Candidate) -> Self {
        Self {
            non_empty: u8::from(!candidate.prediction.is_empty()),
            f2p_rate: candidate.tests.f2p_pass_rate.unwrap_or(0.0),
            p2p_penalty: -(candidate.tests.p2p_smoke_failures.unwrap_or(0) as i64),
            loop_penalty: -i64::from(!candidate.loop_abort_reason.is_empty()),
            patch_chars: -(candidate.prediction.len() as i64),
        }
    }
}

impl Eq for CandidateScore {}

impl PartialOrd for CandidateScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CandidateScore {
    fn cmp(&self, other: &Self) -> Ordering {
        self.non_empty
            .cmp(&other.non_empty)
            .then(self.f2p_rate.total_cmp(&other.f2p_rate))
            .then(self.p2p_penalty.cmp(&other.p2p_penalty))
            .then(self.loop_penalty.cmp(&other.loop_penalty))
            .then(self.patch_chars.cmp(&other.patch_chars))
    }
}
