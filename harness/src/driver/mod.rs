//! Agent driver
//!
//! Wraps one agent run. The backend is a polymorphic collaborator that
//! emits every transcript message to an observer before appending it;
//! the driver's observer runs the loop-detection state machine and
//! answers with a typed directive (warnings to inject, or an abort).
//! No method rebinding, no exceptions as control flow: an abort is a
//! value the backend upgrades to its terminal transition.

pub mod loop_detect;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{LoopPolicy, RunConfig};
use crate::differ::PatchDiffer;
use crate::error::{EvalError, EvalResult};
pub use loop_detect::{Directive, LoopDetector, LoopLimits};

/// Fixed backoff between transient-error retries.
const TRANSIENT_BACKOFF: Duration = Duration::from_secs(30);

/// Transient-error retries before collapsing to a fatal error.
const MAX_TRANSIENT_RETRIES: u32 = 2;

/// Transcript roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Observer the backend must consult before appending any message.
///
/// For user observations the returned directive's warnings are
/// prepended to the content (each as its own line); when `abort` is
/// set the backend appends the observation and terminates the run with
/// status `"LoopAborted"` and the reason as its message.
#[async_trait]
pub trait TranscriptObserver: Send {
    async fn observe(&mut self, role: Role, content: &str) -> Directive;
}

/// Terminal result of one agent run.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// "Submitted", "LoopAborted", "LimitsExceeded", or another
    /// backend-specific terminal string (treated opaquely).
    pub status: String,
    pub message: String,
}

/// One-run agent instantiated against a workspace.
///
/// `run` may be called again after a transient failure; it must reset
/// its transcript and start the conversation over.
#[async_trait]
pub trait AgentBackend: Send {
    async fn run(
        &mut self,
        task: &str,
        observer: &mut dyn TranscriptObserver,
    ) -> EvalResult<AgentOutcome>;

    /// Model calls made so far (monotonic across retries).
    fn n_calls(&self) -> u32;

    /// Accumulated cost; 0.0 for free local backends.
    fn cost(&self) -> f64;
}

/// Creates a fresh backend per repair round.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self, workspace: &Path) -> EvalResult<Box<dyn AgentBackend>>;
}

/// What one driver run produced, loop-control state included.
#[derive(Debug, Clone)]
pub struct DriverReport {
    pub status: String,
    pub message: String,
    pub steps: u32,
    pub cost: f64,
    pub elapsed: f64,
    pub format_errors: u32,
    pub timeouts: u32,
    pub loop_abort_reason: String,
}

/// Drives one agent interaction to completion under loop control.
pub struct AgentDriver {
    policy: LoopPolicy,
    detector: LoopDetector,
    differ: PatchDiffer,
    workspace: PathBuf,
}

impl AgentDriver {
    pub async fn new(config: &RunConfig, workspace: &Path) -> Self {
        let differ = PatchDiffer::new(config.git_timeout);
        let initial_sig = differ.diff_signature(workspace).await;
        Self {
            policy: config.loop_policy,
            detector: LoopDetector::new(LoopLimits::from_config(config), initial_sig),
            differ,
            workspace: workspace.to_path_buf(),
        }
    }

    /// Run the backend, retrying transient endpoint failures with a
    /// fixed backoff. Any other failure propagates as a fatal agent
    /// error; the caller decides whether a partial diff is worth gating.
    pub async fn run(
        &mut self,
        backend: &mut dyn AgentBackend,
        task: &str,
    ) -> EvalResult<DriverReport> {
        let started = Instant::now();
        let mut retries = 0;

        let outcome = loop {
            let mut observer = DriverObserver {
                policy: self.policy,
                detector: &mut self.detector,
                differ: &self.differ,
                workspace: &self.workspace,
            };
            match backend.run(task, &mut observer).await {
                Ok(outcome) => break outcome,
                Err(e) if e.is_transient() && retries < MAX_TRANSIENT_RETRIES => {
                    retries += 1;
                    warn!(
                        retry = retries,
                        max = MAX_TRANSIENT_RETRIES,
                        "transient backend error, backing off: {e}"
                    );
                    tokio::time::sleep(TRANSIENT_BACKOFF).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(EvalError::agent(format!(
                        "transient failures exhausted after {retries} retries: {e}"
                    )));
                }
                Err(e) => return Err(e),
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        info!(
            status = %outcome.status,
            steps = backend.n_calls(),
            elapsed_s = format!("{elapsed:.1}"),
            "agent run finished"
        );

        Ok(DriverReport {
            status: outcome.status,
            message: outcome.message,
            steps: backend.n_calls(),
            cost: backend.cost(),
            elapsed,
            format_errors: self.detector.format_errors(),
            timeouts: self.detector.timeouts(),
            loop_abort_reason: self.detector.abort_reason().to_string(),
        })
    }
}

/// The driver's observer: feeds the detector and applies the policy.
struct DriverObserver<'a> {
    policy: LoopPolicy,
    detector: &'a mut LoopDetector,
    differ: &'a PatchDiffer,
    workspace: &'a Path,
}

#[async_trait]
impl TranscriptObserver for DriverObserver<'_> {
    async fn observe(&mut self, role: Role, content: &str) -> Directive {
        match role {
            Role::Assistant => {
                self.detector.observe_assistant(content);
                Directive::default()
            }
            Role::User => {
                let detect = self.policy != LoopPolicy::Off;
                let current_sig = if detect {
                    self.differ.diff_signature(self.workspace).await
                } else {
                    String::new()
                };
                let mut directive = self.detector.observe_user(content, &current_sig, detect);
                // Warn policy records the reason but never terminates.
                if self.policy != LoopPolicy::Strict {
                    directive.abort = None;
                }
                directive
            }
            Role::System => Directive::default(),
        }
    }
}
