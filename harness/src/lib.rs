//! SWE-bench agent evaluation harness
//!
//! The deterministic half of the benchmark runner: per-instance
//! workspaces, patch quality and test gates, trajectory loop control,
//! and the multi-attempt orchestration loop. The LLM-facing agent
//! lives behind the [`driver::AgentBackend`] trait; GraphRAG and the
//! dataset cache are consumed through equally narrow adapters.
//!
//! Instances are processed sequentially, each owning an isolated
//! working tree. All subprocess work is strictly time-bounded.

pub mod attempt;
pub mod config;
pub mod dataset;
pub mod differ;
pub mod driver;
pub mod error;
pub mod exec;
pub mod gate;
pub mod graphrag;
pub mod instance_log;
pub mod orchestrator;
pub mod predictions;
pub mod prompts;
pub mod report;
pub mod testgate;
pub mod workspace;

pub use attempt::{preflight, run_attempt};
pub use config::{EvalMode, LoopPolicy, RunConfig};
pub use dataset::{CachedDataset, InstanceSelection, Task, TaskSource};
pub use differ::PatchDiffer;
pub use driver::{
    AgentBackend, AgentDriver, AgentOutcome, BackendFactory, Directive, DriverReport, Role,
    TranscriptObserver,
};
pub use error::{EvalError, EvalResult};
pub use gate::{QualityDecision, QualityGate, Severity};
pub use graphrag::{GraphRagClient, GraphRagSession, GraphRagSummary};
pub use instance_log::InstanceLog;
pub use orchestrator::run_instance;
pub use predictions::PredictionWriter;
pub use report::{AttemptSummary, Candidate, CandidateScore, Prediction};
pub use testgate::{TestGate, TestMetrics};
pub use workspace::RepoWorkspace;
