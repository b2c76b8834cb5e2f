//! End-to-end orchestration with scripted agent backends.
//!
//! The backends here follow the real protocol contract: every message
//! goes through the observer, warnings are prepended, and an abort
//! directive terminates the run as "LoopAborted".

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use harness::driver::{AgentBackend, AgentOutcome, BackendFactory, Role, TranscriptObserver};
use harness::{
    run_instance, EvalError, EvalMode, EvalResult, GraphRagClient, GraphRagSession, InstanceLog,
    LoopPolicy, RunConfig, Task,
};

fn git(args: &[&str], cwd: &Path) {
    let out = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("git runs");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

fn init_origin(dir: &Path) -> String {
    git(&["init"], dir);
    git(&["config", "user.email", "ci@example.com"], dir);
    git(&["config", "user.name", "ci"], dir);
    std::fs::write(dir.join("y.py"), "def div(a, b):\n    return a / b\n").unwrap();
    git(&["add", "-A"], dir);
    git(&["commit", "-m", "seed"], dir);
    let out = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .output()
        .unwrap();
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn task_for(origin: &Path, commit: &str) -> Task {
    Task {
        instance_id: "x__y-1".to_string(),
        repo: origin.display().to_string(),
        base_commit: commit.to_string(),
        problem_statement: "Fix divide by zero in div()".to_string(),
        hints_text: String::new(),
        fail_to_pass: vec![],
        pass_to_pass: vec![],
    }
}

fn test_config(policy: LoopPolicy) -> RunConfig {
    let mut config = RunConfig::default();
    config.loop_policy = policy;
    config.patch_compile_gate = false;
    config.max_attempts = 3;
    config.step_limit = 30;
    config
}

/// A backend that greps forever; terminates only when directed (or at
/// its step budget, whichever comes first).
struct SearchLoopBackend {
    steps: u32,
    calls: u32,
}

#[async_trait]
impl AgentBackend for SearchLoopBackend {
    async fn run(
        &mut self,
        _task: &str,
        observer: &mut dyn TranscriptObserver,
    ) -> EvalResult<AgentOutcome> {
        observer.observe(Role::System, "system prompt").await;
        observer.observe(Role::User, "instance prompt").await;

        for _ in 0..self.steps {
            self.calls += 1;
            observer
                .observe(Role::Assistant, "THOUGHT: looking\n\n```bash\ngrep \"foo\" .\n```")
                .await;
            let observation = "<returncode>0</returncode>\n<output>\n</output>";
            let directive = observer.observe(Role::User, observation).await;
            if let Some(reason) = directive.abort {
                return Ok(AgentOutcome {
                    status: "LoopAborted".to_string(),
                    message: reason,
                });
            }
        }
        Ok(AgentOutcome {
            status: "Submitted".to_string(),
            message: "gave up searching".to_string(),
        })
    }

    fn n_calls(&self) -> u32 {
        self.calls
    }

    fn cost(&self) -> f64 {
        0.0
    }
}

/// A backend that applies a real fix to the workspace and submits.
struct FixingBackend {
    workspace: PathBuf,
    calls: u32,
    tasks_seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl AgentBackend for FixingBackend {
    async fn run(
        &mut self,
        task: &str,
        observer: &mut dyn TranscriptObserver,
    ) -> EvalResult<AgentOutcome> {
        self.tasks_seen.lock().unwrap().push(task.to_string());
        observer.observe(Role::System, "system prompt").await;
        observer.observe(Role::User, "instance prompt").await;

        self.calls += 1;
        observer
            .observe(
                Role::Assistant,
                "THOUGHT: patch the zero case\n\n```bash\npython3 edit.py\n```",
            )
            .await;
        std::fs::write(
            self.workspace.join("y.py"),
            "def div(a, b):\n    if b == 0:\n        return None\n    return a / b\n",
        )
        .unwrap();
        let directive = observer
            .observe(Role::User, "<returncode>0</returncode>\n<output>\nDone\n</output>")
            .await;
        if let Some(reason) = directive.abort {
            return Ok(AgentOutcome {
                status: "LoopAborted".to_string(),
                message: reason,
            });
        }

        self.calls += 1;
        observer
            .observe(
                Role::Assistant,
                "Done.\n\n```bash\necho COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT\n```",
            )
            .await;
        Ok(AgentOutcome {
            status: "Submitted".to_string(),
            message: "COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT".to_string(),
        })
    }

    fn n_calls(&self) -> u32 {
        self.calls
    }

    fn cost(&self) -> f64 {
        0.0
    }
}

/// Hands out a scripted behavior per attempt, in order.
enum Script {
    SearchLoop(u32),
    Fix,
}

struct ScriptedFactory {
    scripts: Vec<Script>,
    next: AtomicU32,
    tasks_seen: Arc<Mutex<Vec<String>>>,
}

impl ScriptedFactory {
    fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts,
            next: AtomicU32::new(0),
            tasks_seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// How many backends (agent rounds) were created so far.
    fn created(&self) -> u32 {
        self.next.load(Ordering::SeqCst)
    }

    /// Task texts the fixing backends were run with, in order.
    fn tasks_seen(&self) -> Vec<String> {
        self.tasks_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendFactory for ScriptedFactory {
    async fn create(&self, workspace: &Path) -> EvalResult<Box<dyn AgentBackend>> {
        let index = self.next.fetch_add(1, Ordering::SeqCst) as usize;
        let script = self
            .scripts
            .get(index.min(self.scripts.len().saturating_sub(1)))
            .ok_or_else(|| EvalError::agent("no scripted behavior"))?;
        Ok(match script {
            Script::SearchLoop(steps) => Box::new(SearchLoopBackend {
                steps: *steps,
                calls: 0,
            }),
            Script::Fix => Box::new(FixingBackend {
                workspace: workspace.to_path_buf(),
                calls: 0,
                tasks_seen: self.tasks_seen.clone(),
            }),
        })
    }
}

#[tokio::test]
async fn test_strict_search_streak_aborts_with_empty_prediction() {
    let origin = tempfile::tempdir().unwrap();
    let commit = init_origin(origin.path());
    let task = task_for(origin.path(), &commit);
    let mut config = test_config(LoopPolicy::Strict);
    config.max_attempts = 1;

    let factory = ScriptedFactory::new(vec![Script::SearchLoop(12)]);
    let logs = tempfile::tempdir().unwrap();
    let log = InstanceLog::create(logs.path(), &task.instance_id, config.max_attempts).unwrap();

    let prediction = run_instance(
        &config,
        EvalMode::default(),
        &factory,
        None,
        &task,
        &log,
    )
    .await;

    assert_eq!(prediction.status, "LoopAborted");
    assert_eq!(prediction.loop_abort_reason, "search_only_streak:8");
    assert_eq!(prediction.prediction, "");
    assert!(!prediction.patch_gate_valid);
    assert_eq!(prediction.patch_gate_reason, "empty_diff");
    assert_eq!(prediction.attempts_used, 1);

    let log_content = std::fs::read_to_string(log.path()).unwrap();
    assert!(log_content.contains("search_only_streak:8"));
    assert!(log_content.contains("PATCH_GATE_RESULT"));
}

#[tokio::test]
async fn test_off_policy_never_sets_loop_abort_reason() {
    let origin = tempfile::tempdir().unwrap();
    let commit = init_origin(origin.path());
    let task = task_for(origin.path(), &commit);
    let mut config = test_config(LoopPolicy::Off);
    config.max_attempts = 1;

    let factory = ScriptedFactory::new(vec![Script::SearchLoop(12)]);
    let logs = tempfile::tempdir().unwrap();
    let log = InstanceLog::create(logs.path(), &task.instance_id, config.max_attempts).unwrap();

    let prediction = run_instance(
        &config,
        EvalMode::default(),
        &factory,
        None,
        &task,
        &log,
    )
    .await;

    assert_eq!(prediction.loop_abort_reason, "");
    assert_eq!(prediction.status, "Submitted");
    assert_eq!(prediction.prediction, "");
}

#[tokio::test]
async fn test_warn_policy_records_reason_but_completes() {
    let origin = tempfile::tempdir().unwrap();
    let commit = init_origin(origin.path());
    let task = task_for(origin.path(), &commit);
    let mut config = test_config(LoopPolicy::Warn);
    config.max_attempts = 1;

    let factory = ScriptedFactory::new(vec![Script::SearchLoop(12)]);
    let logs = tempfile::tempdir().unwrap();
    let log = InstanceLog::create(logs.path(), &task.instance_id, config.max_attempts).unwrap();

    let prediction = run_instance(
        &config,
        EvalMode::default(),
        &factory,
        None,
        &task,
        &log,
    )
    .await;

    // The run is never cut short, but the stuck trajectory is on record.
    assert_eq!(prediction.status, "Submitted");
    assert_eq!(prediction.loop_abort_reason, "search_only_streak:8");
}

#[tokio::test]
async fn test_retry_wins_on_attempt_two() {
    let origin = tempfile::tempdir().unwrap();
    let commit = init_origin(origin.path());
    let task = task_for(origin.path(), &commit);
    let config = test_config(LoopPolicy::Strict);

    let factory = ScriptedFactory::new(vec![Script::SearchLoop(12), Script::Fix]);
    let logs = tempfile::tempdir().unwrap();
    let log = InstanceLog::create(logs.path(), &task.instance_id, config.max_attempts).unwrap();

    let prediction = run_instance(
        &config,
        EvalMode::default(),
        &factory,
        None,
        &task,
        &log,
    )
    .await;

    assert_eq!(prediction.attempts_used, 2, "early stop after the clean attempt");
    assert_eq!(prediction.attempt_summaries.len(), 2);
    assert_eq!(prediction.attempt_summaries[0].status, "LoopAborted");
    assert_eq!(prediction.attempt_summaries[1].status, "Submitted");
    assert_eq!(prediction.status, "Submitted");
    assert!(prediction.patch_gate_valid);
    assert!(prediction.prediction.contains("if b == 0:"));
    assert!(prediction.loop_abort_reason.is_empty());
}

#[tokio::test]
async fn test_all_setup_failures_yield_degenerate_prediction() {
    let task = Task {
        instance_id: "x__y-broken".to_string(),
        repo: "/nonexistent/repo".to_string(),
        base_commit: "0000000000000000000000000000000000000000".to_string(),
        problem_statement: "Fix it".to_string(),
        hints_text: String::new(),
        fail_to_pass: vec![],
        pass_to_pass: vec![],
    };
    let config = test_config(LoopPolicy::Strict);
    let factory = ScriptedFactory::new(vec![Script::Fix]);
    let logs = tempfile::tempdir().unwrap();
    let log = InstanceLog::create(logs.path(), &task.instance_id, config.max_attempts).unwrap();

    let prediction = run_instance(
        &config,
        EvalMode::default(),
        &factory,
        None,
        &task,
        &log,
    )
    .await;

    assert_eq!(prediction.prediction, "");
    assert_eq!(prediction.status, "error");
    assert_eq!(prediction.patch_gate_reason, "no_attempt_completed");
    assert_eq!(prediction.attempts_used, config.max_attempts as usize);
    assert!(prediction
        .attempt_summaries
        .iter()
        .all(|s| s.error.is_some()));
}

#[tokio::test]
async fn test_vanilla_mode_leaves_test_metrics_null() {
    let origin = tempfile::tempdir().unwrap();
    let commit = init_origin(origin.path());
    let mut task = task_for(origin.path(), &commit);
    task.fail_to_pass = vec!["tests/test_div.py::test_zero".to_string()];
    let config = test_config(LoopPolicy::Strict);

    let factory = ScriptedFactory::new(vec![Script::Fix]);
    let logs = tempfile::tempdir().unwrap();
    let log = InstanceLog::create(logs.path(), &task.instance_id, config.max_attempts).unwrap();

    let prediction = run_instance(
        &config,
        EvalMode::default(),
        &factory,
        None,
        &task,
        &log,
    )
    .await;

    // Vanilla mode never runs pytest; the scorer sees nulls.
    assert!(prediction.f2p_pass_rate.is_none());
    assert!(prediction.p2p_smoke_failures.is_none());
    assert!(prediction.clean_resolution.is_none());
    assert!(!prediction.prediction.is_empty());
    assert_eq!(prediction.attempts_used, 1);
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Minimal GraphRAG service stub: answers the tool endpoints with
/// canned JSON, popping one scripted impacted-test response per call.
async fn serve_graphrag(
    listener: TcpListener,
    impacted_responses: Arc<Mutex<VecDeque<serde_json::Value>>>,
) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let impacted_responses = impacted_responses.clone();
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut tmp = [0u8; 4096];
            let header_end = loop {
                match stream.read(&mut tmp).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&tmp[..n]),
                }
                if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
                    break pos;
                }
            };
            let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
            let content_length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            let total = header_end + 4 + content_length;
            while buf.len() < total {
                match stream.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&tmp[..n]),
                }
            }

            let body = if head.contains("POST /tools/run_impacted_tests") {
                impacted_responses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| {
                        json!({"success": true, "tests_run": 0, "passed": 0, "failed": 0})
                    })
            } else if head.contains("POST /tools/build_code_graph") {
                json!({"success": true, "nodes_created": 10, "relationships_created": 20})
            } else {
                json!({"status": "ok"})
            };
            let payload = body.to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
                payload.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}

/// Start the stub and hand back a session pointed at it.
async fn graphrag_session(responses: Vec<serde_json::Value>) -> GraphRagSession {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let queue = Arc::new(Mutex::new(VecDeque::from(responses)));
    tokio::spawn(serve_graphrag(listener, queue));
    GraphRagSession::new(GraphRagClient::new(format!("http://{addr}")))
}

fn graphrag_config() -> RunConfig {
    let mut config = test_config(LoopPolicy::Strict);
    config.max_attempts = 1;
    config.max_fix_iterations = 2;
    config
}

#[tokio::test]
async fn test_graphrag_clean_impacted_run_exits_without_test_repair() {
    let origin = tempfile::tempdir().unwrap();
    let commit = init_origin(origin.path());
    let mut task = task_for(origin.path(), &commit);
    // The F2P subset cannot pass in the fixture repo; with a clean
    // impacted-test run the round must still exit instead of spending
    // the fix budget on a test-repair round.
    task.fail_to_pass = vec!["tests/test_div.py::test_zero".to_string()];
    let config = graphrag_config();
    let mode = EvalMode {
        tdd_mode: true,
        use_graphrag: true,
    };

    let session = graphrag_session(vec![json!({
        "success": true,
        "total_impacted": 3,
        "tests_run": 2,
        "passed": 2,
        "failed": 0,
        "failed_tests": [],
    })])
    .await;

    let factory = ScriptedFactory::new(vec![Script::Fix, Script::Fix, Script::Fix]);
    let logs = tempfile::tempdir().unwrap();
    let log = InstanceLog::create(logs.path(), &task.instance_id, config.max_attempts).unwrap();

    let prediction = run_instance(&config, mode, &factory, Some(&session), &task, &log).await;

    assert_eq!(factory.created(), 1, "a clean impacted run ends the round");
    assert_eq!(prediction.attempts_used, 1);
    assert_eq!(prediction.status, "Submitted");
    assert!(prediction.graphrag.graph_built);
    assert_eq!(prediction.graphrag.graph_nodes, 10);
    assert_eq!(prediction.graphrag.impacted_run, 2);
    assert_eq!(prediction.graphrag.impacted_failed, 0);
    assert_eq!(prediction.f2p_pass_rate, Some(0.0));
    assert!(!prediction.prediction.is_empty());
}

#[tokio::test]
async fn test_graphrag_impacted_failures_drive_repair_round() {
    let origin = tempfile::tempdir().unwrap();
    let commit = init_origin(origin.path());
    let task = task_for(origin.path(), &commit);
    let config = graphrag_config();
    let mode = EvalMode {
        tdd_mode: true,
        use_graphrag: true,
    };

    let session = graphrag_session(vec![
        json!({
            "success": true,
            "total_impacted": 3,
            "tests_run": 3,
            "passed": 2,
            "failed": 1,
            "failed_tests": [
                {"test_name": "test_div_regression", "error": "AssertionError: boom"}
            ],
        }),
        json!({
            "success": true,
            "total_impacted": 3,
            "tests_run": 3,
            "passed": 3,
            "failed": 0,
            "failed_tests": [],
        }),
    ])
    .await;

    let factory = ScriptedFactory::new(vec![Script::Fix, Script::Fix, Script::Fix]);
    let logs = tempfile::tempdir().unwrap();
    let log = InstanceLog::create(logs.path(), &task.instance_id, config.max_attempts).unwrap();

    let prediction = run_instance(&config, mode, &factory, Some(&session), &task, &log).await;

    assert_eq!(factory.created(), 2, "one repair round after the failed run");
    let tasks_seen = factory.tasks_seen();
    assert_eq!(tasks_seen.len(), 2);
    assert!(tasks_seen[1].contains("GraphRAG Impacted Test Failures"));
    assert!(tasks_seen[1].contains("test_div_regression"));

    // The candidate carries the last (clean) round's metadata.
    assert_eq!(prediction.graphrag.impacted_failed, 0);
    assert_eq!(prediction.graphrag.impacted_run, 3);
    assert_eq!(prediction.status, "Submitted");
    assert!(!prediction.prediction.is_empty());
}

#[tokio::test]
async fn test_driver_observer_is_shared_state_free_across_attempts() {
    // Two consecutive search-loop attempts must each need the full
    // streak again: no detector state leaks across attempts.
    let origin = tempfile::tempdir().unwrap();
    let commit = init_origin(origin.path());
    let task = task_for(origin.path(), &commit);
    let mut config = test_config(LoopPolicy::Strict);
    config.max_attempts = 2;

    let factory = ScriptedFactory::new(vec![Script::SearchLoop(12), Script::SearchLoop(12)]);
    let logs = tempfile::tempdir().unwrap();
    let log = InstanceLog::create(logs.path(), &task.instance_id, config.max_attempts).unwrap();

    let prediction = run_instance(
        &config,
        EvalMode::default(),
        &factory,
        None,
        &task,
        &log,
    )
    .await;

    assert_eq!(prediction.attempts_used, 2);
    for summary in &prediction.attempt_summaries {
        assert_eq!(summary.loop_abort_reason, "search_only_streak:8");
    }
}
