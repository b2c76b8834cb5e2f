//! GraphRAG service adapter
//!
//! Narrow HTTP client over the code-graph service plus a per-run cache
//! keyed by `repo@commit`. Every failure here is soft: callers log it
//! and continue with GraphRAG downgraded to a no-op for the instance.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::error::{EvalError, EvalResult};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const BUILD_TIMEOUT: Duration = Duration::from_secs(600);
const UPDATE_TIMEOUT: Duration = Duration::from_secs(300);
const IMPACT_TIMEOUT: Duration = Duration::from_secs(60);
const RUN_TESTS_TIMEOUT: Duration = Duration::from_secs(600);

/// Graph build result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildGraphResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub nodes_created: u64,
    #[serde(default)]
    pub relationships_created: u64,
}

/// Incremental update result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncrementalUpdateResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub nodes_updated: u64,
    #[serde(default)]
    pub relationships_updated: u64,
}

/// One test the service considers impacted by the changed files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImpactedTest {
    #[serde(default)]
    pub test_id: String,
    #[serde(default)]
    pub test_name: String,
    #[serde(default)]
    pub test_file: String,
    #[serde(default)]
    pub impact_score: f64,
    #[serde(default)]
    pub impact_reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImpactedTestsResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub tests: Vec<ImpactedTest>,
    #[serde(default)]
    pub total_tests: u64,
}

/// A failed impacted test, carried into the repair prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailedImpactedTest {
    #[serde(default)]
    pub test_name: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunImpactedTestsResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub total_impacted: u64,
    #[serde(default)]
    pub tests_run: u64,
    #[serde(default)]
    pub passed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub failed_tests: Vec<FailedImpactedTest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClearDatabaseResponse {
    #[serde(default)]
    pub success: bool,
}

/// Per-instance GraphRAG metadata, carried on the Candidate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphRagSummary {
    pub graph_built: bool,
    pub graph_nodes: u64,
    pub graph_rels: u64,
    pub impacted_total: u64,
    pub impacted_run: u64,
    pub impacted_failed: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub impacted_failed_tests: Vec<FailedImpactedTest>,
}

/// HTTP client over the GraphRAG tool endpoints.
#[derive(Debug, Clone)]
pub struct GraphRagClient {
    base_url: String,
    http: reqwest::Client,
}

impl GraphRagClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// `GET /health`; false on any failure.
    pub async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.http.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(url, "graphrag health probe failed: {e}");
                false
            }
        }
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        tool: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> EvalResult<T> {
        let url = format!("{}/tools/{tool}", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| EvalError::graphrag(format!("{tool}: {e}")))?;
        if !resp.status().is_success() {
            return Err(EvalError::graphrag(format!(
                "{tool}: http {}",
                resp.status()
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| EvalError::graphrag(format!("{tool}: bad response: {e}")))
    }

    pub async fn build_graph(
        &self,
        repo_path: &Path,
        force_rebuild: bool,
        include_tests: bool,
    ) -> EvalResult<BuildGraphResponse> {
        self.post(
            "build_code_graph",
            json!({
                "repo_path": repo_path.display().to_string(),
                "force_rebuild": force_rebuild,
                "include_tests": include_tests,
            }),
            BUILD_TIMEOUT,
        )
        .await
    }

    pub async fn incremental_update(
        &self,
        repo_path: &Path,
        changed_files: &[String],
        base_commit: &str,
    ) -> EvalResult<IncrementalUpdateResponse> {
        self.post(
            "incremental_update",
            json!({
                "repo_path": repo_path.display().to_string(),
                "changed_files": changed_files,
                "base_commit": base_commit,
            }),
            UPDATE_TIMEOUT,
        )
        .await
    }

    pub async fn get_impacted_tests(
        &self,
        repo_path: &Path,
        changed_files: &[String],
        impact_threshold: f64,
    ) -> EvalResult<ImpactedTestsResponse> {
        self.post(
            "get_impacted_tests",
            json!({
                "repo_path": repo_path.display().to_string(),
                "changed_files": changed_files,
                "impact_threshold": impact_threshold,
            }),
            IMPACT_TIMEOUT,
        )
        .await
    }

    pub async fn run_impacted_tests(
        &self,
        repo_path: &Path,
        changed_files: &[String],
        impact_threshold: f64,
        max_tests: u64,
    ) -> EvalResult<RunImpactedTestsResponse> {
        self.post(
            "run_impacted_tests",
            json!({
                "repo_path": repo_path.display().to_string(),
                "changed_files": changed_files,
                "impact_threshold": impact_threshold,
                "max_tests": max_tests,
            }),
            RUN_TESTS_TIMEOUT,
        )
        .await
    }

    pub async fn clear_database(&self) -> EvalResult<ClearDatabaseResponse> {
        self.post("clear_database", json!({}), UPDATE_TIMEOUT).await
    }
}

/// GraphRAG session shared across instances of one run.
///
/// Caches graph builds by `repo@commit` so a second attempt on the same
/// instance (or a rerun of the same repo) skips the expensive rebuild.
pub struct GraphRagSession {
    client: GraphRagClient,
    built: Mutex<HashMap<String, BuildGraphResponse>>,
}

impl GraphRagSession {
    pub fn new(client: GraphRagClient) -> Self {
        Self {
            client,
            built: Mutex::new(HashMap::new()),
        }
    }

    /// Build (or reuse) the graph for one workspace.
    pub async fn build_graph(
        &self,
        repo: &str,
        base_commit: &str,
        repo_path: &Path,
    ) -> EvalResult<BuildGraphResponse> {
        let key = format!("{repo}@{base_commit}");
        if let Some(cached) = self
            .built
            .lock()
            .expect("graph cache poisoned")
            .get(&key)
            .cloned()
        {
            info!(key, "graph build cache hit");
            return Ok(cached);
        }

        let response = self.client.build_graph(repo_path, false, true).await?;
        if response.success {
            self.built
                .lock()
                .expect("graph cache poisoned")
                .insert(key, response.clone());
        }
        Ok(response)
    }

    pub async fn run_impacted_tests(
        &self,
        repo_path: &Path,
        changed_files: &[String],
        impact_threshold: f64,
        max_tests: u64,
    ) -> EvalResult<RunImpactedTestsResponse> {
        self.client
            .run_impacted_tests(repo_path, changed_files, impact_threshold, max_tests)
            .await
    }

    /// Drop the cache at the run boundary.
    pub fn clear_cache(&self) {
        self.built.lock().expect("graph cache poisoned").clear();
    }
}
