//! Task records and the cached dataset source
//!
//! Tasks come from a locally cached SWE-bench split: a JSON array of
//! records. The upstream cache writes `FAIL_TO_PASS` / `PASS_TO_PASS`
//! either as JSON arrays or as JSON-encoded strings depending on the
//! exporter version; both forms parse here.

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::{EvalError, EvalResult};

/// One SWE-bench task instance. Read-only, externally owned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub instance_id: String,
    /// `owner/name`, or a full clone URL for local mirrors.
    pub repo: String,
    pub base_commit: String,
    pub problem_statement: String,
    #[serde(default)]
    pub hints_text: String,
    #[serde(
        rename = "FAIL_TO_PASS",
        alias = "fail_to_pass",
        default,
        deserialize_with = "deserialize_test_list"
    )]
    pub fail_to_pass: Vec<String>,
    #[serde(
        rename = "PASS_TO_PASS",
        alias = "pass_to_pass",
        default,
        deserialize_with = "deserialize_test_list"
    )]
    pub pass_to_pass: Vec<String>,
}

/// Accepts `["a", "b"]` or `"[\"a\", \"b\"]"`.
fn deserialize_test_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TestList {
        List(Vec<String>),
        Encoded(String),
    }

    match Option::<TestList>::deserialize(deserializer)? {
        None => Ok(Vec::new()),
        Some(TestList::List(tests)) => Ok(tests),
        Some(TestList::Encoded(raw)) => match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(tests) => Ok(tests),
            Err(e) => {
                warn!("unparseable test list {raw:?}: {e}");
                Ok(Vec::new())
            }
        },
    }
}

/// Which instances of the split to evaluate.
#[derive(Debug, Clone)]
pub enum InstanceSelection {
    /// The whole split in dataset order.
    All,
    /// The first N instances.
    First(usize),
    /// An explicit ID list, in dataset order.
    Ids(Vec<String>),
}

impl InstanceSelection {
    pub fn apply(&self, tasks: Vec<Task>) -> Vec<Task> {
        match self {
            Self::All => tasks,
            Self::First(n) => tasks.into_iter().take(*n).collect(),
            Self::Ids(ids) => tasks
                .into_iter()
                .filter(|t| ids.iter().any(|id| id == &t.instance_id))
                .collect(),
        }
    }
}

/// Source of task records.
pub trait TaskSource {
    fn tasks(&self) -> EvalResult<Vec<Task>>;
}

/// JSON-file dataset cache (the output of the external caching step).
pub struct CachedDataset {
    path: std::path::PathBuf,
}

impl CachedDataset {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl TaskSource for CachedDataset {
    fn tasks(&self) -> EvalResult<Vec<Task>> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            EvalError::config(format!(
                "cannot read dataset cache {}: {e}",
                self.path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            EvalError::config(format!(
                "invalid dataset cache {}: {e}",
                self.path.display()
            ))
        })
    }
}
