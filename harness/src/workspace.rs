//! Per-attempt repository workspace
//!
//! Clones the target repository at a pinned base commit into a private
//! temp directory. Cleanup is tied to ownership: dropping the workspace
//! removes the directory on every exit path, panics and timeouts
//! included. The process never chdirs; subprocesses receive the
//! workspace path as an explicit cwd.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::error::{EvalError, EvalResult};
use crate::exec::{run_git, ExecOutput};

/// A private clone of one repository at one base commit.
///
/// Invariant: after `acquire` returns, `HEAD` equals the requested base
/// commit. The directory is exclusive to one attempt and is removed
/// when the workspace is dropped.
#[derive(Debug)]
pub struct RepoWorkspace {
    // Held for its Drop; the path field below points inside it.
    _dir: TempDir,
    path: PathBuf,
    base_commit: String,
}

/// Resolve a dataset `repo` field to a clone URL.
///
/// `owner/name` maps to GitHub; values that already look like a URL or
/// an absolute path (local mirrors, test fixtures) pass through.
pub fn clone_url(repo: &str) -> String {
    if repo.contains("://") || repo.starts_with('/') {
        repo.to_string()
    } else {
        format!("https://github.com/{repo}")
    }
}

impl RepoWorkspace {
    /// Clone `repo` and check out `base_commit`.
    ///
    /// Shallow clone first; on failure, full clone. The shallow history
    /// is unshallowed (best-effort) so any base commit is reachable.
    pub async fn acquire(repo: &str, base_commit: &str, config: &RunConfig) -> EvalResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("swe-ws-")
            .tempdir()
            .map_err(|e| EvalError::setup("tempdir", e.to_string()))?;
        let path = dir.path().join("repo");
        let url = clone_url(repo);
        let path_str = path.display().to_string();

        info!(repo, commit = &base_commit[..base_commit.len().min(8)], "cloning repository");

        let shallow = run_git(
            &["clone", "--depth", "1", "--single-branch", &url, &path_str],
            dir.path(),
            config.clone_timeout,
        )
        .await
        .map_err(|e| EvalError::setup("clone", e.to_string()))?;

        if !shallow.success() {
            warn!(repo, "shallow clone failed, retrying full clone");
            let full = run_git(&["clone", &url, &path_str], dir.path(), config.clone_timeout)
                .await
                .map_err(|e| EvalError::setup("clone", e.to_string()))?;
            Self::require_success("clone", &full)?;
        } else {
            // Base commits are rarely on the shallow tip; pull the rest.
            let unshallow =
                run_git(&["fetch", "--unshallow"], &path, config.clone_timeout).await;
            if let Ok(out) = unshallow {
                if !out.success() && !out.timed_out {
                    // Already-complete clones report an error here; harmless.
                    tracing::debug!(stderr = %out.stderr.trim(), "unshallow fetch declined");
                }
            }
        }

        let checkout = run_git(&["checkout", base_commit], &path, config.git_timeout)
            .await
            .map_err(|e| EvalError::setup("checkout", e.to_string()))?;
        Self::require_success("checkout", &checkout)?;

        let ws = Self {
            _dir: dir,
            path,
            base_commit: base_commit.to_string(),
        };

        // Enforce the HEAD == base_commit invariant before handing out.
        let head = ws.head_commit(config).await?;
        if head != base_commit {
            return Err(EvalError::setup(
                "checkout",
                format!("HEAD is {head}, expected {base_commit}"),
            ));
        }

        Ok(ws)
    }

    fn require_success(operation: &str, out: &ExecOutput) -> EvalResult<()> {
        if out.timed_out {
            return Err(EvalError::setup(operation, "timed out"));
        }
        if !out.success() {
            return Err(EvalError::setup(operation, out.stderr.trim().to_string()));
        }
        Ok(())
    }

    /// Absolute path of the cloned repository root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base_commit(&self) -> &str {
        &self.base_commit
    }

    /// Current `HEAD` commit of the workspace.
    pub async fn head_commit(&self, config: &RunConfig) -> EvalResult<String> {
        let out = run_git(&["rev-parse", "HEAD"], &self.path, config.git_timeout)
            .await
            .map_err(|e| EvalError::setup("rev-parse", e.to_string()))?;
        Self::require_success("rev-parse", &out)?;
        Ok(out.stdout.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_url_mapping() {
        assert_eq!(clone_url("astropy/astropy"), "https://github.com/astropy/astropy");
        assert_eq!(clone_url("https://example.com/r.git"), "https://example.com/r.git");
        assert_eq!(clone_url("/srv/mirrors/repo"), "/srv/mirrors/repo");
    }
}
