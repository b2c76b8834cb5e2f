//! Patch differ
//!
//! Textual state of the working tree vs. `HEAD`: the unified diff, the
//! changed Python files, and a cheap diff signature used only by the
//! loop detector to notice non-progress.

use std::path::Path;
use std::time::Duration;

use crate::error::{EvalError, EvalResult};
use crate::exec::run_git;

/// How many leading characters of the diff feed the signature hash.
const SIGNATURE_PREFIX: usize = 5000;

/// Computes diffs against `HEAD` with a bounded git call.
#[derive(Debug, Clone)]
pub struct PatchDiffer {
    timeout: Duration,
}

impl PatchDiffer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Full unified diff of the working tree vs. `HEAD`.
    ///
    /// A nonzero exit or deadline expiry is fatal to the attempt.
    pub async fn diff(&self, workspace: &Path) -> EvalResult<String> {
        let out = run_git(
            &["diff", "HEAD", "--no-color", "--no-ext-diff"],
            workspace,
            self.timeout,
        )
        .await
        .map_err(|e| EvalError::diff(e.to_string()))?;

        if out.timed_out {
            return Err(EvalError::timeout("git diff", self.timeout.as_secs()));
        }
        if !out.success() {
            return Err(EvalError::diff(out.stderr.trim().to_string()));
        }
        Ok(out.stdout)
    }

    /// Changed `.py` files, relative to the repo root.
    pub async fn changed_files(&self, workspace: &Path) -> EvalResult<Vec<String>> {
        let out = run_git(&["diff", "--name-only", "HEAD"], workspace, self.timeout)
            .await
            .map_err(|e| EvalError::diff(e.to_string()))?;

        if out.timed_out || !out.success() {
            return Err(EvalError::diff(out.stderr.trim().to_string()));
        }
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| l.ends_with(".py"))
            .map(String::from)
            .collect())
    }

    /// Stable fingerprint of the current diff.
    ///
    /// Never fails: diff errors collapse to a sentinel so the loop
    /// detector keeps running even when git is briefly unhappy.
    pub async fn diff_signature(&self, workspace: &Path) -> String {
        match self.diff(workspace).await {
            Ok(diff) => signature_of(&diff),
            Err(_) => "DIFF_ERR".to_string(),
        }
    }
}

/// `"EMPTY"` for a clean tree, else length plus a hash of the prefix.
pub fn signature_of(diff: &str) -> String {
    let trimmed = diff.trim();
    if trimmed.is_empty() {
        return "EMPTY".to_string();
    }
    let prefix_end = trimmed
        .char_indices()
        .map(|(i, _)| i)
        .nth(SIGNATURE_PREFIX)
        .unwrap_or(trimmed.len());
    let digest = blake3::hash(trimmed[..prefix_end].as_bytes());
    format!("LEN:{}|HASH:{}", trimmed.len(), &digest.to_hex()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_empty() {
        assert_eq!(signature_of(""), "EMPTY");
        assert_eq!(signature_of("  \n\t"), "EMPTY");
    }

    #[test]
    fn test_signature_stable_and_distinct() {
        let a = signature_of("diff --git a/x.py b/x.py\n+fixed");
        let b = signature_of("diff --git a/x.py b/x.py\n+fixed");
        let c = signature_of("diff --git a/x.py b/x.py\n+other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("LEN:"));
        assert!(a.contains("|HASH:"));
    }

    #[test]
    fn test_signature_only_prefix_hashed() {
        // Two diffs identical in the first 5000 chars but different after
        // still differ via the length component.
        let base = "x".repeat(6000);
        let a = signature_of(&base);
        let b = signature_of(&format!("{base}y"));
        assert_ne!(a, b);
    }
}
