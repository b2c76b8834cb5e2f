//! Workspace-scoped shell executor
//!
//! Runs one agent action per invocation in a fresh subshell with the
//! workspace as cwd, the hang-guard environment, and a hard deadline.
//! Nothing persists between actions except the filesystem.

use std::path::{Path, PathBuf};
use std::time::Duration;

use harness::exec::{command, run_with_timeout};

/// Default per-action deadline.
const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of one executed action.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub returncode: i32,
    /// stdout followed by stderr, the way the observation shows it.
    pub output: String,
    pub timed_out: bool,
}

/// Executes bash actions inside one workspace.
#[derive(Debug, Clone)]
pub struct LocalShell {
    cwd: PathBuf,
    timeout: Duration,
}

impl LocalShell {
    pub fn new(cwd: impl AsRef<Path>) -> Self {
        Self {
            cwd: cwd.as_ref().to_path_buf(),
            timeout: DEFAULT_ACTION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Execute one action in a fresh subshell.
    pub async fn execute(&self, action: &str) -> std::io::Result<ShellOutput> {
        let mut cmd = command("bash", &["-c", action], &self.cwd);
        let out = run_with_timeout(&mut cmd, self.timeout).await?;

        let mut combined = out.stdout;
        if !out.stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&out.stderr);
        }

        Ok(ShellOutput {
            // Signal deaths and timeouts surface as -1, like a killed shell.
            returncode: out.status.unwrap_or(-1),
            output: combined,
            timed_out: out.timed_out,
        })
    }
}
