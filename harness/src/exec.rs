//! Time-bounded subprocess execution
//!
//! Every child process gets an explicit working directory, the hang-guard
//! environment, its own process group, and a hard wall-clock deadline.
//! The orchestrator never blocks on a runaway child.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;

/// Environment applied to every subprocess to prevent interactive hangs
/// and progress-bar noise in captured output.
pub const HANG_GUARD_ENV: [(&str, &str); 5] = [
    ("PAGER", "cat"),
    ("MANPAGER", "cat"),
    ("LESS", "-R"),
    ("PIP_PROGRESS_BAR", "off"),
    ("TQDM_DISABLE", "1"),
];

/// Captured result of one subprocess run.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Exit code; `None` when the process was killed by a signal or deadline.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// True when the deadline expired and the process tree was killed.
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status == Some(0)
    }

    /// stdout followed by stderr, the way pytest counters are parsed.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Build a command with explicit cwd and the hang-guard environment.
pub fn command(program: &str, args: &[&str], cwd: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd);
    for (key, value) in HANG_GUARD_ENV {
        cmd.env(key, value);
    }
    cmd
}

/// Run a command under a wall-clock deadline.
///
/// The child is placed in its own process group so that on expiry the
/// entire tree (including grandchildren spawned by test runners) dies
/// with it. Spawn failures surface as `Err`; deadline expiry surfaces
/// as `Ok` with `timed_out = true`.
pub async fn run_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
) -> std::io::Result<ExecOutput> {
    cmd.kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(ExecOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            timed_out: false,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(ExecOutput {
            status: None,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
        }),
    }
}

/// Convenience wrapper for git invocations.
pub async fn run_git(
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> std::io::Result<ExecOutput> {
    run_with_timeout(&mut command("git", args, cwd), timeout).await
}
