//! Python compile gate
//!
//! Byte-compiles every changed `.py` file in the working tree. A file
//! that fails is only blamed on the patch when its `HEAD` baseline
//! compiled (or the file is new); preexisting breakage downgrades to a
//! warning so the agent is not punished for the repo's own debt.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::exec::{command, run_git, run_with_timeout};

/// Compiles source from a path (or stdin via a temp file) and prints a
/// single classified error line on failure.
const PY_COMPILE_SNIPPET: &str = "\
import sys
path = sys.argv[1]
name = sys.argv[2] if len(sys.argv) > 2 else path
try:
    compile(open(path, 'rb').read(), name, 'exec')
except SyntaxError as e:
    print(f'SyntaxError:{e.msg}@{e.lineno}:{e.offset}')
    sys.exit(1)
except Exception as e:
    print(f'{type(e).__name__}:{e}')
    sys.exit(1)
";

/// One per-file entry of the compile gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileCheck {
    pub file: String,
    /// Error of the working-tree source.
    pub current_error: String,
    /// `"ok"`, `"missing"` (new file), or the baseline's own error.
    pub baseline_error: String,
}

/// Aggregate compile-gate outcome over all changed python files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompileGateReport {
    pub enabled: bool,
    pub python_files_changed: usize,
    pub compile_checked: usize,
    pub compile_failed: usize,
    pub compile_failed_files: Vec<String>,
    pub compile_skipped_preexisting: usize,
    pub compile_preexisting_files: Vec<String>,
    pub details: Vec<CompileCheck>,
}

/// Compile error of one source, `None` when it compiles.
async fn compile_error(
    workspace: &Path,
    path: &Path,
    display_name: &str,
    timeout: Duration,
) -> Option<String> {
    let path_str = path.display().to_string();
    let mut cmd = command(
        "python3",
        &["-c", PY_COMPILE_SNIPPET, &path_str, display_name],
        workspace,
    );
    match run_with_timeout(&mut cmd, timeout).await {
        Ok(out) if out.timed_out => Some("ToolTimeout:compile".to_string()),
        Ok(out) if out.success() => None,
        Ok(out) => {
            let line = out.stdout.lines().next().unwrap_or("").trim();
            if line.is_empty() {
                Some(format!("CompileError:{}", out.stderr.trim()))
            } else {
                Some(line.to_string())
            }
        }
        Err(e) => Some(format!("ToolError:{e}")),
    }
}

/// Run the compile gate over the changed python files.
///
/// Never fails the caller: tool trouble is folded into per-file error
/// strings, and a file missing from the working tree is skipped (it was
/// deleted by the patch, and there is nothing to compile).
pub async fn check_compile_gate(
    workspace: &Path,
    changed_py_files: &[String],
    timeout: Duration,
) -> CompileGateReport {
    let mut report = CompileGateReport {
        enabled: true,
        python_files_changed: changed_py_files.len(),
        ..CompileGateReport::default()
    };

    for rel_path in changed_py_files {
        let abs_path = workspace.join(rel_path);
        if !abs_path.is_file() {
            continue;
        }
        report.compile_checked += 1;

        let Some(current_error) = compile_error(workspace, &abs_path, rel_path, timeout).await
        else {
            continue;
        };

        // Current source is broken; consult the baseline to classify.
        let spec = format!("HEAD:{rel_path}");
        let baseline = run_git(&["show", &spec], workspace, timeout).await;
        let baseline_source = match baseline {
            Ok(out) if out.success() => Some(out.stdout),
            _ => None,
        };

        match baseline_source {
            None => {
                // New file that never compiled: the patch's fault.
                report.compile_failed_files.push(rel_path.clone());
                report.details.push(CompileCheck {
                    file: rel_path.clone(),
                    current_error,
                    baseline_error: "missing".to_string(),
                });
            }
            Some(source) => {
                let baseline_error =
                    baseline_compile_error(workspace, rel_path, &source, timeout).await;
                match baseline_error {
                    None => {
                        report.compile_failed_files.push(rel_path.clone());
                        report.details.push(CompileCheck {
                            file: rel_path.clone(),
                            current_error,
                            baseline_error: "ok".to_string(),
                        });
                    }
                    Some(err) => {
                        report.compile_preexisting_files.push(rel_path.clone());
                        report.details.push(CompileCheck {
                            file: rel_path.clone(),
                            current_error,
                            baseline_error: err,
                        });
                    }
                }
            }
        }
    }

    report.compile_failed = report.compile_failed_files.len();
    report.compile_skipped_preexisting = report.compile_preexisting_files.len();
    report
}

/// Compile the `HEAD` version of a file via a scratch copy.
async fn baseline_compile_error(
    workspace: &Path,
    rel_path: &str,
    source: &str,
    timeout: Duration,
) -> Option<String> {
    let mut scratch = match tempfile::NamedTempFile::new() {
        Ok(f) => f,
        Err(e) => {
            warn!(file = rel_path, "failed to stage baseline source: {e}");
            // Can't inspect the baseline; treat it as broken so the
            // failure downgrades to a preexisting warning.
            return Some(format!("ToolError:{e}"));
        }
    };
    if let Err(e) = scratch.write_all(source.as_bytes()) {
        warn!(file = rel_path, "failed to write baseline source: {e}");
        return Some(format!("ToolError:{e}"));
    }
    let display = format!("HEAD:{rel_path}");
    compile_error(workspace, scratch.path(), &display, timeout).await
}
