//! Per-instance narrative log
//!
//! Line-oriented, timestamped, human-readable. One file per instance
//! under the logs directory, reset at the start of each run of that
//! instance. This is the record an operator reads to reconstruct what
//! the agent did; structured events go through `tracing` separately.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use tracing::debug;

use crate::error::{EvalError, EvalResult};

pub struct InstanceLog {
    path: PathBuf,
    max_attempts: u32,
    file: Mutex<File>,
}

impl InstanceLog {
    /// Create (or truncate) `<dir>/<instance_id>.log`.
    pub fn create(dir: &Path, instance_id: &str, max_attempts: u32) -> EvalResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{instance_id}.log"));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| EvalError::config(format!("cannot open {}: {e}", path.display())))?;
        Ok(Self {
            path,
            max_attempts,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line. Attempt 0 marks run-level events.
    pub fn log(&self, attempt: u32, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        let timestamp = Local::now().format("%H:%M:%S");
        let tag = if attempt == 0 {
            "[run]".to_string()
        } else {
            format!("[attempt {attempt}/{}]", self.max_attempts)
        };
        let line = format!("[{timestamp}] {tag} {msg}");
        debug!(target: "instance_log", "{line}");

        let mut file = self.file.lock().expect("instance log poisoned");
        // Log writes must never take down the run.
        let _ = writeln!(file, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_lines_are_tagged_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = InstanceLog::create(dir.path(), "astropy__astropy-1", 3).unwrap();
            log.log(0, "stale content");
        }

        let log = InstanceLog::create(dir.path(), "astropy__astropy-1", 3).unwrap();
        log.log(1, "=== START astropy__astropy-1 ===");
        log.log(2, "retrying");

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(!content.contains("stale content"), "log must reset per instance");
        assert!(content.contains("[attempt 1/3] === START astropy__astropy-1 ==="));
        assert!(content.contains("[attempt 2/3] retrying"));
    }
}
