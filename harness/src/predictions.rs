//! Prediction sink
//!
//! One JSONL file per run under the predictions directory. Append-only
//! and fsynced per record: a crash mid-run loses at most the instance
//! in flight.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{EvalError, EvalResult};
use crate::report::Prediction;

pub struct PredictionWriter {
    path: PathBuf,
    file: File,
}

impl PredictionWriter {
    /// Open `<dir>/<run_name>.jsonl` for appending.
    pub fn create(dir: &Path, run_name: &str) -> EvalResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{run_name}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EvalError::config(format!("cannot open {}: {e}", path.display())))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it to disk.
    pub fn append(&mut self, prediction: &Prediction) -> EvalResult<()> {
        let line = serde_json::to_string(prediction)?;
        writeln!(self.file, "{line}")?;
        self.file.sync_all()?;
        Ok(())
    }
}
