use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{HarnessError, Result};
use crate::fsutil::ensure_parent_dir;

/// Diagnostic log for a single job invocation, written to the local copy of
/// the job's `log` output. Every line is also emitted as a `tracing` event
/// tagged with the run id.
///
/// The command's own stdout/stderr is appended to the same file through
/// [`JobLog::sink`], so the file reads as one chronological record.
#[derive(Debug)]
pub struct JobLog {
    path: PathBuf,
    run: String,
    file: Option<File>,
}

impl JobLog {
    pub fn create(path: &Path, run: &str) -> Result<Self> {
        ensure_parent_dir(path)?;
        File::create(path).map_err(|e| HarnessError::io(path, e))?;
        // append mode so writes from the child and from us interleave
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| HarnessError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            run: run.to_string(),
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Append one line. Write failures are reported through `tracing` only;
    /// the log must never abort the job.
    pub fn line(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!(run = %self.run, "{}", message);
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = writeln!(file, "{}", message).and_then(|_| file.flush()) {
                tracing::warn!(path = %self.path.display(), error = %e, "job log write failed");
            }
        }
    }

    /// A handle the child process can write its output through.
    pub fn sink(&self) -> Result<File> {
        match self.file.as_ref() {
            Some(file) => file.try_clone().map_err(|e| HarnessError::io(&self.path, e)),
            None => Err(HarnessError::Execution(format!(
                "job log {} is already closed",
                self.path.display()
            ))),
        }
    }

    /// Flush and close the file. Later `line` calls only reach `tracing`.
    pub fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
            let _ = file.sync_all();
        }
    }
}

impl Drop for JobLog {
    fn drop(&mut self) {
        self.close();
    }
}
