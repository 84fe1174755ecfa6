//! Moves files between the distributed filesystem and local scratch around
//! a job's execution.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{HarnessError, Result};
use crate::files::{FileEntry, FileMap};
use crate::fsutil::ensure_parent_dir;
use crate::joblog::JobLog;
use crate::remote::RemoteStore;

/// A problem met while cleaning up. Logged and reported, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupWarning {
    MissingOutput { name: String, path: PathBuf },
    PushFailed { name: String, url: String, reason: String },
    RemoveFailed { path: PathBuf, reason: String },
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingOutput { name, path } => {
                write!(f, "local file not found: {} ({})", path.display(), name)
            }
            Self::PushFailed { name, url, reason } => {
                write!(f, "failed to put {} -> {}: {}; keeping local copy", name, url, reason)
            }
            Self::RemoveFailed { path, reason } => {
                write!(f, "failed to remove {}: {}", path.display(), reason)
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FinalizeReport {
    pub removed_inputs: Vec<PathBuf>,
    pub pushed: Vec<String>,
    pub warnings: Vec<CleanupWarning>,
}

impl FinalizeReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    fn warn(&mut self, log: &mut JobLog, warning: CleanupWarning) {
        tracing::warn!(%warning, "cleanup");
        log.line(format!("warning: {}", warning));
        self.warnings.push(warning);
    }
}

pub struct StagingCoordinator<'a> {
    store: &'a dyn RemoteStore,
}

impl<'a> StagingCoordinator<'a> {
    pub fn new(store: &'a dyn RemoteStore) -> Self {
        Self { store }
    }

    /// Create parent directories for every output so the command can write
    /// its results.
    pub fn prepare_outputs(&self, outputs: &FileMap) -> Result<()> {
        for entry in outputs.values() {
            ensure_parent_dir(entry.local_path()).map_err(|e| HarnessError::Staging {
                url: display_url(entry),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Pull every remote input to its local path. On the first failure the
    /// inputs staged so far are removed again and the error is returned.
    pub fn stage_inputs(&self, inputs: &FileMap, log: &mut JobLog) -> Result<()> {
        let mut staged: Vec<&Path> = Vec::new();
        for entry in inputs.values() {
            let Some(url) = entry.remote_url() else {
                continue;
            };
            log.line(format!("staging: {} -> {}", url, entry.local_path().display()));
            if let Err(e) = self.store.stage(url, entry.local_path()) {
                log.line(format!("staging failed: {}: {}", url, e));
                staged.push(entry.local_path());
                for local in staged {
                    if let Err(err) = self.store.cleanup(local) {
                        log.line(format!("failed to remove {}: {}", local.display(), err));
                    }
                }
                return Err(HarnessError::Staging {
                    url: url.to_string(),
                    reason: e.to_string(),
                });
            }
            staged.push(entry.local_path());
        }
        Ok(())
    }

    /// Best-effort cleanup after execution:
    ///
    /// 1. remove local copies of remote inputs;
    /// 2. push each remote output (except `log`) whose local file exists, then
    ///    remove it;
    /// 3. push the remote `log` last, once it holds every line written here.
    ///
    /// The job log is closed on return.
    pub fn finalize(&self, inputs: &FileMap, outputs: &FileMap, log: &mut JobLog) -> FinalizeReport {
        let mut report = FinalizeReport::default();

        for entry in inputs.values().filter(|e| e.is_remote()) {
            let local = entry.local_path();
            log.line(format!("removing: {}", local.display()));
            match self.store.cleanup(local) {
                Ok(()) => report.removed_inputs.push(local.to_path_buf()),
                Err(e) => report.warn(
                    log,
                    CleanupWarning::RemoveFailed {
                        path: local.to_path_buf(),
                        reason: e.to_string(),
                    },
                ),
            }
        }

        for (name, entry) in outputs {
            let Some(url) = entry.remote_url() else {
                continue;
            };
            if name == "log" {
                continue;
            }
            let local = entry.local_path();
            if !local.exists() {
                report.warn(
                    log,
                    CleanupWarning::MissingOutput {
                        name: name.clone(),
                        path: local.to_path_buf(),
                    },
                );
                continue;
            }
            log.line(format!("putting: {} -> {}", local.display(), url));
            match self.store.put(local, url, true) {
                Ok(()) => {
                    report.pushed.push(url.to_string());
                    if let Err(e) = self.store.cleanup(local) {
                        report.warn(
                            log,
                            CleanupWarning::RemoveFailed {
                                path: local.to_path_buf(),
                                reason: e.to_string(),
                            },
                        );
                    }
                }
                Err(e) => report.warn(
                    log,
                    CleanupWarning::PushFailed {
                        name: name.clone(),
                        url: url.to_string(),
                        reason: e.to_string(),
                    },
                ),
            }
        }

        self.ship_log(outputs, log, &mut report);
        report
    }

    /// Cleanup for a job that never got past staging: nothing ran, so only
    /// the job log is shipped. The log is closed on return.
    pub fn abandon(&self, outputs: &FileMap, log: &mut JobLog) -> FinalizeReport {
        let mut report = FinalizeReport::default();
        log.line("no status record written");
        self.ship_log(outputs, log, &mut report);
        report
    }

    fn ship_log(&self, outputs: &FileMap, log: &mut JobLog, report: &mut FinalizeReport) {
        let remote = outputs
            .get("log")
            .and_then(|entry| entry.remote_url().map(|url| (url, entry.local_path())));
        let Some((url, local)) = remote else {
            log.close();
            return;
        };
        log.line(format!("putting: {} -> {}", local.display(), url));
        log.close();
        // the log file is closed from here on; problems only reach tracing
        match self.store.put(local, url, true) {
            Ok(()) => {
                report.pushed.push(url.to_string());
                if let Err(e) = self.store.cleanup(local) {
                    let warning = CleanupWarning::RemoveFailed {
                        path: local.to_path_buf(),
                        reason: e.to_string(),
                    };
                    tracing::warn!(%warning, "cleanup");
                    report.warnings.push(warning);
                }
            }
            Err(e) => {
                let warning = CleanupWarning::PushFailed {
                    name: "log".to_string(),
                    url: url.to_string(),
                    reason: e.to_string(),
                };
                tracing::warn!(%warning, "cleanup");
                report.warnings.push(warning);
            }
        }
    }
}

fn display_url(entry: &FileEntry) -> String {
    entry
        .remote_url()
        .map(str::to_string)
        .unwrap_or_else(|| entry.local_path().display().to_string())
}
