//! The per-unit job lifecycle.
//!
//! ```text
//! Created -> FilesResolved -> Staged -> Executing -> Recorded -> CleanedUp -> Done
//!                                           \-> ExecutionFailed -/
//! ```
//!
//! Everything up to `Staged` fails loudly and leaves no status record; the
//! job log is still shipped and the invocation's scratch directory removed.
//! Once inputs are staged, exactly one status record is written and exactly
//! one cleanup pass runs, however the command behaves.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_yaml::Value;

use crate::config::JobConfig;
use crate::error::{HarnessError, Result};
use crate::files::ResolvedFileSet;
use crate::joblog::JobLog;
use crate::process::{OutputCapture, ProcessRunner, Sink, EXIT_STATUS_ERROR};
use crate::remote::RemoteStore;
use crate::staging::{FinalizeReport, StagingCoordinator};
use crate::status::{local_hostname, StatusRecord};
use crate::template;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    FilesResolved,
    Staged,
    Executing,
    ExecutionFailed,
    Recorded,
    CleanedUp,
    Done,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::FilesResolved => "files_resolved",
            Self::Staged => "staged",
            Self::Executing => "executing",
            Self::ExecutionFailed => "execution_failed",
            Self::Recorded => "recorded",
            Self::CleanedUp => "cleaned_up",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct JobOutcome {
    pub exit_status: i32,
    pub timed_out: bool,
    /// Set when the command could not be launched or reaped.
    pub execution_error: Option<String>,
    /// Set when the status record could not be written.
    pub record_error: Option<String>,
    pub status_path: PathBuf,
    pub cleanup: FinalizeReport,
    pub state: JobState,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_status == 0 && !self.timed_out && self.record_error.is_none()
    }
}

pub struct JobProcessor<'a> {
    config: JobConfig,
    files: ResolvedFileSet,
    command: String,
    store: &'a dyn RemoteStore,
    runner: ProcessRunner,
    state: JobState,
}

impl<'a> JobProcessor<'a> {
    /// Validate a raw job description and prepare it for running.
    pub fn from_value(value: Value, store: &'a dyn RemoteStore) -> Result<Self> {
        Self::new(JobConfig::from_value(value)?, store)
    }

    /// Resolve files into a scratch directory of this invocation's own and
    /// render the command. No filesystem access happens here, so a command
    /// that cannot be realized never causes staging.
    pub fn new(config: JobConfig, store: &'a dyn RemoteStore) -> Result<Self> {
        let files = ResolvedFileSet::resolve_isolated(&config, store)?;
        let command = template::render(config.command(), &files.namespace)?;
        tracing::debug!(run = %config.run(), state = %JobState::FilesResolved, %command, "job prepared");
        Ok(Self {
            config,
            files,
            command,
            store,
            runner: ProcessRunner::default(),
            state: JobState::FilesResolved,
        })
    }

    pub fn with_runner(mut self, runner: ProcessRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn files(&self) -> &ResolvedFileSet {
        &self.files
    }

    /// The rendered command line.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Stage, execute, record, clean up.
    ///
    /// Returns `Err` only when the job never got past staging; in that case
    /// no status record exists and the unit counts as never run.
    pub fn run(self) -> Result<JobOutcome> {
        let Self {
            config,
            files,
            command,
            store,
            runner,
            mut state,
        } = self;
        let _span = tracing::info_span!("job", run = %config.run()).entered();
        let stager = StagingCoordinator::new(store);

        tracing::info!(log = %config.log_url(), "log file");
        let scratch = files.scratch.as_deref();
        if let Err(e) = stager.prepare_outputs(&files.outputs) {
            release_scratch(scratch);
            return Err(e);
        }
        let mut log = match JobLog::create(files.log().local_path(), config.run()) {
            Ok(log) => log,
            Err(e) => {
                release_scratch(scratch);
                return Err(e);
            }
        };
        if let Some(host) = local_hostname() {
            log.line(host);
        }
        if let Err(e) = stager.stage_inputs(&files.inputs, &mut log) {
            stager.abandon(&files.outputs, &mut log);
            release_scratch(scratch);
            return Err(e);
        }
        advance(&mut state, JobState::Staged);

        let mut finalizer = Finalizer {
            stager,
            files: &files,
            log,
            record: StatusRecord::pending(&config),
            done: false,
        };

        advance(&mut state, JobState::Executing);
        finalizer.log.line(format!("running command: \n\t{}", command));
        let executed = finalizer.log.sink().and_then(|sink| {
            runner.execute(
                &command,
                config.timeout(),
                OutputCapture::Combined(Sink::File(sink)),
            )
        });
        let execution_error = match executed {
            Ok(result) => {
                if result.timed_out {
                    finalizer
                        .log
                        .line(format!("timed out after {} seconds", config.timeout_secs()));
                }
                finalizer.log.line(format!("exit_status: {}", result.exit_status));
                finalizer.record.apply(&result);
                finalizer.log.line("Done");
                None
            }
            Err(e) => {
                advance(&mut state, JobState::ExecutionFailed);
                finalizer.log.line(format!("execution failed: {}", e));
                finalizer.record.set_exit_status(EXIT_STATUS_ERROR);
                Some(e.to_string())
            }
        };
        let exit_status = finalizer.record.exit_status();
        let timed_out = finalizer.record.timed_out();
        tracing::info!(exit_status, timed_out, "exit_status: {}", exit_status);

        let (record_error, cleanup) = finalizer.finish(&mut state);
        advance(&mut state, JobState::Done);
        Ok(JobOutcome {
            exit_status,
            timed_out,
            execution_error,
            record_error: record_error.map(|e| e.to_string()),
            status_path: files.stat().local_path().to_path_buf(),
            cleanup,
            state,
        })
    }
}

fn advance(state: &mut JobState, next: JobState) {
    tracing::debug!(from = %state, to = %next, "job state");
    *state = next;
}

/// Remove the invocation's scratch directory once it is empty. Local copies
/// kept after a failed push stay, and so does the directory.
fn release_scratch(dir: Option<&Path>) {
    let Some(dir) = dir else {
        return;
    };
    match fs::remove_dir(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::debug!(dir = %dir.display(), error = %e, "scratch directory kept"),
    }
}

/// Writes the status record and then runs cleanup, exactly once: either
/// through [`Finalizer::finish`] or, if the execution phase unwinds, on drop.
struct Finalizer<'a, 'f> {
    stager: StagingCoordinator<'a>,
    files: &'f ResolvedFileSet,
    log: JobLog,
    record: StatusRecord,
    done: bool,
}

impl Finalizer<'_, '_> {
    fn finish(&mut self, state: &mut JobState) -> (Option<HarnessError>, FinalizeReport) {
        self.done = true;
        let stat_path = self.files.stat().local_path();
        self.log
            .line(format!("writing status file: {}", stat_path.display()));
        let record_error = self.record.write(stat_path).err();
        if let Some(e) = &record_error {
            tracing::error!(error = %e, "status record not written");
            self.log.line(format!("failed to write status file: {}", e));
        }
        advance(state, JobState::Recorded);

        let report = self
            .stager
            .finalize(&self.files.inputs, &self.files.outputs, &mut self.log);
        release_scratch(self.files.scratch.as_deref());
        advance(state, JobState::CleanedUp);
        (record_error, report)
    }
}

impl Drop for Finalizer<'_, '_> {
    fn drop(&mut self) {
        if !self.done {
            let mut state = JobState::Executing;
            let _ = self.finish(&mut state);
        }
    }
}
