//! Runs one external command under a wall-clock timeout.

use std::fs::File;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::error::{HarnessError, Result};

/// Exit status recorded before the command has completed.
pub const EXIT_STATUS_PENDING: i32 = -9999;
/// Exit status recorded when the command was killed at its deadline.
pub const EXIT_STATUS_TIMEOUT: i32 = -9998;
/// Exit status recorded when the command could not be launched or reaped.
pub const EXIT_STATUS_ERROR: i32 = -9997;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Destination for one output stream of the child.
#[derive(Debug)]
pub enum Sink {
    Inherit,
    Null,
    File(File),
}

impl From<Sink> for Stdio {
    fn from(sink: Sink) -> Self {
        match sink {
            Sink::Inherit => Stdio::inherit(),
            Sink::Null => Stdio::null(),
            Sink::File(file) => Stdio::from(file),
        }
    }
}

#[derive(Debug)]
pub enum OutputCapture {
    /// stdout and stderr interleaved into one sink.
    Combined(Sink),
    Separate { stdout: Sink, stderr: Sink },
}

impl OutputCapture {
    fn into_stdio(self) -> Result<(Stdio, Stdio)> {
        match self {
            Self::Combined(Sink::File(file)) => {
                let dup = file
                    .try_clone()
                    .map_err(|e| HarnessError::Execution(format!("failed to share output sink: {}", e)))?;
                Ok((Stdio::from(file), Stdio::from(dup)))
            }
            Self::Combined(Sink::Inherit) => Ok((Stdio::inherit(), Stdio::inherit())),
            Self::Combined(Sink::Null) => Ok((Stdio::null(), Stdio::null())),
            Self::Separate { stdout, stderr } => Ok((stdout.into(), stderr.into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub exit_status: i32,
    pub timed_out: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_status == 0 && !self.timed_out
    }

    pub fn wall_seconds(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Map a child's exit status to the recorded integer: the exit code, or the
/// negated signal number when the child was killed by a signal.
pub fn exit_status_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(EXIT_STATUS_ERROR)
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    shell: String,
    poll_interval: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Run `command` through the shell in a fresh process group. When
    /// `timeout` expires the whole group is killed and reaped before
    /// returning, so nothing the command started outlives the call.
    pub fn execute(
        &self,
        command: &str,
        timeout: Duration,
        capture: OutputCapture,
    ) -> Result<ExecutionResult> {
        let (stdout, stderr) = capture.into_stdio()?;
        let started_at = Utc::now();
        let start = Instant::now();
        let deadline = start.checked_add(timeout);

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|e| HarnessError::Execution(format!("failed to spawn {}: {}", self.shell, e)))?;
        let pid = child.id();
        tracing::debug!(pid, timeout_secs = timeout.as_secs(), "command started");

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let exit_status = exit_status_code(status);
                    tracing::debug!(pid, exit_status, "command exited");
                    return Ok(ExecutionResult {
                        exit_status,
                        timed_out: false,
                        started_at,
                        finished_at: Utc::now(),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    kill_group(&mut child);
                    let _ = child.wait();
                    return Err(HarnessError::Execution(format!(
                        "failed to wait on pid {}: {}",
                        pid, e
                    )));
                }
            }

            let now = Instant::now();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    tracing::warn!(pid, timeout_secs = timeout.as_secs(), "command timed out, killing process group");
                    kill_group(&mut child);
                    let _ = child.wait();
                    return Ok(ExecutionResult {
                        exit_status: EXIT_STATUS_TIMEOUT,
                        timed_out: true,
                        started_at,
                        finished_at: Utc::now(),
                    });
                }
                thread::sleep(self.poll_interval.min(deadline - now));
            } else {
                thread::sleep(self.poll_interval);
            }
        }
    }
}

fn kill_group(child: &mut Child) {
    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        tracing::warn!(pgid = child.id(), error = %e, "killpg failed, killing child only");
        let _ = child.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "wl_process_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn quiet() -> OutputCapture {
        OutputCapture::Combined(Sink::Null)
    }

    /// A pid counts as gone once it no longer exists or is a zombie.
    #[cfg(target_os = "linux")]
    fn is_running(pid: i32) -> bool {
        match fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next())
                .map(|state| state != "Z")
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[test]
    fn exit_codes_are_reported() {
        let runner = ProcessRunner::new();
        let ok = runner.execute("true", Duration::from_secs(10), quiet()).expect("run");
        assert_eq!(ok.exit_status, 0);
        assert!(ok.succeeded());
        let failed = runner.execute("exit 3", Duration::from_secs(10), quiet()).expect("run");
        assert_eq!(failed.exit_status, 3);
        assert!(!failed.timed_out);
        assert!(failed.finished_at >= failed.started_at);
    }

    #[test]
    fn fatal_signal_is_reported_as_negative_status() {
        let runner = ProcessRunner::new();
        let result = runner
            .execute("kill -9 $$", Duration::from_secs(10), quiet())
            .expect("run");
        assert_eq!(result.exit_status, -9);
        assert!(!result.timed_out);
    }

    #[test]
    fn timeout_kills_the_command() {
        let runner = ProcessRunner::new().with_poll_interval(Duration::from_millis(10));
        let start = Instant::now();
        let result = runner
            .execute("sleep 30", Duration::from_millis(300), quiet())
            .expect("run");
        assert!(result.timed_out);
        assert_eq!(result.exit_status, EXIT_STATUS_TIMEOUT);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn timeout_kills_background_children_too() {
        let dir = temp_dir("orphans");
        let pidfile = dir.join("child.pid");
        let command = format!("sleep 30 & echo $! > {}; wait", pidfile.display());
        let runner = ProcessRunner::new().with_poll_interval(Duration::from_millis(10));
        let result = runner
            .execute(&command, Duration::from_millis(500), quiet())
            .expect("run");
        assert!(result.timed_out);

        let pid: i32 = fs::read_to_string(&pidfile)
            .expect("pid file")
            .trim()
            .parse()
            .expect("pid");
        let deadline = Instant::now() + Duration::from_secs(5);
        while is_running(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!is_running(pid), "background child {} survived the timeout", pid);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn combined_capture_interleaves_streams_into_one_file() {
        let dir = temp_dir("combined");
        let log = dir.join("run.log");
        let file = File::create(&log).expect("log");
        let runner = ProcessRunner::new();
        runner
            .execute(
                "echo to-stdout; echo to-stderr 1>&2",
                Duration::from_secs(10),
                OutputCapture::Combined(Sink::File(file)),
            )
            .expect("run");
        let text = fs::read_to_string(&log).expect("read log");
        assert!(text.contains("to-stdout"), "{}", text);
        assert!(text.contains("to-stderr"), "{}", text);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn separate_capture_keeps_streams_apart() {
        let dir = temp_dir("separate");
        let out = dir.join("out.txt");
        let err = dir.join("err.txt");
        let runner = ProcessRunner::new();
        runner
            .execute(
                "echo to-stdout; echo to-stderr 1>&2",
                Duration::from_secs(10),
                OutputCapture::Separate {
                    stdout: Sink::File(File::create(&out).expect("out")),
                    stderr: Sink::File(File::create(&err).expect("err")),
                },
            )
            .expect("run");
        assert_eq!(fs::read_to_string(&out).unwrap().trim(), "to-stdout");
        assert_eq!(fs::read_to_string(&err).unwrap().trim(), "to-stderr");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn partial_output_survives_a_timeout() {
        let dir = temp_dir("partial");
        let log = dir.join("run.log");
        let runner = ProcessRunner::new().with_poll_interval(Duration::from_millis(10));
        let result = runner
            .execute(
                "echo early-line; sleep 30",
                Duration::from_millis(500),
                OutputCapture::Combined(Sink::File(File::create(&log).expect("log"))),
            )
            .expect("run");
        assert!(result.timed_out);
        assert!(fs::read_to_string(&log).unwrap().contains("early-line"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_shell_is_an_execution_error() {
        let runner = ProcessRunner::new().with_shell("/nonexistent/sh");
        let err = runner
            .execute("true", Duration::from_secs(1), quiet())
            .expect_err("spawn fails");
        assert!(matches!(err, HarnessError::Execution(_)), "{}", err);
    }
}
