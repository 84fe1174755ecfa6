use std::fs;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_yaml::{Mapping, Value};

use crate::config::JobConfig;
use crate::error::{HarnessError, Result};
use crate::fsutil::atomic_write_bytes;
use crate::process::{ExecutionResult, EXIT_STATUS_PENDING};

/// Outcome document for one unit: the job config plus how the run went.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord {
    config: Mapping,
    exit_status: i32,
    timed_out: bool,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    host: Option<String>,
}

impl StatusRecord {
    pub fn pending(config: &JobConfig) -> Self {
        Self {
            config: config.to_mapping(),
            exit_status: EXIT_STATUS_PENDING,
            timed_out: false,
            started_at: None,
            finished_at: None,
            host: local_hostname(),
        }
    }

    pub fn apply(&mut self, result: &ExecutionResult) {
        self.exit_status = result.exit_status;
        self.timed_out = result.timed_out;
        self.started_at = Some(result.started_at);
        self.finished_at = Some(result.finished_at);
    }

    pub fn set_exit_status(&mut self, exit_status: i32) {
        self.exit_status = exit_status;
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn to_mapping(&self) -> Mapping {
        let mut out = self.config.clone();
        out.insert("exit_status".into(), Value::Number(self.exit_status.into()));
        out.insert("timed_out".into(), Value::Bool(self.timed_out));
        out.insert("started_at".into(), timestamp(self.started_at));
        out.insert("finished_at".into(), timestamp(self.finished_at));
        let wall = match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => {
                Value::Number(((end - start).num_milliseconds() as f64 / 1000.0).into())
            }
            _ => Value::Null,
        };
        out.insert("wall_seconds".into(), wall);
        out.insert(
            "host".into(),
            self.host.clone().map(Value::String).unwrap_or(Value::Null),
        );
        out
    }

    /// Serialize as JSON when `path` ends in `.json`, YAML otherwise, and
    /// replace the file atomically.
    pub fn write(&self, path: &Path) -> Result<()> {
        let map = self.to_mapping();
        let bytes = if is_json(path) {
            let mut bytes = serde_json::to_vec_pretty(&map)?;
            bytes.push(b'\n');
            bytes
        } else {
            serde_yaml::to_string(&map)?.into_bytes()
        };
        atomic_write_bytes(path, &bytes)
    }
}

fn timestamp(ts: Option<DateTime<Utc>>) -> Value {
    ts.map(|t| Value::String(t.to_rfc3339_opts(SecondsFormat::Millis, true)))
        .unwrap_or(Value::Null)
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("json")
}

pub(crate) fn local_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
}

/// Read a status file written by [`StatusRecord::write`]. JSON is parsed
/// through the YAML reader.
pub fn read_status(path: &Path) -> Result<Mapping> {
    let text = fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
    match serde_yaml::from_str::<Value>(&text)? {
        Value::Mapping(map) => Ok(map),
        _ => Err(HarnessError::Config(format!(
            "status file {} is not a mapping",
            path.display()
        ))),
    }
}

pub fn exit_status_of(status: &Mapping) -> Option<i64> {
    status.get("exit_status").and_then(Value::as_i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn config() -> JobConfig {
        JobConfig::from_yaml_str(
            r#"
run: wlse0001
expname: decam-000123
ccd: 7
command: "true"
input_files: {}
output_files:
  stat: /tmp/stat.yaml
  log: /tmp/run.log
"#,
        )
        .expect("valid config")
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir()
            .join(format!(
                "wl_status_{}_{}",
                std::process::id(),
                Utc::now().timestamp_micros()
            ))
            .join(name)
    }

    #[test]
    fn pending_record_carries_the_sentinel() {
        let record = StatusRecord::pending(&config());
        let map = record.to_mapping();
        assert_eq!(exit_status_of(&map), Some(EXIT_STATUS_PENDING as i64));
        assert_eq!(map.get("started_at"), Some(&Value::Null));
        assert_eq!(map.get("expname"), Some(&Value::String("decam-000123".into())));
    }

    #[test]
    fn yaml_record_round_trips_config_and_result() {
        let mut record = StatusRecord::pending(&config());
        let started = Utc::now();
        record.apply(&ExecutionResult {
            exit_status: 0,
            timed_out: false,
            started_at: started,
            finished_at: started + Duration::milliseconds(1500),
        });
        let path = temp_path("stat.yaml");
        record.write(&path).expect("write");
        let read = read_status(&path).expect("read");
        assert_eq!(exit_status_of(&read), Some(0));
        assert_eq!(read.get("run"), Some(&Value::String("wlse0001".into())));
        assert_eq!(read.get("wall_seconds").and_then(Value::as_f64), Some(1.5));
        assert_eq!(read.get("timed_out"), Some(&Value::Bool(false)));
        assert!(read.get("input_files").map(Value::is_mapping).unwrap_or(false));
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn json_extension_selects_json() {
        let mut record = StatusRecord::pending(&config());
        record.set_exit_status(-9);
        let path = temp_path("stat.json");
        record.write(&path).expect("write");
        let parsed: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).expect("valid json");
        assert_eq!(parsed["exit_status"], serde_json::json!(-9));
        assert_eq!(exit_status_of(&read_status(&path).unwrap()), Some(-9));
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
