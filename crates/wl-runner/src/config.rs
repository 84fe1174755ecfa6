//! Job description for one processing unit.
//!
//! A job config is a YAML (or JSON) mapping with the required keys `run`,
//! `command`, `input_files` and `output_files`, where `output_files` must carry
//! both a `stat` and a `log` entry. Any other top-level key is kept as
//! metadata: it is copied into the status record and, when scalar, is
//! available to the command template.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde_yaml::{Mapping, Value};

use crate::error::{HarnessError, Result};
use crate::template::{Namespace, Scalar};

pub const DEFAULT_TIMEOUT_SECS: u64 = 2 * 60 * 60;

const REQUIRED_FIELDS: &[&str] = &["run", "input_files", "output_files", "command"];
const REQUIRED_OUTPUTS: &[&str] = &["stat", "log"];
const TYPED_FIELDS: &[&str] = &["run", "command", "timeout", "input_files", "output_files"];

#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    run: String,
    command: String,
    timeout: u64,
    input_files: BTreeMap<String, String>,
    output_files: BTreeMap<String, String>,
    extra: BTreeMap<String, Value>,
}

impl JobConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let map = match value {
            Value::Mapping(map) => map,
            other => {
                return Err(HarnessError::Config(format!(
                    "job config must be a mapping, found {}",
                    value_type_name(&other)
                )))
            }
        };
        validate_required_fields(&map)?;

        let run = map
            .get("run")
            .and_then(scalar_to_string)
            .ok_or_else(|| HarnessError::Config("'run' must be a scalar".to_string()))?;
        let command = match map.get("command") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            _ => {
                return Err(HarnessError::Config(
                    "'command' must be a non-empty string".to_string(),
                ))
            }
        };
        let timeout = match map.get("timeout") {
            None | Some(Value::Null) => DEFAULT_TIMEOUT_SECS,
            Some(v) => parse_timeout(v)?,
        };
        let input_files = file_map(&map, "input_files")?;
        let output_files = file_map(&map, "output_files")?;

        let mut extra = BTreeMap::new();
        for (key, value) in map {
            let key = match key {
                Value::String(s) => s,
                other => {
                    return Err(HarnessError::Config(format!(
                        "config keys must be strings, found {}",
                        value_type_name(&other)
                    )))
                }
            };
            if !TYPED_FIELDS.contains(&key.as_str()) {
                extra.insert(key, value);
            }
        }

        Ok(Self {
            run,
            command,
            timeout,
            input_files,
            output_files,
            extra,
        })
    }

    pub fn run(&self) -> &str {
        &self.run
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn input_files(&self) -> &BTreeMap<String, String> {
        &self.input_files
    }

    pub fn output_files(&self) -> &BTreeMap<String, String> {
        &self.output_files
    }

    pub fn extra(&self) -> &BTreeMap<String, Value> {
        &self.extra
    }

    pub fn stat_url(&self) -> &str {
        // presence is checked at construction
        self.output_files.get("stat").map(String::as_str).unwrap_or_default()
    }

    pub fn log_url(&self) -> &str {
        self.output_files.get("log").map(String::as_str).unwrap_or_default()
    }

    /// The config as a flat mapping, typed fields first, metadata after.
    pub fn to_mapping(&self) -> Mapping {
        let mut out = Mapping::new();
        out.insert("run".into(), Value::String(self.run.clone()));
        out.insert("command".into(), Value::String(self.command.clone()));
        out.insert("timeout".into(), Value::Number(self.timeout.into()));
        out.insert("input_files".into(), files_to_value(&self.input_files));
        out.insert("output_files".into(), files_to_value(&self.output_files));
        for (k, v) in &self.extra {
            out.insert(Value::String(k.clone()), v.clone());
        }
        out
    }

    /// Scalar config fields keyed by name. File entries are layered on top of
    /// this by the resolver.
    pub fn scalar_namespace(&self) -> Namespace {
        let mut ns = Namespace::new();
        for (k, v) in &self.extra {
            if let Some(scalar) = Scalar::from_yaml(v) {
                ns.insert(k.clone(), scalar);
            }
        }
        ns.insert("run".to_string(), Scalar::Str(self.run.clone()));
        ns.insert("command".to_string(), Scalar::Str(self.command.clone()));
        ns.insert("timeout".to_string(), Scalar::Int(self.timeout as i64));
        ns
    }
}

fn validate_required_fields(map: &Mapping) -> Result<()> {
    let mut missing = Vec::new();
    for key in REQUIRED_FIELDS {
        if !map.contains_key(*key) {
            missing.push(key.to_string());
        }
    }
    match map.get("output_files") {
        Some(Value::Mapping(outputs)) => {
            for key in REQUIRED_OUTPUTS {
                if !outputs.contains_key(*key) {
                    missing.push(format!("output_files.{}", key));
                }
            }
        }
        Some(_) => {
            return Err(HarnessError::Config(
                "'output_files' must be a mapping".to_string(),
            ))
        }
        None => {}
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(HarnessError::Config(format!(
            "job config missing required fields:\n{}",
            missing
                .iter()
                .map(|k| format!("  - {}", k))
                .collect::<Vec<_>>()
                .join("\n")
        )))
    }
}

fn parse_timeout(value: &Value) -> Result<u64> {
    let secs = match value {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Some(u)
            } else {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f.trunc() as u64)
            }
        }
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match secs {
        Some(0) => Err(HarnessError::Config(
            "timeout must be a positive number of seconds".to_string(),
        )),
        Some(secs) => Ok(secs),
        None => Err(HarnessError::Config(format!(
            "timeout must be an integer number of seconds, found {}",
            serde_yaml::to_string(value)
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| value_type_name(value).to_string())
        ))),
    }
}

fn file_map(map: &Mapping, key: &str) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    let entries = match map.get(key) {
        Some(Value::Mapping(entries)) => entries,
        Some(Value::Null) | None => return Ok(files),
        Some(_) => {
            return Err(HarnessError::Config(format!("'{}' must be a mapping", key)));
        }
    };
    for (name, url) in entries {
        let name = scalar_to_string(name)
            .ok_or_else(|| HarnessError::Config(format!("{} has a non-scalar key", key)))?;
        let url = match url {
            Value::String(s) => s.clone(),
            _ => {
                return Err(HarnessError::Config(format!(
                    "{}.{} must be a URL string",
                    key, name
                )))
            }
        };
        files.insert(name, url);
    }
    Ok(files)
}

fn files_to_value(files: &BTreeMap<String, String>) -> Value {
    let mut map = Mapping::new();
    for (k, v) in files {
        map.insert(Value::String(k.clone()), Value::String(v.clone()));
    }
    Value::Mapping(map)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub(crate) fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}
