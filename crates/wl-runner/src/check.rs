//! Post-run verification of a single unit.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::JobConfig;
use crate::error::{HarnessError, Result};
use crate::remote::{is_remote_url, url_file_name, RemoteStore};
use crate::status::{exit_status_of, read_status};

/// What the check tool found for one unit. Written as JSON next to the
/// unit's config so the collator can read it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub run: String,
    pub stat: String,
    pub stat_found: bool,
    pub exit_status: Option<i64>,
    #[serde(default)]
    pub missing_outputs: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub ok: bool,
}

impl CheckReport {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| HarnessError::io(path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Inspect a unit's status record and outputs. Problems are reported in the
/// returned value rather than raised.
pub fn check_unit(config: &JobConfig, store: &dyn RemoteStore) -> CheckReport {
    let stat = config.stat_url().to_string();
    let mut report = CheckReport {
        run: config.run().to_string(),
        stat: stat.clone(),
        stat_found: false,
        exit_status: None,
        missing_outputs: Vec::new(),
        error: None,
        ok: false,
    };

    match stat_presence(&stat, store) {
        Ok(true) => {
            report.stat_found = true;
            match read_stat(&stat, store) {
                Ok(Some(exit_status)) => report.exit_status = Some(exit_status),
                Ok(None) => report.error = Some("status record has no exit_status".to_string()),
                Err(e) => report.error = Some(e.to_string()),
            }
        }
        Ok(false) => {}
        // the record may exist; this unit is unverified, not never-ran
        Err(e) => report.error = Some(format!("could not look for {}: {}", stat, e)),
    }

    for (name, url) in config.output_files() {
        if name == "stat" || url.is_empty() {
            continue;
        }
        let present = if is_remote_url(url) {
            match store.exists(url) {
                Ok(present) => present,
                Err(e) => {
                    tracing::warn!(%url, error = %e, "existence check failed");
                    report
                        .error
                        .get_or_insert_with(|| format!("could not look for {}: {}", url, e));
                    continue;
                }
            }
        } else {
            Path::new(url).exists()
        };
        if !present {
            report.missing_outputs.push(name.clone());
        }
    }

    report.ok = report.stat_found
        && report.exit_status == Some(0)
        && report.missing_outputs.is_empty()
        && report.error.is_none();
    tracing::info!(run = %report.run, ok = report.ok, exit_status = ?report.exit_status, "checked unit");
    report
}

fn stat_presence(stat: &str, store: &dyn RemoteStore) -> Result<bool> {
    if is_remote_url(stat) {
        store.exists(stat)
    } else {
        Ok(Path::new(stat).exists())
    }
}

/// Read the exit status out of an existing status record. Remote records are
/// staged under a name of the checker's own so a job running the same unit
/// keeps its local copy.
fn read_stat(stat: &str, store: &dyn RemoteStore) -> Result<Option<i64>> {
    if !is_remote_url(stat) {
        return Ok(exit_status_of(&read_status(Path::new(stat))?));
    }

    let local = store
        .scratch_dir()
        .join(format!("check-{}-{}", std::process::id(), url_file_name(stat)?));
    store.stage(stat, &local)?;
    let status = read_status(&local);
    if let Err(e) = store.cleanup(&local) {
        tracing::warn!(path = %local.display(), error = %e, "failed to remove staged status");
    }
    Ok(exit_status_of(&status?))
}
