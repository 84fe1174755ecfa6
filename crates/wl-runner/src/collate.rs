//! Reduce a run's check reports into good and bad lists.

use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::check::CheckReport;
use crate::error::{HarnessError, Result};
use crate::fsutil::atomic_write_bytes;
use crate::layout::{check_report_for, WqLayout, CONFIG_SUFFIX};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BadUnit {
    pub config: String,
    pub exit_status: Option<i64>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Collation {
    pub good: Vec<String>,
    /// Ran but failed, or its outputs are incomplete.
    pub bad: Vec<BadUnit>,
    /// No status record exists.
    pub never_ran: Vec<String>,
    /// No usable check report exists.
    pub unchecked: Vec<String>,
}

impl Collation {
    pub fn total(&self) -> usize {
        self.good.len() + self.bad.len() + self.never_ran.len() + self.unchecked.len()
    }

    /// Everything that is not good, as written to the bad list.
    pub fn badlist(&self) -> Vec<BadUnit> {
        let mut out = self.bad.clone();
        out.extend(self.never_ran.iter().map(|config| BadUnit {
            config: config.clone(),
            exit_status: None,
            reason: "never ran".to_string(),
        }));
        out.extend(self.unchecked.iter().map(|config| BadUnit {
            config: config.clone(),
            exit_status: None,
            reason: "no check report".to_string(),
        }));
        out
    }

    /// Write `goodlist.yaml` and `badlist.yaml` into the run directory.
    pub fn write(&self, layout: &WqLayout, run: &str) -> Result<(PathBuf, PathBuf)> {
        let good = layout.goodlist_path(run);
        let bad = layout.badlist_path(run);
        atomic_write_bytes(&good, serde_yaml::to_string(&self.good)?.as_bytes())?;
        atomic_write_bytes(&bad, serde_yaml::to_string(&self.badlist())?.as_bytes())?;
        tracing::info!(
            run,
            good = self.good.len(),
            bad = self.total() - self.good.len(),
            "wrote collation"
        );
        Ok((good, bad))
    }
}

/// Classify every sub-unit config under the run's `byccd/` directory by its
/// check report.
pub fn collate(layout: &WqLayout, run: &str) -> Result<Collation> {
    let byccd = layout.byccd_dir(run);
    if !byccd.is_dir() {
        return Err(HarnessError::Config(format!(
            "no sub-unit configs for run {}: {} is not a directory",
            run,
            byccd.display()
        )));
    }

    let mut configs = Vec::new();
    for entry in WalkDir::new(&byccd).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| HarnessError::Config(format!("walking {}: {}", byccd.display(), e)))?;
        let is_config = entry
            .file_name()
            .to_str()
            .map(|n| n.ends_with(CONFIG_SUFFIX))
            .unwrap_or(false);
        if entry.file_type().is_file() && is_config {
            configs.push(entry.into_path());
        }
    }
    configs.sort();

    let mut collation = Collation::default();
    for config in configs {
        classify(&config, &mut collation);
    }
    Ok(collation)
}

fn classify(config: &Path, collation: &mut Collation) {
    let name = config.display().to_string();
    let report = check_report_for(config).and_then(|path| match CheckReport::load(&path) {
        Ok(report) => Some(report),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "unusable check report");
            None
        }
    });
    match report {
        None => collation.unchecked.push(name),
        Some(report) if !report.stat_found && report.error.is_some() => {
            collation.unchecked.push(name)
        }
        Some(report) if !report.stat_found => collation.never_ran.push(name),
        Some(report) if report.ok => collation.good.push(name),
        Some(report) => {
            let reason = if let Some(error) = report.error {
                error
            } else if report.exit_status != Some(0) {
                "nonzero exit status".to_string()
            } else {
                format!("missing outputs: {}", report.missing_outputs.join(", "))
            };
            collation.bad.push(BadUnit {
                config: name,
                exit_status: report.exit_status,
                reason,
            });
        }
    }
}
