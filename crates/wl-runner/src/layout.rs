//! Where a run's work-queue files live.
//!
//! ```text
//! <root>/<run>/runconfig.yaml
//! <root>/<run>/<unit>.yaml                         run manifest
//! <root>/<run>/<unit>-check.yaml                   check manifest
//! <root>/<run>/byccd/<run>-<unit>-<NN>-config.yaml per sub-unit job config
//! <root>/<run>/byccd/<run>-<unit>-<NN>-check.json  per sub-unit check report
//! <root>/<run>/goodlist.yaml, badlist.yaml         collated verdicts
//! ```

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use crate::error::{HarnessError, Result};

pub const CONFIG_SUFFIX: &str = "-config.yaml";
pub const CHECK_SUFFIX: &str = "-check.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WqLayout {
    root: PathBuf,
}

impl WqLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$WL_WQ_DIR`, else `~/des-wq`.
    pub fn from_env() -> Self {
        if let Some(dir) = std::env::var_os("WL_WQ_DIR") {
            return Self::new(dir);
        }
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join("des-wq"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run: &str) -> PathBuf {
        self.root.join(run)
    }

    pub fn byccd_dir(&self, run: &str) -> PathBuf {
        self.run_dir(run).join("byccd")
    }

    pub fn runconfig_path(&self, run: &str) -> PathBuf {
        self.run_dir(run).join("runconfig.yaml")
    }

    pub fn job_file(&self, run: &str, unit: &str) -> PathBuf {
        self.run_dir(run).join(format!("{}.yaml", unit))
    }

    pub fn check_job_file(&self, run: &str, unit: &str) -> PathBuf {
        let job_file = self.job_file(run, unit);
        let name = job_file
            .file_name()
            .map(|n| n.to_string_lossy().replace(".yaml", "-check.yaml"))
            .unwrap_or_else(|| format!("{}-check.yaml", unit));
        job_file.with_file_name(name)
    }

    pub fn config_path(&self, run: &str, unit: &str, sub: u32, width: usize) -> PathBuf {
        self.byccd_dir(run)
            .join(format!("{}-{}-{:0w$}{}", run, unit, sub, CONFIG_SUFFIX, w = width))
    }

    pub fn check_report_path(&self, run: &str, unit: &str, sub: u32, width: usize) -> PathBuf {
        self.byccd_dir(run)
            .join(format!("{}-{}-{:0w$}{}", run, unit, sub, CHECK_SUFFIX, w = width))
    }

    pub fn goodlist_path(&self, run: &str) -> PathBuf {
        self.run_dir(run).join("goodlist.yaml")
    }

    pub fn badlist_path(&self, run: &str) -> PathBuf {
        self.run_dir(run).join("badlist.yaml")
    }
}

/// Zero-padded width of sub-unit indices, matching `seq -w`.
pub fn sub_unit_width(range: &RangeInclusive<u32>) -> usize {
    let digits = |n: u32| n.to_string().len();
    digits(*range.start()).max(digits(*range.end()))
}

/// Run, unit and group names end up in paths and in generated shell lines,
/// so they are limited to ASCII alphanumerics and `-_.`, without a leading
/// dot.
pub fn check_name(field: &str, value: &str) -> Result<()> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if value.is_empty() || value.starts_with('.') || !value.chars().all(allowed) {
        return Err(HarnessError::Config(format!(
            "invalid {} name '{}': use letters, digits, '-', '_' or '.'",
            field, value
        )));
    }
    Ok(())
}

/// The check report that belongs to a sub-unit config file.
pub fn check_report_for(config_path: &Path) -> Option<PathBuf> {
    let name = config_path.file_name()?.to_str()?;
    let stem = name.strip_suffix(CONFIG_SUFFIX)?;
    Some(config_path.with_file_name(format!("{}{}", stem, CHECK_SUFFIX)))
}
