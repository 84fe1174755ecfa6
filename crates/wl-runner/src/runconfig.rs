use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

/// Settings shared by every unit of a run: the shell preamble each manifest
/// executes before the sub-unit loop, plus scheduler defaults.
///
/// ```yaml
/// run: wlse0001
/// setup:
///   - source /opt/astro/SL53/bin/setup.hadoop.sh
///   - source ~astrodat/setup/setup.sh
/// modules:
///   wl: v1.2
///   esutil: v0.4
/// groups: [gen4, gen5]
/// priority: med
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub run: String,
    #[serde(default)]
    pub setup: Vec<String>,
    #[serde(default)]
    pub modules: BTreeMap<String, String>,
    #[serde(default)]
    pub groups: Option<Vec<String>>,
    #[serde(default)]
    pub priority: Option<String>,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
        let config: Self = serde_yaml::from_str(&text)?;
        if config.run.trim().is_empty() {
            return Err(HarnessError::Config(format!(
                "run config {} has an empty 'run'",
                path.display()
            )));
        }
        Ok(config)
    }

    /// Setup lines followed by one `module load` per module, sorted by name.
    pub fn preamble(&self) -> Vec<String> {
        let mut lines = self.setup.clone();
        lines.extend(
            self.modules
                .iter()
                .map(|(name, version)| format!("module load {}/{}", name, version)),
        );
        lines
    }
}
