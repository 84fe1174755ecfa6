//! Per-sub-unit job configs derived from one template.

use std::ops::RangeInclusive;
use std::path::PathBuf;

use serde_yaml::Value;

use crate::config::JobConfig;
use crate::error::Result;
use crate::fsutil::atomic_write_bytes;
use crate::layout::{check_name, sub_unit_width, WqLayout};

/// Values substituted into a sub-unit template.
struct SubUnitVars<'a> {
    run: &'a str,
    unit: &'a str,
    sub: u32,
    padded: String,
}

impl SubUnitVars<'_> {
    fn text(&self, s: &str) -> String {
        s.replace("{run}", self.run)
            .replace("{unit}", self.unit)
            .replace("{sub}", &self.padded)
    }

    /// A value that is exactly `{sub}` becomes the integer sub-unit, so
    /// `%(ccd)02d` still formats. Anything else is text substitution.
    fn value(&self, s: &str) -> Value {
        if s == "{sub}" {
            Value::Number(self.sub.into())
        } else {
            Value::String(self.text(s))
        }
    }

    fn apply(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.value(s),
            Value::Sequence(items) => Value::Sequence(items.iter().map(|v| self.apply(v)).collect()),
            Value::Mapping(map) => Value::Mapping(
                map.iter()
                    .map(|(k, v)| (self.apply_key(k), self.apply(v)))
                    .collect(),
            ),
            Value::Tagged(tagged) => {
                let mut tagged = tagged.as_ref().clone();
                tagged.value = self.apply(&tagged.value);
                Value::Tagged(Box::new(tagged))
            }
            other => other.clone(),
        }
    }

    fn apply_key(&self, key: &Value) -> Value {
        match key {
            Value::String(s) => Value::String(self.text(s)),
            other => self.apply(other),
        }
    }
}

/// Replace `{run}`, `{unit}` and `{sub}` in every string of `template`,
/// mapping keys included. `{sub}` is zero-padded to `width` inside text; a
/// value consisting of `{sub}` alone is written as the plain integer.
pub fn render_sub_unit_config(template: &Value, run: &str, unit: &str, sub: u32, width: usize) -> Value {
    let vars = SubUnitVars {
        run,
        unit,
        sub,
        padded: format!("{:0w$}", sub, w = width),
    };
    vars.apply(template)
}

/// Write one validated job config per sub-unit under `byccd/`.
///
/// Every config is rendered and validated before the first one is written,
/// so a bad template leaves the directory untouched.
pub fn write_sub_unit_configs(
    layout: &WqLayout,
    template: &Value,
    run: &str,
    unit: &str,
    range: RangeInclusive<u32>,
) -> Result<Vec<PathBuf>> {
    check_name("run", run)?;
    check_name("unit", unit)?;
    let width = sub_unit_width(&range);
    let mut rendered = Vec::new();
    for sub in range {
        let value = render_sub_unit_config(template, run, unit, sub, width);
        let config = JobConfig::from_value(value)?;
        rendered.push((layout.config_path(run, unit, sub, width), config));
    }

    let mut written = Vec::with_capacity(rendered.len());
    for (path, config) in rendered {
        let text = serde_yaml::to_string(&config.to_mapping())?;
        atomic_write_bytes(&path, text.as_bytes())?;
        written.push(path);
    }
    tracing::info!(run, unit, count = written.len(), "wrote sub-unit configs");
    Ok(written)
}
