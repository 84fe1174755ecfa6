//! Work-queue manifests that fan one unit out over its sub-units.

use std::fmt::Write as _;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use crate::error::{HarnessError, Result};
use crate::fsutil::atomic_write_bytes;
use crate::layout::{check_name, sub_unit_width, WqLayout, CHECK_SUFFIX, CONFIG_SUFFIX};
use crate::runconfig::RunConfig;

pub const DEFAULT_PRIORITY: &str = "low";
pub const DEFAULT_SUB_UNITS: RangeInclusive<u32> = 1..=62;
pub const DEFAULT_RUN_PROGRAM: &str = "wl run";
pub const DEFAULT_CHECK_PROGRAM: &str = "wl check";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    /// Process every sub-unit.
    Run,
    /// Verify every sub-unit and write its check report. Runs on any node.
    Check,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRequest {
    pub run: String,
    pub unit: String,
    pub sub_units: RangeInclusive<u32>,
    pub groups: Option<Vec<String>>,
    pub priority: String,
}

impl ManifestRequest {
    pub fn new(run: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            unit: unit.into(),
            sub_units: DEFAULT_SUB_UNITS,
            groups: None,
            priority: DEFAULT_PRIORITY.to_string(),
        }
    }

    pub fn with_sub_units(mut self, sub_units: RangeInclusive<u32>) -> Self {
        self.sub_units = sub_units;
        self
    }

    /// An empty list means no group constraint.
    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = if groups.is_empty() { None } else { Some(groups) };
        self
    }

    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Fill groups and priority from a run config where the request left
    /// them at their defaults.
    pub fn with_run_defaults(mut self, run_config: &RunConfig) -> Self {
        if self.groups.is_none() {
            self.groups = run_config.groups.clone().filter(|g| !g.is_empty());
        }
        if self.priority == DEFAULT_PRIORITY {
            if let Some(priority) = &run_config.priority {
                self.priority = priority.clone();
            }
        }
        self
    }

    fn validate(&self) -> Result<()> {
        check_name("run", &self.run)?;
        check_name("unit", &self.unit)?;
        for group in self.groups.iter().flatten() {
            check_name("group", group)?;
        }
        if self.sub_units.is_empty() {
            return Err(HarnessError::Config(format!(
                "empty sub-unit range {}..={}",
                self.sub_units.start(),
                self.sub_units.end()
            )));
        }
        check_name("priority", &self.priority)?;
        Ok(())
    }
}

/// One scheduler job description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDocument {
    /// Script body, one line per entry, unindented.
    pub command: Vec<String>,
    pub group: Option<Vec<String>>,
    pub priority: String,
    pub job_name: String,
}

impl ManifestDocument {
    /// The scheduler's YAML dialect: `command` as a literal block indented by
    /// four spaces, then `group` (or a blank line), `priority` and `job_name`.
    pub fn render(&self) -> String {
        let mut out = String::from("\ncommand: |\n");
        for line in &self.command {
            if line.is_empty() {
                out.push('\n');
            } else {
                let _ = writeln!(out, "    {}", line);
            }
        }
        out.push('\n');
        if let Some(groups) = &self.group {
            let _ = write!(out, "group: [{}]", groups.join(","));
        }
        out.push('\n');
        let _ = writeln!(out, "priority: {}", self.priority);
        let _ = writeln!(out, "job_name: {}", self.job_name);
        out
    }
}

#[derive(Debug, Clone)]
pub struct ManifestGenerator {
    layout: WqLayout,
    preamble: Vec<String>,
    run_program: String,
    check_program: String,
}

impl ManifestGenerator {
    pub fn new(layout: WqLayout) -> Self {
        Self {
            layout,
            preamble: Vec::new(),
            run_program: DEFAULT_RUN_PROGRAM.to_string(),
            check_program: DEFAULT_CHECK_PROGRAM.to_string(),
        }
    }

    /// Shell lines executed before the sub-unit loop.
    pub fn with_preamble(mut self, preamble: Vec<String>) -> Self {
        self.preamble = preamble;
        self
    }

    pub fn with_programs(mut self, run: impl Into<String>, check: impl Into<String>) -> Self {
        self.run_program = run.into();
        self.check_program = check.into();
        self
    }

    pub fn layout(&self) -> &WqLayout {
        &self.layout
    }

    pub fn job_file(&self, request: &ManifestRequest, kind: ManifestKind) -> PathBuf {
        match kind {
            ManifestKind::Run => self.layout.job_file(&request.run, &request.unit),
            ManifestKind::Check => self.layout.check_job_file(&request.run, &request.unit),
        }
    }

    pub fn generate(&self, request: &ManifestRequest, kind: ManifestKind) -> Result<ManifestDocument> {
        request.validate()?;
        let config = self.loop_path(request, CONFIG_SUFFIX)?;
        let (invocation, group, job_name) = match kind {
            ManifestKind::Run => (
                format!("{} {}", self.run_program, config),
                request.groups.clone(),
                request.unit.clone(),
            ),
            ManifestKind::Check => {
                let report = self.loop_path(request, CHECK_SUFFIX)?;
                (
                    format!("{} {} 1> {}", self.check_program, config, report),
                    None,
                    format!("{}-chk", request.unit),
                )
            }
        };

        let mut command = self.preamble.clone();
        if !command.is_empty() {
            command.push(String::new());
        }
        command.push(format!(
            "for i in `seq -w {} {}`; do",
            request.sub_units.start(),
            request.sub_units.end()
        ));
        command.push("    echo \"ccd: $i\"".to_string());
        command.push(format!("    {}", invocation));
        command.push("done".to_string());

        Ok(ManifestDocument {
            command,
            group,
            priority: request.priority.clone(),
            job_name,
        })
    }

    /// Render and write the manifest, replacing any previous job file.
    pub fn write(&self, request: &ManifestRequest, kind: ManifestKind) -> Result<PathBuf> {
        let doc = self.generate(request, kind)?;
        let path = self.job_file(request, kind);
        atomic_write_bytes(&path, doc.render().as_bytes())?;
        tracing::info!(path = %path.display(), job_name = %doc.job_name, "wrote manifest");
        Ok(path)
    }

    /// `byccd/<file>` for the first sub-unit with its index replaced by `$i`.
    fn loop_path(&self, request: &ManifestRequest, suffix: &str) -> Result<String> {
        let first = *request.sub_units.start();
        let width = sub_unit_width(&request.sub_units);
        let path = self.layout.config_path(&request.run, &request.unit, first, width);
        let segment = format!("-{:0w$}{}", first, CONFIG_SUFFIX, w = width);
        let name = file_name(&path)?;
        let templated = match name.strip_suffix(&segment) {
            Some(stem) => format!("{}-$i{}", stem, suffix),
            None => {
                return Err(HarnessError::Config(format!(
                    "config path {} has no sub-unit segment",
                    path.display()
                )))
            }
        };
        Ok(format!("byccd/{}", templated))
    }
}

fn file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| HarnessError::Config(format!("bad config path {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;

    fn generator() -> ManifestGenerator {
        ManifestGenerator::new(WqLayout::new("/wq")).with_preamble(vec![
            "source ~/setup.sh".to_string(),
            "module load wl/v1.2".to_string(),
        ])
    }

    #[test]
    fn run_manifest_matches_scheduler_layout() {
        let request = ManifestRequest::new("wlse0001", "exp001");
        let text = generator()
            .generate(&request, ManifestKind::Run)
            .expect("generate")
            .render();
        let expected = "
command: |
    source ~/setup.sh
    module load wl/v1.2

    for i in `seq -w 1 62`; do
        echo \"ccd: $i\"
        wl run byccd/wlse0001-exp001-$i-config.yaml
    done


priority: low
job_name: exp001
";
        assert_eq!(text, expected);
    }

    #[test]
    fn groups_render_as_a_list_directive() {
        let request = ManifestRequest::new("wlse0001", "exp001")
            .with_groups(vec!["gen4".into(), "gen5".into()])
            .with_priority("med");
        let text = generator().generate(&request, ManifestKind::Run).unwrap().render();
        assert!(text.contains("    done\n\ngroup: [gen4,gen5]\npriority: med\n"), "{}", text);
    }

    #[test]
    fn check_manifest_ignores_groups() {
        let request = ManifestRequest::new("wlse0001", "exp001")
            .with_groups(vec!["gen4".into()])
            .with_sub_units(1..=9);
        let gen = generator();
        let doc = gen.generate(&request, ManifestKind::Check).unwrap();
        assert_eq!(doc.group, None);
        assert_eq!(doc.job_name, "exp001-chk");
        assert!(doc.command.contains(&"for i in `seq -w 1 9`; do".to_string()));
        assert!(doc.command.contains(
            &"    wl check byccd/wlse0001-exp001-$i-config.yaml 1> byccd/wlse0001-exp001-$i-check.json"
                .to_string()
        ));
        assert_eq!(
            gen.job_file(&request, ManifestKind::Check),
            PathBuf::from("/wq/wlse0001/exp001-check.yaml")
        );
    }

    #[test]
    fn empty_range_is_rejected() {
        #[allow(clippy::reversed_empty_ranges)]
        let request = ManifestRequest::new("wlse0001", "exp001").with_sub_units(5..=1);
        let err = generator().generate(&request, ManifestKind::Run).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn names_that_would_break_the_script_are_rejected() {
        for unit in ["exp 001", "exp/001", "exp;rm", "$(x)"] {
            let request = ManifestRequest::new("wlse0001", unit);
            let err = generator().generate(&request, ManifestKind::Run).unwrap_err();
            assert!(err.is_config(), "{}", unit);
        }
        let request = ManifestRequest::new("wlse0001", "exp001").with_groups(vec!["gen4 gen5".into()]);
        assert!(generator().generate(&request, ManifestKind::Run).is_err());
    }

    #[test]
    fn write_is_idempotent() {
        let root = std::env::temp_dir().join(format!(
            "wl_manifest_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let gen = ManifestGenerator::new(WqLayout::new(&root));
        let request = ManifestRequest::new("wlse0001", "exp001");
        let path = gen.write(&request, ManifestKind::Run).unwrap();
        let first = fs::read(&path).unwrap();
        fs::write(&path, "stale").unwrap();
        assert_eq!(gen.write(&request, ManifestKind::Run).unwrap(), path);
        assert_eq!(fs::read(&path).unwrap(), first);
        let _ = fs::remove_dir_all(&root);
    }
}
