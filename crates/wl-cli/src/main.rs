mod logging;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use wl_runner::{
    HdfsStore, JobConfig, JobOutcome, JobProcessor, ManifestGenerator, ManifestKind,
    ManifestRequest, MirrorStore, RemoteStore, RunConfig, WqLayout,
};

#[derive(Parser)]
#[command(name = "wl", version = "0.3.0", about = "Per-unit batch job harness")]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    #[value(name = "run")]
    Run,
    #[value(name = "check")]
    Check,
    #[value(name = "both")]
    Both,
}

impl KindArg {
    fn kinds(self) -> Vec<ManifestKind> {
        match self {
            KindArg::Run => vec![ManifestKind::Run],
            KindArg::Check => vec![ManifestKind::Check],
            KindArg::Both => vec![ManifestKind::Run, ManifestKind::Check],
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Stage, execute, record and clean up one unit.
    Run {
        config: PathBuf,
        #[arg(long)]
        scratch_dir: Option<PathBuf>,
        /// Serve hdfs urls from this local directory instead of hadoop.
        #[arg(long)]
        mirror: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Verify one unit and print its check report as JSON.
    Check {
        config: PathBuf,
        #[arg(long)]
        scratch_dir: Option<PathBuf>,
        #[arg(long)]
        mirror: Option<PathBuf>,
    },
    /// Write the work-queue manifests for one unit.
    GenWq {
        run: String,
        unit: String,
        #[arg(long, default_value_t = 1)]
        first: u32,
        #[arg(long, default_value_t = 62)]
        last: u32,
        #[arg(long = "group")]
        groups: Vec<String>,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long, value_enum, default_value = "both")]
        kind: KindArg,
        #[arg(long)]
        wq_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Write one job config per sub-unit from a template.
    GenConfigs {
        run: String,
        unit: String,
        #[arg(long)]
        template: PathBuf,
        #[arg(long, default_value_t = 1)]
        first: u32,
        #[arg(long, default_value_t = 62)]
        last: u32,
        #[arg(long)]
        wq_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Classify a run's units from their check reports.
    Collate {
        run: String,
        #[arg(long)]
        wq_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            scratch_dir,
            mirror,
            json,
        } => {
            let store = remote_store(mirror, scratch_dir);
            let job = JobConfig::load(&config)?;
            tracing::info!(config = %config.display(), run = %job.run(), "running unit");
            let outcome = JobProcessor::new(job, store.as_ref())?.run()?;
            if let Some(err) = &outcome.record_error {
                return Err(anyhow::anyhow!(format!(
                    "status record not written to {}: {}",
                    outcome.status_path.display(),
                    err
                )));
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "config": config.display().to_string(),
                    "outcome": outcome_to_json(&outcome),
                })));
            }
            println!("exit_status: {}", outcome.exit_status);
            if outcome.timed_out {
                println!("timed_out: true");
            }
            if let Some(err) = &outcome.execution_error {
                println!("execution_error: {}", err);
            }
            for warning in &outcome.cleanup.warnings {
                println!("warning: {}", warning);
            }
        }
        Commands::Check {
            config,
            scratch_dir,
            mirror,
        } => {
            let store = remote_store(mirror, scratch_dir);
            let job = JobConfig::load(&config)?;
            let report = wl_runner::check_unit(&job, store.as_ref());
            return Ok(Some(serde_json::to_value(&report)?));
        }
        Commands::GenWq {
            run,
            unit,
            first,
            last,
            groups,
            priority,
            kind,
            wq_dir,
            json,
        } => {
            let layout = wq_layout(wq_dir);
            let mut request = ManifestRequest::new(&run, &unit).with_sub_units(first..=last);
            let mut generator = ManifestGenerator::new(layout.clone());
            if let Some(run_config) = load_run_config(&layout.runconfig_path(&run))? {
                request = request.with_run_defaults(&run_config);
                generator = generator.with_preamble(run_config.preamble());
            }
            if !groups.is_empty() {
                request = request.with_groups(groups);
            }
            if let Some(priority) = priority {
                request = request.with_priority(priority);
            }
            let mut written = Vec::new();
            for kind in kind.kinds() {
                written.push(generator.write(&request, kind)?);
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "gen-wq",
                    "run": run,
                    "unit": unit,
                    "job_files": paths_to_json(&written),
                })));
            }
            for path in written {
                println!("wrote: {}", path.display());
            }
        }
        Commands::GenConfigs {
            run,
            unit,
            template,
            first,
            last,
            wq_dir,
            json,
        } => {
            let layout = wq_layout(wq_dir);
            let text = std::fs::read_to_string(&template).map_err(|e| {
                anyhow::anyhow!(format!("failed to read {}: {}", template.display(), e))
            })?;
            let template_value: serde_yaml::Value = serde_yaml::from_str(&text)?;
            let written =
                wl_runner::write_sub_unit_configs(&layout, &template_value, &run, &unit, first..=last)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "gen-configs",
                    "run": run,
                    "unit": unit,
                    "configs": paths_to_json(&written),
                })));
            }
            println!("wrote {} configs under {}", written.len(), layout.byccd_dir(&run).display());
        }
        Commands::Collate { run, wq_dir, json } => {
            let layout = wq_layout(wq_dir);
            let collation = wl_runner::collate(&layout, &run)?;
            let (goodlist, badlist) = collation.write(&layout, &run)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "collate",
                    "run": run,
                    "collation": serde_json::to_value(&collation)?,
                    "goodlist": goodlist.display().to_string(),
                    "badlist": badlist.display().to_string(),
                })));
            }
            println!("units: {}", collation.total());
            println!("good: {}", collation.good.len());
            println!("bad: {}", collation.bad.len());
            println!("never_ran: {}", collation.never_ran.len());
            println!("unchecked: {}", collation.unchecked.len());
            println!("goodlist: {}", goodlist.display());
            println!("badlist: {}", badlist.display());
        }
    }
    Ok(None)
}

fn remote_store(mirror: Option<PathBuf>, scratch_dir: Option<PathBuf>) -> Box<dyn RemoteStore> {
    let mut hdfs = HdfsStore::from_env();
    if let Some(dir) = scratch_dir {
        hdfs = hdfs.with_scratch_dir(dir);
    }
    match mirror {
        Some(root) => Box::new(MirrorStore::new(root, hdfs.scratch_dir().to_path_buf())),
        None => Box::new(hdfs),
    }
}

fn wq_layout(wq_dir: Option<PathBuf>) -> WqLayout {
    wq_dir.map(WqLayout::new).unwrap_or_else(WqLayout::from_env)
}

fn load_run_config(path: &Path) -> Result<Option<RunConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(RunConfig::load(path)?))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::GenWq { json, .. }
        | Commands::GenConfigs { json, .. }
        | Commands::Collate { json, .. } => *json,
        Commands::Check { .. } => true,
    }
}

fn outcome_to_json(outcome: &JobOutcome) -> Value {
    json!({
        "exit_status": outcome.exit_status,
        "timed_out": outcome.timed_out,
        "execution_error": outcome.execution_error,
        "status_path": outcome.status_path.display().to_string(),
        "state": outcome.state.to_string(),
        "pushed": outcome.cleanup.pushed,
        "warnings": outcome
            .cleanup
            .warnings
            .iter()
            .map(|w| w.to_string())
            .collect::<Vec<_>>(),
    })
}

fn paths_to_json(paths: &[PathBuf]) -> Value {
    Value::Array(
        paths
            .iter()
            .map(|p| Value::String(p.display().to_string()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_errors_use_the_envelope() {
        let err = json_error("command_failed", "boom".to_string(), json!({}));
        assert_eq!(err["ok"], json!(false));
        assert_eq!(err["error"]["code"], json!("command_failed"));
        assert_eq!(err["error"]["message"], json!("boom"));
    }

    #[test]
    fn gen_wq_defaults_cover_every_ccd() {
        let cli = Cli::try_parse_from(["wl", "gen-wq", "wlse0001", "exp001"]).unwrap();
        match cli.command {
            Commands::GenWq {
                first, last, kind, groups, ..
            } => {
                assert_eq!((first, last), (1, 62));
                assert!(groups.is_empty());
                assert_eq!(kind.kinds(), vec![ManifestKind::Run, ManifestKind::Check]);
            }
            _ => panic!("expected gen-wq"),
        }
        assert_eq!(cli.log_level, "warn");
    }

    #[test]
    fn check_always_reports_json() {
        let cli = Cli::try_parse_from(["wl", "check", "byccd/a-config.yaml"]).unwrap();
        assert!(command_json_mode(&cli.command));
    }
}
