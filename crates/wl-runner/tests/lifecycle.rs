use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde_yaml::Value;
use wl_runner::{
    exit_status_of, read_status, JobConfig, JobProcessor, JobState, MirrorStore, ProcessRunner,
    EXIT_STATUS_ERROR, EXIT_STATUS_TIMEOUT,
};

struct Workspace {
    root: PathBuf,
    store: MirrorStore,
}

impl Workspace {
    fn new(tag: &str) -> Self {
        let root = std::env::temp_dir().join(format!(
            "wl_lifecycle_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).unwrap();
        let store = MirrorStore::new(root.join("remote"), root.join("scratch"));
        Self { root, store }
    }

    fn remote(&self, url: &str) -> PathBuf {
        self.store.mirror_path(url).unwrap()
    }

    fn put_remote(&self, url: &str, contents: &str) {
        let path = self.remote(url);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn local(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn scratch_is_empty(&self) -> bool {
        let scratch = self.root.join("scratch");
        !scratch.exists()
            || fs::read_dir(&scratch)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false)
    }

    /// Config with a remote `image`, a local `cat`, remote `stat` and `log`
    /// and a local `shear` output.
    fn config(&self, command: &str, timeout: u64) -> JobConfig {
        let text = format!(
            r#"
run: wlse0001
expname: decam-000123
ccd: 3
command: '{command}'
timeout: {timeout}
input_files:
  image: hdfs:///des/red/exp_03.fits
  cat: {cat}
output_files:
  stat: hdfs:///des/wl/exp_03-stat.yaml
  log: hdfs:///des/wl/exp_03.log
  shear: {shear}
"#,
            command = command,
            timeout = timeout,
            cat = self.local("exp_03.cat").display(),
            shear = self.local("out/exp_03-shear.txt").display(),
        );
        JobConfig::from_yaml_str(&text).expect("valid config")
    }

    fn status(&self) -> serde_yaml::Mapping {
        read_status(&self.remote("hdfs:///des/wl/exp_03-stat.yaml")).expect("status record")
    }

    fn shipped_log(&self) -> String {
        fs::read_to_string(self.remote("hdfs:///des/wl/exp_03.log")).expect("shipped log")
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn fast_runner() -> ProcessRunner {
    ProcessRunner::default().with_poll_interval(Duration::from_millis(10))
}

#[test]
fn successful_job_records_and_ships_everything() {
    let ws = Workspace::new("ok");
    ws.put_remote("hdfs:///des/red/exp_03.fits", "pixels\n");
    fs::write(ws.local("exp_03.cat"), "objects\n").unwrap();

    let config = ws.config("cat %(image)s %(cat)s > %(shear)s; echo ccd=%(ccd)02d", 60);
    let outcome = JobProcessor::new(config, &ws.store)
        .unwrap()
        .with_runner(fast_runner())
        .run()
        .expect("job ran");

    assert!(outcome.succeeded(), "{:?}", outcome);
    assert_eq!(outcome.state, JobState::Done);
    assert!(outcome.cleanup.is_clean(), "{:?}", outcome.cleanup);

    let status = ws.status();
    assert_eq!(exit_status_of(&status), Some(0));
    assert_eq!(status.get("expname"), Some(&Value::String("decam-000123".into())));
    assert_eq!(
        fs::read_to_string(ws.local("out/exp_03-shear.txt")).unwrap(),
        "pixels\nobjects\n"
    );

    let log = ws.shipped_log();
    assert!(log.contains("staging: hdfs:///des/red/exp_03.fits"), "{}", log);
    assert!(log.contains("ccd=03"), "{}", log);
    assert!(log.contains("exit_status: 0"), "{}", log);
    assert!(log.contains("removing: "), "{}", log);
    assert!(log.contains("putting: "), "{}", log);

    assert!(ws.local("exp_03.cat").exists(), "local inputs are left alone");
    assert!(ws.scratch_is_empty(), "scratch copies should be gone");
}

#[test]
fn signal_death_is_recorded_as_negative_signal() {
    let ws = Workspace::new("signal");
    ws.put_remote("hdfs:///des/red/exp_03.fits", "pixels\n");
    fs::write(ws.local("exp_03.cat"), "objects\n").unwrap();

    let outcome = JobProcessor::new(ws.config("kill -9 $$", 60), &ws.store)
        .unwrap()
        .with_runner(fast_runner())
        .run()
        .unwrap();

    assert_eq!(outcome.exit_status, -9);
    assert!(!outcome.succeeded());
    assert_eq!(exit_status_of(&ws.status()), Some(-9));
    assert!(ws.scratch_is_empty());
}

#[test]
fn timeout_kills_the_command_and_records_the_sentinel() {
    let ws = Workspace::new("timeout");
    ws.put_remote("hdfs:///des/red/exp_03.fits", "pixels\n");
    fs::write(ws.local("exp_03.cat"), "objects\n").unwrap();

    let started = std::time::Instant::now();
    let outcome = JobProcessor::new(ws.config("echo before; sleep 30; echo after", 1), &ws.store)
        .unwrap()
        .with_runner(fast_runner())
        .run()
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(15));
    assert!(outcome.timed_out);
    assert_eq!(outcome.exit_status, EXIT_STATUS_TIMEOUT);
    let status = ws.status();
    assert_eq!(exit_status_of(&status), Some(EXIT_STATUS_TIMEOUT as i64));
    assert_eq!(status.get("timed_out"), Some(&Value::Bool(true)));
    let log = ws.shipped_log();
    assert!(log.contains("before"), "{}", log);
    assert!(!log.contains("after"), "{}", log);
}

#[test]
fn staging_failure_leaves_no_record_and_no_scratch() {
    let ws = Workspace::new("stage_fail");
    fs::write(ws.local("exp_03.cat"), "objects\n").unwrap();

    let err = JobProcessor::new(ws.config("true", 60), &ws.store)
        .unwrap()
        .with_runner(fast_runner())
        .run()
        .expect_err("remote image is missing");

    assert!(err.is_staging(), "{}", err);
    assert!(!ws.remote("hdfs:///des/wl/exp_03-stat.yaml").exists());
    assert!(ws.scratch_is_empty(), "staging failure left files in scratch");
    let log = ws.shipped_log();
    assert!(log.contains("staging failed: hdfs:///des/red/exp_03.fits"), "{}", log);
    assert!(log.contains("no status record written"), "{}", log);
}

fn shared_psf_config(ccd: &str, command: &str) -> JobConfig {
    JobConfig::from_yaml_str(&format!(
        r#"
run: wlse0001
command: '{command}'
input_files:
  psf: hdfs:///des/cal/common-psf.fits
output_files:
  stat: hdfs:///des/wl/exp_03-{ccd}-stat.yaml
  log: hdfs:///des/wl/exp_03-{ccd}.log
"#,
        command = command,
        ccd = ccd,
    ))
    .expect("valid config")
}

#[test]
fn concurrent_units_sharing_an_input_do_not_clobber_each_other() {
    let ws = Workspace::new("shared_input");
    ws.put_remote("hdfs:///des/cal/common-psf.fits", "psf model\n");

    let (slow, fast) = std::thread::scope(|scope| {
        let slow = scope.spawn(|| {
            JobProcessor::new(shared_psf_config("ccdB", "sleep 1; cat %(psf)s"), &ws.store)
                .unwrap()
                .with_runner(fast_runner())
                .run()
                .unwrap()
        });
        std::thread::sleep(Duration::from_millis(200));
        let fast = scope.spawn(|| {
            JobProcessor::new(shared_psf_config("ccdA", "cat %(psf)s"), &ws.store)
                .unwrap()
                .with_runner(fast_runner())
                .run()
                .unwrap()
        });
        (slow.join().unwrap(), fast.join().unwrap())
    });

    assert_eq!(fast.exit_status, 0, "{:?}", fast);
    assert_eq!(slow.exit_status, 0, "{:?}", slow);
    let slow_log = fs::read_to_string(ws.remote("hdfs:///des/wl/exp_03-ccdB.log")).unwrap();
    assert!(slow_log.contains("psf model"), "{}", slow_log);
    let fast_log = fs::read_to_string(ws.remote("hdfs:///des/wl/exp_03-ccdA.log")).unwrap();
    assert!(fast_log.contains("psf model"), "{}", fast_log);
    assert!(ws.scratch_is_empty());
}

#[test]
fn interpolation_failure_touches_nothing() {
    let ws = Workspace::new("interp");
    ws.put_remote("hdfs:///des/red/exp_03.fits", "pixels\n");

    let err = JobProcessor::new(ws.config("measure %(psf)s", 60), &ws.store)
        .err()
        .expect("psf is undefined");

    assert!(err.is_interpolation());
    assert!(!ws.root.join("scratch").exists());
    assert!(!ws.local("out").exists());
}

#[test]
fn launch_failure_is_recorded_as_error_sentinel() {
    let ws = Workspace::new("launch");
    ws.put_remote("hdfs:///des/red/exp_03.fits", "pixels\n");
    fs::write(ws.local("exp_03.cat"), "objects\n").unwrap();

    let outcome = JobProcessor::new(ws.config("true", 60), &ws.store)
        .unwrap()
        .with_runner(fast_runner().with_shell("/nonexistent/shell"))
        .run()
        .unwrap();

    assert_eq!(outcome.exit_status, EXIT_STATUS_ERROR);
    assert_eq!(outcome.state, JobState::Done);
    assert!(outcome.execution_error.is_some());
    assert_eq!(exit_status_of(&ws.status()), Some(EXIT_STATUS_ERROR as i64));
    assert!(ws.shipped_log().contains("execution failed"));
    assert!(ws.scratch_is_empty());
}

#[test]
fn missing_output_is_a_warning_not_a_failure() {
    let ws = Workspace::new("missing_out");
    ws.put_remote("hdfs:///des/red/exp_03.fits", "pixels\n");
    fs::write(ws.local("exp_03.cat"), "objects\n").unwrap();
    let config = JobConfig::from_yaml_str(
        r#"
run: wlse0001
command: "true"
input_files:
  image: hdfs:///des/red/exp_03.fits
output_files:
  stat: hdfs:///des/wl/exp_03-stat.yaml
  log: hdfs:///des/wl/exp_03.log
  shear: hdfs:///des/wl/exp_03-shear.fits
"#,
    )
    .unwrap();

    let outcome = JobProcessor::new(config, &ws.store)
        .unwrap()
        .with_runner(fast_runner())
        .run()
        .unwrap();

    assert_eq!(outcome.exit_status, 0);
    assert_eq!(outcome.cleanup.warnings.len(), 1);
    assert!(!ws.remote("hdfs:///des/wl/exp_03-shear.fits").exists());
    assert!(ws.shipped_log().contains("local file not found"));
}
