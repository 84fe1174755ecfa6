//! Distributed-filesystem collaborator.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::error::{HarnessError, Result};
use crate::fsutil::{ensure_parent_dir, remove_file_if_exists};

pub const REMOTE_PREFIX: &str = "hdfs";

/// A URL is remote iff its first four characters name the distributed
/// filesystem scheme.
pub fn is_remote_url(url: &str) -> bool {
    url.get(..REMOTE_PREFIX.len()) == Some(REMOTE_PREFIX)
}

/// Operations the harness needs from the distributed filesystem.
pub trait RemoteStore {
    /// Root under which staged copies are placed.
    fn scratch_dir(&self) -> &Path;

    /// Where `url` lives while staged locally. Pure: no filesystem access.
    fn local_path(&self, url: &str) -> Result<PathBuf> {
        Ok(self.scratch_dir().join(url_file_name(url)?))
    }

    /// Copy `url` to `local`.
    fn stage(&self, url: &str, local: &Path) -> Result<()>;

    /// Copy `local` to `url`, replacing an existing remote file when `clobber`.
    fn put(&self, local: &Path, url: &str, clobber: bool) -> Result<()>;

    /// Remove the local copy.
    fn cleanup(&self, local: &Path) -> Result<()> {
        remove_file_if_exists(local)
    }

    fn exists(&self, url: &str) -> Result<bool>;
}

/// Last path segment of a remote url.
pub fn url_file_name(url: &str) -> Result<&str> {
    match url.rsplit('/').next() {
        Some(name) if !name.is_empty() && !name.ends_with(':') => Ok(name),
        _ => Err(HarnessError::Config(format!(
            "remote url has no file name: '{}'",
            url
        ))),
    }
}

/// `hadoop fs` backed store. Staged files land in `scratch_dir` under their
/// remote base name.
#[derive(Debug, Clone)]
pub struct HdfsStore {
    scratch_dir: PathBuf,
    hadoop_bin: String,
}

impl HdfsStore {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            hadoop_bin: "hadoop".to_string(),
        }
    }

    /// Scratch from `WL_SCRATCH_DIR` (default `$TMPDIR/wl-scratch`), client
    /// binary from `WL_HADOOP_BIN` (default `hadoop`).
    pub fn from_env() -> Self {
        let scratch = std::env::var_os("WL_SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("wl-scratch"));
        let store = Self::new(scratch);
        match std::env::var("WL_HADOOP_BIN") {
            Ok(bin) if !bin.is_empty() => store.with_hadoop_bin(bin),
            _ => store,
        }
    }

    pub fn with_scratch_dir(mut self, scratch_dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = scratch_dir.into();
        self
    }

    pub fn with_hadoop_bin(mut self, bin: impl Into<String>) -> Self {
        self.hadoop_bin = bin.into();
        self
    }

    fn hadoop_fs(&self, args: &[&str]) -> Result<Output> {
        tracing::debug!(bin = %self.hadoop_bin, ?args, "hadoop fs");
        Command::new(&self.hadoop_bin)
            .arg("fs")
            .args(args)
            .output()
            .map_err(|e| HarnessError::Remote(format!("failed to run {}: {}", self.hadoop_bin, e)))
    }

    fn check(&self, op: &str, target: &str, output: Output) -> Result<()> {
        if output.status.success() {
            return Ok(());
        }
        Err(self.failure(op, target, &output))
    }

    fn failure(&self, op: &str, target: &str, output: &Output) -> HarnessError {
        let stderr_tail = String::from_utf8_lossy(&output.stderr)
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no diagnostic output")
            .to_string();
        HarnessError::Remote(format!(
            "hadoop fs {} {} exited with {}: {}",
            op, target, output.status, stderr_tail
        ))
    }
}

/// Whether the client printed anything besides log4j-style warnings.
fn has_diagnostics(stderr: &[u8]) -> bool {
    String::from_utf8_lossy(stderr)
        .lines()
        .any(|l| !l.trim().is_empty() && !l.contains(" WARN "))
}

impl RemoteStore for HdfsStore {
    fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    fn stage(&self, url: &str, local: &Path) -> Result<()> {
        ensure_parent_dir(local)?;
        // -get refuses to overwrite
        remove_file_if_exists(local)?;
        let local_str = local.to_string_lossy();
        let output = self.hadoop_fs(&["-get", url, &local_str])?;
        self.check("-get", url, output)
    }

    fn put(&self, local: &Path, url: &str, clobber: bool) -> Result<()> {
        let local_str = local.to_string_lossy();
        let mut args = vec!["-put"];
        if clobber {
            args.push("-f");
        }
        args.push(&local_str);
        args.push(url);
        let output = self.hadoop_fs(&args)?;
        self.check("-put", url, output)
    }

    fn exists(&self, url: &str) -> Result<bool> {
        let output = self.hadoop_fs(&["-test", "-e", url])?;
        match output.status.code() {
            Some(0) => Ok(true),
            // the client also exits 1 when it cannot reach the namenode
            Some(1) if !has_diagnostics(&output.stderr) => Ok(false),
            _ => Err(self.failure("-test -e", url, &output)),
        }
    }
}

/// Maps `hdfs://host/path` onto `root/path` on the local filesystem. Used for
/// dry runs and tests.
#[derive(Debug, Clone)]
pub struct MirrorStore {
    root: PathBuf,
    scratch_dir: PathBuf,
}

impl MirrorStore {
    pub fn new(root: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    /// The mirror file standing in for `url`.
    pub fn mirror_path(&self, url: &str) -> Result<PathBuf> {
        let rest = if let Some(after) = url.strip_prefix("hdfs://") {
            match after.find('/') {
                Some(idx) => &after[idx..],
                None => "",
            }
        } else if let Some(after) = url.strip_prefix("hdfs:") {
            after
        } else {
            return Err(HarnessError::Config(format!("not an hdfs url: '{}'", url)));
        };
        let rel = rest.trim_start_matches('/');
        if rel.is_empty() {
            return Err(HarnessError::Config(format!("hdfs url has no path: '{}'", url)));
        }
        Ok(self.root.join(rel))
    }
}

impl RemoteStore for MirrorStore {
    fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    fn stage(&self, url: &str, local: &Path) -> Result<()> {
        let src = self.mirror_path(url)?;
        if !src.is_file() {
            return Err(HarnessError::Remote(format!("no such remote file: {}", url)));
        }
        ensure_parent_dir(local)?;
        fs::copy(&src, local).map_err(|e| HarnessError::io(local, e))?;
        Ok(())
    }

    fn put(&self, local: &Path, url: &str, clobber: bool) -> Result<()> {
        let dst = self.mirror_path(url)?;
        if !clobber && dst.exists() {
            return Err(HarnessError::Remote(format!("remote file exists: {}", url)));
        }
        ensure_parent_dir(&dst)?;
        fs::copy(local, &dst).map_err(|e| HarnessError::io(&dst, e))?;
        Ok(())
    }

    fn exists(&self, url: &str) -> Result<bool> {
        Ok(self.mirror_path(url)?.exists())
    }
}
