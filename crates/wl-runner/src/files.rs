use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::JobConfig;
use crate::error::{HarnessError, Result};
use crate::remote::{is_remote_url, url_file_name, RemoteStore};
use crate::template::{Namespace, Scalar};

/// One input or output of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    remote_url: Option<String>,
    local_path: PathBuf,
}

impl FileEntry {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            remote_url: None,
            local_path: path.into(),
        }
    }

    pub fn remote(url: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            remote_url: Some(url.into()),
            local_path: local_path.into(),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.remote_url.is_some()
    }

    pub fn remote_url(&self) -> Option<&str> {
        self.remote_url.as_deref()
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }
}

pub type FileMap = BTreeMap<String, FileEntry>;

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct FileSetResolver<'a> {
    store: &'a dyn RemoteStore,
    scratch: Option<PathBuf>,
}

impl<'a> FileSetResolver<'a> {
    pub fn new(store: &'a dyn RemoteStore) -> Self {
        Self {
            store,
            scratch: None,
        }
    }

    /// Stage remote files into `dir` instead of the store's shared scratch.
    pub fn within(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch = Some(dir.into());
        self
    }

    pub fn resolve(&self, urls: &BTreeMap<String, String>) -> Result<FileMap> {
        let mut files = FileMap::new();
        let mut claimed: BTreeMap<PathBuf, &str> = BTreeMap::new();
        for (name, url) in urls {
            if url.trim().is_empty() {
                return Err(HarnessError::Config(format!("file '{}' has an empty url", name)));
            }
            let entry = if is_remote_url(url) {
                let local = match &self.scratch {
                    Some(dir) => dir.join(url_file_name(url)?),
                    None => self.store.local_path(url)?,
                };
                if let Some(other) = claimed.insert(local.clone(), name.as_str()) {
                    return Err(HarnessError::Config(format!(
                        "remote files '{}' and '{}' stage to the same local path {}",
                        other,
                        name,
                        local.display()
                    )));
                }
                FileEntry::remote(url.clone(), local)
            } else {
                FileEntry::local(url.clone())
            };
            files.insert(name.clone(), entry);
        }
        Ok(files)
    }
}

/// Inputs and outputs of one job plus the namespace its command is rendered
/// against.
#[derive(Debug, Clone)]
pub struct ResolvedFileSet {
    pub inputs: FileMap,
    pub outputs: FileMap,
    pub namespace: Namespace,
    /// Directory owned by this invocation alone, when isolated.
    pub scratch: Option<PathBuf>,
}

impl ResolvedFileSet {
    /// Resolve against the store's shared scratch directory.
    pub fn resolve(config: &JobConfig, store: &dyn RemoteStore) -> Result<Self> {
        Self::resolve_in(config, FileSetResolver::new(store), None)
    }

    /// Resolve into a scratch subdirectory unique to this invocation, so
    /// units running side by side never share a staged file.
    pub fn resolve_isolated(config: &JobConfig, store: &dyn RemoteStore) -> Result<Self> {
        let dir = store.scratch_dir().join(unit_scratch_name(config));
        Self::resolve_in(config, FileSetResolver::new(store).within(&dir), Some(dir))
    }

    fn resolve_in(
        config: &JobConfig,
        resolver: FileSetResolver<'_>,
        scratch: Option<PathBuf>,
    ) -> Result<Self> {
        let inputs = resolver.resolve(config.input_files())?;
        let outputs = resolver.resolve(config.output_files())?;

        let mut remote_locals: BTreeMap<&Path, &str> = BTreeMap::new();
        for (name, entry) in inputs.iter().chain(outputs.iter()) {
            if !entry.is_remote() {
                continue;
            }
            if let Some(other) = remote_locals.insert(entry.local_path(), name.as_str()) {
                return Err(HarnessError::Config(format!(
                    "remote files '{}' and '{}' stage to the same local path {}",
                    other,
                    name,
                    entry.local_path().display()
                )));
            }
        }

        let mut namespace = config.scalar_namespace();
        for (name, entry) in inputs.iter().chain(outputs.iter()) {
            namespace.insert(
                name.clone(),
                Scalar::Str(entry.local_path().to_string_lossy().into_owned()),
            );
        }
        Ok(Self {
            inputs,
            outputs,
            namespace,
            scratch,
        })
    }

    pub fn stat(&self) -> &FileEntry {
        &self.outputs["stat"]
    }

    pub fn log(&self) -> &FileEntry {
        &self.outputs["log"]
    }
}

/// `<run>-<stat stem>-<pid>-<seq>`, unique per host.
fn unit_scratch_name(config: &JobConfig) -> String {
    let stem = Path::new(config.stat_url())
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unit".to_string());
    format!(
        "{}-{}-{}-{}",
        path_safe(config.run()),
        path_safe(&stem),
        std::process::id(),
        SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

fn path_safe(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
