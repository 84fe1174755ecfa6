use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    /// Missing or malformed job configuration. Raised before any I/O.
    #[error("invalid job config: {0}")]
    Config(String),

    /// The command template cannot be realized against the namespace.
    #[error("command interpolation failed: {0}")]
    Interpolation(String),

    /// A remote input could not be brought to local scratch.
    #[error("staging failed for {url}: {reason}")]
    Staging { url: String, reason: String },

    #[error("remote store error: {0}")]
    Remote(String),

    /// The external command could not be launched or waited on.
    #[error("execution error: {0}")]
    Execution(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    pub fn is_interpolation(&self) -> bool {
        matches!(self, Self::Interpolation(_))
    }

    pub fn is_staging(&self) -> bool {
        matches!(self, Self::Staging { .. })
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
