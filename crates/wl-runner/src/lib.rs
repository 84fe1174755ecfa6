//! Per-unit batch job harness.
//!
//! A unit's job config names its input files, output files, a command
//! template and a timeout. [`JobProcessor`] stages remote inputs to local
//! scratch, runs the rendered command under a deadline, writes exactly one
//! [`StatusRecord`], then pushes outputs back and cleans up. The
//! [`ManifestGenerator`] fans a unit out over its sub-units for the work
//! queue, and [`check_unit`] / [`collate`] reduce the results afterwards.

pub mod check;
pub mod collate;
pub mod config;
pub mod error;
pub mod fanout;
pub mod files;
pub mod fsutil;
pub mod joblog;
pub mod layout;
pub mod manifest;
pub mod process;
pub mod processor;
pub mod remote;
pub mod runconfig;
pub mod staging;
pub mod status;
pub mod template;

pub use check::{check_unit, CheckReport};
pub use collate::{collate, BadUnit, Collation};
pub use config::{JobConfig, DEFAULT_TIMEOUT_SECS};
pub use error::{HarnessError, Result};
pub use fanout::{render_sub_unit_config, write_sub_unit_configs};
pub use files::{FileEntry, FileMap, FileSetResolver, ResolvedFileSet};
pub use joblog::JobLog;
pub use layout::{sub_unit_width, WqLayout};
pub use manifest::{ManifestDocument, ManifestGenerator, ManifestKind, ManifestRequest};
pub use process::{
    ExecutionResult, OutputCapture, ProcessRunner, Sink, EXIT_STATUS_ERROR, EXIT_STATUS_PENDING,
    EXIT_STATUS_TIMEOUT,
};
pub use processor::{JobOutcome, JobProcessor, JobState};
pub use remote::{is_remote_url, HdfsStore, MirrorStore, RemoteStore};
pub use runconfig::RunConfig;
pub use staging::{CleanupWarning, FinalizeReport, StagingCoordinator};
pub use status::{exit_status_of, read_status, StatusRecord};
pub use template::{render, Namespace, Scalar};
