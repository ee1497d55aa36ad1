//! Sandboxed execution of single build steps.
//!
//! This crate ties the runtime plumbing together into the [`Executor`]: for
//! every step it prepares a fresh OCI bundle over the caller's root filesystem,
//! resolves the step's identity and working directory inside it, writes the
//! runtime spec, runs the container with the caller's streams, and tears all of
//! it down again on every exit path. It also owns the lock on the executor root
//! and the sweep of bundles left behind by crashed processes.

pub mod bundle;
pub mod concurrency;
pub mod executor;
pub mod lifecycle;
pub mod progress;
pub mod supervisor;
pub mod teardown;

pub use bundle::{Bundle, BundleManager};
pub use concurrency::{install_cancel_handler, sweep_root, RootLock, SweepReport};
pub use executor::Executor;
pub use lifecycle::{StepState, StepTracker};
pub use progress::{ProgressSink, StepEvent, StepOutcome, TracingProgress};
pub use supervisor::Supervisor;
pub use teardown::{Phase, Teardown};

use kiln_runtime::RuntimeError;
use kiln_schema::CancelCause;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors constructing an [`Executor`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to find OCI runtime: {0}")]
    RuntimeNotFound(#[source] RuntimeError),
    #[error("failed to create {}: {source}", path.display())]
    CreateRoot {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} is a symlink", .0.display())]
    RootIsSymlink(PathBuf),
    #[error("failed to lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Schema(#[from] kiln_schema::SchemaError),
}

/// The setup step that failed before the step could run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStage {
    Validation,
    NetworkFiles,
    RootMount,
    BundleDir,
    RootfsMount,
    Identity,
    WorkingDir,
    SpecGeneration,
    SpecPersist,
    RuntimeStart,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validating step",
            Self::NetworkFiles => "preparing network files",
            Self::RootMount => "mounting root reference",
            Self::BundleDir => "creating bundle directory",
            Self::RootfsMount => "mounting rootfs",
            Self::Identity => "resolving user",
            Self::WorkingDir => "preparing working directory",
            Self::SpecGeneration => "generating runtime spec",
            Self::SpecPersist => "writing runtime spec",
            Self::RuntimeStart => "starting runtime",
        };
        f.write_str(s)
    }
}

/// Coarse classification of an [`ExecError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecErrorKind {
    Config,
    Setup,
    StepFailed,
    Cancelled,
    Io,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("executor configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("{stage}: {source}")]
    Setup {
        stage: SetupStage,
        #[source]
        source: RuntimeError,
    },
    #[error("exit code {exit_code}")]
    StepFailed { exit_code: i32 },
    #[error("{}", cancelled_message(.cause, .exit_code))]
    Cancelled {
        cause: CancelCause,
        exit_code: Option<i32>,
    },
    #[error("stream forwarding failed: {0}")]
    Io(#[from] std::io::Error),
}

fn cancelled_message(cause: &CancelCause, exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {code}: {cause}"),
        None => cause.to_string(),
    }
}

impl ExecError {
    pub(crate) fn setup(stage: SetupStage) -> impl FnOnce(RuntimeError) -> Self {
        move |source| Self::Setup { stage, source }
    }

    pub fn kind(&self) -> ExecErrorKind {
        match self {
            Self::Config(_) => ExecErrorKind::Config,
            Self::Setup { .. } => ExecErrorKind::Setup,
            Self::StepFailed { .. } => ExecErrorKind::StepFailed,
            Self::Cancelled { .. } => ExecErrorKind::Cancelled,
            Self::Io(_) => ExecErrorKind::Io,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Exit status of the step, if it got far enough to have one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::StepFailed { exit_code } => Some(*exit_code),
            Self::Cancelled { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    pub fn stage(&self) -> Option<SetupStage> {
        match self {
            Self::Setup { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
