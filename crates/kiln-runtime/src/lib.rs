//! Low-level sandbox plumbing for kiln step execution.
//!
//! This crate drives the external OCI runtime (`Runc`) with forwarded stdio
//! (`StepIo`), applies and unwinds OS mounts (`mount`), resolves paths and
//! identities inside a container root filesystem without escaping it
//! (`rootpath`, `identity`), prepares resolv.conf/hosts (`netfiles`), and turns
//! execution metadata into an OCI runtime spec (`SpecProvider`).

pub mod generate;
pub mod identity;
pub mod mount;
pub mod netfiles;
pub mod prereq;
pub mod rootpath;
pub mod runc;
pub mod stdio;

pub use generate::{DefaultSpecProvider, SpecCleanup, SpecProvider, SpecRequest};
pub use identity::{resolve_identity, Identity};
pub use mount::{is_mounted, MountSet, UnmountPolicy};
pub use netfiles::NetworkFiles;
pub use prereq::{check_runtime_prereqs, format_missing, MissingPrereq};
pub use rootpath::resolve_in_root;
pub use runc::{RunStatus, Runc};
pub use stdio::StepIo;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("OCI runtime '{binary}' is not usable: {reason}")]
    RuntimeUnavailable { binary: String, reason: String },
    #[error("failed to mount {device} ({kind}) on {}: {errno}", target.display())]
    Mount {
        kind: String,
        device: String,
        target: PathBuf,
        errno: nix::errno::Errno,
    },
    #[error("failed to unmount {}: {errno}", target.display())]
    Unmount {
        target: PathBuf,
        errno: nix::errno::Errno,
    },
    #[error("path '{path}' resolves outside of {}", root.display())]
    PathEscapes { path: String, root: PathBuf },
    #[error("too many levels of symbolic links resolving '{0}'")]
    SymlinkLoop(String),
    #[error("no such user in container: {0}")]
    UserNotFound(String),
    #[error("no such group in container: {0}")]
    GroupNotFound(String),
    #[error("invalid hostname: '{0}'")]
    InvalidHostname(String),
    #[error("failed to mount {dest}: {reason}")]
    MountSource { dest: String, reason: String },
    #[error("invalid execution meta: {0}")]
    Schema(#[from] kiln_schema::SchemaError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
    #[error("{0}")]
    Cancelled(kiln_schema::CancelCause),
}
