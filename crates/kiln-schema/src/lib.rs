//! Data model and collaborator contracts for the kiln step executor.
//!
//! This crate defines what flows into a step execution: `ExecutionMeta` (argv,
//! environment, working directory, user), the `Mountable` contract and the
//! `MountDescriptor`s it yields, the cancellation `Context`, the serializable OCI
//! runtime `Spec`, bundle identifiers, and the TOML `ExecutorConfig`.

pub mod config;
pub mod context;
pub mod meta;
pub mod mount;
pub mod oci;
pub mod types;

pub use config::{ExecutorConfig, LogFormat};
pub use context::{CancelCause, Context};
pub use meta::{ExecutionMeta, IdRef, NetworkMode, UserSpec};
pub use mount::{LocalDir, Mount, MountDescriptor, Mountable};
pub use types::BundleId;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("execution meta has an empty argument vector")]
    EmptyArgs,
    #[error("invalid environment variable name: '{0}'")]
    InvalidEnvName(String),
    #[error("invalid user specifier: '{0}'")]
    InvalidUser(String),
    #[error("invalid network mode: '{0}', expected 'host' or 'none'")]
    InvalidNetworkMode(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
