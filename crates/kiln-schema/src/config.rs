use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_RUNTIME: &str = "runc";
pub const DEFAULT_HOSTNAME: &str = "kilnsandbox";
pub const DEFAULT_UNMOUNT_RETRIES: u32 = 3;

/// Format of the runtime's own log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::Text => f.write_str("text"),
        }
    }
}

/// Executor configuration, usually loaded from `kiln.toml`.
///
/// ```toml
/// root = "/var/lib/kiln/executor"
/// runtime = "runc"
/// log_format = "json"
/// unmount_retries = 3
/// hostname = "kilnsandbox"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Directory holding bundles, the runtime log, and generated network files.
    pub root: PathBuf,
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Attempts at a plain unmount before falling back to a lazy detach.
    #[serde(default = "default_unmount_retries")]
    pub unmount_retries: u32,
    /// Hostname used when a step does not set one.
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

fn default_runtime() -> String {
    DEFAULT_RUNTIME.to_owned()
}

fn default_unmount_retries() -> u32 {
    DEFAULT_UNMOUNT_RETRIES
}

fn default_hostname() -> String {
    DEFAULT_HOSTNAME.to_owned()
}

impl ExecutorConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            runtime: default_runtime(),
            log_format: LogFormat::default(),
            unmount_retries: default_unmount_retries(),
            hostname: default_hostname(),
        }
    }

    #[must_use]
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, SchemaError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.root.as_os_str().is_empty() {
            return Err(SchemaError::InvalidConfig("root must not be empty".to_owned()));
        }
        if self.runtime.trim().is_empty() {
            return Err(SchemaError::InvalidConfig(
                "runtime must not be empty".to_owned(),
            ));
        }
        if self.hostname.is_empty() || self.hostname.len() > 64 {
            return Err(SchemaError::InvalidConfig(format!(
                "hostname must be 1-64 characters, got '{}'",
                self.hostname
            )));
        }
        Ok(())
    }
}
