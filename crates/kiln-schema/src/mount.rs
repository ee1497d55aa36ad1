//! Filesystem references handed to the executor, and the OS-level mount
//! descriptors they resolve to.

use crate::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One OS-level mount: the arguments of a single `mount(2)` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    /// Mount point relative to the directory the list is applied onto.
    /// `None` mounts onto that directory itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

impl MountDescriptor {
    pub fn new(kind: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            source: source.into(),
            target: None,
            options: Vec::new(),
        }
    }

    /// Recursive bind mount of a host path.
    pub fn bind(source: &Path, readonly: bool) -> Self {
        Self {
            kind: "bind".to_owned(),
            source: source.to_string_lossy().into_owned(),
            target: None,
            options: vec![
                "rbind".to_owned(),
                if readonly { "ro" } else { "rw" }.to_owned(),
            ],
        }
    }

    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    #[must_use]
    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.extend(options.into_iter().map(Into::into));
        self
    }

    pub fn is_bind(&self) -> bool {
        self.kind == "bind" || self.options.iter().any(|o| o == "bind" || o == "rbind")
    }

    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }

    /// Force the descriptor read-only, dropping any `rw` option.
    #[must_use]
    pub fn into_read_only(mut self) -> Self {
        self.options.retain(|o| o != "rw");
        if !self.is_read_only() {
            self.options.push("ro".to_owned());
        }
        self
    }
}

/// A filesystem reference that can be attached into a sandbox.
///
/// Implementations are produced by the caller (for example a cache layer) and
/// must be safe to mount from several executions at once.
pub trait Mountable: Send + Sync {
    /// Produce the mount descriptors for this reference. `readonly` is a hint;
    /// a read-only reference returns read-only descriptors regardless.
    fn mount(&self, ctx: &Context, readonly: bool) -> std::io::Result<Vec<MountDescriptor>>;

    /// Immutable references (shared cache layers) must never be writable
    /// inside the sandbox.
    fn is_read_only(&self) -> bool;
}

/// A caller mount: a mountable attached at `dest` inside the sandbox.
#[derive(Clone)]
pub struct Mount {
    pub dest: String,
    pub source: Arc<dyn Mountable>,
    /// Sub-path of the mounted source to expose instead of its root.
    pub selector: Option<String>,
    pub readonly: bool,
}

impl Mount {
    pub fn new(dest: impl Into<String>, source: Arc<dyn Mountable>) -> Self {
        Self {
            dest: dest.into(),
            source,
            selector: None,
            readonly: false,
        }
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.readonly = true;
        self
    }

    #[must_use]
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    /// Whether the mount ends up read-only, either by request or because the
    /// backing reference is immutable.
    pub fn effective_read_only(&self) -> bool {
        self.readonly || self.source.is_read_only()
    }
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("dest", &self.dest)
            .field("selector", &self.selector)
            .field("readonly", &self.readonly)
            .field("source_read_only", &self.source.is_read_only())
            .finish()
    }
}

/// A host directory exposed through a bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDir {
    path: PathBuf,
    readonly: bool,
}

impl LocalDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            readonly: false,
        }
    }

    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            readonly: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Mountable for LocalDir {
    fn mount(&self, _ctx: &Context, readonly: bool) -> std::io::Result<Vec<MountDescriptor>> {
        if !self.path.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not a directory", self.path.display()),
            ));
        }
        Ok(vec![MountDescriptor::bind(
            &self.path,
            readonly || self.readonly,
        )])
    }

    fn is_read_only(&self) -> bool {
        self.readonly
    }
}
