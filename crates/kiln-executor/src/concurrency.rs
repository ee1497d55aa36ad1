use crate::bundle::ROOTFS_DIR;
use crate::ConfigError;
use fs2::FileExt;
use kiln_runtime::mount::unmount;
use kiln_runtime::{is_mounted, Runc, UnmountPolicy};
use kiln_schema::{BundleId, Context, ExecutorConfig};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

pub const LOCK_FILE: &str = "executor.lock";

/// Advisory lock on an executor root.
///
/// Every live executor holds it shared. Sweeping stale bundles needs it
/// exclusively, which proves no other process can be using them.
#[derive(Debug)]
pub struct RootLock {
    lock_file: File,
    path: PathBuf,
}

impl RootLock {
    fn open(lock_path: &Path) -> Result<File, ConfigError> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|source| ConfigError::Lock {
                path: lock_path.to_path_buf(),
                source,
            })
    }

    fn lock_error(&self, source: std::io::Error) -> ConfigError {
        ConfigError::Lock {
            path: self.path.clone(),
            source,
        }
    }

    pub fn shared(lock_path: &Path) -> Result<Self, ConfigError> {
        let lock = Self {
            lock_file: Self::open(lock_path)?,
            path: lock_path.to_path_buf(),
        };
        lock.lock_file
            .lock_shared()
            .map_err(|e| lock.lock_error(e))?;
        Ok(lock)
    }

    pub fn try_exclusive(lock_path: &Path) -> Result<Option<Self>, ConfigError> {
        let file = Self::open(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                lock_file: file,
                path: lock_path.to_path_buf(),
            })),
            Err(_) => Ok(None),
        }
    }

    /// Try to turn a shared lock into an exclusive one. On `Ok(false)` the
    /// lock is held shared again.
    pub fn try_upgrade(&self) -> Result<bool, ConfigError> {
        if self.lock_file.try_lock_exclusive().is_ok() {
            return Ok(true);
        }
        // flock drops the old lock when a conversion fails.
        self.lock_file
            .lock_shared()
            .map_err(|e| self.lock_error(e))?;
        Ok(false)
    }

    pub fn downgrade(&self) -> Result<(), ConfigError> {
        self.lock_file
            .lock_shared()
            .map_err(|e| self.lock_error(e))
    }
}

impl Drop for RootLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// What a sweep did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub skipped: Vec<SkippedBundle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedBundle {
    pub path: PathBuf,
    pub reason: String,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.skipped.is_empty()
    }
}

/// Remove bundles under `root` left by processes that died mid-step.
///
/// The caller must hold the root lock exclusively. Bundles for which
/// `is_active` returns true belong to this process and are left alone; it is
/// asked per entry, after the entry was seen on disk, so a step must be
/// registered before its bundle directory is created.
pub(crate) fn sweep_stale(
    root: &Path,
    runc: Option<&Runc>,
    policy: UnmountPolicy,
    is_active: impl Fn(&str) -> bool,
) -> SweepReport {
    let mut report = SweepReport::default();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot scan {} for stale bundles: {e}", root.display());
            return report;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !BundleId::is_generated(name) || is_active(name) {
            continue;
        }
        let path = entry.path();
        let rootfs = path.join(ROOTFS_DIR);
        if std::fs::symlink_metadata(&rootfs).is_err() {
            continue;
        }

        debug!("sweeping stale bundle {}", path.display());
        if let Some(runc) = runc {
            if let Err(e) = runc.delete(name, true) {
                debug!("{name}: force delete: {e}");
            }
        }

        let mut attempts = 0;
        while matches!(is_mounted(&rootfs), Ok(true)) && attempts < 8 {
            if let Err(e) = unmount(&rootfs, policy) {
                warn!("{e}");
                break;
            }
            attempts += 1;
        }
        let reason = match is_mounted(&rootfs) {
            Ok(false) => None,
            Ok(true) => Some("rootfs still mounted".to_owned()),
            Err(e) => Some(format!("cannot read mount table: {e}")),
        };
        if let Some(reason) = reason {
            report.skipped.push(SkippedBundle { path, reason });
            continue;
        }

        match std::fs::remove_dir_all(&path) {
            Ok(()) => report.removed.push(path),
            Err(e) => report.skipped.push(SkippedBundle {
                path,
                reason: e.to_string(),
            }),
        }
    }

    if !report.is_empty() {
        info!(
            "stale bundle sweep: {} removed, {} skipped",
            report.removed.len(),
            report.skipped.len()
        );
    }
    report
}

/// Sweep an executor root without starting an executor. Returns `None` if a
/// live executor holds the root.
pub fn sweep_root(config: &ExecutorConfig) -> Result<Option<SweepReport>, ConfigError> {
    config.validate()?;
    if !config.root.is_dir() {
        return Ok(Some(SweepReport::default()));
    }
    let Some(_lock) = RootLock::try_exclusive(&config.root.join(LOCK_FILE))? else {
        return Ok(None);
    };
    let runtime = Runc::new(&config.runtime);
    let runc = runtime.version().is_ok().then_some(&runtime);
    Ok(Some(sweep_stale(
        &config.root,
        runc,
        UnmountPolicy::with_retries(config.unmount_retries),
        |_| false,
    )))
}

static INTERRUPTS: AtomicBool = AtomicBool::new(false);

/// Cancel `ctx` on the first Ctrl-C; a second one exits immediately.
pub fn install_cancel_handler(ctx: &Context) -> Result<(), ctrlc::Error> {
    let ctx = ctx.clone();
    ctrlc::set_handler(move || {
        if INTERRUPTS.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        ctx.cancel();
        eprintln!("\ninterrupt received, cancelling step...");
    })
}
