//! Per-step OCI bundle directories.
//!
//! A bundle is `<root>/<id>/` holding `config.json` and the `rootfs/` mount
//! point. Each [`Bundle`] owns a [`Teardown`] that unmounts the rootfs and
//! removes the directory when the bundle is dropped.

use crate::teardown::{Phase, Teardown};
use crate::{ExecError, SetupStage};
use kiln_runtime::mount::unmount;
use kiln_runtime::{is_mounted, MountSet, RuntimeError, UnmountPolicy};
use kiln_schema::{BundleId, MountDescriptor};
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const ROOTFS_DIR: &str = "rootfs";
pub const CONFIG_FILE: &str = "config.json";

/// Creates bundles under an executor root.
#[derive(Debug, Clone)]
pub struct BundleManager {
    root: PathBuf,
    unmount: UnmountPolicy,
}

impl BundleManager {
    pub fn new(root: impl Into<PathBuf>, unmount: UnmountPolicy) -> Self {
        Self {
            root: root.into(),
            unmount,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create `<root>/<id>/rootfs`, both mode 0700.
    pub fn create(&self, id: BundleId) -> Result<Bundle, ExecError> {
        let path = self.root.join(&id);
        let rootfs = path.join(ROOTFS_DIR);

        let mut builder = DirBuilder::new();
        builder.mode(0o700);
        builder
            .create(&path)
            .map_err(|e| ExecError::setup(SetupStage::BundleDir)(e.into()))?;

        let mut bundle = Bundle {
            id,
            path,
            rootfs,
            unmount: self.unmount,
            teardown: Teardown::new(),
        };
        bundle.schedule_removal();

        builder
            .create(&bundle.rootfs)
            .map_err(|e| ExecError::setup(SetupStage::BundleDir)(e.into()))?;
        debug!("created bundle {}", bundle.path.display());
        Ok(bundle)
    }

    /// Create a bundle and compose `root_mounts` onto its rootfs.
    ///
    /// If mounting fails part way, the mounts made so far are undone and the
    /// directory removed before the error is returned.
    pub fn prepare(
        &self,
        id: BundleId,
        root_mounts: &[MountDescriptor],
    ) -> Result<Bundle, ExecError> {
        let mut bundle = self.create(id)?;
        bundle.mount_rootfs(root_mounts)?;
        Ok(bundle)
    }
}

/// One step's bundle directory and the resources hanging off it.
#[derive(Debug)]
pub struct Bundle {
    id: BundleId,
    path: PathBuf,
    rootfs: PathBuf,
    unmount: UnmountPolicy,
    teardown: Teardown,
}

impl Bundle {
    pub fn id(&self) -> &BundleId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }

    fn schedule_removal(&mut self) {
        let path = self.path.clone();
        let rootfs = self.rootfs.clone();
        self.teardown
            .push(Phase::Remove, format!("remove {}", path.display()), move || {
                match is_mounted(&rootfs) {
                    Ok(false) => {}
                    Ok(true) => {
                        warn!(
                            "{} is still mounted, leaving bundle for the next sweep",
                            rootfs.display()
                        );
                        return Err(RuntimeError::ExecFailed(format!(
                            "refusing to remove {} while its rootfs is mounted",
                            path.display()
                        )));
                    }
                    Err(e) => {
                        warn!("cannot tell whether {} is mounted: {e}", rootfs.display());
                        return Err(RuntimeError::ExecFailed(format!(
                            "refusing to remove {}: mount table unreadable",
                            path.display()
                        )));
                    }
                }
                match std::fs::remove_dir_all(&path) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                    _ => Ok(()),
                }
            });
    }

    /// Apply `mounts` onto the rootfs; the rootfs is unmounted again at
    /// teardown.
    pub fn mount_rootfs(&mut self, mounts: &[MountDescriptor]) -> Result<(), ExecError> {
        let mut set = MountSet::apply_all(mounts, &self.rootfs, self.unmount)
            .map_err(ExecError::setup(SetupStage::RootfsMount))?;
        let policy = self.unmount;
        let rootfs = self.rootfs.clone();
        self.teardown.push(
            Phase::Unmount,
            format!("unmount {}", self.rootfs.display()),
            move || {
                set.unmount_all(policy)?;
                // A root reference may have mounted more than the descriptors
                // said, e.g. a helper that stacks its own mounts.
                let mut attempts = 0;
                while is_mounted(&rootfs)? && attempts < 8 {
                    unmount(&rootfs, policy)?;
                    attempts += 1;
                }
                Ok(())
            },
        );
        Ok(())
    }

    /// Register an extra teardown action.
    pub fn defer<F>(&mut self, phase: Phase, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Result<(), RuntimeError> + Send + 'static,
    {
        self.teardown.push(phase, label, action);
    }

    /// Tear the bundle down now rather than on drop. Returns the number of
    /// teardown entries that failed.
    pub fn close(mut self) -> usize {
        self.teardown.run()
    }
}
