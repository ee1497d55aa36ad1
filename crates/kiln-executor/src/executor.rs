use crate::bundle::{Bundle, BundleManager};
use crate::concurrency::{sweep_stale, RootLock, SweepReport, LOCK_FILE};
use crate::lifecycle::{StepState, StepTracker};
use crate::progress::{ProgressSink, StepEvent, StepOutcome};
use crate::supervisor::Supervisor;
use crate::teardown::Phase;
use crate::{ConfigError, ExecError, SetupStage};
use kiln_runtime::{
    resolve_identity, resolve_in_root, DefaultSpecProvider, NetworkFiles, Runc, RuntimeError,
    SpecProvider, SpecRequest, StepIo, UnmountPolicy,
};
use kiln_schema::oci::Root;
use kiln_schema::{BundleId, Context, ExecutionMeta, ExecutorConfig, Mount, Mountable};
use std::collections::HashSet;
use std::fs::DirBuilder;
use std::io::{BufWriter, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

const RUNTIME_LOG: &str = "runc-log.json";

/// Runs build steps in sandboxes under one root directory.
///
/// An executor is shared by reference; any number of [`exec`](Self::exec)
/// calls may run concurrently, each in its own bundle.
pub struct Executor {
    root: PathBuf,
    supervisor: Supervisor,
    bundles: BundleManager,
    network: NetworkFiles,
    provider: Arc<dyn SpecProvider>,
    progress: Option<Arc<dyn ProgressSink>>,
    unmount: UnmountPolicy,
    hostname: String,
    lock: RootLock,
    active: Mutex<HashSet<String>>,
}

struct ActiveGuard<'a> {
    active: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl Executor {
    /// Check the runtime, create and lock `config.root`, and sweep bundles
    /// left by earlier processes if no other executor is using the root.
    pub fn new(config: &ExecutorConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let runc = Runc::new(&config.runtime);
        let version = runc.version().map_err(ConfigError::RuntimeNotFound)?;
        debug!("using {} ({version})", config.runtime);

        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&config.root)
            .map_err(|source| ConfigError::CreateRoot {
                path: config.root.clone(),
                source,
            })?;
        let root = std::path::absolute(&config.root).map_err(|source| {
            ConfigError::CreateRoot {
                path: config.root.clone(),
                source,
            }
        })?;

        let meta = std::fs::symlink_metadata(&root).map_err(|source| ConfigError::CreateRoot {
            path: root.clone(),
            source,
        })?;
        if meta.file_type().is_symlink() {
            return Err(ConfigError::RootIsSymlink(root));
        }

        let unmount = UnmountPolicy::with_retries(config.unmount_retries);
        let runc = runc.with_log(root.join(RUNTIME_LOG), config.log_format);

        let lock_path = root.join(LOCK_FILE);
        let lock = match RootLock::try_exclusive(&lock_path)? {
            Some(lock) => {
                sweep_stale(&root, Some(&runc), unmount, |_| false);
                lock.downgrade()?;
                lock
            }
            None => {
                debug!("root in use by another executor, skipping stale bundle sweep");
                RootLock::shared(&lock_path)?
            }
        };

        let provider = DefaultSpecProvider::new(&config.hostname)
            .with_unmount_policy(unmount)
            .with_scratch_dir(&root);

        info!("executor ready at {}", root.display());
        Ok(Self {
            supervisor: Supervisor::new(runc),
            bundles: BundleManager::new(&root, unmount),
            network: NetworkFiles::new(&root),
            provider: Arc::new(provider),
            progress: None,
            unmount,
            hostname: config.hostname.clone(),
            lock,
            active: Mutex::new(HashSet::new()),
            root,
        })
    }

    /// [`Executor::new`] with default settings.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::new(&ExecutorConfig::new(root))
    }

    #[must_use]
    pub fn with_spec_provider(mut self, provider: Arc<dyn SpecProvider>) -> Self {
        self.provider = provider;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    #[must_use]
    pub fn with_network_files(mut self, network: NetworkFiles) -> Self {
        self.network = network;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runtime(&self) -> &Runc {
        self.supervisor.runtime()
    }

    /// Remove stale bundles now. Returns `None` if another executor holds the
    /// root; bundles of steps running in this executor are never touched.
    pub fn sweep(&self) -> Result<Option<SweepReport>, ConfigError> {
        if !self.lock.try_upgrade()? {
            return Ok(None);
        }
        let report = sweep_stale(&self.root, Some(self.runtime()), self.unmount, |name| {
            self.active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(name)
        });
        self.lock.downgrade()?;
        Ok(Some(report))
    }

    /// Run one step with `root` as its root filesystem and `mounts` attached.
    ///
    /// Returns once the step has finished and everything it acquired has been
    /// released. A non-zero exit is [`ExecError::StepFailed`], or
    /// [`ExecError::Cancelled`] if `ctx` ended while it ran.
    pub fn exec(
        &self,
        ctx: &Context,
        meta: &ExecutionMeta,
        root: &dyn Mountable,
        mounts: &[Mount],
        io: StepIo,
    ) -> Result<(), ExecError> {
        let id = BundleId::generate();
        let started = Instant::now();
        self.emit(&StepEvent::Started {
            bundle_id: id.clone(),
            args: meta.args.clone(),
            at: chrono::Utc::now(),
        });

        let result = self.exec_step(ctx, &id, meta, root, mounts, io);

        let outcome = StepOutcome::of(&result);
        match &result {
            Ok(()) => debug!("step {} succeeded", id.short()),
            Err(e) => debug!("step {} failed: {e}", id.short()),
        }
        self.emit(&StepEvent::Finished {
            bundle_id: id,
            outcome,
            at: chrono::Utc::now(),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        });
        result
    }

    fn emit(&self, event: &StepEvent) {
        if let Some(sink) = &self.progress {
            sink.on_event(event);
        }
    }

    fn exec_step(
        &self,
        ctx: &Context,
        id: &BundleId,
        meta: &ExecutionMeta,
        root: &dyn Mountable,
        mounts: &[Mount],
        io: StepIo,
    ) -> Result<(), ExecError> {
        let mut tracker = StepTracker::new(id.short());
        let result = self.run_tracked(&mut tracker, ctx, id, meta, root, mounts, io);
        tracker.advance(StepState::TornDown);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn run_tracked(
        &self,
        tracker: &mut StepTracker,
        ctx: &Context,
        id: &BundleId,
        meta: &ExecutionMeta,
        root: &dyn Mountable,
        mounts: &[Mount],
        io: StepIo,
    ) -> Result<(), ExecError> {
        meta.validate()
            .map_err(|e| ExecError::setup(SetupStage::Validation)(e.into()))?;
        let user = meta
            .user_spec()
            .map_err(|e| ExecError::setup(SetupStage::Validation)(e.into()))?;

        let hostname = meta.hostname.as_deref().unwrap_or(&self.hostname);
        let resolv_conf = self
            .network
            .resolv_conf(meta.network)
            .map_err(ExecError::setup(SetupStage::NetworkFiles))?;
        let hosts = self
            .network
            .hosts(hostname)
            .map_err(ExecError::setup(SetupStage::NetworkFiles))?;

        let root_readonly = root.is_read_only();
        let root_mounts = root.mount(ctx, root_readonly).map_err(|e| {
            ExecError::setup(SetupStage::RootMount)(RuntimeError::MountSource {
                dest: "/".to_owned(),
                reason: e.to_string(),
            })
        })?;

        // Registered before the directory exists so a concurrent sweep never
        // mistakes it for a stale bundle.
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
        let _active = ActiveGuard {
            active: &self.active,
            id: id.to_string(),
        };

        // Dropping the bundle on any return below tears everything down.
        let mut bundle = self.bundles.create(id.clone())?;
        tracker.advance(StepState::BundlePrepared);
        bundle.mount_rootfs(&root_mounts)?;
        tracker.advance(StepState::RootMounted);

        let identity = resolve_identity(bundle.rootfs(), &user)
            .map_err(ExecError::setup(SetupStage::Identity))?;
        tracker.advance(StepState::IdentityResolved);

        Self::prepare_working_dir(&bundle, meta.cwd_or_root())?;

        let request = SpecRequest {
            meta,
            mounts,
            bundle_id: id,
            resolv_conf: &resolv_conf,
            hosts: &hosts,
            identity: &identity,
        };
        let (mut spec, cleanup) = self
            .provider
            .generate_spec(ctx, &request)
            .map_err(ExecError::setup(SetupStage::SpecGeneration))?;
        bundle.defer(Phase::Release, "release spec resources", move || {
            cleanup.release()
        });

        spec.root = Some(Root {
            path: bundle.rootfs().to_string_lossy().into_owned(),
            readonly: root_readonly,
        });
        Self::persist_spec(&bundle, &spec)?;
        tracker.advance(StepState::SpecPersisted);

        debug!("> running {} {:?}", id.short(), meta.args);
        tracker.advance(StepState::Running);
        let result = self.supervisor.run(ctx, &bundle, io);
        tracker.advance(match &result {
            Ok(()) => StepState::Succeeded,
            Err(e) if e.is_cancelled() => StepState::Cancelled,
            Err(_) => StepState::Failed,
        });

        let failures = bundle.close();
        if failures > 0 {
            warn!("step {}: {failures} teardown action(s) failed", id.short());
        }
        result
    }

    fn prepare_working_dir(bundle: &Bundle, cwd: &str) -> Result<(), ExecError> {
        let path = resolve_in_root(bundle.rootfs(), cwd)
            .map_err(ExecError::setup(SetupStage::WorkingDir))?;
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&path)
            .map_err(|e| ExecError::setup(SetupStage::WorkingDir)(e.into()))
    }

    fn persist_spec(bundle: &Bundle, spec: &kiln_schema::oci::Spec) -> Result<(), ExecError> {
        let persist = || -> Result<(), RuntimeError> {
            let file = std::fs::File::create(bundle.config_path())?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, spec)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            Ok(())
        };
        persist().map_err(ExecError::setup(SetupStage::SpecPersist))
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("root", &self.root)
            .field("runtime", &self.supervisor.runtime().binary())
            .field("hostname", &self.hostname)
            .field("progress", &self.progress.is_some())
            .finish_non_exhaustive()
    }
}
