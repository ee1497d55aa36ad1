//! Turning execution metadata into an OCI runtime spec.

use crate::identity::Identity;
use crate::mount::{MountSet, UnmountPolicy};
use crate::netfiles::validate_hostname;
use crate::rootpath::resolve_in_root;
use crate::RuntimeError;
use kiln_schema::oci::{
    self, Capabilities, Linux, Namespace, NamespaceType, Process, Rlimit, Spec, User,
};
use kiln_schema::{BundleId, Context, ExecutionMeta, Mount, MountDescriptor, NetworkMode};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FSETID",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];

const MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
];

const READONLY_PATHS: &[&str] = &[
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// Everything a [`SpecProvider`] needs to describe one step's container.
#[derive(Debug, Clone, Copy)]
pub struct SpecRequest<'a> {
    pub meta: &'a ExecutionMeta,
    /// Caller mounts, not including the root filesystem.
    pub mounts: &'a [Mount],
    pub bundle_id: &'a BundleId,
    pub resolv_conf: &'a Path,
    pub hosts: &'a Path,
    pub identity: &'a Identity,
}

type CleanupFn = Box<dyn FnOnce() -> Result<(), RuntimeError> + Send>;

/// Resources a spec provider acquired while generating a spec.
///
/// [`release`](Self::release) runs them in reverse order of acquisition. If the
/// value is dropped unreleased, the same happens and failures are logged.
#[derive(Default)]
pub struct SpecCleanup {
    steps: Vec<CleanupFn>,
}

impl SpecCleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&mut self, step: F)
    where
        F: FnOnce() -> Result<(), RuntimeError> + Send + 'static,
    {
        self.steps.push(Box::new(step));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step, continuing past failures; returns the first error.
    pub fn release(mut self) -> Result<(), RuntimeError> {
        self.run_all()
    }

    fn run_all(&mut self) -> Result<(), RuntimeError> {
        let mut first_err = None;
        while let Some(step) = self.steps.pop() {
            if let Err(e) = step() {
                warn!("spec cleanup failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for SpecCleanup {
    fn drop(&mut self) {
        let _ = self.run_all();
    }
}

impl fmt::Debug for SpecCleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpecCleanup")
            .field("pending", &self.steps.len())
            .finish()
    }
}

/// Produces the runtime spec for a step.
///
/// `root.path` and `root.readonly` are filled in by the executor afterwards;
/// providers should leave them unset.
pub trait SpecProvider: Send + Sync {
    fn generate_spec(
        &self,
        ctx: &Context,
        req: &SpecRequest<'_>,
    ) -> Result<(Spec, SpecCleanup), RuntimeError>;
}

/// The stock spec: a minimal Linux container with the usual pseudo filesystems,
/// a default capability set, and no access to host namespaces except the
/// network in [`NetworkMode::Host`].
#[derive(Debug, Clone)]
pub struct DefaultSpecProvider {
    hostname: String,
    unmount: UnmountPolicy,
    scratch_dir: Option<PathBuf>,
}

impl DefaultSpecProvider {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            unmount: UnmountPolicy::default(),
            scratch_dir: None,
        }
    }

    #[must_use]
    pub fn with_unmount_policy(mut self, policy: UnmountPolicy) -> Self {
        self.unmount = policy;
        self
    }

    /// Directory for temporary mount points of selected sub-paths. Defaults to
    /// the system temp dir.
    #[must_use]
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    fn process(meta: &ExecutionMeta, identity: &Identity) -> Process {
        let mut env = meta.env_list();
        if !meta.env.contains_key("PATH") {
            env.push(format!("PATH={DEFAULT_PATH}"));
            env.sort();
        }
        let cwd = meta.cwd_or_root();
        let cwd = if cwd.starts_with('/') {
            cwd.to_owned()
        } else {
            format!("/{cwd}")
        };

        Process {
            terminal: false,
            user: User {
                uid: identity.uid,
                gid: identity.gid,
                additional_gids: identity.additional_gids.clone(),
            },
            args: meta.args.clone(),
            env,
            cwd,
            capabilities: Some(Capabilities::uniform(DEFAULT_CAPABILITIES)),
            rlimits: vec![Rlimit {
                kind: "RLIMIT_NOFILE".to_owned(),
                hard: 1024,
                soft: 1024,
            }],
            no_new_privileges: false,
        }
    }

    fn default_mounts(req: &SpecRequest<'_>) -> Vec<oci::Mount> {
        let resolv = req.resolv_conf.to_string_lossy();
        let hosts = req.hosts.to_string_lossy();
        vec![
            oci::Mount::new("/proc", "proc", "proc", &["nosuid", "noexec", "nodev"]),
            oci::Mount::new(
                "/dev",
                "tmpfs",
                "tmpfs",
                &["nosuid", "strictatime", "mode=755", "size=65536k"],
            ),
            oci::Mount::new(
                "/dev/pts",
                "devpts",
                "devpts",
                &[
                    "nosuid",
                    "noexec",
                    "newinstance",
                    "ptmxmode=0666",
                    "mode=0620",
                    "gid=5",
                ],
            ),
            oci::Mount::new(
                "/dev/shm",
                "tmpfs",
                "shm",
                &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
            ),
            oci::Mount::new(
                "/dev/mqueue",
                "mqueue",
                "mqueue",
                &["nosuid", "noexec", "nodev"],
            ),
            oci::Mount::new("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
            oci::Mount::new(
                "/sys/fs/cgroup",
                "cgroup",
                "cgroup",
                &["nosuid", "noexec", "nodev", "relatime", "ro"],
            ),
            oci::Mount::new("/etc/resolv.conf", "bind", &resolv, &["rbind", "ro"]),
            oci::Mount::new("/etc/hosts", "bind", &hosts, &["rbind", "ro"]),
        ]
    }

    fn linux(network: NetworkMode) -> Linux {
        let mut namespaces = vec![
            Namespace::new(NamespaceType::Pid),
            Namespace::new(NamespaceType::Ipc),
            Namespace::new(NamespaceType::Uts),
            Namespace::new(NamespaceType::Mount),
        ];
        if network == NetworkMode::None {
            namespaces.push(Namespace::new(NamespaceType::Network));
        }
        Linux {
            namespaces,
            masked_paths: MASKED_PATHS.iter().map(|p| (*p).to_owned()).collect(),
            readonly_paths: READONLY_PATHS.iter().map(|p| (*p).to_owned()).collect(),
        }
    }

    /// Mount `descs` onto a private temporary directory and return the host
    /// path of `selector` inside it. The mount is released through `cleanup`.
    fn mount_selected(
        &self,
        dest: &str,
        descs: &[MountDescriptor],
        selector: &str,
        cleanup: &mut SpecCleanup,
    ) -> Result<PathBuf, RuntimeError> {
        let scratch = self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir);
        let tmp = scratch.join(format!("kiln-selector-{}", BundleId::generate()));
        std::fs::create_dir(&tmp)?;
        let mut set = match MountSet::apply_all(descs, &tmp, self.unmount) {
            Ok(set) => set,
            Err(e) => {
                let _ = std::fs::remove_dir(&tmp);
                return Err(e);
            }
        };
        let selected = match resolve_in_root(&tmp, selector) {
            Ok(path) => path,
            Err(e) => {
                if set.unmount_all(self.unmount).is_ok() {
                    let _ = std::fs::remove_dir(&tmp);
                }
                return Err(e);
            }
        };
        debug!("{dest}: exposing {selector} via {}", tmp.display());

        let policy = self.unmount;
        cleanup.push(move || match set.unmount_all(policy) {
            Ok(()) => std::fs::remove_dir(&tmp).map_err(RuntimeError::Io),
            Err(e) => {
                // Removing a directory that is still a mount point would
                // delete the mounted content.
                warn!("leaving {} in place, still mounted", tmp.display());
                Err(e)
            }
        });
        Ok(selected)
    }

    fn caller_mounts(
        &self,
        ctx: &Context,
        mounts: &[Mount],
        cleanup: &mut SpecCleanup,
    ) -> Result<Vec<oci::Mount>, RuntimeError> {
        let mut out = Vec::new();
        for m in mounts {
            let readonly = m.effective_read_only();
            let descs = m
                .source
                .mount(ctx, readonly)
                .map_err(|e| RuntimeError::MountSource {
                    dest: m.dest.clone(),
                    reason: e.to_string(),
                })?;
            let descs: Vec<MountDescriptor> = if readonly {
                descs.into_iter().map(MountDescriptor::into_read_only).collect()
            } else {
                descs
            };

            match m.selector.as_deref() {
                Some(selector) if !matches!(selector, "" | "/") => {
                    let source = match descs.as_slice() {
                        [single] if single.is_bind() && single.target.is_none() => {
                            resolve_in_root(Path::new(&single.source), selector)?
                        }
                        _ => self.mount_selected(&m.dest, &descs, selector, cleanup)?,
                    };
                    let source = source.to_string_lossy();
                    let mode = if readonly { "ro" } else { "rw" };
                    out.push(oci::Mount::new(&m.dest, "bind", &source, &["rbind", mode]));
                }
                _ => {
                    for desc in descs {
                        out.push(oci::Mount {
                            destination: join_dest(&m.dest, desc.target.as_deref()),
                            kind: Some(desc.kind),
                            source: Some(desc.source),
                            options: desc.options,
                        });
                    }
                }
            }
        }
        Ok(out)
    }
}

fn join_dest(dest: &str, target: Option<&str>) -> String {
    match target.map(|t| t.trim_start_matches('/')) {
        None | Some("") => dest.to_owned(),
        Some(sub) => format!("{}/{sub}", dest.trim_end_matches('/')),
    }
}

impl SpecProvider for DefaultSpecProvider {
    fn generate_spec(
        &self,
        ctx: &Context,
        req: &SpecRequest<'_>,
    ) -> Result<(Spec, SpecCleanup), RuntimeError> {
        req.meta.validate()?;
        let hostname = req.meta.hostname.as_deref().unwrap_or(&self.hostname);
        validate_hostname(hostname)?;

        let mut cleanup = SpecCleanup::new();
        let mut mounts = Self::default_mounts(req);
        mounts.extend(self.caller_mounts(ctx, req.mounts, &mut cleanup)?);

        let spec = Spec {
            process: Some(Self::process(req.meta, req.identity)),
            root: Some(oci::Root::default()),
            hostname: Some(hostname.to_owned()),
            mounts,
            linux: Some(Self::linux(req.meta.network)),
            ..Spec::default()
        };
        debug!(
            "generated spec for {} with {} mounts",
            req.bundle_id,
            spec.mounts.len()
        );
        Ok((spec, cleanup))
    }
}
