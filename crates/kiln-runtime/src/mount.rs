//! Applying and unwinding OS mounts.

use crate::rootpath::resolve_in_root;
use crate::RuntimeError;
use kiln_schema::MountDescriptor;
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// `mount(2)` flags and filesystem-specific data derived from an option list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOptions {
    pub flags: MsFlags,
    pub data: String,
}

const PROPAGATION: MsFlags = MsFlags::MS_SHARED
    .union(MsFlags::MS_PRIVATE)
    .union(MsFlags::MS_SLAVE)
    .union(MsFlags::MS_UNBINDABLE);

/// Split mount options into flags and a data string, the way `mount(8)` does.
pub fn parse_options(options: &[String]) -> ParsedOptions {
    let mut flags = MsFlags::empty();
    let mut data: Vec<&str> = Vec::new();

    for option in options {
        let (clear, flag) = match option.as_str() {
            "async" => (true, MsFlags::MS_SYNCHRONOUS),
            "atime" => (true, MsFlags::MS_NOATIME),
            "bind" => (false, MsFlags::MS_BIND),
            "defaults" => (false, MsFlags::empty()),
            "dev" => (true, MsFlags::MS_NODEV),
            "diratime" => (true, MsFlags::MS_NODIRATIME),
            "dirsync" => (false, MsFlags::MS_DIRSYNC),
            "exec" => (true, MsFlags::MS_NOEXEC),
            "mand" => (false, MsFlags::MS_MANDLOCK),
            "noatime" => (false, MsFlags::MS_NOATIME),
            "nodev" => (false, MsFlags::MS_NODEV),
            "nodiratime" => (false, MsFlags::MS_NODIRATIME),
            "noexec" => (false, MsFlags::MS_NOEXEC),
            "nomand" => (true, MsFlags::MS_MANDLOCK),
            "norelatime" => (true, MsFlags::MS_RELATIME),
            "nostrictatime" => (true, MsFlags::MS_STRICTATIME),
            "nosuid" => (false, MsFlags::MS_NOSUID),
            "rbind" => (false, MsFlags::MS_BIND | MsFlags::MS_REC),
            "relatime" => (false, MsFlags::MS_RELATIME),
            "remount" => (false, MsFlags::MS_REMOUNT),
            "ro" => (false, MsFlags::MS_RDONLY),
            "rw" => (true, MsFlags::MS_RDONLY),
            "strictatime" => (false, MsFlags::MS_STRICTATIME),
            "suid" => (true, MsFlags::MS_NOSUID),
            "sync" => (false, MsFlags::MS_SYNCHRONOUS),
            "private" => (false, MsFlags::MS_PRIVATE),
            "rprivate" => (false, MsFlags::MS_PRIVATE | MsFlags::MS_REC),
            "shared" => (false, MsFlags::MS_SHARED),
            "rshared" => (false, MsFlags::MS_SHARED | MsFlags::MS_REC),
            "slave" => (false, MsFlags::MS_SLAVE),
            "rslave" => (false, MsFlags::MS_SLAVE | MsFlags::MS_REC),
            "unbindable" => (false, MsFlags::MS_UNBINDABLE),
            "runbindable" => (false, MsFlags::MS_UNBINDABLE | MsFlags::MS_REC),
            other => {
                data.push(other);
                continue;
            }
        };
        if clear {
            flags.remove(flag);
        } else {
            flags.insert(flag);
        }
    }

    ParsedOptions {
        flags,
        data: data.join(","),
    }
}

fn mount_error(desc: &MountDescriptor, target: &Path, errno: Errno) -> RuntimeError {
    RuntimeError::Mount {
        kind: desc.kind.clone(),
        device: desc.source.clone(),
        target: target.to_path_buf(),
        errno,
    }
}

/// Apply one descriptor onto `target`.
///
/// Propagation changes need their own `mount(2)` call, and a read-only bind
/// only takes effect after a remount, so one descriptor may take up to three
/// calls.
pub fn apply(desc: &MountDescriptor, target: &Path) -> Result<(), RuntimeError> {
    let ParsedOptions { flags, data } = parse_options(&desc.options);
    let base = flags.difference(PROPAGATION);
    let data = (!data.is_empty()).then_some(data.as_str());

    if !flags.contains(MsFlags::MS_REMOUNT) || data.is_some() {
        mount(
            Some(desc.source.as_str()),
            target,
            Some(desc.kind.as_str()),
            base,
            data,
        )
        .map_err(|e| mount_error(desc, target, e))?;
    }

    if flags.intersects(PROPAGATION) {
        let pflags = flags & (PROPAGATION | MsFlags::MS_REC | MsFlags::MS_SILENT);
        mount(None::<&str>, target, None::<&str>, pflags, None::<&str>)
            .map_err(|e| mount_error(desc, target, e))?;
    }

    if base.contains(MsFlags::MS_BIND | MsFlags::MS_RDONLY) {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            base | MsFlags::MS_REMOUNT,
            None::<&str>,
        )
        .map_err(|e| mount_error(desc, target, e))?;
    }

    debug!(
        "mounted {} ({}) on {}",
        desc.source,
        desc.kind,
        target.display()
    );
    Ok(())
}

/// How hard to try before giving up on an unmount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmountPolicy {
    /// Plain `umount2` attempts while the target is busy.
    pub retries: u32,
    /// Delay before the first retry; doubles on each attempt.
    pub backoff: Duration,
}

impl Default for UnmountPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl UnmountPolicy {
    pub fn with_retries(retries: u32) -> Self {
        Self {
            retries,
            ..Self::default()
        }
    }
}

/// Unmount the topmost mount on `target`, and first anything mounted below it.
///
/// Busy targets are retried with backoff and finally detached lazily. A target
/// that is not a mount point (or no longer exists) counts as unmounted.
pub fn unmount(target: &Path, policy: UnmountPolicy) -> Result<(), RuntimeError> {
    let below = match std::fs::read_to_string(MOUNTINFO) {
        Ok(table) => submounts_in(&table, &canonical(target)),
        Err(e) => {
            debug!("cannot read {MOUNTINFO}: {e}");
            Vec::new()
        }
    };
    if !below.is_empty() {
        // Unmounts under a shared mount propagate to its peers, which for an
        // rbind include the caller's own submounts.
        match mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            None::<&str>,
        ) {
            Ok(()) => {
                for sub in &below {
                    unmount_one(sub, policy)?;
                }
            }
            Err(e) => debug!(
                "{}: cannot make private ({e}), leaving submounts to the top unmount",
                target.display()
            ),
        }
    }
    unmount_one(target, policy)
}

fn unmount_one(target: &Path, policy: UnmountPolicy) -> Result<(), RuntimeError> {
    let mut delay = policy.backoff;
    for attempt in 0..policy.retries.max(1) {
        match umount2(target, MntFlags::empty()) {
            Ok(()) | Err(Errno::EINVAL | Errno::ENOENT) => return Ok(()),
            Err(Errno::EBUSY) => {
                debug!(
                    "{} busy, unmount attempt {} failed",
                    target.display(),
                    attempt + 1
                );
                std::thread::sleep(delay);
                delay = delay.saturating_mul(2);
            }
            Err(errno) => {
                return Err(RuntimeError::Unmount {
                    target: target.to_path_buf(),
                    errno,
                })
            }
        }
    }

    warn!("{} still busy, detaching lazily", target.display());
    match umount2(target, MntFlags::MNT_DETACH) {
        Ok(()) | Err(Errno::EINVAL | Errno::ENOENT) => Ok(()),
        Err(errno) => Err(RuntimeError::Unmount {
            target: target.to_path_buf(),
            errno,
        }),
    }
}

/// Mounts applied by [`MountSet::apply_all`], remembered so they can be
/// unwound in reverse order.
#[derive(Debug, Default)]
pub struct MountSet {
    targets: Vec<PathBuf>,
}

impl MountSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `mounts` in order onto `root`. Each descriptor's `target`, when
    /// present, is resolved inside `root`. Later entries may shadow earlier ones.
    ///
    /// On failure everything applied so far is unmounted before the error is
    /// returned.
    pub fn apply_all(
        mounts: &[MountDescriptor],
        root: &Path,
        policy: UnmountPolicy,
    ) -> Result<Self, RuntimeError> {
        let mut set = Self::new();
        for desc in mounts {
            let target = match desc.target.as_deref() {
                None | Some("" | "/") => root.to_path_buf(),
                Some(sub) => match resolve_in_root(root, sub) {
                    Ok(path) => path,
                    Err(e) => {
                        set.unwind(policy);
                        return Err(e);
                    }
                },
            };
            if let Err(e) = apply(desc, &target) {
                set.unwind(policy);
                return Err(e);
            }
            set.targets.push(target);
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Unmount everything in reverse order, continuing past failures. Returns
    /// the first error encountered.
    pub fn unmount_all(&mut self, policy: UnmountPolicy) -> Result<(), RuntimeError> {
        let mut first_err = None;
        while let Some(target) = self.targets.pop() {
            if let Err(e) = unmount(&target, policy) {
                warn!("{e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn unwind(&mut self, policy: UnmountPolicy) {
        let _ = self.unmount_all(policy);
    }
}

/// Decode the octal escapes `/proc/mounts` uses for whitespace and backslashes.
fn unescape_mount_path(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let oct = &bytes[i + 1..i + 4];
            if oct.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let v = oct.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(v) = u8::try_from(v) {
                    out.push(v);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

const MOUNTS: &str = "/proc/mounts";
const MOUNTINFO: &str = "/proc/self/mountinfo";

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Mount points strictly below `target` in a `mountinfo` table, most recent
/// first. The table lists mounts in the order they were made, so every
/// child comes before its parent and the top of a stack before what it covers.
fn submounts_in(mountinfo: &str, target: &Path) -> Vec<PathBuf> {
    mountinfo
        .lines()
        .rev()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(unescape_mount_path(field)))
        .filter(|mount_point| mount_point != target && mount_point.starts_with(target))
        .collect()
}

fn is_mounted_in(table: &Path, path: &Path) -> std::io::Result<bool> {
    let canonical = canonical(path);
    let canonical = canonical.to_string_lossy();
    let mounts = std::fs::read_to_string(table)?;
    Ok(mounts.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .is_some_and(|field| unescape_mount_path(field) == canonical)
    }))
}

/// Check if a path is currently a mount point by inspecting /proc/mounts.
///
/// An error means the answer is unknown; callers about to delete anything
/// under `path` must treat it as mounted.
pub fn is_mounted(path: &Path) -> std::io::Result<bool> {
    is_mounted_in(Path::new(MOUNTS), path)
}
