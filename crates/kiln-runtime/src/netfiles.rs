//! resolv.conf and hosts files shared by every sandbox under one root.
//!
//! The files live directly in the executor root and are bind-mounted read-only
//! into each container. They are rewritten atomically, so a sandbox that is
//! starting while another regenerates them sees either the old or the new
//! content, never a torn file.

use crate::RuntimeError;
use kiln_schema::NetworkMode;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";
const FALLBACK_NAMESERVERS: &[&str] = &["8.8.8.8", "8.8.4.4"];

/// Writes resolv.conf and hosts files under an executor root.
#[derive(Debug, Clone)]
pub struct NetworkFiles {
    root: PathBuf,
    host_resolv_conf: PathBuf,
}

impl NetworkFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            host_resolv_conf: PathBuf::from(HOST_RESOLV_CONF),
        }
    }

    /// Read host DNS settings from somewhere other than `/etc/resolv.conf`.
    #[must_use]
    pub fn with_host_resolv_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_resolv_conf = path.into();
        self
    }

    /// Path of the resolv.conf to expose for `mode`, regenerated when the host
    /// file changed since it was last written.
    ///
    /// Host networking shares the host's resolver config as is. An isolated
    /// network namespace cannot reach loopback resolvers on the host, so those
    /// are dropped, falling back to public resolvers if nothing is left.
    pub fn resolv_conf(&self, mode: NetworkMode) -> Result<PathBuf, RuntimeError> {
        let target = match mode {
            NetworkMode::Host => self.root.join("resolv.conf"),
            NetworkMode::None => self.root.join("resolv-isolated.conf"),
        };

        let host_modified = modified(&self.host_resolv_conf);
        let current = modified(&target);
        let fresh = match (current, host_modified) {
            (Some(cur), Some(host)) => cur >= host,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if fresh {
            return Ok(target);
        }

        let host = match std::fs::read_to_string(&self.host_resolv_conf) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(RuntimeError::Io(e)),
        };
        let content = match mode {
            NetworkMode::Host => host,
            NetworkMode::None => filter_local_nameservers(&host),
        };
        debug!("regenerating {}", target.display());
        write_atomic(&self.root, &target, content.as_bytes())?;
        Ok(target)
    }

    /// Path of a hosts file mapping `localhost` and `hostname` to loopback.
    pub fn hosts(&self, hostname: &str) -> Result<PathBuf, RuntimeError> {
        validate_hostname(hostname)?;
        let target = self.root.join(format!("hosts.{hostname}"));
        let content = hosts_content(hostname);
        if std::fs::read_to_string(&target).is_ok_and(|existing| existing == content) {
            return Ok(target);
        }
        write_atomic(&self.root, &target, content.as_bytes())?;
        Ok(target)
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn write_atomic(dir: &Path, target: &Path, content: &[u8]) -> Result<(), RuntimeError> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    set_world_readable(tmp.path())?;
    tmp.persist(target).map_err(|e| RuntimeError::Io(e.error))?;
    Ok(())
}

fn set_world_readable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
}

fn is_local_nameserver(addr: &str) -> bool {
    addr.starts_with("127.") || addr == "::1"
}

fn filter_local_nameservers(content: &str) -> String {
    let mut out = String::new();
    let mut nameservers = 0usize;
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() == Some("nameserver") {
            match fields.next() {
                Some(addr) if !is_local_nameserver(addr) => nameservers += 1,
                _ => continue,
            }
        }
        out.push_str(line);
        out.push('\n');
    }
    if nameservers == 0 {
        for ns in FALLBACK_NAMESERVERS {
            out.push_str("nameserver ");
            out.push_str(ns);
            out.push('\n');
        }
    }
    out
}

fn hosts_content(hostname: &str) -> String {
    format!("127.0.0.1\tlocalhost {hostname}\n::1\tlocalhost ip6-localhost ip6-loopback\n")
}

/// Hostnames end up in file names and in the kernel's UTS namespace; accept
/// only the DNS label alphabet.
pub fn validate_hostname(hostname: &str) -> Result<(), RuntimeError> {
    let valid = !hostname.is_empty()
        && hostname.len() <= 64
        && !hostname.starts_with('.')
        && hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(RuntimeError::InvalidHostname(hostname.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(host: Option<&str>) -> (tempfile::TempDir, NetworkFiles) {
        let dir = tempfile::tempdir().unwrap();
        let host_path = dir.path().join("host-resolv.conf");
        if let Some(content) = host {
            std::fs::write(&host_path, content).unwrap();
        }
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let files = NetworkFiles::new(&root).with_host_resolv_conf(host_path);
        (dir, files)
    }

    #[test]
    fn host_mode_copies_verbatim() {
        let (_dir, files) = setup(Some("nameserver 127.0.0.53\nsearch lan\n"));
        let path = files.resolv_conf(NetworkMode::Host).unwrap();
        assert!(path.ends_with("resolv.conf"));
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "nameserver 127.0.0.53\nsearch lan\n"
        );
    }

    #[test]
    fn isolated_mode_drops_loopback_resolvers() {
        let (_dir, files) = setup(Some(
            "nameserver 127.0.0.53\nnameserver ::1\nnameserver 10.0.0.1\noptions edns0\n",
        ));
        let path = files.resolv_conf(NetworkMode::None).unwrap();
        assert!(path.ends_with("resolv-isolated.conf"));
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "nameserver 10.0.0.1\noptions edns0\n"
        );
    }

    #[test]
    fn isolated_mode_falls_back_to_public_resolvers() {
        let (_dir, files) = setup(Some("nameserver 127.0.0.53\n"));
        let path = files.resolv_conf(NetworkMode::None).unwrap();
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "nameserver 8.8.8.8\nnameserver 8.8.4.4\n"
        );
    }

    #[test]
    fn missing_host_file_gives_empty_copy() {
        let (_dir, files) = setup(None);
        let path = files.resolv_conf(NetworkMode::Host).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "");
    }

    #[test]
    fn regenerates_when_host_file_is_newer() {
        let (dir, files) = setup(Some("nameserver 10.0.0.1\n"));
        let path = files.resolv_conf(NetworkMode::Host).unwrap();

        let host = dir.path().join("host-resolv.conf");
        std::fs::write(&host, "nameserver 10.0.0.2\n").unwrap();
        let later = SystemTime::now() + std::time::Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(&host)
            .unwrap()
            .set_modified(later)
            .unwrap();

        files.resolv_conf(NetworkMode::Host).unwrap();
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "nameserver 10.0.0.2\n"
        );
    }

    #[test]
    fn hosts_file_names_hostname() {
        let (_dir, files) = setup(None);
        let path = files.hosts("builder").unwrap();
        assert!(path.ends_with("hosts.builder"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("127.0.0.1\tlocalhost builder\n"));
        assert!(content.contains("::1\tlocalhost"));
        assert_eq!(files.hosts("builder").unwrap(), path);
    }

    #[test]
    fn invalid_hostnames_rejected() {
        let (_dir, files) = setup(None);
        for bad in ["", "../etc", "a b", "x/y", &"h".repeat(65)] {
            assert!(
                matches!(files.hosts(bad), Err(RuntimeError::InvalidHostname(_))),
                "{bad} accepted"
            );
        }
    }
}
