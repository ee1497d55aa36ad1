use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::process::{Command, Stdio};

/// A missing prerequisite with actionable install instructions.
#[derive(Debug, Clone, Serialize)]
pub struct MissingPrereq {
    pub name: String,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (fix: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn runtime_responds(runtime: &str) -> bool {
    Command::new(runtime)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// Check what running steps through `runtime` needs from the host.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_runtime_prereqs(runtime: &str) -> Vec<MissingPrereq> {
    check_with(runtime, nix::unistd::geteuid().is_root(), Path::new("/proc/mounts"))
}

fn check_with(runtime: &str, is_root: bool, proc_mounts: &Path) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !runtime_responds(runtime) {
        missing.push(MissingPrereq {
            name: runtime.to_owned(),
            purpose: "OCI container execution",
            install_hint: "zypper install runc | apt install runc | dnf install runc | pacman -S runc",
        });
    }

    if !is_root {
        missing.push(MissingPrereq {
            name: "root privileges".to_owned(),
            purpose: "mounting root filesystems and starting containers",
            install_hint: "run kiln as root",
        });
    }

    if std::fs::read_to_string(proc_mounts).is_err() {
        missing.push(MissingPrereq {
            name: "/proc".to_owned(),
            purpose: "detecting leftover mounts",
            install_hint: "mount -t proc proc /proc",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nkiln needs these to run build steps in a sandbox.");
    msg
}
