//! Handle to the external OCI runtime binary.

use crate::stdio::StepIo;
use crate::RuntimeError;
use kiln_schema::{Context, LogFormat};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;
use tracing::{debug, warn};

/// How a `run` invocation ended.
#[derive(Debug)]
pub struct RunStatus {
    /// Exit code of the runtime, or `128 + signal` if it was killed.
    pub code: i32,
    /// First error hit while forwarding the step's streams.
    pub io_error: Option<std::io::Error>,
    /// Whether the runtime was killed because the context ended.
    pub killed: bool,
}

impl RunStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Immutable runtime configuration; cheap to share between threads.
#[derive(Debug, Clone)]
pub struct Runc {
    binary: String,
    log: Option<PathBuf>,
    log_format: LogFormat,
    pdeath_signal: Option<Signal>,
    setpgid: bool,
    poll_interval: Duration,
}

impl Runc {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            log: None,
            log_format: LogFormat::Json,
            pdeath_signal: Some(Signal::SIGKILL),
            setpgid: true,
            poll_interval: Duration::from_millis(20),
        }
    }

    /// Have the runtime append its own diagnostics to `path`.
    #[must_use]
    pub fn with_log(mut self, path: impl Into<PathBuf>, format: LogFormat) -> Self {
        self.log = Some(path.into());
        self.log_format = format;
        self
    }

    /// Signal delivered to the runtime if this process dies first.
    #[must_use]
    pub fn with_pdeath_signal(mut self, signal: Option<Signal>) -> Self {
        self.pdeath_signal = signal;
        self
    }

    /// Start the runtime in its own process group so it can be killed as a
    /// whole.
    #[must_use]
    pub fn with_setpgid(mut self, setpgid: bool) -> Self {
        self.setpgid = setpgid;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log.as_deref()
    }

    fn unavailable(&self, reason: impl Into<String>) -> RuntimeError {
        RuntimeError::RuntimeUnavailable {
            binary: self.binary.clone(),
            reason: reason.into(),
        }
    }

    /// First line of `<runtime> --version`; fails if the binary cannot run.
    pub fn version(&self) -> Result<String, RuntimeError> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.unavailable(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.unavailable(format!(
                "--version exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_owned())
    }

    #[allow(unsafe_code)]
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(log) = &self.log {
            cmd.arg("--log")
                .arg(log)
                .arg("--log-format")
                .arg(self.log_format.to_string());
        }
        if self.setpgid {
            cmd.process_group(0);
        }
        if let Some(signal) = self.pdeath_signal {
            let signo = signal as libc::c_int;
            // SAFETY: prctl is async-signal-safe and touches no memory shared
            // with the parent; nothing is allocated between fork and exec.
            unsafe {
                cmd.pre_exec(move || {
                    if libc::prctl(libc::PR_SET_PDEATHSIG, signo) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        cmd
    }

    /// `<runtime> run --bundle <bundle> <id>`, blocking until it exits.
    ///
    /// If `ctx` ends while the container runs, the runtime's process group is
    /// killed and the container force-deleted before this returns. A context
    /// that is already done spawns nothing.
    pub fn run(
        &self,
        ctx: &Context,
        id: &str,
        bundle: &Path,
        io: StepIo,
    ) -> Result<RunStatus, RuntimeError> {
        if let Some(cause) = ctx.err() {
            return Err(RuntimeError::Cancelled(cause));
        }

        let mut cmd = self.command();
        cmd.arg("run").arg("--bundle").arg(bundle).arg(id);
        io.configure(&mut cmd);
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                self.unavailable(e.to_string())
            } else {
                RuntimeError::Io(e)
            }
        })?;
        let forwarder = io.attach(&mut child);
        let pid = Pid::from_raw(child.id() as i32);

        let mut killed = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if ctx.is_done() {
                warn!("{id}: context ended while running, killing runtime");
                self.kill(pid);
                let status = child.wait()?;
                killed = true;
                if let Err(e) = self.delete(id, true) {
                    warn!("{id}: force delete after kill failed: {e}");
                }
                break status;
            }
            std::thread::sleep(self.poll_interval);
        };

        let io_error = forwarder.finish();
        let code = exit_code(status);
        debug!("{id}: runtime exited with {code}");
        Ok(RunStatus {
            code,
            io_error,
            killed,
        })
    }

    fn kill(&self, pid: Pid) {
        let result = if self.setpgid {
            killpg(pid, Signal::SIGKILL)
        } else {
            kill(pid, Signal::SIGKILL)
        };
        if let Err(e) = result {
            debug!("kill {pid}: {e}");
        }
    }

    /// `<runtime> delete [--force] <id>`.
    pub fn delete(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let mut cmd = self.command();
        cmd.arg("delete");
        if force {
            cmd.arg("--force");
        }
        let output = cmd
            .arg(id)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.unavailable(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RuntimeError::ExecFailed(format!(
                "{} delete {id}: {}",
                self.binary,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}
