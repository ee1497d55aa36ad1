//! Forwarding a step's standard streams to and from the runtime process.

use std::fmt;
use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use tracing::debug;

/// The three streams of a step. Absent streams are connected to `/dev/null`.
#[derive(Default)]
pub struct StepIo {
    pub stdin: Option<Box<dyn Read + Send>>,
    pub stdout: Option<Box<dyn Write + Send>>,
    pub stderr: Option<Box<dyn Write + Send>>,
}

impl StepIo {
    /// All three streams discarded.
    pub fn null() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Read + Send + 'static) -> Self {
        self.stdin = Some(Box::new(stdin));
        self
    }

    #[must_use]
    pub fn with_stdout(mut self, stdout: impl Write + Send + 'static) -> Self {
        self.stdout = Some(Box::new(stdout));
        self
    }

    #[must_use]
    pub fn with_stderr(mut self, stderr: impl Write + Send + 'static) -> Self {
        self.stderr = Some(Box::new(stderr));
        self
    }

    /// Inherit the current process's streams.
    pub fn inherit() -> Self {
        Self::null()
            .with_stdin(io::stdin())
            .with_stdout(io::stdout())
            .with_stderr(io::stderr())
    }

    pub(crate) fn configure(&self, cmd: &mut Command) {
        let pipe_or_null = |present: bool| {
            if present {
                Stdio::piped()
            } else {
                Stdio::null()
            }
        };
        cmd.stdin(pipe_or_null(self.stdin.is_some()))
            .stdout(pipe_or_null(self.stdout.is_some()))
            .stderr(pipe_or_null(self.stderr.is_some()));
    }

    /// Start copying between the caller's streams and `child`'s pipes.
    pub(crate) fn attach(self, child: &mut Child) -> Forwarder {
        let stdin = match (self.stdin, child.stdin.take()) {
            (Some(mut src), Some(mut dst)) => Some(std::thread::spawn(move || {
                match io::copy(&mut src, &mut dst) {
                    Err(e) if e.kind() != io::ErrorKind::BrokenPipe => Err(e),
                    _ => Ok(()),
                }
            })),
            _ => None,
        };

        let mut outputs = Vec::new();
        if let (Some(dst), Some(src)) = (self.stdout, child.stdout.take()) {
            outputs.push(std::thread::spawn(move || copy_out(src, dst)));
        }
        if let (Some(dst), Some(src)) = (self.stderr, child.stderr.take()) {
            outputs.push(std::thread::spawn(move || copy_out(src, dst)));
        }

        Forwarder { stdin, outputs }
    }
}

impl fmt::Debug for StepIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

fn copy_out(mut src: impl Read, mut dst: Box<dyn Write + Send>) -> io::Result<()> {
    io::copy(&mut src, &mut dst)?;
    dst.flush()
}

/// Copy threads for one running process.
pub(crate) struct Forwarder {
    stdin: Option<JoinHandle<io::Result<()>>>,
    outputs: Vec<JoinHandle<io::Result<()>>>,
}

fn joined(handle: JoinHandle<io::Result<()>>) -> io::Result<()> {
    handle
        .join()
        .unwrap_or_else(|_| Err(io::Error::other("stream forwarding thread panicked")))
}

impl Forwarder {
    /// Wait for output to drain once the process has exited. Returns the first
    /// forwarding error.
    ///
    /// A stdin copy still blocked reading the caller's stream is left behind;
    /// the process it fed is gone, so its next write fails and it ends.
    pub(crate) fn finish(self) -> Option<io::Error> {
        let mut first_err = None;
        for handle in self.outputs {
            if let Err(e) = joined(handle) {
                first_err.get_or_insert(e);
            }
        }
        if let Some(handle) = self.stdin {
            if handle.is_finished() {
                if let Err(e) = joined(handle) {
                    first_err.get_or_insert(e);
                }
            } else {
                debug!("stdin still open after process exit, detaching copier");
            }
        }
        first_err
    }
}
