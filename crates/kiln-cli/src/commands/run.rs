use super::{
    colorize_outcome, json_pretty, EXIT_CANCELLED, EXIT_CONFIG_ERROR, EXIT_FAILURE,
    EXIT_SETUP_ERROR, EXIT_SUCCESS,
};
use clap::Args;
use kiln_executor::{install_cancel_handler, ExecError, Executor, StepOutcome, TracingProgress};
use kiln_runtime::StepIo;
use kiln_schema::{Context, ExecutionMeta, ExecutorConfig, LocalDir, Mount, NetworkMode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Host directory used as the root filesystem.
    pub rootfs: PathBuf,
    /// Mount the root filesystem read-only.
    #[arg(long, default_value_t = false)]
    pub readonly: bool,
    /// Working directory inside the sandbox.
    #[arg(long, default_value = "/")]
    pub cwd: String,
    /// User to run as: `uid[:gid]` or `name[:group]`.
    #[arg(long, default_value = "0:0")]
    pub user: String,
    /// Environment variable for the step (repeatable).
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,
    /// Host directory to attach (repeatable).
    #[arg(long = "mount", value_name = "SRC:DEST[:ro]", value_parser = parse_mount)]
    pub mounts: Vec<MountArg>,
    /// Hostname inside the sandbox.
    #[arg(long)]
    pub hostname: Option<String>,
    /// `host` shares the host network; `none` gives loopback only.
    #[arg(long, default_value = "host")]
    pub network: NetworkMode,
    /// Cancel the step after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
    /// Command and arguments to run.
    #[arg(required = true, last = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountArg {
    pub source: PathBuf,
    pub dest: String,
    pub readonly: bool,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

fn parse_mount(s: &str) -> Result<MountArg, String> {
    let mut parts = s.split(':');
    let (Some(source), Some(dest)) = (parts.next(), parts.next()) else {
        return Err(format!("expected SRC:DEST[:ro], got '{s}'"));
    };
    let readonly = match parts.next() {
        None => false,
        Some("ro") => true,
        Some("rw") => false,
        Some(other) => return Err(format!("unknown mount mode '{other}', expected ro or rw")),
    };
    if parts.next().is_some() || source.is_empty() || !dest.starts_with('/') {
        return Err(format!("expected SRC:DEST[:ro] with an absolute DEST, got '{s}'"));
    }
    Ok(MountArg {
        source: PathBuf::from(source),
        dest: dest.to_owned(),
        readonly,
    })
}

impl RunArgs {
    fn meta(&self) -> ExecutionMeta {
        let mut meta = ExecutionMeta::new(self.command.iter().cloned())
            .with_cwd(self.cwd.as_str())
            .with_user(self.user.as_str())
            .with_network(self.network);
        for (key, value) in &self.env {
            meta = meta.with_env(key.as_str(), value.as_str());
        }
        if let Some(hostname) = &self.hostname {
            meta = meta.with_hostname(hostname.as_str());
        }
        meta
    }

    fn mounts(&self) -> Vec<Mount> {
        self.mounts
            .iter()
            .map(|m| {
                let dir = LocalDir::new(&m.source);
                let mount = Mount::new(m.dest.as_str(), Arc::new(dir));
                if m.readonly {
                    mount.read_only()
                } else {
                    mount
                }
            })
            .collect()
    }
}

#[allow(clippy::needless_pass_by_value)]
pub fn run(config: &ExecutorConfig, args: RunArgs, json_output: bool) -> Result<u8, String> {
    if std::env::var("KILN_SKIP_PREREQS").as_deref() != Ok("1") {
        let missing = kiln_runtime::check_runtime_prereqs(&config.runtime);
        if !missing.is_empty() {
            return Err(kiln_runtime::format_missing(&missing));
        }
    }

    let executor = Executor::new(config)
        .map_err(|e| format!("config error: {e}"))?
        .with_progress(Arc::new(TracingProgress));

    let base = Context::background();
    install_cancel_handler(&base).map_err(|e| format!("failed to install Ctrl-C handler: {e}"))?;
    let ctx = match args.timeout {
        Some(secs) => base.with_timeout(Duration::from_secs(secs)),
        None => base.child(),
    };

    let root = if args.readonly {
        LocalDir::read_only(&args.rootfs)
    } else {
        LocalDir::new(&args.rootfs)
    };
    let result = executor.exec(&ctx, &args.meta(), &root, &args.mounts(), StepIo::inherit());

    let outcome = StepOutcome::of(&result);
    if json_output {
        let json = serde_json::json!({
            "outcome": outcome,
            "error": result.as_ref().err().map(ToString::to_string),
        });
        println!("{}", json_pretty(&json)?);
    } else if let Err(e) = &result {
        eprintln!("{}: {e}", colorize_outcome(&outcome));
    }

    Ok(exit_code(&result))
}

fn exit_code(result: &Result<(), ExecError>) -> u8 {
    match result {
        Ok(()) => EXIT_SUCCESS,
        Err(ExecError::StepFailed { exit_code }) => u8::try_from(*exit_code)
            .ok()
            .filter(|c| *c != 0)
            .unwrap_or(EXIT_FAILURE),
        Err(ExecError::Cancelled { .. }) => EXIT_CANCELLED,
        Err(ExecError::Setup { .. }) => EXIT_SETUP_ERROR,
        Err(ExecError::Config(_)) => EXIT_CONFIG_ERROR,
        Err(ExecError::Io(_)) => EXIT_FAILURE,
    }
}
