mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{run::RunArgs, EXIT_CONFIG_ERROR, EXIT_FAILURE};
use kiln_schema::ExecutorConfig;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const DEFAULT_ROOT: &str = "/var/lib/kiln/executor";

#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    version,
    about = "Run build steps in throwaway OCI sandboxes"
)]
struct Cli {
    /// Executor root directory (bundles, runtime log, network files).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Executor config file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// OCI runtime binary.
    #[arg(long, global = true)]
    runtime: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one command in a sandbox over a host directory.
    Run(RunArgs),
    /// Check that this host can run sandboxed steps.
    Doctor,
    /// Remove bundles left behind by crashed executors.
    Sweep,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Config file if given, else defaults; `--root` and `--runtime` win over both.
fn load_config(
    path: Option<&Path>,
    root: Option<&Path>,
    runtime: Option<&str>,
) -> Result<ExecutorConfig, String> {
    let mut config = match path {
        Some(path) => ExecutorConfig::load(path)
            .map_err(|e| format!("config error: {}: {e}", path.display()))?,
        None => ExecutorConfig::new(DEFAULT_ROOT),
    };
    if let Some(root) = root {
        config.root = root.to_path_buf();
    }
    if let Some(runtime) = runtime {
        runtime.clone_into(&mut config.runtime);
    }
    config
        .validate()
        .map_err(|e| format!("config error: {e}"))?;
    Ok(config)
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KILN_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let config = || {
        load_config(
            cli.config.as_deref(),
            cli.root.as_deref(),
            cli.runtime.as_deref(),
        )
    };
    let result = match cli.command {
        Commands::Run(args) => config().and_then(|c| commands::run::run(&c, args, cli.json)),
        Commands::Doctor => config().and_then(|c| commands::doctor::run(&c, cli.json)),
        Commands::Sweep => config().and_then(|c| commands::sweep::run(&c, cli.json)),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };
    exit(result)
}

fn exit(result: Result<u8, String>) -> ExitCode {
    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("config error:") {
                EXIT_CONFIG_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
