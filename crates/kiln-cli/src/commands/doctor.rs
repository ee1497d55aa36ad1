use super::{json_pretty, EXIT_FAILURE, EXIT_SUCCESS};
use console::Style;
use kiln_executor::RootLock;
use kiln_runtime::Runc;
use kiln_schema::ExecutorConfig;
use serde::Serialize;

pub fn run(config: &ExecutorConfig, json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    check_prereqs(config, &mut checks, &mut all_pass);

    match Runc::new(&config.runtime).version() {
        Ok(version) => checks.push(Check::pass("runtime_version", &version)),
        Err(e) => checks.push(Check::info("runtime_version", &e.to_string())),
    }

    check_root(config, &mut checks, &mut all_pass);

    print_results(&checks, all_pass, json_output)
}

fn check_prereqs(config: &ExecutorConfig, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let missing = kiln_runtime::check_runtime_prereqs(&config.runtime);
    if missing.is_empty() {
        checks.push(Check::pass(
            "runtime_prereqs",
            "Runtime prerequisites satisfied",
        ));
        return;
    }
    *all_pass = false;
    for m in missing {
        checks.push(Check::fail(
            "runtime_prereqs",
            &format!("{}: {} (fix: {})", m.name, m.purpose, m.install_hint),
        ));
    }
}

fn check_root(config: &ExecutorConfig, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let root = &config.root;
    match std::fs::symlink_metadata(root) {
        Err(_) => {
            checks.push(Check::info(
                "executor_root",
                &format!(
                    "{} does not exist (will be created on first run)",
                    root.display()
                ),
            ));
            return;
        }
        Ok(meta) if meta.file_type().is_symlink() => {
            *all_pass = false;
            checks.push(Check::fail(
                "executor_root",
                &format!("{} is a symlink; executors refuse it", root.display()),
            ));
            return;
        }
        Ok(_) => checks.push(Check::pass(
            "executor_root",
            &format!("{} exists", root.display()),
        )),
    }

    match RootLock::try_exclusive(&root.join(kiln_executor::concurrency::LOCK_FILE)) {
        Ok(Some(_)) => checks.push(Check::pass("executor_lock", "No executor holds the root")),
        Ok(None) => checks.push(Check::info(
            "executor_lock",
            "Root is in use by a running executor",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("executor_lock", &e.to_string()));
        }
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks,
        });
        println!("{}", json_pretty(&json)?);
    } else {
        println!("kiln doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => Style::new().green().apply_to("✓"),
                "fail" => Style::new().red().apply_to("✗"),
                "warn" => Style::new().yellow().apply_to("⚠"),
                _ => Style::new().dim().apply_to("ℹ"),
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

#[derive(Serialize)]
struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}
