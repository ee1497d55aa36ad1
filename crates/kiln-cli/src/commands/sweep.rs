use super::{json_pretty, EXIT_FAILURE, EXIT_SUCCESS};
use kiln_executor::sweep_root;
use kiln_schema::ExecutorConfig;

pub fn run(config: &ExecutorConfig, json_output: bool) -> Result<u8, String> {
    let Some(report) = sweep_root(config).map_err(|e| e.to_string())? else {
        return Err(format!(
            "{} is in use by a running executor, not sweeping",
            config.root.display()
        ));
    };

    if json_output {
        println!("{}", json_pretty(&report)?);
    } else if report.is_empty() {
        println!("no stale bundles under {}", config.root.display());
    } else {
        for path in &report.removed {
            println!("removed {}", path.display());
        }
        for skipped in &report.skipped {
            println!("skipped {}: {}", skipped.path.display(), skipped.reason);
        }
    }

    Ok(if report.skipped.is_empty() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}
