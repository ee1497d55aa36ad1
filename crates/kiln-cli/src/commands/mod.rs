pub mod completions;
pub mod doctor;
pub mod run;
pub mod sweep;

use console::Style;
use kiln_executor::StepOutcome;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_SETUP_ERROR: u8 = 3;
pub const EXIT_CANCELLED: u8 = 130;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn colorize_outcome(outcome: &StepOutcome) -> String {
    match outcome {
        StepOutcome::Succeeded => Style::new().green().apply_to("succeeded").to_string(),
        StepOutcome::Failed(code) => Style::new()
            .red()
            .apply_to(format!("failed (exit code {code})"))
            .to_string(),
        StepOutcome::Cancelled => Style::new().yellow().apply_to("cancelled").to_string(),
        StepOutcome::SetupFailed(stage) => Style::new()
            .red()
            .bold()
            .apply_to(format!("setup failed: {stage}"))
            .to_string(),
        StepOutcome::StreamFailed => Style::new()
            .red()
            .apply_to("stream forwarding failed")
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_executor::SetupStage;

    #[test]
    fn json_pretty_serializes_outcome() {
        let result = json_pretty(&StepOutcome::Failed(2)).unwrap();
        assert!(result.contains("\"failed\""));
        assert!(result.contains('2'));
    }

    #[test]
    fn colorize_outcome_mentions_details() {
        assert!(colorize_outcome(&StepOutcome::Succeeded).contains("succeeded"));
        assert!(colorize_outcome(&StepOutcome::Failed(7)).contains("exit code 7"));
        assert!(colorize_outcome(&StepOutcome::Cancelled).contains("cancelled"));
        assert!(colorize_outcome(&StepOutcome::SetupFailed(SetupStage::Identity))
            .contains("resolving user"));
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            EXIT_SUCCESS,
            EXIT_FAILURE,
            EXIT_CONFIG_ERROR,
            EXIT_SETUP_ERROR,
            EXIT_CANCELLED,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
