//! Step lifecycle notifications.

use crate::{ExecError, SetupStage};
use chrono::{DateTime, Utc};
use kiln_schema::BundleId;
use serde::Serialize;
use tracing::info;

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed(i32),
    Cancelled,
    SetupFailed(SetupStage),
    StreamFailed,
}

impl StepOutcome {
    pub fn of(result: &Result<(), ExecError>) -> Self {
        match result {
            Ok(()) => Self::Succeeded,
            Err(ExecError::StepFailed { exit_code }) => Self::Failed(*exit_code),
            Err(ExecError::Cancelled { .. }) => Self::Cancelled,
            Err(ExecError::Setup { stage, .. }) => Self::SetupFailed(*stage),
            Err(ExecError::Config(_)) => Self::SetupFailed(SetupStage::Validation),
            Err(ExecError::Io(_)) => Self::StreamFailed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StepEvent {
    Started {
        bundle_id: BundleId,
        args: Vec<String>,
        at: DateTime<Utc>,
    },
    Finished {
        bundle_id: BundleId,
        outcome: StepOutcome,
        at: DateTime<Utc>,
        elapsed_ms: u64,
    },
}

impl StepEvent {
    pub fn bundle_id(&self) -> &BundleId {
        match self {
            Self::Started { bundle_id, .. } | Self::Finished { bundle_id, .. } => bundle_id,
        }
    }
}

/// Receives lifecycle events for every step an executor runs. Called on the
/// executing thread, so implementations should return quickly.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &StepEvent);
}

/// Logs each event at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn on_event(&self, event: &StepEvent) {
        match event {
            StepEvent::Started { bundle_id, args, .. } => {
                info!("step {} started: {}", bundle_id.short(), args.join(" "));
            }
            StepEvent::Finished {
                bundle_id,
                outcome,
                elapsed_ms,
                ..
            } => {
                info!(
                    "step {} finished in {elapsed_ms}ms: {outcome:?}",
                    bundle_id.short()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_from_result() {
        assert_eq!(StepOutcome::of(&Ok(())), StepOutcome::Succeeded);
        assert_eq!(
            StepOutcome::of(&Err(ExecError::StepFailed { exit_code: 2 })),
            StepOutcome::Failed(2)
        );
        assert_eq!(
            StepOutcome::of(&Err(ExecError::setup(SetupStage::Identity)(
                kiln_runtime::RuntimeError::UserNotFound("nobody".to_owned())
            ))),
            StepOutcome::SetupFailed(SetupStage::Identity)
        );
        assert_eq!(
            StepOutcome::of(&Err(ExecError::Io(std::io::Error::other("pipe")))),
            StepOutcome::StreamFailed
        );
    }

    #[test]
    fn events_serialize_tagged() {
        let event = StepEvent::Finished {
            bundle_id: BundleId::new("0123456789abcdef0123456789abcdef"),
            outcome: StepOutcome::Failed(1),
            at: Utc::now(),
            elapsed_ms: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "finished");
        assert_eq!(json["outcome"]["status"], "failed");
        assert_eq!(json["outcome"]["detail"], 1);
        assert_eq!(json["elapsed_ms"], 42);
        assert_eq!(event.bundle_id().short(), "0123456789ab");
    }
}
