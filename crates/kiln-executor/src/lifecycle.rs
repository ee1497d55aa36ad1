use std::fmt;
use tracing::debug;

/// Where a single step execution is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepState {
    Idle,
    BundlePrepared,
    RootMounted,
    IdentityResolved,
    SpecPersisted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TornDown,
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::BundlePrepared => "bundle-prepared",
            Self::RootMounted => "root-mounted",
            Self::IdentityResolved => "identity-resolved",
            Self::SpecPersisted => "spec-persisted",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TornDown => "torn-down",
        };
        f.write_str(s)
    }
}

/// Setup may stop at any point and go straight to teardown; once torn down a
/// step is finished for good.
pub fn is_valid_transition(from: StepState, to: StepState) -> bool {
    use StepState::{
        BundlePrepared, Cancelled, Failed, IdentityResolved, Idle, RootMounted, Running,
        SpecPersisted, Succeeded, TornDown,
    };
    matches!(
        (from, to),
        (Idle, BundlePrepared)
            | (BundlePrepared, RootMounted)
            | (RootMounted, IdentityResolved)
            | (IdentityResolved, SpecPersisted)
            | (SpecPersisted, Running)
            | (Running, Succeeded | Failed | Cancelled)
            | (
                Idle | BundlePrepared
                    | RootMounted
                    | IdentityResolved
                    | SpecPersisted
                    | Succeeded
                    | Failed
                    | Cancelled,
                TornDown
            )
    )
}

/// Records the states one step passes through.
#[derive(Debug, Clone)]
pub struct StepTracker {
    id: String,
    history: Vec<StepState>,
}

impl StepTracker {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            history: vec![StepState::Idle],
        }
    }

    pub fn state(&self) -> StepState {
        self.history.last().copied().unwrap_or(StepState::Idle)
    }

    pub fn history(&self) -> &[StepState] {
        &self.history
    }

    pub fn advance(&mut self, to: StepState) {
        let from = self.state();
        debug_assert!(
            is_valid_transition(from, to),
            "invalid step transition {from} -> {to}"
        );
        debug!("{}: {from} -> {to}", self.id);
        self.history.push(to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(is_valid_transition(StepState::Idle, StepState::BundlePrepared));
        assert!(is_valid_transition(StepState::SpecPersisted, StepState::Running));
        assert!(is_valid_transition(StepState::Running, StepState::Cancelled));
        assert!(is_valid_transition(StepState::Succeeded, StepState::TornDown));
        assert!(is_valid_transition(StepState::RootMounted, StepState::TornDown)); // setup failed
    }

    #[test]
    fn invalid_transitions() {
        assert!(!is_valid_transition(StepState::Idle, StepState::Running));
        assert!(!is_valid_transition(StepState::Running, StepState::TornDown));
        assert!(!is_valid_transition(StepState::TornDown, StepState::TornDown));
        assert!(!is_valid_transition(StepState::TornDown, StepState::Idle));
        assert!(!is_valid_transition(StepState::Failed, StepState::Running));
    }

    #[test]
    fn tracker_records_history() {
        let mut t = StepTracker::new("abc");
        for s in [
            StepState::BundlePrepared,
            StepState::RootMounted,
            StepState::IdentityResolved,
            StepState::SpecPersisted,
            StepState::Running,
            StepState::Failed,
            StepState::TornDown,
        ] {
            t.advance(s);
        }
        assert_eq!(t.state(), StepState::TornDown);
        assert_eq!(t.history().len(), 8);
    }
}
