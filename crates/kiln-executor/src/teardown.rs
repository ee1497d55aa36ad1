//! Ordered release of everything a step acquired.

use kiln_runtime::RuntimeError;
use std::fmt;
use tracing::{debug, warn};

/// When an entry runs relative to others. Mounts go first so that spec
/// resources and directories are no longer busy when they are released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Unmount,
    Release,
    Remove,
}

type Action = Box<dyn FnOnce() -> Result<(), RuntimeError> + Send>;

struct Entry {
    phase: Phase,
    label: String,
    action: Action,
}

/// Teardown list built up as resources are acquired.
///
/// Entries run by phase, and within a phase in reverse order of acquisition.
/// Each runs at most once: [`run`](Self::run) drains the list, and dropping
/// the value runs whatever is left.
#[derive(Default)]
pub struct Teardown {
    entries: Vec<Entry>,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&mut self, phase: Phase, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Result<(), RuntimeError> + Send + 'static,
    {
        self.entries.push(Entry {
            phase,
            label: label.into(),
            action: Box::new(action),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every pending entry. Failures are logged and do not stop later
    /// entries; the number of failures is returned.
    pub fn run(&mut self) -> usize {
        let mut entries = std::mem::take(&mut self.entries);
        entries.reverse();
        entries.sort_by_key(|e| e.phase);

        let mut failures = 0;
        for entry in entries {
            debug!("teardown: {}", entry.label);
            if let Err(e) = (entry.action)() {
                warn!("teardown: {} failed: {e}", entry.label);
                failures += 1;
            }
        }
        failures
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (e.phase, &e.label)))
            .finish()
    }
}
