//! Caller-supplied cancellation.
//!
//! A [`Context`] is cheap to clone; all clones observe the same cancellation.
//! Child contexts created with [`Context::child`] or [`Context::with_deadline`]
//! are cancelled when their parent is, but cancelling a child leaves the parent
//! untouched.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a context ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelCause {
    Canceled,
    DeadlineExceeded,
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled => f.write_str("context canceled"),
            Self::DeadlineExceeded => f.write_str("context deadline exceeded"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<Context>,
}

#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never done unless cancelled explicitly.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: None,
                parent: None,
            }),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: None,
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(deadline),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// `None` while the context is live, otherwise the reason it ended.
    pub fn err(&self) -> Option<CancelCause> {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return Some(CancelCause::Canceled);
        }
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() >= deadline {
                return Some(CancelCause::DeadlineExceeded);
            }
        }
        self.inner.parent.as_ref().and_then(Self::err)
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Earliest deadline along the parent chain.
    pub fn deadline(&self) -> Option<Instant> {
        let parent = self.inner.parent.as_ref().and_then(Self::deadline);
        match (self.inner.deadline, parent) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
