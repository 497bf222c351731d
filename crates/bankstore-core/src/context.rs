use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::storage::StoreError;

/// Shared flag a caller flips to abandon in-flight work.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-call context handed down from the caller to the storage backend.
///
/// Carries an optional trace label that is attached to every log line of the
/// call, an optional deadline and an optional cancellation flag. Blocking
/// steps (row lock waits, commit) consult it.
#[derive(Debug, Clone, Default)]
pub struct TxContext {
    label: Option<Arc<str>>,
    deadline: Option<Instant>,
    cancel: Option<CancelFlag>,
}

impl TxContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, label: impl Into<Arc<str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled)
    }

    /// Fails once the caller cancelled or the deadline passed.
    pub fn check(&self) -> Result<(), StoreError> {
        if self.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(StoreError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Clamps a backend wait limit to whatever is left before the deadline.
    pub fn bound(&self, limit: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => remaining.min(limit),
            None => limit,
        }
    }
}
