//! # Cooperative Halt Signals
//!
//! Cancellation context handed to every blocking call in the worker runtime.
//!
//! A [`HaltFlag`] is a one-way latch: once tripped it stays tripped, and every task
//! waiting on it is woken immediately. [`WorkerSignals`] pairs the process-wide halt
//! flag with a per-instance end flag so the pool controller can retire a single
//! worker without stopping its siblings.
//!
//! Halting is advisory. Work in flight finishes its current transaction; the flag is
//! only observed at suspension points (idle sleeps, the pool tick, between items).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::{QcError, Result};

#[derive(Debug, Default)]
struct HaltState {
    tripped: AtomicBool,
    notify: Notify,
}

/// One-way cooperative cancellation latch
#[derive(Debug, Clone, Default)]
pub struct HaltFlag {
    state: Arc<HaltState>,
}

impl HaltFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the flag and wake every waiter
    pub fn trip(&self) {
        self.state.tripped.store(true, Ordering::Release);
        self.state.notify.notify_waiters();
    }

    pub fn is_tripped(&self) -> bool {
        self.state.tripped.load(Ordering::Acquire)
    }

    /// Return `Err(Halted)` if the flag has been tripped
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_tripped() {
            Err(QcError::halted(operation))
        } else {
            Ok(())
        }
    }

    /// Resolve once the flag is tripped
    pub async fn tripped(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // Register interest before re-checking so a concurrent trip is not missed.
            notified.as_mut().enable();
            if self.is_tripped() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration` unless the flag trips first.
    ///
    /// Returns `true` when the sleep was interrupted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_tripped() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_tripped(),
            _ = self.tripped() => true,
        }
    }
}

/// Halt and end flags observed by a single worker instance
#[derive(Debug, Clone, Default)]
pub struct WorkerSignals {
    /// Process-wide halt, shared by every worker
    pub halt: HaltFlag,
    /// Instance-scoped request to finish after the current item
    pub end: HaltFlag,
}

impl WorkerSignals {
    pub fn new(halt: HaltFlag) -> Self {
        Self {
            halt,
            end: HaltFlag::new(),
        }
    }

    /// Whether the worker loop should start another iteration
    pub fn should_continue(&self) -> bool {
        !self.halt.is_tripped() && !self.end.is_tripped()
    }

    /// Sleep until the duration elapses or either flag trips.
    ///
    /// Returns `true` when the sleep was interrupted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if !self.should_continue() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.should_continue(),
            _ = self.halt.tripped() => true,
            _ = self.end.tripped() => true,
        }
    }
}
