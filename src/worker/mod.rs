//! # Queue Workers
//!
//! A queue worker is a single-consumer loop around one named queue. It reserves the
//! next item, hands it to a [`QueueItemProcessor`] and records the outcome before the
//! next reservation.
//!
//! ## Overview
//!
//! - [`QueueWorker`]: the loop, with idle [`Backoff`] and outcome bookkeeping
//! - [`QueueItemProcessor`]: what to do with one item, plus lifecycle hooks
//! - [`PayloadWorker`]: adapter that decodes a [`WorkflowPayload`](crate::workflow::WorkflowPayload)
//!   before dispatch
//! - [`QcWorker`]: the QC processor (tests records, batches results)
//! - [`ProgressWorker`]: moves payloads on to their next workflow step

pub mod payload_worker;
pub mod progress_worker;
pub mod qc_worker;
pub mod queue_worker;

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::Result;
use crate::store::{NodbSession, QueueItem};

pub use payload_worker::{PayloadContext, PayloadProcessor, PayloadWorker, WorkerIdentity};
pub use progress_worker::ProgressWorker;
pub use qc_worker::QcWorker;
pub use queue_worker::{Backoff, QueueWorker};

/// Outcome of processing one queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueItemResult {
    /// Mark the item complete
    Success,
    /// Release the item for a later attempt
    Retry,
    /// Mark the item failed
    Failed,
    /// The processor already finalised the item; only commit
    Handled,
}

impl fmt::Display for QueueItemResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueItemResult::Success => "SUCCESS",
            QueueItemResult::Retry => "RETRY",
            QueueItemResult::Failed => "FAILED",
            QueueItemResult::Handled => "HANDLED",
        };
        f.write_str(name)
    }
}

/// What a worker factory receives when a new instance is started
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    /// Name of the pipeline entry this instance belongs to
    pub process_name: String,
    /// Fresh identity of this instance, also used as the queue lock owner
    pub process_uuid: String,
    pub config: Map<String, JsonValue>,
}

/// Per-item processing logic run inside a [`QueueWorker`].
///
/// All writes go through the supplied session; the worker commits after the outcome
/// has been recorded. Hooks default to no-ops.
#[async_trait]
pub trait QueueItemProcessor: Send {
    async fn process_item(
        &mut self,
        session: &mut dyn NodbSession,
        item: &QueueItem,
    ) -> Result<QueueItemResult>;

    /// Called once before the first reservation
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once after the loop exits
    async fn on_complete(&mut self) {}

    fn before_item(&mut self, _item: &QueueItem) {}

    fn after_item(&mut self, _item: &QueueItem, _result: QueueItemResult) {}

    /// Called after a successful outcome has been committed
    fn after_success(&mut self, _item: &QueueItem) {}

    /// Called after a failed outcome has been committed
    fn after_failure(&mut self, _item: &QueueItem) {}

    /// Called after a retry release has been committed
    fn after_retry(&mut self, _item: &QueueItem) {}
}

/// Liveness and load of one worker instance, shared with the pool
#[derive(Debug, Default)]
pub struct WorkerActivity {
    busy: AtomicBool,
    items_processed: AtomicU64,
}

impl WorkerActivity {
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn items_processed(&self) -> u64 {
        self.items_processed.load(Ordering::Acquire)
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    pub(crate) fn record_item(&self) {
        self.items_processed.fetch_add(1, Ordering::AcqRel);
    }
}
