//! # QC Worker
//!
//! Runs the configured QC suites over the working records of a batch or source file,
//! writes modified records back and regroups the results into new batches.
//!
//! ## Batching mode
//!
//! Station grouping ([`BatchManager`]) is used for source files and whenever a suite
//! may change a record's station; the originating batch is deleted afterwards.
//! Re-verification of a batch with station-invariant suites resubmits the existing
//! batch instead ([`SimpleBatchManager`]).
//!
//! The worker finalises its own queue item, so every processed payload reports
//! [`QueueItemResult::Handled`].

use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::payload_worker::{PayloadContext, PayloadProcessor, PayloadWorker, WorkerIdentity};
use super::{QueueItemProcessor, QueueItemResult, WorkerSpec};
use crate::batch::{BatchManager, ResultBatcher, ReviewRouting, SessionBatchSubmitter, SimpleBatchManager};
use crate::config::{BatchLimits, WorkerSettings};
use crate::constants::working_keys;
use crate::error::{QcError, Result};
use crate::pool::WorkerFactory;
use crate::qc::{QcServices, QcSuiteRegistry, QcTestRunner};
use crate::store::{LockMode, WorkingRecord};
use crate::workflow::PayloadKind;

/// Pipeline class name the QC worker is registered under
pub const CLASS_NAME: &str = "nodb_qc";

#[derive(Debug)]
pub struct QcWorker {
    runner: QcTestRunner,
    routing: ReviewRouting,
    limits: BatchLimits,
}

impl QcWorker {
    pub fn new(runner: QcTestRunner, routing: ReviewRouting, limits: BatchLimits) -> Self {
        Self {
            runner,
            routing,
            limits,
        }
    }

    /// Build from a worker's config map; unknown suite names are configuration errors
    pub fn from_spec(spec: &WorkerSpec, registry: &QcSuiteRegistry, services: &QcServices) -> Result<Self> {
        let settings = WorkerSettings::from_map(&spec.config)?;
        let own_queue = settings.require_queue_name()?.to_string();
        let runner = registry.build_runner(&settings.qc_tests, &spec.process_uuid, services)?;
        let routing = ReviewRouting::from_settings(&settings, &own_queue, runner.test_names());
        Ok(Self::new(runner, routing, settings.batch_limits()))
    }

    /// Worker factory for the pool registry
    pub fn factory(registry: Arc<QcSuiteRegistry>, services: QcServices) -> WorkerFactory {
        Arc::new(move |spec: &WorkerSpec| -> Result<Box<dyn QueueItemProcessor>> {
            let worker = QcWorker::from_spec(spec, &registry, &services)?;
            let identity = WorkerIdentity::new(&spec.process_name, &spec.process_uuid);
            Ok(Box::new(PayloadWorker::new(identity, worker)))
        })
    }

    pub fn routing(&self) -> &ReviewRouting {
        &self.routing
    }

    fn build_batcher(&self, kind: &PayloadKind) -> Box<dyn ResultBatcher> {
        let regroup = !self.runner.is_station_invariant() || matches!(kind, PayloadKind::SourceFile { .. });
        if regroup {
            Box::new(BatchManager::new(self.limits))
        } else {
            Box::new(SimpleBatchManager::new())
        }
    }
}

/// Refresh the indexed columns and the `qc_tests` list after QC modified a record
fn prepare_for_update(working: &mut WorkingRecord) {
    working.refresh_from_record();
    let names: BTreeSet<&str> = working
        .record
        .qc_tests
        .iter()
        .map(|run| run.test_name.as_str())
        .collect();
    let names: Vec<&str> = names.into_iter().collect();
    working.set_metadata(working_keys::QC_TESTS, Some(json!(names)));
}

#[async_trait]
impl PayloadProcessor for QcWorker {
    fn accepts(&self, kind: &PayloadKind) -> bool {
        matches!(kind, PayloadKind::Batch { .. } | PayloadKind::SourceFile { .. })
    }

    #[instrument(skip(self, ctx), fields(payload = ctx.payload.kind.type_name()))]
    async fn process_payload(&mut self, ctx: &mut PayloadContext<'_>) -> Result<QueueItemResult> {
        let (original_batch, records) = match &ctx.payload.kind {
            PayloadKind::Batch { batch_uuid } => {
                let batch = ctx
                    .session
                    .load_batch(batch_uuid, LockMode::ForNoKeyUpdate)
                    .await?
                    .ok_or_else(|| QcError::invariant(format!("batch {batch_uuid} does not exist")))?;
                let records = ctx
                    .session
                    .working_records_for_batch(&batch.batch_uuid, LockMode::ForNoKeyUpdate)
                    .await?;
                (Some(batch.batch_uuid), records)
            }
            PayloadKind::SourceFile { source_uuid, received } => {
                let loaded = ctx
                    .session
                    .working_records_for_source(source_uuid, *received, LockMode::ForNoKeyUpdate)
                    .await?;
                // Records batched by an earlier, interrupted attempt stay where they are
                let (batched, records): (Vec<WorkingRecord>, Vec<WorkingRecord>) =
                    loaded.into_iter().partition(|w| w.qc_batch_id.is_some());
                if !batched.is_empty() {
                    debug!(skipped = batched.len(), "Skipping records already in a batch");
                }
                (None, records)
            }
            other => {
                return Err(QcError::payload(
                    1000,
                    format!("QC requires a batch or source file payload, found [{}]", other.type_name()),
                ))
            }
        };
        debug!(records = records.len(), "Loaded working records");

        let mut batcher = self.build_batcher(&ctx.payload.kind);
        let outcomes = self.runner.process_batch(records).await?;
        {
            let mut submitter =
                SessionBatchSubmitter::new(&mut *ctx.session, &self.routing, ctx.payload, ctx.identity);
            for outcome in outcomes {
                let mut working = outcome.working;
                if outcome.modified {
                    prepare_for_update(&mut working);
                    submitter.session().update_working_record(&working).await?;
                }
                batcher.add_result(&mut submitter, &working, outcome.result).await?;
            }
            batcher.flush_all(&mut submitter).await?;
        }

        if batcher.removes_original_batch() {
            if let Some(batch_uuid) = original_batch {
                ctx.session.delete_batch(&batch_uuid).await?;
            }
        }
        ctx.session.mark_complete(ctx.item).await?;
        ctx.session.commit().await?;
        Ok(QueueItemResult::Handled)
    }
}
