//! Batch submission through a store session.
//!
//! Every submission creates (or reuses) a batch row, emits a Batch payload continuing
//! the originating workflow and commits. A review submission also records where the
//! batch goes after review and how to recheck or escalate it.

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use super::{BatchOutcome, BatchSubmitter};
use crate::config::WorkerSettings;
use crate::constants::metadata_keys;
use crate::error::Result;
use crate::logging::log_queue_operation;
use crate::store::{BatchStatus, NodbSession};
use crate::worker::WorkerIdentity;
use crate::workflow::{PayloadKind, WorkflowPayload};

/// Queues a QC worker routes batches to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRouting {
    pub next_queue: String,
    pub review_queue: String,
    /// Where a reviewed batch is sent to be tested again
    pub recheck_queue: String,
    pub escalation_queue: Option<String>,
    pub test_names: Vec<String>,
}

impl ReviewRouting {
    /// Routing from worker settings; rechecks default to the worker's own queue
    pub fn from_settings(settings: &WorkerSettings, own_queue: &str, test_names: Vec<String>) -> Self {
        Self {
            next_queue: settings.next_queue.clone(),
            review_queue: settings.review_queue.clone(),
            recheck_queue: settings
                .recheck_queue
                .clone()
                .filter(|q| !q.is_empty())
                .unwrap_or_else(|| own_queue.to_string()),
            escalation_queue: settings.escalation_queue.clone().filter(|q| !q.is_empty()),
            test_names,
        }
    }

    /// Set the review metadata on `payload` and return the target queue
    pub fn route<'r>(&'r self, payload: &mut WorkflowPayload, outcome: BatchOutcome) -> &'r str {
        match outcome {
            BatchOutcome::ReviewQueue => {
                payload.set_followup_queue(Some(&self.next_queue));
                payload.set_metadata(metadata_keys::CURRENT_QC_TESTS, Some(json!(self.test_names)));
                payload.set_metadata(metadata_keys::RECHECK_QUEUE, Some(json!(self.recheck_queue)));
                payload.set_metadata(
                    metadata_keys::ESCALATION_QUEUE,
                    self.escalation_queue.as_deref().map(|q| json!(q)),
                );
                payload.set_metadata(metadata_keys::DESCALATION_QUEUE, Some(json!(self.review_queue)));
                &self.review_queue
            }
            BatchOutcome::NextQueue => {
                payload.set_followup_queue(None);
                for key in [
                    metadata_keys::CURRENT_QC_TESTS,
                    metadata_keys::RECHECK_QUEUE,
                    metadata_keys::ESCALATION_QUEUE,
                    metadata_keys::DESCALATION_QUEUE,
                ] {
                    payload.set_metadata(key, None::<JsonValue>);
                }
                &self.next_queue
            }
        }
    }
}

/// [`BatchSubmitter`] writing through the worker's session
pub struct SessionBatchSubmitter<'s> {
    session: &'s mut dyn NodbSession,
    routing: &'s ReviewRouting,
    origin: &'s WorkflowPayload,
    identity: &'s WorkerIdentity,
}

impl<'s> SessionBatchSubmitter<'s> {
    pub fn new(
        session: &'s mut dyn NodbSession,
        routing: &'s ReviewRouting,
        origin: &'s WorkflowPayload,
        identity: &'s WorkerIdentity,
    ) -> Self {
        Self {
            session,
            routing,
            origin,
            identity,
        }
    }

    /// Give the session back for further writes
    pub fn session(&mut self) -> &mut dyn NodbSession {
        &mut *self.session
    }
}

#[async_trait]
impl BatchSubmitter for SessionBatchSubmitter<'_> {
    async fn submit_batch(
        &mut self,
        working_uuids: &[String],
        outcome: BatchOutcome,
        group_key: Option<&str>,
    ) -> Result<String> {
        let batch = self.session.create_batch(BatchStatus::Queued).await?;
        self.session
            .bulk_set_batch_uuid(working_uuids, &batch.batch_uuid)
            .await?;
        self.submit_existing_batch(&batch.batch_uuid, outcome, group_key)
            .await?;
        Ok(batch.batch_uuid)
    }

    async fn submit_existing_batch(
        &mut self,
        batch_uuid: &str,
        outcome: BatchOutcome,
        group_key: Option<&str>,
    ) -> Result<()> {
        let mut payload = self.origin.propagate(
            PayloadKind::Batch {
                batch_uuid: batch_uuid.to_string(),
            },
            false,
        );
        self.identity.stamp(&mut payload);
        let queue_name = self.routing.route(&mut payload, outcome).to_string();
        payload.set_unique_key(group_key);

        let status = match outcome {
            BatchOutcome::ReviewQueue => BatchStatus::ManualReview,
            BatchOutcome::NextQueue => BatchStatus::Queued,
        };
        self.session.set_batch_status(batch_uuid, status).await?;
        let queue_uuid = payload.enqueue(&mut *self.session, &queue_name, None).await?;
        self.session.commit().await?;
        log_queue_operation(
            "submit_batch",
            &queue_name,
            Some(&queue_uuid.to_string()),
            "queued",
            Some(batch_uuid),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LockMode, MemoryStore, RecordStore, WorkingRecord};
    use crate::record::DataRecord;
    use chrono::NaiveDate;

    fn routing() -> ReviewRouting {
        let settings = WorkerSettings {
            escalation_queue: Some("nodb_escalated".to_string()),
            ..WorkerSettings::default()
        };
        ReviewRouting::from_settings(&settings, "nodb_qc", vec!["nodb_station_check".to_string()])
    }

    #[test]
    fn test_review_routing_sets_and_clears_keys() {
        let routing = routing();
        let mut payload = WorkflowPayload::batch("wf", 2, "b1");
        assert_eq!(routing.route(&mut payload, BatchOutcome::ReviewQueue), "nodb_manual_review");
        assert_eq!(payload.followup_queue(), Some("nodb_continue"));
        assert_eq!(
            payload.get_metadata(metadata_keys::RECHECK_QUEUE),
            Some(&json!("nodb_qc"))
        );
        assert_eq!(
            payload.get_metadata(metadata_keys::CURRENT_QC_TESTS),
            Some(&json!(["nodb_station_check"]))
        );

        assert_eq!(routing.route(&mut payload, BatchOutcome::NextQueue), "nodb_continue");
        assert_eq!(payload.followup_queue(), None);
        assert_eq!(payload.get_metadata(metadata_keys::ESCALATION_QUEUE), None);
        assert_eq!(payload.get_metadata(metadata_keys::DESCALATION_QUEUE), None);
    }

    #[tokio::test]
    async fn test_submit_batch_assigns_members_and_queues_payload() {
        let store = MemoryStore::new();
        let received = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let members: Vec<WorkingRecord> = (0..2)
            .map(|i| WorkingRecord::new(DataRecord::new(), "src", received, 0, i))
            .collect();
        let uuids: Vec<String> = members.iter().map(|w| w.working_uuid.clone()).collect();
        store.seed_working_records(members);

        let routing = routing();
        let origin = WorkflowPayload::source_file("wf", 1, "src", received);
        let identity = WorkerIdentity::new("nodb_qc", "proc-1");
        let mut session = store.session();
        let mut submitter = SessionBatchSubmitter::new(&mut session, &routing, &origin, &identity);
        let batch_uuid = submitter
            .submit_batch(&uuids, BatchOutcome::ReviewQueue, Some("station-x"))
            .await
            .unwrap();

        let queued = store.queue_items("nodb_manual_review");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].unique_item_name.as_deref(), Some("station-x"));
        let payload = WorkflowPayload::from_queue_item(&queued[0]).unwrap();
        assert_eq!(
            payload.kind,
            PayloadKind::Batch {
                batch_uuid: batch_uuid.clone()
            }
        );
        assert_eq!(payload.current_step, 1);
        assert_eq!(store.batch(&batch_uuid).unwrap().status, BatchStatus::ManualReview);

        let mut check = store.session();
        let assigned = check
            .working_records_for_batch(&batch_uuid, LockMode::None)
            .await
            .unwrap();
        assert_eq!(assigned.len(), 2);
    }
}
