//! Batch manager that keeps existing batch membership.
//!
//! Each record's current `qc_batch_id` is resubmitted once, routed by the worst
//! outcome among its members. The batches themselves are kept.

use async_trait::async_trait;
use std::collections::HashMap;

use super::{BatchOutcome, BatchSubmitter, GroupKey, ResultBatcher};
use crate::error::{QcError, Result};
use crate::logging::log_batch_operation;
use crate::record::QcResult;
use crate::store::WorkingRecord;

#[derive(Debug)]
struct KnownBatch {
    batch_uuid: String,
    outcome: BatchOutcome,
    group_key: Option<String>,
    members: usize,
}

#[derive(Debug, Default)]
pub struct SimpleBatchManager {
    batches: Vec<KnownBatch>,
    index: HashMap<String, usize>,
}

impl SimpleBatchManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultBatcher for SimpleBatchManager {
    async fn add_result(
        &mut self,
        _submitter: &mut dyn BatchSubmitter,
        working: &WorkingRecord,
        result: QcResult,
    ) -> Result<()> {
        let batch_uuid = working.qc_batch_id.as_deref().ok_or_else(|| {
            QcError::invariant(format!("working record {} has no batch id", working.working_uuid))
        })?;
        let outcome = BatchOutcome::from_result(result);
        match self.index.get(batch_uuid) {
            Some(&pos) => {
                let known = &mut self.batches[pos];
                known.outcome = known.outcome.escalate(outcome);
                known.members += 1;
            }
            None => {
                self.index.insert(batch_uuid.to_string(), self.batches.len());
                self.batches.push(KnownBatch {
                    batch_uuid: batch_uuid.to_string(),
                    outcome,
                    group_key: GroupKey::from_record(&working.record).dedupe_key(),
                    members: 1,
                });
            }
        }
        Ok(())
    }

    async fn flush_all(&mut self, submitter: &mut dyn BatchSubmitter) -> Result<()> {
        self.index.clear();
        for known in std::mem::take(&mut self.batches) {
            submitter
                .submit_existing_batch(&known.batch_uuid, known.outcome, known.group_key.as_deref())
                .await?;
            log_batch_operation(
                "resubmit",
                Some(&known.batch_uuid),
                known.group_key.as_deref(),
                known.members,
                Some(&known.outcome.to_string()),
            );
        }
        Ok(())
    }

    fn removes_original_batch(&self) -> bool {
        false
    }

    fn pending_groups(&self) -> usize {
        self.batches.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::testing::RecordingSubmitter;
    use crate::record::DataRecord;
    use chrono::NaiveDate;

    fn member(batch: Option<&str>) -> WorkingRecord {
        let mut working = WorkingRecord::new(
            DataRecord::new(),
            "src",
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            0,
            0,
        );
        working.qc_batch_id = batch.map(str::to_string);
        working
    }

    #[tokio::test]
    async fn test_resubmits_each_batch_once() {
        let mut manager = SimpleBatchManager::new();
        let mut submitter = RecordingSubmitter::default();
        manager.add_result(&mut submitter, &member(Some("b1")), QcResult::Pass).await.unwrap();
        manager.add_result(&mut submitter, &member(Some("b2")), QcResult::Pass).await.unwrap();
        manager.add_result(&mut submitter, &member(Some("b1")), QcResult::Fail).await.unwrap();
        assert_eq!(manager.pending_groups(), 2);

        manager.flush_all(&mut submitter).await.unwrap();
        let submitted: Vec<(&str, BatchOutcome, bool)> = submitter
            .submissions
            .iter()
            .map(|s| (s.batch_uuid.as_str(), s.outcome, s.existing))
            .collect();
        assert_eq!(
            submitted,
            vec![
                ("b1", BatchOutcome::ReviewQueue, true),
                ("b2", BatchOutcome::NextQueue, true)
            ]
        );
        assert_eq!(manager.pending_groups(), 0);
        assert!(!manager.removes_original_batch());
    }

    #[tokio::test]
    async fn test_missing_batch_id_is_invariant_error() {
        let mut manager = SimpleBatchManager::new();
        let mut submitter = RecordingSubmitter::default();
        let err = manager
            .add_result(&mut submitter, &member(None), QcResult::Pass)
            .await
            .unwrap_err();
        assert!(!err.is_recoverable());
    }
}
