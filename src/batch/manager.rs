//! Station-grouping batch manager.
//!
//! Records accumulate per [`GroupKey`]. A group is flushed as soon as it reaches
//! `max_batch_size`. Once the whole buffer reaches `max_buffer_size`, groups are
//! flushed until it drops below `target_buffer_size`: records without any station
//! identity first, then the largest groups. Biggest-first keeps the number of batches
//! per source file low while bounding what is held in memory.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, instrument};

use super::{BatchOutcome, BatchSubmitter, GroupKey, ResultBatcher};
use crate::config::BatchLimits;
use crate::error::Result;
use crate::logging::log_batch_operation;
use crate::record::QcResult;
use crate::store::WorkingRecord;

#[derive(Debug)]
struct PendingGroup {
    group_key: GroupKey,
    working_uuids: Vec<String>,
    outcome: BatchOutcome,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct BatchManager {
    limits: BatchLimits,
    groups: HashMap<String, PendingGroup>,
    buffered: usize,
    next_seq: u64,
}

impl BatchManager {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Records currently held across all groups
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Auto-flush order: the unidentified group, then by size descending, oldest first on ties
    fn flush_order(&self) -> Vec<String> {
        let mut order: Vec<(&String, &PendingGroup)> = self.groups.iter().collect();
        order.sort_by(|(_, a), (_, b)| {
            b.group_key
                .is_unidentified()
                .cmp(&a.group_key.is_unidentified())
                .then(b.working_uuids.len().cmp(&a.working_uuids.len()))
                .then(a.seq.cmp(&b.seq))
        });
        order.into_iter().map(|(key, _)| key.clone()).collect()
    }

    async fn check_auto_flush(&mut self, submitter: &mut dyn BatchSubmitter) -> Result<()> {
        let Some(max_buffer) = self.limits.max_buffer_size else {
            return Ok(());
        };
        if self.buffered < max_buffer {
            return Ok(());
        }
        let target = self.limits.target_buffer_size.unwrap_or(max_buffer);
        debug!(buffered = self.buffered, max_buffer, target, "Buffer full, flushing groups");
        for key in self.flush_order() {
            self.flush(submitter, &key).await?;
            if self.buffered < target {
                break;
            }
        }
        Ok(())
    }

    #[instrument(skip(self, submitter), fields(buffered = self.buffered))]
    async fn flush(&mut self, submitter: &mut dyn BatchSubmitter, batch_key: &str) -> Result<()> {
        let Some(group) = self.groups.get(batch_key) else {
            return Ok(());
        };
        let dedupe_key = group.group_key.dedupe_key();
        // A failed submission leaves the group buffered
        let batch_uuid = submitter
            .submit_batch(&group.working_uuids, group.outcome, dedupe_key.as_deref())
            .await?;
        let Some(group) = self.groups.remove(batch_key) else {
            return Ok(());
        };
        self.buffered -= group.working_uuids.len();
        log_batch_operation(
            "flush",
            Some(&batch_uuid),
            dedupe_key.as_deref(),
            group.working_uuids.len(),
            Some(&group.outcome.to_string()),
        );
        Ok(())
    }
}

#[async_trait]
impl ResultBatcher for BatchManager {
    async fn add_result(
        &mut self,
        submitter: &mut dyn BatchSubmitter,
        working: &WorkingRecord,
        result: QcResult,
    ) -> Result<()> {
        let group_key = GroupKey::from_record(&working.record);
        let batch_key = group_key.batch_key();
        let outcome = BatchOutcome::from_result(result);
        let seq = self.next_seq;
        let group = self.groups.entry(batch_key.clone()).or_insert_with(|| PendingGroup {
            group_key,
            working_uuids: Vec::new(),
            outcome,
            seq,
        });
        if group.seq == seq {
            self.next_seq += 1;
        }
        group.outcome = group.outcome.escalate(outcome);
        group.working_uuids.push(working.working_uuid.clone());
        let group_size = group.working_uuids.len();
        self.buffered += 1;

        if self.limits.max_batch_size.is_some_and(|max| group_size >= max) {
            self.flush(submitter, &batch_key).await?;
        }
        self.check_auto_flush(submitter).await
    }

    async fn flush_all(&mut self, submitter: &mut dyn BatchSubmitter) -> Result<()> {
        let mut keys: Vec<(u64, String)> = self.groups.iter().map(|(k, g)| (g.seq, k.clone())).collect();
        keys.sort();
        for (_, key) in keys {
            self.flush(submitter, &key).await?;
        }
        Ok(())
    }

    fn removes_original_batch(&self) -> bool {
        true
    }

    fn pending_groups(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::testing::RecordingSubmitter;
    use crate::constants::element_names;
    use crate::record::DataRecord;
    use chrono::NaiveDate;

    fn record(station: Option<&str>) -> WorkingRecord {
        let mut data = DataRecord::new();
        if let Some(s) = station {
            data.metadata.set_value(element_names::STATION, s);
        }
        WorkingRecord::new(data, "src", NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), 0, 0)
    }

    fn limits(batch: Option<usize>, buffer: Option<usize>, target: Option<usize>) -> BatchLimits {
        BatchLimits {
            max_batch_size: batch,
            max_buffer_size: buffer,
            target_buffer_size: target,
        }
    }

    #[tokio::test]
    async fn test_max_batch_size_flushes_eagerly() {
        let mut manager = BatchManager::new(limits(Some(2), None, None));
        let mut submitter = RecordingSubmitter::default();
        let records: Vec<WorkingRecord> = (0..3).map(|_| record(Some("X"))).collect();

        manager.add_result(&mut submitter, &records[0], QcResult::Pass).await.unwrap();
        assert!(submitter.submissions.is_empty());
        manager.add_result(&mut submitter, &records[1], QcResult::Pass).await.unwrap();
        assert_eq!(submitter.submissions.len(), 1);
        assert_eq!(submitter.submissions[0].working_uuids.len(), 2);

        manager.add_result(&mut submitter, &records[2], QcResult::Pass).await.unwrap();
        assert_eq!(manager.pending_groups(), 1);
        manager.flush_all(&mut submitter).await.unwrap();
        assert_eq!(submitter.submissions.len(), 2);
        assert_eq!(submitter.submissions[1].group_key, Some("X".to_string()));
        assert_eq!(submitter.submissions[0].group_key, submitter.submissions[1].group_key);
        assert_eq!(manager.pending_groups(), 0);
    }

    #[tokio::test]
    async fn test_review_escalates_whole_group() {
        let mut manager = BatchManager::new(BatchLimits::default());
        let mut submitter = RecordingSubmitter::default();
        manager.add_result(&mut submitter, &record(Some("X")), QcResult::ManualReview).await.unwrap();
        manager.add_result(&mut submitter, &record(Some("X")), QcResult::Pass).await.unwrap();
        manager.add_result(&mut submitter, &record(Some("Y")), QcResult::Pass).await.unwrap();
        manager.flush_all(&mut submitter).await.unwrap();

        assert_eq!(submitter.submissions.len(), 2);
        assert_eq!(submitter.submissions[0].outcome, BatchOutcome::ReviewQueue);
        assert_eq!(submitter.submissions[0].working_uuids.len(), 2);
        assert_eq!(submitter.submissions[1].outcome, BatchOutcome::NextQueue);
    }

    #[tokio::test]
    async fn test_failed_submission_keeps_group_buffered() {
        let mut manager = BatchManager::new(BatchLimits::default());
        let mut submitter = RecordingSubmitter {
            failures_left: 1,
            ..Default::default()
        };
        manager.add_result(&mut submitter, &record(Some("X")), QcResult::Pass).await.unwrap();
        manager.add_result(&mut submitter, &record(Some("X")), QcResult::Pass).await.unwrap();

        assert!(manager.flush_all(&mut submitter).await.is_err());
        assert_eq!(manager.buffered(), 2);
        assert_eq!(manager.pending_groups(), 1);

        manager.flush_all(&mut submitter).await.unwrap();
        assert_eq!(submitter.submissions.len(), 1);
        assert_eq!(submitter.submissions[0].working_uuids.len(), 2);
        assert_eq!(manager.buffered(), 0);
    }

    #[tokio::test]
    async fn test_auto_flush_order() {
        let mut manager = BatchManager::new(limits(None, Some(6), Some(3)));
        let mut submitter = RecordingSubmitter::default();
        for station in [Some("A"), Some("B"), Some("B"), None, Some("C"), Some("C")] {
            manager.add_result(&mut submitter, &record(station), QcResult::Pass).await.unwrap();
        }
        // 6 buffered: unidentified first (5 left), then B (3 left), then C (1 left).
        let keys: Vec<Option<String>> = submitter.submissions.iter().map(|s| s.group_key.clone()).collect();
        assert_eq!(keys, vec![None, Some("B".to_string()), Some("C".to_string())]);
        assert_eq!(manager.buffered(), 1);
        assert_eq!(manager.pending_groups(), 1);
    }
}
