//! # Result Batching
//!
//! ## Overview
//!
//! After QC, working records are regrouped into administrative batches before they
//! move on. A batch goes either to the next pipeline step or to manual review, and
//! that decision is shared by every member.
//!
//! - [`BatchManager`]: groups records by station identity, flushing eagerly under
//!   size limits. Used for source files and whenever the QC run can change a
//!   record's station.
//! - [`SimpleBatchManager`]: resubmits the batches the records already belong to.
//!   Used when re-verifying a batch with station-invariant tests.
//! - [`BatchSubmitter`]: the write side; [`SessionBatchSubmitter`] creates batch rows
//!   and queue items through a store session.
//!
//! ## Grouping keys
//!
//! | Record state | Key |
//! |---|---|
//! | `CNODCStation` set | the station uuid |
//! | `CNODCStationCandidates` set | candidates joined by `\x1F`, in stored order |
//! | identifiers present but unresolved | the station string (`WMOID=..&StationName=..`) |
//! | nothing to go on | no key |
//!
//! The key doubles as the queue dedupe key of the emitted batch payload.

pub mod manager;
pub mod simple;
pub mod submitter;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::fmt;

use crate::constants::{element_names, GROUP_SEPARATOR};
use crate::error::Result;
use crate::qc::station::station_string;
use crate::record::{DataRecord, QcResult};
use crate::store::WorkingRecord;
use crate::workflow::payload::sha256_hex;

pub use manager::BatchManager;
pub use simple::SimpleBatchManager;
pub use submitter::{ReviewRouting, SessionBatchSubmitter};

/// Where a flushed batch goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchOutcome {
    NextQueue,
    ReviewQueue,
}

impl BatchOutcome {
    /// Any member needing review or failing sends the batch to review
    pub fn from_result(result: QcResult) -> Self {
        match result {
            QcResult::ManualReview | QcResult::Fail => BatchOutcome::ReviewQueue,
            QcResult::Pass | QcResult::Skip => BatchOutcome::NextQueue,
        }
    }

    /// Escalate-only merge
    pub fn escalate(self, other: BatchOutcome) -> Self {
        if self == BatchOutcome::ReviewQueue || other == BatchOutcome::ReviewQueue {
            BatchOutcome::ReviewQueue
        } else {
            BatchOutcome::NextQueue
        }
    }
}

impl fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchOutcome::NextQueue => f.write_str("next"),
            BatchOutcome::ReviewQueue => f.write_str("review"),
        }
    }
}

/// Station-derived grouping of a record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    Station(String),
    Candidates(Vec<String>),
    StationString(String),
    NoStationId,
}

impl GroupKey {
    pub fn from_record(record: &DataRecord) -> Self {
        let metadata = &record.metadata;
        if let Some(station) = metadata.best_string(element_names::STATION) {
            return GroupKey::Station(station);
        }
        match metadata.best_value(element_names::STATION_CANDIDATES) {
            Some(JsonValue::Array(values)) if !values.is_empty() => {
                let candidates = values
                    .iter()
                    .map(|v| match v {
                        JsonValue::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                return GroupKey::Candidates(candidates);
            }
            Some(JsonValue::String(single)) if !single.is_empty() => {
                return GroupKey::Candidates(vec![single.clone()]);
            }
            _ => {}
        }
        if let Some(stored) = metadata.best_string(element_names::STATION_STRING) {
            return GroupKey::StationString(stored);
        }
        let derived = station_string(record);
        if derived.is_empty() {
            GroupKey::NoStationId
        } else {
            GroupKey::StationString(derived)
        }
    }

    /// Dedupe key of the emitted batch; `None` for records without station identity
    pub fn dedupe_key(&self) -> Option<String> {
        match self {
            GroupKey::Station(s) | GroupKey::StationString(s) => Some(s.clone()),
            GroupKey::Candidates(c) => Some(c.join(GROUP_SEPARATOR.to_string().as_str())),
            GroupKey::NoStationId => None,
        }
    }

    /// Stable hash identifying the pending group
    pub fn batch_key(&self) -> String {
        sha256_hex(&format!("group_key={}", self.dedupe_key().unwrap_or_default()))
    }

    pub fn is_unidentified(&self) -> bool {
        matches!(self, GroupKey::NoStationId)
    }
}

/// Write side of batching
#[async_trait]
pub trait BatchSubmitter: Send {
    /// Create a batch for `working_uuids` and queue it. Returns the new batch uuid.
    async fn submit_batch(
        &mut self,
        working_uuids: &[String],
        outcome: BatchOutcome,
        group_key: Option<&str>,
    ) -> Result<String>;

    /// Queue an existing batch
    async fn submit_existing_batch(
        &mut self,
        batch_uuid: &str,
        outcome: BatchOutcome,
        group_key: Option<&str>,
    ) -> Result<()>;
}

/// Collects QC outcomes and turns them into batch submissions
#[async_trait]
pub trait ResultBatcher: Send {
    async fn add_result(
        &mut self,
        submitter: &mut dyn BatchSubmitter,
        working: &WorkingRecord,
        result: QcResult,
    ) -> Result<()>;

    async fn flush_all(&mut self, submitter: &mut dyn BatchSubmitter) -> Result<()>;

    /// Whether the batch the records were loaded from should be deleted afterwards
    fn removes_original_batch(&self) -> bool;

    fn pending_groups(&self) -> usize;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_key_priority() {
        let mut record = DataRecord::new();
        assert_eq!(GroupKey::from_record(&record), GroupKey::NoStationId);
        assert_eq!(GroupKey::NoStationId.dedupe_key(), None);

        record.metadata.set_value(element_names::WMO_ID, "44137");
        assert_eq!(
            GroupKey::from_record(&record),
            GroupKey::StationString("WMOID=44137".to_string())
        );

        record
            .metadata
            .set_value(element_names::STATION_CANDIDATES, serde_json::json!(["b", "a"]));
        let candidates = GroupKey::from_record(&record);
        assert_eq!(candidates.dedupe_key(), Some("b\u{1F}a".to_string()));

        record.metadata.set_value(element_names::STATION, "s-1");
        assert_eq!(GroupKey::from_record(&record), GroupKey::Station("s-1".to_string()));
    }

    #[test]
    fn test_batch_key_is_stable_per_group() {
        let a = GroupKey::Station("s-1".to_string());
        let b = GroupKey::StationString("s-1".to_string());
        assert_eq!(a.batch_key(), b.batch_key());
        assert_ne!(a.batch_key(), GroupKey::NoStationId.batch_key());
        assert_eq!(a.batch_key().len(), 64);
    }

    #[test]
    fn test_outcome_escalates_only() {
        assert_eq!(BatchOutcome::from_result(QcResult::Fail), BatchOutcome::ReviewQueue);
        assert_eq!(BatchOutcome::from_result(QcResult::Skip), BatchOutcome::NextQueue);
        assert_eq!(
            BatchOutcome::ReviewQueue.escalate(BatchOutcome::NextQueue),
            BatchOutcome::ReviewQueue
        );
    }
}
