//! # Storage Interfaces
//!
//! The engine consumes its relational store through a small set of traits so that
//! every component takes its collaborators explicitly.
//!
//! ## Overview
//!
//! - [`WorkQueueStore`]: the queue table (reserve, complete, fail, release) plus
//!   transaction control (commit, rollback, savepoints)
//! - [`RecordStore`]: batches, working records and source-file bookkeeping
//! - [`NodbSession`]: one transactional session implementing both
//! - [`SessionFactory`]: opens sessions; each worker instance owns exactly one
//! - [`StationLookup`] and [`RecordSearch`]: read-only lookups used by QC suites
//!
//! A session's writes become visible to others only on [`WorkQueueStore::commit`].
//! Dropping a session without committing discards its writes.
//!
//! Implementations: [`memory::MemoryStore`] (tests and local runs) and, with the
//! `postgres` feature, [`postgres::PgSessionFactory`].

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::constants::{element_names, working_keys};
use crate::error::{QcError, Result};
use crate::record::DataRecord;

pub use memory::MemoryStore;

/// Queue item lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Unlocked,
    Locked,
    Complete,
    DelayedRelease,
    Error,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Unlocked => "UNLOCKED",
            QueueStatus::Locked => "LOCKED",
            QueueStatus::Complete => "COMPLETE",
            QueueStatus::DelayedRelease => "DELAYED_RELEASE",
            QueueStatus::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "UNLOCKED" => Ok(QueueStatus::Unlocked),
            "LOCKED" => Ok(QueueStatus::Locked),
            "COMPLETE" => Ok(QueueStatus::Complete),
            "DELAYED_RELEASE" => Ok(QueueStatus::DelayedRelease),
            "ERROR" => Ok(QueueStatus::Error),
            other => Err(QcError::invariant(format!("unknown queue status {other}"))),
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work in a named queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub queue_uuid: Uuid,
    pub queue_name: String,
    pub subqueue_name: Option<String>,
    pub priority: i32,
    pub unique_item_name: Option<String>,
    pub data: JsonValue,
    pub status: QueueStatus,
    pub locked_by: Option<String>,
    pub locked_since: Option<DateTime<Utc>>,
    pub release_at: Option<DateTime<Utc>>,
    pub created_date: DateTime<Utc>,
}

/// Arguments for [`WorkQueueStore::create_queue_item`]
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueItem {
    pub queue_name: String,
    pub data: JsonValue,
    pub priority: Option<i32>,
    pub unique_item_key: Option<String>,
    pub subqueue_name: Option<String>,
}

impl NewQueueItem {
    pub fn new(queue_name: impl Into<String>, data: JsonValue) -> Self {
        Self {
            queue_name: queue_name.into(),
            data,
            priority: None,
            unique_item_key: None,
            subqueue_name: None,
        }
    }

    pub fn with_priority(mut self, priority: Option<i32>) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_unique_key(mut self, key: Option<String>) -> Self {
        self.unique_item_key = key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_subqueue(mut self, subqueue: Option<String>) -> Self {
        self.subqueue_name = subqueue.filter(|s| !s.is_empty());
        self
    }
}

/// Batch lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Queued,
    InProgress,
    ManualReview,
    Error,
    Passed,
    Batch,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Queued => "QUEUED",
            BatchStatus::InProgress => "IN_PROGRESS",
            BatchStatus::ManualReview => "MANUAL_REVIEW",
            BatchStatus::Error => "ERROR",
            BatchStatus::Passed => "PASSED",
            BatchStatus::Batch => "BATCH",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "QUEUED" => Ok(BatchStatus::Queued),
            "IN_PROGRESS" => Ok(BatchStatus::InProgress),
            "MANUAL_REVIEW" => Ok(BatchStatus::ManualReview),
            "ERROR" => Ok(BatchStatus::Error),
            "PASSED" => Ok(BatchStatus::Passed),
            "BATCH" => Ok(BatchStatus::Batch),
            other => Err(QcError::invariant(format!("unknown batch status {other}"))),
        }
    }
}

/// An administrative grouping of working records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_uuid: String,
    pub status: BatchStatus,
}

/// Row lock requested when reading rows that will be written back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    None,
    ForUpdate,
    ForNoKeyUpdate,
    ForShare,
    ForKeyShare,
}

impl LockMode {
    pub fn sql_clause(self) -> &'static str {
        match self {
            LockMode::None => "",
            LockMode::ForUpdate => " FOR UPDATE",
            LockMode::ForNoKeyUpdate => " FOR NO KEY UPDATE",
            LockMode::ForShare => " FOR SHARE",
            LockMode::ForKeyShare => " FOR KEY SHARE",
        }
    }
}

/// An observation mid-pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingRecord {
    pub working_uuid: String,
    pub received_date: NaiveDate,
    pub source_file_uuid: String,
    pub message_idx: i32,
    pub record_idx: i32,
    pub record: DataRecord,
    pub qc_metadata: Map<String, JsonValue>,
    pub qc_batch_id: Option<String>,
    pub station_uuid: Option<String>,
    pub obs_time: Option<DateTime<Utc>>,
    pub location: Option<String>,
}

impl WorkingRecord {
    pub fn new(
        record: DataRecord,
        source_file_uuid: impl Into<String>,
        received_date: NaiveDate,
        message_idx: i32,
        record_idx: i32,
    ) -> Self {
        let mut working = Self {
            working_uuid: Uuid::new_v4().to_string(),
            received_date,
            source_file_uuid: source_file_uuid.into(),
            message_idx,
            record_idx,
            record,
            qc_metadata: Map::new(),
            qc_batch_id: None,
            station_uuid: None,
            obs_time: None,
            location: None,
        };
        working.refresh_from_record();
        working
    }

    pub fn get_metadata(&self, key: &str) -> Option<&JsonValue> {
        self.qc_metadata.get(key).filter(|v| !v.is_null())
    }

    /// Set a metadata key, or remove it when `value` is `None`
    pub fn set_metadata(&mut self, key: &str, value: Option<JsonValue>) {
        match value {
            Some(v) => {
                self.qc_metadata.insert(key.to_string(), v);
            }
            None => {
                self.qc_metadata.remove(key);
            }
        }
    }

    /// Suite names queued to be skipped on the next QC pass
    pub fn skip_tests(&self) -> Vec<String> {
        string_list(self.get_metadata(working_keys::SKIP_TESTS))
    }

    pub fn set_skip_tests(&mut self, names: Vec<String>) {
        if names.is_empty() {
            self.set_metadata(working_keys::SKIP_TESTS, None);
        } else {
            self.set_metadata(
                working_keys::SKIP_TESTS,
                Some(JsonValue::Array(names.into_iter().map(JsonValue::String).collect())),
            );
        }
    }

    /// Copy the indexed columns out of the record tree. A column whose source value is
    /// present but unusable is cleared; one whose source is absent is left alone.
    pub fn refresh_from_record(&mut self) {
        let coords = &self.record.coordinates;
        if coords.has_value(element_names::TIME) {
            self.obs_time = coords
                .get(element_names::TIME)
                .and_then(|e| e.ideal())
                .and_then(|v| v.as_datetime());
        }
        if coords.has_value(element_names::LATITUDE) && coords.has_value(element_names::LONGITUDE) {
            self.location = match (
                coords.best_f64(element_names::LATITUDE),
                coords.best_f64(element_names::LONGITUDE),
            ) {
                (Some(lat), Some(lon)) => Some(format!("POINT ({} {})", round5(lon), round5(lat))),
                _ => None,
            };
        }
        if let Some(station) = self.record.metadata.best_string(element_names::STATION) {
            self.station_uuid = Some(station);
        }
    }

    /// Latitude and longitude parsed back out of the WKT location
    pub fn lat_lon(&self) -> Option<(f64, f64)> {
        let inner = self
            .location
            .as_deref()?
            .trim()
            .strip_prefix("POINT")?
            .trim()
            .strip_prefix('(')?
            .strip_suffix(')')?;
        let mut parts = inner.split_whitespace();
        let lon: f64 = parts.next()?.parse().ok()?;
        let lat: f64 = parts.next()?.parse().ok()?;
        Some((lat, lon))
    }
}

fn round5(value: f64) -> f64 {
    (value * 100_000.0).round() / 100_000.0
}

fn string_list(value: Option<&JsonValue>) -> Vec<String> {
    match value {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(JsonValue::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// Station record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StationStatus {
    Active,
    Incomplete,
    Inactive,
}

impl StationStatus {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "ACTIVE" => Ok(StationStatus::Active),
            "INCOMPLETE" => Ok(StationStatus::Incomplete),
            "INACTIVE" => Ok(StationStatus::Inactive),
            other => Err(QcError::invariant(format!("unknown station status {other}"))),
        }
    }
}

/// A physical or virtual observation platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub station_uuid: String,
    pub wmo_id: Option<String>,
    pub wigos_id: Option<String>,
    pub station_id: Option<String>,
    pub station_name: Option<String>,
    pub service_start_date: Option<DateTime<Utc>>,
    pub service_end_date: Option<DateTime<Utc>>,
    pub map_to_uuid: Option<String>,
    pub status: StationStatus,
}

impl Station {
    pub fn new(station_uuid: impl Into<String>) -> Self {
        Self {
            station_uuid: station_uuid.into(),
            wmo_id: None,
            wigos_id: None,
            station_id: None,
            station_name: None,
            service_start_date: None,
            service_end_date: None,
            map_to_uuid: None,
            status: StationStatus::Active,
        }
    }

    pub fn in_service_at(&self, time: DateTime<Utc>) -> bool {
        self.service_start_date.map_or(true, |start| start <= time)
            && self.service_end_date.map_or(true, |end| end >= time)
    }
}

/// Identifier search; any present identifier may match
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StationQuery {
    pub wmo_id: Option<String>,
    pub wigos_id: Option<String>,
    pub station_id: Option<String>,
    pub station_name: Option<String>,
    pub in_service_at: Option<DateTime<Utc>>,
}

impl StationQuery {
    pub fn has_identifiers(&self) -> bool {
        [&self.wmo_id, &self.wigos_id, &self.station_id, &self.station_name]
            .iter()
            .any(|v| v.as_deref().is_some_and(|s| !s.is_empty()))
    }

    /// Whether the station matches any identifier and is in service at the query time
    pub fn matches(&self, station: &Station) -> bool {
        let eq = |q: &Option<String>, s: &Option<String>| match (q.as_deref(), s.as_deref()) {
            (Some(q), Some(s)) => !q.is_empty() && q == s,
            _ => false,
        };
        let identified = eq(&self.wmo_id, &station.wmo_id)
            || eq(&self.wigos_id, &station.wigos_id)
            || eq(&self.station_id, &station.station_id)
            || eq(&self.station_name, &station.station_name);
        identified && self.in_service_at.map_or(true, |t| station.in_service_at(t))
    }
}

/// Spatial and temporal window for [`RecordSearch::find_working_records_near`]
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyQuery {
    pub station_uuid: String,
    pub min_time: DateTime<Utc>,
    pub max_time: DateTime<Utc>,
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl NearbyQuery {
    pub fn contains(&self, record: &WorkingRecord) -> bool {
        if record.station_uuid.as_deref() != Some(self.station_uuid.as_str()) {
            return false;
        }
        let Some(time) = record.obs_time else {
            return false;
        };
        let Some((lat, lon)) = record.lat_lon() else {
            return false;
        };
        time >= self.min_time
            && time <= self.max_time
            && lat >= self.min_lat
            && lat <= self.max_lat
            && lon >= self.min_lon
            && lon <= self.max_lon
    }
}

/// Queue table access and transaction control
#[async_trait]
pub trait WorkQueueStore: Send {
    async fn create_queue_item(&mut self, item: NewQueueItem) -> Result<Uuid>;

    /// Reserve the next eligible item in a queue for `app_id`
    async fn fetch_next_queue_item(
        &mut self,
        queue_name: &str,
        app_id: &str,
        subqueue_name: Option<&str>,
    ) -> Result<Option<QueueItem>>;

    async fn load_queue_item(&mut self, queue_uuid: Uuid) -> Result<Option<QueueItem>>;

    async fn mark_complete(&mut self, item: &QueueItem) -> Result<()>;

    async fn mark_failed(&mut self, item: &QueueItem) -> Result<()>;

    /// Unlock an item, delaying its next reservation by `delay`
    async fn release(&mut self, item: &QueueItem, delay: Duration, reduce_priority: bool) -> Result<()>;

    /// Refresh `locked_since` on a locked item
    async fn renew_lease(&mut self, item: &QueueItem) -> Result<()>;

    async fn create_savepoint(&mut self, name: &str) -> Result<()>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;

    async fn release_savepoint(&mut self, name: &str) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

/// Batches, working records and source files
#[async_trait]
pub trait RecordStore: Send {
    async fn create_batch(&mut self, status: BatchStatus) -> Result<Batch>;

    async fn load_batch(&mut self, batch_uuid: &str, lock: LockMode) -> Result<Option<Batch>>;

    async fn set_batch_status(&mut self, batch_uuid: &str, status: BatchStatus) -> Result<()>;

    async fn delete_batch(&mut self, batch_uuid: &str) -> Result<()>;

    async fn bulk_set_batch_uuid(&mut self, working_uuids: &[String], batch_uuid: &str) -> Result<()>;

    async fn working_records_for_batch(
        &mut self,
        batch_uuid: &str,
        lock: LockMode,
    ) -> Result<Vec<WorkingRecord>>;

    async fn working_records_for_source(
        &mut self,
        source_uuid: &str,
        received: NaiveDate,
        lock: LockMode,
    ) -> Result<Vec<WorkingRecord>>;

    async fn insert_working_record(&mut self, record: &WorkingRecord) -> Result<()>;

    async fn update_working_record(&mut self, record: &WorkingRecord) -> Result<()>;

    async fn mark_source_file_complete(&mut self, source_uuid: &str, received: NaiveDate) -> Result<()>;
}

/// One transactional session over the whole store
pub trait NodbSession: WorkQueueStore + RecordStore {}

impl<T: WorkQueueStore + RecordStore> NodbSession for T {}

/// Opens sessions; shared by every worker instance
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn NodbSession>>;
}

/// Read-only station directory
#[async_trait]
pub trait StationLookup: Send + Sync {
    async fn find_station(&self, station_uuid: &str) -> Result<Option<Station>>;

    async fn search_stations(&self, query: &StationQuery) -> Result<Vec<Station>>;
}

/// Read-only search over committed working records
#[async_trait]
pub trait RecordSearch: Send + Sync {
    async fn find_working_records_near(&self, query: &NearbyQuery) -> Result<Vec<WorkingRecord>>;
}

/// Savepoint names are interpolated into SQL, so only identifiers are accepted
pub(crate) fn validate_savepoint_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(QcError::invariant(format!("invalid savepoint name [{name}]")))
    }
}
