//! In-memory store.
//!
//! Writes are applied to the shared tables immediately and recorded in a per-session
//! undo log; rollback (explicit, to a savepoint, or on drop) replays the log
//! backwards. Other sessions can therefore observe uncommitted writes, and row lock
//! modes are accepted but not enforced. Queue reservation still honours dedupe keys.
//! Intended for tests and single-process local runs.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{
    validate_savepoint_name, Batch, BatchStatus, LockMode, NearbyQuery, NewQueueItem, NodbSession,
    QueueItem, QueueStatus, RecordSearch, RecordStore, SessionFactory, Station, StationLookup,
    StationQuery, WorkQueueStore, WorkingRecord,
};
use crate::error::{QcError, Result};

#[derive(Debug, Clone)]
struct QueueEntry {
    seq: u64,
    item: QueueItem,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_seq: u64,
    queue: HashMap<Uuid, QueueEntry>,
    batches: HashMap<String, Batch>,
    working: HashMap<String, WorkingRecord>,
    source_files_complete: HashMap<(String, NaiveDate), bool>,
    stations: HashMap<String, Station>,
}

#[derive(Debug)]
enum Undo {
    Queue(Uuid, Option<QueueEntry>),
    Batch(String, Option<Batch>),
    Working(String, Option<WorkingRecord>),
    SourceFile((String, NaiveDate), Option<bool>),
}

impl MemoryState {
    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::Queue(id, Some(prev)) => {
                self.queue.insert(id, prev);
            }
            Undo::Queue(id, None) => {
                self.queue.remove(&id);
            }
            Undo::Batch(id, Some(prev)) => {
                self.batches.insert(id, prev);
            }
            Undo::Batch(id, None) => {
                self.batches.remove(&id);
            }
            Undo::Working(id, Some(prev)) => {
                self.working.insert(id, prev);
            }
            Undo::Working(id, None) => {
                self.working.remove(&id);
            }
            Undo::SourceFile(key, Some(prev)) => {
                self.source_files_complete.insert(key, prev);
            }
            Undo::SourceFile(key, None) => {
                self.source_files_complete.remove(&key);
            }
        }
    }
}

/// Shared in-memory tables; cheap to clone
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session directly (the async [`SessionFactory`] wraps this)
    pub fn session(&self) -> MemorySession {
        MemorySession {
            state: Arc::clone(&self.state),
            undo: Vec::new(),
            savepoints: Vec::new(),
        }
    }

    pub fn add_station(&self, station: Station) {
        self.state
            .lock()
            .stations
            .insert(station.station_uuid.clone(), station);
    }

    pub fn remove_station(&self, station_uuid: &str) {
        self.state.lock().stations.remove(station_uuid);
    }

    /// Insert committed working records
    pub fn seed_working_records(&self, records: impl IntoIterator<Item = WorkingRecord>) {
        let mut state = self.state.lock();
        for record in records {
            state.working.insert(record.working_uuid.clone(), record);
        }
    }

    /// Insert a committed batch
    pub fn seed_batch(&self, batch: Batch) {
        self.state
            .lock()
            .batches
            .insert(batch.batch_uuid.clone(), batch);
    }

    /// Every item in a queue, in reservation order
    pub fn queue_items(&self, queue_name: &str) -> Vec<QueueItem> {
        let state = self.state.lock();
        let mut entries: Vec<&QueueEntry> = state
            .queue
            .values()
            .filter(|e| e.item.queue_name == queue_name)
            .collect();
        entries.sort_by(|a, b| reservation_order(a, b));
        entries.into_iter().map(|e| e.item.clone()).collect()
    }

    pub fn all_queue_items(&self) -> Vec<QueueItem> {
        let state = self.state.lock();
        let mut entries: Vec<&QueueEntry> = state.queue.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.item.clone()).collect()
    }

    pub fn batch(&self, batch_uuid: &str) -> Option<Batch> {
        self.state.lock().batches.get(batch_uuid).cloned()
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.state.lock().batches.values().cloned().collect()
    }

    pub fn working_record(&self, working_uuid: &str) -> Option<WorkingRecord> {
        self.state.lock().working.get(working_uuid).cloned()
    }

    pub fn working_records(&self) -> Vec<WorkingRecord> {
        self.state.lock().working.values().cloned().collect()
    }

    pub fn is_source_file_complete(&self, source_uuid: &str, received: NaiveDate) -> bool {
        self.state
            .lock()
            .source_files_complete
            .get(&(source_uuid.to_string(), received))
            .copied()
            .unwrap_or(false)
    }
}

fn reservation_order(a: &QueueEntry, b: &QueueEntry) -> std::cmp::Ordering {
    b.item
        .priority
        .cmp(&a.item.priority)
        .then(a.item.created_date.cmp(&b.item.created_date))
        .then(a.seq.cmp(&b.seq))
}

#[async_trait]
impl SessionFactory for MemoryStore {
    async fn open_session(&self) -> Result<Box<dyn NodbSession>> {
        Ok(Box::new(self.session()))
    }
}

#[async_trait]
impl StationLookup for MemoryStore {
    async fn find_station(&self, station_uuid: &str) -> Result<Option<Station>> {
        Ok(self.state.lock().stations.get(station_uuid).cloned())
    }

    async fn search_stations(&self, query: &StationQuery) -> Result<Vec<Station>> {
        if !query.has_identifiers() {
            return Ok(Vec::new());
        }
        let state = self.state.lock();
        let mut found: Vec<Station> = state
            .stations
            .values()
            .filter(|s| query.matches(s))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.station_uuid.cmp(&b.station_uuid));
        Ok(found)
    }
}

#[async_trait]
impl RecordSearch for MemoryStore {
    async fn find_working_records_near(&self, query: &NearbyQuery) -> Result<Vec<WorkingRecord>> {
        let state = self.state.lock();
        let mut found: Vec<WorkingRecord> = state
            .working
            .values()
            .filter(|r| query.contains(r))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.working_uuid.cmp(&b.working_uuid));
        Ok(found)
    }
}

/// One session over a [`MemoryStore`]
#[derive(Debug)]
pub struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    undo: Vec<Undo>,
    savepoints: Vec<(String, usize)>,
}

impl MemorySession {
    fn update_locked_item<F>(&mut self, item: &QueueItem, apply: F) -> Result<()>
    where
        F: FnOnce(&mut QueueItem),
    {
        let mut state = self.state.lock();
        let Some(entry) = state.queue.get_mut(&item.queue_uuid) else {
            return Err(QcError::invariant(format!(
                "queue item {} does not exist",
                item.queue_uuid
            )));
        };
        if entry.item.status != QueueStatus::Locked {
            debug!(queue_uuid = %item.queue_uuid, status = %entry.item.status, "Queue item is not locked, ignoring status change");
            return Ok(());
        }
        let previous = entry.clone();
        apply(&mut entry.item);
        self.undo.push(Undo::Queue(item.queue_uuid, Some(previous)));
        Ok(())
    }

    fn rollback_to(&mut self, mark: usize) {
        let mut state = self.state.lock();
        while self.undo.len() > mark {
            if let Some(undo) = self.undo.pop() {
                state.revert(undo);
            }
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.undo.is_empty() {
            self.rollback_to(0);
        }
    }
}

#[async_trait]
impl WorkQueueStore for MemorySession {
    async fn create_queue_item(&mut self, new_item: NewQueueItem) -> Result<Uuid> {
        let mut state = self.state.lock();
        let queue_uuid = Uuid::new_v4();
        let seq = state.next_seq;
        state.next_seq += 1;
        let item = QueueItem {
            queue_uuid,
            queue_name: new_item.queue_name,
            subqueue_name: new_item.subqueue_name,
            priority: new_item.priority.unwrap_or(0),
            unique_item_name: new_item.unique_item_key,
            data: new_item.data,
            status: QueueStatus::Unlocked,
            locked_by: None,
            locked_since: None,
            release_at: None,
            created_date: Utc::now(),
        };
        state.queue.insert(queue_uuid, QueueEntry { seq, item });
        self.undo.push(Undo::Queue(queue_uuid, None));
        Ok(queue_uuid)
    }

    async fn fetch_next_queue_item(
        &mut self,
        queue_name: &str,
        app_id: &str,
        subqueue_name: Option<&str>,
    ) -> Result<Option<QueueItem>> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let locked_keys: Vec<String> = state
            .queue
            .values()
            .filter(|e| e.item.queue_name == queue_name && e.item.status == QueueStatus::Locked)
            .filter_map(|e| e.item.unique_item_name.clone())
            .collect();

        let mut candidates: Vec<&QueueEntry> = state
            .queue
            .values()
            .filter(|e| e.item.queue_name == queue_name)
            .filter(|e| subqueue_name.map_or(true, |s| e.item.subqueue_name.as_deref() == Some(s)))
            .filter(|e| match e.item.status {
                QueueStatus::Unlocked => true,
                QueueStatus::DelayedRelease => e.item.release_at.map_or(true, |at| at <= now),
                _ => false,
            })
            .filter(|e| {
                e.item
                    .unique_item_name
                    .as_ref()
                    .map_or(true, |k| !locked_keys.contains(k))
            })
            .collect();
        candidates.sort_by(|a, b| reservation_order(a, b));
        let Some(queue_uuid) = candidates.first().map(|e| e.item.queue_uuid) else {
            return Ok(None);
        };

        let Some(entry) = state.queue.get_mut(&queue_uuid) else {
            return Ok(None);
        };
        let previous = entry.clone();
        entry.item.status = QueueStatus::Locked;
        entry.item.locked_by = Some(app_id.to_string());
        entry.item.locked_since = Some(now);
        entry.item.release_at = None;
        let item = entry.item.clone();
        self.undo.push(Undo::Queue(queue_uuid, Some(previous)));
        Ok(Some(item))
    }

    async fn load_queue_item(&mut self, queue_uuid: Uuid) -> Result<Option<QueueItem>> {
        Ok(self
            .state
            .lock()
            .queue
            .get(&queue_uuid)
            .map(|e| e.item.clone()))
    }

    async fn mark_complete(&mut self, item: &QueueItem) -> Result<()> {
        self.update_locked_item(item, |i| {
            i.status = QueueStatus::Complete;
            i.locked_by = None;
            i.locked_since = None;
        })
    }

    async fn mark_failed(&mut self, item: &QueueItem) -> Result<()> {
        self.update_locked_item(item, |i| {
            i.status = QueueStatus::Error;
            i.locked_by = None;
            i.locked_since = None;
        })
    }

    async fn release(&mut self, item: &QueueItem, delay: Duration, reduce_priority: bool) -> Result<()> {
        let release_at = if delay.is_zero() {
            None
        } else {
            chrono::Duration::from_std(delay)
                .ok()
                .map(|d| Utc::now() + d)
        };
        self.update_locked_item(item, |i| {
            i.status = if release_at.is_some() {
                QueueStatus::DelayedRelease
            } else {
                QueueStatus::Unlocked
            };
            i.release_at = release_at;
            i.locked_by = None;
            i.locked_since = None;
            if reduce_priority {
                i.priority -= 1;
            }
        })
    }

    async fn renew_lease(&mut self, item: &QueueItem) -> Result<()> {
        self.update_locked_item(item, |i| i.locked_since = Some(Utc::now()))
    }

    async fn create_savepoint(&mut self, name: &str) -> Result<()> {
        validate_savepoint_name(name)?;
        self.savepoints.push((name.to_string(), self.undo.len()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let Some(pos) = self.savepoints.iter().rposition(|(n, _)| n == name) else {
            return Err(QcError::invariant(format!("no savepoint named [{name}]")));
        };
        let mark = self.savepoints[pos].1;
        self.savepoints.truncate(pos + 1);
        self.rollback_to(mark);
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let Some(pos) = self.savepoints.iter().rposition(|(n, _)| n == name) else {
            return Err(QcError::invariant(format!("no savepoint named [{name}]")));
        };
        self.savepoints.truncate(pos);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.undo.clear();
        self.savepoints.clear();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.rollback_to(0);
        self.savepoints.clear();
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemorySession {
    async fn create_batch(&mut self, status: BatchStatus) -> Result<Batch> {
        let batch = Batch {
            batch_uuid: Uuid::new_v4().to_string(),
            status,
        };
        self.state
            .lock()
            .batches
            .insert(batch.batch_uuid.clone(), batch.clone());
        self.undo.push(Undo::Batch(batch.batch_uuid.clone(), None));
        Ok(batch)
    }

    async fn load_batch(&mut self, batch_uuid: &str, _lock: LockMode) -> Result<Option<Batch>> {
        Ok(self.state.lock().batches.get(batch_uuid).cloned())
    }

    async fn set_batch_status(&mut self, batch_uuid: &str, status: BatchStatus) -> Result<()> {
        let mut state = self.state.lock();
        let Some(batch) = state.batches.get_mut(batch_uuid) else {
            return Err(QcError::invariant(format!("batch {batch_uuid} does not exist")));
        };
        let previous = batch.clone();
        batch.status = status;
        self.undo
            .push(Undo::Batch(batch_uuid.to_string(), Some(previous)));
        Ok(())
    }

    async fn delete_batch(&mut self, batch_uuid: &str) -> Result<()> {
        if let Some(previous) = self.state.lock().batches.remove(batch_uuid) {
            self.undo
                .push(Undo::Batch(batch_uuid.to_string(), Some(previous)));
        }
        Ok(())
    }

    async fn bulk_set_batch_uuid(&mut self, working_uuids: &[String], batch_uuid: &str) -> Result<()> {
        let mut state = self.state.lock();
        for working_uuid in working_uuids {
            if let Some(record) = state.working.get_mut(working_uuid) {
                let previous = record.clone();
                record.qc_batch_id = Some(batch_uuid.to_string());
                self.undo
                    .push(Undo::Working(working_uuid.clone(), Some(previous)));
            }
        }
        Ok(())
    }

    async fn working_records_for_batch(
        &mut self,
        batch_uuid: &str,
        _lock: LockMode,
    ) -> Result<Vec<WorkingRecord>> {
        let state = self.state.lock();
        let mut records: Vec<WorkingRecord> = state
            .working
            .values()
            .filter(|r| r.qc_batch_id.as_deref() == Some(batch_uuid))
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.message_idx, r.record_idx));
        Ok(records)
    }

    async fn working_records_for_source(
        &mut self,
        source_uuid: &str,
        received: NaiveDate,
        _lock: LockMode,
    ) -> Result<Vec<WorkingRecord>> {
        let state = self.state.lock();
        let mut records: Vec<WorkingRecord> = state
            .working
            .values()
            .filter(|r| r.source_file_uuid == source_uuid && r.received_date == received)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.message_idx, r.record_idx));
        Ok(records)
    }

    async fn insert_working_record(&mut self, record: &WorkingRecord) -> Result<()> {
        let previous = self
            .state
            .lock()
            .working
            .insert(record.working_uuid.clone(), record.clone());
        self.undo
            .push(Undo::Working(record.working_uuid.clone(), previous));
        Ok(())
    }

    async fn update_working_record(&mut self, record: &WorkingRecord) -> Result<()> {
        let mut state = self.state.lock();
        let Some(existing) = state.working.get_mut(&record.working_uuid) else {
            return Err(QcError::invariant(format!(
                "working record {} does not exist",
                record.working_uuid
            )));
        };
        let previous = std::mem::replace(existing, record.clone());
        self.undo
            .push(Undo::Working(record.working_uuid.clone(), Some(previous)));
        Ok(())
    }

    async fn mark_source_file_complete(&mut self, source_uuid: &str, received: NaiveDate) -> Result<()> {
        let key = (source_uuid.to_string(), received);
        let previous = self
            .state
            .lock()
            .source_files_complete
            .insert(key.clone(), true);
        self.undo.push(Undo::SourceFile(key, previous));
        Ok(())
    }
}
