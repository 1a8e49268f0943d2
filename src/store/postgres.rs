//! # PostgreSQL Store
//!
//! sqlx-backed implementation of the storage traits.
//!
//! ## Overview
//!
//! - [`PgSessionFactory`] owns the pool and answers read-only lookups
//!   ([`StationLookup`], [`RecordSearch`]) against committed data.
//! - [`PgSession`] wraps one transaction, begun lazily on first use. Commit and
//!   rollback end it; the next operation starts a fresh one. Dropping the session
//!   rolls back whatever is still open.
//!
//! Queue reservation is a single `UPDATE ... WHERE queue_uuid = (SELECT ... FOR UPDATE
//! SKIP LOCKED)` so concurrent workers never receive the same item, and an item whose
//! dedupe key is held by another LOCKED item is passed over.
//!
//! The schema lives in `migrations/` and is applied with [`MIGRATOR`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{
    validate_savepoint_name, Batch, BatchStatus, LockMode, NearbyQuery, NewQueueItem, NodbSession,
    QueueItem, QueueStatus, RecordSearch, RecordStore, SessionFactory, Station, StationLookup,
    StationQuery, StationStatus, WorkQueueStore, WorkingRecord,
};
use crate::error::{QcError, Result};
use crate::record::DataRecord;

/// Embedded schema migrations
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const QUEUE_COLUMNS: &str = "queue_uuid, queue_name, subqueue_name, priority, unique_item_name, \
     data, status, locked_by, locked_since, release_at, created_date";

const WORKING_COLUMNS: &str = "working_uuid, received_date, source_file_uuid, message_idx, \
     record_idx, record, qc_metadata, qc_batch_id, station_uuid, obs_time, location";

const STATION_COLUMNS: &str = "station_uuid, wmo_id, wigos_id, station_id, station_name, \
     service_start_date, service_end_date, map_to_uuid, status";

#[derive(Debug, FromRow)]
struct QueueRow {
    queue_uuid: Uuid,
    queue_name: String,
    subqueue_name: Option<String>,
    priority: i32,
    unique_item_name: Option<String>,
    data: JsonValue,
    status: String,
    locked_by: Option<String>,
    locked_since: Option<DateTime<Utc>>,
    release_at: Option<DateTime<Utc>>,
    created_date: DateTime<Utc>,
}

impl TryFrom<QueueRow> for QueueItem {
    type Error = QcError;

    fn try_from(row: QueueRow) -> Result<Self> {
        Ok(QueueItem {
            queue_uuid: row.queue_uuid,
            queue_name: row.queue_name,
            subqueue_name: row.subqueue_name,
            priority: row.priority,
            unique_item_name: row.unique_item_name,
            data: row.data,
            status: QueueStatus::parse(&row.status)?,
            locked_by: row.locked_by,
            locked_since: row.locked_since,
            release_at: row.release_at,
            created_date: row.created_date,
        })
    }
}

#[derive(Debug, FromRow)]
struct BatchRow {
    batch_uuid: String,
    status: String,
}

impl TryFrom<BatchRow> for Batch {
    type Error = QcError;

    fn try_from(row: BatchRow) -> Result<Self> {
        Ok(Batch {
            batch_uuid: row.batch_uuid,
            status: BatchStatus::parse(&row.status)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct WorkingRow {
    working_uuid: String,
    received_date: NaiveDate,
    source_file_uuid: String,
    message_idx: i32,
    record_idx: i32,
    record: JsonValue,
    qc_metadata: JsonValue,
    qc_batch_id: Option<String>,
    station_uuid: Option<String>,
    obs_time: Option<DateTime<Utc>>,
    location: Option<String>,
}

impl TryFrom<WorkingRow> for WorkingRecord {
    type Error = QcError;

    fn try_from(row: WorkingRow) -> Result<Self> {
        let qc_metadata = match row.qc_metadata {
            JsonValue::Object(map) => map,
            JsonValue::Null => Map::new(),
            other => {
                return Err(QcError::serialization(format!(
                    "qc_metadata for {} is not an object: {other}",
                    row.working_uuid
                )))
            }
        };
        Ok(WorkingRecord {
            record: DataRecord::from_json(&row.record)?,
            working_uuid: row.working_uuid,
            received_date: row.received_date,
            source_file_uuid: row.source_file_uuid,
            message_idx: row.message_idx,
            record_idx: row.record_idx,
            qc_metadata,
            qc_batch_id: row.qc_batch_id,
            station_uuid: row.station_uuid,
            obs_time: row.obs_time,
            location: row.location,
        })
    }
}

#[derive(Debug, FromRow)]
struct StationRow {
    station_uuid: String,
    wmo_id: Option<String>,
    wigos_id: Option<String>,
    station_id: Option<String>,
    station_name: Option<String>,
    service_start_date: Option<DateTime<Utc>>,
    service_end_date: Option<DateTime<Utc>>,
    map_to_uuid: Option<String>,
    status: String,
}

impl TryFrom<StationRow> for Station {
    type Error = QcError;

    fn try_from(row: StationRow) -> Result<Self> {
        Ok(Station {
            station_uuid: row.station_uuid,
            wmo_id: row.wmo_id,
            wigos_id: row.wigos_id,
            station_id: row.station_id,
            station_name: row.station_name,
            service_start_date: row.service_start_date,
            service_end_date: row.service_end_date,
            map_to_uuid: row.map_to_uuid,
            status: StationStatus::parse(&row.status)?,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = QcError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Pool owner; opens [`PgSession`]s
#[derive(Debug, Clone)]
pub struct PgSessionFactory {
    pool: PgPool,
}

impl PgSessionFactory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply pending migrations
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| QcError::storage_unavailable("connect", e.to_string()))?;
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| QcError::database("migrate", e.to_string()))?;
        debug!(max_connections, "Connected to PostgreSQL and applied migrations");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn session(&self) -> PgSession {
        PgSession {
            pool: self.pool.clone(),
            tx: None,
        }
    }
}

#[async_trait]
impl SessionFactory for PgSessionFactory {
    async fn open_session(&self) -> Result<Box<dyn NodbSession>> {
        Ok(Box::new(self.session()))
    }
}

#[async_trait]
impl StationLookup for PgSessionFactory {
    async fn find_station(&self, station_uuid: &str) -> Result<Option<Station>> {
        let sql = format!("SELECT {STATION_COLUMNS} FROM nodb_stations WHERE station_uuid = $1");
        let row = sqlx::query_as::<_, StationRow>(&sql)
            .bind(station_uuid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Station::try_from).transpose()
    }

    async fn search_stations(&self, query: &StationQuery) -> Result<Vec<Station>> {
        if !query.has_identifiers() {
            return Ok(Vec::new());
        }
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
        let sql = format!(
            "SELECT {STATION_COLUMNS} FROM nodb_stations \
             WHERE (wmo_id = $1 OR wigos_id = $2 OR station_id = $3 OR station_name = $4) \
             AND ($5::timestamptz IS NULL OR ( \
                 (service_start_date IS NULL OR service_start_date <= $5) \
                 AND (service_end_date IS NULL OR service_end_date >= $5))) \
             ORDER BY station_uuid"
        );
        let rows = sqlx::query_as::<_, StationRow>(&sql)
            .bind(non_empty(&query.wmo_id))
            .bind(non_empty(&query.wigos_id))
            .bind(non_empty(&query.station_id))
            .bind(non_empty(&query.station_name))
            .bind(query.in_service_at)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }
}

#[async_trait]
impl RecordSearch for PgSessionFactory {
    async fn find_working_records_near(&self, query: &NearbyQuery) -> Result<Vec<WorkingRecord>> {
        let sql = format!(
            "SELECT {WORKING_COLUMNS} FROM nodb_working \
             WHERE station_uuid = $1 \
             AND obs_time >= $2 AND obs_time <= $3 \
             AND latitude >= $4 AND latitude <= $5 \
             AND longitude >= $6 AND longitude <= $7 \
             ORDER BY working_uuid"
        );
        let rows = sqlx::query_as::<_, WorkingRow>(&sql)
            .bind(&query.station_uuid)
            .bind(query.min_time)
            .bind(query.max_time)
            .bind(query.min_lat)
            .bind(query.max_lat)
            .bind(query.min_lon)
            .bind(query.max_lon)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }
}

/// One transaction over the PostgreSQL store
pub struct PgSession {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

impl std::fmt::Debug for PgSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSession")
            .field("in_transaction", &self.tx.is_some())
            .finish()
    }
}

impl PgSession {
    async fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        if self.tx.is_none() {
            let tx = self
                .pool
                .begin()
                .await
                .map_err(|e| QcError::storage_unavailable("begin", e.to_string()))?;
            self.tx = Some(tx);
        }
        self.tx
            .as_mut()
            .ok_or_else(|| QcError::internal("transaction missing after begin"))
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        let tx = self.tx().await?;
        sqlx::query(sql).execute(&mut **tx).await?;
        Ok(())
    }

    async fn update_locked_item(&mut self, item: &QueueItem, set_clause: &str) -> Result<()> {
        let sql = format!(
            "UPDATE nodb_queues SET {set_clause} WHERE queue_uuid = $1 AND status = 'LOCKED'"
        );
        let tx = self.tx().await?;
        let result = sqlx::query(&sql)
            .bind(item.queue_uuid)
            .execute(&mut **tx)
            .await?;
        if result.rows_affected() == 0 {
            debug!(queue_uuid = %item.queue_uuid, "Queue item is not locked, ignoring status change");
        }
        Ok(())
    }
}

#[async_trait]
impl WorkQueueStore for PgSession {
    async fn create_queue_item(&mut self, item: NewQueueItem) -> Result<Uuid> {
        let queue_uuid = Uuid::new_v4();
        let tx = self.tx().await?;
        sqlx::query(
            "INSERT INTO nodb_queues \
             (queue_uuid, queue_name, subqueue_name, priority, unique_item_name, data, status, created_date) \
             VALUES ($1, $2, $3, $4, $5, $6, 'UNLOCKED', now())",
        )
        .bind(queue_uuid)
        .bind(&item.queue_name)
        .bind(&item.subqueue_name)
        .bind(item.priority.unwrap_or(0))
        .bind(&item.unique_item_key)
        .bind(&item.data)
        .execute(&mut **tx)
        .await?;
        Ok(queue_uuid)
    }

    #[instrument(skip(self))]
    async fn fetch_next_queue_item(
        &mut self,
        queue_name: &str,
        app_id: &str,
        subqueue_name: Option<&str>,
    ) -> Result<Option<QueueItem>> {
        let sql = format!(
            "UPDATE nodb_queues \
             SET status = 'LOCKED', locked_by = $2, locked_since = now(), release_at = NULL \
             WHERE queue_uuid = ( \
                 SELECT q.queue_uuid FROM nodb_queues q \
                 WHERE q.queue_name = $1 \
                 AND ($3::text IS NULL OR q.subqueue_name = $3) \
                 AND (q.status = 'UNLOCKED' OR (q.status = 'DELAYED_RELEASE' AND q.release_at <= now())) \
                 AND (q.unique_item_name IS NULL OR NOT EXISTS ( \
                     SELECT 1 FROM nodb_queues l \
                     WHERE l.queue_name = q.queue_name \
                     AND l.unique_item_name = q.unique_item_name \
                     AND l.status = 'LOCKED')) \
                 ORDER BY q.priority DESC, q.created_date ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED) \
             RETURNING {QUEUE_COLUMNS}"
        );
        let tx = self.tx().await?;
        let row = sqlx::query_as::<_, QueueRow>(&sql)
            .bind(queue_name)
            .bind(app_id)
            .bind(subqueue_name)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(QueueItem::try_from).transpose()
    }

    async fn load_queue_item(&mut self, queue_uuid: Uuid) -> Result<Option<QueueItem>> {
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM nodb_queues WHERE queue_uuid = $1");
        let tx = self.tx().await?;
        let row = sqlx::query_as::<_, QueueRow>(&sql)
            .bind(queue_uuid)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(QueueItem::try_from).transpose()
    }

    async fn mark_complete(&mut self, item: &QueueItem) -> Result<()> {
        self.update_locked_item(
            item,
            "status = 'COMPLETE', locked_by = NULL, locked_since = NULL",
        )
        .await
    }

    async fn mark_failed(&mut self, item: &QueueItem) -> Result<()> {
        self.update_locked_item(item, "status = 'ERROR', locked_by = NULL, locked_since = NULL")
            .await
    }

    async fn release(&mut self, item: &QueueItem, delay: Duration, reduce_priority: bool) -> Result<()> {
        let release_at = if delay.is_zero() {
            None
        } else {
            chrono::Duration::from_std(delay).ok().map(|d| Utc::now() + d)
        };
        let status = if release_at.is_some() {
            QueueStatus::DelayedRelease
        } else {
            QueueStatus::Unlocked
        };
        let priority_step: i32 = if reduce_priority { 1 } else { 0 };
        let tx = self.tx().await?;
        sqlx::query(
            "UPDATE nodb_queues \
             SET status = $2, release_at = $3, priority = priority - $4, \
                 locked_by = NULL, locked_since = NULL \
             WHERE queue_uuid = $1 AND status = 'LOCKED'",
        )
        .bind(item.queue_uuid)
        .bind(status.as_str())
        .bind(release_at)
        .bind(priority_step)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn renew_lease(&mut self, item: &QueueItem) -> Result<()> {
        self.update_locked_item(item, "locked_since = now()").await
    }

    async fn create_savepoint(&mut self, name: &str) -> Result<()> {
        validate_savepoint_name(name)?;
        self.execute(&format!("SAVEPOINT {name}")).await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        validate_savepoint_name(name)?;
        self.execute(&format!("ROLLBACK TO SAVEPOINT {name}")).await
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        validate_savepoint_name(name)?;
        self.execute(&format!("RELEASE SAVEPOINT {name}")).await
    }

    async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgSession {
    async fn create_batch(&mut self, status: BatchStatus) -> Result<Batch> {
        let batch = Batch {
            batch_uuid: Uuid::new_v4().to_string(),
            status,
        };
        let tx = self.tx().await?;
        sqlx::query("INSERT INTO nodb_batches (batch_uuid, status) VALUES ($1, $2)")
            .bind(&batch.batch_uuid)
            .bind(status.as_str())
            .execute(&mut **tx)
            .await?;
        Ok(batch)
    }

    async fn load_batch(&mut self, batch_uuid: &str, lock: LockMode) -> Result<Option<Batch>> {
        let sql = format!(
            "SELECT batch_uuid, status FROM nodb_batches WHERE batch_uuid = $1{}",
            lock.sql_clause()
        );
        let tx = self.tx().await?;
        let row = sqlx::query_as::<_, BatchRow>(&sql)
            .bind(batch_uuid)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(Batch::try_from).transpose()
    }

    async fn set_batch_status(&mut self, batch_uuid: &str, status: BatchStatus) -> Result<()> {
        let tx = self.tx().await?;
        let result = sqlx::query("UPDATE nodb_batches SET status = $2 WHERE batch_uuid = $1")
            .bind(batch_uuid)
            .bind(status.as_str())
            .execute(&mut **tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QcError::invariant(format!("batch {batch_uuid} does not exist")));
        }
        Ok(())
    }

    async fn delete_batch(&mut self, batch_uuid: &str) -> Result<()> {
        let tx = self.tx().await?;
        sqlx::query("DELETE FROM nodb_batches WHERE batch_uuid = $1")
            .bind(batch_uuid)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn bulk_set_batch_uuid(&mut self, working_uuids: &[String], batch_uuid: &str) -> Result<()> {
        if working_uuids.is_empty() {
            return Ok(());
        }
        let tx = self.tx().await?;
        sqlx::query("UPDATE nodb_working SET qc_batch_id = $1 WHERE working_uuid = ANY($2)")
            .bind(batch_uuid)
            .bind(working_uuids)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn working_records_for_batch(
        &mut self,
        batch_uuid: &str,
        lock: LockMode,
    ) -> Result<Vec<WorkingRecord>> {
        let sql = format!(
            "SELECT {WORKING_COLUMNS} FROM nodb_working WHERE qc_batch_id = $1 \
             ORDER BY message_idx, record_idx{}",
            lock.sql_clause()
        );
        let tx = self.tx().await?;
        let rows = sqlx::query_as::<_, WorkingRow>(&sql)
            .bind(batch_uuid)
            .fetch_all(&mut **tx)
            .await?;
        convert_all(rows)
    }

    async fn working_records_for_source(
        &mut self,
        source_uuid: &str,
        received: NaiveDate,
        lock: LockMode,
    ) -> Result<Vec<WorkingRecord>> {
        let sql = format!(
            "SELECT {WORKING_COLUMNS} FROM nodb_working \
             WHERE source_file_uuid = $1 AND received_date = $2 \
             ORDER BY message_idx, record_idx{}",
            lock.sql_clause()
        );
        let tx = self.tx().await?;
        let rows = sqlx::query_as::<_, WorkingRow>(&sql)
            .bind(source_uuid)
            .bind(received)
            .fetch_all(&mut **tx)
            .await?;
        convert_all(rows)
    }

    async fn insert_working_record(&mut self, record: &WorkingRecord) -> Result<()> {
        let (latitude, longitude) = record.lat_lon().unzip();
        let body = record.record.to_json();
        let metadata = JsonValue::Object(record.qc_metadata.clone());
        let tx = self.tx().await?;
        sqlx::query(
            "INSERT INTO nodb_working \
             (working_uuid, received_date, source_file_uuid, message_idx, record_idx, record, \
              qc_metadata, qc_batch_id, station_uuid, obs_time, location, latitude, longitude) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(&record.working_uuid)
        .bind(record.received_date)
        .bind(&record.source_file_uuid)
        .bind(record.message_idx)
        .bind(record.record_idx)
        .bind(&body)
        .bind(&metadata)
        .bind(&record.qc_batch_id)
        .bind(&record.station_uuid)
        .bind(record.obs_time)
        .bind(&record.location)
        .bind(latitude)
        .bind(longitude)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn update_working_record(&mut self, record: &WorkingRecord) -> Result<()> {
        let (latitude, longitude) = record.lat_lon().unzip();
        let body = record.record.to_json();
        let metadata = JsonValue::Object(record.qc_metadata.clone());
        let tx = self.tx().await?;
        let result = sqlx::query(
            "UPDATE nodb_working SET record = $2, qc_metadata = $3, qc_batch_id = $4, \
             station_uuid = $5, obs_time = $6, location = $7, latitude = $8, longitude = $9 \
             WHERE working_uuid = $1",
        )
        .bind(&record.working_uuid)
        .bind(&body)
        .bind(&metadata)
        .bind(&record.qc_batch_id)
        .bind(&record.station_uuid)
        .bind(record.obs_time)
        .bind(&record.location)
        .bind(latitude)
        .bind(longitude)
        .execute(&mut **tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QcError::invariant(format!(
                "working record {} does not exist",
                record.working_uuid
            )));
        }
        Ok(())
    }

    async fn mark_source_file_complete(&mut self, source_uuid: &str, received: NaiveDate) -> Result<()> {
        let tx = self.tx().await?;
        sqlx::query(
            "INSERT INTO nodb_source_files (source_uuid, received_date, status) \
             VALUES ($1, $2, 'COMPLETE') \
             ON CONFLICT (source_uuid, received_date) DO UPDATE SET status = 'COMPLETE'",
        )
        .bind(source_uuid)
        .bind(received)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
