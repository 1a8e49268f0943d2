//! # Queue Worker Loop
//!
//! Reserves items from one queue and records the processor's outcome for each.
//!
//! ## Item lifecycle
//!
//! 1. `fetch_next_queue_item` locks the item for this instance's `app_id`. The lock is
//!    committed immediately so the lease is visible to siblings and survives a later
//!    rollback of the processing transaction.
//! 2. The processor runs against the same session.
//! 3. The outcome is written (complete, failed, released) and committed. Processor
//!    errors roll the session back before this bookkeeping happens.
//!
//! When a queue is empty the worker sleeps with exponential backoff, waking early if
//! the halt or end flag trips.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{QueueItemProcessor, QueueItemResult, WorkerActivity, WorkerSpec};
use crate::config::WorkerSettings;
use crate::error::{ErrorClass, Result};
use crate::halt::WorkerSignals;
use crate::logging::{log_queue_operation, log_worker_operation};
use crate::store::{NodbSession, QueueItem, SessionFactory};

/// Idle delay that grows geometrically while the queue stays empty
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, max: Duration) -> Self {
        let factor = if factor.is_finite() && factor >= 1.0 {
            factor
        } else {
            1.0
        };
        let base = base.min(max);
        Self {
            base,
            factor,
            max,
            current: base,
        }
    }

    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self::new(
            settings.delay_time(),
            settings.delay_factor,
            settings.max_delay_time(),
        )
    }

    /// Delay to sleep now; the following call returns the next step up
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.factor).min(self.max);
        delay
    }

    /// Back to the base delay, after an item was found
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// One worker instance bound to one queue
pub struct QueueWorker {
    process_name: String,
    app_id: String,
    queue_name: String,
    subqueue_name: Option<String>,
    settings: WorkerSettings,
    sessions: Arc<dyn SessionFactory>,
    signals: WorkerSignals,
    activity: Arc<WorkerActivity>,
    processor: Box<dyn QueueItemProcessor>,
    backoff: Backoff,
}

impl std::fmt::Debug for QueueWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWorker")
            .field("process_name", &self.process_name)
            .field("app_id", &self.app_id)
            .field("queue_name", &self.queue_name)
            .field("subqueue_name", &self.subqueue_name)
            .finish_non_exhaustive()
    }
}

impl QueueWorker {
    /// Build a worker from its spec; fails when `queue_name` is not configured
    pub fn new(
        spec: &WorkerSpec,
        processor: Box<dyn QueueItemProcessor>,
        sessions: Arc<dyn SessionFactory>,
        signals: WorkerSignals,
    ) -> Result<Self> {
        let settings = WorkerSettings::from_map(&spec.config)?;
        let queue_name = settings.require_queue_name()?.to_string();
        let subqueue_name = settings
            .extra
            .get("subqueue_name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let app_id = if spec.process_uuid.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            spec.process_uuid.clone()
        };
        Ok(Self {
            process_name: spec.process_name.clone(),
            app_id,
            queue_name,
            subqueue_name,
            backoff: Backoff::from_settings(&settings),
            settings,
            sessions,
            signals,
            activity: Arc::new(WorkerActivity::default()),
            processor,
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn activity(&self) -> Arc<WorkerActivity> {
        Arc::clone(&self.activity)
    }

    /// Run until halted, ended, or an unrecoverable error occurs
    #[instrument(skip(self), fields(process = %self.process_name, app_id = %self.app_id, queue = %self.queue_name))]
    pub async fn run(mut self) -> Result<()> {
        log_worker_operation(
            "start",
            &self.process_name,
            &self.app_id,
            "starting",
            Some(&self.queue_name),
        );
        self.processor.on_start().await?;
        let result = self.run_loop().await;
        self.processor.on_complete().await;
        match &result {
            Ok(()) => log_worker_operation("stop", &self.process_name, &self.app_id, "stopped", None),
            Err(e) => {
                let details = e.to_string();
                log_worker_operation(
                    "stop",
                    &self.process_name,
                    &self.app_id,
                    "failed",
                    Some(&details),
                );
            }
        }
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        let mut session = self.sessions.open_session().await?;

        while self.signals.should_continue() {
            let fetched = session
                .fetch_next_queue_item(&self.queue_name, &self.app_id, self.subqueue_name.as_deref())
                .await;
            let item = match fetched {
                Ok(item) => item,
                Err(e) if e.is_recoverable() => {
                    rollback_quietly(session.as_mut()).await;
                    warn!(error = %e, "Queue fetch failed, backing off");
                    if self.signals.sleep(self.backoff.next_delay()).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    rollback_quietly(session.as_mut()).await;
                    return Err(e);
                }
            };

            let Some(item) = item else {
                rollback_quietly(session.as_mut()).await;
                let delay = self.backoff.next_delay();
                debug!(delay_ms = delay.as_millis() as u64, "Queue empty");
                if self.signals.sleep(delay).await {
                    break;
                }
                continue;
            };

            self.backoff.reset();
            session.commit().await?;
            if !self.dispatch(session.as_mut(), item).await? {
                break;
            }
        }
        Ok(())
    }

    /// Process one reserved item. Returns false when the loop should stop.
    async fn dispatch(&mut self, session: &mut dyn NodbSession, item: QueueItem) -> Result<bool> {
        self.activity.set_busy(true);
        self.processor.before_item(&item);

        let (outcome, failure) = match self.processor.process_item(session, &item).await {
            Ok(outcome) => (outcome, None),
            Err(e) => {
                rollback_quietly(session).await;
                let outcome = match e.class() {
                    ErrorClass::Recoverable | ErrorClass::Halt => QueueItemResult::Retry,
                    ErrorClass::Unrecoverable => QueueItemResult::Failed,
                };
                (outcome, Some(e))
            }
        };

        let recorded = self.record_outcome(session, &item, outcome).await;
        self.activity.set_busy(false);
        self.activity.record_item();
        if let Err(e) = recorded {
            rollback_quietly(session).await;
            error!(queue_uuid = %item.queue_uuid, error = %e, "Failed to record queue item outcome");
            return Err(e);
        }
        self.processor.after_item(&item, outcome);

        let Some(e) = failure else {
            return Ok(true);
        };
        match e.class() {
            ErrorClass::Recoverable => {
                warn!(queue_uuid = %item.queue_uuid, error = %e, "Recoverable error, item released");
                Ok(true)
            }
            ErrorClass::Halt => {
                info!(queue_uuid = %item.queue_uuid, "Halt observed mid-item, item released");
                Ok(false)
            }
            ErrorClass::Unrecoverable => {
                error!(queue_uuid = %item.queue_uuid, error = %e, "Unrecoverable error, item failed");
                Err(e)
            }
        }
    }

    async fn record_outcome(
        &mut self,
        session: &mut dyn NodbSession,
        item: &QueueItem,
        outcome: QueueItemResult,
    ) -> Result<()> {
        match outcome {
            QueueItemResult::Success => session.mark_complete(item).await?,
            QueueItemResult::Failed => session.mark_failed(item).await?,
            QueueItemResult::Retry => {
                session
                    .release(
                        item,
                        self.settings.retry_delay(),
                        self.settings.deprioritize_failures,
                    )
                    .await?
            }
            QueueItemResult::Handled => {}
        }
        session.commit().await?;

        let queue_uuid = item.queue_uuid.to_string();
        log_queue_operation(
            "process_item",
            &item.queue_name,
            Some(&queue_uuid),
            &outcome.to_string(),
            None,
        );
        match outcome {
            QueueItemResult::Success => self.processor.after_success(item),
            QueueItemResult::Failed => self.processor.after_failure(item),
            QueueItemResult::Retry => self.processor.after_retry(item),
            QueueItemResult::Handled => {}
        }
        Ok(())
    }
}

async fn rollback_quietly(session: &mut dyn NodbSession) {
    if let Err(e) = session.rollback().await {
        warn!(error = %e, "Rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QcError;
    use crate::halt::HaltFlag;
    use crate::store::{MemoryStore, NewQueueItem, QueueStatus, WorkQueueStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec(config: serde_json::Value) -> WorkerSpec {
        let serde_json::Value::Object(config) = config else {
            panic!("config must be an object");
        };
        WorkerSpec {
            process_name: "test".to_string(),
            process_uuid: Uuid::new_v4().to_string(),
            config,
        }
    }

    /// Returns scripted outcomes, then trips the end flag
    struct Scripted {
        script: Vec<Result<QueueItemResult>>,
        end: HaltFlag,
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl QueueItemProcessor for Scripted {
        async fn process_item(
            &mut self,
            _session: &mut dyn NodbSession,
            _item: &QueueItem,
        ) -> Result<QueueItemResult> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            let next = if self.script.is_empty() {
                Ok(QueueItemResult::Success)
            } else {
                self.script.remove(0)
            };
            if self.script.is_empty() {
                self.end.trip();
            }
            next
        }
    }

    async fn seed(store: &MemoryStore, queue: &str, count: usize) {
        let mut session = store.session();
        for i in 0..count {
            session
                .create_queue_item(NewQueueItem::new(queue, json!({ "n": i })))
                .await
                .unwrap();
        }
        session.commit().await.unwrap();
    }

    fn worker(store: &MemoryStore, script: Vec<Result<QueueItemResult>>) -> (QueueWorker, Arc<AtomicUsize>) {
        let signals = WorkerSignals::new(HaltFlag::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let processor = Scripted {
            script,
            end: signals.end.clone(),
            seen: Arc::clone(&seen),
        };
        let worker = QueueWorker::new(
            &spec(json!({ "queue_name": "q", "delay_time_seconds": 0.01, "max_delay_time_seconds": 0.02 })),
            Box::new(processor),
            Arc::new(store.clone()),
            signals,
        )
        .unwrap();
        (worker, seen)
    }

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::new(Duration::from_millis(250), 2.0, Duration::from_secs(8));
        let delays: Vec<u128> = (0..7).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 8000, 8000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_backoff_ignores_shrinking_factor() {
        let mut backoff = Backoff::new(Duration::from_secs(1), 0.5, Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_queue_name_required() {
        let err = QueueWorker::new(
            &spec(json!({})),
            Box::new(Scripted {
                script: vec![],
                end: HaltFlag::new(),
                seen: Arc::new(AtomicUsize::new(0)),
            }),
            Arc::new(MemoryStore::new()),
            WorkerSignals::default(),
        )
        .unwrap_err();
        assert!(matches!(err, QcError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_success_marks_complete() {
        let store = MemoryStore::new();
        seed(&store, "q", 2).await;
        let (worker, seen) = worker(&store, vec![Ok(QueueItemResult::Success), Ok(QueueItemResult::Success)]);
        worker.run().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(store
            .queue_items("q")
            .iter()
            .all(|i| i.status == QueueStatus::Complete));
    }

    #[tokio::test]
    async fn test_recoverable_error_releases_with_lower_priority() {
        let store = MemoryStore::new();
        seed(&store, "q", 1).await;
        let (worker, _) = worker(
            &store,
            vec![Err(QcError::storage_unavailable("load", "connection reset"))],
        );
        worker.run().await.unwrap();
        let items = store.queue_items("q");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, QueueStatus::Unlocked);
        assert_eq!(items[0].priority, -1);
        assert!(items[0].locked_by.is_none());
    }

    #[tokio::test]
    async fn test_unrecoverable_error_fails_item_and_stops() {
        let store = MemoryStore::new();
        seed(&store, "q", 2).await;
        let (worker, seen) = worker(
            &store,
            vec![Err(QcError::invariant("bad record")), Ok(QueueItemResult::Success)],
        );
        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, QcError::InvariantViolation { .. }));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let statuses: Vec<QueueStatus> = store.queue_items("q").iter().map(|i| i.status).collect();
        assert!(statuses.contains(&QueueStatus::Error));
        assert!(statuses.contains(&QueueStatus::Unlocked));
    }

    #[tokio::test]
    async fn test_halt_releases_item_and_exits() {
        let store = MemoryStore::new();
        seed(&store, "q", 2).await;
        let (worker, seen) = worker(
            &store,
            vec![Err(QcError::halted("process_item")), Ok(QueueItemResult::Success)],
        );
        worker.run().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(store
            .queue_items("q")
            .iter()
            .all(|i| i.status == QueueStatus::Unlocked));
    }

    #[tokio::test]
    async fn test_processor_writes_rolled_back_on_error() {
        struct Writes;

        #[async_trait]
        impl QueueItemProcessor for Writes {
            async fn process_item(
                &mut self,
                session: &mut dyn NodbSession,
                _item: &QueueItem,
            ) -> Result<QueueItemResult> {
                session
                    .create_queue_item(NewQueueItem::new("side", json!({})))
                    .await?;
                Err(QcError::invariant("after write"))
            }
        }

        let store = MemoryStore::new();
        seed(&store, "q", 1).await;
        let worker = QueueWorker::new(
            &spec(json!({ "queue_name": "q" })),
            Box::new(Writes),
            Arc::new(store.clone()),
            WorkerSignals::default(),
        )
        .unwrap();
        assert!(worker.run().await.is_err());
        assert!(store.queue_items("side").is_empty());
        assert_eq!(store.queue_items("q")[0].status, QueueStatus::Error);
    }

    #[tokio::test]
    async fn test_idle_worker_wakes_on_halt() {
        let store = MemoryStore::new();
        let halt = HaltFlag::new();
        let worker = QueueWorker::new(
            &spec(json!({ "queue_name": "q", "delay_time_seconds": 30.0 })),
            Box::new(Scripted {
                script: vec![],
                end: HaltFlag::new(),
                seen: Arc::new(AtomicUsize::new(0)),
            }),
            Arc::new(store.clone()),
            WorkerSignals::new(halt.clone()),
        )
        .unwrap();
        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        halt.trip();
        let joined = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(joined, Ok(Ok(Ok(())))));
    }
}
