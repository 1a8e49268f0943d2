//! Pool supervision with real queue workers over the in-memory store

mod common;

use async_trait::async_trait;
use common::{process_definition, wait_until};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use nodb_qc_core::config::PipelineConfigLoader;
use nodb_qc_core::store::{MemoryStore, NewQueueItem, NodbSession, QueueItem, QueueStatus, WorkQueueStore};
use nodb_qc_core::worker::{QueueItemProcessor, QueueItemResult, WorkerSpec};
use nodb_qc_core::{HaltFlag, PoolController, QcError, Result, WorkerRegistry};

/// Fails every item it sees with an unrecoverable error
struct Brittle;

#[async_trait]
impl QueueItemProcessor for Brittle {
    async fn process_item(&mut self, _session: &mut dyn NodbSession, item: &QueueItem) -> Result<QueueItemResult> {
        Err(QcError::invariant(format!("cannot process {}", item.queue_uuid)))
    }
}

struct Counting {
    processed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl QueueItemProcessor for Counting {
    async fn process_item(&mut self, _session: &mut dyn NodbSession, item: &QueueItem) -> Result<QueueItemResult> {
        self.processed.lock().push(item.queue_name.clone());
        Ok(QueueItemResult::Success)
    }
}

/// Registry whose factories record the uuid of every instance they build
struct Harness {
    registry: WorkerRegistry,
    spawned: Arc<Mutex<Vec<String>>>,
    processed: Arc<Mutex<Vec<String>>>,
}

fn harness() -> Harness {
    let spawned = Arc::new(Mutex::new(Vec::new()));
    let processed = Arc::new(Mutex::new(Vec::new()));
    let mut registry = WorkerRegistry::new();

    let seen = Arc::clone(&spawned);
    registry.register(
        "brittle",
        Arc::new(move |spec: &WorkerSpec| -> Result<Box<dyn QueueItemProcessor>> {
            seen.lock().push(spec.process_uuid.clone());
            Ok(Box::new(Brittle))
        }),
    );
    let seen = Arc::clone(&spawned);
    let sink = Arc::clone(&processed);
    registry.register(
        "counting",
        Arc::new(move |spec: &WorkerSpec| -> Result<Box<dyn QueueItemProcessor>> {
            seen.lock().push(spec.process_uuid.clone());
            Ok(Box::new(Counting {
                processed: Arc::clone(&sink),
            }))
        }),
    );
    Harness {
        registry,
        spawned,
        processed,
    }
}

async fn seed(store: &MemoryStore, queue: &str, count: usize) {
    let mut session = store.session();
    for n in 0..count {
        session
            .create_queue_item(NewQueueItem::new(queue, json!({ "n": n })))
            .await
            .unwrap();
    }
    session.commit().await.unwrap();
}

/// Tick the pool until `condition` holds or two seconds pass
async fn tick_until<F>(pool: &mut PoolController, mut condition: F) -> bool
where
    F: FnMut(&PoolController) -> bool,
{
    for _ in 0..200 {
        pool.reap_and_sow().await;
        if condition(pool) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_failed_instance_is_respawned() {
    let store = MemoryStore::new();
    seed(&store, "fragile", 2).await;
    let h = harness();
    let mut pool = PoolController::new(h.registry, Arc::new(store.clone()), HaltFlag::new());
    pool.register(
        "fragile_worker",
        process_definition("brittle", 1, json!({ "queue_name": "fragile" })),
    )
    .unwrap();

    let failed_all = tick_until(&mut pool, |_| {
        store
            .queue_items("fragile")
            .iter()
            .all(|item| item.status == QueueStatus::Error)
    })
    .await;
    assert!(failed_all);

    // One instance per failed item, plus the replacement now idling
    let respawned = tick_until(&mut pool, |p| {
        p.process_status("fragile_worker").is_some_and(|s| s.live == 1) && h.spawned.lock().len() >= 3
    })
    .await;
    assert!(respawned);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_config_change_restarts_and_count_change_scales() {
    let store = MemoryStore::new();
    let h = harness();
    let mut pool = PoolController::new(h.registry, Arc::new(store.clone()), HaltFlag::new());

    pool.register("counter", process_definition("counting", 1, json!({ "queue_name": "a" })))
        .unwrap();
    pool.reap_and_sow().await;
    let first = h.spawned.lock().clone();
    assert_eq!(first.len(), 1);

    pool.register("counter", process_definition("counting", 1, json!({ "queue_name": "b" })))
        .unwrap();
    let restarted = tick_until(&mut pool, |p| {
        p.process_status("counter").is_some_and(|s| s.live == 1 && s.tracked == 1)
    })
    .await;
    assert!(restarted);
    let after_restart = h.spawned.lock().clone();
    assert_eq!(after_restart.len(), 2);
    assert_ne!(after_restart[0], after_restart[1]);

    pool.register("counter", process_definition("counting", 3, json!({ "queue_name": "b" })))
        .unwrap();
    let scaled = tick_until(&mut pool, |p| p.process_status("counter").is_some_and(|s| s.live == 3)).await;
    assert!(scaled);
    assert_eq!(h.spawned.lock().len(), 4);

    seed(&store, "b", 3).await;
    let processed = Arc::clone(&h.processed);
    assert!(wait_until(Duration::from_secs(2), || processed.lock().len() == 3).await);
    assert!(processed.lock().iter().all(|q| q == "b"));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_pipeline_reload_through_flag_file() {
    let dir = TempDir::new().unwrap();
    let pipeline = dir.path().join("pipeline.yaml");
    let flag = dir.path().join("reload.flag");
    std::fs::write(
        &pipeline,
        "first:\n  class_name: counting\n  count: 2\n  config:\n    queue_name: one\n    delay_time_seconds: 0.01\n",
    )
    .unwrap();

    let h = harness();
    let mut pool = PoolController::new(h.registry, Arc::new(MemoryStore::new()), HaltFlag::new())
        .with_loader(PipelineConfigLoader::new(&pipeline, Some(flag.clone())));

    pool.reload_config().unwrap();
    assert!(tick_until(&mut pool, |p| p.process_status("first").is_some_and(|s| s.live == 2)).await);

    std::fs::write(
        &pipeline,
        "second:\n  class_name: counting\n  config:\n    queue_name: two\n    delay_time_seconds: 0.01\n",
    )
    .unwrap();
    // No flag yet: nothing changes
    pool.reload_config().unwrap();
    assert!(pool.process_status("second").is_none());

    std::fs::write(&flag, "").unwrap();
    pool.reload_config().unwrap();
    assert!(!flag.exists());
    let swapped = tick_until(&mut pool, |p| {
        p.process_status("first").is_none() && p.process_status("second").is_some_and(|s| s.live == 1)
    })
    .await;
    assert!(swapped);

    // A broken file on a later reload keeps the running configuration
    std::fs::write(&pipeline, "- not\n- a\n- mapping\n").unwrap();
    std::fs::write(&flag, "").unwrap();
    pool.reload_config().unwrap();
    pool.reap_and_sow().await;
    assert_eq!(pool.process_status("second").map(|s| s.live), Some(1));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_first_pipeline_load_failure_stops_run() {
    let dir = TempDir::new().unwrap();
    let h = harness();
    let pool = PoolController::new(h.registry, Arc::new(MemoryStore::new()), HaltFlag::new())
        .with_loader(PipelineConfigLoader::new(dir.path().join("absent.yaml"), None))
        .with_tick_interval(Duration::from_millis(10));

    let result = tokio::time::timeout(Duration::from_secs(2), pool.run()).await;
    assert!(matches!(result, Ok(Err(_))));
}
