//! # Process Sets
//!
//! All running instances of one pipeline entry. Each instance is a supervised tokio
//! task running a [`QueueWorker`]; the set tracks its handle, its end flag and its
//! busy state so the controller can reap, sow and despawn.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use super::registry::WorkerFactory;
use crate::config::ProcessDefinition;
use crate::error::Result;
use crate::halt::{HaltFlag, WorkerSignals};
use crate::logging::log_pool_operation;
use crate::store::SessionFactory;
use crate::worker::{QueueWorker, WorkerActivity, WorkerSpec};

/// Handle on one running worker instance
#[derive(Debug)]
pub struct WorkerHandle {
    process_uuid: String,
    signals: WorkerSignals,
    activity: Arc<WorkerActivity>,
    task: JoinHandle<Result<()>>,
    ending: bool,
}

impl WorkerHandle {
    pub fn process_uuid(&self) -> &str {
        &self.process_uuid
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn is_busy(&self) -> bool {
        self.activity.is_busy()
    }

    /// Whether the instance has been asked to stop
    pub fn is_ending(&self) -> bool {
        self.ending
    }

    /// Ask the instance to stop after its current item
    pub fn request_end(&mut self) {
        self.ending = true;
        self.signals.end.trip();
    }

    /// Wait for the task and log how it ended
    pub async fn join(self, process_name: &str) {
        match self.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(process_name, process_uuid = %self.process_uuid, error = %e, "Worker exited with error");
            }
            Err(e) => {
                error!(process_name, process_uuid = %self.process_uuid, error = %e, "Worker task aborted");
            }
        }
    }
}

/// The instances of one named pipeline entry
pub struct ProcessSet {
    process_name: String,
    definition: ProcessDefinition,
    factory: WorkerFactory,
    handles: Vec<WorkerHandle>,
    active: bool,
}

impl std::fmt::Debug for ProcessSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSet")
            .field("process_name", &self.process_name)
            .field("definition", &self.definition)
            .field("handles", &self.handles)
            .field("active", &self.active)
            .finish()
    }
}

impl ProcessSet {
    pub fn new(process_name: impl Into<String>, definition: ProcessDefinition, factory: WorkerFactory) -> Self {
        Self {
            process_name: process_name.into(),
            definition,
            factory,
            handles: Vec::new(),
            active: true,
        }
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    pub fn definition(&self) -> &ProcessDefinition {
        &self.definition
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Desired instance count; zero once deactivated
    pub fn quota(&self) -> usize {
        if self.active {
            self.definition.count
        } else {
            0
        }
    }

    /// Instances that are alive and not asked to stop
    pub fn live_count(&self) -> usize {
        self.handles
            .iter()
            .filter(|h| !h.is_ending() && !h.is_finished())
            .count()
    }

    /// Every tracked instance, including ones shutting down
    pub fn handles(&self) -> &[WorkerHandle] {
        &self.handles
    }

    /// Whether the set can be dropped
    pub fn is_drained(&self) -> bool {
        !self.active && self.handles.is_empty()
    }

    /// Apply a new definition. Returns true when the config changed and every
    /// instance was asked to restart.
    pub fn update(&mut self, definition: ProcessDefinition, factory: WorkerFactory) -> bool {
        self.active = true;
        let restart =
            definition.config != self.definition.config || definition.class_name != self.definition.class_name;
        self.definition = definition;
        self.factory = factory;
        if restart {
            info!(process_name = %self.process_name, "Configuration changed, restarting instances");
            self.end_all();
        }
        restart
    }

    pub fn deactivate(&mut self) {
        self.active = false;
        self.end_all();
    }

    fn end_all(&mut self) {
        for handle in self.handles.iter_mut().filter(|h| !h.is_ending()) {
            handle.request_end();
        }
    }

    /// Drop handles whose task has exited. Returns how many were removed.
    pub async fn reap(&mut self) -> usize {
        let (finished, running): (Vec<WorkerHandle>, Vec<WorkerHandle>) =
            std::mem::take(&mut self.handles).into_iter().partition(WorkerHandle::is_finished);
        self.handles = running;
        let reaped = finished.len();
        for handle in finished {
            handle.join(&self.process_name).await;
        }
        reaped
    }

    /// Start instances until the quota is met. Returns how many were started.
    pub fn sow(&mut self, halt: &HaltFlag, sessions: &Arc<dyn SessionFactory>) -> Result<usize> {
        let missing = self.quota().saturating_sub(self.live_count());
        for _ in 0..missing {
            let handle = self.spawn(halt, sessions)?;
            self.handles.push(handle);
        }
        Ok(missing)
    }

    /// Ask excess instances to stop, idle ones first. Returns how many were asked.
    pub fn despawn(&mut self) -> usize {
        let excess = self.live_count().saturating_sub(self.quota());
        if excess == 0 {
            return 0;
        }
        let mut candidates: Vec<&mut WorkerHandle> = self
            .handles
            .iter_mut()
            .filter(|h| !h.is_ending() && !h.is_finished())
            .collect();
        candidates.sort_by_key(|h| h.is_busy());
        for handle in candidates.into_iter().take(excess) {
            handle.request_end();
        }
        excess
    }

    fn spawn(&self, halt: &HaltFlag, sessions: &Arc<dyn SessionFactory>) -> Result<WorkerHandle> {
        let spec = WorkerSpec {
            process_name: self.process_name.clone(),
            process_uuid: Uuid::new_v4().to_string(),
            config: self.definition.config.clone(),
        };
        let processor = (self.factory)(&spec)?;
        let signals = WorkerSignals::new(halt.clone());
        let worker = QueueWorker::new(&spec, processor, Arc::clone(sessions), signals.clone())?;
        let activity = worker.activity();
        let task = tokio::spawn(worker.run());
        log_pool_operation(
            "spawn",
            Some(&self.process_name),
            Some(self.live_count() + 1),
            Some(self.quota()),
            "started",
        );
        Ok(WorkerHandle {
            process_uuid: spec.process_uuid,
            signals,
            activity,
            task,
            ending: false,
        })
    }

    /// Ask every instance to stop and wait for all of them
    pub async fn shutdown(&mut self) {
        self.deactivate();
        let handles = std::mem::take(&mut self.handles);
        if !handles.is_empty() {
            info!(process_name = %self.process_name, instances = handles.len(), "Waiting for instances to stop");
        }
        for handle in handles {
            handle.join(&self.process_name).await;
        }
    }
}
