//! # Pool Controller
//!
//! Keeps the running worker instances in line with the pipeline configuration.
//! On every tick it re-reads the pipeline file when asked to, reaps exited
//! instances, starts missing ones and retires the excess. It never touches queue
//! items itself.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use super::process_set::ProcessSet;
use super::registry::WorkerRegistry;
use crate::config::loader::PipelineConfigLoader;
use crate::config::ProcessDefinition;
use crate::constants::defaults;
use crate::error::Result;
use crate::halt::HaltFlag;
use crate::logging::log_pool_operation;
use crate::store::SessionFactory;

/// Instance counts of one process set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStatus {
    pub process_name: String,
    pub active: bool,
    pub live: usize,
    pub quota: usize,
    /// Instances still tracked, including ones shutting down
    pub tracked: usize,
}

pub struct PoolController {
    registry: WorkerRegistry,
    sessions: Arc<dyn SessionFactory>,
    halt: HaltFlag,
    sets: BTreeMap<String, ProcessSet>,
    loader: Option<PipelineConfigLoader>,
    tick_interval: Duration,
}

impl std::fmt::Debug for PoolController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolController")
            .field("registry", &self.registry)
            .field("sets", &self.sets)
            .field("loader", &self.loader)
            .field("tick_interval", &self.tick_interval)
            .finish_non_exhaustive()
    }
}

impl PoolController {
    pub fn new(registry: WorkerRegistry, sessions: Arc<dyn SessionFactory>, halt: HaltFlag) -> Self {
        Self {
            registry,
            sessions,
            halt,
            sets: BTreeMap::new(),
            loader: None,
            tick_interval: Duration::from_millis(defaults::TICK_INTERVAL_MS),
        }
    }

    /// Re-read the pipeline file through `loader` on every tick
    pub fn with_loader(mut self, loader: PipelineConfigLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn halt_flag(&self) -> &HaltFlag {
        &self.halt
    }

    /// Register or update a process set. Registering an unchanged definition is a
    /// no-op; a changed config restarts every instance of the set.
    pub fn register(&mut self, process_name: &str, definition: ProcessDefinition) -> Result<()> {
        let factory = self.registry.get(&definition.class_name)?;
        match self.sets.get_mut(process_name) {
            Some(set) if set.is_active() && set.definition() == &definition => {}
            Some(set) => {
                let restarted = set.update(definition, factory);
                log_pool_operation(
                    "register",
                    Some(process_name),
                    Some(set.live_count()),
                    Some(set.quota()),
                    if restarted { "restarting" } else { "updated" },
                );
            }
            None => {
                let set = ProcessSet::new(process_name, definition, factory);
                log_pool_operation("register", Some(process_name), Some(0), Some(set.quota()), "registered");
                self.sets.insert(process_name.to_string(), set);
            }
        }
        Ok(())
    }

    /// Stop every instance of a process set. Unknown names are ignored.
    pub fn deregister(&mut self, process_name: &str) {
        if let Some(set) = self.sets.get_mut(process_name) {
            if set.is_active() {
                set.deactivate();
                log_pool_operation("deregister", Some(process_name), Some(set.live_count()), Some(0), "stopping");
            }
        }
    }

    /// Apply a pipeline reload if the loader reports one. A failed first load is an
    /// error; later failures keep the current registrations.
    pub fn reload_config(&mut self) -> Result<()> {
        let Some(loader) = self.loader.as_mut() else {
            return Ok(());
        };
        let first_load = !loader.is_loaded();
        let reload = match loader.poll() {
            Ok(Some(reload)) => reload,
            Ok(None) => return Ok(()),
            Err(e) if first_load => return Err(e),
            Err(e) => {
                warn!(error = %e, "Pipeline reload failed, keeping current configuration");
                return Ok(());
            }
        };
        for name in &reload.deregister {
            self.deregister(name);
        }
        for (name, definition) in reload.register {
            if let Err(e) = self.register(&name, definition) {
                error!(process_name = %name, error = %e, "Could not register process");
            }
        }
        Ok(())
    }

    /// One supervision pass over every process set
    #[instrument(skip(self), fields(sets = self.sets.len()))]
    pub async fn reap_and_sow(&mut self) {
        for (name, set) in self.sets.iter_mut() {
            let reaped = set.reap().await;
            if reaped > 0 {
                log_pool_operation("reap", Some(name), Some(set.live_count()), Some(set.quota()), "reaped");
            }
            if self.halt.is_tripped() {
                continue;
            }
            if let Err(e) = set.sow(&self.halt, &self.sessions) {
                error!(process_name = %name, error = %e, "Could not start worker instance");
            }
            let retired = set.despawn();
            if retired > 0 {
                log_pool_operation("despawn", Some(name), Some(set.live_count()), Some(set.quota()), "retiring");
            }
        }
        self.sets.retain(|_, set| !set.is_drained());
    }

    /// Current instance counts, by process name
    pub fn status(&self) -> Vec<ProcessStatus> {
        self.sets
            .values()
            .map(|set| ProcessStatus {
                process_name: set.process_name().to_string(),
                active: set.is_active(),
                live: set.live_count(),
                quota: set.quota(),
                tracked: set.handles().len(),
            })
            .collect()
    }

    pub fn process_status(&self, process_name: &str) -> Option<ProcessStatus> {
        self.status().into_iter().find(|s| s.process_name == process_name)
    }

    /// Tick until the halt flag trips, then shut down
    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<()> {
        log_pool_operation("start", None, None, None, "running");
        loop {
            if let Err(e) = self.reload_config() {
                self.shutdown().await;
                return Err(e);
            }
            self.reap_and_sow().await;
            if self.halt.sleep(self.tick_interval).await {
                break;
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Stop every instance after its current item and wait for all of them
    pub async fn shutdown(&mut self) {
        info!(sets = self.sets.len(), "Shutting down worker pool");
        for set in self.sets.values_mut() {
            set.deactivate();
        }
        for set in self.sets.values_mut() {
            set.shutdown().await;
        }
        self.sets.clear();
        log_pool_operation("shutdown", None, Some(0), Some(0), "stopped");
    }
}
