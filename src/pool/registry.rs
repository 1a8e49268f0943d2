//! # Worker Registry
//!
//! Maps the `class_name` of a pipeline entry to the factory that builds its
//! per-item processor. Populated explicitly at startup.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::error::{QcError, Result};
use crate::worker::{QueueItemProcessor, WorkerSpec};

/// Builds the processor for one new worker instance
pub type WorkerFactory = Arc<dyn Fn(&WorkerSpec) -> Result<Box<dyn QueueItemProcessor>> + Send + Sync>;

/// Class name to worker factory
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    factories: HashMap<String, WorkerFactory>,
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("classes", &self.class_names())
            .finish()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one under the same name
    pub fn register(&mut self, class_name: impl Into<String>, factory: WorkerFactory) {
        let class_name = class_name.into();
        info!(class_name = %class_name, "Registered worker class");
        self.factories.insert(class_name, factory);
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.factories.contains_key(class_name)
    }

    /// Factory for `class_name`
    pub fn get(&self, class_name: &str) -> Result<WorkerFactory> {
        self.factories
            .get(class_name)
            .cloned()
            .ok_or_else(|| QcError::UnknownWorkerType {
                class_name: class_name.to_string(),
            })
    }

    /// Registered class names, sorted
    pub fn class_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
