//! # Configuration
//!
//! Typed views over the configuration sources the engine consumes.
//!
//! ## Overview
//!
//! - [`WorkerSettings`]: one worker type's JSON config map, with defaults merged in
//! - [`DuplicateCheckSettings`]: tuning for the duplicate detection suite
//! - [`PipelineConfig`]: the hot-reloadable YAML file naming every worker type, its
//!   replica count and its config map
//! - [`WorkflowDefinition`]: the ordered queue steps of one named workflow
//! - [`DaemonConfig`]: process-level settings loaded with the `config` crate from an
//!   optional file plus `NODB__`-prefixed environment variables
//!
//! ## Usage
//!
//! ```rust,no_run
//! use nodb_qc_core::config::{DaemonConfig, PipelineConfig};
//!
//! # fn main() -> nodb_qc_core::error::Result<()> {
//! let daemon = DaemonConfig::load(Some("nodb.toml".as_ref()))?;
//! let pipeline = PipelineConfig::from_path(&daemon.pipeline_file)?;
//! for (name, process) in pipeline.processes() {
//!     println!("{name}: {} x {}", process.class_name, process.count);
//! }
//! # Ok(())
//! # }
//! ```

pub mod loader;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, warn};

use crate::constants::defaults;
use crate::error::{QcError, Result};

pub use loader::{PipelineConfigLoader, PipelineReload};

/// One QC suite entry in a worker's `qc_tests` list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcTestSpec {
    pub name: String,
    #[serde(default)]
    pub config: Map<String, JsonValue>,
}

/// Typed view over a worker's configuration map.
///
/// Unknown keys are preserved in `extra` so that processors with their own settings
/// can read them without a schema change here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub queue_name: Option<String>,
    pub delay_time_seconds: f64,
    pub retry_delay_seconds: f64,
    pub delay_factor: f64,
    pub max_delay_time_seconds: f64,
    pub deprioritize_failures: bool,

    pub next_queue: String,
    pub review_queue: String,
    pub recheck_queue: Option<String>,
    pub escalation_queue: Option<String>,
    pub max_batch_size: Option<i64>,
    pub max_buffer_size: Option<i64>,
    pub target_buffer_size: Option<i64>,
    pub qc_tests: Vec<QcTestSpec>,

    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue_name: None,
            delay_time_seconds: defaults::DELAY_TIME_SECONDS,
            retry_delay_seconds: defaults::RETRY_DELAY_SECONDS,
            delay_factor: defaults::DELAY_FACTOR,
            max_delay_time_seconds: defaults::MAX_DELAY_TIME_SECONDS,
            deprioritize_failures: defaults::DEPRIORITIZE_FAILURES,
            next_queue: defaults::NEXT_QUEUE.to_string(),
            review_queue: defaults::REVIEW_QUEUE.to_string(),
            recheck_queue: None,
            escalation_queue: None,
            max_batch_size: None,
            max_buffer_size: None,
            target_buffer_size: None,
            qc_tests: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl WorkerSettings {
    /// Build settings from a worker's config map
    pub fn from_map(config: &Map<String, JsonValue>) -> Result<Self> {
        serde_json::from_value(JsonValue::Object(config.clone()))
            .map_err(|e| QcError::configuration("worker", e.to_string()))
    }

    /// Queue name, required by every queue worker
    pub fn require_queue_name(&self) -> Result<&str> {
        self.queue_name
            .as_deref()
            .filter(|q| !q.is_empty())
            .ok_or_else(|| QcError::configuration("worker", "queue_name is required"))
    }

    pub fn delay_time(&self) -> Duration {
        seconds(self.delay_time_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        seconds(self.retry_delay_seconds)
    }

    pub fn max_delay_time(&self) -> Duration {
        seconds(self.max_delay_time_seconds)
    }

    /// Non-positive sizes disable the corresponding limit
    pub fn batch_limits(&self) -> BatchLimits {
        let positive = |v: Option<i64>| v.filter(|n| *n > 0).map(|n| n as usize);
        let max_buffer_size = positive(self.max_buffer_size);
        BatchLimits {
            max_batch_size: positive(self.max_batch_size),
            max_buffer_size,
            target_buffer_size: positive(self.target_buffer_size).or(max_buffer_size),
        }
    }
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

/// Batch grouping limits; `None` means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_batch_size: Option<usize>,
    pub max_buffer_size: Option<usize>,
    pub target_buffer_size: Option<usize>,
}

/// Duplicate detection tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicateCheckSettings {
    pub time_window_minutes: f64,
    pub distance_window_m: f64,
    pub probable_threshold: f64,
    pub improbable_threshold: f64,
}

impl Default for DuplicateCheckSettings {
    fn default() -> Self {
        Self {
            time_window_minutes: defaults::DUPLICATE_TIME_WINDOW_MINUTES,
            distance_window_m: defaults::DUPLICATE_DISTANCE_WINDOW_M,
            probable_threshold: defaults::DUPLICATE_PROBABLE_THRESHOLD,
            improbable_threshold: defaults::DUPLICATE_IMPROBABLE_THRESHOLD,
        }
    }
}

impl DuplicateCheckSettings {
    pub fn from_map(config: &Map<String, JsonValue>) -> Result<Self> {
        serde_json::from_value(JsonValue::Object(config.clone()))
            .map_err(|e| QcError::configuration("nodb_dupe_check", e.to_string()))
    }

    pub fn time_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.time_window_minutes * 60_000.0) as i64)
    }
}

/// One worker type entry of the pipeline file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub class_name: String,
    pub count: usize,
    pub config: Map<String, JsonValue>,
}

/// Parsed pipeline file: process name to definition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineConfig {
    processes: BTreeMap<String, ProcessDefinition>,
}

impl PipelineConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            QcError::configuration("pipeline", format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse the pipeline YAML.
    ///
    /// The document must be a mapping. Entries with a missing class name or a
    /// non-mapping `config` are skipped with an error log; an invalid `count` is
    /// logged and replaced with 1.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let doc: serde_yaml::Value = serde_yaml::from_str(text)?;
        let mapping = match doc {
            serde_yaml::Value::Null => return Ok(Self::default()),
            serde_yaml::Value::Mapping(m) => m,
            _ => {
                return Err(QcError::configuration(
                    "pipeline",
                    "pipeline file does not contain a YAML mapping",
                ))
            }
        };

        let mut processes = BTreeMap::new();
        for (key, entry) in mapping {
            let Some(name) = key.as_str().map(str::to_string) else {
                error!(key = ?key, "Pipeline entry has a non-string process name");
                continue;
            };
            match Self::parse_entry(&name, entry) {
                Some(definition) => {
                    processes.insert(name, definition);
                }
                None => continue,
            }
        }
        Ok(Self { processes })
    }

    fn parse_entry(name: &str, entry: serde_yaml::Value) -> Option<ProcessDefinition> {
        let entry: JsonValue = match serde_yaml::from_value(entry) {
            Ok(v) => v,
            Err(e) => {
                error!(process = %name, error = %e, "Pipeline entry is not valid");
                return None;
            }
        };
        let Some(class_name) = entry.get("class_name").and_then(JsonValue::as_str) else {
            error!(process = %name, "Process is missing a class name");
            return None;
        };
        let config = match entry.get("config") {
            None | Some(JsonValue::Null) => Map::new(),
            Some(JsonValue::Object(m)) => m.clone(),
            Some(_) => {
                error!(process = %name, "Process does not define a mapping for its configuration");
                return None;
            }
        };
        let count = match entry.get("count") {
            None | Some(JsonValue::Null) => 1,
            Some(v) => match v
                .as_i64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
            {
                Some(n) => n.max(1) as usize,
                None => {
                    warn!(process = %name, count = %v, "Non-integer process count, defaulting to 1");
                    1
                }
            },
        };
        Some(ProcessDefinition {
            class_name: class_name.to_string(),
            count,
            config,
        })
    }

    pub fn processes(&self) -> impl Iterator<Item = (&String, &ProcessDefinition)> {
        self.processes.iter()
    }

    pub fn get(&self, name: &str) -> Option<&ProcessDefinition> {
        self.processes.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.processes.keys()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

/// A processing step: a bare queue name or `{name, priority}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepDefinition {
    Queue(String),
    Detailed {
        name: String,
        #[serde(default)]
        priority: Option<JsonValue>,
    },
}

impl StepDefinition {
    pub fn queue_name(&self) -> &str {
        match self {
            StepDefinition::Queue(name) => name,
            StepDefinition::Detailed { name, .. } => name,
        }
    }

    pub fn raw_priority(&self) -> Option<&JsonValue> {
        match self {
            StepDefinition::Queue(_) => None,
            StepDefinition::Detailed { priority, .. } => priority.as_ref(),
        }
    }
}

/// The administrative definition of one named workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub processing_steps: Vec<StepDefinition>,
    #[serde(default)]
    pub default_metadata: Map<String, JsonValue>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            name: name.into(),
            processing_steps: steps,
            default_metadata: Map::new(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            QcError::configuration("workflow", format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Load `<dir>/<name>.yaml`
    pub fn load_named(dir: &Path, name: &str) -> Result<Self> {
        let definition = Self::from_path(&dir.join(format!("{name}.yaml")))?;
        if definition.name != name {
            return Err(QcError::configuration(
                "workflow",
                format!("workflow file for [{name}] declares [{}]", definition.name),
            ));
        }
        Ok(definition)
    }
}

/// Daemon process settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub pipeline_file: PathBuf,
    pub reload_flag_file: Option<PathBuf>,
    pub workflow_dir: PathBuf,
    pub database_url: Option<String>,
    pub tick_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pipeline_file: PathBuf::from("config/pipeline.yaml"),
            reload_flag_file: None,
            workflow_dir: PathBuf::from("config/workflows"),
            database_url: None,
            tick_interval_ms: defaults::TICK_INTERVAL_MS,
        }
    }
}

impl DaemonConfig {
    /// Load from an optional file plus `NODB__` environment overrides
    /// (e.g. `NODB__DATABASE_URL`)
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&DaemonConfig::default())?);
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("NODB")
                .prefix_separator("__")
                .separator("__"),
        );
        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
