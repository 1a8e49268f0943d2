#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # NODB QC Core
//!
//! Queue-driven quality-control orchestration for oceanographic observation records.
//!
//! ## Overview
//!
//! Observations arrive as decoded source files of working records. Workers reserve
//! items from a relational work queue, run configurable QC suites over the records,
//! regroup the results into station batches and route each batch either to the next
//! pipeline step or to manual review.
//!
//! ## Architecture
//!
//! ```text
//! PoolController ─▶ QueueWorker ─▶ PayloadWorker ─▶ QcWorker
//!                                                     │
//!                          QcTestRunner ◀─────────────┤
//!                                                     ▼
//!                               BatchManager ─▶ WorkQueueStore (next / review)
//! ```
//!
//! ## Module Organization
//!
//! - [`error`] - Error taxonomy with recoverable / unrecoverable classification
//! - [`logging`] - Structured logging setup and operation log helpers
//! - [`config`] - Worker, pipeline, workflow and daemon settings
//! - [`halt`] - Cooperative halt signals
//! - [`record`] - Observation record tree and QC history
//! - [`units`] - Unit conversion and measurement comparison
//! - [`store`] - Store interfaces with in-memory and PostgreSQL implementations
//! - [`workflow`] - Workflow payloads and step controller
//! - [`worker`] - Queue worker runtime and processors
//! - [`pool`] - Worker pool supervision
//! - [`qc`] - QC test framework, station resolution and duplicate detection
//! - [`batch`] - Result batching and submission
//!
//! ## Testing
//!
//! Unit tests live beside each module; integration tests in `tests/` run against
//! [`store::MemoryStore`]:
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # All tests
//! ```

pub mod batch;
pub mod config;
pub mod constants;
pub mod error;
pub mod halt;
pub mod logging;
pub mod pool;
pub mod qc;
pub mod record;
pub mod store;
pub mod units;
pub mod worker;
pub mod workflow;

pub use batch::{BatchManager, BatchOutcome, GroupKey, SimpleBatchManager};
pub use config::{DaemonConfig, PipelineConfig, ProcessDefinition, WorkerSettings, WorkflowDefinition};
pub use error::{ErrorClass, QcError, Result};
pub use halt::{HaltFlag, WorkerSignals};
pub use pool::{PoolController, WorkerRegistry};
pub use qc::{QcServices, QcSuiteRegistry, QcTestRunner, TestContext, TestSuite};
pub use record::{DataRecord, QcResult};
pub use store::{MemoryStore, NodbSession, SessionFactory, WorkingRecord};
pub use worker::{PayloadWorker, ProgressWorker, QcWorker, QueueItemResult, QueueWorker};
pub use workflow::{WorkflowController, WorkflowPayload};
