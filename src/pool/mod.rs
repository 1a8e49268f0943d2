//! # Worker Pool
//!
//! ## Overview
//!
//! The pool runs one [`ProcessSet`] per pipeline entry. Each set owns a target
//! number of queue worker instances, every one a supervised tokio task with its own
//! identity and end flag. The [`PoolController`] ticks on a fixed interval:
//!
//! 1. re-read the pipeline file when the reload flag is present
//! 2. reap instances whose task has exited
//! 3. start instances until each set meets its quota
//! 4. ask excess instances to stop, idle ones before busy ones
//!
//! A changed config map restarts every instance of its set. Shutdown trips the end
//! flag of every instance and waits for each to finish its current item.

pub mod controller;
pub mod process_set;
pub mod registry;

pub use controller::{PoolController, ProcessStatus};
pub use process_set::{ProcessSet, WorkerHandle};
pub use registry::{WorkerFactory, WorkerRegistry};
