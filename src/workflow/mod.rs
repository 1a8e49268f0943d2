//! # Workflows
//!
//! Payload envelopes ([`WorkflowPayload`]) and the controller that moves them through
//! the processing steps of a named workflow ([`WorkflowController`]).

pub mod controller;
pub mod payload;

pub use controller::{StepInfo, WorkflowController};
pub use payload::{FileInfo, PayloadKind, WorkflowPayload};
