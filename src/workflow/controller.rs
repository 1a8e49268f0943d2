//! # Workflow Controller
//!
//! Moves payloads through the ordered processing steps of one named workflow.
//!
//! A step is enqueued on its queue with the step's default priority unless the caller
//! overrides it. [`WorkflowController::queue_step_with`] pairs the enqueue with a
//! caller-supplied domain write inside one savepoint so that either both land or
//! neither does.

use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::payload::{FileInfo, WorkflowPayload};
use crate::config::WorkflowDefinition;
use crate::error::{QcError, Result};
use crate::logging::log_queue_operation;
use crate::store::{NodbSession, WorkQueueStore};

const QUEUE_STEP_SAVEPOINT: &str = "workflow_queue_step";

/// Resolved step definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInfo {
    pub queue_name: String,
    pub priority: Option<i32>,
}

/// Controller for one workflow definition
#[derive(Debug, Clone)]
pub struct WorkflowController {
    definition: WorkflowDefinition,
}

impl WorkflowController {
    pub fn new(definition: WorkflowDefinition) -> Result<Self> {
        validate_workflow_name(&definition.name)?;
        for (idx, step) in definition.processing_steps.iter().enumerate() {
            if step.queue_name().trim().is_empty() {
                return Err(QcError::workflow(
                    1003,
                    format!("Step [{idx}] of workflow [{}] has no queue name", definition.name),
                ));
            }
        }
        Ok(Self { definition })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn step_count(&self) -> usize {
        self.definition.processing_steps.len()
    }

    /// True only if `0 <= step_idx < step_count`
    pub fn has_more_steps(&self, step_idx: i64) -> bool {
        usize::try_from(step_idx).is_ok_and(|idx| idx < self.step_count())
    }

    pub fn step_info(&self, step_idx: usize) -> Result<StepInfo> {
        let steps = &self.definition.processing_steps;
        if steps.is_empty() {
            return Err(QcError::workflow(
                1001,
                format!("No processing steps defined for [{}]", self.name()),
            ));
        }
        let step = steps.get(step_idx).ok_or_else(|| {
            QcError::workflow(1002, format!("Invalid step index [{step_idx}]"))
        })?;
        let priority = match step.raw_priority() {
            None | Some(JsonValue::Null) => None,
            Some(raw) => {
                let parsed = match raw {
                    JsonValue::Number(n) => n.as_i64(),
                    JsonValue::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                }
                .and_then(|p| i32::try_from(p).ok());
                if parsed.is_none() {
                    error!(
                        workflow = %self.name(),
                        step = step_idx,
                        priority = %raw,
                        "Invalid default priority for workflow step, ignoring"
                    );
                }
                parsed
            }
        };
        Ok(StepInfo {
            queue_name: step.queue_name().to_string(),
            priority,
        })
    }

    /// Enqueue `payload` on the queue of its current step.
    ///
    /// `priority` overrides the step default; `unique_key`, when given, replaces the
    /// payload's dedupe key.
    #[instrument(skip(self, store, payload), fields(workflow = %self.name(), step = payload.current_step))]
    pub async fn queue_step<S>(
        &self,
        store: &mut S,
        payload: &mut WorkflowPayload,
        priority: Option<i32>,
        unique_key: Option<&str>,
    ) -> Result<Uuid>
    where
        S: WorkQueueStore + ?Sized,
    {
        let info = self.step_info(payload.current_step)?;
        if let Some(key) = unique_key {
            payload.set_unique_key(Some(key));
        }
        let queue_uuid = payload
            .enqueue(store, &info.queue_name, priority.or(info.priority))
            .await?;
        log_queue_operation(
            "enqueue_step",
            &info.queue_name,
            Some(&queue_uuid.to_string()),
            "queued",
            None,
        );
        Ok(queue_uuid)
    }

    /// Queue the step after the payload's current one.
    ///
    /// Returns false, without enqueueing, when the workflow is complete.
    pub async fn advance<S>(
        &self,
        store: &mut S,
        payload: &WorkflowPayload,
        priority: Option<i32>,
        unique_key: Option<&str>,
    ) -> Result<bool>
    where
        S: WorkQueueStore + ?Sized,
    {
        let next_step = payload.current_step + 1;
        if !self.has_more_steps(next_step as i64) {
            debug!(workflow = %self.name(), step = payload.current_step, "Workflow complete");
            return Ok(false);
        }
        let mut next = payload.clone();
        next.current_step = next_step;
        self.queue_step(store, &mut next, priority, unique_key).await?;
        Ok(true)
    }

    /// Start the workflow for a file already placed in storage.
    ///
    /// Returns `None` when the workflow has no steps.
    pub async fn start_source_file<S>(
        &self,
        store: &mut S,
        file_info: FileInfo,
        headers: BTreeMap<String, String>,
        metadata: serde_json::Map<String, JsonValue>,
    ) -> Result<Option<WorkflowPayload>>
    where
        S: WorkQueueStore + ?Sized,
    {
        if !self.has_more_steps(0) {
            debug!(workflow = %self.name(), "Workflow has no steps, file not queued");
            return Ok(None);
        }
        let mut payload = WorkflowPayload::file(self.name(), 0, file_info);
        payload.headers = headers;
        payload.metadata = metadata;
        for (key, value) in &self.definition.default_metadata {
            if !payload.metadata.contains_key(key) {
                payload.metadata.insert(key.clone(), value.clone());
            }
        }
        let unique_key = payload.default_unique_key();
        payload.set_unique_key(unique_key.as_deref());
        self.queue_step(store, &mut payload, None, None).await?;
        Ok(Some(payload))
    }

    /// Enqueue the current step and run `domain_write` in the same savepoint.
    ///
    /// On any error both are rolled back to the savepoint and the error is returned.
    pub async fn queue_step_with<S, F>(
        &self,
        store: &mut S,
        payload: &mut WorkflowPayload,
        priority: Option<i32>,
        unique_key: Option<&str>,
        domain_write: F,
    ) -> Result<Uuid>
    where
        S: NodbSession + ?Sized,
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, Result<()>> + Send,
    {
        store.create_savepoint(QUEUE_STEP_SAVEPOINT).await?;
        let outcome = match self.queue_step(store, payload, priority, unique_key).await {
            Ok(queue_uuid) => domain_write(store).await.map(|()| queue_uuid),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(queue_uuid) => {
                store.release_savepoint(QUEUE_STEP_SAVEPOINT).await?;
                Ok(queue_uuid)
            }
            Err(e) => {
                store.rollback_to_savepoint(QUEUE_STEP_SAVEPOINT).await?;
                store.release_savepoint(QUEUE_STEP_SAVEPOINT).await?;
                Err(e)
            }
        }
    }
}

fn validate_workflow_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\', '.']) {
        return Err(QcError::workflow_controller(
            1000,
            format!("Invalid character in workflow name [{name}]"),
        ));
    }
    Ok(())
}
