//! # Progress Worker
//!
//! Consumes the continuation queue (`nodb_continue` by default) and moves each
//! payload on to the next step of its workflow. Payloads at their last step are
//! simply completed.

use async_trait::async_trait;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::payload_worker::{PayloadContext, PayloadProcessor, PayloadWorker, WorkerIdentity};
use super::{QueueItemProcessor, QueueItemResult, WorkerSpec};
use crate::config::WorkflowDefinition;
use crate::error::Result;
use crate::pool::WorkerFactory;
use crate::workflow::WorkflowController;

/// Pipeline class name the progress worker is registered under
pub const CLASS_NAME: &str = "nodb_progress";

#[derive(Debug)]
pub struct ProgressWorker {
    workflow_dir: PathBuf,
    controllers: HashMap<String, WorkflowController>,
}

impl ProgressWorker {
    pub fn new(workflow_dir: impl Into<PathBuf>) -> Self {
        Self {
            workflow_dir: workflow_dir.into(),
            controllers: HashMap::new(),
        }
    }

    /// Worker factory reading workflow definitions from `workflow_dir`
    pub fn factory(workflow_dir: PathBuf) -> WorkerFactory {
        Arc::new(move |spec: &WorkerSpec| -> Result<Box<dyn QueueItemProcessor>> {
            let identity = WorkerIdentity::new(&spec.process_name, &spec.process_uuid);
            Ok(Box::new(PayloadWorker::new(identity, ProgressWorker::new(workflow_dir.clone()))))
        })
    }

    /// Pre-load a controller, bypassing the workflow directory
    pub fn with_controller(mut self, controller: WorkflowController) -> Self {
        self.controllers.insert(controller.name().to_string(), controller);
        self
    }

    fn controller(&mut self, workflow_name: &str) -> Result<&WorkflowController> {
        match self.controllers.entry(workflow_name.to_string()) {
            Entry::Occupied(entry) => Ok(&*entry.into_mut()),
            Entry::Vacant(entry) => {
                let definition = WorkflowDefinition::load_named(&self.workflow_dir, workflow_name)?;
                Ok(&*entry.insert(WorkflowController::new(definition)?))
            }
        }
    }
}

#[async_trait]
impl PayloadProcessor for ProgressWorker {
    #[instrument(skip(self, ctx), fields(workflow = %ctx.payload.workflow_name, step = ctx.payload.current_step))]
    async fn process_payload(&mut self, ctx: &mut PayloadContext<'_>) -> Result<QueueItemResult> {
        let next = ctx.derive(ctx.payload.kind.clone(), false);
        let controller = self.controller(&ctx.payload.workflow_name)?;
        let advanced = controller.advance(&mut *ctx.session, &next, None, None).await?;
        debug!(advanced, "Workflow progressed");
        Ok(QueueItemResult::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StepDefinition;
    use crate::store::{MemoryStore, NewQueueItem, WorkQueueStore};
    use crate::workflow::WorkflowPayload;

    async fn process(worker: ProgressWorker, payload: &WorkflowPayload) -> Result<QueueItemResult> {
        let store = MemoryStore::new();
        let mut session = store.session();
        session
            .create_queue_item(NewQueueItem::new("nodb_continue", payload.to_map()))
            .await?;
        let item = session
            .fetch_next_queue_item("nodb_continue", "tester", None)
            .await?
            .unwrap();
        let mut processor = PayloadWorker::new(WorkerIdentity::new("progress", "p-1"), worker);
        let outcome = processor.process_item(&mut session, &item).await?;
        session.commit().await?;
        let queued: Vec<_> = store
            .all_queue_items()
            .into_iter()
            .filter(|q| q.queue_name == "second")
            .collect();
        if payload.current_step == 0 {
            assert_eq!(queued.len(), 1);
            let next = WorkflowPayload::from_queue_item(&queued[0])?;
            assert_eq!(next.current_step, 1);
            assert_eq!(next.kind, payload.kind);
        } else {
            assert!(queued.is_empty());
        }
        Ok(outcome)
    }

    fn worker() -> ProgressWorker {
        let definition = WorkflowDefinition::new(
            "gts",
            vec![
                StepDefinition::Queue("first".to_string()),
                StepDefinition::Queue("second".to_string()),
            ],
        );
        ProgressWorker::new("/nonexistent").with_controller(WorkflowController::new(definition).unwrap())
    }

    #[tokio::test]
    async fn test_advances_to_next_step() {
        let payload = WorkflowPayload::batch("gts", 0, "b-1");
        assert_eq!(process(worker(), &payload).await.unwrap(), QueueItemResult::Success);
    }

    #[tokio::test]
    async fn test_last_step_completes() {
        let payload = WorkflowPayload::batch("gts", 1, "b-1");
        assert_eq!(process(worker(), &payload).await.unwrap(), QueueItemResult::Success);
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_configuration_error() {
        let payload = WorkflowPayload::batch("other", 0, "b-1");
        let err = process(worker(), &payload).await.unwrap_err();
        assert!(!err.is_recoverable());
    }
}
