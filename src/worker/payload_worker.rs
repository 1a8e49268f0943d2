//! # Payload Worker
//!
//! Adapter that decodes each queue item into a [`WorkflowPayload`] before handing it to
//! a [`PayloadProcessor`]. Items whose payload kind the processor does not accept are
//! rejected with `PAYLOAD-1000`.
//!
//! Payloads a processor emits are derived from the current one through
//! [`PayloadContext::derive`], which carries workflow position, headers and metadata
//! forward and stamps `_source_info` with the emitting worker's identity.

use async_trait::async_trait;

use super::{QueueItemProcessor, QueueItemResult};
use crate::error::{QcError, Result};
use crate::store::{NodbSession, QueueItem};
use crate::workflow::{PayloadKind, WorkflowPayload};

/// Who emitted a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub process_name: String,
    pub process_version: String,
    pub process_uuid: String,
}

impl WorkerIdentity {
    pub fn new(process_name: impl Into<String>, process_uuid: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            process_version: env!("CARGO_PKG_VERSION").to_string(),
            process_uuid: process_uuid.into(),
        }
    }

    pub fn stamp(&self, payload: &mut WorkflowPayload) {
        payload.set_source_info(&self.process_name, &self.process_version, &self.process_uuid);
    }
}

/// Everything a payload processor may touch while handling one item
pub struct PayloadContext<'a> {
    pub session: &'a mut dyn NodbSession,
    pub item: &'a QueueItem,
    pub payload: &'a WorkflowPayload,
    pub identity: &'a WorkerIdentity,
}

impl PayloadContext<'_> {
    /// New payload of `kind` continuing the current payload's workflow
    pub fn derive(&self, kind: PayloadKind, advance_step: bool) -> WorkflowPayload {
        let mut next = self.payload.propagate(kind, advance_step);
        self.identity.stamp(&mut next);
        next
    }
}

/// Payload-level processing logic
#[async_trait]
pub trait PayloadProcessor: Send {
    /// Whether this processor handles payloads of the given kind
    fn accepts(&self, _kind: &PayloadKind) -> bool {
        true
    }

    async fn process_payload(&mut self, ctx: &mut PayloadContext<'_>) -> Result<QueueItemResult>;

    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn on_complete(&mut self) {}
}

/// [`QueueItemProcessor`] that decodes payloads for a [`PayloadProcessor`]
pub struct PayloadWorker<P> {
    identity: WorkerIdentity,
    processor: P,
}

impl<P: PayloadProcessor> PayloadWorker<P> {
    pub fn new(identity: WorkerIdentity, processor: P) -> Self {
        Self {
            identity,
            processor,
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }
}

#[async_trait]
impl<P: PayloadProcessor> QueueItemProcessor for PayloadWorker<P> {
    async fn process_item(
        &mut self,
        session: &mut dyn NodbSession,
        item: &QueueItem,
    ) -> Result<QueueItemResult> {
        let payload = WorkflowPayload::from_queue_item(item)?;
        if !self.processor.accepts(&payload.kind) {
            return Err(QcError::payload(
                1000,
                format!("Payload is not of valid type [{}]", payload.kind.type_name()),
            ));
        }
        let mut ctx = PayloadContext {
            session,
            item,
            payload: &payload,
            identity: &self.identity,
        };
        self.processor.process_payload(&mut ctx).await
    }

    async fn on_start(&mut self) -> Result<()> {
        self.processor.on_start().await
    }

    async fn on_complete(&mut self) {
        self.processor.on_complete().await
    }
}
