//! # Workflow Payloads
//!
//! Typed envelopes carried in queue item data. Every payload records its position in
//! a named workflow (`workflow.name`, `workflow.step`), string headers, free-form
//! metadata and exactly one identity block describing what the unit of work is.
//!
//! ## Wire format
//!
//! ```json
//! {
//!   "workflow": {"name": "gts", "step": 1},
//!   "headers": {"filename": "abc.bufr"},
//!   "metadata": {"queue-priority": 2},
//!   "source_info": {"source_uuid": "...", "received": "2024-05-01"}
//! }
//! ```
//!
//! The identity block is one of `file_info`, `source_info`, `batch_info` or `item_info`.
//! `_metadata` is accepted in place of `metadata` on input.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde_json::{json, Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::constants::metadata_keys;
use crate::error::{QcError, Result};
use crate::record::element::parse_iso_datetime;
use crate::store::{NewQueueItem, QueueItem, WorkQueueStore};

/// A raw file in storage, not yet registered as a source file
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub file_path: String,
    pub filename: Option<String>,
    pub is_gzipped: bool,
    pub mod_date: Option<DateTime<Utc>>,
}

impl FileInfo {
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            filename: None,
            is_gzipped: false,
            mod_date: None,
        }
    }

    fn to_map(&self) -> JsonValue {
        let mut map = Map::new();
        map.insert("file_path".into(), JsonValue::String(self.file_path.clone()));
        if let Some(filename) = &self.filename {
            map.insert("filename".into(), JsonValue::String(filename.clone()));
        }
        if self.is_gzipped {
            map.insert("is_gzipped".into(), JsonValue::Bool(true));
        }
        if let Some(mod_date) = &self.mod_date {
            map.insert(
                "mod_date".into(),
                JsonValue::String(mod_date.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            );
        }
        JsonValue::Object(map)
    }

    fn from_map(map: &Map<String, JsonValue>) -> Result<Self> {
        let file_path = map
            .get("file_path")
            .and_then(JsonValue::as_str)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| QcError::payload(1005, "Missing file path"))?;
        let mod_date = match map.get("mod_date").and_then(JsonValue::as_str) {
            Some(text) if !text.is_empty() => Some(
                parse_iso_datetime(text)
                    .ok_or_else(|| QcError::payload(1005, format!("Invalid mod_date [{text}]")))?,
            ),
            _ => None,
        };
        Ok(Self {
            file_path: file_path.to_string(),
            filename: map
                .get("filename")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            is_gzipped: map
                .get("is_gzipped")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false),
            mod_date,
        })
    }
}

/// What a payload refers to
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadKind {
    File(FileInfo),
    SourceFile {
        source_uuid: String,
        received: NaiveDate,
    },
    Batch {
        batch_uuid: String,
    },
    Item {
        item_uuid: String,
        received: NaiveDate,
    },
}

impl PayloadKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            PayloadKind::File(_) => "file",
            PayloadKind::SourceFile { .. } => "source_file",
            PayloadKind::Batch { .. } => "batch",
            PayloadKind::Item { .. } => "item",
        }
    }

    fn info_key(&self) -> &'static str {
        match self {
            PayloadKind::File(_) => "file_info",
            PayloadKind::SourceFile { .. } => "source_info",
            PayloadKind::Batch { .. } => "batch_info",
            PayloadKind::Item { .. } => "item_info",
        }
    }

    fn info_map(&self) -> JsonValue {
        match self {
            PayloadKind::File(info) => info.to_map(),
            PayloadKind::SourceFile {
                source_uuid,
                received,
            } => json!({"source_uuid": source_uuid, "received": received.to_string()}),
            PayloadKind::Batch { batch_uuid } => json!({ "uuid": batch_uuid }),
            PayloadKind::Item { item_uuid, received } => {
                json!({"uuid": item_uuid, "received": received.to_string()})
            }
        }
    }

    fn from_data(data: &Map<String, JsonValue>) -> Result<Self> {
        let blocks: Vec<&str> = IDENTITY_KEYS
            .iter()
            .copied()
            .filter(|key| data.contains_key(*key))
            .collect();
        if blocks.len() > 1 {
            return Err(QcError::payload(
                1003,
                format!("Ambiguous workflow payload type [{}]", blocks.join(", ")),
            ));
        }
        if let Some(info) = data.get("file_info") {
            return Ok(PayloadKind::File(FileInfo::from_map(info_object(info, 1005)?)?));
        }
        if let Some(info) = data.get("item_info") {
            let info = info_object(info, 1005)?;
            let item_uuid = required_str(info, "uuid", 1005, "Missing item uuid")?;
            let received = required_date(info, "received", 1006, "Missing item received date")?;
            return Ok(PayloadKind::Item {
                item_uuid,
                received,
            });
        }
        if let Some(info) = data.get("source_info") {
            let info = info_object(info, 1007)?;
            let source_uuid = required_str(info, "source_uuid", 1007, "Missing source_uuid")?;
            let received = required_date(info, "received", 1008, "Missing received date")?;
            return Ok(PayloadKind::SourceFile {
                source_uuid,
                received,
            });
        }
        if let Some(info) = data.get("batch_info") {
            let info = info_object(info, 1009)?;
            let batch_uuid = required_str(info, "uuid", 1009, "Missing batch uuid")?;
            return Ok(PayloadKind::Batch { batch_uuid });
        }
        Err(QcError::payload(1003, "Unknown workflow payload type"))
    }
}

/// Identity blocks; a payload carries exactly one
const IDENTITY_KEYS: [&str; 4] = ["file_info", "source_info", "batch_info", "item_info"];

fn info_object(value: &JsonValue, code: u16) -> Result<&Map<String, JsonValue>> {
    value
        .as_object()
        .ok_or_else(|| QcError::payload(code, "Payload identity block is not a map"))
}

fn required_str(map: &Map<String, JsonValue>, key: &str, code: u16, message: &str) -> Result<String> {
    map.get(key)
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| QcError::payload(code, message))
}

fn required_date(map: &Map<String, JsonValue>, key: &str, code: u16, message: &str) -> Result<NaiveDate> {
    let text = required_str(map, key, code, message)?;
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .map_err(|_| QcError::payload(code, format!("Invalid date [{text}]")))
}

/// A unit of work travelling through a workflow
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowPayload {
    pub workflow_name: String,
    pub current_step: usize,
    pub headers: BTreeMap<String, String>,
    pub metadata: Map<String, JsonValue>,
    pub kind: PayloadKind,
}

impl WorkflowPayload {
    pub fn new(workflow_name: impl Into<String>, current_step: usize, kind: PayloadKind) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            current_step,
            headers: BTreeMap::new(),
            metadata: Map::new(),
            kind,
        }
    }

    pub fn file(workflow_name: impl Into<String>, current_step: usize, info: FileInfo) -> Self {
        Self::new(workflow_name, current_step, PayloadKind::File(info))
    }

    pub fn source_file(
        workflow_name: impl Into<String>,
        current_step: usize,
        source_uuid: impl Into<String>,
        received: NaiveDate,
    ) -> Self {
        Self::new(
            workflow_name,
            current_step,
            PayloadKind::SourceFile {
                source_uuid: source_uuid.into(),
                received,
            },
        )
    }

    pub fn batch(workflow_name: impl Into<String>, current_step: usize, batch_uuid: impl Into<String>) -> Self {
        Self::new(
            workflow_name,
            current_step,
            PayloadKind::Batch {
                batch_uuid: batch_uuid.into(),
            },
        )
    }

    pub fn item(
        workflow_name: impl Into<String>,
        current_step: usize,
        item_uuid: impl Into<String>,
        received: NaiveDate,
    ) -> Self {
        Self::new(
            workflow_name,
            current_step,
            PayloadKind::Item {
                item_uuid: item_uuid.into(),
                received,
            },
        )
    }

    /// Decode a payload from queue item data
    pub fn build(data: &JsonValue) -> Result<Self> {
        let data = data
            .as_object()
            .ok_or_else(|| QcError::payload(1000, "Queue item data is not a map"))?;
        let workflow = data
            .get("workflow")
            .and_then(JsonValue::as_object)
            .ok_or_else(|| QcError::payload(1000, "Missing item.data[workflow]"))?;
        let workflow_name = workflow
            .get("name")
            .and_then(JsonValue::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| QcError::payload(1001, "Missing item.data[workflow][name]"))?;
        let step = workflow
            .get("step")
            .filter(|s| !s.is_null())
            .ok_or_else(|| QcError::payload(1002, "Missing item.data[workflow][step]"))?;
        let current_step = parse_step(step)?;

        let headers = match data.get("headers") {
            Some(JsonValue::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    let text = match v {
                        JsonValue::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), text)
                })
                .collect(),
            _ => BTreeMap::new(),
        };
        let metadata = data
            .get("metadata")
            .or_else(|| data.get("_metadata"))
            .and_then(JsonValue::as_object)
            .cloned()
            .unwrap_or_default();

        Ok(Self {
            workflow_name: workflow_name.to_string(),
            current_step,
            headers,
            metadata,
            kind: PayloadKind::from_data(data)?,
        })
    }

    pub fn from_queue_item(item: &QueueItem) -> Result<Self> {
        Self::build(&item.data)
    }

    /// Encode to the wire map
    pub fn to_map(&self) -> JsonValue {
        let mut map = Map::new();
        map.insert(
            "workflow".into(),
            json!({"name": self.workflow_name, "step": self.current_step}),
        );
        map.insert(
            "headers".into(),
            JsonValue::Object(
                self.headers
                    .iter()
                    .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
                    .collect(),
            ),
        );
        map.insert("metadata".into(), JsonValue::Object(self.metadata.clone()));
        map.insert(self.kind.info_key().into(), self.kind.info_map());
        JsonValue::Object(map)
    }

    pub fn get_metadata(&self, key: &str) -> Option<&JsonValue> {
        self.metadata.get(key).filter(|v| !v.is_null())
    }

    /// Set a metadata key, or delete it when `value` is `None`
    pub fn set_metadata(&mut self, key: &str, value: Option<JsonValue>) {
        match value {
            Some(v) if !v.is_null() => {
                self.metadata.insert(key.to_string(), v);
            }
            _ => {
                self.metadata.remove(key);
            }
        }
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn set_subqueue_name(&mut self, subqueue: Option<&str>) {
        self.set_metadata(
            metadata_keys::MANUAL_SUBQUEUE,
            subqueue.map(|s| JsonValue::String(s.to_string())),
        );
    }

    pub fn subqueue_name(&self) -> Option<&str> {
        self.metadata_str(metadata_keys::MANUAL_SUBQUEUE)
    }

    pub fn set_unique_key(&mut self, key: Option<&str>) {
        self.set_metadata(
            metadata_keys::UNIQUE_ITEM_KEY,
            key.map(|k| JsonValue::String(k.to_string())),
        );
    }

    pub fn unique_key(&self) -> Option<&str> {
        self.metadata_str(metadata_keys::UNIQUE_ITEM_KEY)
    }

    pub fn set_priority(&mut self, priority: Option<i32>) {
        self.set_metadata(metadata_keys::QUEUE_PRIORITY, priority.map(JsonValue::from));
    }

    /// Priority from metadata, when it is an integer
    pub fn priority(&self) -> Option<i32> {
        self.get_metadata(metadata_keys::QUEUE_PRIORITY)
            .and_then(JsonValue::as_i64)
            .and_then(|p| i32::try_from(p).ok())
    }

    /// Add `increment` to the priority; an absent priority becomes `increment`
    pub fn increment_priority(&mut self, increment: i32) {
        let next = self
            .priority()
            .map_or(increment, |p| p.saturating_add(increment));
        self.set_priority(Some(next));
    }

    pub fn decrement_priority(&mut self, decrement: i32) {
        self.increment_priority(decrement.saturating_neg());
    }

    pub fn set_followup_queue(&mut self, queue_name: Option<&str>) {
        self.set_metadata(
            metadata_keys::POST_REVIEW_QUEUE,
            queue_name.map(|q| JsonValue::String(q.to_string())),
        );
    }

    pub fn followup_queue(&self) -> Option<&str> {
        self.metadata_str(metadata_keys::POST_REVIEW_QUEUE)
    }

    /// Record which process produced this payload
    pub fn set_source_info(&mut self, process_name: &str, process_version: &str, process_uuid: &str) {
        self.set_metadata(
            metadata_keys::SOURCE_INFO,
            Some(json!({
                "process_name": process_name,
                "process_version": process_version,
                "process_uuid": process_uuid,
            })),
        );
    }

    fn metadata_str(&self, key: &str) -> Option<&str> {
        self.get_metadata(key)
            .and_then(JsonValue::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Dedupe key derived from the payload identity, when one is natural
    pub fn default_unique_key(&self) -> Option<String> {
        match &self.kind {
            PayloadKind::File(info) => Some(sha256_hex(&info.file_path)),
            _ => None,
        }
    }

    /// Stamp `send_time` and create a queue item for this payload.
    ///
    /// Priority is `override_priority`, else the `queue-priority` metadata, else 0.
    pub async fn enqueue<S>(
        &mut self,
        store: &mut S,
        queue_name: &str,
        override_priority: Option<i32>,
    ) -> Result<Uuid>
    where
        S: WorkQueueStore + ?Sized,
    {
        self.metadata.insert(
            metadata_keys::SEND_TIME.to_string(),
            JsonValue::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        let item = NewQueueItem::new(queue_name, self.to_map())
            .with_priority(override_priority.or_else(|| self.priority()))
            .with_subqueue(self.subqueue_name().map(str::to_string))
            .with_unique_key(self.unique_key().map(str::to_string));
        store.create_queue_item(item).await
    }

    /// Enqueue to the `post-review-queue`, consuming the key. False when none is set.
    pub async fn enqueue_followup<S>(&mut self, store: &mut S) -> Result<bool>
    where
        S: WorkQueueStore + ?Sized,
    {
        let Some(queue_name) = self.followup_queue().map(str::to_string) else {
            return Ok(false);
        };
        self.set_followup_queue(None);
        self.enqueue(store, &queue_name, None).await?;
        Ok(true)
    }

    /// Copy workflow position and headers from `other`; metadata keys are only
    /// filled where missing here
    pub fn copy_details_from(&mut self, other: &WorkflowPayload, next_step: bool) {
        self.workflow_name = other.workflow_name.clone();
        self.current_step = other.current_step;
        if next_step {
            self.current_step += 1;
        }
        for (k, v) in &other.headers {
            self.headers.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for (k, v) in &other.metadata {
            if !self.metadata.contains_key(k) {
                self.metadata.insert(k.clone(), v.clone());
            }
        }
    }

    /// Carry this payload's workflow position, headers and metadata onto `target`
    pub fn update_for_propagation(&self, target: &mut WorkflowPayload, advance_step: bool) {
        target.workflow_name = self.workflow_name.clone();
        target.current_step = if advance_step {
            self.current_step + 1
        } else {
            self.current_step
        };
        target.headers = self.headers.clone();
        target.metadata = self.metadata.clone();
    }

    /// A new payload of a different kind at the same workflow position
    pub fn propagate(&self, kind: PayloadKind, advance_step: bool) -> WorkflowPayload {
        let mut next = WorkflowPayload::new(self.workflow_name.clone(), self.current_step, kind);
        self.update_for_propagation(&mut next, advance_step);
        next
    }
}

fn parse_step(step: &JsonValue) -> Result<usize> {
    let parsed = match step {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed
        .filter(|s| *s >= 0)
        .and_then(|s| usize::try_from(s).ok())
        .ok_or_else(|| QcError::payload(1004, format!("Invalid step number [{step}]")))
}

pub(crate) fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn received() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    #[test]
    fn test_build_reports_coded_errors() {
        let code = |v: JsonValue| WorkflowPayload::build(&v).unwrap_err().code().unwrap();
        assert_eq!(code(json!({})), "PAYLOAD-1000");
        assert_eq!(code(json!({"workflow": {"step": 0}})), "PAYLOAD-1001");
        assert_eq!(code(json!({"workflow": {"name": "w"}})), "PAYLOAD-1002");
        assert_eq!(
            code(json!({"workflow": {"name": "w", "step": 0}})),
            "PAYLOAD-1003"
        );
        assert_eq!(
            code(json!({"workflow": {"name": "w", "step": "x"}, "batch_info": {"uuid": "b"}})),
            "PAYLOAD-1004"
        );
        assert_eq!(
            code(json!({"workflow": {"name": "w", "step": 0}, "file_info": {}})),
            "PAYLOAD-1005"
        );
        assert_eq!(
            code(json!({"workflow": {"name": "w", "step": 0}, "item_info": {"uuid": "i"}})),
            "PAYLOAD-1006"
        );
        assert_eq!(
            code(json!({"workflow": {"name": "w", "step": 0}, "source_info": {"received": "2024-01-01"}})),
            "PAYLOAD-1007"
        );
        assert_eq!(
            code(json!({"workflow": {"name": "w", "step": 0}, "source_info": {"source_uuid": "s"}})),
            "PAYLOAD-1008"
        );
        assert_eq!(
            code(json!({"workflow": {"name": "w", "step": 0}, "batch_info": {}})),
            "PAYLOAD-1009"
        );
    }

    #[test]
    fn test_build_rejects_mixed_identity_blocks() {
        let err = WorkflowPayload::build(&json!({
            "workflow": {"name": "w", "step": 0},
            "batch_info": {"uuid": "b"},
            "item_info": {"uuid": "i", "received": "2024-05-01"},
        }))
        .unwrap_err();
        assert_eq!(err.code().unwrap(), "PAYLOAD-1003");
        assert!(err.to_string().contains("batch_info, item_info"));
    }

    #[test]
    fn test_legacy_metadata_key_and_string_step() {
        let payload = WorkflowPayload::build(&json!({
            "workflow": {"name": "w", "step": "2"},
            "_metadata": {"queue-priority": 4},
            "batch_info": {"uuid": "b-1"}
        }))
        .unwrap();
        assert_eq!(payload.current_step, 2);
        assert_eq!(payload.priority(), Some(4));
        assert_eq!(payload.to_map()["metadata"]["queue-priority"], 4);
    }

    #[test]
    fn test_priority_adjustments() {
        let mut payload = WorkflowPayload::batch("w", 0, "b");
        payload.increment_priority(3);
        assert_eq!(payload.priority(), Some(3));
        payload.decrement_priority(5);
        assert_eq!(payload.priority(), Some(-2));
        payload.set_priority(None);
        assert!(payload.get_metadata(metadata_keys::QUEUE_PRIORITY).is_none());
    }

    #[test]
    fn test_copy_details_only_fills_missing_metadata() {
        let mut source = WorkflowPayload::source_file("w", 3, "s", received());
        source.set_metadata("a", Some(json!(1)));
        source.set_metadata("b", Some(json!(2)));
        let mut batch = WorkflowPayload::batch("other", 0, "b");
        batch.set_metadata("a", Some(json!("kept")));

        batch.copy_details_from(&source, true);
        assert_eq!(batch.workflow_name, "w");
        assert_eq!(batch.current_step, 4);
        assert_eq!(batch.metadata["a"], "kept");
        assert_eq!(batch.metadata["b"], 2);
    }

    #[test]
    fn test_propagate_carries_headers_and_metadata() {
        let mut source = WorkflowPayload::source_file("w", 1, "s", received());
        source.set_header("filename", "f.bufr");
        source.set_unique_key(Some("k"));
        let batch = source.propagate(
            PayloadKind::Batch {
                batch_uuid: "b".into(),
            },
            true,
        );
        assert_eq!(batch.current_step, 2);
        assert_eq!(batch.headers["filename"], "f.bufr");
        assert_eq!(batch.unique_key(), Some("k"));
    }

    #[test]
    fn test_file_payload_default_unique_key() {
        let payload = WorkflowPayload::file("w", 0, FileInfo::new("/data/in/a.bufr"));
        let key = payload.default_unique_key().unwrap();
        assert_eq!(key.len(), 64);
        assert_eq!(key, sha256_hex("/data/in/a.bufr"));
        assert!(WorkflowPayload::batch("w", 0, "b").default_unique_key().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_uses_metadata_for_item_fields() {
        let store = MemoryStore::new();
        let mut session = store.session();
        let mut payload = WorkflowPayload::batch("w", 0, "b-1");
        payload.set_priority(Some(7));
        payload.set_subqueue_name(Some("team-a"));
        payload.set_unique_key(Some("group"));
        payload.set_followup_queue(Some("after_review"));

        payload.enqueue(&mut session, "review", None).await.unwrap();
        assert!(payload.enqueue_followup(&mut session).await.unwrap());
        assert!(!payload.enqueue_followup(&mut session).await.unwrap());
        session.commit().await.unwrap();

        let review = store.queue_items("review").pop().unwrap();
        assert_eq!(review.priority, 7);
        assert_eq!(review.subqueue_name.as_deref(), Some("team-a"));
        assert_eq!(review.unique_item_name.as_deref(), Some("group"));
        let rebuilt = WorkflowPayload::from_queue_item(&review).unwrap();
        assert!(rebuilt.get_metadata(metadata_keys::SEND_TIME).is_some());
        assert_eq!(rebuilt.followup_queue(), Some("after_review"));

        let followup = store.queue_items("after_review").pop().unwrap();
        let rebuilt = WorkflowPayload::from_queue_item(&followup).unwrap();
        assert!(rebuilt.followup_queue().is_none());
    }
}
