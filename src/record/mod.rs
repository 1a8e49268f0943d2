//! # Observation Record Model
//!
//! A record is a tree: three element maps (coordinates, parameters, metadata) plus
//! typed sets of nested sub-records (e.g. the levels of a `PROFILE`). The top-level
//! record additionally carries its QC run history and audit notes.
//!
//! ## Key Features
//!
//! - **Best-value resolution**: corrected values win over raw values; multi-valued
//!   fields resolve to their first non-empty candidate
//! - **Stale-aware QC history**: re-recording a test marks its previous runs stale
//! - **Stable JSON mapping**: `_metadata`, `_parameters`, `_coordinates`, `_subrecords`,
//!   `_history` and `_qc_tests` keys, round-tripping through [`DataRecord::to_json`]

pub mod element;
pub mod history;

pub use element::{is_empty_json, parse_iso_datetime, Element, ElementMap, MultiValue, Value};
pub use history::{
    normalize_qc_path, HistoryEntry, HistorySource, MessageType, QcMessage, QcResult,
    QcTestRunInfo,
};

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

use crate::error::{QcError, Result};

/// Address of one nested record relative to its parent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubrecordStep {
    pub subrecord_type: String,
    pub set_index: usize,
    pub record_index: usize,
}

impl SubrecordStep {
    pub fn new(subrecord_type: impl Into<String>, set_index: usize, record_index: usize) -> Self {
        Self {
            subrecord_type: subrecord_type.into(),
            set_index,
            record_index,
        }
    }

    pub fn path_segment(&self) -> String {
        format!(
            "subrecords/{}/{}/{}",
            self.subrecord_type, self.set_index, self.record_index
        )
    }
}

/// An ordered set of sibling sub-records with shared metadata
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordSet {
    pub metadata: ElementMap,
    pub records: Vec<DataRecord>,
}

impl RecordSet {
    pub fn new(records: Vec<DataRecord>) -> Self {
        Self {
            metadata: ElementMap::default(),
            records,
        }
    }

    fn to_json(&self) -> JsonValue {
        let mut map = Map::new();
        map.insert(
            "_records".to_string(),
            JsonValue::Array(self.records.iter().map(DataRecord::to_json).collect()),
        );
        if !self.metadata.is_empty() {
            map.insert("_metadata".to_string(), self.metadata.to_json());
        }
        JsonValue::Object(map)
    }

    fn from_json(json: &JsonValue) -> Result<Self> {
        let records = match json.get("_records") {
            Some(JsonValue::Array(items)) => items
                .iter()
                .map(DataRecord::from_json)
                .collect::<Result<Vec<_>>>()?,
            Some(_) => return Err(QcError::serialization("_records must be a list")),
            None => Vec::new(),
        };
        let metadata = match json.get("_metadata") {
            Some(md) => ElementMap::from_json(md)?,
            None => ElementMap::default(),
        };
        Ok(Self { metadata, records })
    }
}

/// Sub-record sets keyed by type, then by set index
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordMap {
    sets: BTreeMap<String, BTreeMap<usize, RecordSet>>,
}

impl RecordMap {
    pub fn is_empty(&self) -> bool {
        self.sets.values().all(BTreeMap::is_empty)
    }

    pub fn types(&self) -> impl Iterator<Item = &String> {
        self.sets.keys()
    }

    pub fn sets_of(&self, subrecord_type: &str) -> Option<&BTreeMap<usize, RecordSet>> {
        self.sets.get(subrecord_type)
    }

    pub fn get(&self, subrecord_type: &str, set_index: usize) -> Option<&RecordSet> {
        self.sets.get(subrecord_type)?.get(&set_index)
    }

    pub fn get_mut(&mut self, subrecord_type: &str, set_index: usize) -> Option<&mut RecordSet> {
        self.sets.get_mut(subrecord_type)?.get_mut(&set_index)
    }

    pub fn set(&mut self, subrecord_type: impl Into<String>, set_index: usize, set: RecordSet) {
        self.sets
            .entry(subrecord_type.into())
            .or_default()
            .insert(set_index, set);
    }

    /// Append a record to a set, creating the set if needed
    pub fn append(&mut self, subrecord_type: impl Into<String>, set_index: usize, record: DataRecord) {
        self.sets
            .entry(subrecord_type.into())
            .or_default()
            .entry(set_index)
            .or_default()
            .records
            .push(record);
    }

    /// Every direct child address, in type / set / record order
    pub fn child_steps(&self) -> Vec<SubrecordStep> {
        let mut steps = Vec::new();
        for (srt, sets) in &self.sets {
            for (set_idx, set) in sets {
                for rec_idx in 0..set.records.len() {
                    steps.push(SubrecordStep::new(srt.clone(), *set_idx, rec_idx));
                }
            }
        }
        steps
    }

    fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.sets
                .iter()
                .map(|(srt, sets)| {
                    let inner: Map<String, JsonValue> = sets
                        .iter()
                        .map(|(idx, set)| (idx.to_string(), set.to_json()))
                        .collect();
                    (srt.clone(), JsonValue::Object(inner))
                })
                .collect(),
        )
    }

    fn from_json(json: &JsonValue) -> Result<Self> {
        let JsonValue::Object(types) = json else {
            return Err(QcError::serialization("_subrecords must be an object"));
        };
        let mut sets = BTreeMap::new();
        for (srt, by_index) in types {
            let JsonValue::Object(by_index) = by_index else {
                return Err(QcError::serialization(format!(
                    "subrecord type {srt} must map indexes to record sets"
                )));
            };
            let mut inner = BTreeMap::new();
            for (idx, set) in by_index {
                let idx: usize = idx.parse().map_err(|_| {
                    QcError::serialization(format!("invalid record set index {idx}"))
                })?;
                inner.insert(idx, RecordSet::from_json(set)?);
            }
            sets.insert(srt.clone(), inner);
        }
        Ok(Self { sets })
    }
}

/// An observation record (or nested sub-record)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataRecord {
    pub metadata: ElementMap,
    pub parameters: ElementMap,
    pub coordinates: ElementMap,
    pub subrecords: RecordMap,
    pub history: Vec<HistoryEntry>,
    pub qc_tests: Vec<QcTestRunInfo>,
}

impl DataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow a chain of sub-record steps from this record
    pub fn descend(&self, steps: &[SubrecordStep]) -> Option<&DataRecord> {
        let mut current = self;
        for step in steps {
            current = current
                .subrecords
                .get(&step.subrecord_type, step.set_index)?
                .records
                .get(step.record_index)?;
        }
        Some(current)
    }

    pub fn descend_mut(&mut self, steps: &[SubrecordStep]) -> Option<&mut DataRecord> {
        let mut current = self;
        for step in steps {
            current = current
                .subrecords
                .get_mut(&step.subrecord_type, step.set_index)?
                .records
                .get_mut(step.record_index)?;
        }
        Some(current)
    }

    /// Latest run of a test, ignoring stale runs
    pub fn latest_test_result(&self, test_name: &str) -> Option<&QcTestRunInfo> {
        self.qc_tests
            .iter()
            .filter(|r| r.test_name == test_name && !r.is_stale)
            .max_by_key(|r| r.test_date)
    }

    pub fn mark_test_results_stale(&mut self, test_name: &str) {
        self.qc_tests
            .iter_mut()
            .filter(|r| r.test_name == test_name)
            .for_each(|r| r.is_stale = true);
    }

    /// Record a new run of a test, marking earlier runs stale
    pub fn record_qc_test_result(
        &mut self,
        test_name: &str,
        test_version: &str,
        result: QcResult,
        messages: Vec<QcMessage>,
        test_tags: Vec<String>,
    ) {
        self.mark_test_results_stale(test_name);
        self.qc_tests.push(QcTestRunInfo {
            test_name: test_name.to_string(),
            test_version: test_version.to_string(),
            test_date: Utc::now(),
            messages,
            result,
            notes: None,
            is_stale: false,
            test_tags,
        });
    }

    pub fn add_history_entry(&mut self, message: impl Into<String>, source: &HistorySource, message_type: MessageType) {
        self.history
            .push(HistoryEntry::new(message, source, message_type));
    }

    pub fn record_note(&mut self, message: impl Into<String>, source: &HistorySource) {
        self.add_history_entry(message, source, MessageType::Note);
    }

    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::new();
        if !self.metadata.is_empty() {
            map.insert("_metadata".to_string(), self.metadata.to_json());
        }
        if !self.parameters.is_empty() {
            map.insert("_parameters".to_string(), self.parameters.to_json());
        }
        if !self.coordinates.is_empty() {
            map.insert("_coordinates".to_string(), self.coordinates.to_json());
        }
        if !self.subrecords.is_empty() {
            map.insert("_subrecords".to_string(), self.subrecords.to_json());
        }
        if !self.history.is_empty() {
            map.insert(
                "_history".to_string(),
                serde_json::to_value(&self.history).unwrap_or(JsonValue::Null),
            );
        }
        if !self.qc_tests.is_empty() {
            map.insert(
                "_qc_tests".to_string(),
                serde_json::to_value(&self.qc_tests).unwrap_or(JsonValue::Null),
            );
        }
        JsonValue::Object(map)
    }

    pub fn from_json(json: &JsonValue) -> Result<Self> {
        if !json.is_object() {
            return Err(QcError::serialization("record must be an object"));
        }
        let section = |key: &str| -> Result<ElementMap> {
            json.get(key)
                .map(ElementMap::from_json)
                .unwrap_or_else(|| Ok(ElementMap::default()))
        };
        Ok(Self {
            metadata: section("_metadata")?,
            parameters: section("_parameters")?,
            coordinates: section("_coordinates")?,
            subrecords: match json.get("_subrecords") {
                Some(sr) => RecordMap::from_json(sr)?,
                None => RecordMap::default(),
            },
            history: match json.get("_history") {
                Some(h) => serde_json::from_value(h.clone())?,
                None => Vec::new(),
            },
            qc_tests: match json.get("_qc_tests") {
                Some(q) => serde_json::from_value(q.clone())?,
                None => Vec::new(),
            },
        })
    }
}

impl Serialize for DataRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DataRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        DataRecord::from_json(&json).map_err(serde::de::Error::custom)
    }
}
