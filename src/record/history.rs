//! QC run results, coded messages and history entries attached to a top-level record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Outcome of one QC test on one record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QcResult {
    #[serde(rename = "P")]
    Pass,
    #[serde(rename = "R")]
    ManualReview,
    #[serde(rename = "F")]
    Fail,
    #[serde(rename = "S")]
    Skip,
}

impl QcResult {
    fn severity(self) -> u8 {
        match self {
            QcResult::Pass => 0,
            QcResult::Skip => 1,
            QcResult::ManualReview => 2,
            QcResult::Fail => 3,
        }
    }

    /// The more severe of two outcomes
    pub fn worst(self, other: QcResult) -> QcResult {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            QcResult::Pass => "P",
            QcResult::ManualReview => "R",
            QcResult::Fail => "F",
            QcResult::Skip => "S",
        }
    }
}

impl fmt::Display for QcResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QcResult::Pass => "PASS",
            QcResult::ManualReview => "MANUAL_REVIEW",
            QcResult::Fail => "FAIL",
            QcResult::Skip => "SKIP",
        };
        f.write_str(name)
    }
}

/// Join path segments with `/`, dropping empty segments
pub fn normalize_qc_path<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .flat_map(|s| s.as_ref().split('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// A coded QC finding addressed to a path in the record tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcMessage {
    #[serde(rename = "_code")]
    pub code: String,
    #[serde(rename = "_path")]
    pub path: String,
    #[serde(rename = "_ref", default, skip_serializing_if = "Option::is_none")]
    pub ref_value: Option<JsonValue>,
}

impl QcMessage {
    pub fn new<S: AsRef<str>>(code: impl Into<String>, path: &[S], ref_value: Option<JsonValue>) -> Self {
        Self {
            code: code.into(),
            path: normalize_qc_path(path),
            ref_value,
        }
    }
}

/// The persisted result of one run of a named, versioned QC test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcTestRunInfo {
    #[serde(rename = "_name")]
    pub test_name: String,
    #[serde(rename = "_version")]
    pub test_version: String,
    #[serde(rename = "_date")]
    pub test_date: DateTime<Utc>,
    #[serde(rename = "_messages", default)]
    pub messages: Vec<QcMessage>,
    #[serde(rename = "_result")]
    pub result: QcResult,
    #[serde(rename = "_notes", default)]
    pub notes: Option<String>,
    #[serde(rename = "_stale", default)]
    pub is_stale: bool,
    #[serde(rename = "_tags", default)]
    pub test_tags: Vec<String>,
}

/// Severity of a history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "I")]
    Info,
    #[serde(rename = "N")]
    Note,
    #[serde(rename = "W")]
    Warning,
    #[serde(rename = "E")]
    Error,
}

/// Component that produced a history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySource {
    pub name: String,
    pub version: String,
    pub instance: String,
}

/// An audit note attached to a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "_message")]
    pub message: String,
    #[serde(rename = "_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "_source")]
    pub source: (String, String, String),
    #[serde(rename = "_message_type")]
    pub message_type: MessageType,
}

impl HistoryEntry {
    pub fn new(message: impl Into<String>, source: &HistorySource, message_type: MessageType) -> Self {
        Self {
            message: message.into(),
            timestamp: Utc::now(),
            source: (
                source.name.clone(),
                source.version.clone(),
                source.instance.clone(),
            ),
            message_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_result() {
        assert_eq!(QcResult::Pass.worst(QcResult::ManualReview), QcResult::ManualReview);
        assert_eq!(QcResult::Fail.worst(QcResult::ManualReview), QcResult::Fail);
        assert_eq!(QcResult::ManualReview.worst(QcResult::Pass), QcResult::ManualReview);
        assert_eq!(QcResult::Skip.worst(QcResult::Pass), QcResult::Skip);
    }

    #[test]
    fn test_path_normalization() {
        let segments = vec!["subrecords/PROFILE/0/3", "", "parameters/Temperature", "1"];
        assert_eq!(
            normalize_qc_path(&segments),
            "subrecords/PROFILE/0/3/parameters/Temperature/1"
        );
        let empty: Vec<String> = Vec::new();
        assert_eq!(normalize_qc_path(&empty), "");
    }

    #[test]
    fn test_result_wire_codes() {
        assert_eq!(serde_json::to_string(&QcResult::ManualReview).unwrap(), "\"R\"");
        let parsed: QcResult = serde_json::from_str("\"S\"").unwrap();
        assert_eq!(parsed, QcResult::Skip);
    }
}
