//! # Test Context
//!
//! Per-record state of one QC suite run: the working record being verified, the
//! current position in its record tree, the messages raised so far and the running
//! outcome.
//!
//! Checks never panic or raise for routine findings. They return a [`QcFlow`] and the
//! suite settles the signal against the context: a `Review` or `Fail` flags the value
//! in focus and records a coded message at the current path, `Skip` leaves the check
//! silently and `Complete` unwinds every remaining check for the record.

use serde_json::Value as JsonValue;
use std::collections::BTreeSet;

use crate::constants::element_names;
use crate::error::QcError;
use crate::record::{
    DataRecord, Element, ElementMap, HistorySource, QcMessage, QcResult, SubrecordStep, Value,
};
use crate::store::{Station, StationLookup, WorkingRecord};

/// Result of one check. `Err` carries a control-flow signal, not necessarily an error.
pub type QcFlow<T = ()> = std::result::Result<T, QcSignal>;

/// A failed expectation
#[derive(Debug, Clone, PartialEq)]
pub struct Assertion {
    pub code: String,
    /// WorkingQuality to apply to the value in focus
    pub flag: Option<i64>,
    pub ref_value: Option<JsonValue>,
}

impl Assertion {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            flag: None,
            ref_value: None,
        }
    }

    pub fn with_flag(mut self, flag: i64) -> Self {
        self.flag = Some(flag);
        self
    }

    pub fn with_ref(mut self, ref_value: impl Into<JsonValue>) -> Self {
        self.ref_value = Some(ref_value.into());
        self
    }
}

/// Control-flow signal returned by a check
#[derive(Debug)]
pub enum QcSignal {
    /// Leave the current check without a finding
    Skip,
    /// Finding that needs an operator
    Review(Assertion),
    /// Finding that fails the record
    Fail(Assertion),
    /// Stop testing this record; the outcome becomes SKIP
    Complete,
    /// A genuine error; aborts the batch
    Error(QcError),
}

impl QcSignal {
    pub fn review(code: impl Into<String>) -> Self {
        QcSignal::Review(Assertion::new(code))
    }

    pub fn fail(code: impl Into<String>) -> Self {
        QcSignal::Fail(Assertion::new(code))
    }
}

impl From<QcError> for QcSignal {
    fn from(error: QcError) -> Self {
        QcSignal::Error(error)
    }
}

/// Element map of a record a value check can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Coordinates,
    Parameters,
    Metadata,
}

impl Section {
    pub fn path_prefix(self) -> &'static str {
        match self {
            Section::Coordinates => "coordinates",
            Section::Parameters => "parameters",
            Section::Metadata => "metadata",
        }
    }

    pub fn of(self, record: &DataRecord) -> &ElementMap {
        match self {
            Section::Coordinates => &record.coordinates,
            Section::Parameters => &record.parameters,
            Section::Metadata => &record.metadata,
        }
    }

    pub fn of_mut(self, record: &mut DataRecord) -> &mut ElementMap {
        match self {
            Section::Coordinates => &mut record.coordinates,
            Section::Parameters => &mut record.parameters,
            Section::Metadata => &mut record.metadata,
        }
    }
}

/// The value a value check is looking at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueFocus {
    pub section: Section,
    pub name: String,
    /// Candidate index when iterating the candidates of a multi-valued element
    pub subvalue: Option<usize>,
}

/// The record set a record-set check is looking at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetFocus {
    pub subrecord_type: String,
    pub set_index: usize,
    /// Level index when a check runs once per record of the set
    pub level: Option<usize>,
}

/// Record status values written by record actions
pub mod record_status {
    pub const DISCARDED: &str = "DISCARDED";
    pub const DUPLICATE: &str = "DUPLICATE";
    pub const ARCHIVED: &str = "ARCHIVED";
    pub const DUBIOUS: &str = "DUBIOUS";
}

/// Operator recommendations written by record actions
pub mod operator_action {
    pub const DISCARD: &str = "DISCARD";
    pub const DUPLICATE: &str = "DUPLICATE";
    pub const ARCHIVE: &str = "ARCHIVE";
    pub const DUBIOUS: &str = "DUBIOUS";
}

/// State of one suite run over one working record
#[derive(Debug)]
pub struct TestContext {
    working: WorkingRecord,
    source: HistorySource,
    steps: Vec<SubrecordStep>,
    focus: Option<ValueFocus>,
    set_focus: Option<SetFocus>,
    messages: Vec<QcMessage>,
    result: QcResult,
    test_tags: BTreeSet<String>,
    station: Option<Option<Station>>,
}

impl TestContext {
    pub fn new(working: WorkingRecord, source: HistorySource) -> Self {
        Self {
            working,
            source,
            steps: Vec::new(),
            focus: None,
            set_focus: None,
            messages: Vec::new(),
            result: QcResult::Pass,
            test_tags: BTreeSet::new(),
            station: None,
        }
    }

    pub fn working(&self) -> &WorkingRecord {
        &self.working
    }

    pub fn working_mut(&mut self) -> &mut WorkingRecord {
        &mut self.working
    }

    pub fn into_working(self) -> WorkingRecord {
        self.working
    }

    pub fn working_uuid(&self) -> &str {
        &self.working.working_uuid
    }

    pub fn top_record(&self) -> &DataRecord {
        &self.working.record
    }

    pub fn top_record_mut(&mut self) -> &mut DataRecord {
        &mut self.working.record
    }

    /// The record at the current address; the top record if the address is stale
    pub fn current_record(&self) -> &DataRecord {
        let top = &self.working.record;
        top.descend(&self.steps).unwrap_or(top)
    }

    /// The record at the current address, if the address still resolves
    pub fn current_record_mut(&mut self) -> Option<&mut DataRecord> {
        self.working.record.descend_mut(&self.steps)
    }

    pub fn current_subrecord_type(&self) -> Option<&str> {
        self.steps.last().map(|s| s.subrecord_type.as_str())
    }

    pub fn is_top_level(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[SubrecordStep] {
        &self.steps
    }

    /// Path segments of the current record, plus the value in focus if any
    pub fn current_path(&self) -> Vec<String> {
        let mut path: Vec<String> = self.steps.iter().map(SubrecordStep::path_segment).collect();
        if let Some(set) = &self.set_focus {
            path.push(format!("subrecords/{}/{}", set.subrecord_type, set.set_index));
            if let Some(level) = set.level {
                path.push(level.to_string());
            }
        }
        if let Some(focus) = &self.focus {
            path.push(focus.section.path_prefix().to_string());
            path.push(focus.name.clone());
            if let Some(idx) = focus.subvalue {
                path.push(idx.to_string());
            }
        }
        path
    }

    pub fn enter_record(&mut self, steps: Vec<SubrecordStep>) {
        self.steps = steps;
        self.focus = None;
        self.set_focus = None;
    }

    pub fn enter_record_set(&mut self, subrecord_type: impl Into<String>, set_index: usize) {
        self.focus = None;
        self.set_focus = Some(SetFocus {
            subrecord_type: subrecord_type.into(),
            set_index,
            level: None,
        });
    }

    /// Address one record of the set in focus; a no-op outside a record-set check
    pub fn enter_level(&mut self, level: Option<usize>) {
        if let Some(set) = self.set_focus.as_mut() {
            set.level = level;
        }
    }

    pub fn leave_record_set(&mut self) {
        self.set_focus = None;
    }

    pub fn set_focus(&self) -> Option<&SetFocus> {
        self.set_focus.as_ref()
    }

    pub fn current_level(&self) -> Option<usize> {
        self.set_focus.as_ref().and_then(|s| s.level)
    }

    pub fn enter_value(&mut self, section: Section, name: impl Into<String>, subvalue: Option<usize>) {
        self.focus = Some(ValueFocus {
            section,
            name: name.into(),
            subvalue,
        });
    }

    pub fn leave_value(&mut self) {
        self.focus = None;
    }

    pub fn focus(&self) -> Option<&ValueFocus> {
        self.focus.as_ref()
    }

    pub fn current_element(&self) -> Option<&Element> {
        let focus = self.focus.as_ref()?;
        focus.section.of(self.current_record()).get(&focus.name)
    }

    /// The value in focus: the addressed candidate, or the ideal value of the element
    pub fn current_value(&self) -> Option<&Value> {
        let element = self.current_element()?;
        match self.focus.as_ref().and_then(|f| f.subvalue) {
            Some(idx) => element.subvalue(idx),
            None => match element {
                Element::Single(value) => Some(value),
                Element::Multi(_) => element.ideal(),
            },
        }
    }

    /// Set the WorkingQuality of the value in focus; a no-op outside a value check
    pub fn flag_current_value(&mut self, flag: i64) {
        let Some(focus) = self.focus.clone() else {
            return;
        };
        let Some(record) = self.current_record_mut() else {
            return;
        };
        let Some(element) = focus.section.of_mut(record).get_mut(&focus.name) else {
            return;
        };
        match focus.subvalue {
            Some(idx) => {
                if let Some(value) = element.subvalue_mut(idx) {
                    value.set_working_quality(flag);
                }
            }
            None => element.set_working_quality(flag),
        }
    }

    pub fn result(&self) -> QcResult {
        self.result
    }

    pub fn messages(&self) -> &[QcMessage] {
        &self.messages
    }

    pub fn add_test_tag(&mut self, tag: impl Into<String>) {
        self.test_tags.insert(tag.into());
    }

    pub fn test_tags(&self) -> &BTreeSet<String> {
        &self.test_tags
    }

    /// Record a review finding at the current path
    pub fn report_for_review(&mut self, code: &str, ref_value: Option<JsonValue>) {
        let path = self.current_path();
        self.push_message(code, path, ref_value, QcResult::ManualReview);
    }

    /// Record a review finding at a path below the current record
    pub fn report_for_review_at(&mut self, subpath: &[&str], code: &str, ref_value: Option<JsonValue>) {
        let mut path: Vec<String> = self.steps.iter().map(SubrecordStep::path_segment).collect();
        path.extend(subpath.iter().map(|s| (*s).to_string()));
        self.push_message(code, path, ref_value, QcResult::ManualReview);
    }

    pub fn report_failure(&mut self, code: &str, ref_value: Option<JsonValue>) {
        let path = self.current_path();
        self.push_message(code, path, ref_value, QcResult::Fail);
    }

    fn push_message(&mut self, code: &str, path: Vec<String>, ref_value: Option<JsonValue>, escalate_to: QcResult) {
        self.messages.push(QcMessage::new(code, &path, ref_value));
        self.result = self.result.worst(escalate_to);
    }

    /// End testing of this record with a SKIP outcome
    pub fn skip_qc_test(&self) -> QcFlow {
        Err(QcSignal::Complete)
    }

    /// Apply a check's signal. Returns `Ok(false)` when testing of the record must stop.
    pub(crate) fn settle(&mut self, flow: QcFlow) -> crate::error::Result<bool> {
        match flow {
            Ok(()) | Err(QcSignal::Skip) => Ok(true),
            Err(QcSignal::Review(assertion)) => {
                if let Some(flag) = assertion.flag {
                    self.flag_current_value(flag);
                }
                self.report_for_review(&assertion.code, assertion.ref_value);
                Ok(true)
            }
            Err(QcSignal::Fail(assertion)) => {
                if let Some(flag) = assertion.flag {
                    self.flag_current_value(flag);
                }
                self.report_failure(&assertion.code, assertion.ref_value);
                Ok(true)
            }
            Err(QcSignal::Complete) => {
                self.result = QcResult::Skip;
                Ok(false)
            }
            Err(QcSignal::Error(e)) => Err(e),
        }
    }

    /// Station named by `CNODCStation`, looked up once per context
    pub async fn station(&mut self, lookup: &dyn StationLookup) -> crate::error::Result<Option<Station>> {
        if let Some(cached) = &self.station {
            return Ok(cached.clone());
        }
        let station = match self.top_record().metadata.best_string(element_names::STATION) {
            Some(uuid) => lookup.find_station(&uuid).await?,
            None => None,
        };
        self.station = Some(station.clone());
        Ok(station)
    }

    /// Forget the cached station after `CNODCStation` changes
    pub fn clear_station_cache(&mut self) {
        self.station = None;
    }

    pub fn record_note(&mut self, message: impl Into<String>) {
        let source = self.source.clone();
        self.working.record.record_note(message, &source);
    }

    fn set_top_metadata(&mut self, key: &str, value: impl Into<JsonValue>) {
        self.working.record.metadata.set_value(key, value);
    }

    pub fn recommend_discard(&mut self) {
        self.set_top_metadata(element_names::OPERATOR_ACTION, operator_action::DISCARD);
    }

    pub fn recommend_duplicate(&mut self) {
        self.set_top_metadata(element_names::OPERATOR_ACTION, operator_action::DUPLICATE);
    }

    pub fn recommend_archival(&mut self) {
        self.set_top_metadata(element_names::OPERATOR_ACTION, operator_action::ARCHIVE);
    }

    pub fn recommend_dubious(&mut self) {
        self.set_top_metadata(element_names::OPERATOR_ACTION, operator_action::DUBIOUS);
    }

    /// Mark the record discarded and stop testing it
    pub fn discard_record(&mut self, reason: &str) -> QcFlow {
        self.set_top_metadata(element_names::STATUS, record_status::DISCARDED);
        self.record_note(format!("Record discarded: {reason}"));
        Err(QcSignal::Complete)
    }

    pub fn mark_as_duplicate(&mut self, original_uuid: &str, original_date: &str) {
        self.set_top_metadata(element_names::DUPLICATE_ID, original_uuid);
        self.set_top_metadata(element_names::DUPLICATE_DATE, original_date);
        self.set_top_metadata(element_names::STATUS, record_status::DUPLICATE);
    }

    pub fn archive_record(&mut self) {
        self.set_top_metadata(element_names::STATUS, record_status::ARCHIVED);
    }

    pub fn mark_as_dubious(&mut self) {
        self.set_top_metadata(element_names::STATUS, record_status::DUBIOUS);
    }

    /// Whether the record was discarded by an earlier action
    pub fn is_discarded(&self) -> bool {
        self.top_record()
            .metadata
            .best_string(element_names::STATUS)
            .is_some_and(|s| s == record_status::DISCARDED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::quality;
    use crate::record::MultiValue;
    use chrono::NaiveDate;

    fn context() -> TestContext {
        let mut record = DataRecord::new();
        record.parameters.set("Temperature", Value::new(12.5).with_units("°C"));
        record.parameters.set(
            "Salinity",
            Element::Multi(MultiValue::new(vec![Value::new(35.1), Value::new(35.4)])),
        );
        let mut level = DataRecord::new();
        level.parameters.set_value("Temperature", 4.0);
        record.subrecords.append("PROFILE", 0, level);
        let working = WorkingRecord::new(
            record,
            "src",
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            0,
            0,
        );
        TestContext::new(
            working,
            HistorySource {
                name: "suite".into(),
                version: "1.0".into(),
                instance: "runner".into(),
            },
        )
    }

    #[test]
    fn test_paths_follow_record_and_focus() {
        let mut ctx = context();
        ctx.enter_record(vec![SubrecordStep::new("PROFILE", 0, 0)]);
        ctx.enter_value(Section::Parameters, "Temperature", None);
        assert_eq!(
            ctx.current_path(),
            vec!["subrecords/PROFILE/0/0", "parameters", "Temperature"]
        );
        assert_eq!(ctx.current_value().unwrap().as_f64(), Some(4.0));
        ctx.report_for_review("too_cold", None);
        assert_eq!(ctx.messages()[0].path, "subrecords/PROFILE/0/0/parameters/Temperature");
    }

    #[test]
    fn test_review_never_downgrades_failure() {
        let mut ctx = context();
        ctx.report_failure("broken", None);
        ctx.report_for_review("suspicious", None);
        assert_eq!(ctx.result(), QcResult::Fail);
        assert_eq!(ctx.messages().len(), 2);
    }

    #[test]
    fn test_settle_flags_addressed_subvalue() {
        let mut ctx = context();
        ctx.enter_value(Section::Parameters, "Salinity", Some(1));
        let keep_going = ctx
            .settle(Err(QcSignal::Review(
                Assertion::new("salinity_range").with_flag(quality::ERRONEOUS_PENDING),
            )))
            .unwrap();
        assert!(keep_going);
        let element = ctx.top_record().parameters.get("Salinity").unwrap();
        assert_eq!(element.subvalue(0).unwrap().working_quality(), quality::NO_QC);
        assert_eq!(element.subvalue(1).unwrap().working_quality(), quality::ERRONEOUS_PENDING);
        assert_eq!(ctx.result(), QcResult::ManualReview);
        assert_eq!(ctx.messages()[0].path, "parameters/Salinity/1");
    }

    #[test]
    fn test_complete_signal_skips_and_stops() {
        let mut ctx = context();
        ctx.report_for_review("noted", None);
        let flow = ctx.discard_record("test platform");
        assert!(!ctx.settle(flow).unwrap());
        assert_eq!(ctx.result(), QcResult::Skip);
        assert!(ctx.is_discarded());
        assert_eq!(ctx.top_record().history.len(), 1);
    }

    #[test]
    fn test_error_signal_propagates() {
        let mut ctx = context();
        let err = ctx
            .settle(Err(QcSignal::from(QcError::internal("lookup failed"))))
            .unwrap_err();
        assert!(matches!(err, QcError::Internal { .. }));
    }
}
