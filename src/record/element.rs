//! Leaf values, multi-valued candidates and element maps.
//!
//! The JSON mapping mirrors the stored working-record format:
//!
//! - a bare JSON value when a single value has no metadata or correction
//! - `{"_value": v, "_metadata": {...}, "_corrected": c}` otherwise
//! - `{"_values": [...], "_metadata": {...}}` for a multi-valued element

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

use crate::constants::{element_names, quality};
use crate::error::{QcError, Result};
use crate::units::Measurement;

/// Whether a raw JSON datum counts as "no value"
pub fn is_empty_json(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(a) => a.is_empty(),
        _ => false,
    }
}

/// Parse an ISO 8601 timestamp, accepting offsets, naive date-times and bare dates
pub fn parse_iso_datetime(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// A single datum with an optional correction and its own metadata
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Value {
    pub value: JsonValue,
    pub corrected: Option<JsonValue>,
    pub metadata: ElementMap,
}

impl Value {
    pub fn new(value: impl Into<JsonValue>) -> Self {
        Self {
            value: value.into(),
            corrected: None,
            metadata: ElementMap::default(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, name: &str, value: impl Into<JsonValue>) -> Self {
        self.metadata.set_value(name, value);
        self
    }

    pub fn with_units(self, units: &str) -> Self {
        self.with_metadata(element_names::UNITS, units)
    }

    pub fn with_uncertainty(self, uncertainty: f64) -> Self {
        self.with_metadata(element_names::UNCERTAINTY, uncertainty)
    }

    pub fn with_working_quality(self, flag: i64) -> Self {
        self.with_metadata(element_names::WORKING_QUALITY, flag)
    }

    pub fn with_corrected(mut self, corrected: impl Into<JsonValue>) -> Self {
        self.corrected = Some(corrected.into());
        self
    }

    /// The corrected value when present and non-empty, else the raw value
    pub fn best(&self) -> &JsonValue {
        match &self.corrected {
            Some(c) if !is_empty_json(c) => c,
            _ => &self.value,
        }
    }

    pub fn is_empty(&self) -> bool {
        is_empty_json(self.best())
    }

    pub fn working_quality(&self) -> i64 {
        self.metadata
            .best_i64(element_names::WORKING_QUALITY)
            .unwrap_or(quality::NO_QC)
    }

    pub fn set_working_quality(&mut self, flag: i64) {
        self.metadata.set_value(element_names::WORKING_QUALITY, flag);
    }

    pub fn units(&self) -> Option<String> {
        self.metadata
            .best_string(element_names::UNITS)
            .filter(|u| !u.is_empty())
    }

    pub fn uncertainty(&self) -> Option<f64> {
        self.metadata.best_f64(element_names::UNCERTAINTY)
    }

    pub fn as_f64(&self) -> Option<f64> {
        json_to_f64(self.best())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.best() {
            JsonValue::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.best().as_str()
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        self.as_str().and_then(parse_iso_datetime)
    }

    pub fn is_numeric(&self) -> bool {
        self.as_f64().is_some()
    }

    pub fn is_integer(&self) -> bool {
        self.as_i64().is_some()
    }

    pub fn is_iso_datetime(&self) -> bool {
        self.as_datetime().is_some()
    }

    /// The numeric value paired with its uncertainty, in the value's own units
    pub fn measurement(&self) -> Option<Measurement> {
        self.as_f64()
            .map(|v| Measurement::new(v, self.uncertainty().unwrap_or(0.0)))
    }

    /// Good values have WQ 1, 2 or 5 (3 when dubious is allowed); no flag counts as good
    pub fn is_good(&self, allow_dubious: bool) -> bool {
        if self.is_empty() {
            return false;
        }
        match self.working_quality() {
            quality::NO_QC | quality::GOOD | quality::PROBABLY_GOOD | quality::CHANGED => true,
            quality::DUBIOUS => allow_dubious,
            _ => false,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        if self.metadata.is_empty() && self.corrected.is_none() && !self.value.is_object() {
            return self.value.clone();
        }
        let mut map = Map::new();
        map.insert("_value".to_string(), self.value.clone());
        map.insert("_metadata".to_string(), self.metadata.to_json());
        if let Some(c) = &self.corrected {
            map.insert("_corrected".to_string(), c.clone());
        }
        JsonValue::Object(map)
    }
}

fn json_to_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// An ordered list of candidate values for one field
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultiValue {
    pub values: Vec<Value>,
    pub metadata: ElementMap,
}

impl MultiValue {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            metadata: ElementMap::default(),
        }
    }
}

/// A field in an element map: one value, or several candidates
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Single(Value),
    Multi(MultiValue),
}

impl Element {
    /// The preferred candidate: the first with a non-empty best value
    pub fn ideal(&self) -> Option<&Value> {
        match self {
            Element::Single(v) => Some(v),
            Element::Multi(m) => m
                .values
                .iter()
                .find(|v| !v.is_empty())
                .or_else(|| m.values.first()),
        }
    }

    pub fn best_value(&self) -> Option<&JsonValue> {
        self.ideal().map(Value::best)
    }

    pub fn all_values(&self) -> Vec<&Value> {
        match self {
            Element::Single(v) => vec![v],
            Element::Multi(m) => m.values.iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Element::Single(_) => 1,
            Element::Multi(m) => m.values.len(),
        }
    }

    pub fn is_multi(&self) -> bool {
        matches!(self, Element::Multi(_))
    }

    pub fn is_empty(&self) -> bool {
        self.all_values().iter().all(|v| v.is_empty())
    }

    pub fn working_quality(&self) -> i64 {
        self.ideal()
            .map(Value::working_quality)
            .unwrap_or(quality::NO_QC)
    }

    pub fn metadata(&self) -> &ElementMap {
        match self {
            Element::Single(v) => &v.metadata,
            Element::Multi(m) => &m.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ElementMap {
        match self {
            Element::Single(v) => &mut v.metadata,
            Element::Multi(m) => &mut m.metadata,
        }
    }

    /// Candidate `idx` for a multi-value, or the value itself for index 0 of a single
    pub fn subvalue(&self, idx: usize) -> Option<&Value> {
        match self {
            Element::Single(v) if idx == 0 => Some(v),
            Element::Single(_) => None,
            Element::Multi(m) => m.values.get(idx),
        }
    }

    pub fn subvalue_mut(&mut self, idx: usize) -> Option<&mut Value> {
        match self {
            Element::Single(v) if idx == 0 => Some(v),
            Element::Single(_) => None,
            Element::Multi(m) => m.values.get_mut(idx),
        }
    }

    /// Set the working quality flag on every candidate
    pub fn set_working_quality(&mut self, flag: i64) {
        match self {
            Element::Single(v) => v.set_working_quality(flag),
            Element::Multi(m) => m
                .values
                .iter_mut()
                .for_each(|v| v.set_working_quality(flag)),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Element::Single(v) => v.to_json(),
            Element::Multi(m) => {
                let mut map = Map::new();
                map.insert(
                    "_values".to_string(),
                    JsonValue::Array(m.values.iter().map(Value::to_json).collect()),
                );
                map.insert("_metadata".to_string(), m.metadata.to_json());
                JsonValue::Object(map)
            }
        }
    }

    pub fn from_json(json: &JsonValue) -> Result<Self> {
        let JsonValue::Object(map) = json else {
            return Ok(Element::Single(Value::new(json.clone())));
        };
        let metadata = match map.get("_metadata") {
            Some(md) => ElementMap::from_json(md)?,
            None => ElementMap::default(),
        };
        if let Some(value) = map.get("_value") {
            return Ok(Element::Single(Value {
                value: value.clone(),
                corrected: map.get("_corrected").cloned(),
                metadata,
            }));
        }
        if let Some(JsonValue::Array(values)) = map.get("_values") {
            let values = values
                .iter()
                .map(|v| match Element::from_json(v)? {
                    Element::Single(value) => Ok(value),
                    Element::Multi(_) => Err(QcError::serialization(
                        "nested multi-values are not supported",
                    )),
                })
                .collect::<Result<Vec<_>>>()?;
            return Ok(Element::Multi(MultiValue { values, metadata }));
        }
        Err(QcError::serialization(
            "element object must contain _value or _values",
        ))
    }
}

impl From<Value> for Element {
    fn from(value: Value) -> Self {
        Element::Single(value)
    }
}

impl From<MultiValue> for Element {
    fn from(value: MultiValue) -> Self {
        Element::Multi(value)
    }
}

/// Named elements of one record section (coordinates, parameters or metadata)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ElementMap {
    entries: BTreeMap<String, Element>,
}

impl ElementMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Element> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.entries.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Present and not empty
    pub fn has_value(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|e| !e.is_empty())
    }

    pub fn set(&mut self, name: impl Into<String>, element: impl Into<Element>) {
        self.entries.insert(name.into(), element.into());
    }

    pub fn set_value(&mut self, name: impl Into<String>, value: impl Into<JsonValue>) {
        self.set(name, Value::new(value));
    }

    pub fn remove(&mut self, name: &str) -> Option<Element> {
        self.entries.remove(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Element)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn best_value(&self, name: &str) -> Option<&JsonValue> {
        self.entries.get(name).and_then(Element::best_value)
    }

    /// Best value rendered as a string; numbers and booleans are stringified
    pub fn best_string(&self, name: &str) -> Option<String> {
        match self.best_value(name)? {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn best_f64(&self, name: &str) -> Option<f64> {
        self.best_value(name).and_then(json_to_f64)
    }

    pub fn best_i64(&self, name: &str) -> Option<i64> {
        self.entries
            .get(name)
            .and_then(Element::ideal)
            .and_then(Value::as_i64)
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    pub fn from_json(json: &JsonValue) -> Result<Self> {
        match json {
            JsonValue::Null => Ok(Self::default()),
            JsonValue::Object(map) => {
                let mut entries = BTreeMap::new();
                for (k, v) in map {
                    entries.insert(k.clone(), Element::from_json(v)?);
                }
                Ok(Self { entries })
            }
            _ => Err(QcError::serialization("element map must be an object")),
        }
    }
}

impl Serialize for ElementMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ElementMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        ElementMap::from_json(&json).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_best_value_prefers_non_empty_correction() {
        let v = Value::new(12.5).with_corrected(12.1);
        assert_eq!(v.best(), &json!(12.1));
        let v = Value::new(12.5).with_corrected("");
        assert_eq!(v.best(), &json!(12.5));
    }

    #[test]
    fn test_multi_value_picks_first_non_empty_candidate() {
        let element = Element::Multi(MultiValue::new(vec![
            Value::new(JsonValue::Null),
            Value::new("B"),
            Value::new("C"),
        ]));
        assert_eq!(element.best_value(), Some(&json!("B")));
        assert!(!element.is_empty());
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(Value::new("4.5").as_f64(), Some(4.5));
        assert!(Value::new("abc").as_f64().is_none());
        assert_eq!(Value::new(3.0).as_i64(), Some(3));
        assert!(Value::new("2024-03-01T12:00:00Z").is_iso_datetime());
        assert!(Value::new("2024-03-01T12:00:00").is_iso_datetime());
    }

    #[test]
    fn test_is_good_flags() {
        assert!(Value::new(1.0).is_good(false));
        assert!(!Value::new(1.0).with_working_quality(3).is_good(false));
        assert!(Value::new(1.0).with_working_quality(3).is_good(true));
        assert!(!Value::new(1.0).with_working_quality(4).is_good(true));
        assert!(!Value::empty().is_good(true));
    }

    #[test]
    fn test_json_mapping_shapes() {
        let bare = Value::new(5);
        assert_eq!(bare.to_json(), json!(5));

        let with_units = Value::new(5).with_units("m");
        assert_eq!(
            with_units.to_json(),
            json!({"_value": 5, "_metadata": {"Units": "m"}})
        );

        let multi = Element::Multi(MultiValue::new(vec![Value::new(1), Value::new(2)]));
        let json = multi.to_json();
        assert_eq!(Element::from_json(&json).unwrap(), multi);
    }

    #[test]
    fn test_element_map_helpers() {
        let mut map = ElementMap::new();
        map.set_value("WMOID", 45123);
        map.set_value("StationName", "");
        assert!(map.has_value("WMOID"));
        assert!(!map.has_value("StationName"));
        assert_eq!(map.best_string("WMOID").as_deref(), Some("45123"));
        assert_eq!(map.best_i64("WMOID"), Some(45123));
        assert!(map.remove("WMOID").is_some());
        assert!(!map.contains("WMOID"));
    }
}
