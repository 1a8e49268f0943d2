//! # Record-Set Checks
//!
//! Checks that look at a whole set of sibling sub-records at once, typically the
//! levels of a profile. The suite lays the set out as [`LevelColumns`]: one column
//! per numeric coordinate or parameter, one row per record of the set, `None` where
//! a record lacks the value.
//!
//! A check registered for a set either runs once per set (findings land on
//! `subrecords/{type}/{set}`) or once per level (findings land on
//! `subrecords/{type}/{set}/{level}`).

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::context::{QcFlow, QcSignal, TestContext};
use crate::record::{Element, ElementMap, RecordSet, Value};

/// A check over one record set
#[async_trait]
pub trait RecordSetCheck: Send + Sync {
    async fn check(&self, ctx: &mut TestContext, levels: &LevelColumns) -> QcFlow;
}

#[async_trait]
impl<F> RecordSetCheck for F
where
    F: Fn(&mut TestContext, &LevelColumns) -> QcFlow + Send + Sync,
{
    async fn check(&self, ctx: &mut TestContext, levels: &LevelColumns) -> QcFlow {
        self(ctx, levels)
    }
}

/// Which record sets a record-set check runs over, and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSetTarget {
    pub subrecord_type: String,
    /// Sets without this column are not checked
    pub required_column: Option<String>,
    /// Run once per record of the set instead of once per set
    pub per_level: bool,
}

impl RecordSetTarget {
    pub fn sets(subrecord_type: impl Into<String>) -> Self {
        Self {
            subrecord_type: subrecord_type.into(),
            required_column: None,
            per_level: false,
        }
    }

    pub fn levels(subrecord_type: impl Into<String>) -> Self {
        Self {
            per_level: true,
            ..Self::sets(subrecord_type)
        }
    }

    pub fn requiring(mut self, column: impl Into<String>) -> Self {
        self.required_column = Some(column.into());
        self
    }

    pub(crate) fn accepts(&self, levels: &LevelColumns) -> bool {
        match &self.required_column {
            Some(column) => levels.has_column(column),
            None => true,
        }
    }
}

/// Column layout of the numeric values of one record set
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LevelColumns {
    len: usize,
    columns: BTreeMap<String, Vec<Option<Value>>>,
}

impl LevelColumns {
    /// Coordinates first; a parameter sharing a coordinate's name keeps the coordinate
    pub fn from_set(set: &RecordSet) -> Self {
        let len = set.records.len();
        let mut columns: BTreeMap<String, Vec<Option<Value>>> = BTreeMap::new();
        for (level, record) in set.records.iter().enumerate() {
            for map in [&record.coordinates, &record.parameters] {
                for (name, value) in numeric_values(map) {
                    let column = columns.entry(name.clone()).or_insert_with(|| vec![None; len]);
                    if column[level].is_none() {
                        column[level] = Some(value.clone());
                    }
                }
            }
        }
        Self { len, columns }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &String> {
        self.columns.keys()
    }

    pub fn get(&self, name: &str, level: usize) -> Option<&Value> {
        self.columns.get(name)?.get(level)?.as_ref()
    }

    pub fn number(&self, name: &str, level: usize) -> Option<f64> {
        self.get(name, level).and_then(Value::as_f64)
    }

    pub fn has_good_value(&self, name: &str, level: usize, allow_dubious: bool) -> bool {
        self.get(name, level).is_some_and(|v| v.is_good(allow_dubious))
    }

    /// `Skip` when no record of the set carries the column
    pub fn require_column(&self, name: &str) -> QcFlow {
        if self.has_column(name) {
            Ok(())
        } else {
            Err(QcSignal::Skip)
        }
    }

    /// Level index and number of every good value in the column
    pub fn good_values(&self, name: &str, allow_dubious: bool) -> Vec<(usize, f64)> {
        let Some(column) = self.columns.get(name) else {
            return Vec::new();
        };
        column
            .iter()
            .enumerate()
            .filter_map(|(level, value)| {
                let value = value.as_ref().filter(|v| v.is_good(allow_dubious))?;
                value.as_f64().map(|n| (level, n))
            })
            .collect()
    }
}

fn numeric_values(map: &ElementMap) -> impl Iterator<Item = (&String, &Value)> {
    map.iter().filter_map(|(name, element)| {
        let value = match element {
            Element::Single(value) => value,
            Element::Multi(_) => element.ideal()?,
        };
        value.is_numeric().then_some((name, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::quality;
    use crate::record::DataRecord;

    fn level(depth: Option<f64>, temperature: Option<Value>) -> DataRecord {
        let mut record = DataRecord::new();
        if let Some(depth) = depth {
            record.coordinates.set_value("Depth", depth);
        }
        if let Some(temperature) = temperature {
            record.parameters.set("Temperature", temperature);
        }
        record.metadata.set_value("Instrument", "CTD");
        record
    }

    #[test]
    fn test_columns_hold_gaps_for_missing_values() {
        let set = RecordSet::new(vec![
            level(Some(0.0), Some(Value::new(12.5))),
            level(Some(10.0), None),
            level(None, Some(Value::new("n/a"))),
        ]);
        let levels = LevelColumns::from_set(&set);
        assert_eq!(levels.len(), 3);
        assert_eq!(levels.number("Depth", 1), Some(10.0));
        assert!(levels.get("Depth", 2).is_none());
        assert!(levels.get("Temperature", 1).is_none());
        // Only numeric values make it into the columns.
        assert!(levels.get("Temperature", 2).is_none());
        assert!(!levels.has_column("Instrument"));
        assert!(levels.require_column("Salinity").is_err());
    }

    #[test]
    fn test_good_values_respect_working_quality() {
        let set = RecordSet::new(vec![
            level(Some(0.0), Some(Value::new(12.0))),
            level(Some(5.0), Some(Value::new(11.0).with_working_quality(quality::DUBIOUS))),
            level(Some(10.0), Some(Value::new(10.0).with_working_quality(quality::ERRONEOUS))),
        ]);
        let levels = LevelColumns::from_set(&set);
        assert_eq!(levels.good_values("Temperature", false), vec![(0, 12.0)]);
        assert_eq!(
            levels.good_values("Temperature", true),
            vec![(0, 12.0), (1, 11.0)]
        );
        assert!(!levels.has_good_value("Temperature", 2, true));
    }

    #[test]
    fn test_required_column_gates_target() {
        let set = RecordSet::new(vec![level(None, Some(Value::new(3.0)))]);
        let levels = LevelColumns::from_set(&set);
        assert!(!RecordSetTarget::levels("PROFILE").requiring("Depth").accepts(&levels));
        assert!(RecordSetTarget::sets("PROFILE").accepts(&levels));
    }
}
