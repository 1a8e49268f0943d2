//! Test data builders for records, worker configs and batch submissions

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Map, Value as JsonValue};

use nodb_qc_core::batch::{BatchOutcome, BatchSubmitter};
use nodb_qc_core::config::ProcessDefinition;
use nodb_qc_core::constants::element_names;
use nodb_qc_core::record::{DataRecord, Element, Value};
use nodb_qc_core::store::WorkingRecord;
use nodb_qc_core::Result;

pub fn received_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
}

/// Builder for a surface observation record
#[derive(Debug, Clone)]
pub struct ObservationBuilder {
    record: DataRecord,
}

impl ObservationBuilder {
    pub fn new() -> Self {
        let mut record = DataRecord::new();
        record.coordinates.set_value(element_names::TIME, "2024-05-01T00:00:00Z");
        record.coordinates.set_value(element_names::LATITUDE, 45.0);
        record.coordinates.set_value(element_names::LONGITUDE, -60.0);
        Self { record }
    }

    pub fn at(mut self, time: &str, lat: f64, lon: f64) -> Self {
        self.record.coordinates.set_value(element_names::TIME, time);
        self.record.coordinates.set_value(element_names::LATITUDE, lat);
        self.record.coordinates.set_value(element_names::LONGITUDE, lon);
        self
    }

    pub fn wmo_id(mut self, wmo_id: &str) -> Self {
        self.record.metadata.set_value(element_names::WMO_ID, wmo_id);
        self
    }

    pub fn station(mut self, station_uuid: &str) -> Self {
        self.record.metadata.set_value(element_names::STATION, station_uuid);
        self
    }

    pub fn temperature(mut self, celsius: f64) -> Self {
        self.record
            .parameters
            .set("Temperature", Value::new(celsius).with_units("°C"));
        self
    }

    pub fn salinity(mut self, psu: f64) -> Self {
        self.record.parameters.set("Salinity", Value::new(psu).with_units("psu"));
        self
    }

    pub fn parameter(mut self, name: &str, element: impl Into<Element>) -> Self {
        self.record.parameters.set(name, element);
        self
    }

    pub fn build(self) -> DataRecord {
        self.record
    }

    pub fn working(self, source: &str, record_idx: i32) -> WorkingRecord {
        WorkingRecord::new(self.record, source, received_date(), 0, record_idx)
    }
}

impl Default for ObservationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Pipeline entry with fast polling
pub fn process_definition(class_name: &str, count: usize, config: JsonValue) -> ProcessDefinition {
    let mut map = Map::new();
    map.insert("delay_time_seconds".into(), json!(0.01));
    map.insert("max_delay_time_seconds".into(), json!(0.05));
    if let JsonValue::Object(extra) = config {
        map.extend(extra);
    }
    ProcessDefinition {
        class_name: class_name.to_string(),
        count,
        config: map,
    }
}

/// One flushed batch seen by [`CollectingSubmitter`]
#[derive(Debug, Clone, PartialEq)]
pub struct Flushed {
    pub batch_uuid: String,
    pub working_uuids: Vec<String>,
    pub outcome: BatchOutcome,
    pub group_key: Option<String>,
}

/// Submitter keeping every submission in memory
#[derive(Debug, Default)]
pub struct CollectingSubmitter {
    pub flushed: Vec<Flushed>,
}

#[async_trait]
impl BatchSubmitter for CollectingSubmitter {
    async fn submit_batch(
        &mut self,
        working_uuids: &[String],
        outcome: BatchOutcome,
        group_key: Option<&str>,
    ) -> Result<String> {
        let batch_uuid = format!("batch-{}", self.flushed.len());
        self.flushed.push(Flushed {
            batch_uuid: batch_uuid.clone(),
            working_uuids: working_uuids.to_vec(),
            outcome,
            group_key: group_key.map(str::to_string),
        });
        Ok(batch_uuid)
    }

    async fn submit_existing_batch(
        &mut self,
        batch_uuid: &str,
        outcome: BatchOutcome,
        group_key: Option<&str>,
    ) -> Result<()> {
        self.flushed.push(Flushed {
            batch_uuid: batch_uuid.to_string(),
            working_uuids: Vec::new(),
            outcome,
            group_key: group_key.map(str::to_string),
        });
        Ok(())
    }
}
