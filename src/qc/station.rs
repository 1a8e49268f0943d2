//! # Station Resolution
//!
//! Ties each observation to a station record. A record that already names a station
//! (`CNODCStation`) is looked up directly; otherwise the stations in service at the
//! observation time are searched by WMO id, WIGOS id, station id and station name.
//! Forwarding pointers (`map_to_uuid`) are followed to their terminal station, and
//! ambiguity is reported with the full candidate set rather than guessed at.
//!
//! The `nodb_station_check` suite writes the outcome back onto the record:
//!
//! | Outcome | Message | Metadata left on the record |
//! |---|---|---|
//! | one station | `station_incomplete` if INCOMPLETE | `CNODCStation` |
//! | stored uuid unknown | `station_bad_uuid` | `CNODCStation` |
//! | identifiers, no match | `station_no_record` | `CNODCStationString` |
//! | no identifiers | `station_no_id` | nothing |
//! | several matches | `station_many_records` | `CNODCStationCandidates` |

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use super::context::{QcFlow, TestContext};
use super::suite::{QcCheck, RecordScope, SuiteParams, TestSuite};
use crate::constants::{element_names, quality};
use crate::error::{QcError, Result};
use crate::record::DataRecord;
use crate::store::{Station, StationLookup, StationQuery, StationStatus};

pub const SUITE_NAME: &str = "nodb_station_check";
pub const SUITE_VERSION: &str = "1.0";

/// Outcome of resolving a record's station
#[derive(Debug, Clone, PartialEq)]
pub enum StationResolution {
    Resolved(Station),
    /// `CNODCStation` names a station that does not exist
    BadUuid(String),
    /// Identifiers present but nothing matched
    NoRecord,
    /// No identifiers to search by
    NoId,
    /// Sorted uuids of every distinct terminal match
    Many(Vec<String>),
}

/// Search parameters taken from the record's identifier metadata and `Time` coordinate
pub fn station_query(record: &DataRecord) -> StationQuery {
    let md = &record.metadata;
    StationQuery {
        wmo_id: md.best_string(element_names::WMO_ID),
        wigos_id: md.best_string(element_names::WIGOS_ID),
        station_id: md.best_string(element_names::STATION_ID),
        station_name: md.best_string(element_names::STATION_NAME),
        in_service_at: record
            .coordinates
            .get(element_names::TIME)
            .and_then(|e| e.ideal())
            .and_then(|v| v.as_datetime()),
    }
}

/// `WMOID=..&WIGOSID=..&StationID=..&StationName=..`, present keys only
pub fn station_string(record: &DataRecord) -> String {
    element_names::STATION_IDENTIFIERS
        .iter()
        .filter_map(|key| {
            record
                .metadata
                .best_string(key)
                .filter(|v| !v.is_empty())
                .map(|v| format!("{key}={v}"))
        })
        .collect::<Vec<_>>()
        .join("&")
}

pub async fn resolve_station(lookup: &dyn StationLookup, record: &DataRecord) -> Result<StationResolution> {
    if let Some(uuid) = record.metadata.best_string(element_names::STATION) {
        return Ok(match lookup.find_station(&uuid).await? {
            Some(station) => StationResolution::Resolved(station),
            None => StationResolution::BadUuid(uuid),
        });
    }
    let query = station_query(record);
    if !query.has_identifiers() {
        return Ok(StationResolution::NoId);
    }
    let matches = lookup.search_stations(&query).await?;
    let mut cache: BTreeMap<String, Station> = matches
        .iter()
        .map(|s| (s.station_uuid.clone(), s.clone()))
        .collect();

    let mut terminals: BTreeMap<String, Station> = BTreeMap::new();
    for station in matches {
        let terminal = follow_forwarding(lookup, station, &mut cache).await?;
        terminals.insert(terminal.station_uuid.clone(), terminal);
    }

    Ok(match terminals.len() {
        0 => StationResolution::NoRecord,
        1 => match terminals.into_values().next() {
            Some(station) => StationResolution::Resolved(station),
            None => StationResolution::NoRecord,
        },
        _ => StationResolution::Many(terminals.into_keys().collect()),
    })
}

/// Follow `map_to_uuid` to the terminal station. A dangling or cyclic chain is
/// `STATION-1000`.
async fn follow_forwarding(
    lookup: &dyn StationLookup,
    mut station: Station,
    cache: &mut BTreeMap<String, Station>,
) -> Result<Station> {
    let mut seen = HashSet::new();
    seen.insert(station.station_uuid.clone());
    while let Some(next_uuid) = station.map_to_uuid.clone() {
        if !seen.insert(next_uuid.clone()) {
            return Err(QcError::station(
                1000,
                format!("Station forwarding loop at [{next_uuid}]"),
            ));
        }
        station = match cache.get(&next_uuid) {
            Some(cached) => cached.clone(),
            None => {
                let loaded = lookup.find_station(&next_uuid).await?.ok_or_else(|| {
                    QcError::station(
                        1000,
                        format!(
                            "Station [{}] maps to missing station [{next_uuid}]",
                            station.station_uuid
                        ),
                    )
                })?;
                cache.insert(next_uuid.clone(), loaded.clone());
                loaded
            }
        };
    }
    Ok(station)
}

/// Record check backing `nodb_station_check`
pub struct StationCheck {
    lookup: Arc<dyn StationLookup>,
}

impl StationCheck {
    pub fn new(lookup: Arc<dyn StationLookup>) -> Self {
        Self { lookup }
    }
}

#[async_trait]
impl QcCheck for StationCheck {
    async fn check(&self, ctx: &mut TestContext) -> QcFlow {
        let skip = ctx
            .top_record()
            .metadata
            .get(element_names::STATION)
            .is_some_and(|e| e.working_quality() == quality::MISSING);
        if skip {
            return Ok(());
        }

        let resolution = resolve_station(self.lookup.as_ref(), ctx.top_record()).await?;
        debug!(working_uuid = %ctx.working_uuid(), resolution = ?resolution, "Station resolved");
        ctx.clear_station_cache();
        let string = station_string(ctx.top_record());
        let metadata = &mut ctx.top_record_mut().metadata;
        let review = match resolution {
            StationResolution::Resolved(station) => {
                metadata.set_value(element_names::STATION, station.station_uuid.clone());
                metadata.remove(element_names::STATION_CANDIDATES);
                metadata.remove(element_names::STATION_STRING);
                (station.status == StationStatus::Incomplete).then_some("station_incomplete")
            }
            StationResolution::BadUuid(_) => {
                metadata.remove(element_names::STATION_CANDIDATES);
                metadata.remove(element_names::STATION_STRING);
                Some("station_bad_uuid")
            }
            StationResolution::NoRecord => {
                metadata.remove(element_names::STATION_CANDIDATES);
                metadata.set_value(element_names::STATION_STRING, string);
                Some("station_no_record")
            }
            StationResolution::NoId => {
                metadata.remove(element_names::STATION);
                metadata.remove(element_names::STATION_CANDIDATES);
                metadata.remove(element_names::STATION_STRING);
                Some("station_no_id")
            }
            StationResolution::Many(candidates) => {
                metadata.remove(element_names::STATION);
                metadata.remove(element_names::STATION_STRING);
                metadata.set_value(
                    element_names::STATION_CANDIDATES,
                    JsonValue::Array(candidates.into_iter().map(JsonValue::String).collect()),
                );
                Some("station_many_records")
            }
        };
        if let Some(code) = review {
            ctx.report_for_review(code, None);
        }
        Ok(())
    }
}

pub fn suite(lookup: Arc<dyn StationLookup>) -> TestSuite {
    TestSuite::new(SUITE_NAME, SUITE_VERSION)
        .station_invariant(false)
        .with_tags(["GTSPP_1.1"])
        .record_check(RecordScope::top_only(), StationCheck::new(lookup))
}

pub(crate) fn build_suite(params: &SuiteParams<'_>) -> Result<TestSuite> {
    Ok(suite(params.services.stations.clone()))
}
