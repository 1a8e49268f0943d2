//! Batching and duplicate scenarios over realistic observation records

mod common;

use common::{CollectingSubmitter, ObservationBuilder};
use std::sync::Arc;

use nodb_qc_core::batch::{BatchManager, BatchOutcome, GroupKey, ResultBatcher};
use nodb_qc_core::config::{BatchLimits, DuplicateCheckSettings, QcTestSpec};
use nodb_qc_core::constants::element_names;
use nodb_qc_core::qc::{resolve_station, DuplicateVerdict, RecordComparator, StationResolution, ValueComparison};
use nodb_qc_core::record::QcResult;
use nodb_qc_core::store::{MemoryStore, Station};
use nodb_qc_core::units::LinearUnitConverter;
use nodb_qc_core::{QcServices, QcSuiteRegistry};

fn comparator() -> RecordComparator {
    RecordComparator::new(Arc::new(LinearUnitConverter::new()), DuplicateCheckSettings::default())
}

#[tokio::test]
async fn test_max_batch_size_splits_one_group() {
    let limits = BatchLimits {
        max_batch_size: Some(2),
        ..BatchLimits::default()
    };
    let mut manager = BatchManager::new(limits);
    let mut submitter = CollectingSubmitter::default();

    let records: Vec<_> = (0..3)
        .map(|idx| ObservationBuilder::new().station("st-x").working("src", idx))
        .collect();

    manager.add_result(&mut submitter, &records[0], QcResult::Pass).await.unwrap();
    assert!(submitter.flushed.is_empty());
    manager.add_result(&mut submitter, &records[1], QcResult::Pass).await.unwrap();
    assert_eq!(submitter.flushed.len(), 1);
    assert_eq!(
        submitter.flushed[0].working_uuids,
        vec![records[0].working_uuid.clone(), records[1].working_uuid.clone()]
    );

    manager.add_result(&mut submitter, &records[2], QcResult::Pass).await.unwrap();
    assert_eq!(submitter.flushed.len(), 1);
    manager.flush_all(&mut submitter).await.unwrap();

    assert_eq!(submitter.flushed.len(), 2);
    assert_eq!(submitter.flushed[1].working_uuids, vec![records[2].working_uuid.clone()]);
    for flushed in &submitter.flushed {
        assert_eq!(flushed.group_key.as_deref(), Some("st-x"));
        assert_eq!(flushed.outcome, BatchOutcome::NextQueue);
    }
    assert_eq!(manager.buffered(), 0);
}

#[tokio::test]
async fn test_missing_salinity_is_better_not_conflict_and_batches_together() {
    let a = ObservationBuilder::new()
        .station("st-x")
        .temperature(12.5)
        .salinity(34.1)
        .working("src", 0);
    let b = ObservationBuilder::new()
        .station("st-x")
        .at("2024-05-01T00:03:00Z", 45.0005, -60.0)
        .temperature(12.5)
        .working("src", 1);

    let comparator = comparator();
    assert!(comparator.within_window(&a.record, &b.record));

    // Coordinates differ slightly, so only the parameters are compared here
    let mut same_spot = b.record.clone();
    same_spot.coordinates = a.record.coordinates.clone();
    let tally = comparator.compare_records(&a.record, &same_spot);
    assert_eq!(tally.conflict, 0);
    assert_eq!(tally.distill(), ValueComparison::ABetter);
    assert_eq!(comparator.compare_records(&same_spot, &a.record).distill(), ValueComparison::BBetter);
    assert_eq!(comparator.check(&a.record, &same_spot), DuplicateVerdict::ASuperset);

    let mut manager = BatchManager::new(BatchLimits::default());
    let mut submitter = CollectingSubmitter::default();
    manager.add_result(&mut submitter, &a, QcResult::Pass).await.unwrap();
    manager.add_result(&mut submitter, &b, QcResult::Pass).await.unwrap();
    manager.flush_all(&mut submitter).await.unwrap();

    assert_eq!(submitter.flushed.len(), 1);
    assert_eq!(submitter.flushed[0].working_uuids.len(), 2);
    assert_eq!(submitter.flushed[0].outcome, BatchOutcome::NextQueue);
}

#[tokio::test]
async fn test_record_without_identifiers_lands_in_sentinel_group() {
    let store = MemoryStore::new();
    let services = QcServices::from_memory(&store);
    let runner = QcSuiteRegistry::with_defaults()
        .build_runner(
            &[QcTestSpec {
                name: "nodb_station_check".to_string(),
                config: Default::default(),
            }],
            "runner-1",
            &services,
        )
        .unwrap();

    let working = ObservationBuilder::new().temperature(4.0).working("src", 0);
    let outcomes = runner.process_batch(vec![working]).await.unwrap();
    let outcome = &outcomes[0];

    assert_eq!(outcome.result, QcResult::ManualReview);
    let run = outcome.working.record.latest_test_result("nodb_station_check").unwrap();
    assert!(run.messages.iter().any(|m| m.code == "station_no_id"));

    let key = GroupKey::from_record(&outcome.working.record);
    assert_eq!(key, GroupKey::NoStationId);
    assert_eq!(key.dedupe_key(), None);

    let mut manager = BatchManager::new(BatchLimits::default());
    let mut submitter = CollectingSubmitter::default();
    manager
        .add_result(&mut submitter, &outcome.working, outcome.result)
        .await
        .unwrap();
    manager.flush_all(&mut submitter).await.unwrap();
    assert_eq!(submitter.flushed.len(), 1);
    assert_eq!(submitter.flushed[0].group_key, None);
    assert_eq!(submitter.flushed[0].outcome, BatchOutcome::ReviewQueue);
}

#[tokio::test]
async fn test_station_resolution_is_idempotent() {
    let store = MemoryStore::new();
    let mut retired = Station::new("st-old");
    retired.wmo_id = Some("44137".to_string());
    retired.map_to_uuid = Some("st-new".to_string());
    store.add_station(retired);
    store.add_station(Station::new("st-new"));

    let mut record = ObservationBuilder::new().wmo_id("44137").build();
    let first = resolve_station(&store, &record).await.unwrap();
    let StationResolution::Resolved(station) = first else {
        panic!("expected a resolved station, got {first:?}");
    };
    assert_eq!(station.station_uuid, "st-new");

    record
        .metadata
        .set_value(element_names::STATION, station.station_uuid.clone());
    for _ in 0..2 {
        let again = resolve_station(&store, &record).await.unwrap();
        assert_eq!(again, StationResolution::Resolved(station.clone()));
    }

    store.remove_station("st-new");
    assert_eq!(
        resolve_station(&store, &record).await.unwrap(),
        StationResolution::BadUuid("st-new".to_string())
    );
}
