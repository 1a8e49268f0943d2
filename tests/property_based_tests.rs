mod common;

use common::strategies::*;
use common::{CollectingSubmitter, ObservationBuilder};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use nodb_qc_core::batch::{BatchManager, ResultBatcher};
use nodb_qc_core::config::{BatchLimits, DuplicateCheckSettings};
use nodb_qc_core::qc::{RecordComparator, ValueComparison};
use nodb_qc_core::record::Value;
use nodb_qc_core::units::LinearUnitConverter;
use nodb_qc_core::workflow::WorkflowPayload;

fn comparator() -> RecordComparator {
    RecordComparator::new(Arc::new(LinearUnitConverter::new()), DuplicateCheckSettings::default())
}

proptest! {
    /// Property: comparing B with A mirrors comparing A with B
    #[test]
    fn duplicate_comparison_is_symmetric(
        temp_a in temperature_strategy(),
        temp_b in temperature_strategy(),
        sal_a in prop::option::of(salinity_strategy()),
        sal_b in prop::option::of(salinity_strategy()),
        tag_a in prop::option::of(element_strategy()),
        tag_b in prop::option::of(element_strategy()),
    ) {
        let c = comparator();
        let mut a = ObservationBuilder::new().station("st-a").temperature(temp_a);
        let mut b = ObservationBuilder::new().station("st-a").temperature(temp_b);
        if let Some(s) = sal_a {
            a = a.salinity(s);
        }
        if let Some(s) = sal_b {
            b = b.salinity(s);
        }
        if let Some(e) = tag_a {
            a = a.parameter("SensorTag", e);
        }
        if let Some(e) = tag_b {
            b = b.parameter("SensorTag", e);
        }
        let (a, b) = (a.build(), b.build());

        prop_assert_eq!(c.compare_records(&a, &b).mirror(), c.compare_records(&b, &a));
        prop_assert_eq!(c.content_verdict(&a, &b).mirror(), c.content_verdict(&b, &a));
        prop_assert_eq!(c.check(&a, &b).mirror(), c.check(&b, &a));
    }

    /// Property: single value comparison mirrors, including unit conversion
    #[test]
    fn value_comparison_is_symmetric(a in -1000i32..1000, b in -1000i32..1000, km in any::<bool>()) {
        let c = comparator();
        let left = if km {
            Value::new(f64::from(a) / 1000.0).with_units("km")
        } else {
            Value::new(f64::from(a)).with_units("m")
        };
        let right = Value::new(f64::from(b)).with_units("m");
        let forward = c.compare_values(&left, &right);
        prop_assert_eq!(forward.mirror(), c.compare_values(&right, &left));
        if a == b {
            prop_assert_eq!(forward, ValueComparison::Identical);
        }
    }

    /// Property: every record lands in exactly one flushed batch and nothing stays pending
    #[test]
    fn batch_manager_flushes_each_record_once(
        entries in prop::collection::vec((station_strategy(), qc_result_strategy()), 0..40),
        (max_batch, max_buffer, target) in batch_limits_strategy(),
    ) {
        let limits = BatchLimits {
            max_batch_size: max_batch,
            max_buffer_size: max_buffer,
            target_buffer_size: target.or(max_buffer),
        };
        let mut manager = BatchManager::new(limits);
        let mut submitter = CollectingSubmitter::default();
        let mut expected = Vec::new();

        tokio_test::block_on(async {
            for (idx, (station, result)) in entries.iter().enumerate() {
                let mut builder = ObservationBuilder::new();
                if let Some(s) = station {
                    builder = builder.station(s);
                }
                let working = builder.working("src", idx as i32);
                expected.push(working.working_uuid.clone());
                manager.add_result(&mut submitter, &working, *result).await.unwrap();
            }
            manager.flush_all(&mut submitter).await.unwrap();
        });

        prop_assert_eq!(manager.buffered(), 0);

        let mut seen: HashMap<String, usize> = HashMap::new();
        for flushed in &submitter.flushed {
            prop_assert!(!flushed.working_uuids.is_empty());
            if let Some(max) = max_batch {
                prop_assert!(flushed.working_uuids.len() <= max);
            }
            for uuid in &flushed.working_uuids {
                *seen.entry(uuid.clone()).or_default() += 1;
            }
        }
        prop_assert_eq!(seen.len(), expected.len());
        prop_assert!(seen.values().all(|&n| n == 1));
    }

    /// Property: a payload rebuilt from its map equals the original, for every variant
    #[test]
    fn payload_map_round_trip(
        kind in payload_kind_strategy(),
        step in 0usize..10,
        priority in prop::option::of(-5i32..5),
        subqueue in prop::option::of("[a-z]{3,8}"),
        origin in "[a-z]{2,6}",
    ) {
        let mut payload = WorkflowPayload::new("gts", step, kind);
        if let Some(p) = priority {
            payload.set_priority(Some(p));
        }
        payload.set_subqueue_name(subqueue.as_deref());
        payload.set_header("origin", origin);
        let rebuilt = WorkflowPayload::build(&payload.to_map()).unwrap();
        prop_assert_eq!(rebuilt, payload);
    }
}
