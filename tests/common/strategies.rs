use chrono::NaiveDate;
use proptest::prelude::*;

use nodb_qc_core::record::{Element, MultiValue, QcResult, Value};
use nodb_qc_core::workflow::{FileInfo, PayloadKind};

/// Strategy for station uuids, `None` meaning an unidentified record
pub fn station_strategy() -> impl Strategy<Value = Option<String>> {
    prop::option::weighted(0.8, prop::sample::select(vec!["st-a", "st-b", "st-c", "st-d"]))
        .prop_map(|s| s.map(str::to_string))
}

pub fn qc_result_strategy() -> impl Strategy<Value = QcResult> {
    prop_oneof![
        6 => Just(QcResult::Pass),
        1 => Just(QcResult::Skip),
        2 => Just(QcResult::ManualReview),
        1 => Just(QcResult::Fail),
    ]
}

/// Optional batch limits as `(max_batch_size, max_buffer_size, target_buffer_size)`
pub fn batch_limits_strategy() -> impl Strategy<Value = (Option<usize>, Option<usize>, Option<usize>)> {
    (
        prop::option::of(1usize..6),
        prop::option::of(2usize..12),
        prop::option::of(1usize..12),
    )
}

/// Temperature in °C, rounded to a tenth
pub fn temperature_strategy() -> impl Strategy<Value = f64> {
    (-20i32..350).prop_map(|t| f64::from(t) / 10.0)
}

/// Salinity in psu, rounded to a tenth
pub fn salinity_strategy() -> impl Strategy<Value = f64> {
    (300i32..400).prop_map(|s| f64::from(s) / 10.0)
}

/// A short string value carrying any subset of two metadata entries
fn candidate_value_strategy() -> impl Strategy<Value = Value> {
    (
        prop::sample::select(vec!["s", "t"]),
        prop::option::of(1i32..3),
        prop::option::of(1i32..3),
    )
        .prop_map(|(text, m, n)| {
            let mut value = Value::new(text);
            if let Some(m) = m {
                value = value.with_metadata("M", m);
            }
            if let Some(n) = n {
                value = value.with_metadata("N", n);
            }
            value
        })
}

/// A single value or a list of one to three candidates
pub fn element_strategy() -> impl Strategy<Value = Element> {
    prop_oneof![
        candidate_value_strategy().prop_map(Element::from),
        prop::collection::vec(candidate_value_strategy(), 1..4)
            .prop_map(|values| Element::from(MultiValue::new(values))),
    ]
}

/// Every payload variant, with files optionally gzipped and named
pub fn payload_kind_strategy() -> impl Strategy<Value = PayloadKind> {
    let received = (0i64..3650).prop_map(|days| {
        NaiveDate::from_ymd_opt(2015, 1, 1).unwrap() + chrono::Duration::days(days)
    });
    prop_oneof![
        ("/[a-z]{1,8}/[a-z0-9]{1,8}\\.bufr", any::<bool>(), prop::option::of("[a-z]{1,8}")).prop_map(
            |(path, gz, name)| {
                let mut info = FileInfo::new(path);
                info.is_gzipped = gz;
                info.filename = name;
                PayloadKind::File(info)
            }
        ),
        ("[a-f0-9]{12}", received.clone()).prop_map(|(source_uuid, received)| PayloadKind::SourceFile {
            source_uuid,
            received,
        }),
        "[a-f0-9]{12}".prop_map(|batch_uuid| PayloadKind::Batch { batch_uuid }),
        ("[a-f0-9]{12}", received).prop_map(|(item_uuid, received)| PayloadKind::Item { item_uuid, received }),
    ]
}
