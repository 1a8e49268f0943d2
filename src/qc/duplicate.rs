//! # Duplicate Detection
//!
//! Two records are candidate duplicates when they share a station, lie within the
//! time window of each other and are within the distance window once positional
//! uncertainty is allowed for. Candidates are then compared field by field.
//!
//! ## Field comparison
//!
//! Each field scores as one of [`ValueComparison`]. Coordinates missing on one side
//! conflict; any other missing field makes the side that has it better. Numeric values
//! are compared after converting B into A's units, allowing for uncertainty. Candidates
//! of multi-valued fields are paired greedily, best kind of match first, so that no
//! value is counted twice. Sub-record sets are paired by how well their coordinates
//! agree, with unmatched sets compared against an empty set.
//!
//! Greedy pairing depends on which side is walked first, so both pairings run and
//! [`reconcile`] / [`reconcile_tallies`] pick between them without favouring a side.
//! Comparing B with A is always the mirror of comparing A with B.
//!
//! ## Verdict
//!
//! With no conflicts the field scores aggregate into identical, superset or disjoint.
//! With conflicts, the share of non-conflicting fields decides between a probable
//! match, an improbable match and no match at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument};

use super::context::TestContext;
use super::suite::{BatchCheck, SuiteParams, TestSuite};
use crate::config::DuplicateCheckSettings;
use crate::constants::element_names;
use crate::error::Result;
use crate::record::{DataRecord, Element, ElementMap, RecordSet, Value};
use crate::store::{NearbyQuery, RecordSearch};
use crate::units::{haversine, Measurement, UnitConverter, EARTH_RADIUS_M};

pub const SUITE_NAME: &str = "nodb_dupe_check";
pub const SUITE_VERSION: &str = "1.0";

/// Metadata that is already accounted for when numeric values are compared
const NUMERIC_METADATA_SKIP: [&str; 3] = [
    element_names::UNITS,
    element_names::UNCERTAINTY,
    element_names::TEMPERATURE_SCALE,
];

/// Comparison of one field between record A and record B
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueComparison {
    Identical,
    ABetter,
    BBetter,
    Compatible,
    Conflict,
}

impl ValueComparison {
    /// The same comparison seen from the other side
    pub fn mirror(self) -> Self {
        match self {
            ValueComparison::ABetter => ValueComparison::BBetter,
            ValueComparison::BBetter => ValueComparison::ABetter,
            other => other,
        }
    }

    /// Closeness of the match; mirrored comparisons share a rank
    fn rank(self) -> u8 {
        match self {
            ValueComparison::Identical => 0,
            ValueComparison::ABetter | ValueComparison::BBetter => 1,
            ValueComparison::Compatible => 2,
            ValueComparison::Conflict => 3,
        }
    }
}

/// Pairing order for multi-valued fields
const PAIRING_ORDER: [ValueComparison; 5] = [
    ValueComparison::Identical,
    ValueComparison::ABetter,
    ValueComparison::BBetter,
    ValueComparison::Compatible,
    ValueComparison::Conflict,
];

/// Choose between the A-first pairing and the mirrored B-first pairing.
///
/// The closer match wins. A tie between `ABetter` and `BBetter` means each side has
/// something the other lacks, which is `Compatible`.
fn reconcile(forward: ValueComparison, backward: ValueComparison) -> ValueComparison {
    if forward == backward {
        forward
    } else if forward.rank() == backward.rank() {
        ValueComparison::Compatible
    } else if forward.rank() < backward.rank() {
        forward
    } else {
        backward
    }
}

/// Tally counterpart of [`reconcile`]: fewest conflicts, then fewest compatibles, then
/// fewest one-sided fields, then most identical fields. Tallies that differ only in
/// how one-sided fields split between A and B keep what both agree on for each side
/// and count the rest as compatible.
fn reconcile_tallies(forward: ComparisonTally, backward: ComparisonTally) -> ComparisonTally {
    if forward == backward {
        return forward;
    }
    let key = |t: &ComparisonTally| {
        (
            t.conflict,
            t.compatible,
            t.a_better + t.b_better,
            std::cmp::Reverse(t.identical),
        )
    };
    match key(&forward).cmp(&key(&backward)) {
        std::cmp::Ordering::Less => forward,
        std::cmp::Ordering::Greater => backward,
        std::cmp::Ordering::Equal => {
            let a_better = forward.a_better.min(backward.a_better);
            let b_better = forward.b_better.min(backward.b_better);
            ComparisonTally {
                a_better,
                b_better,
                compatible: forward.compatible + forward.a_better + forward.b_better - a_better - b_better,
                ..forward
            }
        }
    }
}

/// Field comparison counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComparisonTally {
    pub identical: usize,
    pub a_better: usize,
    pub b_better: usize,
    pub compatible: usize,
    pub conflict: usize,
}

impl ComparisonTally {
    fn slot(&mut self, kind: ValueComparison) -> &mut usize {
        match kind {
            ValueComparison::Identical => &mut self.identical,
            ValueComparison::ABetter => &mut self.a_better,
            ValueComparison::BBetter => &mut self.b_better,
            ValueComparison::Compatible => &mut self.compatible,
            ValueComparison::Conflict => &mut self.conflict,
        }
    }

    pub fn record(&mut self, kind: ValueComparison) {
        *self.slot(kind) += 1;
    }

    pub fn merge(&mut self, other: &ComparisonTally) {
        self.identical += other.identical;
        self.a_better += other.a_better;
        self.b_better += other.b_better;
        self.compatible += other.compatible;
        self.conflict += other.conflict;
    }

    pub fn total(&self) -> usize {
        self.identical + self.a_better + self.b_better + self.compatible + self.conflict
    }

    pub fn mirror(&self) -> Self {
        Self {
            a_better: self.b_better,
            b_better: self.a_better,
            ..*self
        }
    }

    /// Collapse into one comparison: any conflict wins, then compatible; better on
    /// both sides is compatible
    pub fn distill(&self) -> ValueComparison {
        if self.conflict > 0 {
            ValueComparison::Conflict
        } else if self.compatible > 0 || (self.a_better > 0 && self.b_better > 0) {
            ValueComparison::Compatible
        } else if self.a_better > 0 {
            ValueComparison::ABetter
        } else if self.b_better > 0 {
            ValueComparison::BBetter
        } else {
            ValueComparison::Identical
        }
    }
}

/// Whole-record duplicate verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DuplicateVerdict {
    Identical,
    /// A holds everything B does, and more
    ASuperset,
    BSuperset,
    /// Each holds information the other lacks
    Disjoint,
    Probable,
    Improbable,
    NoMatch,
}

impl DuplicateVerdict {
    pub fn mirror(self) -> Self {
        match self {
            DuplicateVerdict::ASuperset => DuplicateVerdict::BSuperset,
            DuplicateVerdict::BSuperset => DuplicateVerdict::ASuperset,
            other => other,
        }
    }
}

/// Pairwise record comparison
#[derive(Clone)]
pub struct RecordComparator {
    converter: Arc<dyn UnitConverter>,
    settings: DuplicateCheckSettings,
}

impl std::fmt::Debug for RecordComparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordComparator")
            .field("settings", &self.settings)
            .finish()
    }
}

impl RecordComparator {
    pub fn new(converter: Arc<dyn UnitConverter>, settings: DuplicateCheckSettings) -> Self {
        Self { converter, settings }
    }

    pub fn settings(&self) -> &DuplicateCheckSettings {
        &self.settings
    }

    /// Pre-filter then content comparison
    pub fn check(&self, a: &DataRecord, b: &DataRecord) -> DuplicateVerdict {
        if !self.within_window(a, b) {
            return DuplicateVerdict::NoMatch;
        }
        self.content_verdict(a, b)
    }

    /// Same station, within the time window, within the distance window
    pub fn within_window(&self, a: &DataRecord, b: &DataRecord) -> bool {
        let station_a = a.metadata.best_value(element_names::STATION);
        if station_a.is_none() || station_a != b.metadata.best_value(element_names::STATION) {
            return false;
        }
        let (Some(time_a), Some(time_b)) = (observation_time(a), observation_time(b)) else {
            return false;
        };
        if (time_b - time_a).abs() > self.settings.time_window() {
            return false;
        }
        let (Some((lat_a, lon_a)), Some((lat_b, lon_b))) = (position(a), position(b)) else {
            return false;
        };
        let distance = haversine(lat_a, lon_a, lat_b, lon_b);
        distance.lower() <= self.settings.distance_window_m
    }

    pub fn content_verdict(&self, a: &DataRecord, b: &DataRecord) -> DuplicateVerdict {
        let tally = self.compare_records(a, b);
        if tally.conflict > 0 {
            let semi_match = tally.identical + tally.a_better + tally.b_better + tally.compatible;
            let total = (semi_match + tally.conflict) as f64;
            let upper = (self.settings.probable_threshold * total).floor() as usize;
            let lower = (self.settings.improbable_threshold * total).floor() as usize;
            if semi_match >= upper {
                DuplicateVerdict::Probable
            } else if semi_match >= lower {
                DuplicateVerdict::Improbable
            } else {
                DuplicateVerdict::NoMatch
            }
        } else if tally.compatible > 0 {
            DuplicateVerdict::Disjoint
        } else if tally.b_better > 0 {
            if tally.a_better > 0 {
                DuplicateVerdict::Disjoint
            } else {
                DuplicateVerdict::BSuperset
            }
        } else if tally.a_better > 0 {
            DuplicateVerdict::ASuperset
        } else {
            DuplicateVerdict::Identical
        }
    }

    pub fn compare_records(&self, a: &DataRecord, b: &DataRecord) -> ComparisonTally {
        let mut tally = self.compare_maps(&a.coordinates, &b.coordinates, &[], false);
        tally.merge(&self.compare_maps(&a.parameters, &b.parameters, &[], true));
        tally.merge(&self.compare_maps(&a.metadata, &b.metadata, &[], true));
        let types: BTreeSet<&String> = a.subrecords.types().chain(b.subrecords.types()).collect();
        for srt in types {
            tally.merge(&self.compare_subrecord_sets(a.subrecords.sets_of(srt), b.subrecords.sets_of(srt)));
        }
        tally
    }

    fn compare_maps(&self, a: &ElementMap, b: &ElementMap, skip: &[&str], missing_is_compatible: bool) -> ComparisonTally {
        let mut tally = ComparisonTally::default();
        let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
        for key in keys {
            if skip.contains(&key.as_str()) {
                continue;
            }
            let kind = match (a.get(key), b.get(key)) {
                (None, _) if missing_is_compatible => ValueComparison::BBetter,
                (_, None) if missing_is_compatible => ValueComparison::ABetter,
                (Some(ea), Some(eb)) => self.compare_elements(ea, eb),
                _ => ValueComparison::Conflict,
            };
            tally.record(kind);
        }
        tally
    }

    fn compare_elements(&self, a: &Element, b: &Element) -> ValueComparison {
        if let (Element::Single(va), Element::Single(vb)) = (a, b) {
            return self.compare_values(va, vb);
        }
        let forward = self.pair_candidates(a, b);
        let backward = self.pair_candidates(b, a).mirror();
        reconcile(forward, backward)
    }

    /// Greedy pairing of candidate values, walking A's candidates first
    fn pair_candidates(&self, a: &Element, b: &Element) -> ValueComparison {
        let a_values = a.all_values();
        let b_values = b.all_values();
        let matrix: Vec<Vec<ValueComparison>> = a_values
            .iter()
            .map(|va| b_values.iter().map(|vb| self.compare_values(va, vb)).collect())
            .collect();

        let mut open_a: Vec<usize> = (0..a_values.len()).collect();
        let mut open_b: Vec<usize> = (0..b_values.len()).collect();
        let mut tally = ComparisonTally::default();
        for kind in PAIRING_ORDER {
            let mut unpaired = Vec::with_capacity(open_a.len());
            for idx_a in open_a {
                let paired = open_b.iter().position(|&idx_b| matrix[idx_a][idx_b] == kind);
                match paired {
                    Some(pos) => {
                        open_b.remove(pos);
                        tally.record(kind);
                    }
                    None => unpaired.push(idx_a),
                }
            }
            open_a = unpaired;
        }
        if !open_b.is_empty() && tally.b_better == 0 {
            tally.b_better = 1;
        }
        if !open_a.is_empty() && tally.a_better == 0 {
            tally.a_better = 1;
        }
        tally.distill()
    }

    pub fn compare_values(&self, a: &Value, b: &Value) -> ValueComparison {
        if a == b {
            return ValueComparison::Identical;
        }
        match (a.is_empty(), b.is_empty()) {
            (true, true) => return ValueComparison::Identical,
            (true, false) => return ValueComparison::BBetter,
            (false, true) => return ValueComparison::ABetter,
            (false, false) => {}
        }
        let skip: &[&str] = match (a.measurement(), b.measurement()) {
            (Some(ma), Some(mb)) => {
                let mb = match (a.units(), b.units()) {
                    (Some(ua), Some(ub)) if ua != ub => match self.converter.convert(mb, &ub, &ua) {
                        Ok(converted) => converted,
                        Err(_) => return ValueComparison::Conflict,
                    },
                    _ => mb,
                };
                if !ma.is_close(&mb, 1e-9, 0.0) {
                    return ValueComparison::Conflict;
                }
                &NUMERIC_METADATA_SKIP
            }
            _ => {
                if a.best() != b.best() {
                    return ValueComparison::Conflict;
                }
                &[]
            }
        };
        self.compare_maps(&a.metadata, &b.metadata, skip, true).distill()
    }

    fn compare_subrecord_sets(
        &self,
        a: Option<&BTreeMap<usize, RecordSet>>,
        b: Option<&BTreeMap<usize, RecordSet>>,
    ) -> ComparisonTally {
        let forward = self.pair_record_sets(a, b);
        let backward = self.pair_record_sets(b, a).mirror();
        reconcile_tallies(forward, backward)
    }

    /// Pair sets by coordinate agreement, best score first; ties go to A's order
    fn pair_record_sets(
        &self,
        a: Option<&BTreeMap<usize, RecordSet>>,
        b: Option<&BTreeMap<usize, RecordSet>>,
    ) -> ComparisonTally {
        let none = BTreeMap::new();
        let a = a.unwrap_or(&none);
        let b = b.unwrap_or(&none);
        let empty = RecordSet::default();
        let mut tally = ComparisonTally::default();

        if a.is_empty() || b.is_empty() {
            for set in a.values() {
                tally.merge(&self.compare_record_sets(set, &empty));
            }
            for set in b.values() {
                tally.merge(&self.compare_record_sets(&empty, set));
            }
            return tally;
        }
        if a.len() == 1 && b.len() == 1 {
            if let (Some(sa), Some(sb)) = (a.values().next(), b.values().next()) {
                return self.compare_record_sets(sa, sb);
            }
        }

        let mut scored: Vec<(usize, usize, f64)> = Vec::with_capacity(a.len() * b.len());
        for (ia, sa) in a {
            for (ib, sb) in b {
                scored.push((*ia, *ib, self.coordinate_score(sa, sb)));
            }
        }
        scored.sort_by(|x, y| y.2.partial_cmp(&x.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut used_a = HashSet::new();
        let mut used_b = HashSet::new();
        for (ia, ib, _) in scored {
            if used_a.len() == a.len() || used_b.len() == b.len() {
                break;
            }
            if used_a.contains(&ia) || used_b.contains(&ib) {
                continue;
            }
            tally.merge(&self.compare_record_sets(&a[&ia], &b[&ib]));
            used_a.insert(ia);
            used_b.insert(ib);
        }
        for (idx, set) in a.iter().filter(|(idx, _)| !used_a.contains(*idx)) {
            debug!(set_index = idx, "Unmatched record set on A");
            tally.merge(&self.compare_record_sets(set, &empty));
        }
        for (idx, set) in b.iter().filter(|(idx, _)| !used_b.contains(*idx)) {
            debug!(set_index = idx, "Unmatched record set on B");
            tally.merge(&self.compare_record_sets(&empty, set));
        }
        tally
    }

    fn compare_record_sets(&self, a: &RecordSet, b: &RecordSet) -> ComparisonTally {
        let blank = DataRecord::new();
        let longest = a.records.len().max(b.records.len());
        let mut tally = ComparisonTally::default();
        for idx in 0..longest {
            let ra = a.records.get(idx).unwrap_or(&blank);
            let rb = b.records.get(idx).unwrap_or(&blank);
            tally.merge(&self.compare_records(ra, rb));
        }
        tally
    }

    /// Share of paired records whose coordinates agree; unpaired records score zero
    fn coordinate_score(&self, a: &RecordSet, b: &RecordSet) -> f64 {
        let longest = a.records.len().max(b.records.len());
        if longest == 0 {
            return 0.0;
        }
        let score: f64 = a
            .records
            .iter()
            .zip(&b.records)
            .map(|(ra, rb)| {
                match self
                    .compare_maps(&ra.coordinates, &rb.coordinates, &[], false)
                    .distill()
                {
                    ValueComparison::Identical => 1.0,
                    ValueComparison::Conflict => 0.0,
                    _ => 0.5,
                }
            })
            .sum();
        score / longest as f64
    }
}

fn observation_time(record: &DataRecord) -> Option<DateTime<Utc>> {
    record
        .coordinates
        .get(element_names::TIME)?
        .ideal()?
        .as_datetime()
}

fn position(record: &DataRecord) -> Option<(Measurement, Measurement)> {
    let lat = record.coordinates.get(element_names::LATITUDE)?.ideal()?.measurement()?;
    let lon = record.coordinates.get(element_names::LONGITUDE)?.ideal()?.measurement()?;
    Some((lat, lon))
}

/// Records without a usable position, time or station are not checked
fn is_checkable(record: &DataRecord) -> bool {
    let good = |map: &ElementMap, name: &str| {
        map.get(name)
            .and_then(Element::ideal)
            .is_some_and(|v| v.is_good(true))
    };
    good(&record.coordinates, element_names::LATITUDE)
        && good(&record.coordinates, element_names::LONGITUDE)
        && good(&record.coordinates, element_names::TIME)
        && good(&record.metadata, element_names::STATION)
        && position(record).is_some()
        && observation_time(record).is_some()
}

/// Batch check backing `nodb_dupe_check`
pub struct DuplicateCheck {
    comparator: RecordComparator,
    search: Arc<dyn RecordSearch>,
}

impl DuplicateCheck {
    pub fn new(comparator: RecordComparator, search: Arc<dyn RecordSearch>) -> Self {
        Self { comparator, search }
    }

    /// Store queries covering the search window around a record. The longitude range
    /// is split in two when it crosses the antimeridian; near the poles every
    /// longitude is searched.
    pub fn nearby_queries(&self, record: &DataRecord) -> Vec<NearbyQuery> {
        let (Some(station_uuid), Some(time), Some((lat, lon))) = (
            record.metadata.best_string(element_names::STATION),
            observation_time(record),
            position(record),
        ) else {
            return Vec::new();
        };
        let settings = self.comparator.settings();
        let window = settings.time_window();
        let metres_per_degree = EARTH_RADIUS_M.to_radians();
        let lat_range = settings.distance_window_m / metres_per_degree;
        let min_lat = lat.lower() - lat_range;
        let max_lat = lat.upper() + lat_range;
        let base = NearbyQuery {
            station_uuid,
            min_time: time - window,
            max_time: time + window,
            min_lat,
            max_lat,
            min_lon: -180.0,
            max_lon: 180.0,
        };
        if min_lat < -89.9 {
            return vec![NearbyQuery { min_lat: -90.0, ..base }];
        }
        if max_lat > 89.9 {
            return vec![NearbyQuery { max_lat: 90.0, ..base }];
        }
        let ref_lat = min_lat.abs().max(max_lat.abs());
        let one_degree_lon = haversine(
            Measurement::exact(ref_lat),
            Measurement::exact(0.0),
            Measurement::exact(ref_lat),
            Measurement::exact(1.0),
        )
        .value;
        let lon_range = settings.distance_window_m / one_degree_lon;
        let min_lon = lon.lower() - lon_range;
        let max_lon = lon.upper() + lon_range;
        if min_lon < -180.0 {
            vec![
                NearbyQuery {
                    min_lon: min_lon + 360.0,
                    max_lon: 180.0,
                    ..base.clone()
                },
                NearbyQuery {
                    min_lon: -180.0,
                    max_lon,
                    ..base
                },
            ]
        } else if max_lon > 180.0 {
            vec![
                NearbyQuery {
                    min_lon: -180.0,
                    max_lon: max_lon - 360.0,
                    ..base.clone()
                },
                NearbyQuery {
                    min_lon,
                    max_lon: 180.0,
                    ..base
                },
            ]
        } else {
            vec![NearbyQuery {
                min_lon,
                max_lon,
                ..base
            }]
        }
    }

    async fn check_stored(&self, ctx: &mut TestContext, batch_uuids: &HashSet<String>) -> Result<()> {
        let mut seen = HashSet::new();
        for query in self.nearby_queries(ctx.top_record()) {
            for candidate in self.search.find_working_records_near(&query).await? {
                if batch_uuids.contains(&candidate.working_uuid) || !seen.insert(candidate.working_uuid.clone()) {
                    continue;
                }
                let verdict = self.comparator.check(ctx.top_record(), &candidate.record);
                if verdict != DuplicateVerdict::NoMatch {
                    debug!(
                        working_uuid = %ctx.working_uuid(),
                        stored_uuid = %candidate.working_uuid,
                        verdict = ?verdict,
                        "Stored duplicate candidate"
                    );
                    ctx.report_for_review("potential_duplicate_record_found", Some(json!(candidate.working_uuid)));
                }
            }
        }
        Ok(())
    }
}

fn flag_working_duplicate(ctx: &mut TestContext, other: &TestContext, code: &str) {
    let other_uuid = other.working_uuid().to_string();
    let other_date = other.working().received_date.to_string();
    let metadata = &mut ctx.top_record_mut().metadata;
    metadata.set_value(element_names::WORKING_DUPLICATE_ID, other_uuid.clone());
    metadata.set_value(element_names::WORKING_DUPLICATE_DATE, other_date);
    ctx.report_for_review(code, Some(json!(other_uuid)));
}

/// Mutable access to two distinct contexts
fn pair_mut(contexts: &mut [TestContext], i: usize, j: usize) -> (&mut TestContext, &mut TestContext) {
    debug_assert!(i < j);
    let (head, tail) = contexts.split_at_mut(j);
    (&mut head[i], &mut tail[0])
}

#[async_trait]
impl BatchCheck for DuplicateCheck {
    #[instrument(skip(self, contexts), fields(records = contexts.len()))]
    async fn check(&self, contexts: &mut [TestContext]) -> Result<()> {
        let eligible: Vec<usize> = (0..contexts.len())
            .filter(|&idx| is_checkable(contexts[idx].top_record()))
            .collect();
        let mut flagged: HashSet<usize> = HashSet::new();

        for (pos, &i) in eligible.iter().enumerate() {
            if flagged.contains(&i) {
                continue;
            }
            for &j in &eligible[pos + 1..] {
                if flagged.contains(&j) {
                    continue;
                }
                let verdict = self
                    .comparator
                    .check(contexts[i].top_record(), contexts[j].top_record());
                let (a, b) = pair_mut(contexts, i, j);
                match verdict {
                    DuplicateVerdict::NoMatch => continue,
                    DuplicateVerdict::Identical | DuplicateVerdict::BSuperset => {
                        flag_working_duplicate(a, b, "working_duplicate_record_found");
                        flagged.insert(i);
                        break;
                    }
                    DuplicateVerdict::ASuperset => {
                        flag_working_duplicate(b, a, "working_duplicate_record_found");
                        flagged.insert(j);
                    }
                    DuplicateVerdict::Disjoint | DuplicateVerdict::Probable | DuplicateVerdict::Improbable => {
                        flag_working_duplicate(a, b, "working_potential_duplicate_record_found");
                        flag_working_duplicate(b, a, "working_potential_duplicate_record_found");
                    }
                }
            }
        }

        let batch_uuids: HashSet<String> = contexts.iter().map(|c| c.working_uuid().to_string()).collect();
        for &idx in &eligible {
            if !flagged.contains(&idx) {
                self.check_stored(&mut contexts[idx], &batch_uuids).await?;
            }
        }
        Ok(())
    }
}

pub fn suite(
    converter: Arc<dyn UnitConverter>,
    search: Arc<dyn RecordSearch>,
    settings: DuplicateCheckSettings,
) -> TestSuite {
    TestSuite::new(SUITE_NAME, SUITE_VERSION)
        .batch_check(DuplicateCheck::new(RecordComparator::new(converter, settings), search))
}

pub(crate) fn build_suite(params: &SuiteParams<'_>) -> Result<TestSuite> {
    let settings = DuplicateCheckSettings::from_map(params.config)?;
    Ok(suite(
        params.services.converter.clone(),
        params.services.records.clone(),
        settings,
    ))
}
