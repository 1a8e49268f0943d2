//! # Test Suites
//!
//! A [`TestSuite`] is a named, versioned list of checks built explicitly at
//! construction time. Running a suite over a batch of working records:
//!
//! 1. consumes a queued `skip_tests` entry for the suite (a SKIP run is stored)
//! 2. reuses a previous non-stale result unless a re-run is forced
//! 3. runs whole-batch checks over every record that needs testing
//! 4. walks each record tree depth-first, running record and value checks at each node,
//!    then record-set checks over that node's sub-record sets
//! 5. stores the outcome and messages on the top record
//!
//! [`QcTestRunner`] chains suites; [`QcSuiteRegistry`] builds them from configuration.

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::context::{QcFlow, Section, TestContext};
use super::record_set::{LevelColumns, RecordSetCheck, RecordSetTarget};
use super::QcServices;
use crate::config::QcTestSpec;
use crate::constants::quality;
use crate::error::{QcError, Result};
use crate::logging::log_qc_operation;
use crate::record::{DataRecord, Element, HistorySource, QcResult, SubrecordStep};
use crate::store::WorkingRecord;

/// A record or value check
#[async_trait]
pub trait QcCheck: Send + Sync {
    async fn check(&self, ctx: &mut TestContext) -> QcFlow;
}

#[async_trait]
impl<F> QcCheck for F
where
    F: Fn(&mut TestContext) -> QcFlow + Send + Sync,
{
    async fn check(&self, ctx: &mut TestContext) -> QcFlow {
        self(ctx)
    }
}

/// A check that sees every record of the batch at once
#[async_trait]
pub trait BatchCheck: Send + Sync {
    async fn check(&self, contexts: &mut [TestContext]) -> Result<()>;
}

/// Which records of the tree a check applies to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordScope {
    pub subrecord_type: Option<String>,
    pub top_only: bool,
}

impl RecordScope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn top_only() -> Self {
        Self {
            subrecord_type: None,
            top_only: true,
        }
    }

    pub fn subrecord(subrecord_type: impl Into<String>) -> Self {
        Self {
            subrecord_type: Some(subrecord_type.into()),
            top_only: false,
        }
    }

    pub fn applies(&self, ctx: &TestContext) -> bool {
        if self.top_only && !ctx.is_top_level() {
            return false;
        }
        match &self.subrecord_type {
            Some(srt) => ctx.current_subrecord_type() == Some(srt.as_str()),
            None => true,
        }
    }
}

/// Which values a value check looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueTarget {
    pub section: Section,
    /// `None` targets every element of the section
    pub name: Option<String>,
}

impl ValueTarget {
    pub fn coordinate(name: impl Into<String>) -> Self {
        Self {
            section: Section::Coordinates,
            name: Some(name.into()),
        }
    }

    pub fn parameter(name: impl Into<String>) -> Self {
        Self {
            section: Section::Parameters,
            name: Some(name.into()),
        }
    }

    pub fn metadata(name: impl Into<String>) -> Self {
        Self {
            section: Section::Metadata,
            name: Some(name.into()),
        }
    }

    pub fn all_parameters() -> Self {
        Self {
            section: Section::Parameters,
            name: None,
        }
    }

    fn names(&self, record: &DataRecord) -> Vec<String> {
        let map = self.section.of(record);
        match &self.name {
            Some(name) if map.contains(name) => vec![name.clone()],
            Some(_) => Vec::new(),
            None => map.keys().cloned().collect(),
        }
    }
}

/// When a value check is not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValuePolicy {
    /// Skip empty values and values flagged missing (WQ 9)
    pub skip_empty: bool,
    /// Skip values flagged erroneous (WQ 4)
    pub skip_bad: bool,
    /// Skip values flagged dubious (WQ 3)
    pub skip_dubious: bool,
    /// Run once per candidate of a multi-valued element
    pub each_subvalue: bool,
}

impl Default for ValuePolicy {
    fn default() -> Self {
        Self {
            skip_empty: true,
            skip_bad: true,
            skip_dubious: false,
            each_subvalue: false,
        }
    }
}

impl ValuePolicy {
    fn skips(&self, ctx: &TestContext) -> bool {
        let Some(value) = ctx.current_value() else {
            return self.skip_empty;
        };
        let wq = value.working_quality();
        (self.skip_empty && (value.is_empty() || wq == quality::MISSING))
            || (self.skip_bad && wq == quality::ERRONEOUS)
            || (self.skip_dubious && wq == quality::DUBIOUS)
    }
}

enum Check {
    Record {
        scope: RecordScope,
        check: Box<dyn QcCheck>,
    },
    Value {
        scope: RecordScope,
        target: ValueTarget,
        policy: ValuePolicy,
        check: Box<dyn QcCheck>,
    },
    RecordSet {
        scope: RecordScope,
        target: RecordSetTarget,
        check: Box<dyn RecordSetCheck>,
    },
    Batch(Box<dyn BatchCheck>),
}

/// Outcome of one suite (or runner) for one record
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub working: WorkingRecord,
    pub result: QcResult,
    pub modified: bool,
}

/// A named, versioned QC test
pub struct TestSuite {
    name: String,
    version: String,
    runner_id: String,
    test_tags: Vec<String>,
    station_invariant: bool,
    force_rerun: bool,
    checks: Vec<Check>,
}

impl std::fmt::Debug for TestSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestSuite")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("checks", &self.checks.len())
            .field("station_invariant", &self.station_invariant)
            .finish()
    }
}

impl TestSuite {
    /// New station-invariant suite with no checks
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            runner_id: String::new(),
            test_tags: Vec::new(),
            station_invariant: true,
            force_rerun: false,
            checks: Vec::new(),
        }
    }

    pub fn with_runner_id(mut self, runner_id: impl Into<String>) -> Self {
        self.runner_id = runner_id.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.test_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Whether results of this suite cannot move a record to a different station group
    pub fn station_invariant(mut self, invariant: bool) -> Self {
        self.station_invariant = invariant;
        self
    }

    pub fn force_rerun(mut self, force: bool) -> Self {
        self.force_rerun = force;
        self
    }

    pub fn record_check(mut self, scope: RecordScope, check: impl QcCheck + 'static) -> Self {
        self.checks.push(Check::Record {
            scope,
            check: Box::new(check),
        });
        self
    }

    pub fn value_check(
        mut self,
        scope: RecordScope,
        target: ValueTarget,
        policy: ValuePolicy,
        check: impl QcCheck + 'static,
    ) -> Self {
        self.checks.push(Check::Value {
            scope,
            target,
            policy,
            check: Box::new(check),
        });
        self
    }

    pub fn record_set_check(
        mut self,
        scope: RecordScope,
        target: RecordSetTarget,
        check: impl RecordSetCheck + 'static,
    ) -> Self {
        self.checks.push(Check::RecordSet {
            scope,
            target,
            check: Box::new(check),
        });
        self
    }

    pub fn batch_check(mut self, check: impl BatchCheck + 'static) -> Self {
        self.checks.push(Check::Batch(Box::new(check)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_station_invariant(&self) -> bool {
        self.station_invariant
    }

    fn history_source(&self) -> HistorySource {
        HistorySource {
            name: self.name.clone(),
            version: self.version.clone(),
            instance: self.runner_id.clone(),
        }
    }

    fn has_batch_checks(&self) -> bool {
        self.checks.iter().any(|c| matches!(c, Check::Batch(_)))
    }

    /// Outcome known without running the checks: SKIP for discarded records, or the
    /// latest non-stale result unless a re-run is forced
    fn prior_outcome(&self, ctx: &TestContext, force_rerun: bool) -> Option<QcResult> {
        if ctx.is_discarded() {
            return Some(QcResult::Skip);
        }
        if force_rerun || self.force_rerun {
            return None;
        }
        ctx.top_record()
            .latest_test_result(&self.name)
            .map(|run| run.result)
    }

    /// Run the suite over a batch. Outcomes are returned in input order.
    #[instrument(skip(self, records), fields(suite = %self.name, records = records.len()))]
    pub async fn process_batch(&self, records: Vec<WorkingRecord>) -> Result<Vec<RecordOutcome>> {
        let mut outcomes: Vec<Option<RecordOutcome>> = Vec::with_capacity(records.len());
        let mut pending: Vec<(usize, TestContext)> = Vec::new();

        for (idx, mut working) in records.into_iter().enumerate() {
            let mut skip_list = working.skip_tests();
            if let Some(pos) = skip_list.iter().position(|n| n == &self.name) {
                skip_list.remove(pos);
                working.set_skip_tests(skip_list);
                working.record.record_qc_test_result(
                    &self.name,
                    &self.version,
                    QcResult::Skip,
                    Vec::new(),
                    self.test_tags.clone(),
                );
                outcomes.push(Some(RecordOutcome {
                    working,
                    result: QcResult::Skip,
                    modified: true,
                }));
                continue;
            }
            let ctx = TestContext::new(working, self.history_source());
            if let Some(result) = self.prior_outcome(&ctx, false) {
                outcomes.push(Some(RecordOutcome {
                    working: ctx.into_working(),
                    result,
                    modified: false,
                }));
                continue;
            }
            outcomes.push(None);
            pending.push((idx, ctx));
        }

        if self.has_batch_checks() && !pending.is_empty() {
            let (indexes, mut contexts): (Vec<usize>, Vec<TestContext>) = pending.into_iter().unzip();
            for check in &self.checks {
                if let Check::Batch(batch_check) = check {
                    batch_check.check(&mut contexts).await?;
                }
            }
            pending = indexes.into_iter().zip(contexts).collect();
        }

        for (idx, mut ctx) in pending {
            let (result, modified) = self.run_tests(&mut ctx, false).await?;
            outcomes[idx] = Some(RecordOutcome {
                working: ctx.into_working(),
                result,
                modified,
            });
        }

        outcomes
            .into_iter()
            .map(|o| o.ok_or_else(|| QcError::internal("record dropped during QC")))
            .collect()
    }

    /// Test one record. Returns the outcome and whether the record was modified.
    pub async fn run_tests(&self, ctx: &mut TestContext, force_rerun: bool) -> Result<(QcResult, bool)> {
        if let Some(result) = self.prior_outcome(ctx, force_rerun) {
            debug!(suite = %self.name, working_uuid = %ctx.working_uuid(), result = %result, "Reusing QC outcome");
            return Ok((result, false));
        }
        self.verify_tree(ctx).await?;
        ctx.enter_record(Vec::new());

        let result = ctx.result();
        let messages = ctx.messages().to_vec();
        let mut tags = self.test_tags.clone();
        tags.extend(ctx.test_tags().iter().cloned());
        tags.sort();
        tags.dedup();
        let message_count = messages.len();
        ctx.top_record_mut()
            .record_qc_test_result(&self.name, &self.version, result, messages, tags);
        log_qc_operation(
            "run_tests",
            &self.name,
            Some(ctx.working_uuid()),
            &result.to_string(),
            message_count,
        );
        Ok((result, true))
    }

    /// Pre-order walk of the record tree; stops early on a `Complete` signal
    async fn verify_tree(&self, ctx: &mut TestContext) -> Result<()> {
        for address in tree_addresses(ctx.top_record()) {
            ctx.enter_record(address);
            if !self.verify_record(ctx).await? {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn verify_record(&self, ctx: &mut TestContext) -> Result<bool> {
        for check in &self.checks {
            match check {
                Check::Record { scope, check } if scope.applies(ctx) => {
                    let flow = check.check(ctx).await;
                    if !ctx.settle(flow)? {
                        return Ok(false);
                    }
                }
                Check::Value {
                    scope,
                    target,
                    policy,
                    check,
                } if scope.applies(ctx) => {
                    for name in target.names(ctx.current_record()) {
                        for subvalue in value_slots(ctx, target.section, &name, policy) {
                            ctx.enter_value(target.section, name.as_str(), subvalue);
                            let flow = if policy.skips(ctx) {
                                Ok(())
                            } else {
                                check.check(ctx).await
                            };
                            let keep_going = ctx.settle(flow)?;
                            ctx.leave_value();
                            if !keep_going {
                                return Ok(false);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        self.verify_record_sets(ctx).await
    }

    async fn verify_record_sets(&self, ctx: &mut TestContext) -> Result<bool> {
        for check in &self.checks {
            let Check::RecordSet { scope, target, check } = check else {
                continue;
            };
            if !scope.applies(ctx) {
                continue;
            }
            let set_indexes: Vec<usize> = ctx
                .current_record()
                .subrecords
                .sets_of(&target.subrecord_type)
                .map(|sets| sets.keys().copied().collect())
                .unwrap_or_default();
            for set_index in set_indexes {
                let Some(set) = ctx.current_record().subrecords.get(&target.subrecord_type, set_index) else {
                    continue;
                };
                let levels = LevelColumns::from_set(set);
                if !target.accepts(&levels) {
                    continue;
                }
                ctx.enter_record_set(target.subrecord_type.as_str(), set_index);
                let rows: Vec<Option<usize>> = if target.per_level {
                    (0..levels.len()).map(Some).collect()
                } else {
                    vec![None]
                };
                for row in rows {
                    ctx.enter_level(row);
                    let flow = check.check(ctx, &levels).await;
                    if !ctx.settle(flow)? {
                        return Ok(false);
                    }
                }
                ctx.leave_record_set();
            }
        }
        Ok(true)
    }
}

/// Candidate indexes a value check visits for one element
fn value_slots(ctx: &TestContext, section: Section, name: &str, policy: &ValuePolicy) -> Vec<Option<usize>> {
    match section.of(ctx.current_record()).get(name) {
        Some(element @ Element::Multi(_)) if policy.each_subvalue => (0..element.len()).map(Some).collect(),
        _ => vec![None],
    }
}

/// Every record address in the tree, parents before children
fn tree_addresses(top: &DataRecord) -> Vec<Vec<SubrecordStep>> {
    let mut addresses = Vec::new();
    let mut stack: Vec<Vec<SubrecordStep>> = vec![Vec::new()];
    while let Some(address) = stack.pop() {
        if let Some(record) = top.descend(&address) {
            for step in record.subrecords.child_steps().into_iter().rev() {
                let mut child = address.clone();
                child.push(step);
                stack.push(child);
            }
        }
        addresses.push(address);
    }
    addresses
}

/// Ordered composite of suites
#[derive(Debug)]
pub struct QcTestRunner {
    runner_id: String,
    suites: Vec<TestSuite>,
}

impl QcTestRunner {
    pub fn new(runner_id: impl Into<String>, suites: Vec<TestSuite>) -> Self {
        Self {
            runner_id: runner_id.into(),
            suites,
        }
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    pub fn test_names(&self) -> Vec<String> {
        self.suites.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn is_station_invariant(&self) -> bool {
        self.suites.iter().all(TestSuite::is_station_invariant)
    }

    /// Run every suite in order. A record's outcome is the worst across suites.
    pub async fn process_batch(&self, records: Vec<WorkingRecord>) -> Result<Vec<RecordOutcome>> {
        let mut results = vec![QcResult::Pass; records.len()];
        let mut modified = vec![false; records.len()];
        let mut current = records;
        for suite in &self.suites {
            let outcomes = suite.process_batch(current).await?;
            current = Vec::with_capacity(outcomes.len());
            for (idx, outcome) in outcomes.into_iter().enumerate() {
                results[idx] = results[idx].worst(outcome.result);
                modified[idx] |= outcome.modified;
                current.push(outcome.working);
            }
        }
        Ok(current
            .into_iter()
            .zip(results)
            .zip(modified)
            .map(|((working, result), modified)| RecordOutcome {
                working,
                result,
                modified,
            })
            .collect())
    }
}

/// What a suite factory receives
pub struct SuiteParams<'a> {
    pub config: &'a Map<String, JsonValue>,
    pub runner_id: &'a str,
    pub services: &'a QcServices,
}

pub type SuiteFactory = Arc<dyn Fn(&SuiteParams<'_>) -> Result<TestSuite> + Send + Sync>;

/// Suite name to factory, populated explicitly at startup
#[derive(Clone, Default)]
pub struct QcSuiteRegistry {
    factories: HashMap<String, SuiteFactory>,
}

impl std::fmt::Debug for QcSuiteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("QcSuiteRegistry").field("suites", &names).finish()
    }
}

impl QcSuiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled suites
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(super::station::SUITE_NAME, Arc::new(super::station::build_suite));
        registry.register(super::duplicate::SUITE_NAME, Arc::new(super::duplicate::build_suite));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: SuiteFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn build_suite(&self, spec: &QcTestSpec, runner_id: &str, services: &QcServices) -> Result<TestSuite> {
        let factory = self.factories.get(&spec.name).ok_or_else(|| {
            QcError::configuration("qc_tests", format!("Unknown QC test [{}]", spec.name))
        })?;
        let params = SuiteParams {
            config: &spec.config,
            runner_id,
            services,
        };
        Ok(factory(&params)?.with_runner_id(runner_id))
    }

    pub fn build_runner(&self, specs: &[QcTestSpec], runner_id: &str, services: &QcServices) -> Result<QcTestRunner> {
        let suites = specs
            .iter()
            .map(|spec| self.build_suite(spec, runner_id, services))
            .collect::<Result<Vec<_>>>()?;
        Ok(QcTestRunner::new(runner_id, suites))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qc::assertions;
    use crate::qc::context::{Assertion, QcSignal};
    use crate::record::{MultiValue, Value};
    use crate::store::MemoryStore;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn working(temps: &[f64]) -> WorkingRecord {
        let mut record = DataRecord::new();
        record.coordinates.set_value("Latitude", 45.0);
        for t in temps {
            let mut level = DataRecord::new();
            level.parameters.set("Temperature", Value::new(*t).with_units("°C"));
            record.subrecords.append("PROFILE", 0, level);
        }
        WorkingRecord::new(record, "src", NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(), 0, 0)
    }

    fn temperature_check(ctx: &mut TestContext) -> QcFlow {
        let value = ctx.current_value().ok_or(QcSignal::Skip)?;
        assertions::between(value, Some(-2.0), Some(35.0), "temperature_out_of_range")
    }

    fn range_suite() -> TestSuite {
        TestSuite::new("range", "1.0").value_check(
            RecordScope::subrecord("PROFILE"),
            ValueTarget::parameter("Temperature"),
            ValuePolicy::default(),
            temperature_check,
        )
    }

    #[tokio::test]
    async fn test_value_checks_walk_nested_records() {
        let outcomes = range_suite()
            .process_batch(vec![working(&[10.0, 40.0, 12.0])])
            .await
            .unwrap();
        let outcome = &outcomes[0];
        assert_eq!(outcome.result, QcResult::ManualReview);
        assert!(outcome.modified);
        let run = outcome.working.record.latest_test_result("range").unwrap();
        assert_eq!(run.messages.len(), 1);
        assert_eq!(
            run.messages[0].path,
            "subrecords/PROFILE/0/1/parameters/Temperature"
        );
        let flagged = outcome.working.record.subrecords.get("PROFILE", 0).unwrap().records[1]
            .parameters
            .get("Temperature")
            .unwrap()
            .working_quality();
        assert_eq!(flagged, quality::ERRONEOUS_PENDING);
    }

    #[tokio::test]
    async fn test_previous_result_reused_unless_forced() {
        let suite = range_suite();
        let first = suite.process_batch(vec![working(&[50.0])]).await.unwrap();
        let mut record = first.into_iter().next().unwrap().working;
        let outcomes = suite.process_batch(vec![record.clone()]).await.unwrap();
        assert_eq!(outcomes[0].result, QcResult::ManualReview);
        assert!(!outcomes[0].modified);

        let mut ctx = TestContext::new(record.clone(), suite.history_source());
        let (result, modified) = suite.run_tests(&mut ctx, true).await.unwrap();
        assert_eq!(result, QcResult::ManualReview);
        assert!(modified);
        record = ctx.into_working();
        assert_eq!(record.record.qc_tests.len(), 2);
        assert!(record.record.qc_tests[0].is_stale);
    }

    #[tokio::test]
    async fn test_skip_tests_entry_is_consumed() {
        let mut record = working(&[50.0]);
        record.set_skip_tests(vec!["range".to_string(), "other".to_string()]);
        let outcomes = range_suite().process_batch(vec![record]).await.unwrap();
        assert_eq!(outcomes[0].result, QcResult::Skip);
        assert!(outcomes[0].modified);
        assert_eq!(outcomes[0].working.skip_tests(), vec!["other".to_string()]);
        let run = outcomes[0].working.record.latest_test_result("range").unwrap();
        assert_eq!(run.result, QcResult::Skip);
        assert!(run.messages.is_empty());
        assert_eq!(outcomes[0].working.record.qc_tests.len(), 1);
    }

    fn profile(depths: &[Option<f64>]) -> WorkingRecord {
        let mut record = DataRecord::new();
        for depth in depths {
            let mut level = DataRecord::new();
            if let Some(depth) = depth {
                level.coordinates.set_value("Depth", *depth);
            }
            level.parameters.set_value("Temperature", 10.0);
            record.subrecords.append("PROFILE", 0, level);
        }
        WorkingRecord::new(record, "src", NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(), 0, 0)
    }

    fn depth_increases(ctx: &mut TestContext, levels: &LevelColumns) -> QcFlow {
        let level = ctx.current_level().ok_or(QcSignal::Skip)?;
        if level == 0 {
            return Ok(());
        }
        match (levels.number("Depth", level - 1), levels.number("Depth", level)) {
            (Some(above), Some(here)) => assertions::ensure(here > above, || {
                Assertion::new("depth_not_increasing").with_ref(above)
            }),
            _ => Ok(()),
        }
    }

    fn level_count(ctx: &mut TestContext, levels: &LevelColumns) -> QcFlow {
        ctx.add_test_tag("PROFILE_SEEN");
        assertions::ensure(levels.len() >= 3, || {
            Assertion::new("too_few_levels").with_ref(levels.len())
        })
    }

    #[tokio::test]
    async fn test_level_checks_report_per_level_path() {
        let suite = TestSuite::new("profile", "1.0").record_set_check(
            RecordScope::top_only(),
            RecordSetTarget::levels("PROFILE").requiring("Depth"),
            depth_increases,
        );
        let outcomes = suite
            .process_batch(vec![profile(&[Some(0.0), Some(10.0), Some(5.0), Some(20.0), Some(15.0)])])
            .await
            .unwrap();
        assert_eq!(outcomes[0].result, QcResult::ManualReview);
        let run = outcomes[0].working.record.latest_test_result("profile").unwrap();
        let paths: Vec<&str> = run.messages.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["subrecords/PROFILE/0/2", "subrecords/PROFILE/0/4"]);
        assert_eq!(run.messages[0].code, "depth_not_increasing");
    }

    #[tokio::test]
    async fn test_record_set_check_sees_whole_set() {
        let suite = TestSuite::new("profile", "1.0")
            .record_set_check(RecordScope::top_only(), RecordSetTarget::sets("PROFILE"), level_count)
            .record_set_check(
                RecordScope::top_only(),
                RecordSetTarget::levels("PROFILE").requiring("Depth"),
                depth_increases,
            );
        let outcomes = suite
            .process_batch(vec![profile(&[None, None])])
            .await
            .unwrap();
        let run = outcomes[0].working.record.latest_test_result("profile").unwrap();
        // Without a Depth column the level check never runs.
        assert_eq!(run.messages.len(), 1);
        assert_eq!(run.messages[0].path, "subrecords/PROFILE/0");
        assert_eq!(run.messages[0].code, "too_few_levels");
        assert!(run.test_tags.contains(&"PROFILE_SEEN".to_string()));
    }

    #[tokio::test]
    async fn test_complete_unwinds_remaining_checks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let suite = TestSuite::new("discarder", "1.0")
            .record_check(RecordScope::top_only(), |ctx: &mut TestContext| {
                ctx.discard_record("test")
            })
            .record_check(RecordScope::all(), move |_ctx: &mut TestContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        let outcomes = suite.process_batch(vec![working(&[1.0, 2.0])]).await.unwrap();
        assert_eq!(outcomes[0].result, QcResult::Skip);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Discarded records are skipped without running anything.
        let again = suite
            .process_batch(vec![outcomes[0].working.clone()])
            .await
            .unwrap();
        assert_eq!(again[0].result, QcResult::Skip);
        assert!(!again[0].modified);
    }

    #[tokio::test]
    async fn test_each_subvalue_addresses_candidates() {
        let mut record = DataRecord::new();
        record.parameters.set(
            "Salinity",
            Element::Multi(MultiValue::new(vec![Value::new(35.0), Value::new(80.0)])),
        );
        let working = WorkingRecord::new(record, "src", NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(), 0, 0);
        let suite = TestSuite::new("salinity", "1.0").value_check(
            RecordScope::all(),
            ValueTarget::parameter("Salinity"),
            ValuePolicy {
                each_subvalue: true,
                ..ValuePolicy::default()
            },
            |ctx: &mut TestContext| {
                let value = ctx.current_value().ok_or(QcSignal::Skip)?;
                assertions::between(value, Some(0.0), Some(42.0), "salinity_range")
            },
        );
        let outcomes = suite.process_batch(vec![working]).await.unwrap();
        let run = outcomes[0].working.record.latest_test_result("salinity").unwrap();
        assert_eq!(run.messages.len(), 1);
        assert_eq!(run.messages[0].path, "parameters/Salinity/1");
    }

    #[tokio::test]
    async fn test_failure_is_not_downgraded_by_review() {
        let suite = TestSuite::new("strict", "1.0")
            .record_check(RecordScope::top_only(), |_ctx: &mut TestContext| {
                Err(QcSignal::Fail(Assertion::new("hard_failure")))
            })
            .record_check(RecordScope::top_only(), |_ctx: &mut TestContext| {
                Err(QcSignal::review("soft_finding"))
            });
        let outcomes = suite.process_batch(vec![working(&[])]).await.unwrap();
        assert_eq!(outcomes[0].result, QcResult::Fail);
    }

    struct CountingBatch;

    #[async_trait]
    impl BatchCheck for CountingBatch {
        async fn check(&self, contexts: &mut [TestContext]) -> Result<()> {
            let size = contexts.len();
            for ctx in contexts.iter_mut() {
                ctx.report_for_review("batch_seen", Some(serde_json::json!(size)));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_runner_combines_suites() {
        let services = QcServices::from_memory(&MemoryStore::new());
        let mut registry = QcSuiteRegistry::new();
        registry.register("range", Arc::new(|_p: &SuiteParams<'_>| -> Result<TestSuite> { Ok(range_suite()) }));
        registry.register(
            "batch",
            Arc::new(|_p: &SuiteParams<'_>| -> Result<TestSuite> {
                Ok(TestSuite::new("batch", "1.0")
                    .station_invariant(false)
                    .batch_check(CountingBatch))
            }),
        );
        let specs = vec![
            QcTestSpec {
                name: "range".into(),
                config: Map::new(),
            },
            QcTestSpec {
                name: "batch".into(),
                config: Map::new(),
            },
        ];
        let runner = registry.build_runner(&specs, "runner-1", &services).unwrap();
        assert_eq!(runner.test_names(), vec!["range", "batch"]);
        assert!(!runner.is_station_invariant());

        let outcomes = runner
            .process_batch(vec![working(&[5.0]), working(&[99.0])])
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.result == QcResult::ManualReview && o.modified));
        let run = outcomes[0].working.record.latest_test_result("batch").unwrap();
        assert_eq!(run.messages[0].ref_value, Some(serde_json::json!(2)));

        let unknown = vec![QcTestSpec {
            name: "nope".into(),
            config: Map::new(),
        }];
        let err = registry.build_runner(&unknown, "r", &services).unwrap_err();
        assert!(matches!(err, QcError::Configuration { .. }));
    }
}
