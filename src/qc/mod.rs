//! # Quality Control Framework
//!
//! ## Overview
//!
//! Checks are plain async functions or small structs registered on a [`TestSuite`]
//! when it is built. A suite walks every record tree of a batch, applies its checks
//! and stores one [`QcTestRunInfo`](crate::record::QcTestRunInfo) per record.
//! Suites are chained by a [`QcTestRunner`] and built from worker configuration
//! through the [`QcSuiteRegistry`].
//!
//! Bundled suites:
//!
//! - [`station`]: `nodb_station_check`, resolving the observing station
//! - [`duplicate`]: `nodb_dupe_check`, flagging duplicates within the batch and
//!   against stored records

pub mod assertions;
pub mod context;
pub mod duplicate;
pub mod record_set;
pub mod station;
pub mod suite;

pub use context::{Assertion, QcFlow, QcSignal, Section, SetFocus, TestContext};
pub use record_set::{LevelColumns, RecordSetCheck, RecordSetTarget};
pub use duplicate::{DuplicateVerdict, RecordComparator, ValueComparison};
pub use station::{resolve_station, StationResolution};
pub use suite::{
    BatchCheck, QcCheck, QcSuiteRegistry, QcTestRunner, RecordOutcome, RecordScope, SuiteFactory, SuiteParams,
    TestSuite, ValuePolicy, ValueTarget,
};

use std::sync::Arc;

use crate::store::{MemoryStore, RecordSearch, StationLookup};
use crate::units::{LinearUnitConverter, UnitConverter};

/// Shared read-only services handed to suite factories
#[derive(Clone)]
pub struct QcServices {
    pub converter: Arc<dyn UnitConverter>,
    pub stations: Arc<dyn StationLookup>,
    pub records: Arc<dyn RecordSearch>,
}

impl std::fmt::Debug for QcServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QcServices").finish_non_exhaustive()
    }
}

impl QcServices {
    pub fn new(
        converter: Arc<dyn UnitConverter>,
        stations: Arc<dyn StationLookup>,
        records: Arc<dyn RecordSearch>,
    ) -> Self {
        Self {
            converter,
            stations,
            records,
        }
    }

    /// Services backed by an in-memory store and the default unit table
    pub fn from_memory(store: &MemoryStore) -> Self {
        Self::new(
            Arc::new(LinearUnitConverter::new()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        )
    }
}
