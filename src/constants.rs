//! # Shared Constants
//!
//! Metadata keys, working-quality flags and default values shared across the
//! worker runtime, the QC framework and the batch manager.

/// Queue-item and payload metadata keys
pub mod metadata_keys {
    pub const MANUAL_SUBQUEUE: &str = "manual-subqueue";
    pub const UNIQUE_ITEM_KEY: &str = "unique-item-key";
    pub const QUEUE_PRIORITY: &str = "queue-priority";
    pub const POST_REVIEW_QUEUE: &str = "post-review-queue";
    pub const SEND_TIME: &str = "send_time";
    pub const SOURCE_INFO: &str = "_source_info";
    pub const CURRENT_QC_TESTS: &str = "current-qc-tests";
    pub const RECHECK_QUEUE: &str = "recheck-queue";
    pub const ESCALATION_QUEUE: &str = "escalation-queue";
    pub const DESCALATION_QUEUE: &str = "descalation-queue";
}

/// Working-record metadata keys
pub mod working_keys {
    pub const SKIP_TESTS: &str = "skip_tests";
    pub const QC_TESTS: &str = "qc_tests";
}

/// Record element names used by the QC framework
pub mod element_names {
    pub const WORKING_QUALITY: &str = "WorkingQuality";
    pub const QUALITY: &str = "Quality";
    pub const UNITS: &str = "Units";
    pub const UNCERTAINTY: &str = "Uncertainty";
    pub const TEMPERATURE_SCALE: &str = "TemperatureScale";

    pub const LATITUDE: &str = "Latitude";
    pub const LONGITUDE: &str = "Longitude";
    pub const TIME: &str = "Time";

    pub const STATION: &str = "CNODCStation";
    pub const STATION_CANDIDATES: &str = "CNODCStationCandidates";
    pub const STATION_STRING: &str = "CNODCStationString";
    pub const STATUS: &str = "CNODCStatus";
    pub const OPERATOR_ACTION: &str = "CNODCOperatorAction";
    pub const DUPLICATE_ID: &str = "CNODCDuplicateId";
    pub const DUPLICATE_DATE: &str = "CNODCDuplicateDate";
    pub const WORKING_DUPLICATE_ID: &str = "CNODCWorkingDuplicateId";
    pub const WORKING_DUPLICATE_DATE: &str = "CNODCWorkingDuplicateDate";

    pub const WMO_ID: &str = "WMOID";
    pub const WIGOS_ID: &str = "WIGOSID";
    pub const STATION_ID: &str = "StationID";
    pub const STATION_NAME: &str = "StationName";

    /// Station identifier keys, in the order used to build a station string
    pub const STATION_IDENTIFIERS: [&str; 4] = [WMO_ID, WIGOS_ID, STATION_ID, STATION_NAME];
}

/// Working-quality flag values
pub mod quality {
    pub const NO_QC: i64 = 0;
    pub const GOOD: i64 = 1;
    pub const PROBABLY_GOOD: i64 = 2;
    pub const DUBIOUS: i64 = 3;
    pub const ERRONEOUS: i64 = 4;
    pub const CHANGED: i64 = 5;
    pub const MISSING: i64 = 9;
    pub const DUBIOUS_PENDING: i64 = 13;
    pub const ERRONEOUS_PENDING: i64 = 14;
    pub const MISSING_PENDING: i64 = 19;
    pub const MULTI_PENDING: i64 = 20;
    pub const UNITS_PENDING: i64 = 21;
}

/// Default values for worker and QC configuration
pub mod defaults {
    pub const DELAY_TIME_SECONDS: f64 = 0.25;
    pub const RETRY_DELAY_SECONDS: f64 = 0.0;
    pub const DELAY_FACTOR: f64 = 2.0;
    pub const MAX_DELAY_TIME_SECONDS: f64 = 128.0;
    pub const DEPRIORITIZE_FAILURES: bool = true;

    pub const NEXT_QUEUE: &str = "nodb_continue";
    pub const REVIEW_QUEUE: &str = "nodb_manual_review";

    pub const DUPLICATE_TIME_WINDOW_MINUTES: f64 = 15.0;
    pub const DUPLICATE_DISTANCE_WINDOW_M: f64 = 5000.0;
    pub const DUPLICATE_PROBABLE_THRESHOLD: f64 = 0.8;
    pub const DUPLICATE_IMPROBABLE_THRESHOLD: f64 = 0.2;

    pub const TICK_INTERVAL_MS: u64 = 1000;
}

/// Separator used when joining station candidates and batch key parts
pub const GROUP_SEPARATOR: char = '\u{1F}';
