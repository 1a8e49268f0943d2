//! # Structured Logging Module
//!
//! Environment-aware structured logging for worker processes. Console output is always
//! enabled; a JSON file layer is added when `NODB_LOG_DIR` is set so long-running daemons
//! keep a machine-readable trail per process.

use chrono::Utc;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    init_structured_logging_with_level(None);
}

/// Initialize structured logging, optionally forcing a filter directive (e.g. from `-vv`)
pub fn init_structured_logging_with_level(level_override: Option<&str>) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = level_override
            .map(str::to_string)
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or_else(|| get_log_level(&environment));
        let pid = process::id();

        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(EnvFilter::new(log_level.clone()));

        let mut log_path: Option<PathBuf> = None;
        let file_layer = std::env::var("NODB_LOG_DIR").ok().and_then(|dir| {
            let log_dir = PathBuf::from(dir);
            if std::fs::create_dir_all(&log_dir).is_err() {
                return None;
            }
            let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
            let file_name = format!("{environment}.{pid}.{timestamp}.log");
            log_path = Some(log_dir.join(&file_name));
            let appender = tracing_appender::rolling::never(&log_dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            // The guard flushes on drop; worker processes log until exit.
            std::mem::forget(guard);
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(EnvFilter::new(log_level.clone())),
            )
        });

        let subscriber = tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer);

        if subscriber.try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        }

        tracing::info!(
            pid = pid,
            environment = %environment,
            log_level = %log_level,
            log_file = ?log_path.as_ref().map(|p| p.display().to_string()),
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("NODB_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "test" => "debug".to_string(),
        "development" => "debug".to_string(),
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for queue item operations
pub fn log_queue_operation(
    operation: &str,
    queue_name: &str,
    queue_uuid: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        queue_name = %queue_name,
        queue_uuid = queue_uuid,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📥 QUEUE_OPERATION"
    );
}

/// Log structured data for worker lifecycle operations
pub fn log_worker_operation(
    operation: &str,
    process_name: &str,
    process_uuid: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        process_name = %process_name,
        process_uuid = %process_uuid,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "👷 WORKER_OPERATION"
    );
}

/// Log structured data for pool controller operations
pub fn log_pool_operation(
    operation: &str,
    process_name: Option<&str>,
    active: Option<usize>,
    quota: Option<usize>,
    status: &str,
) {
    tracing::info!(
        operation = %operation,
        process_name = process_name,
        active = active,
        quota = quota,
        status = %status,
        timestamp = %Utc::now().to_rfc3339(),
        "🏊 POOL_OPERATION"
    );
}

/// Log structured data for batch operations
pub fn log_batch_operation(
    operation: &str,
    batch_uuid: Option<&str>,
    group_key: Option<&str>,
    record_count: usize,
    target_queue: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        batch_uuid = batch_uuid,
        group_key = group_key,
        record_count = record_count,
        target_queue = target_queue,
        timestamp = %Utc::now().to_rfc3339(),
        "📦 BATCH_OPERATION"
    );
}

/// Log structured data for QC test operations
pub fn log_qc_operation(
    operation: &str,
    test_name: &str,
    working_uuid: Option<&str>,
    result: &str,
    message_count: usize,
) {
    tracing::debug!(
        operation = %operation,
        test_name = %test_name,
        working_uuid = working_uuid,
        result = %result,
        message_count = message_count,
        timestamp = %Utc::now().to_rfc3339(),
        "🔬 QC_OPERATION"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("staging"), "debug");
    }

    #[test]
    fn test_environment_detection_default() {
        // Only the fallback is asserted: other tests in the process may set NODB_ENV.
        if std::env::var("NODB_ENV").is_err() && std::env::var("APP_ENV").is_err() {
            assert_eq!(get_environment(), "development");
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        init_structured_logging();
        init_structured_logging();
        log_queue_operation("fetch", "nodb_qc", None, "empty", None);
    }
}
