//! # Error Types
//!
//! Structured error handling for the QC engine using thiserror.
//!
//! Every error belongs to one of three classes that drive queue-item bookkeeping:
//!
//! - **Recoverable**: transient failures (storage unavailable, lock contention, timeouts).
//!   The queue item is released for a later retry.
//! - **Unrecoverable**: invariant violations, bad configuration, malformed payloads.
//!   The queue item is marked failed and the worker instance terminates.
//! - **Halt**: a cooperative shutdown request observed mid-dispatch. The item is
//!   released and the worker exits cleanly.
//!
//! Payload and workflow errors carry stable numeric codes (`PAYLOAD-1000`,
//! `WORKFLOW-1002`, ...) so operators can correlate log lines with documentation.

use thiserror::Error;

/// Classification used by the queue worker to pick an outcome for a failed dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Recoverable,
    Unrecoverable,
    Halt,
}

/// Error family prefixes for coded errors
pub const PAYLOAD_FAMILY: &str = "PAYLOAD";
pub const WORKFLOW_FAMILY: &str = "WORKFLOW";
pub const WORKFLOW_CONTROLLER_FAMILY: &str = "WORKFLOWCTRL";
pub const STATION_FAMILY: &str = "STATION";

/// Comprehensive QC engine error types
#[derive(Error, Debug)]
pub enum QcError {
    #[error("Storage unavailable during {operation}: {message}")]
    StorageUnavailable { operation: String, message: String },

    #[error("Lock contention on {resource}")]
    LockContention { resource: String },

    #[error("Operation {operation} timed out")]
    Timeout { operation: String },

    #[error("Database error during {operation}: {message}")]
    Database { operation: String, message: String },

    #[error("Invalid payload [PAYLOAD-{code}]: {message}")]
    Payload { code: u16, message: String },

    #[error("Workflow error [WORKFLOW-{code}]: {message}")]
    Workflow { code: u16, message: String },

    #[error("Workflow controller error [WORKFLOWCTRL-{code}]: {message}")]
    WorkflowController { code: u16, message: String },

    #[error("Station resolution error [STATION-{code}]: {message}")]
    Station { code: u16, message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Invariant violation: {message}")]
    InvariantViolation { message: String },

    #[error("Worker type not registered: {class_name}")]
    UnknownWorkerType { class_name: String },

    #[error("Halt requested during {operation}")]
    Halted { operation: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl QcError {
    /// Create a storage unavailable error
    pub fn storage_unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a lock contention error
    pub fn lock_contention(resource: impl Into<String>) -> Self {
        Self::LockContention {
            resource: resource.into(),
        }
    }

    /// Create a database error
    pub fn database(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a coded payload error
    pub fn payload(code: u16, message: impl Into<String>) -> Self {
        Self::Payload {
            code,
            message: message.into(),
        }
    }

    /// Create a coded workflow definition error
    pub fn workflow(code: u16, message: impl Into<String>) -> Self {
        Self::Workflow {
            code,
            message: message.into(),
        }
    }

    /// Create a coded workflow controller error
    pub fn workflow_controller(code: u16, message: impl Into<String>) -> Self {
        Self::WorkflowController {
            code,
            message: message.into(),
        }
    }

    /// Create a coded station resolution error
    pub fn station(code: u16, message: impl Into<String>) -> Self {
        Self::Station {
            code,
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an invariant violation error
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a halt error
    pub fn halted(operation: impl Into<String>) -> Self {
        Self::Halted {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a retry of the same unit of work could plausibly succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            QcError::StorageUnavailable { .. }
                | QcError::LockContention { .. }
                | QcError::Timeout { .. }
        )
    }

    /// Classify this error for queue-item bookkeeping
    pub fn class(&self) -> ErrorClass {
        match self {
            QcError::Halted { .. } => ErrorClass::Halt,
            e if e.is_recoverable() => ErrorClass::Recoverable,
            _ => ErrorClass::Unrecoverable,
        }
    }

    /// Stable error code such as `PAYLOAD-1005`, when this error carries one
    pub fn code(&self) -> Option<String> {
        match self {
            QcError::Payload { code, .. } => Some(format!("{PAYLOAD_FAMILY}-{code}")),
            QcError::Workflow { code, .. } => Some(format!("{WORKFLOW_FAMILY}-{code}")),
            QcError::WorkflowController { code, .. } => {
                Some(format!("{WORKFLOW_CONTROLLER_FAMILY}-{code}"))
            }
            QcError::Station { code, .. } => Some(format!("{STATION_FAMILY}-{code}")),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for QcError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => QcError::timeout("acquire connection"),
            sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                QcError::storage_unavailable("sqlx", err.to_string())
            }
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // serialization_failure, deadlock_detected, lock_not_available
                Some("40001") | Some("40P01") | Some("55P03") => {
                    QcError::lock_contention(db_err.message().to_string())
                }
                // query_canceled, raised by statement_timeout
                Some("57014") => QcError::timeout("statement"),
                _ => QcError::database("sqlx", err.to_string()),
            },
            _ => QcError::database("sqlx", err.to_string()),
        }
    }
}

impl From<serde_json::Error> for QcError {
    fn from(err: serde_json::Error) -> Self {
        QcError::serialization(format!("JSON: {err}"))
    }
}

impl From<serde_yaml::Error> for QcError {
    fn from(err: serde_yaml::Error) -> Self {
        QcError::serialization(format!("YAML: {err}"))
    }
}

impl From<config::ConfigError> for QcError {
    fn from(err: config::ConfigError) -> Self {
        QcError::configuration("config", err.to_string())
    }
}

impl From<std::io::Error> for QcError {
    fn from(err: std::io::Error) -> Self {
        QcError::storage_unavailable("io", err.to_string())
    }
}

/// Result type for QC engine operations
pub type Result<T> = std::result::Result<T, QcError>;
