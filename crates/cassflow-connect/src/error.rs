//! Error types for the delivery layer.
//!
//! Sinks return [`ConnectorError`]s; the retry wrapper keeps retrying while
//! [`ConnectorError::is_transient`] holds and escalates to terminal at the
//! attempt cap. Classification errs on the side of retrying: unknown errors
//! are transient until the cap converts them.

use cassflow_core::Destination;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse category used for metrics labels and DLQ records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Transient,
    Terminal,
    SchemaIncompatible,
    Quarantine,
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "Transient",
            Self::Terminal => "Terminal",
            Self::SchemaIncompatible => "SchemaIncompatible",
            Self::Quarantine => "Quarantine",
            Self::Fatal => "Fatal",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery-side errors.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Connection lost, refused, or never established
    #[error("Connection error: {0}")]
    Connection(String),

    /// A per-call deadline elapsed
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Lock contention / deadlock at the destination
    #[error("Lock contention: {0}")]
    LockContention(String),

    /// Destination refused a new connection for capacity reasons
    #[error("Too many connections: {0}")]
    TooManyConnections(String),

    /// Concurrent-write conflict; safe to retry
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    /// The event cannot be represented at the destination
    #[error("Schema incompatible: column {column}: {reason}")]
    SchemaIncompatible { column: String, reason: String },

    /// Destination rejected our credentials or privileges
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Constraint violation unrelated to replay
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Content-level error found at write time
    #[error("Content error: {0}")]
    Content(String),

    /// DDL failed for this (destination, table); writes latched off
    #[error("Quarantined: {destination} table {keyspace}.{table}")]
    Quarantined {
        destination: Destination,
        keyspace: String,
        table: String,
    },

    /// Invariant-threatening failure; the pipeline halts
    #[error("Fatal: {0}")]
    Fatal(String),

    /// PostgreSQL driver error (classified via SQLSTATE)
    #[error("Postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// ClickHouse client error
    #[error("ClickHouse error: {0}")]
    Clickhouse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Model validation error
    #[error("Model error: {0}")]
    Model(#[from] cassflow_core::ModelError),

    /// Anything else; treated as transient up to the retry cap
    #[error("{0}")]
    Other(String),
}

impl ConnectorError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn schema_incompatible(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaIncompatible {
            column: column.into(),
            reason: reason.into(),
        }
    }

    pub fn clickhouse(msg: impl Into<String>) -> Self {
        Self::Clickhouse(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether the retry wrapper should try again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_)
            | Self::Timeout(_)
            | Self::LockContention(_)
            | Self::TooManyConnections(_)
            | Self::WriteConflict(_) => true,

            Self::Postgres(e) => is_transient_pg_error(e),

            Self::Clickhouse(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("connection")
                    || msg.contains("timeout")
                    || msg.contains("temporarily")
                    || msg.contains("too many")
            }

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::ConnectionRefused
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::SchemaIncompatible { .. }
            | Self::PermissionDenied(_)
            | Self::ConstraintViolation(_)
            | Self::Content(_)
            | Self::Quarantined { .. }
            | Self::Fatal(_)
            | Self::Config(_)
            | Self::Json(_)
            | Self::Model(_) => false,

            // Unknown errors default to transient; the retry cap converts
            // them to terminal rather than dropping anything silently.
            Self::Other(_) => true,
        }
    }

    /// Category recorded in metrics and DLQ entries.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SchemaIncompatible { .. } => ErrorCategory::SchemaIncompatible,
            Self::Quarantined { .. } => ErrorCategory::Quarantine,
            Self::Fatal(_) => ErrorCategory::Fatal,
            _ if self.is_transient() => ErrorCategory::Transient,
            _ => ErrorCategory::Terminal,
        }
    }

    /// Metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Timeout(_) => "timeout",
            Self::LockContention(_) => "lock_contention",
            Self::TooManyConnections(_) => "too_many_connections",
            Self::WriteConflict(_) => "write_conflict",
            Self::SchemaIncompatible { .. } => "schema_incompatible",
            Self::PermissionDenied(_) => "permission_denied",
            Self::ConstraintViolation(_) => "constraint_violation",
            Self::Content(_) => "content",
            Self::Quarantined { .. } => "quarantine",
            Self::Fatal(_) => "fatal",
            Self::Postgres(_) => "postgres",
            Self::Clickhouse(_) => "clickhouse",
            Self::Config(_) => "config",
            Self::Json(_) => "json",
            Self::Io(_) => "io",
            Self::Model(_) => "model",
            Self::Other(_) => "unknown",
        }
    }
}

/// Check a PostgreSQL error against the transient SQLSTATE classes.
fn is_transient_pg_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_error) = e.as_db_error() {
        let code = db_error.code().code();
        // 08xxx connection exception, 40xxx transaction rollback,
        // 53xxx insufficient resources, 57xxx operator intervention
        // (except query_canceled, which we map to a timeout upstream).
        if code.starts_with("08") || code.starts_with("40") || code.starts_with("53") {
            return true;
        }
        if code.starts_with("57") && code != "57014" {
            return true;
        }
        return false;
    }

    let msg = e.to_string().to_lowercase();
    msg.contains("connection") || msg.contains("closed") || msg.contains("timeout")
}

/// Result type for delivery operations
pub type Result<T> = std::result::Result<T, ConnectorError>;
