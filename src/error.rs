use std::fmt;

use thiserror::Error;

use crate::domain::DatasetKind;

/// Errors raised by the relational store adapters.
///
/// The loader decides what to do from the variant alone: transient errors are
/// retried with backoff, rejected rows are isolated, fatal errors end the
/// table load.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Connection drop, busy database, lock timeout.
    #[error("transient store error: {message}")]
    Transient { message: String },

    /// Constraint violation or a row the store refuses to accept.
    #[error("row rejected by store: {message}")]
    Rejected {
        message: String,
        /// Offset of the offending row inside the batch, when known.
        row: Option<usize>,
    },

    #[error("fatal store error: {message}")]
    Fatal { message: String },
}

impl StoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        StoreError::Transient { message: message.into() }
    }

    pub fn rejected(message: impl Into<String>, row: Option<usize>) -> Self {
        StoreError::Rejected { message: message.into(), row }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        StoreError::Fatal { message: message.into() }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::transient(err.to_string())
            }
            Some(ErrorCode::ConstraintViolation) | Some(ErrorCode::TypeMismatch) | Some(ErrorCode::TooBig) => {
                StoreError::rejected(err.to_string(), None)
            }
            _ => match err {
                rusqlite::Error::ToSqlConversionFailure(_) | rusqlite::Error::InvalidParameterCount(_, _) => {
                    StoreError::rejected(err.to_string(), None)
                }
                other => StoreError::fatal(other.to_string()),
            },
        }
    }
}

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum EtlError {
    /// Structural mismatch between a dataset and its declared schema. Halts the
    /// dataset's transformation without producing output.
    #[error("transformation error in {dataset}: {message}")]
    Schema { dataset: DatasetKind, message: String },

    /// Retry ceiling exhausted (or an unrecoverable store error) during a load.
    #[error("load of table '{table}' failed at batch {batch_index} after {attempts} attempt(s): {source}")]
    FatalLoad {
        table: String,
        batch_index: usize,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("artifact not found for {dataset}: {path}")]
    MissingArtifact { dataset: DatasetKind, path: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl EtlError {
    pub fn schema(dataset: DatasetKind, message: impl Into<String>) -> Self {
        EtlError::Schema { dataset, message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;

/// Per-category issue counts reported at the end of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IssueSummary {
    pub schema_errors: u64,
    pub data_quality_warnings: u64,
    pub orphan_references: u64,
    pub transient_store_errors: u64,
    pub constraint_violations: u64,
    pub fatal_load_errors: u64,
}

impl IssueSummary {
    pub fn merge(&mut self, other: &IssueSummary) {
        self.schema_errors += other.schema_errors;
        self.data_quality_warnings += other.data_quality_warnings;
        self.orphan_references += other.orphan_references;
        self.transient_store_errors += other.transient_store_errors;
        self.constraint_violations += other.constraint_violations;
        self.fatal_load_errors += other.fatal_load_errors;
    }
}

impl fmt::Display for IssueSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "schema={} data_quality={} orphans={} transient={} constraint={} fatal_load={}",
            self.schema_errors,
            self.data_quality_warnings,
            self.orphan_references,
            self.transient_store_errors,
            self.constraint_violations,
            self.fatal_load_errors
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_database_is_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        assert!(StoreError::from(err).is_transient());
    }

    #[test]
    fn test_constraint_violation_is_rejected() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("FOREIGN KEY constraint failed".to_string()),
        );
        assert!(matches!(StoreError::from(err), StoreError::Rejected { .. }));
    }

    #[test]
    fn test_issue_summary_merge() {
        let mut total = IssueSummary { orphan_references: 2, ..Default::default() };
        total.merge(&IssueSummary { orphan_references: 1, fatal_load_errors: 1, ..Default::default() });
        assert_eq!(total.orphan_references, 3);
        assert_eq!(total.fatal_load_errors, 1);
    }
}
