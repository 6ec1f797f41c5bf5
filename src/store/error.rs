use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors raised at the storage boundary, tagged so callers can decide how to
/// react without parsing messages.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Commit conflicts and other failures that may succeed on a later attempt.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// A table's backing data is missing or unreadable.
    #[error("table {} is corrupted: {detail}", table.as_deref().unwrap_or("<unknown>"))]
    Corrupted {
        table: Option<String>,
        detail: String,
    },

    /// An open or probe exceeded its deadline.
    #[error("{operation} timed out after {elapsed_ms} ms")]
    Timeout {
        operation: String,
        table: Option<String>,
        elapsed_ms: u64,
    },

    /// Misuse or environment failures that no retry or recovery can fix.
    #[error("store error: {0}")]
    Fatal(String),
}

/// Coarse reaction class for a [`StoreError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Corrupted(Option<String>),
    Timeout(Option<String>),
    Fatal,
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) => ErrorClass::Transient,
            Self::Corrupted { table, .. } => ErrorClass::Corrupted(table.clone()),
            Self::Timeout { table, .. } => ErrorClass::Timeout(table.clone()),
            Self::Fatal(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn missing_backing_file(table: &str, file: &str) -> Self {
        Self::Corrupted {
            table: Some(table.to_string()),
            detail: format!("missing backing file {file} for table {table}"),
        }
    }

    pub fn timeout(operation: impl Into<String>, table: Option<&str>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            table: table.map(str::to_string),
            elapsed_ms,
        }
    }

    /// Maps an SQLite failure observed while working on `table`.
    pub fn from_sqlite(err: rusqlite::Error, table: &str) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    Self::Transient(format!("{table}: {err}"))
                }
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => Self::Corrupted {
                    table: Some(table.to_string()),
                    detail: err.to_string(),
                },
                ErrorCode::CannotOpen => Self::Corrupted {
                    table: Some(table.to_string()),
                    detail: format!("cannot open backing file: {err}"),
                },
                ErrorCode::ReadOnly | ErrorCode::PermissionDenied | ErrorCode::DiskFull => {
                    Self::Fatal(format!("{table}: {err}"))
                }
                _ => Self::Transient(format!("{table}: {err}")),
            },
            rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::InvalidParameterCount(..)
            | rusqlite::Error::InvalidColumnName(_)
            | rusqlite::Error::InvalidColumnIndex(_) => Self::Fatal(format!("{table}: {err}")),
            _ => Self::Transient(format!("{table}: {err}")),
        }
    }

    pub fn from_io(err: std::io::Error, context: &str) -> Self {
        Self::Fatal(format!("{context}: {err}"))
    }
}
