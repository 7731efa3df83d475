//! Error types surfaced by the store.

use thiserror::Error;

/// Errors returned by [`crate::Store`] operations.
///
/// Every write failure surfaces here; nothing is swallowed silently by the
/// store itself (callers may choose to log-and-degrade for specific
/// operations, e.g. `checkPRMerged`, but that is a caller concern).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task already exists: {0}")]
    TaskAlreadyExists(String),

    #[error("gate not found: task={task_id} name={name}")]
    GateNotFound { task_id: String, name: String },

    #[error("invalid JSON in column `{column}` of table `{table}`: {source}")]
    InvalidJson {
        table: &'static str,
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid patch: {0}")]
    InvalidPatch(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
