use sift_core::{ConditionError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid rule conditions: {0}")]
    Condition(#[from] ConditionError),
    #[error("Malformed row {id}: {reason}")]
    Malformed { id: String, reason: String },
    #[error("Not found: {0}")]
    NotFound(String),
}

impl StorageError {
    pub(crate) fn malformed(id: &str, reason: impl Into<String>) -> Self {
        StorageError::Malformed {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(what) => StoreError::NotFound(what),
            StorageError::Malformed { id, reason } => StoreError::Malformed { id, reason },
            StorageError::Sqlx(sqlx::Error::RowNotFound) => StoreError::NotFound("row".into()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}
