use sift_core::{CategoryId, StoreError, TransactionId};
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to load categorization data: {0}")]
    Prefetch(#[source] StoreError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Transaction {0} has no merchant text to learn from")]
    NothingToLearn(TransactionId),
}

/// A failure confined to one transaction; the batch carries on without it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CategorizeError {
    #[error("Category {0} is not known to this user")]
    UnknownCategory(CategoryId),
}
