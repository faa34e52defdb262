//! The read/write contract the pipeline needs from persistent storage.
//!
//! Every read is scoped to one user. Writes are keyed by record id and are
//! expected to be issued in bounded batches by the caller.

use chrono::{DateTime, NaiveDate, Utc};
use std::future::Future;
use thiserror::Error;

use crate::account::{AccountId, UserId};
use crate::category::{Category, CategoryRule};
use crate::merchant::MerchantMapping;
use crate::period::DateRange;
use crate::recurring::{RecurringRule, RecurringRuleId};
use crate::transaction::{ClassificationUpdate, RecurringLink, Transaction, TransferLink};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Malformed record {id}: {reason}")]
    Malformed { id: String, reason: String },
}

pub trait PipelineStore: Send + Sync {
    /// Active category rules, already in evaluation (priority) order.
    fn active_rules(
        &self,
        user: &UserId,
    ) -> impl Future<Output = Result<Vec<CategoryRule>, StoreError>> + Send;

    /// Learned mappings at or above `min_confidence`, highest confidence first.
    fn merchant_mappings(
        &self,
        user: &UserId,
        min_confidence: f64,
    ) -> impl Future<Output = Result<Vec<MerchantMapping>, StoreError>> + Send;

    /// Every category visible to the user, seeded defaults included.
    fn categories(
        &self,
        user: &UserId,
    ) -> impl Future<Output = Result<Vec<Category>, StoreError>> + Send;

    fn find_merchant_mapping(
        &self,
        user: &UserId,
        pattern: &str,
    ) -> impl Future<Output = Result<Option<MerchantMapping>, StoreError>> + Send;

    /// Insert or replace the mapping keyed by (user, pattern).
    fn upsert_merchant_mapping(
        &self,
        mapping: &MerchantMapping,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Uncategorized rows for the user (optionally one account), newest first.
    fn uncategorized_transactions(
        &self,
        user: &UserId,
        account: Option<&AccountId>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Transaction>, StoreError>> + Send;

    fn write_classifications(
        &self,
        updates: &[ClassificationUpdate],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn active_recurring_rules(
        &self,
        user: &UserId,
    ) -> impl Future<Output = Result<Vec<RecurringRule>, StoreError>> + Send;

    fn link_recurring(
        &self,
        link: &RecurringLink,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn advance_recurring_rule(
        &self,
        id: &RecurringRuleId,
        next_expected: NaiveDate,
        matched_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn account_ids(
        &self,
        user: &UserId,
    ) -> impl Future<Output = Result<Vec<AccountId>, StoreError>> + Send;

    /// Rows on the given accounts, dated within `range`, with no transfer counterpart yet.
    fn unlinked_transactions(
        &self,
        accounts: &[AccountId],
        range: DateRange,
    ) -> impl Future<Output = Result<Vec<Transaction>, StoreError>> + Send;

    fn link_transfer(
        &self,
        link: &TransferLink,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
