use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::account::AccountId;
use super::category::{CategoryId, CategoryType};
use super::money::Money;
use super::recurring::RecurringRuleId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        TransactionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TransactionId {
    fn from(id: &str) -> Self {
        TransactionId(id.to_string())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a transaction's category was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategorizedBy {
    Rule,
    Learned,
    Default,
    Fallback,
    /// Authoritative re-stamp by the transfer detector.
    Transfer,
    Manual,
}

impl CategorizedBy {
    pub fn as_str(self) -> &'static str {
        match self {
            CategorizedBy::Rule => "rule",
            CategorizedBy::Learned => "learned",
            CategorizedBy::Default => "default",
            CategorizedBy::Fallback => "fallback",
            CategorizedBy::Transfer => "transfer",
            CategorizedBy::Manual => "manual",
        }
    }
}

impl fmt::Display for CategorizedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CategorizedBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rule" => Ok(CategorizedBy::Rule),
            "learned" => Ok(CategorizedBy::Learned),
            "default" => Ok(CategorizedBy::Default),
            "fallback" => Ok(CategorizedBy::Fallback),
            "transfer" => Ok(CategorizedBy::Transfer),
            "manual" => Ok(CategorizedBy::Manual),
            other => Err(format!("Unknown categorization method: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    pub date: NaiveDate,
    pub amount: Money,
    pub description: String,
    pub merchant_name: Option<String>,

    pub category_id: Option<CategoryId>,
    pub categorized_by: Option<CategorizedBy>,
    pub transaction_type: Option<CategoryType>,
    pub confidence: Option<f64>,
    pub category_confirmed: bool,
    pub review_flagged: bool,
    pub review_flagged_reason: Option<String>,
    pub ignored: bool,
    pub tags: Vec<String>,

    pub recurring_id: Option<RecurringRuleId>,
    /// Counterpart account when this row is one leg of an internal transfer.
    pub to_account_id: Option<AccountId>,
}

impl Transaction {
    /// A freshly ingested, unclassified row.
    pub fn new(
        id: impl Into<String>,
        account_id: impl Into<String>,
        date: NaiveDate,
        amount: Money,
        description: &str,
        merchant_name: Option<&str>,
    ) -> Self {
        Transaction {
            id: TransactionId::new(id),
            account_id: AccountId::new(account_id),
            date,
            amount,
            description: description.to_string(),
            merchant_name: merchant_name.map(str::to_string),
            category_id: None,
            categorized_by: None,
            transaction_type: None,
            confidence: None,
            category_confirmed: false,
            review_flagged: false,
            review_flagged_reason: None,
            ignored: false,
            tags: Vec::new(),
            recurring_id: None,
            to_account_id: None,
        }
    }

    /// Merchant name, falling back to the description when absent or blank.
    pub fn merchant_text(&self) -> &str {
        match self.merchant_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => &self.description,
        }
    }

    /// Description, falling back to the merchant name when blank.
    pub fn description_text(&self) -> &str {
        if self.description.trim().is_empty() {
            self.merchant_name.as_deref().unwrap_or_default()
        } else {
            &self.description
        }
    }
}

/// Field writes produced by categorization, applied by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationUpdate {
    pub transaction_id: TransactionId,
    pub category_id: Option<CategoryId>,
    pub categorized_by: Option<CategorizedBy>,
    pub transaction_type: Option<CategoryType>,
    pub confidence: Option<f64>,
    pub category_confirmed: bool,
    pub review_flagged: bool,
    pub review_flagged_reason: Option<String>,
    /// `None` leaves the stored value untouched.
    pub ignored: Option<bool>,
    pub merchant_name: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl ClassificationUpdate {
    /// Leaves the transaction uncategorized and asks the user to review it.
    pub fn flagged(transaction_id: TransactionId, reason: impl Into<String>) -> Self {
        ClassificationUpdate {
            transaction_id,
            category_id: None,
            categorized_by: None,
            transaction_type: None,
            confidence: None,
            category_confirmed: false,
            review_flagged: true,
            review_flagged_reason: Some(reason.into()),
            ignored: None,
            merchant_name: None,
            tags: None,
        }
    }

    /// Mirrors the update onto an in-memory row.
    pub fn apply_to(&self, tx: &mut Transaction) {
        tx.category_id = self.category_id.clone();
        tx.categorized_by = self.categorized_by;
        tx.transaction_type = self.transaction_type;
        tx.confidence = self.confidence;
        tx.category_confirmed = self.category_confirmed;
        tx.review_flagged = self.review_flagged;
        tx.review_flagged_reason = self.review_flagged_reason.clone();
        if let Some(ignored) = self.ignored {
            tx.ignored = ignored;
        }
        if let Some(name) = &self.merchant_name {
            tx.merchant_name = Some(name.clone());
        }
        if let Some(tags) = &self.tags {
            tx.tags = tags.clone();
        }
    }
}

/// Linkage written when a transaction joins a recurring series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringLink {
    pub transaction_id: TransactionId,
    pub recurring_id: RecurringRuleId,
    pub category_id: Option<CategoryId>,
    pub transaction_type: Option<CategoryType>,
}

/// Linkage written to one leg of a detected transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferLink {
    pub transaction_id: TransactionId,
    pub counterpart_account_id: AccountId,
    /// Present when the user has a canonical "Transfer" category.
    pub category_id: Option<CategoryId>,
}

/// Two legs of one internal money movement. Never persisted as an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferPair {
    pub outflow_id: TransactionId,
    pub inflow_id: TransactionId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    /// Absolute amount moved.
    pub amount: Money,
    /// Date of the outflow leg.
    pub date: NaiveDate,
}

impl TransferPair {
    /// Both legs, each with the account on the other side.
    pub fn links(&self, category_id: Option<&CategoryId>) -> [TransferLink; 2] {
        [
            TransferLink {
                transaction_id: self.outflow_id.clone(),
                counterpart_account_id: self.to_account_id.clone(),
                category_id: category_id.cloned(),
            },
            TransferLink {
                transaction_id: self.inflow_id.clone(),
                counterpart_account_id: self.from_account_id.clone(),
                category_id: category_id.cloned(),
            },
        ]
    }
}
