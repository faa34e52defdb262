use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::account::UserId;
use super::category::CategoryId;

/// A merchant pattern the user has taught the system by re-categorizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerchantMapping {
    pub id: String,
    pub user_id: UserId,
    /// Normalized with [`normalize_merchant`].
    pub pattern: String,
    pub category_id: CategoryId,
    /// In [0, 1]; only ever grows on repeat confirmation.
    pub confidence: f64,
    pub confirmation_count: u32,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Lowercases, trims and collapses inner whitespace.
pub fn normalize_merchant(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// True when either normalized string contains the other. Empty strings never match.
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.contains(b) || b.contains(a)
}
