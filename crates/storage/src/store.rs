//! [`PipelineStore`] over the SQLite schema in [`crate::db`].

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tracing::{debug, warn};

use sift_core::{
    normalize_conditions, AccountId, CategorizedBy, Category, CategoryId, CategoryRule,
    CategoryType, ClassificationUpdate, DateRange, Frequency, LegacyCondition, MerchantMapping,
    Money, PipelineStore, RecurringLink, RecurringRule, RecurringRuleId, RuleActions, StoreError,
    Transaction, TransactionId, TransferLink, UserId,
};

use crate::db::DbPool;
use crate::error::StorageError;

const TRANSACTION_COLUMNS: &str = "t.id, t.account_id, t.date, t.amount_cents, t.description, \
    t.merchant_name, t.category_id, t.categorized_by, t.type AS transaction_type, t.confidence, \
    t.category_confirmed, t.review_flagged, t.review_flagged_reason, t.ignored, t.tags, \
    t.recurring_id, t.to_account_id";

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: String,
    account_id: String,
    date: NaiveDate,
    amount_cents: i64,
    description: String,
    merchant_name: Option<String>,
    category_id: Option<String>,
    categorized_by: Option<String>,
    transaction_type: Option<String>,
    confidence: Option<f64>,
    category_confirmed: bool,
    review_flagged: bool,
    review_flagged_reason: Option<String>,
    ignored: bool,
    tags: String,
    recurring_id: Option<String>,
    to_account_id: Option<String>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = StorageError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let categorized_by = row
            .categorized_by
            .as_deref()
            .map(str::parse::<CategorizedBy>)
            .transpose()
            .map_err(|reason| StorageError::malformed(&row.id, reason))?;
        let transaction_type = row
            .transaction_type
            .as_deref()
            .map(str::parse::<CategoryType>)
            .transpose()
            .map_err(|reason| StorageError::malformed(&row.id, reason))?;
        let tags: Vec<String> = serde_json::from_str(&row.tags)
            .map_err(|e| StorageError::malformed(&row.id, format!("tags: {e}")))?;

        Ok(Transaction {
            id: TransactionId(row.id),
            account_id: AccountId(row.account_id),
            date: row.date,
            amount: Money::from_cents(row.amount_cents),
            description: row.description,
            merchant_name: row.merchant_name,
            category_id: row.category_id.map(CategoryId),
            categorized_by,
            transaction_type,
            confidence: row.confidence,
            category_confirmed: row.category_confirmed,
            review_flagged: row.review_flagged,
            review_flagged_reason: row.review_flagged_reason,
            ignored: row.ignored,
            tags,
            recurring_id: row.recurring_id.map(RecurringRuleId),
            to_account_id: row.to_account_id.map(AccountId),
        })
    }
}

#[derive(Debug, FromRow)]
struct RuleRow {
    id: String,
    name: String,
    priority: i32,
    conditions: Option<String>,
    field: Option<String>,
    operator: Option<String>,
    value: Option<String>,
    value_end: Option<String>,
    category_id: String,
    actions: Option<String>,
}

impl TryFrom<RuleRow> for CategoryRule {
    type Error = StorageError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        let legacy = LegacyCondition {
            field: row.field,
            operator: row.operator,
            value: row.value,
            value_end: row.value_end,
        };
        let conditions = normalize_conditions(row.conditions.as_deref(), &legacy)?;
        let actions = match row.actions.as_deref().map(str::trim) {
            Some(json) if !json.is_empty() => serde_json::from_str::<RuleActions>(json)?,
            _ => RuleActions::default(),
        };
        Ok(CategoryRule {
            id: row.id,
            name: row.name,
            priority: row.priority,
            conditions,
            category_id: CategoryId(row.category_id),
            actions,
        })
    }
}

#[derive(Debug, FromRow)]
struct CategoryRow {
    id: String,
    name: String,
    category_type: String,
    is_default: bool,
}

impl TryFrom<CategoryRow> for Category {
    type Error = StorageError;

    fn try_from(row: CategoryRow) -> Result<Self, Self::Error> {
        let category_type = row
            .category_type
            .parse::<CategoryType>()
            .map_err(|reason| StorageError::malformed(&row.id, reason))?;
        Ok(Category {
            id: CategoryId(row.id),
            name: row.name,
            category_type,
            is_default: row.is_default,
        })
    }
}

#[derive(Debug, FromRow)]
struct MappingRow {
    id: String,
    user_id: String,
    pattern: String,
    category_id: String,
    confidence: f64,
    confirmation_count: i64,
    updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<MappingRow> for MerchantMapping {
    type Error = StorageError;

    fn try_from(row: MappingRow) -> Result<Self, Self::Error> {
        let confirmation_count = u32::try_from(row.confirmation_count)
            .map_err(|_| StorageError::malformed(&row.id, "negative confirmation count"))?;
        Ok(MerchantMapping {
            id: row.id,
            user_id: UserId(row.user_id),
            pattern: row.pattern,
            category_id: CategoryId(row.category_id),
            confidence: row.confidence,
            confirmation_count,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RecurringRow {
    id: String,
    merchant_pattern: String,
    expected_amount_cents: Option<i64>,
    expected_day: Option<i64>,
    category_id: Option<String>,
    frequency: String,
    confirmed: bool,
    next_expected: Option<NaiveDate>,
    last_matched_at: Option<DateTime<Utc>>,
}

impl TryFrom<RecurringRow> for RecurringRule {
    type Error = StorageError;

    fn try_from(row: RecurringRow) -> Result<Self, Self::Error> {
        let frequency = row
            .frequency
            .parse::<Frequency>()
            .map_err(|reason| StorageError::malformed(&row.id, reason))?;
        let expected_day = row
            .expected_day
            .map(|d| match u32::try_from(d) {
                Ok(day @ 1..=31) => Ok(day),
                _ => Err(StorageError::malformed(&row.id, format!("expected_day {d}"))),
            })
            .transpose()?;
        Ok(RecurringRule {
            id: RecurringRuleId(row.id),
            merchant_pattern: row.merchant_pattern,
            expected_amount: row.expected_amount_cents.map(Money::from_cents),
            expected_day,
            category_id: row.category_id.map(CategoryId),
            frequency,
            confirmed: row.confirmed,
            next_expected: row.next_expected,
            last_matched_at: row.last_matched_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn load_rules(&self, user: &UserId) -> Result<Vec<CategoryRule>, StorageError> {
        let rows = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT id, name, priority, conditions, field, operator, value, value_end, category_id, actions
            FROM category_rules
            WHERE user_id = ? AND is_active = 1
            ORDER BY priority DESC, created_at, id
            "#,
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match CategoryRule::try_from(row) {
                Ok(rule) => rules.push(rule),
                // A broken rule must not take the whole cascade down with it.
                Err(e) => warn!(rule_id = %id, error = %e, "Skipping unusable category rule"),
            }
        }
        Ok(rules)
    }

    async fn load_mappings(
        &self,
        user: &UserId,
        min_confidence: f64,
    ) -> Result<Vec<MerchantMapping>, StorageError> {
        sqlx::query_as::<_, MappingRow>(
            r#"
            SELECT id, user_id, pattern, category_id, confidence, confirmation_count, updated_at
            FROM merchant_mappings
            WHERE user_id = ? AND confidence >= ?
            ORDER BY confidence DESC, pattern
            "#,
        )
        .bind(user.as_str())
        .bind(min_confidence)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(MerchantMapping::try_from)
        .collect()
    }

    async fn load_categories(&self, user: &UserId) -> Result<Vec<Category>, StorageError> {
        sqlx::query_as::<_, CategoryRow>(
            "SELECT id, name, category_type, is_default FROM categories WHERE user_id = ? ORDER BY name",
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Category::try_from)
        .collect()
    }

    async fn load_mapping(
        &self,
        user: &UserId,
        pattern: &str,
    ) -> Result<Option<MerchantMapping>, StorageError> {
        sqlx::query_as::<_, MappingRow>(
            r#"
            SELECT id, user_id, pattern, category_id, confidence, confirmation_count, updated_at
            FROM merchant_mappings
            WHERE user_id = ? AND pattern = ?
            "#,
        )
        .bind(user.as_str())
        .bind(pattern)
        .fetch_optional(&self.pool)
        .await?
        .map(MerchantMapping::try_from)
        .transpose()
    }

    async fn save_mapping(&self, mapping: &MerchantMapping) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO merchant_mappings
                (id, user_id, pattern, category_id, confidence, confirmation_count, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, pattern) DO UPDATE SET
                category_id = excluded.category_id,
                confidence = excluded.confidence,
                confirmation_count = excluded.confirmation_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&mapping.id)
        .bind(mapping.user_id.as_str())
        .bind(&mapping.pattern)
        .bind(mapping.category_id.as_str())
        .bind(mapping.confidence)
        .bind(i64::from(mapping.confirmation_count))
        .bind(mapping.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_uncategorized(
        &self,
        user: &UserId,
        account: Option<&AccountId>,
        limit: usize,
    ) -> Result<Vec<Transaction>, StorageError> {
        let sql = format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM transactions t
            JOIN accounts a ON a.id = t.account_id
            WHERE a.user_id = ? AND t.category_id IS NULL AND (? IS NULL OR t.account_id = ?)
            ORDER BY t.date DESC, t.id
            LIMIT ?
            "#
        );
        let account = account.map(|a| a.as_str());
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(user.as_str())
            .bind(account)
            .bind(account)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let mut transactions = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match Transaction::try_from(row) {
                Ok(tx) => transactions.push(tx),
                Err(e) => {
                    warn!(transaction_id = %id, error = %e, "Flagging unreadable transaction");
                    self.flag_unreadable(&id, &e).await;
                }
            }
        }
        Ok(transactions)
    }

    /// Leaves the row uncategorized but visible in the review queue.
    async fn flag_unreadable(&self, id: &str, cause: &StorageError) {
        let result = sqlx::query(
            "UPDATE transactions SET review_flagged = 1, review_flagged_reason = ? WHERE id = ?",
        )
        .bind(format!("Categorization failed: {cause}"))
        .bind(id)
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            warn!(transaction_id = %id, error = %e, "Failed to flag unreadable transaction");
        }
    }

    /// One DB transaction per call: the chunk lands whole or not at all.
    async fn save_classifications(&self, updates: &[ClassificationUpdate]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for update in updates {
            let tags = update.tags.as_ref().map(serde_json::to_string).transpose()?;
            let result = sqlx::query(
                r#"
                UPDATE transactions SET
                    category_id = ?,
                    categorized_by = ?,
                    type = ?,
                    confidence = ?,
                    category_confirmed = ?,
                    review_flagged = ?,
                    review_flagged_reason = ?,
                    ignored = COALESCE(?, ignored),
                    merchant_name = COALESCE(?, merchant_name),
                    tags = COALESCE(?, tags)
                WHERE id = ?
                "#,
            )
            .bind(update.category_id.as_ref().map(|c| c.as_str()))
            .bind(update.categorized_by.map(CategorizedBy::as_str))
            .bind(update.transaction_type.map(CategoryType::as_str))
            .bind(update.confidence)
            .bind(update.category_confirmed)
            .bind(update.review_flagged)
            .bind(&update.review_flagged_reason)
            .bind(update.ignored)
            .bind(&update.merchant_name)
            .bind(tags)
            .bind(update.transaction_id.as_str())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StorageError::NotFound(format!(
                    "transaction {}",
                    update.transaction_id
                )));
            }
        }
        tx.commit().await?;
        debug!(rows = updates.len(), "Wrote classification chunk");
        Ok(())
    }

    async fn load_recurring_rules(&self, user: &UserId) -> Result<Vec<RecurringRule>, StorageError> {
        let rows = sqlx::query_as::<_, RecurringRow>(
            r#"
            SELECT id, merchant_pattern, expected_amount_cents, expected_day, category_id,
                   frequency, confirmed, next_expected, last_matched_at
            FROM recurring_rules
            WHERE user_id = ? AND is_active = 1
            ORDER BY rowid
            "#,
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match RecurringRule::try_from(row) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!(rule_id = %id, error = %e, "Skipping unusable recurring rule"),
            }
        }
        Ok(rules)
    }

    async fn save_recurring_link(&self, link: &RecurringLink) -> Result<(), StorageError> {
        let result = match &link.category_id {
            Some(category_id) => {
                // An unknown category type keeps whatever type categorization stored.
                sqlx::query(
                    "UPDATE transactions SET recurring_id = ?, category_id = ?, type = COALESCE(?, type) WHERE id = ?",
                )
                .bind(link.recurring_id.as_str())
                .bind(category_id.as_str())
                .bind(link.transaction_type.map(CategoryType::as_str))
                .bind(link.transaction_id.as_str())
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("UPDATE transactions SET recurring_id = ? WHERE id = ?")
                    .bind(link.recurring_id.as_str())
                    .bind(link.transaction_id.as_str())
                    .execute(&self.pool)
                    .await?
            }
        };
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("transaction {}", link.transaction_id)));
        }
        Ok(())
    }

    async fn save_rule_advance(
        &self,
        id: &RecurringRuleId,
        next_expected: NaiveDate,
        matched_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE recurring_rules SET next_expected = ?, last_matched_at = ? WHERE id = ?",
        )
        .bind(next_expected)
        .bind(matched_at)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("recurring rule {id}")));
        }
        Ok(())
    }

    async fn load_account_ids(&self, user: &UserId) -> Result<Vec<AccountId>, StorageError> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM accounts WHERE user_id = ? ORDER BY id",
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(AccountId).collect())
    }

    async fn load_unlinked(
        &self,
        accounts: &[AccountId],
        range: DateRange,
    ) -> Result<Vec<Transaction>, StorageError> {
        if accounts.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new("SELECT ");
        query.push(TRANSACTION_COLUMNS);
        query.push(" FROM transactions t WHERE t.to_account_id IS NULL AND t.date >= ");
        query.push_bind(range.start);
        query.push(" AND t.date <= ");
        query.push_bind(range.end);
        query.push(" AND t.account_id IN (");
        let mut ids = query.separated(", ");
        for account in accounts {
            ids.push_bind(account.0.clone());
        }
        ids.push_unseparated(")");
        query.push(" ORDER BY t.date, t.id");

        let rows = query
            .build_query_as::<TransactionRow>()
            .fetch_all(&self.pool)
            .await?;

        let mut transactions = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match Transaction::try_from(row) {
                Ok(tx) => transactions.push(tx),
                Err(e) => warn!(transaction_id = %id, error = %e, "Skipping unreadable transfer candidate"),
            }
        }
        Ok(transactions)
    }

    async fn save_transfer_link(&self, link: &TransferLink) -> Result<(), StorageError> {
        let result = match &link.category_id {
            Some(category_id) => {
                sqlx::query(
                    r#"
                    UPDATE transactions SET
                        to_account_id = ?,
                        category_id = ?,
                        categorized_by = ?,
                        type = ?,
                        review_flagged = 0,
                        review_flagged_reason = NULL
                    WHERE id = ?
                    "#,
                )
                .bind(link.counterpart_account_id.as_str())
                .bind(category_id.as_str())
                .bind(CategorizedBy::Transfer.as_str())
                .bind(CategoryType::Transfer.as_str())
                .bind(link.transaction_id.as_str())
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("UPDATE transactions SET to_account_id = ? WHERE id = ?")
                    .bind(link.counterpart_account_id.as_str())
                    .bind(link.transaction_id.as_str())
                    .execute(&self.pool)
                    .await?
            }
        };
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("transaction {}", link.transaction_id)));
        }
        Ok(())
    }

    /// Full row by id, for callers outside the pipeline.
    pub async fn transaction(&self, id: &TransactionId) -> Result<Option<Transaction>, StorageError> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions t WHERE t.id = ?");
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(Transaction::try_from)
            .transpose()
    }
}

impl PipelineStore for SqliteStore {
    async fn active_rules(&self, user: &UserId) -> Result<Vec<CategoryRule>, StoreError> {
        Ok(self.load_rules(user).await?)
    }

    async fn merchant_mappings(
        &self,
        user: &UserId,
        min_confidence: f64,
    ) -> Result<Vec<MerchantMapping>, StoreError> {
        Ok(self.load_mappings(user, min_confidence).await?)
    }

    async fn categories(&self, user: &UserId) -> Result<Vec<Category>, StoreError> {
        Ok(self.load_categories(user).await?)
    }

    async fn find_merchant_mapping(
        &self,
        user: &UserId,
        pattern: &str,
    ) -> Result<Option<MerchantMapping>, StoreError> {
        Ok(self.load_mapping(user, pattern).await?)
    }

    async fn upsert_merchant_mapping(&self, mapping: &MerchantMapping) -> Result<(), StoreError> {
        Ok(self.save_mapping(mapping).await?)
    }

    async fn uncategorized_transactions(
        &self,
        user: &UserId,
        account: Option<&AccountId>,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError> {
        Ok(self.load_uncategorized(user, account, limit).await?)
    }

    async fn write_classifications(
        &self,
        updates: &[ClassificationUpdate],
    ) -> Result<(), StoreError> {
        Ok(self.save_classifications(updates).await?)
    }

    async fn active_recurring_rules(&self, user: &UserId) -> Result<Vec<RecurringRule>, StoreError> {
        Ok(self.load_recurring_rules(user).await?)
    }

    async fn link_recurring(&self, link: &RecurringLink) -> Result<(), StoreError> {
        Ok(self.save_recurring_link(link).await?)
    }

    async fn advance_recurring_rule(
        &self,
        id: &RecurringRuleId,
        next_expected: NaiveDate,
        matched_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Ok(self.save_rule_advance(id, next_expected, matched_at).await?)
    }

    async fn account_ids(&self, user: &UserId) -> Result<Vec<AccountId>, StoreError> {
        Ok(self.load_account_ids(user).await?)
    }

    async fn unlinked_transactions(
        &self,
        accounts: &[AccountId],
        range: DateRange,
    ) -> Result<Vec<Transaction>, StoreError> {
        Ok(self.load_unlinked(accounts, range).await?)
    }

    async fn link_transfer(&self, link: &TransferLink) -> Result<(), StoreError> {
        Ok(self.save_transfer_link(link).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        create_db, find_category_id, insert_account, insert_transaction, save_category_rule,
        save_recurring_rule, seed_default_categories,
    };
    use sift_core::RawCondition;
    use sift_pipeline::{DefaultPatterns, PipelineConfig, TransactionPipeline};
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn tx(id: &str, account: &str, on: NaiveDate, cents: i64, desc: &str, merchant: Option<&str>) -> Transaction {
        Transaction::new(id, account, on, Money::from_cents(cents), desc, merchant)
    }

    /// A seeded user with checking and savings accounts.
    async fn setup() -> (TempDir, SqliteStore, UserId) {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_db(&dir.path().join("sift.db")).await.unwrap();
        let user = UserId::new("u1");
        seed_default_categories(&pool, &user).await.unwrap();
        insert_account(&pool, &user, &AccountId::new("checking"), "Checking").await.unwrap();
        insert_account(&pool, &user, &AccountId::new("savings"), "Savings").await.unwrap();
        (dir, SqliteStore::new(pool), user)
    }

    async fn category(store: &SqliteStore, user: &UserId, name: &str) -> CategoryId {
        find_category_id(store.pool(), user, name).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn rules_load_in_priority_order_and_skip_broken_rows() {
        let (_dir, store, user) = setup().await;
        let dining = category(&store, &user, "Dining").await;
        let shopping = category(&store, &user, "Shopping").await;

        let starbucks = RawCondition {
            field: "merchant_name".into(),
            operator: "contains".into(),
            value: serde_json::json!("Starbucks"),
            value_end: None,
        };
        save_category_rule(store.pool(), &user, "coffee", 1, &[starbucks], &dining, &RuleActions::default())
            .await
            .unwrap();

        // Legacy single-condition row, no conditions list.
        sqlx::query(
            "INSERT INTO category_rules (id, user_id, name, priority, field, operator, value, value_end, category_id) \
             VALUES ('legacy', ?, 'big spend', 10, 'amount', 'between', '100', '500', ?)",
        )
        .bind(user.as_str())
        .bind(shopping.as_str())
        .execute(store.pool())
        .await
        .unwrap();

        // Unsupported operator on amount.
        sqlx::query(
            "INSERT INTO category_rules (id, user_id, name, priority, field, operator, value, category_id) \
             VALUES ('broken', ?, 'bad', 5, 'amount', 'contains', '12', ?)",
        )
        .bind(user.as_str())
        .bind(shopping.as_str())
        .execute(store.pool())
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO category_rules (id, user_id, name, priority, field, operator, value, category_id, is_active) \
             VALUES ('off', ?, 'off', 99, 'description', 'contains', 'x', ?, 0)",
        )
        .bind(user.as_str())
        .bind(shopping.as_str())
        .execute(store.pool())
        .await
        .unwrap();

        let rules = store.active_rules(&user).await.unwrap();
        let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["big spend", "coffee"]);
        assert_eq!(
            rules[0].conditions,
            vec![sift_core::RuleCondition::amount(sift_core::AmountOperator::Between {
                low: rust_decimal::Decimal::from(100),
                high: rust_decimal::Decimal::from(500),
            })]
        );
    }

    #[tokio::test]
    async fn uncategorized_page_is_scoped_and_newest_first() {
        let (_dir, store, user) = setup().await;
        let other = UserId::new("u2");
        insert_account(store.pool(), &other, &AccountId::new("theirs"), "Theirs").await.unwrap();

        for row in [
            tx("old", "checking", date(2024, 1, 1), -100, "A", None),
            tx("new", "checking", date(2024, 2, 1), -100, "B", None),
            tx("saved", "savings", date(2024, 3, 1), 100, "C", None),
            tx("foreign", "theirs", date(2024, 3, 1), -100, "D", None),
        ] {
            insert_transaction(store.pool(), &row).await.unwrap();
        }

        let all = store.uncategorized_transactions(&user, None, 10).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["saved", "new", "old"]);

        let page = store
            .uncategorized_transactions(&user, Some(&AccountId::new("checking")), 1)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id.as_str(), "new");
    }

    #[tokio::test]
    async fn classification_chunk_is_all_or_nothing() {
        let (_dir, store, user) = setup().await;
        let dining = category(&store, &user, "Dining").await;
        insert_transaction(store.pool(), &tx("t1", "checking", date(2024, 1, 5), -550, "STARBUCKS", None))
            .await
            .unwrap();

        let good = ClassificationUpdate {
            transaction_id: TransactionId::new("t1"),
            category_id: Some(dining.clone()),
            categorized_by: Some(CategorizedBy::Rule),
            transaction_type: Some(CategoryType::Expense),
            confidence: None,
            category_confirmed: true,
            review_flagged: false,
            review_flagged_reason: None,
            ignored: Some(true),
            merchant_name: Some("Starbucks".into()),
            tags: Some(vec!["coffee".into()]),
        };
        let missing = ClassificationUpdate::flagged(TransactionId::new("ghost"), "No matching category");

        let err = store
            .write_classifications(&[good.clone(), missing])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        let untouched = store.transaction(&"t1".into()).await.unwrap().unwrap();
        assert!(untouched.category_id.is_none());

        store.write_classifications(&[good]).await.unwrap();
        let row = store.transaction(&"t1".into()).await.unwrap().unwrap();
        assert_eq!(row.category_id, Some(dining));
        assert_eq!(row.categorized_by, Some(CategorizedBy::Rule));
        assert_eq!(row.transaction_type, Some(CategoryType::Expense));
        assert!(row.category_confirmed);
        assert!(row.ignored);
        assert_eq!(row.merchant_name.as_deref(), Some("Starbucks"));
        assert_eq!(row.tags, vec!["coffee".to_string()]);
    }

    #[tokio::test]
    async fn mapping_upsert_replaces_by_pattern() {
        let (_dir, store, user) = setup().await;
        let dining = category(&store, &user, "Dining").await;
        let groceries = category(&store, &user, "Groceries").await;

        let mut mapping = MerchantMapping {
            id: "m1".into(),
            user_id: user.clone(),
            pattern: "blue bottle".into(),
            category_id: dining,
            confidence: 0.6,
            confirmation_count: 1,
            updated_at: None,
        };
        store.upsert_merchant_mapping(&mapping).await.unwrap();
        assert!(store.merchant_mappings(&user, 0.8).await.unwrap().is_empty());

        mapping.id = "ignored-on-conflict".into();
        mapping.category_id = groceries.clone();
        mapping.confidence = 0.9;
        mapping.confirmation_count = 2;
        mapping.updated_at = Some(Utc::now());
        store.upsert_merchant_mapping(&mapping).await.unwrap();

        let found = store.find_merchant_mapping(&user, "blue bottle").await.unwrap().unwrap();
        assert_eq!(found.id, "m1");
        assert_eq!(found.category_id, groceries);
        assert_eq!(found.confirmation_count, 2);
        assert!(found.updated_at.is_some());
        assert_eq!(store.merchant_mappings(&user, 0.8).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recurring_link_and_advance_round_trip() {
        let (_dir, store, user) = setup().await;
        let subs = category(&store, &user, "Subscriptions").await;
        let rule = RecurringRule {
            id: RecurringRuleId::new("r1"),
            merchant_pattern: "netflix".into(),
            expected_amount: Some(Money::from_cents(-1549)),
            expected_day: Some(15),
            category_id: Some(subs.clone()),
            frequency: Frequency::Monthly,
            confirmed: true,
            next_expected: Some(date(2024, 3, 15)),
            last_matched_at: None,
        };
        save_recurring_rule(store.pool(), &user, &rule).await.unwrap();
        insert_transaction(store.pool(), &tx("nf", "checking", date(2024, 3, 15), -1549, "NETFLIX.COM", None))
            .await
            .unwrap();

        assert_eq!(store.active_recurring_rules(&user).await.unwrap(), vec![rule]);

        store
            .link_recurring(&RecurringLink {
                transaction_id: TransactionId::new("nf"),
                recurring_id: RecurringRuleId::new("r1"),
                category_id: Some(subs.clone()),
                transaction_type: Some(CategoryType::Expense),
            })
            .await
            .unwrap();
        store
            .advance_recurring_rule(&RecurringRuleId::new("r1"), date(2024, 4, 15), Utc::now())
            .await
            .unwrap();

        let row = store.transaction(&"nf".into()).await.unwrap().unwrap();
        assert_eq!(row.recurring_id, Some(RecurringRuleId::new("r1")));
        assert_eq!(row.category_id, Some(subs));
        let rules = store.active_recurring_rules(&user).await.unwrap();
        assert_eq!(rules[0].next_expected, Some(date(2024, 4, 15)));
        assert!(rules[0].last_matched_at.is_some());

        let err = store
            .advance_recurring_rule(&RecurringRuleId::new("nope"), date(2024, 4, 15), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn unlinked_scan_respects_range_and_links() {
        let (_dir, store, user) = setup().await;
        let transfer = category(&store, &user, "Transfer").await;
        for row in [
            tx("out", "checking", date(2024, 3, 1), -5000, "ONLINE TRANSFER", None),
            tx("in", "savings", date(2024, 3, 2), 5000, "ONLINE TRANSFER", None),
            tx("late", "savings", date(2024, 3, 20), 5000, "DEPOSIT", None),
        ] {
            insert_transaction(store.pool(), &row).await.unwrap();
        }

        let accounts = store.account_ids(&user).await.unwrap();
        let range = DateRange::new(date(2024, 2, 27), date(2024, 3, 5));
        let pool = store.unlinked_transactions(&accounts, range).await.unwrap();
        let ids: Vec<&str> = pool.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["out", "in"]);

        store
            .link_transfer(&TransferLink {
                transaction_id: TransactionId::new("out"),
                counterpart_account_id: AccountId::new("savings"),
                category_id: Some(transfer.clone()),
            })
            .await
            .unwrap();
        let row = store.transaction(&"out".into()).await.unwrap().unwrap();
        assert_eq!(row.to_account_id, Some(AccountId::new("savings")));
        assert_eq!(row.category_id, Some(transfer));
        assert_eq!(row.categorized_by, Some(CategorizedBy::Transfer));

        let remaining = store.unlinked_transactions(&accounts, range).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(store.unlinked_transactions(&[], range).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_pipeline_over_sqlite() {
        let (_dir, store, user) = setup().await;
        for row in [
            tx("nf", "checking", date(2024, 3, 14), -1549, "NETFLIX.COM", Some("Netflix")),
            tx("mv-out", "checking", date(2024, 3, 1), -20000, "MOBILE BANKING PAYMENT", None),
            tx("mv-in", "savings", date(2024, 3, 2), 20000, "DEPOSIT", None),
            tx("odd", "checking", date(2024, 3, 3), -4200, "SQ *FARMSTAND", None),
        ] {
            insert_transaction(store.pool(), &row).await.unwrap();
        }

        let pipeline =
            TransactionPipeline::new(store, PipelineConfig::default(), DefaultPatterns::builtin());
        let report = pipeline.process_pending(&user, None).await.unwrap();
        assert_eq!(report.categorization.scanned, 4);
        assert_eq!(report.transfer_pairs.len(), 1);

        let store = pipeline.store();
        let subs = category(store, &user, "Subscriptions").await;
        let transfer = category(store, &user, "Transfer").await;

        let nf = store.transaction(&"nf".into()).await.unwrap().unwrap();
        assert_eq!(nf.category_id, Some(subs));
        assert_eq!(nf.categorized_by, Some(CategorizedBy::Default));
        assert!(nf.review_flagged);

        for id in ["mv-out", "mv-in"] {
            let row = store.transaction(&id.into()).await.unwrap().unwrap();
            assert_eq!(row.category_id, Some(transfer.clone()));
            assert!(!row.review_flagged);
        }

        let odd = store.transaction(&"odd".into()).await.unwrap().unwrap();
        assert!(odd.category_id.is_none());
        assert_eq!(odd.review_flagged_reason.as_deref(), Some("No matching category"));
    }
    #[tokio::test]
    async fn unreadable_row_is_flagged_and_the_batch_continues() {
        let (_dir, store, user) = setup().await;
        for row in [
            tx("nf", "checking", date(2024, 3, 14), -1549, "NETFLIX.COM", Some("Netflix")),
            tx("bad", "checking", date(2024, 3, 15), -900, "CORNER DELI", None),
        ] {
            insert_transaction(store.pool(), &row).await.unwrap();
        }
        sqlx::query("UPDATE transactions SET tags = 'oops' WHERE id = 'bad'")
            .execute(store.pool())
            .await
            .unwrap();

        let pipeline =
            TransactionPipeline::new(store, PipelineConfig::default(), DefaultPatterns::builtin());
        let report = pipeline.process_pending(&user, None).await.unwrap();
        assert_eq!(report.categorization.scanned, 1);

        let store = pipeline.store();
        let subs = category(store, &user, "Subscriptions").await;
        let nf = store.transaction(&"nf".into()).await.unwrap().unwrap();
        assert_eq!(nf.category_id, Some(subs));

        let (category_id, flagged, reason): (Option<String>, bool, Option<String>) = sqlx::query_as(
            "SELECT category_id, review_flagged, review_flagged_reason FROM transactions WHERE id = 'bad'",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert!(category_id.is_none());
        assert!(flagged);
        assert!(reason.unwrap().starts_with("Categorization failed: "));

        let bulk = pipeline.bulk_categorize(&user, None).await.unwrap();
        assert_eq!(bulk.scanned, 0);
    }

    #[tokio::test]
    async fn unlinked_scan_skips_unreadable_rows() {
        let (_dir, store, user) = setup().await;
        for row in [
            tx("out", "checking", date(2024, 3, 1), -5000, "ONLINE TRANSFER", None),
            tx("in", "savings", date(2024, 3, 2), 5000, "ONLINE TRANSFER", None),
            tx("bad", "savings", date(2024, 3, 2), 5000, "ONLINE TRANSFER", None),
        ] {
            insert_transaction(store.pool(), &row).await.unwrap();
        }
        sqlx::query("UPDATE transactions SET categorized_by = 'robot' WHERE id = 'bad'")
            .execute(store.pool())
            .await
            .unwrap();

        let accounts = store.account_ids(&user).await.unwrap();
        let range = DateRange::new(date(2024, 2, 27), date(2024, 3, 5));
        let pool = store.unlinked_transactions(&accounts, range).await.unwrap();
        let ids: Vec<&str> = pool.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["out", "in"]);
    }

    #[tokio::test]
    async fn recurring_link_keeps_type_when_category_type_is_unknown() {
        let (_dir, store, user) = setup().await;
        let subs = category(&store, &user, "Subscriptions").await;
        let rule = RecurringRule {
            id: RecurringRuleId::new("r1"),
            merchant_pattern: "netflix".into(),
            expected_amount: None,
            expected_day: None,
            category_id: Some(subs.clone()),
            frequency: Frequency::Monthly,
            confirmed: true,
            next_expected: None,
            last_matched_at: None,
        };
        save_recurring_rule(store.pool(), &user, &rule).await.unwrap();
        insert_transaction(store.pool(), &tx("nf", "checking", date(2024, 3, 15), -1549, "NETFLIX.COM", None))
            .await
            .unwrap();
        sqlx::query("UPDATE transactions SET type = 'expense' WHERE id = 'nf'")
            .execute(store.pool())
            .await
            .unwrap();

        store
            .link_recurring(&RecurringLink {
                transaction_id: TransactionId::new("nf"),
                recurring_id: RecurringRuleId::new("r1"),
                category_id: Some(subs.clone()),
                transaction_type: None,
            })
            .await
            .unwrap();

        let row = store.transaction(&"nf".into()).await.unwrap().unwrap();
        assert_eq!(row.recurring_id, Some(RecurringRuleId::new("r1")));
        assert_eq!(row.category_id, Some(subs));
        assert_eq!(row.transaction_type, Some(CategoryType::Expense));
    }
}
