use sift_core::{
    AccountId, CategoryId, RawCondition, RecurringRule, RuleActions, Transaction, UserId,
    DEFAULT_CATEGORIES,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite,
};
use std::path::Path;
use uuid::Uuid;

use crate::error::StorageError;

pub type DbPool = Pool<Sqlite>;

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA cache_size = -32000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            category_type TEXT NOT NULL,
            is_default INTEGER NOT NULL DEFAULT 0,
            UNIQUE (user_id, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // `conditions` holds a JSON list; rows written before it existed use the
    // single-condition columns instead.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS category_rules (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            conditions TEXT,
            field TEXT,
            operator TEXT,
            value TEXT,
            value_end TEXT,
            category_id TEXT NOT NULL,
            actions TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (category_id) REFERENCES categories(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS merchant_mappings (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            pattern TEXT NOT NULL,
            category_id TEXT NOT NULL,
            confidence REAL NOT NULL,
            confirmation_count INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            UNIQUE (user_id, pattern),
            FOREIGN KEY (category_id) REFERENCES categories(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recurring_rules (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            merchant_pattern TEXT NOT NULL,
            expected_amount_cents INTEGER,
            expected_day INTEGER,
            category_id TEXT,
            frequency TEXT NOT NULL,
            confirmed INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            next_expected TEXT,
            last_matched_at TEXT,
            FOREIGN KEY (category_id) REFERENCES categories(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            date TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            merchant_name TEXT,
            category_id TEXT,
            categorized_by TEXT,
            type TEXT,
            confidence REAL,
            category_confirmed INTEGER NOT NULL DEFAULT 0,
            review_flagged INTEGER NOT NULL DEFAULT 0,
            review_flagged_reason TEXT,
            ignored INTEGER NOT NULL DEFAULT 0,
            tags TEXT NOT NULL DEFAULT '[]',
            recurring_id TEXT,
            to_account_id TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (account_id) REFERENCES accounts(id),
            FOREIGN KEY (category_id) REFERENCES categories(id),
            FOREIGN KEY (recurring_id) REFERENCES recurring_rules(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_transactions_account_date ON transactions (account_id, date)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Inserts the standard category set for `user`. Safe to call repeatedly.
pub async fn seed_default_categories(pool: &DbPool, user: &UserId) -> Result<(), sqlx::Error> {
    for (name, category_type) in DEFAULT_CATEGORIES {
        sqlx::query(
            "INSERT OR IGNORE INTO categories (id, user_id, name, category_type, is_default) VALUES (?, ?, ?, ?, 1)"
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user.as_str())
        .bind(*name)
        .bind(category_type.as_str())
        .execute(pool)
        .await?;
    }

    Ok(())
}

pub async fn insert_account(
    pool: &DbPool,
    user: &UserId,
    account: &AccountId,
    name: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO accounts (id, user_id, name) VALUES (?, ?, ?)")
        .bind(account.as_str())
        .bind(user.as_str())
        .bind(name)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn find_category_id(
    pool: &DbPool,
    user: &UserId,
    name: &str,
) -> Result<Option<CategoryId>, sqlx::Error> {
    let id = sqlx::query_scalar::<_, String>(
        "SELECT id FROM categories WHERE user_id = ? AND name = ? COLLATE NOCASE",
    )
    .bind(user.as_str())
    .bind(name)
    .fetch_optional(pool)
    .await?;
    Ok(id.map(CategoryId))
}

/// Stores a rule in the list-of-conditions shape.
pub async fn save_category_rule(
    pool: &DbPool,
    user: &UserId,
    name: &str,
    priority: i32,
    conditions: &[RawCondition],
    category_id: &CategoryId,
    actions: &RuleActions,
) -> Result<String, StorageError> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO category_rules (id, user_id, name, priority, conditions, category_id, actions) VALUES (?, ?, ?, ?, ?, ?, ?)"
    )
    .bind(&id)
    .bind(user.as_str())
    .bind(name)
    .bind(priority)
    .bind(serde_json::to_string(conditions)?)
    .bind(category_id.as_str())
    .bind(serde_json::to_string(actions)?)
    .execute(pool)
    .await?;
    Ok(id)
}

pub async fn save_recurring_rule(
    pool: &DbPool,
    user: &UserId,
    rule: &RecurringRule,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO recurring_rules
            (id, user_id, merchant_pattern, expected_amount_cents, expected_day, category_id,
             frequency, confirmed, next_expected, last_matched_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(rule.id.as_str())
    .bind(user.as_str())
    .bind(&rule.merchant_pattern)
    .bind(rule.expected_amount.map(|m| m.to_cents()))
    .bind(rule.expected_day.map(i64::from))
    .bind(rule.category_id.as_ref().map(|c| c.as_str()))
    .bind(rule.frequency.as_str())
    .bind(rule.confirmed)
    .bind(rule.next_expected)
    .bind(rule.last_matched_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Persists a freshly ingested row. Classification columns start empty.
pub async fn insert_transaction(pool: &DbPool, tx: &Transaction) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO transactions (id, account_id, date, amount_cents, description, merchant_name, tags)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(tx.id.as_str())
    .bind(tx.account_id.as_str())
    .bind(tx.date)
    .bind(tx.amount.to_cents())
    .bind(&tx.description)
    .bind(&tx.merchant_name)
    .bind(serde_json::to_string(&tx.tags)?)
    .execute(pool)
    .await?;
    Ok(())
}
