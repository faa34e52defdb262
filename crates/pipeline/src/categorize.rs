//! The categorization cascade: user rule, learned mapping, default pattern,
//! then the positive-amount income fallback. First success wins.

use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sift_core::{
    normalize_merchant, patterns_overlap, AccountId, CategorizedBy, Category, CategoryId,
    CategoryRule, CategoryType, ClassificationUpdate, MerchantMapping, PipelineStore, RuleActions,
    StoreError, Transaction, UserId,
};

use crate::config::PipelineConfig;
use crate::defaults::DefaultPatterns;
use crate::error::{CategorizeError, PipelineError};
use crate::rules::CategoryRuleEngine;

/// Name of the seeded category used by the positive-amount fallback.
pub const INCOME_CATEGORY: &str = "Income";

/// Everything the cascade reads, fetched once per batch and then held read-only.
#[derive(Debug, Clone, Default)]
pub struct CategorizationCache {
    rules: CategoryRuleEngine,
    mappings: Vec<MerchantMapping>,
    default_categories: HashMap<String, CategoryId>,
    category_types: HashMap<CategoryId, CategoryType>,
}

impl CategorizationCache {
    /// Drops mappings under `min_confidence` and orders the rest highest first.
    pub fn new(
        rules: Vec<CategoryRule>,
        mappings: Vec<MerchantMapping>,
        categories: Vec<Category>,
        min_confidence: f64,
    ) -> Self {
        let mut mappings: Vec<MerchantMapping> = mappings
            .into_iter()
            .filter(|m| m.confidence >= min_confidence)
            .collect();
        mappings.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut default_categories = HashMap::new();
        let mut category_types = HashMap::new();
        for category in categories {
            if category.is_default {
                default_categories
                    .entry(category.name.trim().to_lowercase())
                    .or_insert_with(|| category.id.clone());
            }
            category_types.insert(category.id, category.category_type);
        }

        Self {
            rules: CategoryRuleEngine::new(rules),
            mappings,
            default_categories,
            category_types,
        }
    }

    /// Any failure here is fatal for the whole batch.
    pub async fn load<S: PipelineStore>(
        store: &S,
        user: &UserId,
        config: &PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let rules = store.active_rules(user).await.map_err(PipelineError::Prefetch)?;
        let mappings = store
            .merchant_mappings(user, config.learned_min_confidence)
            .await
            .map_err(PipelineError::Prefetch)?;
        let categories = store.categories(user).await.map_err(PipelineError::Prefetch)?;

        let cache = Self::new(rules, mappings, categories, config.learned_min_confidence);
        debug!(
            user = %user,
            rules = cache.rules.len(),
            mappings = cache.mappings.len(),
            categories = cache.category_types.len(),
            "Loaded categorization cache"
        );
        Ok(cache)
    }

    /// Seeded category id by case-insensitive name.
    pub fn default_category(&self, name: &str) -> Option<&CategoryId> {
        self.default_categories.get(&name.trim().to_lowercase())
    }

    pub fn category_type(&self, id: &CategoryId) -> Option<CategoryType> {
        self.category_types.get(id).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryDecision {
    pub category_id: CategoryId,
    pub method: CategorizedBy,
    pub confidence: Option<f64>,
    pub transaction_type: CategoryType,
    pub actions: RuleActions,
}

impl CategoryDecision {
    /// Rule hits are confirmed outright; every other method asks for review.
    pub fn to_update(&self, tx: &Transaction) -> ClassificationUpdate {
        let confirmed = self.method == CategorizedBy::Rule;
        let tags = if self.actions.tags.is_empty() {
            None
        } else {
            let mut merged = tx.tags.clone();
            for tag in &self.actions.tags {
                if !merged.contains(tag) {
                    merged.push(tag.clone());
                }
            }
            Some(merged)
        };

        ClassificationUpdate {
            transaction_id: tx.id.clone(),
            category_id: Some(self.category_id.clone()),
            categorized_by: Some(self.method),
            transaction_type: Some(self.transaction_type),
            confidence: self.confidence,
            category_confirmed: confirmed,
            review_flagged: !confirmed,
            review_flagged_reason: (!confirmed)
                .then(|| format!("Category suggested by {} match", self.method)),
            ignored: self.actions.ignore.then_some(true),
            merchant_name: self.actions.rename_merchant.clone(),
            tags,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub scanned: usize,
    pub rule_matched: usize,
    /// Learned, default and fallback matches awaiting review.
    pub suggested: usize,
    /// No match, or a per-transaction failure.
    pub flagged: usize,
    pub errors: usize,
    pub failed_writes: usize,
}

/// Updates for a batch, in input order, plus the tallies that produced them.
#[derive(Debug, Clone, Default)]
pub struct CategorizedBatch {
    pub updates: Vec<ClassificationUpdate>,
    pub report: BulkReport,
}

pub struct Categorizer {
    patterns: DefaultPatterns,
    config: PipelineConfig,
}

impl Categorizer {
    pub fn new(patterns: DefaultPatterns, config: PipelineConfig) -> Self {
        Self { patterns, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn patterns(&self) -> &DefaultPatterns {
        &self.patterns
    }

    /// Runs the cascade. `Ok(None)` means uncategorized, which is not an error.
    pub fn categorize(
        &self,
        tx: &Transaction,
        cache: &CategorizationCache,
    ) -> Result<Option<CategoryDecision>, CategorizeError> {
        if let Some(rule) = cache.rules.find_matching_rule(tx) {
            return decide(cache, &rule.category_id, CategorizedBy::Rule, None, rule.actions.clone())
                .map(Some);
        }

        let merchant = normalize_merchant(tx.merchant_text());
        if let Some(mapping) = cache
            .mappings
            .iter()
            .find(|m| patterns_overlap(&m.pattern, &merchant))
        {
            return decide(
                cache,
                &mapping.category_id,
                CategorizedBy::Learned,
                Some(mapping.confidence),
                RuleActions::default(),
            )
            .map(Some);
        }

        let description = tx.description_text().to_lowercase();
        let haystacks = [merchant.as_str(), description.as_str()];
        let default_hit = self
            .patterns
            .matching(&haystacks, tx.amount)
            .find_map(|p| cache.default_category(&p.category));
        if let Some(category_id) = default_hit {
            return decide(
                cache,
                category_id,
                CategorizedBy::Default,
                Some(self.config.default_match_confidence),
                RuleActions::default(),
            )
            .map(Some);
        }

        if tx.amount.is_positive() {
            if let Some(income) = cache.default_category(INCOME_CATEGORY) {
                return decide(
                    cache,
                    income,
                    CategorizedBy::Fallback,
                    Some(self.config.income_fallback_confidence),
                    RuleActions::default(),
                )
                .map(Some);
            }
        }

        Ok(None)
    }

    /// Categorizes every row against one cache. Failures stay local to their row.
    pub fn categorize_batch(
        &self,
        transactions: &[Transaction],
        cache: &CategorizationCache,
    ) -> CategorizedBatch {
        let mut batch = CategorizedBatch::default();
        for tx in transactions {
            batch.report.scanned += 1;
            let update = match self.categorize(tx, cache) {
                Ok(Some(decision)) => {
                    if decision.method == CategorizedBy::Rule {
                        batch.report.rule_matched += 1;
                    } else {
                        batch.report.suggested += 1;
                    }
                    debug!(
                        transaction_id = %tx.id,
                        category_id = %decision.category_id,
                        method = %decision.method,
                        "Categorized transaction"
                    );
                    decision.to_update(tx)
                }
                Ok(None) => {
                    batch.report.flagged += 1;
                    ClassificationUpdate::flagged(tx.id.clone(), "No matching category")
                }
                Err(e) => {
                    warn!(transaction_id = %tx.id, error = %e, "Categorization failed");
                    batch.report.flagged += 1;
                    batch.report.errors += 1;
                    ClassificationUpdate::flagged(tx.id.clone(), format!("Categorization failed: {e}"))
                }
            };
            batch.updates.push(update);
        }
        batch
    }

    /// Categorizes one page of the user's uncategorized rows, newest first.
    pub async fn bulk_categorize<S: PipelineStore>(
        &self,
        store: &S,
        user: &UserId,
        account: Option<&AccountId>,
    ) -> Result<BulkReport, PipelineError> {
        let cache = CategorizationCache::load(store, user, &self.config).await?;
        let transactions = store
            .uncategorized_transactions(user, account, self.config.uncategorized_page_size)
            .await?;

        let CategorizedBatch { updates, mut report } = self.categorize_batch(&transactions, &cache);
        report.failed_writes = write_in_chunks(store, &updates, self.config.write_chunk_size).await;

        info!(
            user = %user,
            scanned = report.scanned,
            rule_matched = report.rule_matched,
            suggested = report.suggested,
            flagged = report.flagged,
            failed_writes = report.failed_writes,
            "Bulk categorization finished"
        );
        Ok(report)
    }

    /// Strengthens (or creates) the learned mapping for the transaction's merchant.
    pub async fn learn_from_override<S: PipelineStore>(
        &self,
        store: &S,
        user: &UserId,
        tx: &Transaction,
        category_id: &CategoryId,
    ) -> Result<MerchantMapping, PipelineError> {
        let pattern = normalize_merchant(tx.merchant_text());
        if pattern.is_empty() {
            return Err(PipelineError::NothingToLearn(tx.id.clone()));
        }

        let mapping = match store.find_merchant_mapping(user, &pattern).await? {
            Some(mut existing) => {
                existing.confidence = reinforce(existing.confidence, self.config.learning_rate);
                existing.confirmation_count += 1;
                existing.category_id = category_id.clone();
                existing.updated_at = Some(Utc::now());
                existing
            }
            None => MerchantMapping {
                id: Uuid::new_v4().to_string(),
                user_id: user.clone(),
                pattern,
                category_id: category_id.clone(),
                confidence: self.config.learned_initial_confidence,
                confirmation_count: 1,
                updated_at: Some(Utc::now()),
            },
        };

        store.upsert_merchant_mapping(&mapping).await?;
        debug!(
            pattern = %mapping.pattern,
            confidence = mapping.confidence,
            confirmations = mapping.confirmation_count,
            "Learned merchant mapping"
        );
        Ok(mapping)
    }

    /// Records a user's category choice on the row, then feeds it to the learning loop.
    pub async fn apply_manual_override<S: PipelineStore>(
        &self,
        store: &S,
        user: &UserId,
        tx: &Transaction,
        category_id: &CategoryId,
    ) -> Result<MerchantMapping, PipelineError> {
        let category_type = store
            .categories(user)
            .await?
            .into_iter()
            .find(|c| &c.id == category_id)
            .map(|c| c.category_type)
            .ok_or_else(|| StoreError::NotFound(format!("category {category_id}")))?;

        let update = ClassificationUpdate {
            transaction_id: tx.id.clone(),
            category_id: Some(category_id.clone()),
            categorized_by: Some(CategorizedBy::Manual),
            transaction_type: Some(category_type),
            confidence: None,
            category_confirmed: true,
            review_flagged: false,
            review_flagged_reason: None,
            ignored: None,
            merchant_name: None,
            tags: None,
        };
        store.write_classifications(&[update]).await?;

        self.learn_from_override(store, user, tx, category_id).await
    }
}

/// One confirmation's worth of movement toward 1.0, with diminishing returns.
pub fn reinforce(confidence: f64, rate: f64) -> f64 {
    (confidence + rate * (1.0 - confidence)).min(1.0)
}

fn decide(
    cache: &CategorizationCache,
    category_id: &CategoryId,
    method: CategorizedBy,
    confidence: Option<f64>,
    actions: RuleActions,
) -> Result<CategoryDecision, CategorizeError> {
    let transaction_type = cache
        .category_type(category_id)
        .ok_or_else(|| CategorizeError::UnknownCategory(category_id.clone()))?;
    Ok(CategoryDecision {
        category_id: category_id.clone(),
        method,
        confidence,
        transaction_type,
        actions,
    })
}

/// Writes `updates` in chunks, continuing past failed chunks.
/// Returns how many rows could not be written.
pub(crate) async fn write_in_chunks<S: PipelineStore>(
    store: &S,
    updates: &[ClassificationUpdate],
    chunk_size: usize,
) -> usize {
    let mut failed = 0;
    for (index, chunk) in updates.chunks(chunk_size.max(1)).enumerate() {
        if let Err(e) = store.write_classifications(chunk).await {
            warn!(chunk = index, rows = chunk.len(), error = %e, "Failed to write classification chunk");
            failed += chunk.len();
        }
    }
    failed
}
