use tracing::{info, warn};

use sift_core::{
    AccountId, CategoryId, MerchantMapping, PipelineStore, Transaction, TransferPair, UserId,
};

use crate::categorize::{write_in_chunks, BulkReport, CategorizationCache, CategorizedBatch, Categorizer};
use crate::config::PipelineConfig;
use crate::defaults::DefaultPatterns;
use crate::error::PipelineError;
use crate::recurring::{RecurringMatcher, RecurringReport};
use crate::transfer::{TransferDetector, TransferReport, TRANSFER_CATEGORY};

/// Outcome of one pass over a newly landed batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub categorization: BulkReport,
    /// `None` when the stage could not read its rules and was skipped.
    pub recurring: Option<RecurringReport>,
    /// `None` when the stage could not read its candidate pool and was skipped.
    pub transfers: Option<TransferReport>,
    pub transfer_pairs: Vec<TransferPair>,
}

/// Orchestrates: categorize → recurring-match → transfer-detect.
///
/// Transfer detection runs last because its category stamp overrides whatever
/// the first two stages decided.
pub struct TransactionPipeline<S: PipelineStore> {
    store: S,
    categorizer: Categorizer,
    recurring: RecurringMatcher,
    transfers: TransferDetector,
}

impl<S: PipelineStore> TransactionPipeline<S> {
    pub fn new(store: S, config: PipelineConfig, patterns: DefaultPatterns) -> Self {
        Self {
            recurring: RecurringMatcher::new(&config),
            transfers: TransferDetector::new(&config),
            categorizer: Categorizer::new(patterns, config),
            store,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        self.categorizer.config()
    }

    pub fn categorizer(&self) -> &Categorizer {
        &self.categorizer
    }

    /// Runs all three stages over rows that have already been persisted.
    ///
    /// Only a failed cache prefetch is fatal. Later stages that cannot start
    /// are logged and skipped so the categorization result still stands.
    pub async fn process_new_batch(
        &self,
        user: &UserId,
        mut transactions: Vec<Transaction>,
    ) -> Result<BatchReport, PipelineError> {
        let mut report = BatchReport::default();
        if transactions.is_empty() {
            return Ok(report);
        }
        let config = self.categorizer.config();

        // 1. Prefetch everything the cascade reads.
        let cache = CategorizationCache::load(&self.store, user, config).await?;

        // 2. Categorize against the shared cache and write back in chunks.
        let CategorizedBatch { updates, report: mut categorization } =
            self.categorizer.categorize_batch(&transactions, &cache);
        categorization.failed_writes =
            write_in_chunks(&self.store, &updates, config.write_chunk_size).await;
        for (tx, update) in transactions.iter_mut().zip(&updates) {
            update.apply_to(tx);
        }
        report.categorization = categorization;

        // 3. Link rows to recurring series.
        match self
            .recurring
            .apply_recurring_matches(&self.store, user, &mut transactions, &cache)
            .await
        {
            Ok(recurring) => report.recurring = Some(recurring),
            Err(e) => warn!(user = %user, error = %e, "Skipping recurring matching"),
        }

        // 4. Pair transfer legs, re-stamping both with the seeded transfer category.
        let transfer_category: Option<&CategoryId> = cache.default_category(TRANSFER_CATEGORY);
        match self
            .transfers
            .detect_transfers_for_new_transactions(&self.store, user, &transactions, transfer_category)
            .await
        {
            Ok((pairs, transfers)) => {
                report.transfers = Some(transfers);
                report.transfer_pairs = pairs;
            }
            Err(e) => warn!(user = %user, error = %e, "Skipping transfer detection"),
        }

        info!(
            user = %user,
            transactions = transactions.len(),
            flagged = report.categorization.flagged,
            recurring_matched = report.recurring.as_ref().map_or(0, |r| r.matched),
            transfer_pairs = report.transfer_pairs.len(),
            "Processed transaction batch"
        );
        Ok(report)
    }

    /// Runs a full pass over one page of the user's uncategorized rows.
    pub async fn process_pending(
        &self,
        user: &UserId,
        account: Option<&AccountId>,
    ) -> Result<BatchReport, PipelineError> {
        let pending = self
            .store
            .uncategorized_transactions(user, account, self.config().uncategorized_page_size)
            .await?;
        self.process_new_batch(user, pending).await
    }

    /// Categorization only, without recurring or transfer linkage.
    pub async fn bulk_categorize(
        &self,
        user: &UserId,
        account: Option<&AccountId>,
    ) -> Result<BulkReport, PipelineError> {
        self.categorizer.bulk_categorize(&self.store, user, account).await
    }

    pub async fn apply_manual_override(
        &self,
        user: &UserId,
        tx: &Transaction,
        category_id: &CategoryId,
    ) -> Result<MerchantMapping, PipelineError> {
        self.categorizer
            .apply_manual_override(&self.store, user, tx, category_id)
            .await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chrono::NaiveDate;
    use sift_core::{
        CategorizedBy, Category, CategoryType, Frequency, Money, RecurringRule, RecurringRuleId,
    };

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn seeded(id: &str, name: &str, kind: CategoryType) -> Category {
        Category {
            id: CategoryId::new(id),
            name: name.to_string(),
            category_type: kind,
            is_default: true,
        }
    }

    fn household() -> (MemoryStore, UserId) {
        let user = UserId::new("household");
        let store = MemoryStore::new();
        store.add_account(&user, "checking");
        store.add_account(&user, "savings");
        store.add_categories(
            &user,
            vec![
                seeded("cat-income", "Income", CategoryType::Income),
                seeded("cat-transfer", "Transfer", CategoryType::Transfer),
                seeded("cat-subs", "Subscriptions", CategoryType::Expense),
            ],
        );
        (store, user)
    }

    fn pipeline(store: MemoryStore) -> TransactionPipeline<MemoryStore> {
        TransactionPipeline::new(store, PipelineConfig::default(), DefaultPatterns::builtin())
    }

    #[tokio::test]
    async fn transfer_detection_overrides_earlier_categories() {
        let (store, user) = household();
        let outflow = Transaction::new(
            "move-out",
            "checking",
            date(2024, 3, 1),
            Money::from_cents(-20000),
            "MOBILE BANKING PAYMENT",
            None,
        );
        let inflow = Transaction::new(
            "move-in",
            "savings",
            date(2024, 3, 2),
            Money::from_cents(20000),
            "DEPOSIT",
            None,
        );
        store.add_transactions(vec![outflow.clone(), inflow.clone()]);

        let pipeline = pipeline(store);
        let report = pipeline
            .process_new_batch(&user, vec![outflow, inflow])
            .await
            .unwrap();

        // The deposit first falls back to Income, the payment goes unmatched.
        assert_eq!(report.categorization.suggested, 1);
        assert_eq!(report.categorization.flagged, 1);
        assert_eq!(report.transfer_pairs.len(), 1);

        for id in ["move-out", "move-in"] {
            let row = pipeline.store().transaction(&id.into()).unwrap();
            assert_eq!(row.category_id, Some(CategoryId::new("cat-transfer")));
            assert_eq!(row.categorized_by, Some(CategorizedBy::Transfer));
            assert_eq!(row.transaction_type, Some(CategoryType::Transfer));
            assert!(!row.review_flagged);
            assert!(row.to_account_id.is_some());
        }
    }

    #[tokio::test]
    async fn recurring_stage_sees_fresh_categories() {
        let (store, user) = household();
        store.add_recurring_rule(
            &user,
            RecurringRule {
                id: RecurringRuleId::new("netflix"),
                merchant_pattern: "netflix".into(),
                expected_amount: Some(Money::from_cents(-1549)),
                expected_day: Some(15),
                category_id: Some(CategoryId::new("cat-subs")),
                frequency: Frequency::Monthly,
                confirmed: true,
                next_expected: Some(date(2024, 3, 15)),
                last_matched_at: None,
            },
        );
        let charge = Transaction::new(
            "nf",
            "checking",
            date(2024, 3, 14),
            Money::from_cents(-1549),
            "NETFLIX.COM",
            Some("Netflix"),
        );
        store.add_transactions(vec![charge.clone()]);

        let pipeline = pipeline(store);
        let report = pipeline.process_new_batch(&user, vec![charge]).await.unwrap();
        assert_eq!(report.recurring.map(|r| r.matched), Some(1));

        let row = pipeline.store().transaction(&"nf".into()).unwrap();
        assert_eq!(row.categorized_by, Some(CategorizedBy::Default));
        assert_eq!(row.recurring_id, Some(RecurringRuleId::new("netflix")));
        let rule = pipeline.store().recurring_rule(&RecurringRuleId::new("netflix")).unwrap();
        assert_eq!(rule.next_expected, Some(date(2024, 4, 15)));
    }

    #[tokio::test]
    async fn prefetch_failure_is_fatal() {
        let (store, user) = household();
        store.fail_reads(true);
        let tx = Transaction::new(
            "t1",
            "checking",
            date(2024, 3, 1),
            Money::from_cents(-500),
            "CARD PURCHASE",
            None,
        );
        let err = pipeline(store).process_new_batch(&user, vec![tx]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Prefetch(_)));
    }

    #[tokio::test]
    async fn failed_transfer_leg_does_not_fail_the_batch() {
        let (store, user) = household();
        let out = Transaction::new("o", "checking", date(2024, 3, 1), Money::from_cents(-7500), "XFER", None);
        let inc = Transaction::new("i", "savings", date(2024, 3, 1), Money::from_cents(7500), "XFER", None);
        store.add_transactions(vec![out, inc]);
        store.fail_writes_for(&"i".into());

        let pipeline = pipeline(store);
        let report = pipeline.process_pending(&user, None).await.unwrap();

        let transfers = report.transfers.unwrap();
        assert_eq!(transfers.linked_legs, 1);
        assert_eq!(transfers.failed_legs, 1);
        // The failing row's categorization chunk was rejected too.
        assert!(report.categorization.failed_writes > 0);
        let linked = pipeline.store().transaction(&"o".into()).unwrap();
        assert_eq!(linked.to_account_id.map(|a| a.0), Some("savings".to_string()));
    }

    #[tokio::test]
    async fn empty_batch_touches_nothing() {
        let (store, user) = household();
        store.fail_reads(true);
        let report = pipeline(store).process_new_batch(&user, Vec::new()).await.unwrap();
        assert!(report.transfer_pairs.is_empty());
        assert!(report.recurring.is_none());
    }
}
