//! An in-process [`PipelineStore`] for embedding the pipeline without a database.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use sift_core::{
    AccountId, CategorizedBy, Category, CategoryRule, CategoryType, ClassificationUpdate,
    DateRange, MerchantMapping, PipelineStore, RecurringLink, RecurringRule, RecurringRuleId,
    StoreError, Transaction, TransactionId, TransferLink, UserId,
};

#[derive(Debug, Default)]
struct State {
    accounts: Vec<(UserId, AccountId)>,
    categories: Vec<(UserId, Category)>,
    rules: Vec<(UserId, CategoryRule)>,
    mappings: Vec<MerchantMapping>,
    recurring: Vec<(UserId, RecurringRule)>,
    transactions: Vec<Transaction>,
    failing_writes: HashSet<TransactionId>,
    fail_reads: bool,
}

impl State {
    fn check_reads(&self) -> Result<(), StoreError> {
        if self.fail_reads {
            return Err(StoreError::Backend("reads disabled".into()));
        }
        Ok(())
    }

    fn check_write(&self, id: &TransactionId) -> Result<(), StoreError> {
        if self.failing_writes.contains(id) {
            return Err(StoreError::Backend(format!("write rejected for {id}")));
        }
        Ok(())
    }

    fn transaction_mut(&mut self, id: &TransactionId) -> Result<&mut Transaction, StoreError> {
        self.transactions
            .iter_mut()
            .find(|t| &t.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {id}")))
    }

    fn owns(&self, user: &UserId, account: &AccountId) -> bool {
        self.accounts.iter().any(|(u, a)| u == user && a == account)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_account(&self, user: &UserId, account: &str) {
        self.state()
            .accounts
            .push((user.clone(), AccountId::new(account)));
    }

    pub fn add_categories(&self, user: &UserId, categories: Vec<Category>) {
        let mut state = self.state();
        state
            .categories
            .extend(categories.into_iter().map(|c| (user.clone(), c)));
    }

    pub fn add_rule(&self, user: &UserId, rule: CategoryRule) {
        self.state().rules.push((user.clone(), rule));
    }

    pub fn add_mapping(&self, mapping: MerchantMapping) {
        self.state().mappings.push(mapping);
    }

    pub fn add_recurring_rule(&self, user: &UserId, rule: RecurringRule) {
        self.state().recurring.push((user.clone(), rule));
    }

    pub fn add_transactions(&self, transactions: Vec<Transaction>) {
        self.state().transactions.extend(transactions);
    }

    pub fn transaction(&self, id: &TransactionId) -> Option<Transaction> {
        self.state().transactions.iter().find(|t| &t.id == id).cloned()
    }

    pub fn recurring_rule(&self, id: &RecurringRuleId) -> Option<RecurringRule> {
        self.state()
            .recurring
            .iter()
            .find(|(_, r)| &r.id == id)
            .map(|(_, r)| r.clone())
    }

    /// Every later write touching `id` fails.
    pub fn fail_writes_for(&self, id: &TransactionId) {
        self.state().failing_writes.insert(id.clone());
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state().fail_reads = fail;
    }
}

impl PipelineStore for MemoryStore {
    async fn active_rules(&self, user: &UserId) -> Result<Vec<CategoryRule>, StoreError> {
        let state = self.state();
        state.check_reads()?;
        let mut rules: Vec<CategoryRule> = state
            .rules
            .iter()
            .filter(|(u, _)| u == user)
            .map(|(_, r)| r.clone())
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(rules)
    }

    async fn merchant_mappings(
        &self,
        user: &UserId,
        min_confidence: f64,
    ) -> Result<Vec<MerchantMapping>, StoreError> {
        let state = self.state();
        state.check_reads()?;
        let mut mappings: Vec<MerchantMapping> = state
            .mappings
            .iter()
            .filter(|m| &m.user_id == user && m.confidence >= min_confidence)
            .cloned()
            .collect();
        mappings.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(mappings)
    }

    async fn categories(&self, user: &UserId) -> Result<Vec<Category>, StoreError> {
        let state = self.state();
        state.check_reads()?;
        Ok(state
            .categories
            .iter()
            .filter(|(u, _)| u == user)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn find_merchant_mapping(
        &self,
        user: &UserId,
        pattern: &str,
    ) -> Result<Option<MerchantMapping>, StoreError> {
        let state = self.state();
        state.check_reads()?;
        Ok(state
            .mappings
            .iter()
            .find(|m| &m.user_id == user && m.pattern == pattern)
            .cloned())
    }

    async fn upsert_merchant_mapping(&self, mapping: &MerchantMapping) -> Result<(), StoreError> {
        let mut state = self.state();
        let position = state
            .mappings
            .iter()
            .position(|m| m.user_id == mapping.user_id && m.pattern == mapping.pattern);
        match position {
            Some(index) => state.mappings[index] = mapping.clone(),
            None => state.mappings.push(mapping.clone()),
        }
        Ok(())
    }

    async fn uncategorized_transactions(
        &self,
        user: &UserId,
        account: Option<&AccountId>,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError> {
        let state = self.state();
        state.check_reads()?;
        let mut rows: Vec<Transaction> = state
            .transactions
            .iter()
            .filter(|t| t.category_id.is_none() && state.owns(user, &t.account_id))
            .filter(|t| account.map_or(true, |a| &t.account_id == a))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.date.cmp(&a.date));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn write_classifications(
        &self,
        updates: &[ClassificationUpdate],
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        for update in updates {
            state.check_write(&update.transaction_id)?;
            state.transaction_mut(&update.transaction_id)?;
        }
        for update in updates {
            update.apply_to(state.transaction_mut(&update.transaction_id)?);
        }
        Ok(())
    }

    async fn active_recurring_rules(&self, user: &UserId) -> Result<Vec<RecurringRule>, StoreError> {
        let state = self.state();
        state.check_reads()?;
        Ok(state
            .recurring
            .iter()
            .filter(|(u, _)| u == user)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn link_recurring(&self, link: &RecurringLink) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check_write(&link.transaction_id)?;
        let tx = state.transaction_mut(&link.transaction_id)?;
        tx.recurring_id = Some(link.recurring_id.clone());
        if let Some(category_id) = &link.category_id {
            tx.category_id = Some(category_id.clone());
            if link.transaction_type.is_some() {
                tx.transaction_type = link.transaction_type;
            }
        }
        Ok(())
    }

    async fn advance_recurring_rule(
        &self,
        id: &RecurringRuleId,
        next_expected: NaiveDate,
        matched_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let (_, rule) = state
            .recurring
            .iter_mut()
            .find(|(_, r)| &r.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("recurring rule {id}")))?;
        rule.next_expected = Some(next_expected);
        rule.last_matched_at = Some(matched_at);
        Ok(())
    }

    async fn account_ids(&self, user: &UserId) -> Result<Vec<AccountId>, StoreError> {
        let state = self.state();
        state.check_reads()?;
        Ok(state
            .accounts
            .iter()
            .filter(|(u, _)| u == user)
            .map(|(_, a)| a.clone())
            .collect())
    }

    async fn unlinked_transactions(
        &self,
        accounts: &[AccountId],
        range: DateRange,
    ) -> Result<Vec<Transaction>, StoreError> {
        let state = self.state();
        state.check_reads()?;
        let mut rows: Vec<Transaction> = state
            .transactions
            .iter()
            .filter(|t| {
                t.to_account_id.is_none()
                    && accounts.contains(&t.account_id)
                    && range.contains(t.date)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn link_transfer(&self, link: &TransferLink) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check_write(&link.transaction_id)?;
        let tx = state.transaction_mut(&link.transaction_id)?;
        tx.to_account_id = Some(link.counterpart_account_id.clone());
        if let Some(category_id) = &link.category_id {
            tx.category_id = Some(category_id.clone());
            tx.categorized_by = Some(CategorizedBy::Transfer);
            tx.transaction_type = Some(CategoryType::Transfer);
            tx.review_flagged = false;
            tx.review_flagged_reason = None;
        }
        Ok(())
    }
}
