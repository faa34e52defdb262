//! Pairing the outbound and inbound legs of money moved between a user's own accounts.

use std::collections::HashSet;
use tracing::{debug, info, warn};

use sift_core::{
    CategoryId, DateRange, Money, PipelineStore, Transaction, TransactionId, TransferPair, UserId,
};

use crate::config::PipelineConfig;
use crate::error::PipelineError;

/// Name of the seeded category both legs of a transfer are re-stamped with.
pub const TRANSFER_CATEGORY: &str = "Transfer";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub candidates: usize,
    pub pairs: usize,
    /// Legs written successfully; two per fully linked pair.
    pub linked_legs: usize,
    pub failed_legs: usize,
}

pub struct TransferDetector {
    pub date_window_days: i64,
    pub amount_tolerance_cents: i64,
}

impl Default for TransferDetector {
    fn default() -> Self {
        Self {
            date_window_days: 3,
            amount_tolerance_cents: 1,
        }
    }
}

impl TransferDetector {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            date_window_days: config.transfer_window_days,
            amount_tolerance_cents: config.transfer_amount_tolerance_cents,
        }
    }

    /// Greedy single pass: each outflow, in list order, takes the unmatched
    /// inflow with the smallest date gap. Ties go to the inflow seen first.
    /// Every transaction lands in at most one pair.
    pub fn detect_transfer_pairs(&self, transactions: &[Transaction]) -> Vec<TransferPair> {
        let outflows: Vec<&Transaction> =
            transactions.iter().filter(|t| t.amount.is_negative()).collect();
        let inflows: Vec<&Transaction> =
            transactions.iter().filter(|t| t.amount.is_positive()).collect();

        let mut inflow_taken = vec![false; inflows.len()];
        let mut pairs = Vec::new();

        for out in outflows {
            let mut best: Option<(usize, i64)> = None;
            for (idx, inc) in inflows.iter().enumerate() {
                if inflow_taken[idx] {
                    continue;
                }
                let Some(gap) = self.eligible_gap(out, inc) else {
                    continue;
                };
                if best.map_or(true, |(_, best_gap)| gap < best_gap) {
                    best = Some((idx, gap));
                }
            }

            if let Some((idx, _)) = best {
                inflow_taken[idx] = true;
                let inc = inflows[idx];
                pairs.push(TransferPair {
                    outflow_id: out.id.clone(),
                    inflow_id: inc.id.clone(),
                    from_account_id: out.account_id.clone(),
                    to_account_id: inc.account_id.clone(),
                    amount: out.amount.abs(),
                    date: out.date,
                });
            }
        }

        pairs
    }

    /// Date gap in days when `inc` can be the other leg of `out`.
    fn eligible_gap(&self, out: &Transaction, inc: &Transaction) -> Option<i64> {
        if out.account_id == inc.account_id {
            return None;
        }
        let diff = out.amount.magnitude_diff(inc.amount);
        if diff > Money::from_cents(self.amount_tolerance_cents) {
            return None;
        }
        let gap = (out.date - inc.date).num_days().abs();
        (gap <= self.date_window_days).then_some(gap)
    }

    /// Pairs newly landed rows against anything unlinked nearby on any of the
    /// user's accounts, keeping only pairs that involve a new row, and links them.
    pub async fn detect_transfers_for_new_transactions<S: PipelineStore>(
        &self,
        store: &S,
        user: &UserId,
        new_transactions: &[Transaction],
        transfer_category: Option<&CategoryId>,
    ) -> Result<(Vec<TransferPair>, TransferReport), PipelineError> {
        let mut report = TransferReport::default();
        let Some(range) =
            DateRange::spanning(new_transactions.iter().map(|t| t.date), self.date_window_days)
        else {
            return Ok((Vec::new(), report));
        };

        let accounts = store.account_ids(user).await?;
        let pool = store.unlinked_transactions(&accounts, range).await?;
        report.candidates = pool.len();

        let new_ids: HashSet<&TransactionId> = new_transactions.iter().map(|t| &t.id).collect();
        let pairs: Vec<TransferPair> = self
            .detect_transfer_pairs(&pool)
            .into_iter()
            .filter(|p| new_ids.contains(&p.outflow_id) || new_ids.contains(&p.inflow_id))
            .collect();
        report.pairs = pairs.len();

        for pair in &pairs {
            for link in pair.links(transfer_category) {
                match store.link_transfer(&link).await {
                    Ok(()) => report.linked_legs += 1,
                    Err(e) => {
                        // The other leg stays linked; the next run reconciles it.
                        warn!(transaction_id = %link.transaction_id, error = %e, "Failed to link transfer leg");
                        report.failed_legs += 1;
                    }
                }
            }
            debug!(
                outflow_id = %pair.outflow_id,
                inflow_id = %pair.inflow_id,
                amount = %pair.amount,
                "Linked transfer pair"
            );
        }

        info!(
            user = %user,
            window = %range,
            candidates = report.candidates,
            pairs = report.pairs,
            failed_legs = report.failed_legs,
            "Transfer detection finished"
        );
        Ok((pairs, report))
    }
}
