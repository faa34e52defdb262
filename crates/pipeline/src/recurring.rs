//! Recognizing transactions that belong to a known recurring series, and
//! inferring new series from a merchant's history.

use chrono::{Datelike, Duration, Months, NaiveDate, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use sift_core::{
    days_in_month, normalize_merchant, patterns_overlap, Frequency, Money, PipelineStore,
    RecurringLink, RecurringRule, Transaction, UserId,
};

use crate::categorize::CategorizationCache;
use crate::config::PipelineConfig;
use crate::error::PipelineError;

/// Frequency, typical day and typical amount inferred from one merchant's history.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedPattern {
    pub frequency: Frequency,
    pub expected_day: u32,
    pub avg_amount: Money,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecurringCandidate {
    pub merchant_pattern: String,
    pub occurrences: usize,
    pub pattern: DetectedPattern,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecurringReport {
    pub examined: usize,
    pub matched: usize,
    pub failed: usize,
}

pub struct RecurringMatcher {
    relative_tolerance: Decimal,
    absolute_tolerance: Money,
}

impl Default for RecurringMatcher {
    fn default() -> Self {
        Self::new(&PipelineConfig::default())
    }
}

impl RecurringMatcher {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            relative_tolerance: Decimal::from_f64(config.recurring_relative_tolerance)
                .unwrap_or_default(),
            absolute_tolerance: Money::from_cents(config.recurring_absolute_tolerance_cents),
        }
    }

    /// First rule in the given order that fits. No scoring across several eligible rules.
    pub fn match_transaction_to_rule<'r>(
        &self,
        tx: &Transaction,
        rules: &'r [RecurringRule],
    ) -> Option<&'r RecurringRule> {
        self.match_index(tx, rules).map(|i| &rules[i])
    }

    fn match_index(&self, tx: &Transaction, rules: &[RecurringRule]) -> Option<usize> {
        if tx.recurring_id.is_some() {
            return None;
        }
        let merchant = normalize_merchant(tx.merchant_text());
        let description = normalize_merchant(tx.description_text());

        rules.iter().position(|rule| {
            let pattern = normalize_merchant(&rule.merchant_pattern);
            let text_hit =
                patterns_overlap(&pattern, &merchant) || patterns_overlap(&pattern, &description);
            text_hit
                && rule
                    .expected_amount
                    .map_or(true, |expected| self.amount_fits(tx.amount, expected))
        })
    }

    /// Rejects only when the difference exceeds both the relative and the absolute tolerance.
    fn amount_fits(&self, amount: Money, expected: Money) -> bool {
        let diff = amount.magnitude_diff(expected);
        let relative = Money::from_decimal(expected.abs().as_decimal() * self.relative_tolerance);
        !(diff > relative && diff > self.absolute_tolerance)
    }

    /// Links every matching row of the batch to its rule and advances the rule.
    ///
    /// `transactions` is updated in place so later stages see the links.
    pub async fn apply_recurring_matches<S: PipelineStore>(
        &self,
        store: &S,
        user: &UserId,
        transactions: &mut [Transaction],
        cache: &CategorizationCache,
    ) -> Result<RecurringReport, PipelineError> {
        let mut rules = store.active_recurring_rules(user).await?;
        let mut report = RecurringReport::default();
        if rules.is_empty() {
            return Ok(report);
        }

        for tx in transactions.iter_mut() {
            report.examined += 1;
            let Some(index) = self.match_index(tx, &rules) else {
                continue;
            };
            let rule = &mut rules[index];

            let link = RecurringLink {
                transaction_id: tx.id.clone(),
                recurring_id: rule.id.clone(),
                category_id: rule.category_id.clone(),
                transaction_type: rule
                    .category_id
                    .as_ref()
                    .and_then(|id| cache.category_type(id)),
            };
            if let Err(e) = store.link_recurring(&link).await {
                warn!(transaction_id = %tx.id, rule_id = %rule.id, error = %e, "Failed to link recurring match");
                report.failed += 1;
                continue;
            }
            tx.recurring_id = Some(rule.id.clone());
            if let Some(category_id) = link.category_id {
                tx.category_id = Some(category_id);
                if link.transaction_type.is_some() {
                    tx.transaction_type = link.transaction_type;
                }
            }
            report.matched += 1;

            let Some(next) = compute_next_expected(tx.date, rule.frequency, rule.expected_day)
            else {
                continue;
            };
            let now = Utc::now();
            match store.advance_recurring_rule(&rule.id, next, now).await {
                Ok(()) => {
                    rule.next_expected = Some(next);
                    rule.last_matched_at = Some(now);
                    debug!(transaction_id = %tx.id, rule_id = %rule.id, next_expected = %next, "Matched recurring rule");
                }
                Err(e) => {
                    warn!(rule_id = %rule.id, error = %e, "Failed to advance recurring rule");
                    report.failed += 1;
                }
            }
        }

        info!(
            user = %user,
            examined = report.examined,
            matched = report.matched,
            failed = report.failed,
            "Recurring matching finished"
        );
        Ok(report)
    }
}

/// Next date a series should appear after `last`.
///
/// Monthly and quarterly results are pinned to `expected_day`, clamped to the
/// length of the resulting month. Returns `None` only past the calendar's range.
pub fn compute_next_expected(
    last: NaiveDate,
    frequency: Frequency,
    expected_day: Option<u32>,
) -> Option<NaiveDate> {
    match frequency {
        Frequency::Weekly => last.checked_add_signed(Duration::days(7)),
        Frequency::Biweekly => last.checked_add_signed(Duration::days(14)),
        Frequency::Monthly => last
            .checked_add_months(Months::new(1))
            .and_then(|d| pin_day(d, expected_day)),
        Frequency::Quarterly => last
            .checked_add_months(Months::new(3))
            .and_then(|d| pin_day(d, expected_day)),
        Frequency::Annual => last.checked_add_months(Months::new(12)),
    }
}

fn pin_day(date: NaiveDate, expected_day: Option<u32>) -> Option<NaiveDate> {
    match expected_day {
        Some(day) => {
            let last_day = days_in_month(date.year(), date.month());
            date.with_day(day.clamp(1, last_day))
        }
        None => Some(date),
    }
}

/// Infers a series from one merchant's occurrences. Needs at least two.
pub fn detect_recurring_pattern(history: &[Transaction]) -> Option<DetectedPattern> {
    if history.len() < 2 {
        return None;
    }

    let mut dates: Vec<NaiveDate> = history.iter().map(|t| t.date).collect();
    dates.sort();

    let gaps: Vec<i64> = dates.windows(2).map(|w| (w[1] - w[0]).num_days()).collect();
    let avg_gap = gaps.iter().sum::<i64>() as f64 / gaps.len() as f64;
    let frequency = frequency_for_gap(avg_gap)?;

    let mut counts: HashMap<u32, usize> = HashMap::new();
    for date in &dates {
        *counts.entry(date.day()).or_default() += 1;
    }
    let mut expected_day = dates[0].day();
    let mut best = 0;
    for date in &dates {
        let count = counts[&date.day()];
        if count > best {
            best = count;
            expected_day = date.day();
        }
    }

    let total = history
        .iter()
        .fold(Decimal::ZERO, |acc, t| acc + t.amount.abs().as_decimal());
    let avg_amount = Money::from_decimal(total / Decimal::from(history.len()));

    Some(DetectedPattern {
        frequency,
        expected_day,
        avg_amount,
    })
}

fn frequency_for_gap(avg_gap_days: f64) -> Option<Frequency> {
    match avg_gap_days {
        g if g <= 10.0 => Some(Frequency::Weekly),
        g if g <= 18.0 => Some(Frequency::Biweekly),
        g if g <= 45.0 => Some(Frequency::Monthly),
        g if g <= 100.0 => Some(Frequency::Quarterly),
        g if g <= 400.0 => Some(Frequency::Annual),
        _ => None,
    }
}

/// Groups a history by normalized merchant and runs pattern detection on each group.
pub fn detect_recurring_candidates(transactions: &[Transaction]) -> Vec<RecurringCandidate> {
    let mut groups: BTreeMap<String, Vec<Transaction>> = BTreeMap::new();
    for tx in transactions {
        let key = normalize_merchant(tx.merchant_text());
        if key.is_empty() {
            continue;
        }
        groups.entry(key).or_default().push(tx.clone());
    }

    groups
        .into_iter()
        .filter_map(|(merchant_pattern, rows)| {
            let pattern = detect_recurring_pattern(&rows)?;
            Some(RecurringCandidate {
                merchant_pattern,
                occurrences: rows.len(),
                pattern,
            })
        })
        .collect()
}
