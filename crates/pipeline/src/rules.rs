use sift_core::{AmountOperator, CategoryRule, RuleCondition, TextField, TextOperator, Transaction};

/// User rules in evaluation order. The first rule whose conditions all hold wins.
#[derive(Debug, Clone, Default)]
pub struct CategoryRuleEngine {
    rules: Vec<CategoryRule>,
}

impl CategoryRuleEngine {
    /// Rules are kept in the order given; the store already sorts by priority.
    pub fn new(rules: Vec<CategoryRule>) -> Self {
        Self { rules }
    }

    pub(crate) fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn find_matching_rule(&self, tx: &Transaction) -> Option<&CategoryRule> {
        self.rules.iter().find(|rule| rule_matches(rule, tx))
    }
}

/// AND over every condition. A rule without conditions never matches.
pub fn rule_matches(rule: &CategoryRule, tx: &Transaction) -> bool {
    !rule.conditions.is_empty() && rule.conditions.iter().all(|c| condition_matches(c, tx))
}

pub fn condition_matches(condition: &RuleCondition, tx: &Transaction) -> bool {
    match condition {
        RuleCondition::Text {
            field,
            operator,
            value,
        } => {
            if value.is_empty() {
                return false;
            }
            let text = resolve_text(*field, tx).trim().to_lowercase();
            match operator {
                TextOperator::Contains => text.contains(value.as_str()),
                TextOperator::Equals => text == *value,
                TextOperator::StartsWith => text.starts_with(value.as_str()),
            }
        }
        RuleCondition::Amount { operator } => {
            let amount = tx.amount.abs().as_decimal();
            match operator {
                AmountOperator::Equals(v) => amount == *v,
                AmountOperator::GreaterThan(v) => amount > *v,
                AmountOperator::LessThan(v) => amount < *v,
                AmountOperator::Between { low, high } => amount >= *low && amount <= *high,
            }
        }
    }
}

/// Merchant and description stand in for each other when one is missing.
fn resolve_text(field: TextField, tx: &Transaction) -> &str {
    match field {
        TextField::MerchantName => tx.merchant_text(),
        TextField::Description => tx.description_text(),
        TextField::AccountId => tx.account_id.as_str(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use sift_core::{CategoryId, Money, RuleActions};

    fn make_tx(merchant: Option<&str>, desc: &str, amount_cents: i64) -> Transaction {
        Transaction::new(
            "t1",
            "acct-checking",
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            Money::from_cents(amount_cents),
            desc,
            merchant,
        )
    }

    fn make_rule(category: &str, conditions: Vec<RuleCondition>) -> CategoryRule {
        CategoryRule {
            id: format!("rule-{category}"),
            name: "test".to_string(),
            priority: 0,
            conditions,
            category_id: CategoryId::new(category),
            actions: RuleActions::default(),
        }
    }

    fn text(field: TextField, operator: TextOperator, value: &str) -> RuleCondition {
        RuleCondition::text(field, operator, value)
    }

    fn between(low: i64, high: i64) -> RuleCondition {
        RuleCondition::amount(AmountOperator::Between {
            low: Decimal::from(low),
            high: Decimal::from(high),
        })
    }

    #[test]
    fn contains_match_case_insensitive() {
        let cond = text(TextField::MerchantName, TextOperator::Contains, "starbucks");
        assert!(condition_matches(&cond, &make_tx(Some("STARBUCKS #4521"), "POS", -550)));
    }

    #[test]
    fn merchant_field_falls_back_to_description() {
        let cond = text(TextField::MerchantName, TextOperator::Contains, "blue bottle");
        assert!(condition_matches(&cond, &make_tx(None, "SQ *BLUE BOTTLE", -600)));
    }

    #[test]
    fn description_field_falls_back_to_merchant() {
        let cond = text(TextField::Description, TextOperator::Equals, "blue bottle");
        assert!(condition_matches(&cond, &make_tx(Some("Blue Bottle"), "", -600)));
    }

    #[test]
    fn starts_with_and_equals() {
        let tx = make_tx(Some("Amazon Prime"), "AMZN MKTP", -1399);
        assert!(condition_matches(
            &text(TextField::MerchantName, TextOperator::StartsWith, "amazon"),
            &tx
        ));
        assert!(!condition_matches(
            &text(TextField::MerchantName, TextOperator::StartsWith, "prime"),
            &tx
        ));
        assert!(condition_matches(
            &text(TextField::MerchantName, TextOperator::Equals, "AMAZON PRIME"),
            &tx
        ));
        assert!(!condition_matches(
            &text(TextField::MerchantName, TextOperator::Equals, "amazon"),
            &tx
        ));
    }

    #[test]
    fn account_id_is_compared_raw() {
        let cond = text(TextField::AccountId, TextOperator::Equals, "acct-checking");
        assert!(condition_matches(&cond, &make_tx(None, "X", -100)));
    }

    #[test]
    fn between_is_inclusive_on_both_ends() {
        let cond = between(10, 50);
        assert!(condition_matches(&cond, &make_tx(None, "X", -1000)));
        assert!(condition_matches(&cond, &make_tx(None, "X", -5000)));
        assert!(!condition_matches(&cond, &make_tx(None, "X", -999)));
        assert!(!condition_matches(&cond, &make_tx(None, "X", -5001)));
    }

    #[test]
    fn amount_comparisons_use_absolute_value() {
        let gt = RuleCondition::amount(AmountOperator::GreaterThan(Decimal::from(100)));
        let lt = RuleCondition::amount(AmountOperator::LessThan(Decimal::from(100)));
        let outflow = make_tx(None, "X", -15000);
        assert!(condition_matches(&gt, &outflow));
        assert!(!condition_matches(&lt, &outflow));
    }

    #[test]
    fn all_conditions_must_hold() {
        let rule = make_rule(
            "coffee",
            vec![
                text(TextField::MerchantName, TextOperator::Contains, "starbucks"),
                RuleCondition::amount(AmountOperator::LessThan(Decimal::from(20))),
            ],
        );
        assert!(rule_matches(&rule, &make_tx(Some("Starbucks"), "POS", -650)));
        assert!(!rule_matches(&rule, &make_tx(Some("Starbucks"), "POS", -4500)));
    }

    #[test]
    fn rule_without_conditions_never_matches() {
        let rule = make_rule("anything", vec![]);
        assert!(!rule_matches(&rule, &make_tx(Some("Starbucks"), "POS", -650)));
    }

    #[test]
    fn empty_text_value_does_not_match_everything() {
        let cond = text(TextField::Description, TextOperator::Contains, "   ");
        assert!(!condition_matches(&cond, &make_tx(None, "ANYTHING", -100)));
    }

    #[test]
    fn first_matching_rule_in_stored_order_wins() {
        let engine = CategoryRuleEngine::new(vec![
            make_rule("first", vec![text(TextField::Description, TextOperator::Contains, "amazon")]),
            make_rule("second", vec![text(TextField::Description, TextOperator::Contains, "amazon")]),
        ]);
        let rule = engine.find_matching_rule(&make_tx(None, "AMAZON MARKETPLACE", -999)).unwrap();
        assert_eq!(rule.category_id.as_str(), "first");
    }

    #[test]
    fn no_rule_matches() {
        let engine = CategoryRuleEngine::new(vec![make_rule(
            "groceries",
            vec![text(TextField::Description, TextOperator::Contains, "whole foods")],
        )]);
        assert!(engine.find_matching_rule(&make_tx(None, "STARBUCKS", -500)).is_none());
    }
}
