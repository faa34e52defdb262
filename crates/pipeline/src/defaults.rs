use serde::{Deserialize, Serialize};
use sift_core::Money;

use crate::config::ConfigError;

/// Which amount signs a default pattern accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountHint {
    Negative,
    Positive,
    #[default]
    Any,
}

impl AmountHint {
    pub fn accepts(self, amount: Money) -> bool {
        match self {
            AmountHint::Negative => amount.is_negative(),
            AmountHint::Positive => amount.is_positive(),
            AmountHint::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultPattern {
    /// Name of the seeded default category this pattern assigns.
    pub category: String,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub amount_hint: AmountHint,
}

impl DefaultPattern {
    pub fn new(category: &str, keywords: &[&str], amount_hint: AmountHint) -> Self {
        DefaultPattern {
            category: category.to_string(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            amount_hint,
        }
    }

    /// `haystacks` must already be lowercased.
    pub fn matches(&self, haystacks: &[&str], amount: Money) -> bool {
        self.amount_hint.accepts(amount)
            && self
                .keywords
                .iter()
                .filter(|k| !k.is_empty())
                .any(|k| haystacks.iter().any(|h| h.contains(k.as_str())))
    }
}

/// Ordered, immutable keyword table consulted after rules and learned mappings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DefaultPatterns {
    patterns: Vec<DefaultPattern>,
}

#[derive(Deserialize)]
struct PatternFile {
    #[serde(default)]
    patterns: Vec<DefaultPattern>,
}

impl DefaultPatterns {
    pub fn new(patterns: Vec<DefaultPattern>) -> Self {
        let patterns = patterns
            .into_iter()
            .map(|mut p| {
                p.keywords = p.keywords.iter().map(|k| k.trim().to_lowercase()).collect();
                p
            })
            .collect();
        Self { patterns }
    }

    pub fn from_toml(toml_content: &str) -> Result<Self, ConfigError> {
        let file: PatternFile = toml::from_str(toml_content)?;
        Ok(Self::new(file.patterns))
    }

    pub fn patterns(&self) -> &[DefaultPattern] {
        &self.patterns
    }

    /// Patterns whose keyword and sign hint both match, in declared order.
    pub fn matching<'a>(
        &'a self,
        haystacks: &'a [&'a str],
        amount: Money,
    ) -> impl Iterator<Item = &'a DefaultPattern> + 'a {
        self.patterns.iter().filter(move |p| p.matches(haystacks, amount))
    }

    /// Names of every category the table can assign, in table order, deduplicated.
    pub fn category_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for pattern in &self.patterns {
            if !names.contains(&pattern.category.as_str()) {
                names.push(&pattern.category);
            }
        }
        names
    }

    pub fn builtin() -> Self {
        use AmountHint::{Any, Negative, Positive};
        Self::new(vec![
            DefaultPattern::new(
                "Income",
                &["payroll", "direct dep", "salary", "paycheck", "dividend", "interest paid"],
                Positive,
            ),
            DefaultPattern::new(
                "Transfer",
                &["online transfer", "transfer to", "transfer from", "xfer"],
                Any,
            ),
            DefaultPattern::new(
                "Groceries",
                &["whole foods", "trader joe", "safeway", "kroger", "aldi", "wegmans", "grocery"],
                Negative,
            ),
            DefaultPattern::new(
                "Dining",
                &["starbucks", "mcdonald", "chipotle", "doordash", "grubhub", "restaurant", "cafe"],
                Negative,
            ),
            DefaultPattern::new(
                "Transportation",
                &[
                    "uber",
                    "lyft",
                    "shell oil",
                    "shell service",
                    "chevron",
                    "exxon",
                    "parking",
                    "transit",
                ],
                Negative,
            ),
            DefaultPattern::new(
                "Subscriptions",
                &["netflix", "spotify", "hulu", "disney+", "youtube premium", "icloud", "patreon"],
                Negative,
            ),
            DefaultPattern::new(
                "Utilities",
                &["electric", "water bill", "comcast", "verizon", "at&t", "t-mobile", "pg&e"],
                Negative,
            ),
            DefaultPattern::new(
                "Housing",
                &["rent payment", "rent pmt", "mortgage", "hoa "],
                Negative,
            ),
            DefaultPattern::new(
                "Insurance",
                &["geico", "state farm", "allstate", "progressive", "insurance"],
                Negative,
            ),
            DefaultPattern::new(
                "Healthcare",
                &["pharmacy", "cvs", "walgreens", "dental", "clinic", "hospital"],
                Negative,
            ),
            DefaultPattern::new(
                "Entertainment",
                &["steam games", "amc theatres", "ticketmaster", "cinema"],
                Negative,
            ),
            DefaultPattern::new(
                "Shopping",
                &["amazon", "amzn", "target", "walmart", "costco", "best buy", "ebay"],
                Negative,
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_hint_checks_sign() {
        assert!(AmountHint::Negative.accepts(Money::from_cents(-100)));
        assert!(!AmountHint::Negative.accepts(Money::from_cents(100)));
        assert!(AmountHint::Positive.accepts(Money::from_cents(100)));
        assert!(!AmountHint::Positive.accepts(Money::zero()));
        assert!(AmountHint::Any.accepts(Money::zero()));
    }

    #[test]
    fn first_declared_pattern_wins() {
        let table = DefaultPatterns::new(vec![
            DefaultPattern::new("Coffee", &["starbucks"], AmountHint::Negative),
            DefaultPattern::new("Dining", &["starbucks"], AmountHint::Negative),
        ]);
        let hit = table.matching(&["starbucks #4521"], Money::from_cents(-550)).next().unwrap();
        assert_eq!(hit.category, "Coffee");
        assert_eq!(table.matching(&["starbucks #4521"], Money::from_cents(-550)).count(), 2);
    }

    #[test]
    fn sign_hint_can_veto_a_keyword_hit() {
        let table = DefaultPatterns::builtin();
        // A refund from Netflix is positive; the subscription pattern wants negative.
        assert!(table.matching(&["netflix.com"], Money::from_cents(1549)).next().is_none());
        let hit = table.matching(&["netflix.com"], Money::from_cents(-1549)).next().unwrap();
        assert_eq!(hit.category, "Subscriptions");
    }

    #[test]
    fn short_keywords_do_not_fire_inside_other_words() {
        let table = DefaultPatterns::builtin();
        let first = |text: &str| {
            table
                .matching(&[text], Money::from_cents(-4500))
                .next()
                .map(|p| p.category.clone())
        };
        for text in ["current account fee", "parentsquare dues", "torrent vpn"] {
            assert_ne!(first(text).as_deref(), Some("Housing"), "{text}");
        }
        assert_ne!(first("shellfish shack").as_deref(), Some("Transportation"));
        assert_eq!(first("rent payment apt 4b").as_deref(), Some("Housing"));
        assert_eq!(first("shell oil 57442").as_deref(), Some("Transportation"));
    }

    #[test]
    fn from_toml_lowercases_keywords_and_defaults_hint() {
        let table = DefaultPatterns::from_toml(
            r#"
            [[patterns]]
            category = "Pets"
            keywords = ["PetSmart", " Chewy "]
            "#,
        )
        .unwrap();
        let pattern = &table.patterns()[0];
        assert_eq!(pattern.keywords, vec!["petsmart", "chewy"]);
        assert_eq!(pattern.amount_hint, AmountHint::Any);
    }

    #[test]
    fn category_names_are_deduplicated_in_order() {
        let table = DefaultPatterns::new(vec![
            DefaultPattern::new("A", &["x"], AmountHint::Any),
            DefaultPattern::new("B", &["y"], AmountHint::Any),
            DefaultPattern::new("A", &["z"], AmountHint::Any),
        ]);
        assert_eq!(table.category_names(), vec!["A", "B"]);
    }

    #[test]
    fn builtin_covers_income_and_transfer() {
        let names = DefaultPatterns::builtin().category_names().join(",");
        assert!(names.contains("Income"));
        assert!(names.contains("Transfer"));
    }

    #[test]
    fn every_builtin_category_is_seeded() {
        for name in DefaultPatterns::builtin().category_names() {
            assert!(
                sift_core::DEFAULT_CATEGORIES.iter().any(|(seeded, _)| *seeded == name),
                "{name} has patterns but is never seeded"
            );
        }
    }
}
