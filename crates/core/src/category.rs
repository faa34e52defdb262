use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CategoryId(pub String);

impl CategoryId {
    pub fn new(id: impl Into<String>) -> Self {
        CategoryId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryType {
    Income,
    Expense,
    Transfer,
}

impl CategoryType {
    pub fn as_str(self) -> &'static str {
        match self {
            CategoryType::Income => "income",
            CategoryType::Expense => "expense",
            CategoryType::Transfer => "transfer",
        }
    }
}

impl fmt::Display for CategoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CategoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "income" => Ok(CategoryType::Income),
            "expense" => Ok(CategoryType::Expense),
            "transfer" => Ok(CategoryType::Transfer),
            other => Err(format!("Unknown category type: '{other}'")),
        }
    }
}

/// Categories seeded for every new user, in display order.
pub const DEFAULT_CATEGORIES: &[(&str, CategoryType)] = &[
    ("Income", CategoryType::Income),
    ("Transfer", CategoryType::Transfer),
    ("Groceries", CategoryType::Expense),
    ("Dining", CategoryType::Expense),
    ("Transportation", CategoryType::Expense),
    ("Subscriptions", CategoryType::Expense),
    ("Utilities", CategoryType::Expense),
    ("Housing", CategoryType::Expense),
    ("Insurance", CategoryType::Expense),
    ("Healthcare", CategoryType::Expense),
    ("Entertainment", CategoryType::Expense),
    ("Shopping", CategoryType::Expense),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    pub category_type: CategoryType,
    /// Seeded categories that default patterns and fallbacks resolve by name.
    pub is_default: bool,
}

/// Text-valued fields a rule condition can inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextField {
    MerchantName,
    Description,
    AccountId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextOperator {
    Contains,
    Equals,
    StartsWith,
}

/// Comparisons against the absolute transaction amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountOperator {
    Equals(Decimal),
    GreaterThan(Decimal),
    LessThan(Decimal),
    /// Inclusive on both ends.
    Between { low: Decimal, high: Decimal },
}

/// A single normalized rule condition. Text values are stored lowercased.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    Text {
        field: TextField,
        operator: TextOperator,
        value: String,
    },
    Amount {
        operator: AmountOperator,
    },
}

impl RuleCondition {
    pub fn text(field: TextField, operator: TextOperator, value: &str) -> Self {
        RuleCondition::Text {
            field,
            operator,
            value: value.trim().to_lowercase(),
        }
    }

    pub fn amount(operator: AmountOperator) -> Self {
        RuleCondition::Amount { operator }
    }
}

/// Side effects a matching rule applies on top of the category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleActions {
    #[serde(default)]
    pub ignore: bool,
    #[serde(default)]
    pub rename_merchant: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub id: String,
    pub name: String,
    pub priority: i32,
    /// AND-combined. Never empty once normalized.
    pub conditions: Vec<RuleCondition>,
    pub category_id: CategoryId,
    #[serde(default)]
    pub actions: RuleActions,
}

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("Rule has no conditions")]
    Empty,
    #[error("Unknown condition field: '{0}'")]
    UnknownField(String),
    #[error("Unknown condition operator: '{0}'")]
    UnknownOperator(String),
    #[error("Operator '{operator}' is not supported on field '{field}'")]
    Unsupported { field: String, operator: String },
    #[error("Invalid numeric condition value: '{0}'")]
    InvalidNumber(String),
    #[error("Malformed conditions list: {0}")]
    Json(#[from] serde_json::Error),
}

/// One condition in the shape rules are persisted in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCondition {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub value_end: Option<serde_json::Value>,
}

/// The single-condition columns older rule rows carry instead of a list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyCondition {
    pub field: Option<String>,
    pub operator: Option<String>,
    pub value: Option<String>,
    pub value_end: Option<String>,
}

/// Normalizes either stored rule shape into a non-empty condition list.
///
/// A present, non-blank `conditions_json` list wins; otherwise the legacy
/// single-field columns become a one-element list.
pub fn normalize_conditions(
    conditions_json: Option<&str>,
    legacy: &LegacyCondition,
) -> Result<Vec<RuleCondition>, ConditionError> {
    if let Some(json) = conditions_json.map(str::trim).filter(|j| !j.is_empty() && *j != "null") {
        let raw: Vec<RawCondition> = serde_json::from_str(json)?;
        if !raw.is_empty() {
            return raw.iter().map(parse_condition).collect();
        }
    }

    match (&legacy.field, &legacy.operator) {
        (Some(field), Some(operator)) => {
            let raw = RawCondition {
                field: field.clone(),
                operator: operator.clone(),
                value: legacy
                    .value
                    .clone()
                    .map(serde_json::Value::String)
                    .unwrap_or_default(),
                value_end: legacy.value_end.clone().map(serde_json::Value::String),
            };
            Ok(vec![parse_condition(&raw)?])
        }
        _ => Err(ConditionError::Empty),
    }
}

pub fn parse_condition(raw: &RawCondition) -> Result<RuleCondition, ConditionError> {
    let field = raw.field.trim().to_lowercase();
    let operator = raw.operator.trim().to_lowercase();
    let value = value_text(&raw.value);

    let unsupported = || ConditionError::Unsupported {
        field: field.clone(),
        operator: operator.clone(),
    };

    if field == "amount" {
        let amount = parse_number(&value)?;
        let op = match operator.as_str() {
            "equals" => AmountOperator::Equals(amount),
            "greater_than" => AmountOperator::GreaterThan(amount),
            "less_than" => AmountOperator::LessThan(amount),
            "between" => {
                let high = match raw.value_end.as_ref().map(value_text) {
                    Some(end) if !end.trim().is_empty() => parse_number(&end)?,
                    _ => amount,
                };
                AmountOperator::Between { low: amount, high }
            }
            "contains" | "starts_with" => return Err(unsupported()),
            other => return Err(ConditionError::UnknownOperator(other.to_string())),
        };
        return Ok(RuleCondition::amount(op));
    }

    let text_field = match field.as_str() {
        "merchant_name" => TextField::MerchantName,
        "description" => TextField::Description,
        "account_id" => TextField::AccountId,
        other => return Err(ConditionError::UnknownField(other.to_string())),
    };
    let text_op = match operator.as_str() {
        "contains" => TextOperator::Contains,
        "equals" => TextOperator::Equals,
        "starts_with" => TextOperator::StartsWith,
        "greater_than" | "less_than" | "between" => return Err(unsupported()),
        other => return Err(ConditionError::UnknownOperator(other.to_string())),
    };
    Ok(RuleCondition::text(text_field, text_op, &value))
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_number(text: &str) -> Result<Decimal, ConditionError> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| *c != '$' && *c != ',')
        .collect();
    Decimal::from_str(&cleaned)
        .map(|d| d.abs())
        .map_err(|_| ConditionError::InvalidNumber(text.to_string()))
}
