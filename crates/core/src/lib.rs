pub mod account;
pub mod category;
pub mod merchant;
pub mod money;
pub mod period;
pub mod recurring;
pub mod store;
pub mod transaction;

pub use account::{AccountId, UserId};
pub use category::{
    normalize_conditions, AmountOperator, Category, CategoryId, CategoryRule, CategoryType,
    ConditionError, LegacyCondition, RawCondition, RuleActions, RuleCondition, TextField,
    TextOperator, DEFAULT_CATEGORIES,
};
pub use merchant::{normalize_merchant, patterns_overlap, MerchantMapping};
pub use money::Money;
pub use period::{days_in_month, DateRange};
pub use recurring::{Frequency, RecurringRule, RecurringRuleId};
pub use store::{PipelineStore, StoreError};
pub use transaction::{
    CategorizedBy, ClassificationUpdate, RecurringLink, Transaction, TransactionId, TransferLink,
    TransferPair,
};
