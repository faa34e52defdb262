pub mod categorize;
pub mod config;
pub mod defaults;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod recurring;
pub mod rules;
pub mod transfer;

pub use categorize::{
    reinforce, BulkReport, CategorizationCache, CategorizedBatch, Categorizer, CategoryDecision,
    INCOME_CATEGORY,
};
pub use config::{ConfigError, PipelineConfig};
pub use defaults::{AmountHint, DefaultPattern, DefaultPatterns};
pub use error::{CategorizeError, PipelineError};
pub use memory::MemoryStore;
pub use pipeline::{BatchReport, TransactionPipeline};
pub use recurring::{
    compute_next_expected, detect_recurring_candidates, detect_recurring_pattern, DetectedPattern,
    RecurringCandidate, RecurringMatcher, RecurringReport,
};
pub use rules::{condition_matches, rule_matches, CategoryRuleEngine};
pub use transfer::{TransferDetector, TransferReport, TRANSFER_CATEGORY};
