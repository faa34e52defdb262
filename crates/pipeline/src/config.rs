use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables for one pipeline instance. Every field has a working default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Rows pulled per bulk categorization pass.
    pub uncategorized_page_size: usize,
    /// Rows per store write call.
    pub write_chunk_size: usize,
    /// Learned mappings below this confidence are not loaded into the cache.
    pub learned_min_confidence: f64,
    pub default_match_confidence: f64,
    pub income_fallback_confidence: f64,
    /// Confidence of a mapping created by the first manual override.
    pub learned_initial_confidence: f64,
    /// Fraction of the remaining distance to 1.0 gained per confirmation.
    pub learning_rate: f64,
    pub recurring_relative_tolerance: f64,
    pub recurring_absolute_tolerance_cents: i64,
    pub transfer_window_days: i64,
    pub transfer_amount_tolerance_cents: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            uncategorized_page_size: 500,
            write_chunk_size: 50,
            learned_min_confidence: 0.8,
            default_match_confidence: 0.7,
            income_fallback_confidence: 0.5,
            learned_initial_confidence: 0.6,
            learning_rate: 0.1,
            recurring_relative_tolerance: 0.15,
            recurring_absolute_tolerance_cents: 500,
            transfer_window_days: 3,
            transfer_amount_tolerance_cents: 1,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml(toml_content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(toml_content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.uncategorized_page_size == 0 {
            return Err(ConfigError::Invalid("uncategorized_page_size must be > 0".into()));
        }
        if self.write_chunk_size == 0 {
            return Err(ConfigError::Invalid("write_chunk_size must be > 0".into()));
        }
        for (name, value) in [
            ("learned_min_confidence", self.learned_min_confidence),
            ("default_match_confidence", self.default_match_confidence),
            ("income_fallback_confidence", self.income_fallback_confidence),
            ("learned_initial_confidence", self.learned_initial_confidence),
            ("learning_rate", self.learning_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if self.recurring_relative_tolerance < 0.0
            || self.recurring_absolute_tolerance_cents < 0
            || self.transfer_window_days < 0
            || self.transfer_amount_tolerance_cents < 0
        {
            return Err(ConfigError::Invalid("tolerances must not be negative".into()));
        }
        Ok(())
    }
}
