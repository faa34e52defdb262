use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sift_core::{UserId, DEFAULT_CATEGORIES};
use sift_pipeline::{DefaultPatterns, PipelineConfig, TransactionPipeline};
use sift_storage::SqliteStore;

/// Optional TOML file with [`PipelineConfig`] overrides.
const CONFIG_ENV: &str = "SIFT_CONFIG";
/// Optional TOML file replacing the built-in default-pattern table.
const PATTERNS_ENV: &str = "SIFT_PATTERNS";

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = std::env::args().skip(1);
    let (Some(db_path), Some(user)) = (args.next(), args.next()) else {
        bail!("usage: sift-worker <db-path> <user-id>");
    };
    let db_path = PathBuf::from(db_path);
    let user = UserId::new(user);

    let config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => load_config(Path::new(&path))?,
        None => PipelineConfig::default(),
    };
    let patterns = match std::env::var_os(PATTERNS_ENV) {
        Some(path) => load_patterns(Path::new(&path))?,
        None => DefaultPatterns::builtin(),
    };

    let db = sift_storage::create_db(&db_path)
        .await
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    sift_storage::seed_default_categories(&db, &user)
        .await
        .context("Failed to seed default categories")?;

    let pipeline = TransactionPipeline::new(SqliteStore::new(db), config, patterns);
    let report = pipeline
        .process_pending(&user, None)
        .await
        .with_context(|| format!("Pipeline pass failed for user {user}"))?;

    let transfers = report.transfers.unwrap_or_default();
    info!(
        user = %user,
        scanned = report.categorization.scanned,
        rule_matched = report.categorization.rule_matched,
        suggested = report.categorization.suggested,
        flagged = report.categorization.flagged,
        failed_writes = report.categorization.failed_writes,
        recurring_matched = report.recurring.map_or(0, |r| r.matched),
        transfer_pairs = transfers.pairs,
        failed_transfer_legs = transfers.failed_legs,
        "Worker pass complete"
    );
    Ok(())
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config = PipelineConfig::from_toml(&content)
        .with_context(|| format!("Invalid config {}", path.display()))?;
    info!(path = %path.display(), "Loaded pipeline config");
    Ok(config)
}

fn load_patterns(path: &Path) -> Result<DefaultPatterns> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pattern table {}", path.display()))?;
    let patterns = DefaultPatterns::from_toml(&content)
        .with_context(|| format!("Invalid pattern table {}", path.display()))?;
    info!(path = %path.display(), patterns = patterns.patterns().len(), "Loaded default patterns");
    for name in unseeded_categories(&patterns) {
        warn!(category = %name, "Pattern category is never seeded; its keywords will not match");
    }
    Ok(patterns)
}

fn unseeded_categories(patterns: &DefaultPatterns) -> Vec<&str> {
    patterns
        .category_names()
        .into_iter()
        .filter(|name| {
            !DEFAULT_CATEGORIES
                .iter()
                .any(|(seeded, _)| seeded.eq_ignore_ascii_case(name))
        })
        .collect()
}
