/// Rewrite the rule include file from the stored rule set
///
/// Recovery tool for runs that committed rules but failed to write the file.
/// Does not touch the checkpoint.
use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use waf_rule_miner::config::RuleGenConfig;
use waf_rule_miner::exporter::is_current;
use waf_rule_miner::sqlite_store::SqliteStore;
use waf_rule_miner::traits::RuleStore;

async fn run() -> anyhow::Result<()> {
    let config = RuleGenConfig::from_env()?;
    config.log_config();

    let store = SqliteStore::open(&config.db_path)?;
    store.ensure_schema(config.window_hours).await?;

    let rules = store.list_rules().await.context("Failed to list stored rules")?;
    let exporter = config.exporter();

    if is_current(&exporter.path(), &rules).await {
        info!("Rule file {} already up to date ({} rules)", exporter.path().display(), rules.len());
        return Ok(());
    }

    match exporter.export(&rules).await? {
        Some(path) => info!("✅ Exported {} rules to {}", rules.len(), path.display()),
        None => info!("No rules stored yet, nothing to export"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    if let Err(e) = run().await {
        error!("❌ Export failed: {:#}", e);
        std::process::exit(1);
    }
}
