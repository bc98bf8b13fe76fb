use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use waf_rule_miner::checkpoint::run_windows;
use waf_rule_miner::config::RuleGenConfig;
use waf_rule_miner::pipeline::RulePipeline;
use waf_rule_miner::sqlite_store::SqliteStore;

async fn run(config: &RuleGenConfig) -> anyhow::Result<()> {
    let store = SqliteStore::open(&config.db_path)?;
    let pipeline = RulePipeline::new(config.pipeline_config());
    let exporter = config.exporter();

    let report = run_windows(&store, &pipeline, Some(&exporter), &config.run_settings()).await?;
    report.log_summary();
    Ok(())
}

#[tokio::main]
async fn main() {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = match RuleGenConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("❌ Configuration error: {:#}", e);
            error!("💡 Numeric settings: BATCH_SIZE, WINDOW_HOURS, MAX_WINDOWS_PER_RUN, N_CLUSTERS, BASE_RULE_ID");
            std::process::exit(1);
        }
    };

    info!("🚀 Starting rule mining run");
    config.log_config();

    if let Err(e) = run(&config).await {
        error!("❌ Rule mining run failed: {:#}", e);
        std::process::exit(1);
    }
}
