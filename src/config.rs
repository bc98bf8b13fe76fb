use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::checkpoint::RunSettings;
use crate::exporter::RuleFileExporter;
use crate::pipeline_config::PipelineConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct RuleGenConfig {
    // Store
    pub db_path: PathBuf,

    // Windowing
    pub batch_size: usize,
    pub window_hours: u32,
    pub max_windows_per_run: usize,

    // Rule generation
    pub n_clusters: usize,
    pub base_rule_id: i64,
    pub include_body_in_repr: bool,

    // Rule file
    pub rule_output_dir: PathBuf,
    pub rule_file_name: String,
}

impl Default for RuleGenConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("rulegen.db"),
            batch_size: 5000,
            window_hours: 24,
            max_windows_per_run: 1,
            n_clusters: 10,
            base_rule_id: 200_000,
            include_body_in_repr: false,
            rule_output_dir: PathBuf::from("/rules"),
            rule_file_name: "REQUEST-999-AUTO.conf".to_string(),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number, got {:?}", key, raw)),
        _ => Ok(default),
    }
}

pub fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "y")
}

impl RuleGenConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup (environment, map in tests)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let config = RuleGenConfig {
            db_path: lookup("RULEGEN_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),

            batch_size: parse_var(&lookup, "BATCH_SIZE", defaults.batch_size)?,
            window_hours: parse_var(&lookup, "WINDOW_HOURS", defaults.window_hours)?,
            max_windows_per_run: parse_var(
                &lookup,
                "MAX_WINDOWS_PER_RUN",
                defaults.max_windows_per_run,
            )?,

            n_clusters: parse_var(&lookup, "N_CLUSTERS", defaults.n_clusters)?,
            base_rule_id: parse_var(&lookup, "BASE_RULE_ID", defaults.base_rule_id)?,
            include_body_in_repr: lookup("INCLUDE_BODY_IN_REPR")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.include_body_in_repr),

            rule_output_dir: lookup("RULE_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.rule_output_dir),
            rule_file_name: lookup("RULE_FILE_NAME").unwrap_or(defaults.rule_file_name),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.batch_size > 0, "BATCH_SIZE must be greater than 0");
        anyhow::ensure!(self.window_hours > 0, "WINDOW_HOURS must be greater than 0");
        anyhow::ensure!(
            self.max_windows_per_run > 0,
            "MAX_WINDOWS_PER_RUN must be greater than 0"
        );
        anyhow::ensure!(
            !self.rule_file_name.trim().is_empty(),
            "RULE_FILE_NAME must not be empty"
        );
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::new()
            .with_clusters(self.n_clusters)
            .with_base_rule_id(self.base_rule_id)
            .with_body(self.include_body_in_repr)
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            batch_size: self.batch_size,
            max_windows_per_run: self.max_windows_per_run,
            default_window_hours: self.window_hours,
        }
    }

    pub fn exporter(&self) -> RuleFileExporter {
        RuleFileExporter::new(&self.rule_output_dir, &self.rule_file_name)
    }

    pub fn log_config(&self) {
        tracing::info!("📋 Configuration:");
        tracing::info!("   Database: {}", self.db_path.display());
        tracing::info!("   Batch size: {}", self.batch_size);
        tracing::info!("   Window hours (initial): {}", self.window_hours);
        tracing::info!("   Max windows per run: {}", self.max_windows_per_run);
        tracing::info!("   Clusters: {}", self.n_clusters);
        tracing::info!("   Base rule id: {}", self.base_rule_id);
        tracing::info!("   Include body: {}", self.include_body_in_repr);
        tracing::info!(
            "   Rule file: {}",
            self.rule_output_dir.join(&self.rule_file_name).display()
        );
    }
}
