/// Window/checkpoint manager
///
/// Each invocation walks fixed-length windows forward from the stored
/// checkpoint:
///
///   WAITING            window not fully elapsed at the store's clock, stop without writes
///   FETCHING           window elapsed, query unseen attack sessions inside it
///   EMPTY_ADVANCE      nothing found, move window_start to window_end
///   PROCESSED_ADVANCE  run the rule pipeline, persist rules, move both fields
///
/// Every advance is a single `commit_window` call, so a failed run leaves the
/// checkpoint where the last successful window put it.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::exporter::RuleFileExporter;
use crate::models::{Checkpoint, StoredRule};
use crate::pipeline::RulePipeline;
use crate::traits::RuleStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Waiting,
    Fetching,
    EmptyAdvance,
    ProcessedAdvance,
}

impl fmt::Display for WindowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WindowState::Waiting => "WAITING",
            WindowState::Fetching => "FETCHING",
            WindowState::EmptyAdvance => "EMPTY_ADVANCE",
            WindowState::ProcessedAdvance => "PROCESSED_ADVANCE",
        })
    }
}

/// What happened to one consumed window
#[derive(Debug, Clone, PartialEq)]
pub struct WindowOutcome {
    pub state: WindowState,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub fetched: usize,
    /// Batch hit the fetch limit; the rest of the window is not revisited
    pub truncated: bool,
    pub session_range: Option<(i64, i64)>,
    pub rules_generated: usize,
    pub rules_inserted: usize,
    pub rule_file: Option<PathBuf>,
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Next window has not fully elapsed yet
    Waiting,
    /// Per-run window budget used up
    BudgetExhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// `RuleStore::name` of the store the run went against
    pub store: String,
    pub windows: Vec<WindowOutcome>,
    pub stop: StopReason,
}

impl RunReport {
    pub fn rules_inserted(&self) -> usize {
        self.windows.iter().map(|w| w.rules_inserted).sum()
    }

    pub fn log_summary(&self) {
        let processed = self
            .windows
            .iter()
            .filter(|w| w.state == WindowState::ProcessedAdvance)
            .count();
        info!(
            "✅ Run finished on {} store ({:?}): {} windows consumed ({} processed, {} empty), {} rules inserted",
            self.store,
            self.stop,
            self.windows.len(),
            processed,
            self.windows.len() - processed,
            self.rules_inserted()
        );
    }
}

/// Knobs of the run loop itself
#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub batch_size: usize,
    pub max_windows_per_run: usize,
    /// Used only when the checkpoint is first seeded
    pub default_window_hours: u32,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            batch_size: 5000,
            max_windows_per_run: 1,
            default_window_hours: 24,
        }
    }
}

/// Consume complete windows until one is still open or the budget runs out
///
/// # Arguments
/// * `store` - backing store (checkpoint, source sessions, rules)
/// * `pipeline` - rule generation pipeline
/// * `exporter` - rule file writer, refreshed after each window that produced a batch
/// * `settings` - fetch limit and window budget
pub async fn run_windows<S>(
    store: &S,
    pipeline: &RulePipeline,
    exporter: Option<&RuleFileExporter>,
    settings: &RunSettings,
) -> Result<RunReport>
where
    S: RuleStore,
{
    store
        .ensure_schema(settings.default_window_hours)
        .await
        .context("Failed to prepare store")?;
    info!("🔧 Rule store: {}", store.name());

    let mut windows = Vec::new();
    while windows.len() < settings.max_windows_per_run {
        match step(store, pipeline, exporter, settings).await? {
            Some(outcome) => windows.push(outcome),
            None => {
                return Ok(RunReport {
                    store: store.name().to_string(),
                    windows,
                    stop: StopReason::Waiting,
                })
            }
        }
    }

    Ok(RunReport {
        store: store.name().to_string(),
        windows,
        stop: StopReason::BudgetExhausted,
    })
}

/// One pass of the state machine; `None` means WAITING
async fn step<S: RuleStore>(
    store: &S,
    pipeline: &RulePipeline,
    exporter: Option<&RuleFileExporter>,
    settings: &RunSettings,
) -> Result<Option<WindowOutcome>> {
    let checkpoint = store.read_checkpoint().await.context("Failed to read checkpoint")?;
    let window_start = checkpoint.window_start_time;
    let window_end = checkpoint.window_end();
    let now = store.now().await.context("Failed to read store clock")?;

    if now < window_end {
        info!(
            "⏳ {}: window {} ~ {} not complete (now {})",
            WindowState::Waiting,
            window_start,
            window_end,
            now
        );
        return Ok(None);
    }

    debug!(
        "{}: sessions > {} in {} ~ {}",
        WindowState::Fetching,
        checkpoint.last_session_id,
        window_start,
        window_end
    );
    let items = store
        .fetch_window(
            checkpoint.last_session_id,
            window_start,
            window_end,
            settings.batch_size,
        )
        .await?;

    let truncated = items.len() >= settings.batch_size;
    if truncated {
        warn!(
            "Window {} ~ {} hit the batch limit of {}; later sessions in this window will be skipped",
            window_start, window_end, settings.batch_size
        );
    }

    if items.is_empty() {
        let next = checkpoint.advanced(checkpoint.last_session_id);
        store
            .commit_window(&checkpoint, &next, Vec::new())
            .await
            .context("Failed to advance empty window")?;
        info!(
            "{}: no attack sessions in {} ~ {}, next window starts {}",
            WindowState::EmptyAdvance,
            window_start,
            window_end,
            next.window_start_time
        );

        return Ok(Some(WindowOutcome {
            state: WindowState::EmptyAdvance,
            window_start,
            window_end,
            fetched: 0,
            truncated: false,
            session_range: None,
            rules_generated: 0,
            rules_inserted: 0,
            rule_file: None,
            checkpoint: next,
        }));
    }

    let batch = pipeline.run(&items);
    let next = checkpoint.advanced(batch.max_session_db_id);
    let stored: Vec<StoredRule> = batch
        .rules
        .iter()
        .map(|r| StoredRule::from_generated(r, batch.min_session_db_id, batch.max_session_db_id))
        .collect();

    let inserted = store
        .commit_window(&checkpoint, &next, stored)
        .await
        .context("Failed to commit window")?;

    let rule_file = match exporter {
        Some(exporter) => {
            let all = store.list_rules().await.context("Failed to list stored rules")?;
            exporter.export(&all).await.context(
                "Rules committed but the rule file was not refreshed; run export-rules to retry",
            )?
        }
        None => None,
    };

    info!(
        "{}: window={} ~ {} | fetched={} (sid {} -> {}) | rules_generated={} rules_inserted={} | \
         checkpoint_last_session_id={} | next_window_start={} | file={}",
        WindowState::ProcessedAdvance,
        window_start,
        window_end,
        items.len(),
        batch.min_session_db_id,
        batch.max_session_db_id,
        batch.rules.len(),
        inserted,
        next.last_session_id,
        next.window_start_time,
        rule_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string())
    );

    Ok(Some(WindowOutcome {
        state: WindowState::ProcessedAdvance,
        window_start,
        window_end,
        fetched: items.len(),
        truncated,
        session_range: Some((batch.min_session_db_id, batch.max_session_db_id)),
        rules_generated: batch.rules.len(),
        rules_inserted: inserted,
        rule_file,
        checkpoint: next,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::implementations::MemoryStore;
    use crate::pipeline_config::PipelineConfig;
    use chrono::{Duration, TimeZone};

    #[tokio::test]
    async fn test_waiting_performs_no_fetch() {
        let now = Utc.with_ymd_and_hms(2025, 4, 2, 10, 0, 0).unwrap();
        let store = MemoryStore::with_checkpoint(
            now,
            Checkpoint {
                last_session_id: 7,
                window_start_time: Utc.with_ymd_and_hms(2025, 4, 2, 0, 0, 0).unwrap(),
                window_hours: 24,
            },
        );

        let pipeline = RulePipeline::new(PipelineConfig::default());
        let report = run_windows(&store, &pipeline, None, &RunSettings::default())
            .await
            .unwrap();

        assert_eq!(report.stop, StopReason::Waiting);
        assert_eq!(report.store, "memory");
        assert!(report.windows.is_empty());
        assert_eq!(store.fetch_count(), 0);
        assert_eq!(store.read_checkpoint().await.unwrap().last_session_id, 7);
    }

    #[tokio::test]
    async fn test_budget_limits_catch_up() {
        let store = MemoryStore::new(Utc.with_ymd_and_hms(2025, 4, 10, 12, 0, 0).unwrap());
        store.ensure_schema(6).await.unwrap();
        let start = store.read_checkpoint().await.unwrap().window_start_time;

        let settings = RunSettings {
            max_windows_per_run: 3,
            ..RunSettings::default()
        };
        let pipeline = RulePipeline::new(PipelineConfig::default());
        let report = run_windows(&store, &pipeline, None, &settings).await.unwrap();

        assert_eq!(report.stop, StopReason::BudgetExhausted);
        assert_eq!(report.windows.len(), 3);
        assert!(report.windows.iter().all(|w| w.state == WindowState::EmptyAdvance));
        assert_eq!(
            store.read_checkpoint().await.unwrap().window_start_time,
            start + Duration::hours(18)
        );
    }
}
