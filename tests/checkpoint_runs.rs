/// Window/checkpoint state machine against the in-memory store
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use waf_rule_miner::checkpoint::{run_windows, RunSettings, StopReason, WindowState};
use waf_rule_miner::exporter::RuleFileExporter;
use waf_rule_miner::implementations::MemoryStore;
use waf_rule_miner::models::{AttackLabel, Checkpoint, LabeledRequest, StoredRule};
use waf_rule_miner::pipeline::RulePipeline;
use waf_rule_miner::pipeline_config::PipelineConfig;
use waf_rule_miner::traits::RuleStore;

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, d, 0, 0, 0).unwrap()
}

fn start_checkpoint(last_session_id: i64) -> Checkpoint {
    Checkpoint {
        last_session_id,
        window_start_time: day(1),
        window_hours: 24,
    }
}

fn traversal(id: i64) -> LabeledRequest {
    LabeledRequest {
        session_db_id: id,
        label: AttackLabel::PathTraversal,
        method: "GET".to_string(),
        uri: format!("/download?id={}&file=../../etc/passwd", id),
        user_agent: Some("curl/8.4.0".to_string()),
        body: None,
    }
}

fn push_traversals(store: &MemoryStore, ids: std::ops::RangeInclusive<i64>, at: DateTime<Utc>) {
    for id in ids {
        store.push_request(traversal(id), at);
    }
}

fn pipeline() -> RulePipeline {
    RulePipeline::new(PipelineConfig::default())
}

fn budget(max_windows_per_run: usize) -> RunSettings {
    RunSettings {
        max_windows_per_run,
        ..RunSettings::default()
    }
}

#[tokio::test]
async fn test_empty_window_advances_exactly_one_window() {
    let store = MemoryStore::with_checkpoint(day(2) + Duration::hours(3), start_checkpoint(12));

    let report = run_windows(&store, &pipeline(), None, &budget(1)).await.unwrap();

    assert_eq!(report.stop, StopReason::BudgetExhausted);
    assert_eq!(report.windows.len(), 1);
    assert_eq!(report.windows[0].state, WindowState::EmptyAdvance);
    assert_eq!(report.rules_inserted(), 0);

    let cp = store.read_checkpoint().await.unwrap();
    assert_eq!(cp.window_start_time, day(1) + Duration::hours(24));
    assert_eq!(cp.last_session_id, 12);
    assert!(store.list_rules().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_processed_window_persists_and_exports() {
    let dir = tempfile::tempdir().unwrap();
    let exporter = RuleFileExporter::new(dir.path(), "REQUEST-999-AUTO.conf");
    let store = MemoryStore::with_checkpoint(day(2), start_checkpoint(0));
    push_traversals(&store, 1..=6, day(1) + Duration::hours(5));

    let report = run_windows(&store, &pipeline(), Some(&exporter), &budget(1))
        .await
        .unwrap();

    let outcome = &report.windows[0];
    assert_eq!(outcome.state, WindowState::ProcessedAdvance);
    assert_eq!(outcome.fetched, 6);
    assert_eq!(outcome.session_range, Some((1, 6)));
    assert_eq!(outcome.rules_generated, 1);
    assert_eq!(outcome.rules_inserted, 1);
    assert!(!outcome.truncated);

    let cp = store.read_checkpoint().await.unwrap();
    assert_eq!(cp.last_session_id, 6);
    assert_eq!(cp.window_start_time, day(2));

    let rules = store.list_rules().await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].rule_id, 200_000);
    assert_eq!(rules[0].attack_type, "path_traversal");
    assert_eq!(
        (rules[0].source_min_session_db_id, rules[0].source_max_session_db_id),
        (1, 6)
    );

    let path = outcome.rule_file.clone().unwrap();
    let text = std::fs::read_to_string(path).unwrap();
    assert!(text.starts_with("# ===="));
    assert!(text.contains(&rules[0].secrule_text));
}

#[tokio::test]
async fn test_rerun_without_new_data_is_a_no_op() {
    let store = MemoryStore::with_checkpoint(day(2) + Duration::hours(1), start_checkpoint(0));
    push_traversals(&store, 1..=6, day(1) + Duration::hours(5));

    run_windows(&store, &pipeline(), None, &budget(1)).await.unwrap();
    let after_first = store.read_checkpoint().await.unwrap();
    let rules_first = store.list_rules().await.unwrap();

    // same clock: next window is still open
    let report = run_windows(&store, &pipeline(), None, &budget(1)).await.unwrap();
    assert_eq!(report.stop, StopReason::Waiting);
    assert_eq!(store.read_checkpoint().await.unwrap(), after_first);
    assert_eq!(store.list_rules().await.unwrap(), rules_first);
}

#[tokio::test]
async fn test_no_fetch_before_window_completes() {
    let store = MemoryStore::with_checkpoint(day(1) + Duration::hours(23), start_checkpoint(0));
    push_traversals(&store, 1..=6, day(1) + Duration::hours(5));

    let report = run_windows(&store, &pipeline(), None, &budget(5)).await.unwrap();
    assert_eq!(report.stop, StopReason::Waiting);
    assert_eq!(store.fetch_count(), 0);

    // exactly at window end the window counts as complete
    store.set_now(day(2));
    let report = run_windows(&store, &pipeline(), None, &budget(5)).await.unwrap();
    assert_eq!(report.windows.len(), 1);
    assert_eq!(report.stop, StopReason::Waiting);
    assert_eq!(store.fetch_count(), 1);
}

#[tokio::test]
async fn test_checkpoint_is_monotonic_across_runs() {
    let store = MemoryStore::with_checkpoint(day(1), start_checkpoint(0));
    push_traversals(&store, 1..=4, day(1) + Duration::hours(2));
    push_traversals(&store, 5..=9, day(3) + Duration::hours(8));
    // a late-arriving low id in a later window is never revisited
    store.push_request(traversal(3), day(4) + Duration::hours(1));

    let mut seen = vec![store.read_checkpoint().await.unwrap()];
    for _ in 0..6 {
        store.advance_clock(Duration::hours(24));
        run_windows(&store, &pipeline(), None, &budget(2)).await.unwrap();
        seen.push(store.read_checkpoint().await.unwrap());
    }

    for pair in seen.windows(2) {
        assert!(pair[1].last_session_id >= pair[0].last_session_id);
        assert!(pair[1].window_start_time >= pair[0].window_start_time);
    }
    assert_eq!(seen.last().unwrap().last_session_id, 9);
}

#[tokio::test]
async fn test_same_cluster_in_later_window_keeps_first_rule() {
    let store = MemoryStore::with_checkpoint(day(3), start_checkpoint(0));
    push_traversals(&store, 1..=6, day(1) + Duration::hours(1));
    push_traversals(&store, 7..=12, day(2) + Duration::hours(1));

    let report = run_windows(&store, &pipeline(), None, &budget(2)).await.unwrap();
    assert_eq!(report.windows.len(), 2);
    assert_eq!(report.windows[0].rules_inserted, 1);
    assert_eq!(report.windows[1].rules_generated, 1);
    assert_eq!(report.windows[1].rules_inserted, 0);

    let rules = store.list_rules().await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(
        (rules[0].source_min_session_db_id, rules[0].source_max_session_db_id),
        (1, 12)
    );
}

#[tokio::test]
async fn test_truncated_batch_still_advances() {
    let store = MemoryStore::with_checkpoint(day(2), start_checkpoint(0));
    push_traversals(&store, 1..=6, day(1) + Duration::hours(5));

    let settings = RunSettings {
        batch_size: 4,
        ..RunSettings::default()
    };
    let report = run_windows(&store, &pipeline(), None, &settings).await.unwrap();

    assert!(report.windows[0].truncated);
    assert_eq!(report.windows[0].fetched, 4);
    let cp = store.read_checkpoint().await.unwrap();
    assert_eq!(cp.last_session_id, 4);
    assert_eq!(cp.window_start_time, day(2));
}

/// Delegates to a memory store but rejects every commit
struct FailingCommitStore {
    inner: MemoryStore,
}

#[async_trait]
impl RuleStore for FailingCommitStore {
    async fn ensure_schema(&self, default_window_hours: u32) -> Result<()> {
        self.inner.ensure_schema(default_window_hours).await
    }

    async fn now(&self) -> Result<DateTime<Utc>> {
        self.inner.now().await
    }

    async fn read_checkpoint(&self) -> Result<Checkpoint> {
        self.inner.read_checkpoint().await
    }

    async fn fetch_window(
        &self,
        after_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LabeledRequest>> {
        self.inner.fetch_window(after_id, start, end, limit).await
    }

    async fn commit_window(
        &self,
        _expected: &Checkpoint,
        _next: &Checkpoint,
        _rules: Vec<StoredRule>,
    ) -> Result<usize> {
        anyhow::bail!("connection reset")
    }

    async fn list_rules(&self) -> Result<Vec<StoredRule>> {
        self.inner.list_rules().await
    }

    fn name(&self) -> &str {
        "failing"
    }
}

#[tokio::test]
async fn test_failed_commit_leaves_checkpoint_for_retry() {
    let store = FailingCommitStore {
        inner: MemoryStore::with_checkpoint(day(2), start_checkpoint(0)),
    };
    push_traversals(&store.inner, 1..=6, day(1) + Duration::hours(5));

    let result = run_windows(&store, &pipeline(), None, &budget(1)).await;
    assert!(result.is_err());
    assert_eq!(store.read_checkpoint().await.unwrap(), start_checkpoint(0));
    assert!(store.list_rules().await.unwrap().is_empty());

    // the next invocation re-fetches the same window
    let report = run_windows(&store.inner, &pipeline(), None, &budget(1)).await.unwrap();
    assert_eq!(report.windows[0].fetched, 6);
    assert_eq!(report.windows[0].window_start, day(1));
}
