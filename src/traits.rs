/// Store abstraction for the window/checkpoint manager
///
/// The manager only ever talks to persistence through [`RuleStore`], so the same
/// state machine runs against:
/// - the SQLite store used in production (`sqlite_store`)
/// - the in-memory store with a controllable clock used by tests (`implementations`)
use crate::models::{Checkpoint, LabeledRequest, StoredRule};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

// ============================================================================
// Rule Store Trait
// ============================================================================

/// Query/write contract of the backing store
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Create tables and seed the checkpoint singleton if missing
    ///
    /// # Arguments
    /// * `default_window_hours` - window length stored when the checkpoint is first created
    async fn ensure_schema(&self, default_window_hours: u32) -> Result<()>;

    /// Current wall-clock time as seen by the store
    async fn now(&self) -> Result<DateTime<Utc>>;

    async fn read_checkpoint(&self) -> Result<Checkpoint>;

    /// Fetch attack-labeled sessions not yet incorporated
    ///
    /// Returns one representative (most recent) request per session with
    /// `session_db_id > after_id` and a representative timestamp in
    /// `[start, end)`, ordered by `session_db_id`, at most `limit` rows.
    async fn fetch_window(
        &self,
        after_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LabeledRequest>>;

    /// Persist a window's rules and advance the checkpoint atomically
    ///
    /// Fails without any effect when the stored checkpoint no longer matches
    /// `expected`, or when `next` would move either field backwards.
    ///
    /// # Returns
    /// Number of newly inserted rule rows (duplicates only widen their source range)
    async fn commit_window(
        &self,
        expected: &Checkpoint,
        next: &Checkpoint,
        rules: Vec<StoredRule>,
    ) -> Result<usize>;

    /// Every stored rule, ordered by `rule_id`
    async fn list_rules(&self) -> Result<Vec<StoredRule>>;

    /// Get the name/identifier of this store (for logging)
    fn name(&self) -> &str;
}

/// Shared checks for `commit_window` implementations
pub fn check_advance(current: &Checkpoint, expected: &Checkpoint, next: &Checkpoint) -> Result<()> {
    anyhow::ensure!(
        current.window_start_time == expected.window_start_time
            && current.last_session_id == expected.last_session_id,
        "checkpoint moved concurrently (stored window start {}, expected {})",
        current.window_start_time,
        expected.window_start_time
    );
    anyhow::ensure!(
        next.last_session_id >= current.last_session_id,
        "refusing to decrease last_session_id from {} to {}",
        current.last_session_id,
        next.last_session_id
    );
    anyhow::ensure!(
        next.window_start_time >= current.window_start_time,
        "refusing to move window start back from {} to {}",
        current.window_start_time,
        next.window_start_time
    );
    Ok(())
}
