use crate::models::{Checkpoint, LabeledRequest, StoredRule};
use crate::traits::{check_advance, RuleStore};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// A labeled request together with the session's representative timestamp
#[derive(Debug, Clone)]
pub struct TimedRequest {
    pub request: LabeledRequest,
    pub session_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    checkpoint: Option<Checkpoint>,
    requests: Vec<TimedRequest>,
    rules: BTreeMap<i64, StoredRule>,
    fetches: usize,
}

/// In-process store with a controllable clock
///
/// Backs the checkpoint state machine in tests and dry runs. Requests are
/// assumed to be attack-labeled already.
pub struct MemoryStore {
    now: Mutex<DateTime<Utc>>,
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Start from a specific checkpoint instead of the default seed
    pub fn with_checkpoint(now: DateTime<Utc>, checkpoint: Checkpoint) -> Self {
        let store = Self::new(now);
        store.setup_state().checkpoint = Some(checkpoint);
        store
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        *self.setup_clock() = now;
    }

    pub fn advance_clock(&self, by: Duration) {
        let mut clock = self.setup_clock();
        *clock = *clock + by;
    }

    pub fn push_request(&self, request: LabeledRequest, session_time: DateTime<Utc>) {
        self.setup_state().requests.push(TimedRequest {
            request,
            session_time,
        });
    }

    /// Number of `fetch_window` calls served so far
    pub fn fetch_count(&self) -> usize {
        self.setup_state().fetches
    }

    // fixture helpers panic on a poisoned lock
    fn setup_state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory store lock poisoned")
    }

    fn setup_clock(&self) -> MutexGuard<'_, DateTime<Utc>> {
        self.now.lock().expect("memory store clock poisoned")
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }

    fn current_time(&self) -> Result<DateTime<Utc>> {
        self.now
            .lock()
            .map(|now| *now)
            .map_err(|_| anyhow!("memory store clock poisoned"))
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn ensure_schema(&self, default_window_hours: u32) -> Result<()> {
        let now = self.current_time()?;
        let mut state = self.lock_state()?;
        if state.checkpoint.is_none() {
            let today = now.duration_trunc(Duration::days(1))?;
            state.checkpoint = Some(Checkpoint {
                last_session_id: 0,
                window_start_time: today - Duration::days(1),
                window_hours: default_window_hours,
            });
        }
        Ok(())
    }

    async fn now(&self) -> Result<DateTime<Utc>> {
        self.current_time()
    }

    async fn read_checkpoint(&self) -> Result<Checkpoint> {
        self.lock_state()?
            .checkpoint
            .ok_or_else(|| anyhow!("checkpoint not initialized"))
    }

    async fn fetch_window(
        &self,
        after_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LabeledRequest>> {
        let mut state = self.lock_state()?;
        state.fetches += 1;

        let mut rows: Vec<LabeledRequest> = state
            .requests
            .iter()
            .filter(|r| r.request.session_db_id > after_id)
            .filter(|r| r.session_time >= start && r.session_time < end)
            .map(|r| r.request.clone())
            .collect();
        rows.sort_by_key(|r| r.session_db_id);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn commit_window(
        &self,
        expected: &Checkpoint,
        next: &Checkpoint,
        rules: Vec<StoredRule>,
    ) -> Result<usize> {
        let mut state = self.lock_state()?;
        let current = state
            .checkpoint
            .ok_or_else(|| anyhow!("checkpoint not initialized"))?;
        check_advance(&current, expected, next)?;

        let mut inserted = 0;
        for rule in rules {
            match state.rules.get_mut(&rule.rule_id) {
                Some(existing) => {
                    existing.source_min_session_db_id = existing
                        .source_min_session_db_id
                        .min(rule.source_min_session_db_id);
                    existing.source_max_session_db_id = existing
                        .source_max_session_db_id
                        .max(rule.source_max_session_db_id);
                }
                None => {
                    state.rules.insert(rule.rule_id, rule);
                    inserted += 1;
                }
            }
        }

        state.checkpoint = Some(*next);
        Ok(inserted)
    }

    async fn list_rules(&self) -> Result<Vec<StoredRule>> {
        Ok(self.lock_state()?.rules.values().cloned().collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
