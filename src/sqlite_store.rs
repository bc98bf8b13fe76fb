use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::models::{AttackLabel, Checkpoint, LabeledRequest, StoredRule};
use crate::traits::{check_advance, RuleStore};

const SCHEMA: &str = include_str!("../rulegen_schema.sql");

/// Storage format of every timestamp column
pub const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Yesterday 00:00 UTC, evaluated by SQLite
const DEFAULT_WINDOW_START: &str = "datetime('now', 'start of day', '-1 day')";

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw.trim(), TS_FORMAT) {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in store: {:?}", raw))
}

/// SQLite-backed rule store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database: {}", path.as_ref().display()))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.with_conn(|conn| init_schema(conn))?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.with_conn(|conn| init_schema(conn))?;
        Ok(store)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("store connection lock poisoned"))?;
        f(&mut *conn)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| anyhow!("store connection lock poisoned"))?;
            f(&mut *conn)
        })
        .await
        .context("store task failed")?
    }

    // ==================== Source Tables ====================

    /// Record a classified session (normally done by the log collector)
    pub fn insert_session(
        &self,
        session_id: &str,
        label: Option<&str>,
        user_agent: Option<&str>,
        created_at: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (session_id, label, user_agent, created_at, end_time)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session_id,
                    label,
                    user_agent,
                    format_ts(created_at),
                    end_time.map(format_ts)
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Record one request belonging to a session
    pub fn insert_raw_log(
        &self,
        session_db_id: i64,
        method: &str,
        uri: &str,
        user_agent: Option<&str>,
        request_body: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO raw_logs (session_db_id, method, uri, user_agent, request_body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session_db_id,
                    method,
                    uri,
                    user_agent,
                    request_body,
                    format_ts(created_at)
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)
        .context("Failed to apply rule store schema")
}

fn seed_checkpoint(conn: &Connection, window_hours: u32) -> Result<()> {
    let seeded = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO rule_gen_checkpoint (id, last_session_id, window_start_time, window_hours)
             VALUES (1, 0, {}, ?1)",
            DEFAULT_WINDOW_START
        ),
        [window_hours],
    )?;
    if seeded > 0 {
        debug!("Seeded checkpoint with {}h windows", window_hours);
    }

    // a missing start is pinned once, not recomputed per read
    let repaired = conn.execute(
        &format!(
            "UPDATE rule_gen_checkpoint SET window_start_time = {}
             WHERE id = 1 AND window_start_time IS NULL",
            DEFAULT_WINDOW_START
        ),
        [],
    )?;
    if repaired > 0 {
        warn!("Checkpoint had no window start, reset to yesterday 00:00");
    }
    Ok(())
}

fn read_checkpoint_row(conn: &Connection) -> Result<Checkpoint> {
    read_stored_checkpoint(conn).map(|(checkpoint, _)| checkpoint)
}

/// Checkpoint plus the window start exactly as stored, for the commit guard
fn read_stored_checkpoint(conn: &Connection) -> Result<(Checkpoint, Option<String>)> {
    let row: Option<(i64, Option<String>, String, i64)> = conn
        .query_row(
            &format!(
                "SELECT last_session_id, window_start_time,
                        COALESCE(window_start_time, {}), window_hours
                 FROM rule_gen_checkpoint WHERE id = 1",
                DEFAULT_WINDOW_START
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    let (last_session_id, raw_start, start, hours) =
        row.ok_or_else(|| anyhow!("checkpoint row missing; schema not initialized"))?;
    let window_hours = u32::try_from(hours)
        .ok()
        .filter(|h| *h > 0)
        .ok_or_else(|| anyhow!("invalid window_hours in checkpoint: {}", hours))?;

    let checkpoint = Checkpoint {
        last_session_id,
        window_start_time: parse_ts(&start)?,
        window_hours,
    };
    Ok((checkpoint, raw_start))
}

fn fetch_window_rows(
    conn: &Connection,
    after_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<LabeledRequest>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.label, rl.method, rl.uri,
                COALESCE(rl.user_agent, s.user_agent), rl.request_body
         FROM sessions s
         JOIN raw_logs rl ON rl.id = (
             SELECT r.id FROM raw_logs r
             WHERE r.session_db_id = s.id
             ORDER BY r.created_at DESC, r.id DESC
             LIMIT 1
         )
         WHERE s.label IS NOT NULL
           AND UPPER(TRIM(s.label)) NOT IN ('', 'NORMAL', 'BENIGN')
           AND s.id > ?1
           AND COALESCE(s.end_time, s.created_at) >= ?2
           AND COALESCE(s.end_time, s.created_at) < ?3
         ORDER BY s.id ASC
         LIMIT ?4",
    )?;

    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt
        .query_map(
            params![after_id, format_ts(start), format_ts(end), limit],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (session_db_id, label, method, uri, user_agent, body) in rows {
        if AttackLabel::is_benign(&label) {
            continue;
        }
        let canonical = AttackLabel::from_store(&label);
        if canonical == AttackLabel::Malicious && !label.trim().eq_ignore_ascii_case("MALICIOUS") {
            warn!(
                "Session {} has unrecognised label {:?}, treating as MALICIOUS",
                session_db_id, label
            );
        }
        out.push(LabeledRequest {
            session_db_id,
            label: canonical,
            method: method.unwrap_or_default(),
            uri: uri.unwrap_or_default(),
            user_agent,
            body,
        });
    }
    Ok(out)
}

/// Insert a rule, or widen the source range of an existing one. Returns true on insert.
fn upsert_rule(conn: &Connection, rule: &StoredRule) -> Result<bool> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM generated_rules WHERE rule_id = ?1",
            [rule.rule_id],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        conn.execute(
            "UPDATE generated_rules
             SET source_min_session_db_id = MIN(source_min_session_db_id, ?2),
                 source_max_session_db_id = MAX(source_max_session_db_id, ?3)
             WHERE id = ?1",
            params![id, rule.source_min_session_db_id, rule.source_max_session_db_id],
        )?;
        return Ok(false);
    }

    conn.execute(
        "INSERT INTO generated_rules (
             rule_id, cluster_id, attack_type, label_mode, regex, variables, transformations,
             severity, tags, msg, secrule_text, source_min_session_db_id, source_max_session_db_id
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            rule.rule_id,
            rule.cluster_id as i64,
            rule.attack_type,
            rule.label_mode,
            rule.regex,
            rule.variables,
            rule.transformations,
            rule.severity,
            rule.tags,
            rule.msg,
            rule.secrule_text,
            rule.source_min_session_db_id,
            rule.source_max_session_db_id
        ],
    )?;
    Ok(true)
}

fn commit(
    conn: &mut Connection,
    expected: &Checkpoint,
    next: &Checkpoint,
    rules: &[StoredRule],
) -> Result<usize> {
    let tx = conn.transaction()?;

    let (current, raw_start) = read_stored_checkpoint(&tx)?;
    check_advance(&current, expected, next)?;

    let mut inserted = 0;
    for rule in rules {
        if upsert_rule(&tx, rule)? {
            inserted += 1;
        }
    }

    let updated = tx.execute(
        "UPDATE rule_gen_checkpoint
         SET last_session_id = ?1, window_start_time = ?2, window_hours = ?3,
             updated_at = datetime('now')
         WHERE id = 1 AND window_start_time IS ?4",
        params![
            next.last_session_id,
            format_ts(next.window_start_time),
            next.window_hours,
            raw_start
        ],
    )?;
    anyhow::ensure!(
        updated == 1,
        "checkpoint update matched {} rows, window start changed underneath",
        updated
    );

    tx.commit().context("Failed to commit window")?;
    Ok(inserted)
}

fn list_rule_rows(conn: &Connection) -> Result<Vec<StoredRule>> {
    let mut stmt = conn.prepare(
        "SELECT rule_id, cluster_id, attack_type, label_mode, regex, variables, transformations,
                severity, tags, msg, secrule_text, source_min_session_db_id, source_max_session_db_id
         FROM generated_rules ORDER BY rule_id ASC",
    )?;

    let rules = stmt
        .query_map([], |row| {
            Ok(StoredRule {
                rule_id: row.get(0)?,
                cluster_id: row.get::<_, i64>(1)?.max(0) as usize,
                attack_type: row.get(2)?,
                label_mode: row.get(3)?,
                regex: row.get(4)?,
                variables: row.get(5)?,
                transformations: row.get(6)?,
                severity: row.get(7)?,
                tags: row.get(8)?,
                msg: row.get(9)?,
                secrule_text: row.get(10)?,
                source_min_session_db_id: row.get(11)?,
                source_max_session_db_id: row.get(12)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rules)
}

#[async_trait]
impl RuleStore for SqliteStore {
    async fn ensure_schema(&self, default_window_hours: u32) -> Result<()> {
        self.blocking(move |conn| {
            init_schema(conn)?;
            seed_checkpoint(conn, default_window_hours)
        })
        .await
    }

    async fn now(&self) -> Result<DateTime<Utc>> {
        let raw: String = self
            .blocking(|conn| Ok(conn.query_row("SELECT datetime('now')", [], |row| row.get(0))?))
            .await?;
        parse_ts(&raw)
    }

    async fn read_checkpoint(&self) -> Result<Checkpoint> {
        self.blocking(|conn| read_checkpoint_row(conn)).await
    }

    async fn fetch_window(
        &self,
        after_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LabeledRequest>> {
        self.blocking(move |conn| fetch_window_rows(conn, after_id, start, end, limit))
            .await
            .context("Failed to fetch window candidates")
    }

    async fn commit_window(
        &self,
        expected: &Checkpoint,
        next: &Checkpoint,
        rules: Vec<StoredRule>,
    ) -> Result<usize> {
        let expected = *expected;
        let next = *next;
        self.blocking(move |conn| commit(conn, &expected, &next, &rules))
            .await
    }

    async fn list_rules(&self) -> Result<Vec<StoredRule>> {
        self.blocking(|conn| list_rule_rows(conn)).await
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{run_windows, RunSettings, StopReason, WindowState};
    use crate::pipeline::RulePipeline;
    use crate::pipeline_config::PipelineConfig;
    use chrono::{Duration, TimeZone};

    fn rule(rule_id: i64, min: i64, max: i64, regex: &str) -> StoredRule {
        StoredRule {
            rule_id,
            cluster_id: (rule_id - 200_000) as usize,
            attack_type: "sqli".to_string(),
            label_mode: "SQL_INJECTION".to_string(),
            regex: regex.to_string(),
            variables: "ARGS|REQUEST_BODY".to_string(),
            transformations: "t:urlDecodeUni,t:lowercase".to_string(),
            severity: "CRITICAL".to_string(),
            tags: "attack-sqli".to_string(),
            msg: "m".to_string(),
            secrule_text: format!("SecRule ARGS \"@rx {}\" \"id:{}\"", regex, rule_id),
            source_min_session_db_id: min,
            source_max_session_db_id: max,
        }
    }

    #[test]
    fn test_timestamp_format_round_trip() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 13, 5, 9).unwrap();
        assert_eq!(format_ts(ts), "2025-06-01 13:05:09");
        assert_eq!(parse_ts("2025-06-01 13:05:09").unwrap(), ts);
        assert_eq!(parse_ts("2025-06-01T13:05:09Z").unwrap(), ts);
        assert!(parse_ts("yesterday").is_err());
    }

    #[tokio::test]
    async fn test_seeded_checkpoint() {
        let store = SqliteStore::open_memory().unwrap();
        store.ensure_schema(24).await.unwrap();
        store.ensure_schema(6).await.unwrap();

        let cp = store.read_checkpoint().await.unwrap();
        let now = store.now().await.unwrap();
        assert_eq!(cp.last_session_id, 0);
        assert_eq!(cp.window_hours, 24);
        assert_eq!(format_ts(cp.window_start_time).get(11..), Some("00:00:00"));
        assert!(cp.window_end() <= now);
        assert!(now - cp.window_start_time < Duration::hours(48));
    }

    #[tokio::test]
    async fn test_duplicate_rule_only_widens_range() {
        let store = SqliteStore::open_memory().unwrap();
        store.ensure_schema(24).await.unwrap();

        let cp = store.read_checkpoint().await.unwrap();
        let next = cp.advanced(50);
        let inserted = store
            .commit_window(&cp, &next, vec![rule(200_001, 10, 50, "union.{0,50}select")])
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let after = next.advanced(90);
        let inserted = store
            .commit_window(&next, &after, vec![rule(200_001, 60, 90, "sleep\\(.{0,50}drop")])
            .await
            .unwrap();
        assert_eq!(inserted, 0);

        let rules = store.list_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].regex, "union.{0,50}select");
        assert_eq!(rules[0].source_min_session_db_id, 10);
        assert_eq!(rules[0].source_max_session_db_id, 90);
        assert_eq!(store.read_checkpoint().await.unwrap(), after);
    }

    #[tokio::test]
    async fn test_stale_commit_rolls_back() {
        let store = SqliteStore::open_memory().unwrap();
        store.ensure_schema(24).await.unwrap();

        let cp = store.read_checkpoint().await.unwrap();
        store.commit_window(&cp, &cp.advanced(5), Vec::new()).await.unwrap();

        // second writer still holds the old checkpoint
        let result = store
            .commit_window(&cp, &cp.advanced(9), vec![rule(200_000, 1, 9, "a.{0,50}b")])
            .await;
        assert!(result.is_err());
        assert!(store.list_rules().await.unwrap().is_empty());
        assert_eq!(store.read_checkpoint().await.unwrap().last_session_id, 5);
    }

    fn set_raw_window_start(store: &SqliteStore, raw: Option<&str>) {
        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE rule_gen_checkpoint SET window_start_time = ?1 WHERE id = 1",
                    [raw],
                )?;
                Ok(())
            })
            .unwrap();
    }

    fn raw_window_start(store: &SqliteStore) -> Option<String> {
        store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT window_start_time FROM rule_gen_checkpoint WHERE id = 1",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap()
    }

    fn pipeline() -> RulePipeline {
        RulePipeline::new(PipelineConfig::default())
    }

    #[tokio::test]
    async fn test_missing_window_start_is_pinned_and_advances() {
        let store = SqliteStore::open_memory().unwrap();
        store.ensure_schema(24).await.unwrap();
        let seeded = store.read_checkpoint().await.unwrap();
        set_raw_window_start(&store, None);

        let first = run_windows(&store, &pipeline(), None, &RunSettings::default())
            .await
            .unwrap();
        assert_eq!(first.windows.len(), 1);
        assert_eq!(first.windows[0].state, WindowState::EmptyAdvance);
        assert_eq!(first.windows[0].window_start, seeded.window_start_time);

        let cp = store.read_checkpoint().await.unwrap();
        assert_eq!(cp.window_start_time, seeded.window_end());
        assert_eq!(raw_window_start(&store), Some(format_ts(seeded.window_end())));

        let second = run_windows(&store, &pipeline(), None, &RunSettings::default())
            .await
            .unwrap();
        assert_eq!(second.stop, StopReason::Waiting);
        assert_eq!(store.read_checkpoint().await.unwrap(), cp);
    }

    #[tokio::test]
    async fn test_commit_over_missing_window_start() {
        let store = SqliteStore::open_memory().unwrap();
        store.ensure_schema(24).await.unwrap();
        set_raw_window_start(&store, None);

        let cp = store.read_checkpoint().await.unwrap();
        store.commit_window(&cp, &cp.advanced(4), Vec::new()).await.unwrap();

        let after = store.read_checkpoint().await.unwrap();
        assert_eq!(after, cp.advanced(4));
        assert_eq!(raw_window_start(&store), Some(format_ts(after.window_start_time)));
    }

    #[tokio::test]
    async fn test_rfc3339_window_start_advances() {
        let store = SqliteStore::open_memory().unwrap();
        store.ensure_schema(24).await.unwrap();
        set_raw_window_start(&store, Some("2025-01-01T00:00:00Z"));

        let settings = RunSettings {
            max_windows_per_run: 2,
            ..RunSettings::default()
        };
        let report = run_windows(&store, &pipeline(), None, &settings).await.unwrap();
        assert_eq!(report.windows.len(), 2);
        assert!(report.windows.iter().all(|w| w.state == WindowState::EmptyAdvance));

        let start = Utc.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap();
        assert_eq!(store.read_checkpoint().await.unwrap().window_start_time, start);
        assert_eq!(raw_window_start(&store).as_deref(), Some("2025-01-03 00:00:00"));
    }

    #[tokio::test]
    async fn test_fetch_window_representative_row() {
        let store = SqliteStore::open_memory().unwrap();
        store.ensure_schema(24).await.unwrap();
        let start = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let end = start + Duration::hours(24);

        let s1 = store
            .insert_session("a", Some("SQL injection"), Some("sqlmap/1.7"), start + Duration::hours(1), None)
            .unwrap();
        store
            .insert_raw_log(s1, "GET", "/old", None, None, start + Duration::minutes(61))
            .unwrap();
        store
            .insert_raw_log(s1, "GET", "/item?id=1 union select 1", None, None, start + Duration::minutes(65))
            .unwrap();

        let benign = store
            .insert_session("b", Some("NORMAL"), None, start + Duration::hours(2), None)
            .unwrap();
        store
            .insert_raw_log(benign, "GET", "/", None, None, start + Duration::hours(2))
            .unwrap();

        // ended after the window closed
        let late = store
            .insert_session("c", Some("PATH_TRAVERSAL"), None, start + Duration::hours(23), Some(end))
            .unwrap();
        store
            .insert_raw_log(late, "GET", "/../../etc/passwd", None, None, end)
            .unwrap();

        // no raw log at all
        store
            .insert_session("d", Some("MALICIOUS"), None, start + Duration::hours(3), None)
            .unwrap();

        let rows = store.fetch_window(0, start, end, 100).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].session_db_id, s1);
        assert_eq!(rows[0].label, AttackLabel::SqlInjection);
        assert_eq!(rows[0].uri, "/item?id=1 union select 1");
        assert_eq!(rows[0].user_agent.as_deref(), Some("sqlmap/1.7"));

        assert!(store.fetch_window(s1, start, end, 100).await.unwrap().is_empty());
    }
}
