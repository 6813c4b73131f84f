//! SQLite-backed metadata store: one row per step plus the tag velocity
//! table.
//!
//! The store is the durable source of truth for step runtime state. All
//! statements run on a single shared connection behind a mutex; write
//! statements are serialized, every critical section is one short query,
//! and the database runs in WAL mode so hub restarts recover cleanly.
//!
//! The dependency DAG does NOT live here; edges are read from the bucket
//! when traversal is needed.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, params_from_iter, Connection};

use sluice_core::step::{StepRow, StepStatus};

use crate::error::{Error, Result};

/// Busy timeout applied to the shared connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite caps bound variables per statement; batched `IN (...)` updates
/// stay well under it.
const IN_CHUNK: usize = 500;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS steps (
    id       TEXT PRIMARY KEY,
    priority INTEGER NOT NULL DEFAULT 0,
    scope    TEXT NOT NULL,
    velocity REAL,
    tag      TEXT NOT NULL,
    status   INTEGER NOT NULL,
    epoch    INTEGER NOT NULL,
    msg      TEXT NOT NULL DEFAULT '',
    trace    TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_steps_status ON steps (status);
CREATE INDEX IF NOT EXISTS idx_steps_scope_status ON steps (scope, status);
CREATE INDEX IF NOT EXISTS idx_steps_epoch ON steps (epoch);
CREATE INDEX IF NOT EXISTS idx_steps_priority ON steps (priority);
CREATE INDEX IF NOT EXISTS idx_steps_tag ON steps (tag);
CREATE INDEX IF NOT EXISTS idx_steps_velocity ON steps (velocity);

CREATE TABLE IF NOT EXISTS tag_velocity (
    tag            TEXT PRIMARY KEY,
    velocity_limit INTEGER NOT NULL
);
";

/// A lease candidate returned by the scheduler query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Step id.
    pub id: String,
    /// Throttling group, consulted for velocity admission.
    pub tag: String,
}

/// SQLite metadata store.
#[derive(Debug, Clone)]
pub struct StepStore {
    conn: Arc<Mutex<Connection>>,
}

impl StepStore {
    /// Opens (creating if necessary) the store at the given path.
    ///
    /// # Errors
    ///
    /// Returns a store error if the file cannot be opened or the schema
    /// cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    Error::store(format!("cannot create store directory: {err}"))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an ephemeral in-memory store.
    ///
    /// # Errors
    ///
    /// Returns a store error if the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch("PRAGMA journal_mode = wal;")?;
        conn.execute_batch("PRAGMA synchronous = normal;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::store("store lock poisoned"))
    }

    /// Inserts one step row. A duplicate id is a no-op: a retried upload of
    /// the same row carries the same content.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn insert_step(&self, row: &StepRow) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO steps (id, priority, scope, velocity, tag, status, epoch, msg, trace)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.id,
                row.priority,
                row.scope,
                row.velocity,
                row.tag,
                row.status.code(),
                row.epoch,
                row.msg,
                row.trace,
            ],
        )?;
        Ok(())
    }

    /// Inserts a batch of rows in one transaction.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure; the transaction rolls back.
    pub fn insert_steps(&self, rows: &[StepRow]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO steps (id, priority, scope, velocity, tag, status, epoch, msg, trace)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.id,
                    row.priority,
                    row.scope,
                    row.velocity,
                    row.tag,
                    row.status.code(),
                    row.epoch,
                    row.msg,
                    row.trace,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Absolute-state transition for one row: status and epoch are set,
    /// message and trace cleared.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn set_status(&self, id: &str, status: StepStatus, epoch: i64) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE steps SET status = ?1, epoch = ?2, msg = '', trace = '' WHERE id = ?3",
            params![status.code(), epoch, id],
        )?;
        Ok(changed > 0)
    }

    /// Batched transition: status and epoch for every id in the list.
    /// Used for child promotion, leasing, and DAG-wide cancel/reset.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn set_status_many(&self, ids: &[String], status: StepStatus, epoch: i64) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.lock()?;
        let code = status.code();
        let mut changed = 0;
        for chunk in ids.chunks(IN_CHUNK) {
            let sql = format!(
                "UPDATE steps SET status = ?1, epoch = ?2 WHERE id IN ({})",
                placeholders(chunk.len(), 3)
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut values: Vec<&dyn rusqlite::ToSql> = vec![&code, &epoch];
            for id in chunk {
                values.push(id);
            }
            changed += stmt.execute(values.as_slice())?;
        }
        Ok(changed)
    }

    /// Records a worker failure: status `error` with message and trace.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn set_error(&self, id: &str, epoch: i64, msg: &str, trace: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE steps SET status = ?1, epoch = ?2, msg = ?3, trace = ?4 WHERE id = ?5",
            params![StepStatus::Error.code(), epoch, msg, trace, id],
        )?;
        Ok(changed > 0)
    }

    /// Scheduler candidate selection.
    ///
    /// Returns up to `chunk` `(id, tag)` pairs where the scope matches and
    /// the row either has the requested status or is a stale `working`
    /// lease (epoch older than `lease_cutoff`). Ordered by
    /// `priority DESC, epoch ASC` (`ASC, ASC` when `reverse`).
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn candidates(
        &self,
        scopes: &[String],
        status: StepStatus,
        include_working: bool,
        lease_cutoff: i64,
        reverse: bool,
        chunk: usize,
    ) -> Result<Vec<Candidate>> {
        if scopes.is_empty() {
            return Ok(Vec::new());
        }
        let order = if reverse {
            "priority ASC, epoch ASC"
        } else {
            "priority DESC, epoch ASC"
        };
        let sql = format!(
            "SELECT id, tag FROM steps
             WHERE scope IN ({scopes}) AND (status = ?1 OR (?2 AND status = ?3 AND epoch < ?4))
             ORDER BY {order} LIMIT ?5",
            scopes = placeholders(scopes.len(), 6),
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;

        let status_code = status.code();
        let working_code = StepStatus::Working.code();
        let include = i64::from(include_working);
        let limit = i64::try_from(chunk).unwrap_or(i64::MAX);
        let mut values: Vec<&dyn rusqlite::ToSql> =
            vec![&status_code, &include, &working_code, &lease_cutoff, &limit];
        for scope in scopes {
            values.push(scope);
        }

        let rows = stmt.query_map(values.as_slice(), |row| {
            Ok(Candidate {
                id: row.get(0)?,
                tag: row.get(1)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Grouped row counts by status name. When `include_terminal` is false,
    /// `success` and `cancel` are left out.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn counts_by_status(&self, include_terminal: bool) -> Result<BTreeMap<String, i64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM steps GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            let code: i64 = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((code, count))
        })?;

        let mut out = BTreeMap::new();
        for row in rows {
            let (code, count) = row?;
            let Some(status) = StepStatus::from_code(code) else {
                continue;
            };
            if !include_terminal && status.is_terminal() {
                continue;
            }
            out.insert(status.as_label().to_string(), count);
        }
        Ok(out)
    }

    /// Fetches runtime rows by id, preserving no particular order.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn fetch_rows(&self, ids: &[String]) -> Result<Vec<StepRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT id, priority, scope, velocity, tag, status, epoch, msg, trace
                 FROM steps WHERE id IN ({})",
                placeholders(chunk.len(), 1)
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), read_row)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    /// Errored rows for diagnostics: total error count plus up to `limit`
    /// rows, skipping rows whose message or trace contains any of the
    /// exclude substrings (case-insensitive).
    ///
    /// Exclude strings are sanitized to a conservative ASCII whitelist
    /// before they reach the query.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn fetch_errors(&self, limit: usize, excludes: &[String]) -> Result<(i64, Vec<StepRow>)> {
        let sanitized: Vec<String> = excludes
            .iter()
            .map(|raw| sanitize_exclude(raw))
            .filter(|needle| !needle.is_empty())
            .collect();

        let mut sql = String::from(
            "SELECT id, priority, scope, velocity, tag, status, epoch, msg, trace
             FROM steps WHERE status = ?1",
        );
        for i in 0..sanitized.len() {
            let p = i + 3;
            sql.push_str(&format!(
                " AND instr(lower(msg), ?{p}) = 0 AND instr(lower(trace), ?{p}) = 0"
            ));
        }
        sql.push_str(" ORDER BY epoch DESC LIMIT ?2");

        let conn = self.lock()?;
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM steps WHERE status = ?1",
            params![StepStatus::Error.code()],
            |row| row.get(0),
        )?;

        let error_code = StepStatus::Error.code();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&error_code, &limit];
        for needle in &sanitized {
            values.push(needle);
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(values.as_slice(), read_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok((total, out))
    }

    /// Flips every `error` row (optionally `working` too) back to `pending`.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn reset_errors(&self, include_working: bool, epoch: i64) -> Result<usize> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE steps SET status = ?1, epoch = ?2, msg = '', trace = ''
             WHERE status = ?3 OR (?4 AND status = ?5)",
            params![
                StepStatus::Pending.code(),
                epoch,
                StepStatus::Error.code(),
                i64::from(include_working),
                StepStatus::Working.code(),
            ],
        )?;
        Ok(changed)
    }

    /// Administrative wipe of the step table.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn delete_all(&self) -> Result<usize> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM steps", [])?;
        Ok(changed)
    }

    /// Total row count.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn row_count(&self) -> Result<i64> {
        let conn = self.lock()?;
        let count = conn.query_row("SELECT COUNT(*) FROM steps", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Configured per-tag velocity limits.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn tag_limits(&self) -> Result<HashMap<String, u32>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT tag, velocity_limit FROM tag_velocity")?;
        let rows = stmt.query_map([], |row| {
            let tag: String = row.get(0)?;
            let limit: i64 = row.get(1)?;
            Ok((tag, limit))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (tag, limit) = row?;
            out.insert(tag, u32::try_from(limit.max(0)).unwrap_or(u32::MAX));
        }
        Ok(out)
    }

    /// Sets (or replaces) one tag's velocity limit.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn set_tag_limit(&self, tag: &str, limit: u32) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tag_velocity (tag, velocity_limit) VALUES (?1, ?2)
             ON CONFLICT(tag) DO UPDATE SET velocity_limit = excluded.velocity_limit",
            params![tag, i64::from(limit)],
        )?;
        Ok(())
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepRow> {
    let code: i64 = row.get(5)?;
    Ok(StepRow {
        id: row.get(0)?,
        priority: row.get(1)?,
        scope: row.get(2)?,
        velocity: row.get(3)?,
        tag: row.get(4)?,
        status: StepStatus::from_code(code).unwrap_or(StepStatus::Error),
        epoch: row.get(6)?,
        msg: row.get(7)?,
        trace: row.get(8)?,
    })
}

/// Builds `?N, ?N+1, ...` placeholder lists for `IN (...)` clauses.
fn placeholders(count: usize, start: usize) -> String {
    let mut out = String::new();
    for i in 0..count {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
        out.push_str(&(start + i).to_string());
    }
    out
}

/// Restricts an exclude substring to a conservative ASCII set so it cannot
/// smuggle query syntax, and lowercases it for case-insensitive matching.
fn sanitize_exclude(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '.' | ',' | ':' | '/' | '@' | '+' | '=' | '-'))
        .collect::<String>()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::step::Step;

    fn row(id: &str, scope: &str, tag: &str, priority: i64, status: StepStatus, epoch: i64) -> StepRow {
        let step = Step::new(id, scope, tag).with_priority(priority);
        StepRow::from_step(&step, status, epoch)
    }

    #[test]
    fn insert_and_fetch_round_trip() {
        let store = StepStore::open_in_memory().expect("open");
        store
            .insert_step(&row("a", "production", "etl", 7, StepStatus::Pending, 100))
            .expect("insert");

        let rows = store.fetch_rows(&["a".to_string()]).expect("fetch");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].priority, 7);
        assert_eq!(rows[0].scope, "production");
        assert_eq!(rows[0].tag, "etl");
        assert_eq!(rows[0].status, StepStatus::Pending);
    }

    #[test]
    fn duplicate_upload_is_a_no_op() {
        let store = StepStore::open_in_memory().expect("open");
        store
            .insert_step(&row("a", "default", "etl", 1, StepStatus::Pending, 100))
            .expect("insert");
        store
            .insert_step(&row("a", "default", "etl", 9, StepStatus::Cancel, 999))
            .expect("retried insert");

        let rows = store.fetch_rows(&["a".to_string()]).expect("fetch");
        assert_eq!(rows[0].priority, 1);
        assert_eq!(rows[0].status, StepStatus::Pending);
    }

    #[test]
    fn candidates_order_by_priority_then_epoch() {
        let store = StepStore::open_in_memory().expect("open");
        store
            .insert_step(&row("a", "s", "t", 1, StepStatus::Pending, 10))
            .expect("insert");
        store
            .insert_step(&row("b", "s", "t", 5, StepStatus::Pending, 11))
            .expect("insert");
        store
            .insert_step(&row("c", "s", "t", 5, StepStatus::Pending, 12))
            .expect("insert");

        let ids: Vec<String> = store
            .candidates(&["s".to_string()], StepStatus::Pending, true, 0, false, 10)
            .expect("candidates")
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, ["b", "c", "a"]);

        let reversed: Vec<String> = store
            .candidates(&["s".to_string()], StepStatus::Pending, true, 0, true, 10)
            .expect("candidates")
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(reversed, ["a", "b", "c"]);
    }

    #[test]
    fn candidates_reclaim_stale_working_rows() {
        let store = StepStore::open_in_memory().expect("open");
        let now = 10_000;
        store
            .insert_step(&row("stale", "s", "t", 0, StepStatus::Working, now - 800))
            .expect("insert");
        store
            .insert_step(&row("fresh", "s", "t", 0, StepStatus::Working, now - 10))
            .expect("insert");
        store
            .insert_step(&row("done", "s", "t", 0, StepStatus::Success, now - 800))
            .expect("insert");

        let cutoff = now - 720;
        let ids: Vec<String> = store
            .candidates(&["s".to_string()], StepStatus::Pending, true, cutoff, false, 10)
            .expect("candidates")
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, ["stale"]);

        // With include_working off, stale leases stay invisible.
        let ids = store
            .candidates(&["s".to_string()], StepStatus::Pending, false, cutoff, false, 10)
            .expect("candidates");
        assert!(ids.is_empty());
    }

    #[test]
    fn candidates_filter_by_scope() {
        let store = StepStore::open_in_memory().expect("open");
        store
            .insert_step(&row("a", "production", "t", 0, StepStatus::Pending, 1))
            .expect("insert");
        store
            .insert_step(&row("b", "testing", "t", 0, StepStatus::Pending, 1))
            .expect("insert");

        let ids: Vec<String> = store
            .candidates(&["production".to_string()], StepStatus::Pending, true, 0, false, 10)
            .expect("candidates")
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, ["a"]);
    }

    #[test]
    fn set_status_many_batches() {
        let store = StepStore::open_in_memory().expect("open");
        let ids: Vec<String> = (0..1200).map(|i| format!("s{i}")).collect();
        let rows: Vec<StepRow> = ids
            .iter()
            .map(|id| row(id, "s", "t", 0, StepStatus::Queued, 1))
            .collect();
        store.insert_steps(&rows).expect("insert batch");

        let changed = store
            .set_status_many(&ids, StepStatus::Pending, 50)
            .expect("update");
        assert_eq!(changed, 1200);

        let counts = store.counts_by_status(true).expect("counts");
        assert_eq!(counts.get("pending"), Some(&1200));
    }

    #[test]
    fn counts_exclude_terminal_unless_asked() {
        let store = StepStore::open_in_memory().expect("open");
        store
            .insert_step(&row("a", "s", "t", 0, StepStatus::Pending, 1))
            .expect("insert");
        store
            .insert_step(&row("b", "s", "t", 0, StepStatus::Success, 1))
            .expect("insert");
        store
            .insert_step(&row("c", "s", "t", 0, StepStatus::Cancel, 1))
            .expect("insert");

        let partial = store.counts_by_status(false).expect("counts");
        assert_eq!(partial.get("pending"), Some(&1));
        assert!(!partial.contains_key("success"));
        assert!(!partial.contains_key("cancel"));

        let all = store.counts_by_status(true).expect("counts");
        let total: i64 = all.values().sum();
        assert_eq!(total, store.row_count().expect("count"));
    }

    #[test]
    fn error_rows_and_reset() {
        let store = StepStore::open_in_memory().expect("open");
        store
            .insert_step(&row("a", "s", "t", 0, StepStatus::Working, 1))
            .expect("insert");
        store
            .set_error("a", 2, "KeyError: 'date'", "traceback ...")
            .expect("set error");

        let rows = store.fetch_rows(&["a".to_string()]).expect("fetch");
        assert_eq!(rows[0].status, StepStatus::Error);
        assert_eq!(rows[0].msg, "KeyError: 'date'");

        let changed = store.reset_errors(false, 3).expect("reset");
        assert_eq!(changed, 1);
        let rows = store.fetch_rows(&["a".to_string()]).expect("fetch");
        assert_eq!(rows[0].status, StepStatus::Pending);
        assert!(rows[0].msg.is_empty());
    }

    #[test]
    fn reset_errors_can_sweep_working_rows() {
        let store = StepStore::open_in_memory().expect("open");
        store
            .insert_step(&row("e", "s", "t", 0, StepStatus::Error, 1))
            .expect("insert");
        store
            .insert_step(&row("w", "s", "t", 0, StepStatus::Working, 1))
            .expect("insert");

        let changed = store.reset_errors(true, 5).expect("reset");
        assert_eq!(changed, 2);
    }

    #[test]
    fn fetch_errors_applies_excludes_case_insensitively() {
        let store = StepStore::open_in_memory().expect("open");
        store
            .insert_step(&row("a", "s", "t", 0, StepStatus::Working, 1))
            .expect("insert");
        store
            .insert_step(&row("b", "s", "t", 0, StepStatus::Working, 2))
            .expect("insert");
        store
            .set_error("a", 3, "Connection TIMEOUT talking to api", "")
            .expect("error");
        store
            .set_error("b", 4, "KeyError: 'date'", "")
            .expect("error");

        let (total, rows) = store.fetch_errors(10, &[]).expect("fetch");
        assert_eq!(total, 2);
        assert_eq!(rows.len(), 2);

        let (total, rows) = store
            .fetch_errors(10, &["timeout".to_string()])
            .expect("fetch");
        assert_eq!(total, 2);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "b");
        assert!(total >= i64::try_from(rows.len()).expect("len"));
    }

    #[test]
    fn fetch_errors_sanitizes_hostile_excludes() {
        let store = StepStore::open_in_memory().expect("open");
        store
            .insert_step(&row("a", "s", "t", 0, StepStatus::Working, 1))
            .expect("insert");
        store.set_error("a", 2, "boom", "").expect("error");

        // Query syntax is stripped; what survives ("1") simply doesn't match.
        let (_, rows) = store
            .fetch_errors(10, &["') OR ('1'='1".to_string()])
            .expect("fetch");
        assert!(rows.len() <= 1);

        assert_eq!(sanitize_exclude("'; DROP TABLE steps;--"), " drop table steps--");
    }

    #[test]
    fn fetch_errors_respects_limit() {
        let store = StepStore::open_in_memory().expect("open");
        for i in 0..5 {
            let id = format!("s{i}");
            store
                .insert_step(&row(&id, "s", "t", 0, StepStatus::Working, i))
                .expect("insert");
            store.set_error(&id, i + 10, "boom", "").expect("error");
        }
        let (total, rows) = store.fetch_errors(3, &[]).expect("fetch");
        assert_eq!(total, 5);
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn delete_all_wipes_the_table() {
        let store = StepStore::open_in_memory().expect("open");
        store
            .insert_step(&row("a", "s", "t", 0, StepStatus::Pending, 1))
            .expect("insert");
        assert_eq!(store.delete_all().expect("delete"), 1);
        assert_eq!(store.row_count().expect("count"), 0);
    }

    #[test]
    fn tag_limits_round_trip() {
        let store = StepStore::open_in_memory().expect("open");
        store.set_tag_limit("api", 2).expect("set");
        store.set_tag_limit("api", 4).expect("replace");
        store.set_tag_limit("db", 1).expect("set");

        let limits = store.tag_limits().expect("limits");
        assert_eq!(limits.get("api"), Some(&4));
        assert_eq!(limits.get("db"), Some(&1));
    }
}
