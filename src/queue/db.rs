use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rusqlite::{
    Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params,
};

use super::models::*;
use crate::errors::{QueueError, QueueResult};

/// Async-safe handle to the queue database.
///
/// Wraps `QueueDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<QueueDb>>,
}

impl DbHandle {
    pub fn new(db: QueueDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> QueueResult<R>
    where
        F: FnOnce(&QueueDb) -> QueueResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| QueueError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

}

const ITEM_COLUMNS: &str = "queue_id, group_id, phase_number, external_ref, status, \
     depends_on_phase, payload, error_message, created_at, updated_at";

/// Raw row shape; `into_item` parses the text columns.
struct PhaseRow {
    queue_id: String,
    group_id: i64,
    phase_number: u32,
    external_ref: Option<i64>,
    status: String,
    depends_on_phase: Option<u32>,
    payload: String,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
}

impl PhaseRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            queue_id: row.get(0)?,
            group_id: row.get(1)?,
            phase_number: row.get(2)?,
            external_ref: row.get(3)?,
            status: row.get(4)?,
            depends_on_phase: row.get(5)?,
            payload: row.get(6)?,
            error_message: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_item(self) -> QueueResult<PhaseQueueItem> {
        let status = self
            .status
            .parse::<PhaseStatus>()
            .map_err(|e| QueueError::Database(anyhow::anyhow!(e)))?;
        let payload = serde_json::from_str(&self.payload)
            .with_context(|| format!("Corrupt payload for phase {}", self.queue_id))?;
        Ok(PhaseQueueItem {
            queue_id: self.queue_id,
            group_id: self.group_id,
            phase_number: self.phase_number,
            external_ref: self.external_ref,
            status,
            depends_on_phase: PhaseDependency::from(self.depends_on_phase),
            payload,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn query_items(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> QueueResult<Vec<PhaseQueueItem>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, PhaseRow::from_row)?;
    let mut items = Vec::new();
    for row in rows {
        items.push(row?.into_item()?);
    }
    Ok(items)
}

fn fetch_item(conn: &Connection, queue_id: &str) -> QueueResult<Option<PhaseQueueItem>> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM phase_queue WHERE queue_id = ?1");
    let row = conn
        .query_row(&sql, params![queue_id], PhaseRow::from_row)
        .optional()?;
    row.map(PhaseRow::into_item).transpose()
}

fn require_item(conn: &Connection, queue_id: &str) -> QueueResult<PhaseQueueItem> {
    fetch_item(conn, queue_id)?.ok_or_else(|| QueueError::not_found(queue_id))
}

fn group_items(conn: &Connection, group_id: i64) -> QueueResult<Vec<PhaseQueueItem>> {
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM phase_queue WHERE group_id = ?1 ORDER BY phase_number"
    );
    query_items(conn, &sql, params![group_id])
}

/// Guarded status change: only applies if the stored status is still `from`.
/// Returns whether the row was updated.
fn guarded_update(
    conn: &Connection,
    queue_id: &str,
    from: PhaseStatus,
    to: PhaseStatus,
    error_message: Option<&str>,
) -> QueueResult<bool> {
    let changed = conn.execute(
        "UPDATE phase_queue SET status = ?1, error_message = ?2, updated_at = ?3
         WHERE queue_id = ?4 AND status = ?5",
        params![to.as_str(), error_message, now(), queue_id, from.as_str()],
    )?;
    Ok(changed == 1)
}

/// Every phase whose dependency chain traces back to `root_phase`.
/// Returned in ascending phase order; the root itself is excluded.
fn transitive_dependents(items: &[PhaseQueueItem], root_phase: u32) -> Vec<&PhaseQueueItem> {
    let mut reached: HashSet<u32> = HashSet::from([root_phase]);
    let mut dependents = Vec::new();
    let mut grew = true;
    while grew {
        grew = false;
        for item in items {
            if reached.contains(&item.phase_number) {
                continue;
            }
            if let Some(pred) = item.depends_on_phase.predecessor()
                && reached.contains(&pred)
            {
                reached.insert(item.phase_number);
                dependents.push(item);
                grew = true;
            }
        }
    }
    dependents.sort_by_key(|i| i.phase_number);
    dependents
}

pub struct QueueDb {
    conn: Connection,
}

impl QueueDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> anyhow::Result<()> {
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to configure busy timeout")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    /// Start a write transaction holding the RESERVED lock up front, so a
    /// concurrent writer in another process waits on `busy_timeout` instead
    /// of failing the lock upgrade with SQLITE_BUSY.
    fn write_tx(&self) -> QueueResult<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS phase_queue (
                    queue_id TEXT PRIMARY KEY,
                    group_id INTEGER NOT NULL,
                    phase_number INTEGER NOT NULL CHECK (phase_number >= 1),
                    external_ref INTEGER,
                    status TEXT NOT NULL DEFAULT 'queued',
                    depends_on_phase INTEGER
                        CHECK (depends_on_phase IS NULL OR depends_on_phase < phase_number),
                    payload TEXT NOT NULL DEFAULT '{}',
                    error_message TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(group_id, phase_number)
                );

                CREATE INDEX IF NOT EXISTS idx_phase_queue_status ON phase_queue(status);
                CREATE INDEX IF NOT EXISTS idx_phase_queue_group
                    ON phase_queue(group_id, phase_number);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Creation ──────────────────────────────────────────────────────

    /// Insert a full linear chain for `group_id` in one transaction.
    /// Payloads must already be validated by the caller.
    pub fn insert_chain(
        &self,
        group_id: i64,
        payloads: Vec<serde_json::Value>,
    ) -> QueueResult<Vec<PhaseQueueItem>> {
        let tx = self.write_tx()?;

        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM phase_queue WHERE group_id = ?1",
            params![group_id],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Err(QueueError::Validation(format!(
                "group {} already has {} queued phases; cancel it before re-enqueueing",
                group_id, existing
            )));
        }

        let created_at = now();
        for (idx, payload) in payloads.into_iter().enumerate() {
            let phase_number = idx as u32 + 1;
            let dependency = PhaseDependency::linear(phase_number);
            let status = match dependency {
                PhaseDependency::Root => PhaseStatus::Ready,
                PhaseDependency::After(_) => PhaseStatus::Queued,
            };
            let payload =
                serde_json::to_string(&payload).context("Failed to serialize phase payload")?;
            tx.execute(
                "INSERT INTO phase_queue
                    (queue_id, group_id, phase_number, status, depends_on_phase, payload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    group_id,
                    phase_number,
                    status.as_str(),
                    dependency.predecessor(),
                    payload,
                    created_at,
                ],
            )?;
        }

        let items = group_items(&tx, group_id)?;
        tx.commit()?;
        Ok(items)
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn get_item(&self, queue_id: &str) -> QueueResult<Option<PhaseQueueItem>> {
        fetch_item(&self.conn, queue_id)
    }

    pub fn list_by_group(&self, group_id: i64) -> QueueResult<Vec<PhaseQueueItem>> {
        group_items(&self.conn, group_id)
    }

    pub fn list_by_status(
        &self,
        status: PhaseStatus,
        group_id: Option<i64>,
    ) -> QueueResult<Vec<PhaseQueueItem>> {
        match group_id {
            Some(group_id) => {
                let sql = format!(
                    "SELECT {ITEM_COLUMNS} FROM phase_queue
                     WHERE status = ?1 AND group_id = ?2 ORDER BY phase_number"
                );
                query_items(&self.conn, &sql, params![status.as_str(), group_id])
            }
            None => {
                let sql = format!(
                    "SELECT {ITEM_COLUMNS} FROM phase_queue
                     WHERE status = ?1 ORDER BY group_id, phase_number"
                );
                query_items(&self.conn, &sql, params![status.as_str()])
            }
        }
    }

    pub fn list_groups(&self) -> QueueResult<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT group_id FROM phase_queue ORDER BY group_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    // ── Transitions ───────────────────────────────────────────────────

    /// `ready -> running`, recording the execution engine's reference.
    pub fn mark_running(&self, queue_id: &str, external_ref: i64) -> QueueResult<PhaseQueueItem> {
        let tx = self.write_tx()?;
        let item = require_item(&tx, queue_id)?;
        if item.status != PhaseStatus::Ready {
            return Err(QueueError::invalid_transition(
                queue_id,
                item.status,
                PhaseStatus::Running,
            ));
        }

        let running_in_group: i64 = tx.query_row(
            "SELECT COUNT(*) FROM phase_queue WHERE group_id = ?1 AND status = 'running'",
            params![item.group_id],
            |row| row.get(0),
        )?;
        if running_in_group > 0 {
            return Err(QueueError::invalid_transition(
                queue_id,
                item.status,
                PhaseStatus::Running,
            ));
        }

        let changed = tx.execute(
            "UPDATE phase_queue SET status = 'running', external_ref = ?1, updated_at = ?2
             WHERE queue_id = ?3 AND status = 'ready'",
            params![external_ref, now(), queue_id],
        )?;
        if changed != 1 {
            let current = require_item(&tx, queue_id)?;
            return Err(QueueError::invalid_transition(
                queue_id,
                current.status,
                PhaseStatus::Running,
            ));
        }

        let updated = require_item(&tx, queue_id)?;
        tx.commit()?;
        Ok(updated)
    }

    /// `running -> completed`, then release the direct successor.
    pub fn mark_complete(&self, queue_id: &str) -> QueueResult<CompletionOutcome> {
        let tx = self.write_tx()?;
        let item = require_item(&tx, queue_id)?;

        match item.status {
            PhaseStatus::Completed => {
                return Ok(CompletionOutcome {
                    item,
                    changed: false,
                    promoted: None,
                });
            }
            PhaseStatus::Running => {}
            other => {
                return Err(QueueError::invalid_transition(
                    queue_id,
                    other,
                    PhaseStatus::Completed,
                ));
            }
        }

        if !guarded_update(&tx, queue_id, PhaseStatus::Running, PhaseStatus::Completed, None)? {
            // Lost a race with another writer; report what it left behind.
            let current = require_item(&tx, queue_id)?;
            if current.status == PhaseStatus::Completed {
                return Ok(CompletionOutcome {
                    item: current,
                    changed: false,
                    promoted: None,
                });
            }
            return Err(QueueError::invalid_transition(
                queue_id,
                current.status,
                PhaseStatus::Completed,
            ));
        }

        let successor: Option<String> = tx
            .query_row(
                "SELECT queue_id FROM phase_queue
                 WHERE group_id = ?1 AND depends_on_phase = ?2 AND status = 'queued'",
                params![item.group_id, item.phase_number],
                |row| row.get(0),
            )
            .optional()?;

        let mut promoted = None;
        if let Some(next_id) = successor
            && guarded_update(&tx, &next_id, PhaseStatus::Queued, PhaseStatus::Ready, None)?
        {
            promoted = Some(require_item(&tx, &next_id)?);
        }

        let updated = require_item(&tx, queue_id)?;
        tx.commit()?;
        Ok(CompletionOutcome {
            item: updated,
            changed: true,
            promoted,
        })
    }

    /// `running -> failed`, then block every pending transitive dependent.
    pub fn mark_failed(&self, queue_id: &str, error_message: &str) -> QueueResult<FailureOutcome> {
        let tx = self.write_tx()?;
        let item = require_item(&tx, queue_id)?;

        match item.status {
            PhaseStatus::Failed => {
                return Ok(FailureOutcome {
                    item,
                    changed: false,
                    blocked: Vec::new(),
                });
            }
            PhaseStatus::Running => {}
            other => {
                return Err(QueueError::invalid_transition(
                    queue_id,
                    other,
                    PhaseStatus::Failed,
                ));
            }
        }

        if !guarded_update(
            &tx,
            queue_id,
            PhaseStatus::Running,
            PhaseStatus::Failed,
            Some(error_message),
        )? {
            let current = require_item(&tx, queue_id)?;
            if current.status == PhaseStatus::Failed {
                return Ok(FailureOutcome {
                    item: current,
                    changed: false,
                    blocked: Vec::new(),
                });
            }
            return Err(QueueError::invalid_transition(
                queue_id,
                current.status,
                PhaseStatus::Failed,
            ));
        }

        let annotation = format!(
            "Blocked: phase {} ({}) failed",
            item.phase_number, item.queue_id
        );
        let siblings = group_items(&tx, item.group_id)?;
        let mut blocked = Vec::new();
        for dependent in transitive_dependents(&siblings, item.phase_number) {
            if !dependent.status.is_pending() {
                continue;
            }
            if guarded_update(
                &tx,
                &dependent.queue_id,
                dependent.status,
                PhaseStatus::Blocked,
                Some(&annotation),
            )? {
                blocked.push(require_item(&tx, &dependent.queue_id)?);
            }
        }

        let updated = require_item(&tx, queue_id)?;
        tx.commit()?;
        Ok(FailureOutcome {
            item: updated,
            changed: true,
            blocked,
        })
    }

    // ── Administrative removal ────────────────────────────────────────

    /// Delete a not-yet-started phase together with its pending dependents.
    /// `force` lifts the status restriction for the target and dependents.
    pub fn remove(&self, queue_id: &str, force: bool) -> QueueResult<RemovalOutcome> {
        let tx = self.write_tx()?;
        let item = require_item(&tx, queue_id)?;
        if !force && !item.status.is_pending() {
            return Err(QueueError::Validation(format!(
                "phase {} is {}; pass force to remove it",
                queue_id, item.status
            )));
        }

        let siblings = group_items(&tx, item.group_id)?;
        let mut doomed = vec![item.queue_id.clone()];
        doomed.extend(
            transitive_dependents(&siblings, item.phase_number)
                .into_iter()
                .filter(|d| force || d.status.is_pending())
                .map(|d| d.queue_id.clone()),
        );

        let mut removed = Vec::new();
        for id in doomed {
            let deleted = if force {
                tx.execute("DELETE FROM phase_queue WHERE queue_id = ?1", params![id])?
            } else {
                tx.execute(
                    "DELETE FROM phase_queue WHERE queue_id = ?1 AND status IN ('queued', 'ready')",
                    params![id],
                )?
            };
            if deleted == 1 {
                removed.push(id);
            }
        }

        tx.commit()?;
        Ok(RemovalOutcome {
            group_id: Some(item.group_id),
            removed,
        })
    }

    /// Delete every phase of a group. Without `force` nothing is removed if
    /// any phase is running.
    pub fn cancel_group(&self, group_id: i64, force: bool) -> QueueResult<RemovalOutcome> {
        let tx = self.write_tx()?;
        let items = group_items(&tx, group_id)?;
        if !force && items.iter().any(|i| i.status == PhaseStatus::Running) {
            return Err(QueueError::Validation(format!(
                "group {} has a running phase; pass force to cancel it",
                group_id
            )));
        }

        let mut removed = Vec::new();
        for item in items {
            if !force && !item.status.is_pending() {
                continue;
            }
            tx.execute(
                "DELETE FROM phase_queue WHERE queue_id = ?1",
                params![item.queue_id],
            )?;
            removed.push(item.queue_id);
        }

        tx.commit()?;
        Ok(RemovalOutcome {
            group_id: Some(group_id),
            removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(db: &QueueDb, group_id: i64, n: usize) -> Vec<PhaseQueueItem> {
        let payloads = (1..=n)
            .map(|i| NewPhase::titled(&format!("phase {i}")).into_payload())
            .collect();
        db.insert_chain(group_id, payloads).unwrap()
    }

    fn status_of(db: &QueueDb, queue_id: &str) -> PhaseStatus {
        db.get_item(queue_id).unwrap().unwrap().status
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = QueueDb::new_in_memory().unwrap();
        db.run_migrations().unwrap();
        db.run_migrations().unwrap();
    }

    #[test]
    fn test_insert_chain_shapes_linear_dependencies() {
        let db = QueueDb::new_in_memory().unwrap();
        let items = chain(&db, 10, 4);

        assert_eq!(items.len(), 4);
        assert_eq!(items[0].status, PhaseStatus::Ready);
        assert_eq!(items[0].depends_on_phase, PhaseDependency::Root);
        for item in &items[1..] {
            assert_eq!(item.status, PhaseStatus::Queued);
            assert_eq!(
                item.depends_on_phase,
                PhaseDependency::After(item.phase_number - 1)
            );
            assert!(item.external_ref.is_none());
            assert!(item.error_message.is_none());
        }
        assert_eq!(items[2].title(), Some("phase 3"));
    }

    #[test]
    fn test_insert_chain_rejects_existing_group() {
        let db = QueueDb::new_in_memory().unwrap();
        chain(&db, 10, 2);
        let err = db
            .insert_chain(10, vec![serde_json::json!({"title": "again"})])
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert_eq!(db.list_by_group(10).unwrap().len(), 2);
    }

    #[test]
    fn test_schema_rejects_forward_dependency() {
        let db = QueueDb::new_in_memory().unwrap();
        let result = db.conn.execute(
            "INSERT INTO phase_queue (queue_id, group_id, phase_number, depends_on_phase, created_at, updated_at)
             VALUES ('x', 1, 2, 3, 'now', 'now')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_mark_running_requires_ready() {
        let db = QueueDb::new_in_memory().unwrap();
        let items = chain(&db, 1, 2);

        let err = db.mark_running(&items[1].queue_id, 5).unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: PhaseStatus::Queued,
                to: PhaseStatus::Running,
                ..
            }
        ));
        assert_eq!(status_of(&db, &items[1].queue_id), PhaseStatus::Queued);

        let running = db.mark_running(&items[0].queue_id, 5).unwrap();
        assert_eq!(running.status, PhaseStatus::Running);
        assert_eq!(running.external_ref, Some(5));

        // Double dispatch is rejected.
        assert!(db.mark_running(&items[0].queue_id, 6).is_err());
        assert_eq!(
            db.get_item(&items[0].queue_id).unwrap().unwrap().external_ref,
            Some(5)
        );
    }

    #[test]
    fn test_complete_promotes_only_direct_successor() {
        let db = QueueDb::new_in_memory().unwrap();
        let items = chain(&db, 1, 4);
        db.mark_running(&items[0].queue_id, 100).unwrap();

        let outcome = db.mark_complete(&items[0].queue_id).unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.item.status, PhaseStatus::Completed);
        let promoted = outcome.promoted.unwrap();
        assert_eq!(promoted.queue_id, items[1].queue_id);
        assert_eq!(promoted.status, PhaseStatus::Ready);
        assert_eq!(status_of(&db, &items[2].queue_id), PhaseStatus::Queued);
        assert_eq!(status_of(&db, &items[3].queue_id), PhaseStatus::Queued);
    }

    #[test]
    fn test_complete_last_phase_promotes_nothing() {
        let db = QueueDb::new_in_memory().unwrap();
        let items = chain(&db, 1, 1);
        db.mark_running(&items[0].queue_id, 1).unwrap();
        let outcome = db.mark_complete(&items[0].queue_id).unwrap();
        assert!(outcome.promoted.is_none());
    }

    #[test]
    fn test_complete_twice_is_noop() {
        let db = QueueDb::new_in_memory().unwrap();
        let items = chain(&db, 1, 3);
        db.mark_running(&items[0].queue_id, 1).unwrap();
        db.mark_complete(&items[0].queue_id).unwrap();
        db.mark_running(&items[1].queue_id, 2).unwrap();

        let again = db.mark_complete(&items[0].queue_id).unwrap();
        assert!(!again.changed);
        assert!(again.promoted.is_none());
        assert_eq!(again.item.status, PhaseStatus::Completed);
        // Successor keeps its own progress.
        assert_eq!(status_of(&db, &items[1].queue_id), PhaseStatus::Running);
    }

    #[test]
    fn test_complete_from_ready_is_rejected() {
        let db = QueueDb::new_in_memory().unwrap();
        let items = chain(&db, 1, 2);
        let err = db.mark_complete(&items[0].queue_id).unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
        assert_eq!(status_of(&db, &items[0].queue_id), PhaseStatus::Ready);
    }

    #[test]
    fn test_failure_cascades_transitively() {
        let db = QueueDb::new_in_memory().unwrap();
        let items = chain(&db, 7, 3);
        db.mark_running(&items[0].queue_id, 1).unwrap();

        let outcome = db.mark_failed(&items[0].queue_id, "compile error").unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.item.status, PhaseStatus::Failed);
        assert_eq!(outcome.item.error_message.as_deref(), Some("compile error"));

        let blocked_ids: Vec<_> = outcome.blocked.iter().map(|i| i.queue_id.clone()).collect();
        assert_eq!(blocked_ids, vec![items[1].queue_id.clone(), items[2].queue_id.clone()]);
        for blocked in &outcome.blocked {
            assert_eq!(blocked.status, PhaseStatus::Blocked);
            let note = blocked.error_message.as_deref().unwrap();
            assert!(note.contains(&items[0].queue_id));
        }
    }

    #[test]
    fn test_failure_mid_chain_keeps_completed_predecessors() {
        let db = QueueDb::new_in_memory().unwrap();
        let items = chain(&db, 7, 4);
        db.mark_running(&items[0].queue_id, 1).unwrap();
        db.mark_complete(&items[0].queue_id).unwrap();
        db.mark_running(&items[1].queue_id, 2).unwrap();

        let outcome = db.mark_failed(&items[1].queue_id, "boom").unwrap();
        assert_eq!(outcome.blocked.len(), 2);
        assert_eq!(status_of(&db, &items[0].queue_id), PhaseStatus::Completed);
        assert_eq!(status_of(&db, &items[3].queue_id), PhaseStatus::Blocked);
    }

    #[test]
    fn test_failure_does_not_touch_other_groups() {
        let db = QueueDb::new_in_memory().unwrap();
        let a = chain(&db, 1, 2);
        let b = chain(&db, 2, 2);
        db.mark_running(&a[0].queue_id, 1).unwrap();
        db.mark_failed(&a[0].queue_id, "x").unwrap();
        assert_eq!(status_of(&db, &b[1].queue_id), PhaseStatus::Queued);
    }

    #[test]
    fn test_blocked_is_terminal() {
        let db = QueueDb::new_in_memory().unwrap();
        let items = chain(&db, 1, 2);
        db.mark_running(&items[0].queue_id, 1).unwrap();
        db.mark_failed(&items[0].queue_id, "x").unwrap();

        assert!(db.mark_running(&items[1].queue_id, 2).is_err());
        assert!(db.mark_complete(&items[1].queue_id).is_err());
        assert_eq!(status_of(&db, &items[1].queue_id), PhaseStatus::Blocked);
    }

    #[test]
    fn test_list_by_status_filters_group() {
        let db = QueueDb::new_in_memory().unwrap();
        let a = chain(&db, 1, 2);
        let b = chain(&db, 2, 2);
        db.mark_running(&a[0].queue_id, 1).unwrap();
        db.mark_running(&b[0].queue_id, 2).unwrap();

        assert_eq!(db.list_by_status(PhaseStatus::Running, None).unwrap().len(), 2);
        let only_b = db.list_by_status(PhaseStatus::Running, Some(2)).unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].queue_id, b[0].queue_id);
        assert_eq!(db.list_groups().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_remove_pending_drops_dependents() {
        let db = QueueDb::new_in_memory().unwrap();
        let items = chain(&db, 1, 3);
        let outcome = db.remove(&items[1].queue_id, false).unwrap();
        assert_eq!(outcome.removed.len(), 2);
        assert_eq!(db.list_by_group(1).unwrap().len(), 1);
    }

    #[test]
    fn test_remove_running_requires_force() {
        let db = QueueDb::new_in_memory().unwrap();
        let items = chain(&db, 1, 2);
        db.mark_running(&items[0].queue_id, 1).unwrap();

        let err = db.remove(&items[0].queue_id, false).unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert_eq!(db.list_by_group(1).unwrap().len(), 2);

        let outcome = db.remove(&items[0].queue_id, true).unwrap();
        assert_eq!(outcome.removed.len(), 2);
        assert!(db.list_by_group(1).unwrap().is_empty());
    }

    #[test]
    fn test_remove_terminal_requires_force() {
        let db = QueueDb::new_in_memory().unwrap();
        let done = chain(&db, 1, 1);
        db.mark_running(&done[0].queue_id, 1).unwrap();
        db.mark_complete(&done[0].queue_id).unwrap();

        let broken = chain(&db, 2, 2);
        db.mark_running(&broken[0].queue_id, 2).unwrap();
        db.mark_failed(&broken[0].queue_id, "boom").unwrap();

        for (queue_id, status) in [
            (&done[0].queue_id, PhaseStatus::Completed),
            (&broken[0].queue_id, PhaseStatus::Failed),
            (&broken[1].queue_id, PhaseStatus::Blocked),
        ] {
            let err = db.remove(queue_id, false).unwrap_err();
            assert!(matches!(err, QueueError::Validation(_)), "{status} removed");
            assert_eq!(status_of(&db, queue_id), status);
        }

        assert_eq!(db.remove(&broken[1].queue_id, true).unwrap().removed.len(), 1);
        assert_eq!(db.remove(&done[0].queue_id, true).unwrap().removed.len(), 1);
    }

    #[test]
    fn test_writer_in_other_connection_is_waited_on() {
        use std::sync::mpsc;
        use std::time::{Duration, Instant};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let db = QueueDb::new(&path).unwrap();
        let items = chain(&db, 1, 1);
        let queue_id = items[0].queue_id.clone();
        db.mark_running(&queue_id, 7).unwrap();

        let other = QueueDb::new(&path).unwrap();
        let (locked_tx, locked_rx) = mpsc::channel();
        let other_id = queue_id.clone();
        let writer = std::thread::spawn(move || {
            let tx = other.write_tx().unwrap();
            assert!(
                guarded_update(
                    &tx,
                    &other_id,
                    PhaseStatus::Running,
                    PhaseStatus::Completed,
                    None
                )
                .unwrap()
            );
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(300));
            tx.commit().unwrap();
        });

        locked_rx.recv().unwrap();
        let started = Instant::now();
        let outcome = db.mark_complete(&queue_id).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(!outcome.changed, "the other connection already completed it");
        assert_eq!(outcome.item.status, PhaseStatus::Completed);
        writer.join().unwrap();
    }

    #[test]
    fn test_concurrent_connections_transition_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let db = QueueDb::new(&path).unwrap();
        let items = chain(&db, 3, 2);
        let queue_id = items[0].queue_id.clone();
        db.mark_running(&queue_id, 11).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                let queue_id = queue_id.clone();
                std::thread::spawn(move || {
                    QueueDb::new(&path)
                        .unwrap()
                        .mark_failed(&queue_id, "worker crashed")
                        .unwrap()
                })
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(outcomes.iter().filter(|o| o.changed).count(), 1);
        let blocked: usize = outcomes.iter().map(|o| o.blocked.len()).sum();
        assert_eq!(blocked, 1);
        assert_eq!(status_of(&db, &items[1].queue_id), PhaseStatus::Blocked);
    }

    #[test]
    fn test_remove_unknown_is_not_found() {
        let db = QueueDb::new_in_memory().unwrap();
        assert!(matches!(
            db.remove("missing", true).unwrap_err(),
            QueueError::NotFound { .. }
        ));
    }

    #[test]
    fn test_cancel_group_respects_running() {
        let db = QueueDb::new_in_memory().unwrap();
        let items = chain(&db, 4, 3);
        db.mark_running(&items[0].queue_id, 1).unwrap();
        assert!(db.cancel_group(4, false).is_err());

        let outcome = db.cancel_group(4, true).unwrap();
        assert_eq!(outcome.removed.len(), 3);
        assert!(db.list_groups().unwrap().is_empty());
    }

    #[test]
    fn test_transitive_dependents_follows_chain() {
        let db = QueueDb::new_in_memory().unwrap();
        let items = chain(&db, 1, 5);
        let deps: Vec<u32> = transitive_dependents(&items, 2)
            .iter()
            .map(|i| i.phase_number)
            .collect();
        assert_eq!(deps, vec![3, 4, 5]);
    }
}
