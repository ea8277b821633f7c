//! SQLite-backed persistence: users, tasks, the durable dispatch queue and
//! the in-app notification inbox. One database file, survives restarts.
//!
//! Timestamps are stored as RFC 3339 UTC strings with millisecond precision
//! (`2026-03-10T08:00:00.000Z`), so string comparison is time comparison.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use habitflow_core::clock::{Clock, SystemClock};
use habitflow_core::error::{HabitflowError, Result};
use habitflow_core::types::{Notification, Recipient};
use rusqlite::{Connection, OptionalExtension, params};

use crate::inbox::{InboxEntry, NotificationInbox};
use crate::queue::{DispatchJob, DispatchQueue, JobId, QueuedJob};
use crate::store::{EvaluationWindow, TaskStore};
use crate::tasks::{ReminderLadder, Task, TaskPatch};

const TASK_COLUMNS: &str = "id, owner_id, description, due_time, completed, completed_at, \
     first_reminder, second_reminder, third_reminder, fourth_reminder, final_reminder, \
     created_at, last_reminder_sent_at";

/// SQLite-backed store for everything the scheduler persists.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    reclaim_after: Duration,
    retain_finished: Duration,
}

impl SchedulerDb {
    /// Open or create the database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db("DB open"))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db("DB open"))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
            clock: Arc::new(SystemClock),
            reclaim_after: Duration::minutes(5),
            retain_finished: Duration::days(7),
        };
        db.migrate()?;
        Ok(db)
    }

    /// How long a claimed job may stay unacknowledged before it is handed
    /// out again.
    pub fn with_reclaim_after(mut self, after: Duration) -> Self {
        self.reclaim_after = after;
        self
    }

    /// How long done and failed jobs are kept before `claim` sweeps them.
    pub fn with_retention(mut self, retain: Duration) -> Self {
        self.retain_finished = retain;
        self
    }

    /// Clock used for queue bookkeeping (claim, reclaim, finish times).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create tables. Safe to run on every start.
    fn migrate(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                display_name TEXT
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                description TEXT NOT NULL,
                due_time TEXT,
                completed INTEGER NOT NULL DEFAULT 0,
                completed_at TEXT,
                first_reminder INTEGER NOT NULL DEFAULT 0,
                second_reminder INTEGER NOT NULL DEFAULT 0,
                third_reminder INTEGER NOT NULL DEFAULT 0,
                fourth_reminder INTEGER NOT NULL DEFAULT 0,
                final_reminder INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_reminder_sent_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_candidates
                ON tasks(completed, final_reminder, created_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner_id, created_at);

            -- pending -> running -> done | failed
            CREATE TABLE IF NOT EXISTS dispatch_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                dedup_key TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                enqueued_at TEXT NOT NULL,
                claimed_at TEXT,
                finished_at TEXT,
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_dispatch_jobs_status ON dispatch_jobs(status, id);

            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                receiver_id TEXT NOT NULL,
                actor_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                message TEXT NOT NULL,
                subject_id TEXT,
                read INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_receiver
                ON notifications(receiver_id, created_at);
            ",
            )
            .map_err(db("Migration"))?;
        Ok(())
    }

    fn read_task(conn: &Connection, id: &str) -> Result<Option<Task>> {
        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
            task_from_row,
        )
        .optional()
        .map_err(db("Get task"))
    }

    fn query_tasks(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Task>> {
        let mut stmt = conn.prepare(sql).map_err(db("Prepare task query"))?;
        let rows = stmt
            .query_map(args, task_from_row)
            .map_err(db("Query tasks"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db("Read task row"))
    }
}

fn db(context: &'static str) -> impl Fn(rusqlite::Error) -> HabitflowError {
    move |e| HabitflowError::Database(format!("{context}: {e}"))
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let flag = |idx: usize| -> rusqlite::Result<bool> { Ok(row.get::<_, i32>(idx)? != 0) };
    let created_at: String = row.get(11)?;
    Ok(Task {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        description: row.get(2)?,
        due_time: parse_opt_ts(3, row.get(3)?)?,
        completed: flag(4)?,
        completed_at: parse_opt_ts(5, row.get(5)?)?,
        ladder: ReminderLadder {
            first: flag(6)?,
            second: flag(7)?,
            third: flag(8)?,
            fourth: flag(9)?,
            final_notice: flag(10)?,
        },
        created_at: parse_ts(11, &created_at)?,
        last_reminder_sent_at: parse_opt_ts(12, row.get(12)?)?,
    })
}

#[async_trait]
impl TaskStore for SchedulerDb {
    async fn query_tasks_due_for_evaluation(
        &self,
        window: &EvaluationWindow,
    ) -> Result<Vec<Task>> {
        let conn = self.conn();
        Self::query_tasks(
            &conn,
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE completed = 0 AND final_reminder = 0
                   AND created_at >= ?1 AND created_at < ?2
                 ORDER BY created_at"
            ),
            &[&ts(window.from), &ts(window.until)],
        )
    }

    async fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<Task> {
        let ladder = patch.ladder.unwrap_or_default();
        let conn = self.conn();
        // Every assignment reads the pre-update row, so the patch lands as
        // one atomic, monotonic write.
        let changed = conn
            .execute(
                "UPDATE tasks SET
                    first_reminder = first_reminder | ?2,
                    second_reminder = second_reminder | ?3,
                    third_reminder = third_reminder | ?4,
                    fourth_reminder = fourth_reminder | ?5,
                    final_reminder = final_reminder | ?6,
                    last_reminder_sent_at = CASE
                        WHEN ?7 IS NULL THEN last_reminder_sent_at
                        WHEN last_reminder_sent_at IS NULL OR last_reminder_sent_at < ?7 THEN ?7
                        ELSE last_reminder_sent_at END,
                    completed_at = CASE
                        WHEN completed = 0 AND ?8 IS NOT NULL THEN ?8
                        ELSE completed_at END,
                    completed = CASE WHEN ?8 IS NOT NULL THEN 1 ELSE completed END
                 WHERE id = ?1",
                params![
                    id,
                    ladder.first as i32,
                    ladder.second as i32,
                    ladder.third as i32,
                    ladder.fourth as i32,
                    ladder.final_notice as i32,
                    patch.last_reminder_sent_at.map(ts),
                    patch.completed_at.map(ts),
                ],
            )
            .map_err(db("Update task"))?;
        if changed == 0 {
            return Err(HabitflowError::NotFound(format!("task {id}")));
        }
        Self::read_task(&conn, id)?.ok_or_else(|| HabitflowError::NotFound(format!("task {id}")))
    }

    async fn insert_task(&self, task: &Task) -> Result<()> {
        let result = self.conn().execute(
            &format!(
                "INSERT INTO tasks ({TASK_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                task.id,
                task.owner_id,
                task.description,
                task.due_time.map(ts),
                task.completed as i32,
                task.completed_at.map(ts),
                task.ladder.first as i32,
                task.ladder.second as i32,
                task.ladder.third as i32,
                task.ladder.fourth as i32,
                task.ladder.final_notice as i32,
                ts(task.created_at),
                task.last_reminder_sent_at.map(ts),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(HabitflowError::InvalidInput(format!(
                    "task {} already exists",
                    task.id
                )))
            }
            Err(e) => Err(db("Insert task")(e)),
        }
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Self::read_task(&self.conn(), id)
    }

    async fn list_tasks(&self, owner_id: &str) -> Result<Vec<Task>> {
        let conn = self.conn();
        Self::query_tasks(
            &conn,
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE owner_id = ?1 ORDER BY created_at"),
            &[&owner_id],
        )
    }

    async fn owner(&self, owner_id: &str) -> Result<Option<Recipient>> {
        self.conn()
            .query_row(
                "SELECT id, email, display_name FROM users WHERE id = ?1",
                params![owner_id],
                |row| {
                    Ok(Recipient {
                        user_id: row.get(0)?,
                        email: row.get(1)?,
                        display_name: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(db("Get user"))
    }

    async fn upsert_owner(&self, recipient: &Recipient) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO users (id, email, display_name) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    email = excluded.email,
                    display_name = excluded.display_name",
                params![recipient.user_id, recipient.email, recipient.display_name],
            )
            .map_err(db("Upsert user"))?;
        Ok(())
    }
}

#[async_trait]
impl DispatchQueue for SchedulerDb {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn enqueue(&self, job: DispatchJob) -> Result<JobId> {
        let payload = serde_json::to_string(&job)?;
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db("Begin enqueue"))?;
        // A failed job does not block the same message from being produced again.
        tx.execute(
            "DELETE FROM dispatch_jobs WHERE dedup_key = ?1 AND status = 'failed'",
            params![job.dedup_key],
        )
        .map_err(db("Enqueue"))?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO dispatch_jobs (dedup_key, kind, payload, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![job.dedup_key, job.kind.as_str(), payload, ts(job.enqueued_at)],
            )
            .map_err(db("Enqueue"))?;
        let id: i64 = tx
            .query_row(
                "SELECT id FROM dispatch_jobs WHERE dedup_key = ?1",
                params![job.dedup_key],
                |row| row.get(0),
            )
            .map_err(db("Enqueue"))?;
        tx.commit().map_err(db("Commit enqueue"))?;
        if inserted == 0 {
            tracing::debug!("📭 Duplicate job '{}' ignored (job-{id})", job.dedup_key);
        }
        Ok(JobId(id))
    }

    async fn claim(&self, max: usize) -> Result<Vec<QueuedJob>> {
        let now = self.clock.now();
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db("Begin claim"))?;

        let swept = tx
            .execute(
                "DELETE FROM dispatch_jobs
                 WHERE status IN ('done', 'failed') AND finished_at < ?1",
                params![ts(now - self.retain_finished)],
            )
            .map_err(db("Sweep jobs"))?;
        if swept > 0 {
            tracing::debug!("🧹 Removed {swept} finished dispatch job(s)");
        }

        let reclaimed = tx
            .execute(
                "UPDATE dispatch_jobs SET status = 'pending'
                 WHERE status = 'running' AND claimed_at < ?1",
                params![ts(now - self.reclaim_after)],
            )
            .map_err(db("Reclaim jobs"))?;
        if reclaimed > 0 {
            tracing::warn!("♻️ Reclaimed {reclaimed} unacknowledged dispatch job(s)");
        }

        let rows: Vec<(i64, String, u32)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, payload, attempts FROM dispatch_jobs
                     WHERE status = 'pending' ORDER BY id LIMIT ?1",
                )
                .map_err(db("Prepare claim"))?;
            let mapped = stmt
                .query_map(params![max as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .map_err(db("Claim jobs"))?;
            mapped
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db("Read job row"))?
        };

        let mut claimed = Vec::with_capacity(rows.len());
        for (id, payload, attempts) in rows {
            tx.execute(
                "UPDATE dispatch_jobs SET status = 'running', attempts = attempts + 1, claimed_at = ?2
                 WHERE id = ?1",
                params![id, ts(now)],
            )
            .map_err(db("Mark job running"))?;
            match serde_json::from_str::<DispatchJob>(&payload) {
                Ok(job) => claimed.push(QueuedJob {
                    id: JobId(id),
                    job,
                    attempts: attempts + 1,
                }),
                Err(e) => {
                    tracing::error!("❌ Unreadable dispatch job-{id}: {e}");
                    tx.execute(
                        "UPDATE dispatch_jobs SET status = 'failed', finished_at = ?3, last_error = ?2
                         WHERE id = ?1",
                        params![id, format!("bad payload: {e}"), ts(now)],
                    )
                    .map_err(db("Fail bad job"))?;
                }
            }
        }
        tx.commit().map_err(db("Commit claim"))?;
        Ok(claimed)
    }

    async fn ack(&self, id: JobId) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE dispatch_jobs SET status = 'done', finished_at = ?2 WHERE id = ?1",
                params![id.0, ts(self.clock.now())],
            )
            .map_err(db("Ack job"))?;
        Ok(())
    }

    async fn fail(&self, id: JobId, reason: &str) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE dispatch_jobs SET status = 'failed', finished_at = ?2, last_error = ?3
                 WHERE id = ?1",
                params![id.0, ts(self.clock.now()), reason],
            )
            .map_err(db("Fail job"))?;
        Ok(())
    }

    async fn pending(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM dispatch_jobs WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )
            .map_err(db("Count jobs"))?;
        Ok(count as usize)
    }
}

#[async_trait]
impl NotificationInbox for SchedulerDb {
    async fn record(&self, notification: &Notification) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO notifications (receiver_id, actor_id, event_type, message, subject_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                notification.receiver_id,
                notification.actor_id,
                notification.event_type,
                notification.message,
                notification.subject_id,
                ts(notification.created_at),
            ],
        )
        .map_err(db("Save notification"))?;
        Ok(conn.last_insert_rowid())
    }

    async fn list(&self, receiver_id: &str, unread_only: bool) -> Result<Vec<InboxEntry>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, receiver_id, actor_id, event_type, message, subject_id, read, created_at
                 FROM notifications
                 WHERE receiver_id = ?1 AND (?2 = 0 OR read = 0)
                 ORDER BY created_at DESC, id DESC",
            )
            .map_err(db("Prepare inbox"))?;
        let rows = stmt
            .query_map(params![receiver_id, unread_only as i32], |row| {
                let created_at: String = row.get(7)?;
                Ok(InboxEntry {
                    id: row.get(0)?,
                    notification: Notification {
                        receiver_id: row.get(1)?,
                        actor_id: row.get(2)?,
                        event_type: row.get(3)?,
                        message: row.get(4)?,
                        subject_id: row.get(5)?,
                        created_at: parse_ts(7, &created_at)?,
                    },
                    read: row.get::<_, i32>(6)? != 0,
                })
            })
            .map_err(db("Query inbox"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db("Read notification row"))
    }

    async fn mark_read(&self, receiver_id: &str, id: i64) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE notifications SET read = 1 WHERE id = ?1 AND receiver_id = ?2",
                params![id, receiver_id],
            )
            .map_err(db("Mark read"))?;
        Ok(changed > 0)
    }

    async fn mark_all_read(&self, receiver_id: &str) -> Result<usize> {
        self.conn()
            .execute(
                "UPDATE notifications SET read = 1 WHERE receiver_id = ?1 AND read = 0",
                params![receiver_id],
            )
            .map_err(db("Mark all read"))
    }
}
