use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};

use super::models::*;
use crate::config::QueueSection;
use crate::errors::QueueError;
use crate::phase::Phase;

const TASK_COLUMNS: &str = "id, phase, payload, status, priority, retry_count, result, error, tags, \
     available_at, dead_letter, parent_id, claimed_by, created_at, updated_at, lease_until";

/// Retry and lease behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub max_retries: u32,
    /// Retry N becomes claimable after `backoff_base * 2^(N-1)`
    pub backoff_base: Duration,
    /// How long a claim stays valid without a heartbeat
    pub lease: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&QueueSection::default())
    }
}

impl From<&QueueSection> for QueueSettings {
    fn from(section: &QueueSection) -> Self {
        Self {
            max_retries: section.max_retries,
            backoff_base: Duration::from_secs(section.backoff_base_secs),
            lease: Duration::from_secs(section.lease_secs),
        }
    }
}

impl QueueSettings {
    pub fn backoff(&self, retry_count: u32) -> Duration {
        self.backoff_base
            .saturating_mul(1u32 << retry_count.min(16))
    }

    fn lease_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Async-safe handle to the task queue.
///
/// Wraps `QueueDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct QueueHandle {
    inner: Arc<std::sync::Mutex<QueueDb>>,
    settings: QueueSettings,
}

impl QueueHandle {
    pub fn new(db: QueueDb) -> Self {
        Self {
            settings: db.settings.clone(),
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R, QueueError>
    where
        F: FnOnce(&mut QueueDb) -> Result<R, QueueError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().map_err(|_| QueueError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| QueueError::Database(anyhow::anyhow!("queue task panicked: {}", e)))?
    }

    /// Acquire the database synchronously (startup and tests).
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, QueueDb>, QueueError> {
        self.inner.lock().map_err(|_| QueueError::LockPoisoned)
    }

    pub async fn enqueue(&self, task: NewTask) -> Result<i64, QueueError> {
        self.call(move |db| db.enqueue(&task)).await
    }

    /// Queue API name for `enqueue`.
    pub async fn create(
        &self,
        payload: TaskPayload,
        priority: i64,
        tags: Vec<String>,
    ) -> Result<i64, QueueError> {
        self.enqueue(NewTask::new(payload).with_priority(priority).with_tags(tags))
            .await
    }

    pub async fn claim(&self, phases: Vec<Phase>, worker: &str) -> Result<Option<Task>, QueueError> {
        let worker = worker.to_string();
        self.call(move |db| db.claim(&phases, &worker)).await
    }

    pub async fn start(&self, id: i64) -> Result<Task, QueueError> {
        self.call(move |db| db.start(id)).await
    }

    pub async fn heartbeat(&self, id: i64, worker: &str) -> Result<DateTime<Utc>, QueueError> {
        let worker = worker.to_string();
        self.call(move |db| db.heartbeat(id, &worker)).await
    }

    pub async fn complete(&self, id: i64, result: serde_json::Value) -> Result<Task, QueueError> {
        self.call(move |db| db.complete(id, &result)).await
    }

    pub async fn fail(&self, id: i64, error: &str) -> Result<FailOutcome, QueueError> {
        let error = error.to_string();
        self.call(move |db| db.fail(id, &error)).await
    }

    pub async fn fail_permanently(&self, id: i64, error: &str) -> Result<Task, QueueError> {
        let error = error.to_string();
        self.call(move |db| db.fail_permanently(id, &error)).await
    }

    pub async fn status(&self, id: i64) -> Result<TaskStatus, QueueError> {
        self.call(move |db| db.get(id).map(|t| t.status)).await
    }

    pub async fn get(&self, id: i64) -> Result<Task, QueueError> {
        self.call(move |db| db.get(id)).await
    }

    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, QueueError> {
        self.call(move |db| db.list(&filter)).await
    }

    pub async fn dead_letters(&self) -> Result<Vec<Task>, QueueError> {
        self.call(|db| db.dead_letters()).await
    }
}

pub struct QueueDb {
    conn: Connection,
    settings: QueueSettings,
}

fn db_err(e: rusqlite::Error) -> QueueError {
    QueueError::Database(e.into())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl QueueDb {
    /// Open (or create) the queue database at `path` and run migrations.
    pub fn open(path: &Path, settings: QueueSettings) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| QueueError::Database(e.into()))?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        let db = Self { conn, settings };
        db.init()?;
        Ok(db)
    }

    /// In-memory queue (for testing).
    pub fn new_in_memory(settings: QueueSettings) -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let db = Self { conn, settings };
        db.init()?;
        Ok(db)
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    fn init(&self) -> Result<(), QueueError> {
        self.conn
            .execute_batch(
                "
                PRAGMA foreign_keys = ON;

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    phase TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    priority INTEGER NOT NULL DEFAULT 0,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    result TEXT,
                    error TEXT,
                    tags TEXT NOT NULL DEFAULT '[]',
                    available_at TEXT NOT NULL,
                    dead_letter INTEGER NOT NULL DEFAULT 0,
                    parent_id INTEGER REFERENCES tasks(id),
                    claimed_by TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    lease_until TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(status, phase, priority DESC, id);
                CREATE INDEX IF NOT EXISTS idx_tasks_dead ON tasks(dead_letter) WHERE dead_letter = 1;
                ",
            )
            .map_err(db_err)?;

        // Queues created before leases existed.
        match self.conn.execute("ALTER TABLE tasks ADD COLUMN lease_until TEXT", []) {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("duplicate column") => Ok(()),
            Err(e) => Err(db_err(e)),
        }
    }

    pub fn enqueue(&self, task: &NewTask) -> Result<i64, QueueError> {
        let now = timestamp(Utc::now());
        let id = TxView { conn: &self.conn }.insert(task, 0, None, &now)?;
        tracing::debug!(task_id = id, phase = %task.payload.phase(), "Task queued");
        Ok(id)
    }

    /// Atomically claim the highest-priority available pending task of one
    /// of `phases` (any phase when empty).
    ///
    /// Claims whose lease ran out are failed first, so work held by a
    /// crashed worker comes back as a linked retry (or a dead letter).
    pub fn claim(&mut self, phases: &[Phase], worker: &str) -> Result<Option<Task>, QueueError> {
        let now = Utc::now();
        let mut args: Vec<String> = vec![
            worker.to_string(),
            timestamp(now),
            timestamp(self.settings.lease_deadline(now)),
        ];
        let phase_clause = if phases.is_empty() {
            String::new()
        } else {
            let marks: Vec<String> = (0..phases.len()).map(|i| format!("?{}", i + 4)).collect();
            args.extend(phases.iter().map(|p| p.as_str().to_string()));
            format!("AND phase IN ({})", marks.join(", "))
        };
        let sql = format!(
            "UPDATE tasks SET status = 'claimed', claimed_by = ?1, updated_at = ?2, lease_until = ?3
             WHERE id = (
                 SELECT id FROM tasks
                 WHERE status = 'pending' AND available_at <= ?2 {}
                 ORDER BY priority DESC, id ASC
                 LIMIT 1
             )
             RETURNING {}",
            phase_clause, TASK_COLUMNS
        );

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        TxView { conn: &tx }.reclaim_expired(&self.settings, now)?;
        let row = tx
            .query_row(&sql, params_from_iter(args.iter()), TaskRow::from_row)
            .optional()
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        let task = row.map(TaskRow::into_task).transpose()?;
        if let Some(task) = &task {
            tracing::info!(task_id = task.id, phase = %task.phase, worker, "Task claimed");
        }
        Ok(task)
    }

    pub fn start(&self, id: i64) -> Result<Task, QueueError> {
        self.transition(id, TaskStatus::InProgress, None, None)
    }

    /// Extend the lease of a task `worker` still holds.
    pub fn heartbeat(&self, id: i64, worker: &str) -> Result<DateTime<Utc>, QueueError> {
        let now = Utc::now();
        let deadline = self.settings.lease_deadline(now);
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET lease_until = ?1, updated_at = ?2
                 WHERE id = ?3 AND claimed_by = ?4 AND status IN ('claimed', 'in_progress')",
                params![timestamp(deadline), timestamp(now), id, worker],
            )
            .map_err(db_err)?;
        if changed == 0 {
            self.get(id)?;
            return Err(QueueError::LeaseLost {
                id,
                worker: worker.to_string(),
            });
        }
        Ok(deadline)
    }

    pub fn complete(&self, id: i64, result: &serde_json::Value) -> Result<Task, QueueError> {
        let result = result.to_string();
        self.transition(id, TaskStatus::Completed, Some(&result), None)
    }

    /// Mark the task failed. Within the retry budget a new pending task
    /// linked by `parent_id` is queued behind an exponential backoff;
    /// otherwise the failed task is dead-lettered.
    pub fn fail(&mut self, id: i64, error: &str) -> Result<FailOutcome, QueueError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let outcome = TxView { conn: &tx }.fail(id, error, &self.settings, Utc::now())?;
        tx.commit().map_err(db_err)?;
        log_failure(id, error, &outcome);
        Ok(outcome)
    }

    /// Fail without retrying.
    pub fn fail_permanently(&mut self, id: i64, error: &str) -> Result<Task, QueueError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let db = TxView { conn: &tx };
        db.transition(id, TaskStatus::Failed, None, Some(error))?;
        db.mark_dead(id)?;
        let task = db.get(id)?;
        tx.commit().map_err(db_err)?;
        tracing::error!(task_id = id, error, "Task dead-lettered");
        Ok(task)
    }

    pub fn get(&self, id: i64) -> Result<Task, QueueError> {
        TxView { conn: &self.conn }.get(id)
    }

    pub fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, QueueError> {
        let mut clauses = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(status) = filter.status {
            args.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", args.len()));
        }
        if let Some(phase) = filter.phase {
            args.push(phase.as_str().to_string());
            clauses.push(format!("phase = ?{}", args.len()));
        }
        if let Some(tag) = &filter.tag {
            args.push(tag.clone());
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM json_each(tasks.tags) WHERE value = ?{})",
                args.len()
            ));
        }
        if let Some(dead) = filter.dead_letter {
            clauses.push(format!("dead_letter = {}", i32::from(dead)));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let limit = filter
            .limit
            .map(|n| format!("LIMIT {}", n))
            .unwrap_or_default();
        let sql = format!(
            "SELECT {} FROM tasks {} ORDER BY id ASC {}",
            TASK_COLUMNS, where_clause, limit
        );

        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), TaskRow::from_row)
            .map_err(db_err)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.map_err(db_err)?.into_task()?);
        }
        Ok(tasks)
    }

    pub fn dead_letters(&self) -> Result<Vec<Task>, QueueError> {
        self.list(&TaskFilter {
            dead_letter: Some(true),
            ..Default::default()
        })
    }

    fn transition(
        &self,
        id: i64,
        to: TaskStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<Task, QueueError> {
        TxView { conn: &self.conn }.transition(id, to, result, error)
    }
}

fn log_failure(id: i64, error: &str, outcome: &FailOutcome) {
    match outcome {
        FailOutcome::Retrying { retry_task, available_at } => {
            tracing::warn!(task_id = id, retry_task, %available_at, error, "Task failed, retry queued")
        }
        FailOutcome::DeadLettered => {
            tracing::error!(task_id = id, error, "Task dead-lettered after retries")
        }
    }
}

/// Statement helpers usable both on the connection and inside a
/// transaction.
struct TxView<'a> {
    conn: &'a Connection,
}

impl TxView<'_> {
    fn get(&self, id: i64) -> Result<Task, QueueError> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        self.conn
            .query_row(&sql, params![id], TaskRow::from_row)
            .optional()
            .map_err(db_err)?
            .ok_or(QueueError::TaskNotFound { id })?
            .into_task()
    }

    fn insert(
        &self,
        task: &NewTask,
        retry_count: u32,
        parent_id: Option<i64>,
        available_at: &str,
    ) -> Result<i64, QueueError> {
        let payload =
            serde_json::to_string(&task.payload).map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
        let tags =
            serde_json::to_string(&task.tags).map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
        let now = timestamp(Utc::now());
        self.conn
            .execute(
                "INSERT INTO tasks (phase, payload, priority, retry_count, tags, available_at, parent_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    task.payload.phase().as_str(),
                    payload,
                    task.priority,
                    retry_count,
                    tags,
                    available_at,
                    parent_id,
                    now
                ],
            )
            .map_err(db_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Move a task forward; a task in any status that cannot reach `to` is
    /// left untouched and reported.
    fn transition(
        &self,
        id: i64,
        to: TaskStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<Task, QueueError> {
        let sources: Vec<String> = TaskStatus::sources(to)
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect();
        let sql = format!(
            "UPDATE tasks SET status = ?1, result = COALESCE(?2, result), error = COALESCE(?3, error), updated_at = ?4
             WHERE id = ?5 AND status IN ({})",
            sources.join(", ")
        );
        let changed = self
            .conn
            .execute(
                &sql,
                params![to.as_str(), result, error, timestamp(Utc::now()), id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            let current = self.get(id)?;
            return Err(QueueError::IllegalTransition {
                id,
                from: current.status.to_string(),
                to: to.to_string(),
            });
        }
        self.get(id)
    }

    fn fail(
        &self,
        id: i64,
        error: &str,
        settings: &QueueSettings,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError> {
        let task = self.transition(id, TaskStatus::Failed, None, Some(error))?;
        if task.retry_count >= settings.max_retries {
            self.mark_dead(id)?;
            return Ok(FailOutcome::DeadLettered);
        }
        let delay = settings.backoff(task.retry_count);
        let available_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        let retry = NewTask {
            payload: task.payload.clone(),
            priority: task.priority,
            tags: task.tags.clone(),
        };
        let retry_task = self.insert(&retry, task.retry_count + 1, Some(task.id), &timestamp(available_at))?;
        Ok(FailOutcome::Retrying {
            retry_task,
            available_at,
        })
    }

    /// Fail every claimed or running task whose lease ended before `now`.
    fn reclaim_expired(
        &self,
        settings: &QueueSettings,
        now: DateTime<Utc>,
    ) -> Result<Vec<(i64, FailOutcome)>, QueueError> {
        let expired: Vec<(i64, Option<String>)> = {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT id, claimed_by FROM tasks
                     WHERE status IN ('claimed', 'in_progress') AND lease_until IS NOT NULL AND lease_until <= ?1
                     ORDER BY id ASC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![timestamp(now)], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(db_err)?;
            rows.collect::<Result<_, _>>().map_err(db_err)?
        };

        let mut outcomes = Vec::with_capacity(expired.len());
        for (id, worker) in expired {
            let error = format!(
                "lease expired: {} stopped renewing its claim",
                worker.as_deref().unwrap_or("worker")
            );
            let outcome = self.fail(id, &error, settings, now)?;
            log_failure(id, &error, &outcome);
            outcomes.push((id, outcome));
        }
        Ok(outcomes)
    }

    fn mark_dead(&self, id: i64) -> Result<(), QueueError> {
        self.conn
            .execute("UPDATE tasks SET dead_letter = 1 WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(())
    }
}

/// Intermediate row struct for tasks.
struct TaskRow {
    id: i64,
    phase: String,
    payload: String,
    status: String,
    priority: i64,
    retry_count: u32,
    result: Option<String>,
    error: Option<String>,
    tags: String,
    available_at: String,
    dead_letter: bool,
    parent_id: Option<i64>,
    claimed_by: Option<String>,
    created_at: String,
    updated_at: String,
    lease_until: Option<String>,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            phase: row.get(1)?,
            payload: row.get(2)?,
            status: row.get(3)?,
            priority: row.get(4)?,
            retry_count: row.get(5)?,
            result: row.get(6)?,
            error: row.get(7)?,
            tags: row.get(8)?,
            available_at: row.get(9)?,
            dead_letter: row.get(10)?,
            parent_id: row.get(11)?,
            claimed_by: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
            lease_until: row.get(15)?,
        })
    }

    fn into_task(self) -> Result<Task, QueueError> {
        let invalid = |what: &str, e: &dyn std::fmt::Display| {
            QueueError::InvalidPayload(format!("task {}: bad {}: {}", self.id, what, e))
        };
        let phase = Phase::from_str(&self.phase).map_err(|e| invalid("phase", &e))?;
        let payload: TaskPayload =
            serde_json::from_str(&self.payload).map_err(|e| invalid("payload", &e))?;
        if payload.phase() != phase {
            return Err(invalid(
                "payload",
                &format!("tagged {} but queued as {}", payload.phase(), phase),
            ));
        }
        let status = TaskStatus::from_str(&self.status).map_err(|e| invalid("status", &e))?;
        let result: Option<serde_json::Value> = self
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| invalid("result", &e))?;
        let tags: Vec<String> = serde_json::from_str(&self.tags).map_err(|e| invalid("tags", &e))?;
        let parse_time = |what: &str, s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| invalid(what, &e))
        };

        Ok(Task {
            id: self.id,
            phase,
            payload,
            status,
            priority: self.priority,
            retry_count: self.retry_count,
            result,
            error: self.error.clone(),
            tags,
            available_at: parse_time("available_at", &self.available_at)?,
            dead_letter: self.dead_letter,
            parent_id: self.parent_id,
            claimed_by: self.claimed_by.clone(),
            created_at: parse_time("created_at", &self.created_at)?,
            updated_at: parse_time("updated_at", &self.updated_at)?,
            lease_until: self
                .lease_until
                .as_deref()
                .map(|s| parse_time("lease_until", s))
                .transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_retries: u32) -> QueueSettings {
        QueueSettings {
            max_retries,
            backoff_base: Duration::ZERO,
            lease: Duration::from_secs(300),
        }
    }

    fn db(max_retries: u32) -> QueueDb {
        QueueDb::new_in_memory(settings(max_retries)).unwrap()
    }

    fn plan(run_id: &str) -> NewTask {
        NewTask::new(TaskPayload::Plan(PlanPayload {
            run_id: run_id.into(),
            source_ref: "issue-1".into(),
        }))
    }

    fn build(run_id: &str) -> NewTask {
        NewTask::new(TaskPayload::Build(BuildPayload {
            run_id: run_id.into(),
            plan_file: None,
        }))
    }

    #[test]
    fn test_enqueue_and_get() {
        let db = db(3);
        let id = db.enqueue(&plan("r1").with_tags(vec!["nightly".into()])).unwrap();
        let task = db.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.phase, Phase::Plan);
        assert_eq!(task.payload.run_id(), "r1");
        assert_eq!(task.tags, vec!["nightly"]);
        assert!(!task.dead_letter);
        assert!(matches!(db.get(999), Err(QueueError::TaskNotFound { id: 999 })));
    }

    #[test]
    fn test_claim_takes_highest_priority_once() {
        let mut db = db(3);
        let low = db.enqueue(&plan("r1")).unwrap();
        let high = db.enqueue(&plan("r2").with_priority(5)).unwrap();

        let first = db.claim(&[], "w1").unwrap().unwrap();
        assert_eq!(first.id, high);
        assert_eq!(first.status, TaskStatus::Claimed);
        assert_eq!(first.claimed_by.as_deref(), Some("w1"));

        let second = db.claim(&[], "w2").unwrap().unwrap();
        assert_eq!(second.id, low);
        assert!(db.claim(&[], "w3").unwrap().is_none());
    }

    #[test]
    fn test_claim_filters_by_phase() {
        let mut db = db(3);
        db.enqueue(&plan("r1")).unwrap();
        let b = db.enqueue(&build("r2")).unwrap();
        let task = db.claim(&[Phase::Build, Phase::Review], "w").unwrap().unwrap();
        assert_eq!(task.id, b);
        assert!(db.claim(&[Phase::Review], "w").unwrap().is_none());
    }

    #[test]
    fn test_status_only_moves_forward() {
        let mut db = db(3);
        let id = db.enqueue(&plan("r1")).unwrap();
        assert!(matches!(db.start(id), Err(QueueError::IllegalTransition { .. })));

        db.claim(&[], "w").unwrap();
        db.start(id).unwrap();
        let done = db.complete(id, &serde_json::json!({"ok": true})).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result.unwrap()["ok"], true);

        let err = db.fail(id, "late").unwrap_err();
        assert!(matches!(err, QueueError::IllegalTransition { ref from, .. } if from == "completed"));
        assert_eq!(db.get(id).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_fail_queues_linked_retry_then_dead_letters() {
        let mut db = db(1);
        let id = db.enqueue(&plan("r1").with_priority(2)).unwrap();
        db.claim(&[], "w").unwrap();

        let outcome = db.fail(id, "agent crashed").unwrap();
        let FailOutcome::Retrying { retry_task, .. } = outcome else {
            panic!("expected a retry");
        };
        let original = db.get(id).unwrap();
        assert_eq!(original.status, TaskStatus::Failed);
        assert_eq!(original.error.as_deref(), Some("agent crashed"));
        let retry = db.get(retry_task).unwrap();
        assert_eq!(retry.status, TaskStatus::Pending);
        assert_eq!(retry.parent_id, Some(id));
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.priority, 2);

        let claimed = db.claim(&[], "w").unwrap().unwrap();
        assert_eq!(claimed.id, retry_task);
        assert_eq!(db.fail(retry_task, "again").unwrap(), FailOutcome::DeadLettered);

        let dead = db.dead_letters().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, retry_task);
        assert!(db.claim(&[], "w").unwrap().is_none());
    }

    #[test]
    fn test_backoff_gates_claim() {
        let mut db = QueueDb::new_in_memory(QueueSettings {
            backoff_base: Duration::from_secs(30),
            ..settings(3)
        })
        .unwrap();
        let id = db.enqueue(&plan("r1")).unwrap();
        db.claim(&[], "w").unwrap();
        let FailOutcome::Retrying { available_at, .. } = db.fail(id, "boom").unwrap() else {
            panic!("expected a retry");
        };
        assert!(available_at > Utc::now() + chrono::Duration::seconds(25));
        assert!(db.claim(&[], "w").unwrap().is_none());
    }

    #[test]
    fn test_backoff_doubles() {
        let settings = QueueSettings {
            backoff_base: Duration::from_secs(30),
            ..settings(5)
        };
        assert_eq!(settings.backoff(0), Duration::from_secs(30));
        assert_eq!(settings.backoff(2), Duration::from_secs(120));
    }

    #[test]
    fn test_claim_held_by_crashed_worker_is_redelivered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let short_lease = QueueSettings {
            lease: Duration::from_millis(50),
            ..settings(3)
        };

        let id = {
            let mut db = QueueDb::open(&path, short_lease.clone()).unwrap();
            let id = db.enqueue(&plan("r1").with_tags(vec!["nightly".into()])).unwrap();
            let claimed = db.claim(&[], "worker-a").unwrap().unwrap();
            assert!(claimed.lease_until.is_some());
            db.start(id).unwrap();
            id
        };
        std::thread::sleep(Duration::from_millis(100));

        let mut db = QueueDb::open(&path, short_lease).unwrap();
        let task = db.claim(&[], "worker-b").unwrap().unwrap();
        assert_ne!(task.id, id);
        assert_eq!(task.parent_id, Some(id));
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.tags, vec!["nightly"]);
        assert_eq!(task.claimed_by.as_deref(), Some("worker-b"));

        let abandoned = db.get(id).unwrap();
        assert_eq!(abandoned.status, TaskStatus::Failed);
        assert!(abandoned.error.unwrap().contains("worker-a"));
    }

    #[test]
    fn test_expired_claim_without_retries_is_dead_lettered() {
        let mut db = QueueDb::new_in_memory(QueueSettings {
            lease: Duration::ZERO,
            ..settings(0)
        })
        .unwrap();
        let id = db.enqueue(&plan("r1")).unwrap();
        db.claim(&[], "worker-a").unwrap();

        assert!(db.claim(&[], "worker-b").unwrap().is_none());
        let dead = db.dead_letters().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
    }

    #[test]
    fn test_heartbeat_keeps_the_claim() {
        let mut db = QueueDb::new_in_memory(QueueSettings {
            lease: Duration::from_secs(1),
            ..settings(3)
        })
        .unwrap();
        let id = db.enqueue(&plan("r1")).unwrap();
        db.claim(&[], "worker-a").unwrap();

        std::thread::sleep(Duration::from_millis(600));
        let deadline = db.heartbeat(id, "worker-a").unwrap();
        assert!(deadline > Utc::now() + chrono::Duration::milliseconds(900));
        std::thread::sleep(Duration::from_millis(600));

        assert!(db.claim(&[], "worker-b").unwrap().is_none());
        assert_eq!(db.get(id).unwrap().status, TaskStatus::Claimed);
        assert!(matches!(
            db.heartbeat(id, "worker-b"),
            Err(QueueError::LeaseLost { id: lost, .. }) if lost == id
        ));
    }

    #[test]
    fn test_leases_column_is_added_to_old_queues() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    phase TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    priority INTEGER NOT NULL DEFAULT 0,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    result TEXT,
                    error TEXT,
                    tags TEXT NOT NULL DEFAULT '[]',
                    available_at TEXT NOT NULL,
                    dead_letter INTEGER NOT NULL DEFAULT 0,
                    parent_id INTEGER REFERENCES tasks(id),
                    claimed_by TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );",
            )
            .unwrap();
        }
        let mut db = QueueDb::open(&path, settings(3)).unwrap();
        db.enqueue(&plan("r1")).unwrap();
        assert!(db.claim(&[], "w").unwrap().unwrap().lease_until.is_some());
        assert!(QueueDb::open(&path, settings(3)).is_ok());
    }

    #[test]
    fn test_fail_permanently_skips_retry() {
        let mut db = db(3);
        let id = db.enqueue(&plan("r1")).unwrap();
        db.claim(&[], "w").unwrap();
        let task = db.fail_permanently(id, "worktree gone").unwrap();
        assert!(task.dead_letter);
        assert_eq!(db.list(&TaskFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_list_filters() {
        let mut db = db(3);
        db.enqueue(&plan("r1").with_tags(vec!["a".into()])).unwrap();
        db.enqueue(&build("r2").with_tags(vec!["b".into()])).unwrap();
        db.enqueue(&plan("r3")).unwrap();
        db.claim(&[Phase::Build], "w").unwrap();

        let by_phase = db
            .list(&TaskFilter {
                phase: Some(Phase::Plan),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_phase.len(), 2);

        let by_tag = db
            .list(&TaskFilter {
                tag: Some("b".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].status, TaskStatus::Claimed);

        let pending = db
            .list(&TaskFilter {
                status: Some(TaskStatus::Pending),
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_mismatched_payload_is_rejected_on_read() {
        let db = db(3);
        let id = db.enqueue(&plan("r1")).unwrap();
        db.conn
            .execute("UPDATE tasks SET phase = 'build' WHERE id = ?1", params![id])
            .unwrap();
        assert!(matches!(db.get(id), Err(QueueError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn test_handle_claims_are_exclusive() {
        let handle = QueueHandle::new(db(3));
        for i in 0..10 {
            handle.enqueue(plan(&format!("r{}", i))).await.unwrap();
        }
        let mut joins = Vec::new();
        for w in 0..4 {
            let handle = handle.clone();
            joins.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(task) = handle.claim(vec![], &format!("w{}", w)).await.unwrap() {
                    ids.push(task.id);
                }
                ids
            }));
        }
        let mut all = Vec::new();
        for j in joins {
            all.extend(j.await.unwrap());
        }
        all.sort();
        assert_eq!(all, (1..=10).collect::<Vec<i64>>());
    }
}
