//! SQLite store implementation (sqlx).
//!
//! Timestamps are stored as epoch milliseconds so range predicates and
//! ordering are plain integer comparisons. `swap` is one conditional
//! `UPDATE`; `rows_affected() == 1` is the only success signal, so two
//! scheduler processes sharing the database file cannot both win a claim.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::domain::{
    Capabilities, Task, TaskFilter, TaskId, TaskStatus, WorkerId, WorkerRecord,
};
use crate::ports::clock::from_millis;
use crate::ports::{CasOutcome, Expected, StatusCounts, StoreError, TaskStore, WorkerStore};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        payload TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'claimed', 'running', 'completed', 'failed')),
        result TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        requires TEXT NOT NULL DEFAULT '[]',
        last_error TEXT,
        lease_holder TEXT,
        lease_expires_at INTEGER,
        run_after INTEGER,
        revision INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_priority ON tasks (priority, created_at, seq)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_lease_expires_at ON tasks (lease_expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_lease_holder ON tasks (lease_holder)",
    r#"
    CREATE TABLE IF NOT EXISTS workers (
        worker_id TEXT PRIMARY KEY,
        capabilities TEXT NOT NULL DEFAULT '[]',
        last_seen INTEGER NOT NULL,
        registered_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_workers_last_seen ON workers (last_seen)",
];

const TASK_COLUMNS: &str = "id, name, payload, priority, status, result, attempts, max_attempts, \
     requires, last_error, lease_holder, lease_expires_at, run_after, revision, created_at, updated_at";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(err.to_string())
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Store backed by a SQLite database file (or an in-memory database).
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and create the schema if needed.
    ///
    /// In-memory URLs get a single connection: every SQLite connection to
    /// `:memory:` opens its own private database.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 8 })
            .acquire_timeout(Duration::from_secs(30));
        if in_memory {
            // dropping the last connection drops the database
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        let store = Self { pool };
        store.init_schema().await?;
        tracing::info!(url, "sqlite store ready");
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent: every statement is `IF NOT EXISTS`.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn decode_json<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn to_u32(column: &str, raw: i64) -> Result<u32, StoreError> {
    u32::try_from(raw).map_err(|_| StoreError::Corrupt(format!("{column}: {raw} out of range")))
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StoreError> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("payload")?;
    let result: Option<String> = row.try_get("result")?;
    let requires: String = row.try_get("requires")?;
    let lease_holder: Option<String> = row.try_get("lease_holder")?;
    let lease_expires_at: Option<i64> = row.try_get("lease_expires_at")?;
    let run_after: Option<i64> = row.try_get("run_after")?;
    let revision: i64 = row.try_get("revision")?;

    Ok(Task {
        id: id
            .parse()
            .map_err(|e: crate::domain::IdError| StoreError::Corrupt(e.to_string()))?,
        name: row.try_get("name")?,
        payload: decode_json("payload", &payload)?,
        priority: row.try_get("priority")?,
        status: status
            .parse::<TaskStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        result: result.map(|r| decode_json("result", &r)).transpose()?,
        attempts: to_u32("attempts", row.try_get("attempts")?)?,
        max_attempts: to_u32("max_attempts", row.try_get("max_attempts")?)?,
        requires: decode_json::<Capabilities>("requires", &requires)?,
        last_error: row.try_get("last_error")?,
        lease_holder: lease_holder
            .map(WorkerId::new)
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        lease_expires_at: lease_expires_at.map(from_millis),
        run_after: run_after.map(from_millis),
        revision: u64::try_from(revision)
            .map_err(|_| StoreError::Corrupt(format!("revision: {revision} out of range")))?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn worker_from_row(row: &SqliteRow) -> Result<WorkerRecord, StoreError> {
    let id: String = row.try_get("worker_id")?;
    let capabilities: String = row.try_get("capabilities")?;
    Ok(WorkerRecord {
        id: WorkerId::new(id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        capabilities: decode_json("capabilities", &capabilities)?,
        last_heartbeat: from_millis(row.try_get("last_seen")?),
        registered_at: from_millis(row.try_get("registered_at")?),
    })
}

fn tasks_from_rows(rows: Vec<SqliteRow>) -> Result<Vec<Task>, StoreError> {
    rows.iter().map(task_from_row).collect()
}

fn limit_i64(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert(&self, task: &Task) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (
                id, name, payload, priority, status, result, attempts, max_attempts,
                requires, last_error, lease_holder, lease_expires_at, run_after, revision,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(task.id.to_string())
        .bind(&task.name)
        .bind(encode_json(&task.payload)?)
        .bind(task.priority)
        .bind(task.status.as_str())
        .bind(task.result.as_ref().map(encode_json).transpose()?)
        .bind(i64::from(task.attempts))
        .bind(i64::from(task.max_attempts))
        .bind(encode_json(&task.requires)?)
        .bind(task.last_error.as_deref())
        .bind(task.lease_holder.as_ref().map(|w| w.as_str().to_string()))
        .bind(task.lease_expires_at.map(|t| t.timestamp_millis()))
        .bind(task.run_after.map(|t| t.timestamp_millis()))
        .bind(task.revision as i64)
        .bind(task.created_at.timestamp_millis())
        .bind(task.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(task.id));
        }
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let status = filter.status.map(|s| s.as_str());
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE (? IS NULL OR status = ?) AND (? IS NULL OR priority = ?) \
             ORDER BY priority ASC, created_at ASC, seq ASC"
        ))
        .bind(status)
        .bind(status)
        .bind(filter.priority)
        .bind(filter.priority)
        .fetch_all(&self.pool)
        .await?;
        tasks_from_rows(rows)
    }

    async fn pending_candidates(
        &self,
        now: DateTime<Utc>,
        capabilities: &Capabilities,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        // requires ⊆ capabilities: no required tag outside the offered set
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status = 'pending' \
               AND (run_after IS NULL OR run_after <= ?) \
               AND NOT EXISTS ( \
                   SELECT 1 FROM json_each(tasks.requires) AS req \
                   WHERE req.value NOT IN (SELECT offered.value FROM json_each(?) AS offered) \
               ) \
             ORDER BY priority ASC, created_at ASC, seq ASC \
             LIMIT ?"
        ))
        .bind(now.timestamp_millis())
        .bind(encode_json(capabilities)?)
        .bind(limit_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        tasks_from_rows(rows)
    }

    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status IN ('claimed', 'running') AND lease_expires_at < ? \
             ORDER BY lease_expires_at ASC, seq ASC \
             LIMIT ?"
        ))
        .bind(now.timestamp_millis())
        .bind(limit_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        tasks_from_rows(rows)
    }

    async fn leases_held(&self) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status IN ('claimed', 'running') \
             ORDER BY priority ASC, created_at ASC, seq ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        tasks_from_rows(rows)
    }

    async fn held_by(&self, worker: &WorkerId) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE lease_holder = ? AND status IN ('claimed', 'running') \
             LIMIT 1"
        ))
        .bind(worker.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn swap(
        &self,
        expected: Expected,
        next: &Task,
        exclusive_holder: bool,
    ) -> Result<CasOutcome, StoreError> {
        let holder = next.lease_holder.as_ref().map(|w| w.as_str().to_string());
        let guard = exclusive_holder && holder.is_some();

        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = ?,
                result = ?,
                attempts = ?,
                max_attempts = ?,
                last_error = ?,
                lease_holder = ?,
                lease_expires_at = ?,
                run_after = ?,
                revision = ?,
                updated_at = ?
            WHERE id = ? AND status = ? AND revision = ?
              AND (? = 0 OR NOT EXISTS (
                  SELECT 1 FROM tasks AS other
                  WHERE other.lease_holder = ? AND other.id <> ?
              ))
            "#,
        )
        .bind(next.status.as_str())
        .bind(next.result.as_ref().map(encode_json).transpose()?)
        .bind(i64::from(next.attempts))
        .bind(i64::from(next.max_attempts))
        .bind(next.last_error.as_deref())
        .bind(holder.as_deref())
        .bind(next.lease_expires_at.map(|t| t.timestamp_millis()))
        .bind(next.run_after.map(|t| t.timestamp_millis()))
        .bind(next.revision as i64)
        .bind(next.updated_at.timestamp_millis())
        .bind(next.id.to_string())
        .bind(expected.status.as_str())
        .bind(expected.revision as i64)
        .bind(i64::from(guard))
        .bind(holder.as_deref())
        .bind(next.id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            CasOutcome::Applied
        } else {
            CasOutcome::Conflict
        })
    }

    async fn delete(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let task = task_from_row(&row)?;

        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(task))
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            let status = status
                .parse::<TaskStatus>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            counts.add(status, n.max(0) as u64);
        }
        Ok(counts)
    }
}

#[async_trait]
impl WorkerStore for SqliteStore {
    async fn upsert(
        &self,
        id: &WorkerId,
        capabilities: &Capabilities,
        now: DateTime<Utc>,
    ) -> Result<WorkerRecord, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO workers (worker_id, capabilities, last_seen, registered_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (worker_id) DO UPDATE SET
                capabilities = excluded.capabilities,
                last_seen = MAX(workers.last_seen, excluded.last_seen)
            RETURNING worker_id, capabilities, last_seen, registered_at
            "#,
        )
        .bind(id.as_str())
        .bind(encode_json(capabilities)?)
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        worker_from_row(&row)
    }

    async fn touch(&self, id: &WorkerId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE workers SET last_seen = MAX(last_seen, ?) WHERE worker_id = ?")
                .bind(now.timestamp_millis())
                .bind(id.as_str())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, id: &WorkerId) -> Result<Option<WorkerRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT worker_id, capabilities, last_seen, registered_at FROM workers WHERE worker_id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(worker_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT worker_id, capabilities, last_seen, registered_at FROM workers ORDER BY worker_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(worker_from_row).collect()
    }
}
