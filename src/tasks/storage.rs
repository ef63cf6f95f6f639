//! SQLite-backed task storage (C4 — TaskStore).
//!
//! One file per home (`boards.sqlite`). Schema matches spec §4.4. Task ids
//! are declared `COLLATE NOCASE` so SQLite itself enforces
//! case-insensitive uniqueness and lookup while the literal inserted casing
//! is what comes back out on read.
//!
//! Migrations run once at `open()`: idempotent, wrapped in a transaction,
//! and tolerant of re-running against an already-migrated database (`ALTER
//! TABLE ... ADD COLUMN` failures for a column that already exists are
//! swallowed, the same way the teacher's storage layer treats "duplicate
//! column" as success).

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex as AsyncMutex;

use crate::agents::authz::AuthzResolver;
use crate::error::TaskError;
use crate::tasks::{Task, TaskDraft, TaskStatus, WorklogEntry, DEFAULT_BOARD_ID};

pub struct TaskStore {
    pool: SqlitePool,
    /// Serialises commits the way §5 requires ("a single process-wide mutex
    /// around each commit"). Reads go straight to the pool — SQLite's WAL
    /// mode gives readers snapshot isolation against the writer.
    commit_lock: Arc<AsyncMutex<()>>,
}

impl TaskStore {
    pub async fn open(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .context("failed to open boards.sqlite")?;

        migrate(&pool).await?;

        Ok(Self {
            pool,
            commit_lock: Arc::new(AsyncMutex::new(())),
        })
    }

    pub async fn create_task(
        &self,
        actor_id: &str,
        draft: TaskDraft,
        authz: &AuthzResolver,
    ) -> Result<Task, TaskError> {
        if draft.title.trim().is_empty() {
            return Err(TaskError::Validation("title must not be empty".into()));
        }
        if draft.status.requires_reason() && draft.status_reason.as_deref().unwrap_or("").is_empty()
        {
            return Err(TaskError::Validation(format!(
                "Reason is required when task status is \"{}\".",
                draft.status.as_str()
            )));
        }
        authz
            .authorize(actor_id, actor_id, &draft.assigned_to)
            .map_err(|_| TaskError::Unauthorized)?;

        let _guard = self.commit_lock.lock().await;
        let now = now_millis();
        let task_id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO tasks
             (task_id, board_id, created_at, updated_at, status_updated_at,
              owner_agent_id, assigned_to_agent_id, title, description,
              status, status_reason, project)
             VALUES (?1, ?2, ?3, ?3, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&task_id)
        .bind(DEFAULT_BOARD_ID)
        .bind(now)
        .bind(actor_id)
        .bind(&draft.assigned_to)
        .bind(&draft.title)
        .bind(&draft.description)
        .bind(draft.status.as_str())
        .bind(&draft.status_reason)
        .bind(&draft.project)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::Validation(format!("failed to create task: {e}")))?;

        self.get_task(&task_id)
            .await
            .map_err(|e| TaskError::Validation(e.to_string()))?
            .ok_or_else(|| TaskError::NotFound(task_id.clone()))
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let Some(row) = sqlx::query("SELECT * FROM tasks WHERE task_id = ?1 COLLATE NOCASE")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(self.hydrate(row).await?))
    }

    pub async fn update_task_status(
        &self,
        actor_id: &str,
        task_id: &str,
        status: TaskStatus,
        reason: Option<String>,
        authz: &AuthzResolver,
    ) -> Result<Task, TaskError> {
        if status.requires_reason() && reason.as_deref().unwrap_or("").is_empty() {
            return Err(TaskError::Validation(format!(
                "Reason is required when task status is \"{}\".",
                status.as_str()
            )));
        }
        let task = self
            .get_task(task_id)
            .await
            .map_err(|e| TaskError::Validation(e.to_string()))?
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        authz
            .authorize(actor_id, &task.owner, &task.assigned_to)
            .map_err(|_| TaskError::Unauthorized)?;

        let _guard = self.commit_lock.lock().await;
        let now = now_millis();
        sqlx::query(
            "UPDATE tasks SET status = ?1, status_reason = ?2, updated_at = ?3,
             status_updated_at = ?3 WHERE task_id = ?4 COLLATE NOCASE",
        )
        .bind(status.as_str())
        .bind(&reason)
        .bind(now)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::Validation(e.to_string()))?;

        self.get_task(task_id)
            .await
            .map_err(|e| TaskError::Validation(e.to_string()))?
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    async fn append_side_table(
        &self,
        table: &str,
        actor_id: &str,
        task_id: &str,
        content: &str,
        authz: &AuthzResolver,
    ) -> Result<Task, TaskError> {
        let task = self
            .get_task(task_id)
            .await
            .map_err(|e| TaskError::Validation(e.to_string()))?
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        authz
            .authorize(actor_id, &task.owner, &task.assigned_to)
            .map_err(|_| TaskError::Unauthorized)?;

        let _guard = self.commit_lock.lock().await;
        let now = now_millis();
        let next_seq: i64 = sqlx::query_scalar(&format!(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM {table} WHERE task_id = ?1 COLLATE NOCASE"
        ))
        .bind(task_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TaskError::Validation(e.to_string()))?;

        sqlx::query(&format!(
            "INSERT INTO {table} (task_id, seq, created_at, created_by, content)
             VALUES (?1, ?2, ?3, ?4, ?5)"
        ))
        .bind(task_id)
        .bind(next_seq)
        .bind(now)
        .bind(actor_id)
        .bind(content)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::Validation(e.to_string()))?;

        sqlx::query("UPDATE tasks SET updated_at = ?1 WHERE task_id = ?2 COLLATE NOCASE")
            .bind(now)
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(|e| TaskError::Validation(e.to_string()))?;

        self.get_task(task_id)
            .await
            .map_err(|e| TaskError::Validation(e.to_string()))?
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    pub async fn add_blocker(
        &self,
        actor_id: &str,
        task_id: &str,
        content: &str,
        authz: &AuthzResolver,
    ) -> Result<Task, TaskError> {
        self.append_side_table("blockers", actor_id, task_id, content, authz)
            .await
    }

    pub async fn add_artifact(
        &self,
        actor_id: &str,
        task_id: &str,
        content: &str,
        authz: &AuthzResolver,
    ) -> Result<Task, TaskError> {
        self.append_side_table("artifacts", actor_id, task_id, content, authz)
            .await
    }

    pub async fn add_worklog(
        &self,
        actor_id: &str,
        task_id: &str,
        content: &str,
        authz: &AuthzResolver,
    ) -> Result<Task, TaskError> {
        self.append_side_table("worklog", actor_id, task_id, content, authz)
            .await
    }

    /// De-duplicates `ids`, applies authz per id, deletes the authorized
    /// subset, and reports what actually happened.
    pub async fn delete_tasks(
        &self,
        actor_id: &str,
        ids: Vec<String>,
        authz: &AuthzResolver,
    ) -> Result<(Vec<String>, usize)> {
        let mut unique = Vec::new();
        for id in ids {
            if !unique.iter().any(|u: &String| u.eq_ignore_ascii_case(&id)) {
                unique.push(id);
            }
        }

        let mut deleted = Vec::new();
        let _guard = self.commit_lock.lock().await;
        for id in unique {
            let Some(task) = self.get_task(&id).await? else {
                continue;
            };
            if authz.authorize(actor_id, &task.owner, &task.assigned_to).is_err() {
                continue;
            }
            sqlx::query("DELETE FROM blockers WHERE task_id = ?1 COLLATE NOCASE")
                .bind(&id)
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM artifacts WHERE task_id = ?1 COLLATE NOCASE")
                .bind(&id)
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM worklog WHERE task_id = ?1 COLLATE NOCASE")
                .bind(&id)
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM tasks WHERE task_id = ?1 COLLATE NOCASE")
                .bind(&id)
                .execute(&self.pool)
                .await?;
            deleted.push(task.task_id);
        }
        let count = deleted.len();
        Ok((deleted, count))
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            tasks.push(self.hydrate(row).await?);
        }
        Ok(tasks)
    }

    /// `limit` is capped at 100 regardless of what the caller asks for.
    pub async fn list_latest_tasks(
        &self,
        assignee: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let capped = limit.clamp(1, 100);
        let rows = if let Some(assignee) = assignee {
            sqlx::query(
                "SELECT * FROM tasks WHERE assigned_to_agent_id = ?1
                 ORDER BY created_at DESC LIMIT ?2",
            )
            .bind(assignee)
            .bind(capped)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query("SELECT * FROM tasks ORDER BY created_at DESC LIMIT ?1")
                .bind(capped)
                .fetch_all(&self.pool)
                .await?
        };
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            tasks.push(self.hydrate(row).await?);
        }
        Ok(tasks)
    }

    pub async fn list_doing_task_ids_older_than(&self, minutes: i64) -> Result<Vec<String>> {
        let cutoff = now_millis() - minutes * 60_000;
        let rows = sqlx::query(
            "SELECT task_id FROM tasks WHERE status = 'doing' AND status_updated_at <= ?1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| r.get::<String, _>("task_id"))
            .collect())
    }

    /// Bumps `status_updated_at` without touching `status`, used by the
    /// scheduler after nudging a task's owner/assignee.
    pub async fn reset_task_status_timeout(&self, task_id: &str) -> Result<()> {
        let _guard = self.commit_lock.lock().await;
        sqlx::query("UPDATE tasks SET status_updated_at = ?1 WHERE task_id = ?2 COLLATE NOCASE")
            .bind(now_millis())
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn hydrate(&self, row: sqlx::sqlite::SqliteRow) -> Result<Task> {
        let task_id: String = row.get("task_id");
        let blockers = self.load_side_table("blockers", &task_id).await?;
        let artifacts = self.load_side_table("artifacts", &task_id).await?;
        let worklog_rows = self.load_worklog(&task_id).await?;

        Ok(Task {
            task_id: task_id.clone(),
            board_id: row.get("board_id"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            status_updated_at: row.get("status_updated_at"),
            owner: row.get("owner_agent_id"),
            assigned_to: row.get("assigned_to_agent_id"),
            title: row.get("title"),
            description: row.get("description"),
            status: TaskStatus::parse(&row.get::<String, _>("status"))
                .unwrap_or(TaskStatus::Todo),
            status_reason: row.get("status_reason"),
            blockers,
            artifacts,
            worklog: worklog_rows,
            project: row.get("project"),
        })
    }

    async fn load_side_table(&self, table: &str, task_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(&format!(
            "SELECT content FROM {table} WHERE task_id = ?1 COLLATE NOCASE ORDER BY seq"
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("content")).collect())
    }

    async fn load_worklog(&self, task_id: &str) -> Result<Vec<WorklogEntry>> {
        let rows = sqlx::query(
            "SELECT created_at, created_by, content FROM worklog
             WHERE task_id = ?1 COLLATE NOCASE ORDER BY seq",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| WorklogEntry {
                created_at: r.get("created_at"),
                created_by: r.get("created_by"),
                content: r.get("content"),
            })
            .collect())
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn table_columns(pool: &SqlitePool, table: &str) -> Result<Vec<String>> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|r| r.get::<String, _>("name")).collect())
}

/// Runs an ALTER TABLE, swallowing "duplicate column name" so migrations
/// stay idempotent across restarts that crashed mid-migration.
async fn try_add_column(pool: &SqlitePool, sql: &str) {
    if let Err(e) = sqlx::query(sql).execute(pool).await {
        let msg = e.to_string();
        if !msg.contains("duplicate column name") {
            tracing::warn!(err = %msg, sql, "unexpected error adding column — continuing");
        }
    }
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY COLLATE NOCASE,
            board_id TEXT NOT NULL DEFAULT 'default',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL DEFAULT 0,
            status_updated_at INTEGER NOT NULL,
            owner_agent_id TEXT NOT NULL,
            assigned_to_agent_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            status_reason TEXT,
            project TEXT
        )",
    )
    .execute(pool)
    .await?;

    for table in ["blockers", "artifacts", "worklog"] {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                task_id TEXT NOT NULL COLLATE NOCASE,
                seq INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                created_by TEXT NOT NULL,
                content TEXT NOT NULL,
                PRIMARY KEY (task_id, seq)
            )"
        ))
        .execute(pool)
        .await?;
    }

    // Legacy-schema repair: a pre-migration database has `project` but no
    // `updated_at`. Drop the legacy `project` column (its values are not
    // trustworthy — it predates the owner/assignee model) and recreate the
    // columns this schema expects.
    let columns = table_columns(pool, "tasks").await?;
    let is_legacy = !columns.iter().any(|c| c == "updated_at");
    if is_legacy {
        if columns.iter().any(|c| c == "project") {
            let _ = sqlx::query("ALTER TABLE tasks DROP COLUMN project")
                .execute(pool)
                .await;
        }
        try_add_column(
            pool,
            "ALTER TABLE tasks ADD COLUMN updated_at INTEGER NOT NULL DEFAULT 0",
        )
        .await;
        try_add_column(pool, "ALTER TABLE tasks ADD COLUMN project TEXT").await;
        sqlx::query(
            "UPDATE tasks SET updated_at = COALESCE(NULLIF(status_updated_at, 0), created_at)
             WHERE updated_at = 0",
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tasks_assignee_created_at
         ON tasks(assigned_to_agent_id, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Agent, AgentType};
    use std::path::PathBuf;

    fn agent(id: &str, reports_to: Option<&str>) -> Agent {
        Agent {
            id: id.to_string(),
            display_name: id.to_string(),
            agent_type: AgentType::Individual,
            reports_to: reports_to.map(|s| s.to_string()),
            role: None,
            workspace_dir: PathBuf::new(),
            internal_config_dir: PathBuf::new(),
            provider_id: "openclaw".to_string(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn resolver() -> AuthzResolver {
        AuthzResolver::from_agents(&[
            agent("ceo", None),
            agent("cto", Some("ceo")),
            agent("qa", Some("ceo")),
        ])
    }

    fn draft(assigned_to: &str, status: TaskStatus, reason: Option<&str>) -> TaskDraft {
        TaskDraft {
            assigned_to: assigned_to.to_string(),
            title: "Ship the thing".to_string(),
            description: "Do the needful".to_string(),
            status,
            status_reason: reason.map(|s| s.to_string()),
            project: Some("opengoat".to_string()),
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips_non_time_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(&dir.path().join("boards.sqlite")).await.unwrap();
        let resolver = resolver();
        let created = store
            .create_task("cto", draft("cto", TaskStatus::Todo, None), &resolver)
            .await
            .unwrap();
        let fetched = store.get_task(&created.task_id).await.unwrap().unwrap();
        assert_eq!(fetched.title, created.title);
        assert_eq!(fetched.description, created.description);
        assert_eq!(fetched.assigned_to, created.assigned_to);
        assert_eq!(fetched.project, created.project);
    }

    #[tokio::test]
    async fn blocked_without_reason_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(&dir.path().join("boards.sqlite")).await.unwrap();
        let resolver = resolver();
        let err = store
            .create_task("cto", draft("cto", TaskStatus::Blocked, None), &resolver)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Reason is required"));
    }

    #[tokio::test]
    async fn cross_tree_assignment_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(&dir.path().join("boards.sqlite")).await.unwrap();
        let resolver = resolver();
        let err = store
            .create_task("cto", draft("qa", TaskStatus::Todo, None), &resolver)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Unauthorized));
    }

    #[tokio::test]
    async fn task_ids_match_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(&dir.path().join("boards.sqlite")).await.unwrap();
        let resolver = resolver();
        let created = store
            .create_task("cto", draft("cto", TaskStatus::Todo, None), &resolver)
            .await
            .unwrap();
        let upper = created.task_id.to_uppercase();
        let fetched = store.get_task(&upper).await.unwrap().unwrap();
        assert_eq!(fetched.task_id, created.task_id);
    }

    #[tokio::test]
    async fn list_latest_tasks_caps_at_100() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(&dir.path().join("boards.sqlite")).await.unwrap();
        let resolver = resolver();
        for _ in 0..5 {
            store
                .create_task("cto", draft("cto", TaskStatus::Todo, None), &resolver)
                .await
                .unwrap();
        }
        let latest = store.list_latest_tasks(None, 10_000).await.unwrap();
        assert!(latest.len() <= 100);
        assert_eq!(latest.len(), 5);
    }

    #[tokio::test]
    async fn doing_timeout_reset_removes_task_from_the_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(&dir.path().join("boards.sqlite")).await.unwrap();
        let resolver = resolver();
        let created = store
            .create_task("cto", draft("cto", TaskStatus::Todo, None), &resolver)
            .await
            .unwrap();
        store
            .update_task_status("cto", &created.task_id, TaskStatus::Doing, None, &resolver)
            .await
            .unwrap();
        // Force it to look old by rewriting status_updated_at directly.
        sqlx::query("UPDATE tasks SET status_updated_at = ?1 WHERE task_id = ?2")
            .bind(now_millis() - 10 * 60_000)
            .bind(&created.task_id)
            .execute(&store.pool)
            .await
            .unwrap();

        let stale = store.list_doing_task_ids_older_than(4).await.unwrap();
        assert!(stale.iter().any(|id| id.eq_ignore_ascii_case(&created.task_id)));

        store
            .reset_task_status_timeout(&created.task_id)
            .await
            .unwrap();
        let stale_after = store.list_doing_task_ids_older_than(4).await.unwrap();
        assert!(!stale_after.iter().any(|id| id.eq_ignore_ascii_case(&created.task_id)));
    }

    #[tokio::test]
    async fn legacy_schema_is_migrated_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("boards.sqlite");
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let legacy_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE tasks (
                task_id TEXT PRIMARY KEY,
                board_id TEXT NOT NULL DEFAULT 'default',
                created_at INTEGER NOT NULL,
                status_updated_at INTEGER NOT NULL,
                owner_agent_id TEXT NOT NULL,
                assigned_to_agent_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                status_reason TEXT,
                project TEXT
            )",
        )
        .execute(&legacy_pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO tasks (task_id, created_at, status_updated_at, owner_agent_id,
             assigned_to_agent_id, title, status, project)
             VALUES ('t1', 1000, 1000, 'cto', 'cto', 'legacy task', 'todo', 'old-project')",
        )
        .execute(&legacy_pool)
        .await
        .unwrap();
        legacy_pool.close().await;

        let store = TaskStore::open(&db_path).await.unwrap();
        let columns = table_columns(&store.pool, "tasks").await.unwrap();
        assert!(columns.iter().any(|c| c == "updated_at"));

        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.updated_at, 1000);
        assert_eq!(task.project, None);
    }
}
