//! SQLite-backed store implementation: connection handling, schema, purge.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default age after which paused/modified/resume rows are purged.
pub const DEFAULT_PURGE_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Handle to the SQLite-backed task store.
///
/// The database file lives under the XDG state directory
/// (`~/.local/state/bgxfer/tasks.db`) unless opened at an explicit path.
#[derive(Clone)]
pub struct TaskStore {
    pub(crate) pool: Pool<Sqlite>,
}

impl TaskStore {
    /// Open (or create) the default database and run migrations. A database
    /// that cannot be opened or migrated is fatal to engine startup.
    pub async fn open_default() -> Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("bgxfer")?;
        let state_dir = xdg_dirs.get_state_home();
        tokio::fs::create_dir_all(&state_dir).await?;
        Self::open_at(&state_dir.join("tasks.db")).await
    }

    /// Open (or create) the database at `path` and run migrations.
    pub async fn open_at(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .with_context(|| format!("cannot open task store at {}", path.display()))?;

        let store = TaskStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests (single connection so the pool can't hand
    /// back a different empty database).
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = TaskStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        // The records table duplicates the indexable task fields for
        // filtered queries; the object_json column is authoritative.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_records (
                task_id TEXT PRIMARY KEY,
                object_json TEXT NOT NULL,
                url TEXT NOT NULL,
                filename TEXT NOT NULL,
                group_name TEXT NOT NULL,
                meta_data TEXT NOT NULL,
                creation_time INTEGER NOT NULL,
                status INTEGER NOT NULL,
                progress REAL NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        for table in ["paused_tasks", "modified_tasks", "resume_data"] {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    task_id TEXT PRIMARY KEY,
                    object_json TEXT NOT NULL,
                    modified INTEGER NOT NULL
                );
                "#
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS spilled_updates (
                kind TEXT NOT NULL,
                task_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                modified INTEGER NOT NULL,
                PRIMARY KEY (kind, task_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete rows older than `age` from the paused, modified, and
    /// resume-data tables. Idempotent under a stable clock.
    pub async fn purge_old(&self, age: Duration) -> Result<u64> {
        let cutoff = unix_timestamp() - age.as_secs() as i64;
        let mut total = 0u64;
        for table in ["paused_tasks", "modified_tasks", "resume_data"] {
            let r = sqlx::query(&format!("DELETE FROM {table} WHERE modified < ?1"))
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
            total += r.rows_affected();
        }
        if total > 0 {
            tracing::debug!(rows = total, "purged aged store rows");
        }
        Ok(total)
    }

    /// True when all four task tables are empty (candidate for migration).
    pub async fn is_empty(&self) -> Result<bool> {
        for table in ["task_records", "paused_tasks", "modified_tasks", "resume_data"] {
            let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await?;
            if row.0 > 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

pub(crate) fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
