//! Spill table for updates that could not be delivered to the host.
//!
//! One row per (update kind, task id); a later update of the same kind for
//! the same task replaces the earlier one. Drained in task-id order when the
//! host reconnects.

use anyhow::Result;
use sqlx::Row;

use super::db::{unix_timestamp, TaskStore};

/// A spilled update row: kind tag, task id, serialized update payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpilledUpdate {
    pub kind: String,
    pub task_id: String,
    pub payload: String,
}

impl TaskStore {
    pub async fn store_spilled_update(
        &self,
        kind: &str,
        task_id: &str,
        payload: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO spilled_updates (kind, task_id, payload, modified)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(kind)
        .bind(task_id)
        .bind(payload)
        .bind(unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All spilled updates ordered by task id (then kind for stability).
    pub async fn retrieve_spilled_updates(&self) -> Result<Vec<SpilledUpdate>> {
        let rows = sqlx::query(
            "SELECT kind, task_id, payload FROM spilled_updates ORDER BY task_id ASC, kind ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| SpilledUpdate {
                kind: r.get("kind"),
                task_id: r.get("task_id"),
                payload: r.get("payload"),
            })
            .collect())
    }

    pub async fn remove_spilled_update(&self, kind: &str, task_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM spilled_updates WHERE kind = ?1 AND task_id = ?2")
            .bind(kind)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
