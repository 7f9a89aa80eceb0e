//! Task record reads and writes.

use anyhow::Result;
use sqlx::Row;

use super::db::TaskStore;
use super::types::{RecordFilter, TaskRecord};

impl TaskStore {
    /// Insert or replace the record for a task.
    pub async fn store_task_record(&self, record: &TaskRecord) -> Result<()> {
        let object_json = serde_json::to_string(record)?;
        let task = &record.task;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO task_records (
                task_id, object_json, url, filename, group_name,
                meta_data, creation_time, status, progress
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&task.task_id)
        .bind(object_json)
        .bind(&task.url)
        .bind(&task.filename)
        .bind(&task.group)
        .bind(&task.meta_data)
        .bind(task.creation_time)
        .bind(record.status.ordinal() as i64)
        .bind(record.progress)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn retrieve_task_record(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query("SELECT object_json FROM task_records WHERE task_id = ?1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let json: String = row.get("object_json");
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// All records matching `filter`, oldest first.
    pub async fn retrieve_all_task_records(
        &self,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<TaskRecord>> {
        let mut sql = String::from("SELECT object_json FROM task_records WHERE 1=1");
        let filter = filter.cloned().unwrap_or_default();
        if filter.group.is_some() {
            sql.push_str(" AND group_name = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.created_since.is_some() {
            sql.push_str(" AND creation_time >= ?");
        }
        sql.push_str(" ORDER BY creation_time ASC, task_id ASC");

        let mut query = sqlx::query(&sql);
        if let Some(group) = &filter.group {
            query = query.bind(group.clone());
        }
        if let Some(status) = filter.status {
            query = query.bind(status.ordinal() as i64);
        }
        if let Some(since) = filter.created_since {
            query = query.bind(since);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.get("object_json");
            out.push(serde_json::from_str(&json)?);
        }
        Ok(out)
    }

    /// Remove one record, or all records when `task_id` is None. Removing an
    /// absent record is a no-op.
    pub async fn remove_task_record(&self, task_id: Option<&str>) -> Result<u64> {
        let r = match task_id {
            Some(id) => {
                sqlx::query("DELETE FROM task_records WHERE task_id = ?1")
                    .bind(id)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM task_records")
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(r.rows_affected())
    }
}
