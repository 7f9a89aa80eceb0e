//! Paused-task, modified-task, and resume-data tables.
//!
//! All three share the same shape: task id, serialized object, and a
//! last-modified timestamp that feeds age-based purging.

use anyhow::Result;
use sqlx::Row;

use super::db::{unix_timestamp, TaskStore};
use super::types::ResumeData;
use crate::task::Task;

impl TaskStore {
    async fn store_json(&self, table: &str, task_id: &str, json: String) -> Result<()> {
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {table} (task_id, object_json, modified) VALUES (?1, ?2, ?3)"
        ))
        .bind(task_id)
        .bind(json)
        .bind(unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retrieve_json(&self, table: &str, task_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(&format!(
            "SELECT object_json FROM {table} WHERE task_id = ?1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("object_json")))
    }

    async fn retrieve_all_json(&self, table: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(&format!(
            "SELECT object_json FROM {table} ORDER BY task_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("object_json")).collect())
    }

    async fn remove_row(&self, table: &str, task_id: &str) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {table} WHERE task_id = ?1"))
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- paused tasks ------------------------------------------------------

    pub async fn store_paused_task(&self, task: &Task) -> Result<()> {
        self.store_json("paused_tasks", &task.task_id, serde_json::to_string(task)?)
            .await
    }

    pub async fn retrieve_paused_task(&self, task_id: &str) -> Result<Option<Task>> {
        let json = self.retrieve_json("paused_tasks", task_id).await?;
        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }

    pub async fn retrieve_all_paused_tasks(&self) -> Result<Vec<Task>> {
        let rows = self.retrieve_all_json("paused_tasks").await?;
        rows.iter()
            .map(|j| Ok(serde_json::from_str(j)?))
            .collect()
    }

    pub async fn remove_paused_task(&self, task_id: &str) -> Result<()> {
        self.remove_row("paused_tasks", task_id).await
    }

    // -- modified tasks ----------------------------------------------------

    /// A modified task is the in-flight replacement for the original task
    /// (server-suggested filename, auth rewrite); it is looked up by id
    /// before actions so the replacement survives a process restart.
    pub async fn store_modified_task(&self, task: &Task) -> Result<()> {
        self.store_json("modified_tasks", &task.task_id, serde_json::to_string(task)?)
            .await
    }

    pub async fn retrieve_modified_task(&self, task_id: &str) -> Result<Option<Task>> {
        let json = self.retrieve_json("modified_tasks", task_id).await?;
        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }

    pub async fn retrieve_all_modified_tasks(&self) -> Result<Vec<Task>> {
        let rows = self.retrieve_all_json("modified_tasks").await?;
        rows.iter()
            .map(|j| Ok(serde_json::from_str(j)?))
            .collect()
    }

    pub async fn remove_modified_task(&self, task_id: &str) -> Result<()> {
        self.remove_row("modified_tasks", task_id).await
    }

    // -- resume data -------------------------------------------------------

    pub async fn store_resume_data(&self, data: &ResumeData) -> Result<()> {
        self.store_json("resume_data", &data.task_id, serde_json::to_string(data)?)
            .await
    }

    pub async fn retrieve_resume_data(&self, task_id: &str) -> Result<Option<ResumeData>> {
        let json = self.retrieve_json("resume_data", task_id).await?;
        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }

    pub async fn retrieve_all_resume_data(&self) -> Result<Vec<ResumeData>> {
        let rows = self.retrieve_all_json("resume_data").await?;
        rows.iter()
            .map(|j| Ok(serde_json::from_str(j)?))
            .collect()
    }

    pub async fn remove_resume_data(&self, task_id: &str) -> Result<()> {
        self.remove_row("resume_data", task_id).await
    }
}
