//! One-time import of task state from legacy stores.
//!
//! On first initialization (all tables empty) each migration source is tried
//! in order against the store; the first source that yields rows wins and
//! the rest are skipped.

use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::Row;
use std::path::{Path, PathBuf};

use super::db::TaskStore;
use super::types::{ResumeData, TaskRecord};
use crate::paths::EnginePaths;
use crate::task::{Task, TaskKind, TaskStatus};

/// A legacy store the engine knows how to import from.
#[derive(Debug, Clone)]
pub enum MigrationSource {
    /// Key-per-file JSON store: one `<taskId>.json` per row, grouped in
    /// per-table subdirectories (`task_records`, `paused_tasks`,
    /// `modified_tasks`, `resume_data`).
    KeyPerFileDir(PathBuf),
    /// Single-table database of an external legacy downloader. Its absolute
    /// `saved_dir` is normalized to `(baseDirectory, directory)` by
    /// prefix-matching the engine's base directories.
    LegacyDownloaderDb(PathBuf),
}

impl TaskStore {
    /// Run the migration sequence if the store is empty. Returns the label
    /// of the source that provided rows, if any.
    pub async fn migrate_from(
        &self,
        sources: &[MigrationSource],
        paths: &EnginePaths,
    ) -> Result<Option<&'static str>> {
        if sources.is_empty() || !self.is_empty().await? {
            return Ok(None);
        }
        for source in sources {
            let (label, imported) = match source {
                MigrationSource::KeyPerFileDir(dir) => {
                    ("keyPerFile", self.import_key_per_file(dir).await?)
                }
                MigrationSource::LegacyDownloaderDb(path) => (
                    "legacyDownloader",
                    self.import_legacy_downloader(path, paths).await?,
                ),
            };
            if imported > 0 {
                tracing::info!(source = label, rows = imported, "migrated legacy task store");
                return Ok(Some(label));
            }
        }
        Ok(None)
    }

    async fn import_key_per_file(&self, dir: &Path) -> Result<u64> {
        let mut imported = 0u64;
        for record in read_json_dir::<TaskRecord>(&dir.join("task_records"))? {
            self.store_task_record(&record).await?;
            imported += 1;
        }
        for task in read_json_dir::<Task>(&dir.join("paused_tasks"))? {
            self.store_paused_task(&task).await?;
            imported += 1;
        }
        for task in read_json_dir::<Task>(&dir.join("modified_tasks"))? {
            self.store_modified_task(&task).await?;
            imported += 1;
        }
        for data in read_json_dir::<ResumeData>(&dir.join("resume_data"))? {
            self.store_resume_data(&data).await?;
            imported += 1;
        }
        Ok(imported)
    }

    async fn import_legacy_downloader(&self, db_path: &Path, paths: &EnginePaths) -> Result<u64> {
        if !db_path.exists() {
            return Ok(0);
        }
        let uri = format!("sqlite://{}", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&uri)
            .await
            .with_context(|| format!("cannot open legacy database {}", db_path.display()))?;

        let rows = sqlx::query(
            "SELECT task_id, url, file_name, saved_dir, status, progress, time_created FROM tasks",
        )
        .fetch_all(&pool)
        .await?;

        let mut imported = 0u64;
        for row in rows {
            let task_id: String = row.get("task_id");
            let url: String = row.get("url");
            let file_name: Option<String> = row.get("file_name");
            let saved_dir: String = row.get("saved_dir");
            let status: i64 = row.get("status");
            let progress: i64 = row.get("progress");
            let time_created: i64 = row.get("time_created");

            let (base, directory) = paths.split_absolute_dir(Path::new(&saved_dir));
            let mut task = Task::new(
                TaskKind::DownloadTask,
                task_id,
                url,
                file_name.unwrap_or_else(|| "download".to_string()),
            );
            task.base_directory = base;
            task.directory = directory;
            task.creation_time = time_created;

            let status = legacy_status(status);
            // Legacy rows store progress as an integer percent (0-100), not
            // a fraction; scale to [0, 1] unless a sentinel applies.
            let progress = status
                .progress_sentinel()
                .unwrap_or((progress as f64 / 100.0).clamp(0.0, 1.0));
            let record = TaskRecord::new(task, status, progress, -1);
            self.store_task_record(&record).await?;
            imported += 1;
        }
        Ok(imported)
    }
}

/// Legacy status ordinals: 0 undefined, 1 enqueued, 2 running, 3 complete,
/// 4 failed, 5 canceled, 6 paused.
fn legacy_status(n: i64) -> TaskStatus {
    match n {
        1 => TaskStatus::Enqueued,
        2 => TaskStatus::Running,
        3 => TaskStatus::Complete,
        5 => TaskStatus::Canceled,
        6 => TaskStatus::Paused,
        _ => TaskStatus::Failed,
    }
}

fn read_json_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(out);
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e == "json") != Some(true) {
            continue;
        }
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        match serde_json::from_str::<T>(&data) {
            Ok(value) => out.push(value),
            Err(e) => tracing::warn!("skipping malformed legacy row {}: {e}", path.display()),
        }
    }
    Ok(out)
}
