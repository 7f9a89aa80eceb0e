use std::time::Duration;

use super::*;
use crate::paths::EnginePaths;
use crate::task::{Task, TaskStatus};

async fn memory_store() -> TaskStore {
    TaskStore::open_in_memory().await.unwrap()
}

fn task(id: &str) -> Task {
    Task::download(id, format!("https://example.com/{id}.bin"), format!("{id}.bin"))
}

#[tokio::test]
async fn task_record_roundtrip() {
    let store = memory_store().await;
    let record = TaskRecord::new(task("t1"), TaskStatus::Enqueued, 0.0, -1);
    store.store_task_record(&record).await.unwrap();

    let back = store.retrieve_task_record("t1").await.unwrap().unwrap();
    assert_eq!(back, record);
    assert!(store.retrieve_task_record("absent").await.unwrap().is_none());
}

#[tokio::test]
async fn task_record_replace_and_filtered_queries() {
    let store = memory_store().await;
    let mut a = task("a");
    a.group = "g1".into();
    a.creation_time = 1000;
    let mut b = task("b");
    b.group = "g2".into();
    b.creation_time = 2000;

    store
        .store_task_record(&TaskRecord::new(a.clone(), TaskStatus::Enqueued, 0.0, -1))
        .await
        .unwrap();
    store
        .store_task_record(&TaskRecord::new(b.clone(), TaskStatus::Complete, 1.0, 100))
        .await
        .unwrap();
    // Replacing updates in place.
    store
        .store_task_record(&TaskRecord::new(a.clone(), TaskStatus::Running, 0.5, 100))
        .await
        .unwrap();

    let all = store.retrieve_all_task_records(None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].task_id(), "a"); // oldest first

    let by_group = store
        .retrieve_all_task_records(Some(&RecordFilter {
            group: Some("g2".into()),
            ..Default::default()
        }))
        .await
        .unwrap();
    assert_eq!(by_group.len(), 1);
    assert_eq!(by_group[0].task_id(), "b");

    let by_status = store
        .retrieve_all_task_records(Some(&RecordFilter {
            status: Some(TaskStatus::Running),
            ..Default::default()
        }))
        .await
        .unwrap();
    assert_eq!(by_status.len(), 1);
    assert_eq!(by_status[0].task_id(), "a");

    let since = store
        .retrieve_all_task_records(Some(&RecordFilter {
            created_since: Some(1500),
            ..Default::default()
        }))
        .await
        .unwrap();
    assert_eq!(since.len(), 1);
    assert_eq!(since[0].task_id(), "b");
}

#[tokio::test]
async fn remove_task_record_is_idempotent() {
    let store = memory_store().await;
    store
        .store_task_record(&TaskRecord::new(task("x"), TaskStatus::Enqueued, 0.0, -1))
        .await
        .unwrap();
    assert_eq!(store.remove_task_record(Some("x")).await.unwrap(), 1);
    assert_eq!(store.remove_task_record(Some("x")).await.unwrap(), 0);

    store
        .store_task_record(&TaskRecord::new(task("y"), TaskStatus::Enqueued, 0.0, -1))
        .await
        .unwrap();
    assert_eq!(store.remove_task_record(None).await.unwrap(), 1);
    assert!(store.retrieve_all_task_records(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn paused_modified_resume_roundtrip() {
    let store = memory_store().await;
    let t = task("p1");
    store.store_paused_task(&t).await.unwrap();
    assert_eq!(store.retrieve_paused_task("p1").await.unwrap().unwrap(), t);
    assert_eq!(store.retrieve_all_paused_tasks().await.unwrap().len(), 1);

    let modified = t.copy_with(crate::task::TaskChange {
        filename: Some("server-name.bin".into()),
        ..Default::default()
    });
    store.store_modified_task(&modified).await.unwrap();
    assert_eq!(
        store
            .retrieve_modified_task("p1")
            .await
            .unwrap()
            .unwrap()
            .filename,
        "server-name.bin"
    );

    let rd = ResumeData {
        task_id: "p1".into(),
        data: "/tmp/bgxfer_p1.part".into(),
        required_start_byte: 524_288,
        e_tag: Some("\"abc\"".into()),
    };
    store.store_resume_data(&rd).await.unwrap();
    assert_eq!(store.retrieve_resume_data("p1").await.unwrap().unwrap(), rd);

    store.remove_paused_task("p1").await.unwrap();
    store.remove_modified_task("p1").await.unwrap();
    store.remove_resume_data("p1").await.unwrap();
    assert!(store.retrieve_paused_task("p1").await.unwrap().is_none());
    assert!(store.retrieve_modified_task("p1").await.unwrap().is_none());
    assert!(store.retrieve_resume_data("p1").await.unwrap().is_none());
}

#[tokio::test]
async fn purge_old_only_touches_aged_rows() {
    let store = memory_store().await;
    store.store_paused_task(&task("fresh")).await.unwrap();
    // A row stamped 40 days ago.
    sqlx::query(
        "INSERT INTO paused_tasks (task_id, object_json, modified) VALUES ('old', ?1, ?2)",
    )
    .bind(serde_json::to_string(&task("old")).unwrap())
    .bind(crate::store::db::unix_timestamp() - 40 * 24 * 60 * 60)
    .execute(&store.pool)
    .await
    .unwrap();

    let purged = store.purge_old(db::DEFAULT_PURGE_AGE).await.unwrap();
    assert_eq!(purged, 1);
    assert!(store.retrieve_paused_task("old").await.unwrap().is_none());
    assert!(store.retrieve_paused_task("fresh").await.unwrap().is_some());
    // Idempotent under a stable clock.
    assert_eq!(store.purge_old(db::DEFAULT_PURGE_AGE).await.unwrap(), 0);
}

#[tokio::test]
async fn spilled_updates_replace_and_drain_in_task_order() {
    let store = memory_store().await;
    store
        .store_spilled_update("status", "b", "{\"v\":1}")
        .await
        .unwrap();
    store
        .store_spilled_update("status", "a", "{\"v\":2}")
        .await
        .unwrap();
    store
        .store_spilled_update("status", "b", "{\"v\":3}")
        .await
        .unwrap();
    store
        .store_spilled_update("progress", "b", "{\"p\":0.5}")
        .await
        .unwrap();

    let all = store.retrieve_spilled_updates().await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].task_id, "a");
    // Same kind+task replaced, not appended.
    let b_status = all
        .iter()
        .find(|u| u.task_id == "b" && u.kind == "status")
        .unwrap();
    assert_eq!(b_status.payload, "{\"v\":3}");

    store.remove_spilled_update("status", "a").await.unwrap();
    assert_eq!(store.retrieve_spilled_updates().await.unwrap().len(), 2);
}

#[tokio::test]
async fn key_per_file_migration_wins_when_it_has_rows() {
    let store = memory_store().await;
    let legacy = tempfile::tempdir().unwrap();
    let records_dir = legacy.path().join("task_records");
    std::fs::create_dir_all(&records_dir).unwrap();
    let record = TaskRecord::new(task("m1"), TaskStatus::Complete, 1.0, 42);
    std::fs::write(
        records_dir.join("m1.json"),
        serde_json::to_string(&record).unwrap(),
    )
    .unwrap();

    let paths = EnginePaths::rooted_at(legacy.path());
    let source = store
        .migrate_from(
            &[MigrationSource::KeyPerFileDir(legacy.path().to_path_buf())],
            &paths,
        )
        .await
        .unwrap();
    assert_eq!(source, Some("keyPerFile"));
    assert_eq!(
        store.retrieve_task_record("m1").await.unwrap().unwrap(),
        record
    );

    // Non-empty store: migration does not run again.
    let again = store
        .migrate_from(
            &[MigrationSource::KeyPerFileDir(legacy.path().to_path_buf())],
            &paths,
        )
        .await
        .unwrap();
    assert_eq!(again, None);
}

#[tokio::test]
async fn legacy_downloader_db_migration_normalizes_saved_dir_and_progress() {
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    let root = tempfile::tempdir().unwrap();
    let paths = EnginePaths::rooted_at(root.path());

    // Build a legacy single-table database the way the old downloader did:
    // absolute saved_dir, integer-percent progress, ordinal status.
    let legacy_db_path = root.path().join("downloads.db");
    let legacy_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(&legacy_db_path)
                .create_if_missing(true),
        )
        .await
        .unwrap();
    sqlx::query(
        r#"
        CREATE TABLE tasks (
            task_id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            file_name TEXT,
            saved_dir TEXT NOT NULL,
            status INTEGER NOT NULL,
            progress INTEGER NOT NULL,
            time_created INTEGER NOT NULL
        );
        "#,
    )
    .execute(&legacy_pool)
    .await
    .unwrap();
    let insert = |id: &str, name: Option<&str>, dir: String, status: i64, progress: i64| {
        sqlx::query(
            "INSERT INTO tasks (task_id, url, file_name, saved_dir, status, progress, time_created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(id.to_string())
        .bind(format!("https://example.com/{id}"))
        .bind(name.map(str::to_string))
        .bind(dir)
        .bind(status)
        .bind(progress)
        .bind(1_600_000_000_i64)
    };
    let docs_dir = paths.documents_dir.join("downloads").display().to_string();
    insert("done", Some("a.iso"), docs_dir, 3, 100)
        .execute(&legacy_pool)
        .await
        .unwrap();
    insert("broken", None, "/srv/elsewhere".to_string(), 4, 40)
        .execute(&legacy_pool)
        .await
        .unwrap();
    legacy_pool.close().await;

    let store = memory_store().await;
    let source = store
        .migrate_from(
            &[MigrationSource::LegacyDownloaderDb(legacy_db_path)],
            &paths,
        )
        .await
        .unwrap();
    assert_eq!(source, Some("legacyDownloader"));

    // Completed row: saved_dir under the documents home is split into
    // (applicationDocuments, "downloads"), percent 100 becomes 1.0.
    let done = store.retrieve_task_record("done").await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Complete);
    assert_eq!(done.progress, 1.0);
    assert_eq!(
        done.task.base_directory,
        crate::task::BaseDirectory::ApplicationDocuments
    );
    assert_eq!(done.task.directory, "downloads");
    assert_eq!(done.task.filename, "a.iso");
    assert_eq!(done.task.creation_time, 1_600_000_000);

    // Unmatched saved_dir falls back to root; failed rows keep the failure
    // sentinel instead of the stale percent.
    let broken = store.retrieve_task_record("broken").await.unwrap().unwrap();
    assert_eq!(broken.status, TaskStatus::Failed);
    assert_eq!(broken.progress, -1.0);
    assert_eq!(
        broken.task.base_directory,
        crate::task::BaseDirectory::Root
    );
    assert_eq!(broken.task.directory, "srv/elsewhere");
    assert_eq!(broken.task.filename, "download");
}

#[tokio::test]
async fn purge_duration_is_30_days_by_default() {
    assert_eq!(db::DEFAULT_PURGE_AGE, Duration::from_secs(30 * 24 * 60 * 60));
}
