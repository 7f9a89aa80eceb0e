//! Task model: the immutable specification of one unit of transfer work.
//!
//! A [`Task`] is a plain data object; the variant tag ([`TaskKind`]) selects
//! the transfer path in the engine. Tasks serialize to the camelCase JSON
//! shape consumed from callers and stored in the database.

mod status;

pub use status::TaskStatus;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Variant tag selecting the transfer path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    DownloadTask,
    UploadTask,
    MultiUploadTask,
    ParallelDownloadTask,
    DataTask,
}

/// Base location a task's `directory` is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BaseDirectory {
    ApplicationDocuments,
    Temporary,
    ApplicationSupport,
    ApplicationLibrary,
    Root,
}

/// Which updates the caller wants delivered for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Updates {
    None,
    Status,
    Progress,
    StatusAndProgress,
}

impl Updates {
    pub fn wants_status(self) -> bool {
        matches!(self, Updates::Status | Updates::StatusAndProgress)
    }

    pub fn wants_progress(self) -> bool {
        matches!(self, Updates::Progress | Updates::StatusAndProgress)
    }
}

/// Process-wide Wi-Fi requirement policy.
///
/// `AsSetByTask` defers to each task's `requires_wifi` flag; the other two
/// override it for every task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum RequireWiFi {
    #[default]
    AsSetByTask,
    ForAllTasks,
    ForNoTasks,
}

/// Network interface type as reported by the host's network monitor.
///
/// The engine treats `Unknown` as not Wi-Fi, so Wi-Fi-required tasks are
/// held until the host reports a Wi-Fi interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    WiFi,
    Cellular,
    Unknown,
}

impl NetworkType {
    pub fn is_wifi(self) -> bool {
        matches!(self, NetworkType::WiFi)
    }
}

/// Filename sentinel meaning "derive the filename from the server response".
pub const SUGGESTED_FILENAME: &str = "?";

fn default_method() -> String {
    "GET".to_string()
}

fn default_group() -> String {
    "default".to_string()
}

/// The immutable specification of one transfer. Field semantics follow the
/// wire-level task DTO; see the module docs for the serialization shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub task_type: TaskKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_query_parameters: Option<HashMap<String, String>>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_method")]
    pub http_request_method: String,
    /// Request body for downloads/data tasks, or the literal `"binary"` to
    /// select binary upload mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<String>,
    pub filename: String,
    #[serde(default)]
    pub directory: String,
    pub base_directory: BaseDirectory,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub meta_data: String,
    pub updates: Updates,
    #[serde(default)]
    pub retries: u8,
    #[serde(default)]
    pub retries_remaining: u8,
    #[serde(default)]
    pub requires_wi_fi: bool,
    #[serde(default)]
    pub allow_pause: bool,
    /// 0 = highest priority, 10 = lowest.
    #[serde(default)]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Multipart form field name for the file part(s). For multi-file
    /// uploads this holds a JSON array of field names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_field: Option<String>,
    /// Extra form fields for multipart uploads.
    #[serde(default)]
    pub fields: HashMap<String, String>,
    /// Chunk count for parallel downloads.
    #[serde(default)]
    pub chunks: u8,
    /// Milliseconds since epoch.
    pub creation_time: i64,
}

/// Field overrides applied by [`Task::copy_with`]. Unset fields keep the
/// original value.
#[derive(Debug, Clone, Default)]
pub struct TaskChange {
    pub url: Option<String>,
    pub filename: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub retries_remaining: Option<u8>,
    pub requires_wi_fi: Option<bool>,
    pub priority: Option<u8>,
}

/// One file of an upload: multipart field name, source filename, MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub field: String,
    pub filename: String,
    pub mime_type: Option<String>,
}

impl Task {
    /// Minimal download task; remaining fields take their defaults.
    pub fn download(task_id: impl Into<String>, url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self::new(TaskKind::DownloadTask, task_id, url, filename)
    }

    pub fn new(
        task_type: TaskKind,
        task_id: impl Into<String>,
        url: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Task {
            task_id: task_id.into(),
            task_type,
            url: url.into(),
            url_query_parameters: None,
            headers: HashMap::new(),
            http_request_method: default_method(),
            post: None,
            filename: filename.into(),
            directory: String::new(),
            base_directory: BaseDirectory::ApplicationDocuments,
            group: default_group(),
            meta_data: String::new(),
            updates: Updates::Status,
            retries: 0,
            retries_remaining: 0,
            requires_wi_fi: false,
            allow_pause: false,
            priority: 5,
            mime_type: None,
            file_field: None,
            fields: HashMap::new(),
            chunks: 1,
            creation_time: now_millis(),
        }
    }

    /// Immutable update: clone with the given overrides applied.
    pub fn copy_with(&self, change: TaskChange) -> Task {
        let mut t = self.clone();
        if let Some(url) = change.url {
            t.url = url;
        }
        if let Some(filename) = change.filename {
            t.filename = filename;
        }
        if let Some(headers) = change.headers {
            t.headers = headers;
        }
        if let Some(r) = change.retries_remaining {
            t.retries_remaining = r;
        }
        if let Some(w) = change.requires_wi_fi {
            t.requires_wi_fi = w;
        }
        if let Some(p) = change.priority {
            t.priority = p;
        }
        t
    }

    /// Host component of the task URL, or "" when the URL does not parse.
    /// Used for per-host concurrency accounting.
    pub fn host(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }

    /// The task URL with `url_query_parameters` appended.
    pub fn url_with_query(&self) -> String {
        let Some(params) = &self.url_query_parameters else {
            return self.url.clone();
        };
        if params.is_empty() {
            return self.url.clone();
        }
        match url::Url::parse(&self.url) {
            Ok(mut u) => {
                // Sort for a deterministic request line.
                let mut entries: Vec<_> = params.iter().collect();
                entries.sort();
                for (k, v) in entries {
                    u.query_pairs_mut().append_pair(k, v);
                }
                u.to_string()
            }
            Err(_) => self.url.clone(),
        }
    }

    /// Whether this task writes a destination file (vs returning the body).
    pub fn is_download(&self) -> bool {
        matches!(
            self.task_type,
            TaskKind::DownloadTask | TaskKind::ParallelDownloadTask
        )
    }

    pub fn is_upload(&self) -> bool {
        matches!(
            self.task_type,
            TaskKind::UploadTask | TaskKind::MultiUploadTask
        )
    }

    /// True when the filename is the "derive from server" sentinel.
    pub fn wants_suggested_filename(&self) -> bool {
        self.filename == SUGGESTED_FILENAME
    }

    /// The files of an upload task.
    ///
    /// A `MultiUploadTask` encodes per-file `(fileField, filename, mimeType)`
    /// as parallel JSON arrays inside the corresponding string fields; a
    /// single-file upload is the one-element case read directly.
    pub fn upload_files(&self) -> Vec<UploadFile> {
        if self.task_type == TaskKind::MultiUploadTask {
            let fields: Vec<String> = decode_list(self.file_field.as_deref());
            let names: Vec<String> = decode_list(Some(self.filename.as_str()));
            let mimes: Vec<String> = decode_list(self.mime_type.as_deref());
            if !names.is_empty() {
                return names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| UploadFile {
                        field: fields.get(i).cloned().unwrap_or_else(|| "file".to_string()),
                        filename: name.clone(),
                        mime_type: mimes.get(i).cloned(),
                    })
                    .collect();
            }
        }
        vec![UploadFile {
            field: self
                .file_field
                .clone()
                .unwrap_or_else(|| "file".to_string()),
            filename: self.filename.clone(),
            mime_type: self.mime_type.clone(),
        }]
    }
}

fn decode_list(s: Option<&str>) -> Vec<String> {
    s.and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .unwrap_or_default()
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip_keeps_every_field() {
        let mut t = Task::download("t1", "https://example.com/a/x.bin", "x.bin");
        t.headers.insert("Authorization".into(), "Bearer abc".into());
        t.url_query_parameters = Some(HashMap::from([("v".to_string(), "2".to_string())]));
        t.post = Some("payload".into());
        t.directory = "sub/dir".into();
        t.base_directory = BaseDirectory::ApplicationSupport;
        t.group = "bulk".into();
        t.meta_data = "{\"k\":1}".into();
        t.updates = Updates::StatusAndProgress;
        t.retries = 3;
        t.retries_remaining = 2;
        t.requires_wi_fi = true;
        t.allow_pause = true;
        t.priority = 2;
        t.mime_type = Some("application/octet-stream".into());
        t.file_field = Some("file".into());
        t.fields.insert("name".into(), "value".into());

        let json = serde_json::to_string(&t).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn wire_shape_is_camel_case_with_task_type_tag() {
        let t = Task::download("t1", "https://example.com/x.bin", "x.bin");
        let v: serde_json::Value = serde_json::to_value(&t).unwrap();
        assert_eq!(v["taskId"], "t1");
        assert_eq!(v["taskType"], "DownloadTask");
        assert_eq!(v["baseDirectory"], "applicationDocuments");
        assert_eq!(v["updates"], "status");
        assert!(v["creationTime"].is_i64());
    }

    #[test]
    fn host_extraction() {
        let t = Task::download("t", "https://cdn.example.com:8443/a/b", "b");
        assert_eq!(t.host(), "cdn.example.com");
        let t = Task::download("t", "not a url", "x");
        assert_eq!(t.host(), "");
    }

    #[test]
    fn copy_with_overrides_only_given_fields() {
        let t = Task::download("t", "https://example.com/x", "x");
        let t2 = t.copy_with(TaskChange {
            filename: Some("y".into()),
            retries_remaining: Some(4),
            ..Default::default()
        });
        assert_eq!(t2.filename, "y");
        assert_eq!(t2.retries_remaining, 4);
        assert_eq!(t2.url, t.url);
        assert_eq!(t2.creation_time, t.creation_time);
    }

    #[test]
    fn url_with_query_appends_sorted_params() {
        let mut t = Task::download("t", "https://example.com/x?a=1", "x");
        t.url_query_parameters = Some(HashMap::from([
            ("b".to_string(), "2".to_string()),
            ("c".to_string(), "3".to_string()),
        ]));
        assert_eq!(t.url_with_query(), "https://example.com/x?a=1&b=2&c=3");
    }

    #[test]
    fn multi_upload_files_decoded_from_json_arrays() {
        let mut t = Task::new(TaskKind::MultiUploadTask, "t", "https://example.com/up", "[\"a.txt\",\"b.png\"]");
        t.file_field = Some("[\"doc\",\"image\"]".into());
        t.mime_type = Some("[\"text/plain\",\"image/png\"]".into());
        let files = t.upload_files();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].field, "doc");
        assert_eq!(files[0].filename, "a.txt");
        assert_eq!(files[1].mime_type.as_deref(), Some("image/png"));
    }

    #[test]
    fn single_upload_file_uses_file_field_default() {
        let t = Task::new(TaskKind::UploadTask, "t", "https://example.com/up", "a.txt");
        let files = t.upload_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].field, "file");
        assert_eq!(files[0].filename, "a.txt");
    }
}
