//! Upload path: binary single-file uploads and multipart form uploads.
//!
//! Both modes stream the body piece-by-piece so the exact Content-Length is
//! set up front and cancellation is observed between chunks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

use super::multipart::{build_multipart, BodyPiece, FilePart, MULTIPART_BOUNDARY};
use super::{multipart, TransferContext, TransferEvent, TransferOutcome};
use crate::error::TaskError;
use crate::progress;
use crate::registry::Registry;
use crate::task::Task;

/// Upload read chunk size.
const UPLOAD_CHUNK: usize = 8 * 1024;

pub(super) async fn run_upload(ctx: &TransferContext) -> TransferOutcome {
    let task = &ctx.task;
    let id = task.task_id.as_str();

    let binary = task.post.as_deref() == Some("binary");
    let built = if binary {
        build_binary_body(ctx).await
    } else {
        build_multipart_body(ctx).await
    };
    let (pieces, content_length, extra_headers) = match built {
        Ok(parts) => parts,
        Err(outcome) => return *outcome,
    };

    let request = {
        let method = if task.http_request_method == "GET" {
            // Uploads default to POST; GET is the download default leaking through.
            reqwest::Method::POST
        } else {
            match reqwest::Method::from_bytes(task.http_request_method.as_bytes()) {
                Ok(m) => m,
                Err(_) => {
                    return TransferOutcome::failed(TaskError::general(format!(
                        "invalid HTTP method {}",
                        task.http_request_method
                    )))
                }
            }
        };
        let mut request = ctx.client.request(method, task.url_with_query());
        for (name, value) in &task.headers {
            if name.eq_ignore_ascii_case("range") && binary {
                // The range selects the uploaded slice; it is not sent.
                continue;
            }
            request = request.header(name, value);
        }
        for (name, value) in extra_headers {
            request = request.header(&name, &value);
        }
        request
            .header("Content-Length", content_length.to_string())
            .body(reqwest::Body::wrap_stream(body_stream(
                ctx,
                pieces,
                content_length as i64,
            )))
    };

    if ctx.registry.is_stopped(id) {
        return TransferOutcome::canceled();
    }
    ctx.send_event(TransferEvent::Started);

    let deadline = Duration::from_secs(ctx.config.resource_timeout_secs);
    let response = match tokio::time::timeout(deadline, request.send()).await {
        Err(_) => return TransferOutcome::failed(TaskError::connection("upload timed out")),
        Ok(Err(e)) => {
            if ctx.registry.is_stopped(id) || ctx.registry.is_programmatic_cancel(id) {
                return TransferOutcome::canceled();
            }
            return TransferOutcome::failed(TaskError::connection(e.to_string()));
        }
        Ok(Ok(r)) => r,
    };

    let status = response.status().as_u16();
    let reason = response
        .status()
        .canonical_reason()
        .unwrap_or("unexpected HTTP status");
    super::download::capture_content_type(ctx, &response);
    let body = response.text().await.ok().filter(|b| !b.is_empty());
    match status {
        200..=206 => {
            let mut outcome = TransferOutcome::complete();
            outcome.response_body = body;
            outcome.mime_type = ctx.registry.mime_type(id);
            outcome.charset = ctx.registry.char_set(id);
            outcome.expected_file_size = content_length as i64;
            outcome
        }
        404 => TransferOutcome::not_found(body),
        _ => {
            let mut outcome =
                TransferOutcome::failed(TaskError::http_response(status, reason));
            outcome.response_body = body;
            outcome
        }
    }
}

type BuiltBody = (Vec<BodyPiece>, u64, Vec<(String, String)>);

/// Binary mode: the file (or the byte range named by the task's `Range`
/// header) is the whole request body.
async fn build_binary_body(ctx: &TransferContext) -> Result<BuiltBody, Box<TransferOutcome>> {
    let task = &ctx.task;
    let path = resolve_source(ctx, &task.filename);
    let len = match tokio::fs::metadata(&path).await {
        Ok(m) if m.is_file() => m.len(),
        _ => {
            return Err(Box::new(TransferOutcome::failed(TaskError::file_system(
                format!("file to upload does not exist: {}", path.display()),
            ))))
        }
    };

    let (offset, upload_len) = match range_header(task) {
        Some((start, end)) if start <= end && end < len => (start, end - start + 1),
        Some(_) => {
            return Err(Box::new(TransferOutcome::failed(TaskError::general(
                "invalid Range header for binary upload",
            ))))
        }
        None => (0, len),
    };

    let mime = task
        .mime_type
        .clone()
        .unwrap_or_else(|| mime_from_extension(&task.filename).to_string());
    let headers = vec![
        ("Content-Type".to_string(), mime),
        (
            "Content-Disposition".to_string(),
            format!(
                "attachment; filename=\"{}\"",
                multipart::browser_encode(&task.filename)
            ),
        ),
    ];
    let pieces = vec![BodyPiece::File {
        path,
        offset,
        len: upload_len,
    }];
    Ok((pieces, upload_len, headers))
}

/// Multipart mode: form fields plus one part per file, framed with the
/// fixed boundary.
async fn build_multipart_body(ctx: &TransferContext) -> Result<BuiltBody, Box<TransferOutcome>> {
    let task = &ctx.task;
    let mut files = Vec::new();
    for upload in task.upload_files() {
        let path = resolve_source(ctx, &upload.filename);
        let len = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m.len(),
            _ => {
                return Err(Box::new(TransferOutcome::failed(TaskError::file_system(
                    format!("file to upload does not exist: {}", path.display()),
                ))))
            }
        };
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| upload.filename.clone());
        files.push(FilePart {
            field: upload.field,
            filename,
            mime_type: upload
                .mime_type
                .unwrap_or_else(|| mime_from_extension(&upload.filename).to_string()),
            path,
            len,
        });
    }

    let mut fields: Vec<(String, String)> = task
        .fields
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    fields.sort();

    let body = build_multipart(&fields, &files);
    let headers = vec![(
        "Content-Type".to_string(),
        format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"),
    )];
    Ok((body.pieces, body.content_length, headers))
}

/// Source path for an upload filename: absolute paths are used as-is,
/// relative ones resolve against the task's base directory.
fn resolve_source(ctx: &TransferContext, filename: &str) -> PathBuf {
    let path = PathBuf::from(filename);
    if path.is_absolute() {
        path
    } else {
        ctx.paths.task_dir(&ctx.task).join(filename)
    }
}

/// `Range: bytes=S-E` from the task headers (binary uploads only).
fn range_header(task: &Task) -> Option<(u64, u64)> {
    let value = task
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("range"))
        .map(|(_, v)| v.as_str())?;
    let spec = value.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

/// Minimal extension-to-MIME mapping for upload Content-Type defaults.
fn mime_from_extension(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("zip") => "application/zip",
        Some("mp4") => "video/mp4",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

struct BodyStreamState {
    pieces: std::vec::IntoIter<BodyPiece>,
    current: Option<(tokio::fs::File, u64)>,
    registry: Arc<Registry>,
    events: mpsc::UnboundedSender<(String, TransferEvent)>,
    task_id: String,
    content_length: i64,
    bytes_sent: i64,
    info: progress::ProgressInfo,
}

impl BodyStreamState {
    fn note_progress(&mut self, n: usize) {
        self.bytes_sent += n as i64;
        let fraction = progress::transfer_fraction(self.bytes_sent, 0, self.content_length);
        let now = Instant::now();
        if progress::should_emit(&self.info, fraction, self.content_length, now) {
            self.info = progress::advance(&self.info, fraction, self.bytes_sent, now);
            self.registry
                .set_progress_info(&self.task_id, self.info.clone());
            let _ = self.events.send((
                self.task_id.clone(),
                TransferEvent::Progress {
                    progress: fraction,
                    expected_file_size: self.content_length,
                    network_speed: self.info.network_speed,
                    time_remaining_ms: progress::time_remaining_ms(
                        self.bytes_sent,
                        self.content_length,
                        self.info.network_speed,
                    ),
                },
            ));
        }
    }
}

/// Stream the body pieces as chunks. Cancellation yields an error, which
/// aborts the request; the caller classifies it as `canceled`.
fn body_stream(
    ctx: &TransferContext,
    pieces: Vec<BodyPiece>,
    content_length: i64,
) -> impl futures_util::Stream<Item = std::io::Result<Vec<u8>>> + Send + 'static {
    let state = BodyStreamState {
        pieces: pieces.into_iter(),
        current: None,
        registry: Arc::clone(&ctx.registry),
        events: ctx.events.clone(),
        task_id: ctx.task.task_id.clone(),
        content_length,
        bytes_sent: 0,
        info: progress::ProgressInfo::default(),
    };
    futures_util::stream::try_unfold(state, |mut state| async move {
        if state.registry.is_stopped(&state.task_id) {
            return Err(std::io::Error::other("upload canceled"));
        }
        loop {
            if let Some((mut file, remaining)) = state.current.take() {
                if remaining == 0 {
                    continue;
                }
                let take = remaining.min(UPLOAD_CHUNK as u64) as usize;
                let mut buf = vec![0u8; take];
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    return Err(std::io::Error::other(
                        "upload file shrank while being sent",
                    ));
                }
                buf.truncate(n);
                state.current = Some((file, remaining - n as u64));
                state.note_progress(n);
                return Ok(Some((buf, state)));
            }
            match state.pieces.next() {
                Some(BodyPiece::Bytes(bytes)) => {
                    state.note_progress(bytes.len());
                    return Ok(Some((bytes, state)));
                }
                Some(BodyPiece::File { path, offset, len }) => {
                    let mut file = tokio::fs::File::open(&path).await?;
                    if offset > 0 {
                        file.seek(std::io::SeekFrom::Start(offset)).await?;
                    }
                    state.current = Some((file, len));
                }
                None => return Ok(None),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_parsed_case_insensitively() {
        let mut task = Task::new(
            crate::task::TaskKind::UploadTask,
            "t",
            "https://example.com/up",
            "a.bin",
        );
        task.headers.insert("RANGE".into(), "bytes=10-19".into());
        assert_eq!(range_header(&task), Some((10, 19)));
        task.headers.clear();
        assert_eq!(range_header(&task), None);
        task.headers.insert("Range".into(), "items=1-2".into());
        assert_eq!(range_header(&task), None);
    }

    #[test]
    fn mime_defaults() {
        assert_eq!(mime_from_extension("a.txt"), "text/plain");
        assert_eq!(mime_from_extension("photo.JPG"), "image/jpeg");
        assert_eq!(mime_from_extension("a.png"), "image/png");
        assert_eq!(mime_from_extension("no-extension"), "application/octet-stream");
    }
}
