//! Download path: request construction, response classification, resume
//! negotiation, the byte pump, and temp-file lifecycle.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use super::resume::validate_resume;
use super::space;
use super::{TransferContext, TransferEvent, TransferOutcome};
use crate::error::TaskError;
use crate::progress;
use crate::store::ResumeData;
use crate::url_model;

/// Bytes of progress a range-capable download must have made before a
/// connection error also yields resume data.
const RESUME_AFTER_ERROR_THRESHOLD: i64 = 1 << 20;

/// Delay before a timed-out, pausable task re-enters the holding queue.
const TIMEOUT_REENQUEUE_DELAY: Duration = Duration::from_secs(1);

pub(super) async fn run_download(ctx: &TransferContext) -> TransferOutcome {
    let task = &ctx.task;
    let id = task.task_id.as_str();

    // Resume only when the partial file is still usable; otherwise start over.
    let mut resume_from: Option<(PathBuf, u64)> = None;
    if let Some(rd) = &ctx.resume {
        let temp_path = PathBuf::from(&rd.data);
        let required = rd.required_start_byte.max(0) as u64;
        match tokio::fs::metadata(&temp_path).await {
            Ok(meta) if meta.len() >= required && required > 0 => {
                resume_from = Some((temp_path, required));
            }
            _ => {
                tracing::debug!(task_id = %id, "partial file unusable, restarting from zero");
            }
        }
    }

    let mut request = match build_request(ctx) {
        Ok(r) => r,
        Err(e) => return TransferOutcome::failed(TaskError::general(e.to_string())),
    };
    if let Some((_, start)) = &resume_from {
        request = request.header("Range", format!("bytes={start}-"));
    }

    // Request open is a suspension point: cancellation may already be in.
    if ctx.registry.is_stopped(id) {
        return TransferOutcome::canceled();
    }
    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => return connection_outcome(ctx, e.to_string(), None),
    };
    ctx.send_event(TransferEvent::Started);

    let status = response.status().as_u16();
    if status == 404 {
        let body = response.text().await.ok().filter(|b| !b.is_empty());
        return TransferOutcome::not_found(body);
    }
    if !(200..=206).contains(&status) {
        return TransferOutcome::failed(TaskError::http_response(
            status,
            response
                .status()
                .canonical_reason()
                .unwrap_or("unexpected HTTP status"),
        ));
    }

    capture_content_type(ctx, &response);
    let server_etag = header_string(&response, "etag");
    let accept_ranges = status == 206
        || header_string(&response, "accept-ranges")
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
    ctx.registry
        .set_can_resume(id, accept_ranges && task.allow_pause);

    // 206 is the only valid resume confirmation.
    let (temp_path, start_byte) = if let Some((temp_path, _)) = resume_from {
        if status != 206 {
            remove_temp(&temp_path).await;
            return TransferOutcome::failed(TaskError::resume(format!(
                "expected 206 Partial Content, got {status}"
            )));
        }
        let temp_len = tokio::fs::metadata(&temp_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let content_range = header_string(&response, "content-range");
        let stored_etag = ctx.resume.as_ref().and_then(|r| r.e_tag.clone());
        match validate_resume(
            content_range.as_deref(),
            server_etag.as_deref(),
            stored_etag.as_deref(),
            temp_len,
        ) {
            Ok(start) => (temp_path, start),
            Err(e) => {
                remove_temp(&temp_path).await;
                return TransferOutcome::failed(e);
            }
        }
    } else {
        (PathBuf::new(), 0)
    };
    let resuming = start_byte > 0;

    let content_length = expected_size(ctx, &response);

    // Server-derived filename, made unique in the destination directory and
    // persisted as the replacement task.
    let mut effective_task = task.clone();
    if task.wants_suggested_filename() {
        let disposition = header_string(&response, "content-disposition");
        let name = url_model::suggested_filename(disposition.as_deref(), &task.url);
        let dir = ctx.paths.task_dir(task);
        let name = url_model::unique_filename_in(&dir, &name);
        effective_task = task.copy_with(crate::task::TaskChange {
            filename: Some(name),
            ..Default::default()
        });
        ctx.registry
            .set_task_with_suggested_filename(id, effective_task.clone());
        ctx.send_event(TransferEvent::TaskModified(effective_task.clone()));
    }

    let destination_dir = ctx.paths.task_dir(&effective_task);
    if space::insufficient_space(&ctx.config, &ctx.registry, &destination_dir, content_length) {
        return TransferOutcome::failed(TaskError::file_system(
            "insufficient disk space for this download",
        ));
    }
    ctx.registry.set_remaining_bytes(id, content_length.max(0));

    // Open the temp file: truncate to the confirmed range start on resume,
    // create fresh in the policy-chosen directory otherwise.
    let (temp_path, file) = match open_temp(ctx, temp_path, resuming, start_byte, content_length).await
    {
        Ok(pair) => pair,
        Err(e) => return TransferOutcome::failed(TaskError::file_system(e.to_string())),
    };

    let pumped = pump(
        ctx,
        response,
        Sink::File(file),
        start_byte as i64,
        content_length,
        accept_ranges,
        &temp_path,
        server_etag.as_deref(),
    )
    .await;
    let bytes_total = match pumped {
        Pumped::Done(n) => n,
        Pumped::Interrupted(outcome) => return outcome,
    };

    // Atomic move into place; fall back to copy+remove across filesystems.
    let destination = ctx.paths.destination(&effective_task);
    if let Err(e) = finalize(&temp_path, &destination).await {
        remove_temp(&temp_path).await;
        return TransferOutcome::failed(TaskError::file_system(e.to_string()));
    }
    tracing::info!(
        task_id = %id,
        bytes = bytes_total,
        destination = %destination.display(),
        "download complete"
    );

    let mut outcome = TransferOutcome::complete();
    outcome.mime_type = ctx.registry.mime_type(id);
    outcome.charset = ctx.registry.char_set(id);
    outcome.expected_file_size = content_length;
    outcome
}

/// Data task: the response body is buffered and returned to the caller
/// instead of being written to a file.
pub(super) async fn run_data(ctx: &TransferContext) -> TransferOutcome {
    let task = &ctx.task;
    let id = task.task_id.as_str();

    let request = match build_request(ctx) {
        Ok(r) => r,
        Err(e) => return TransferOutcome::failed(TaskError::general(e.to_string())),
    };
    if ctx.registry.is_stopped(id) {
        return TransferOutcome::canceled();
    }
    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => return connection_outcome(ctx, e.to_string(), None),
    };
    ctx.send_event(TransferEvent::Started);

    let status = response.status().as_u16();
    if status == 404 {
        let body = response.text().await.ok().filter(|b| !b.is_empty());
        return TransferOutcome::not_found(body);
    }
    if !(200..=206).contains(&status) {
        return TransferOutcome::failed(TaskError::http_response(
            status,
            response
                .status()
                .canonical_reason()
                .unwrap_or("unexpected HTTP status"),
        ));
    }

    capture_content_type(ctx, &response);
    let content_length = expected_size(ctx, &response);
    let pumped = pump(
        ctx,
        response,
        Sink::Buffer,
        0,
        content_length,
        false,
        Path::new(""),
        None,
    )
    .await;
    if let Pumped::Interrupted(outcome) = pumped {
        return outcome;
    }

    let mut outcome = TransferOutcome::complete();
    outcome.response_body = ctx
        .registry
        .take_response_body(id)
        .map(|b| String::from_utf8_lossy(&b).into_owned());
    outcome.mime_type = ctx.registry.mime_type(id);
    outcome.charset = ctx.registry.char_set(id);
    outcome.expected_file_size = content_length;
    outcome
}

fn build_request(ctx: &TransferContext) -> Result<reqwest::RequestBuilder> {
    let task = &ctx.task;
    let method = reqwest::Method::from_bytes(task.http_request_method.as_bytes())
        .with_context(|| format!("invalid HTTP method {}", task.http_request_method))?;
    let mut request = ctx.client.request(method, task.url_with_query());
    for (name, value) in &task.headers {
        request = request.header(name, value);
    }
    if let Some(post) = &task.post {
        request = request.body(post.clone());
    }
    Ok(request)
}

enum Sink {
    File(tokio::fs::File),
    Buffer,
}

enum Pumped {
    Done(i64),
    Interrupted(TransferOutcome),
}

/// The byte pump. Each loop iteration is a suspension point observing
/// cancellation, pause, and the wall-clock timeout.
#[allow(clippy::too_many_arguments)]
async fn pump(
    ctx: &TransferContext,
    response: reqwest::Response,
    mut sink: Sink,
    start_byte: i64,
    content_length: i64,
    accept_ranges: bool,
    temp_path: &Path,
    server_etag: Option<&str>,
) -> Pumped {
    let task = &ctx.task;
    let id = task.task_id.as_str();
    let deadline = Instant::now() + Duration::from_secs(ctx.config.resource_timeout_secs);
    let mut info = progress::ProgressInfo::default();
    let mut bytes_total: i64 = 0;
    let mut stream = response.bytes_stream();

    loop {
        let chunk = stream.next().await;
        if ctx.registry.is_stopped(id) {
            if let Sink::File(_) = sink {
                remove_temp(temp_path).await;
            }
            return Pumped::Interrupted(TransferOutcome::canceled());
        }

        let chunk = match chunk {
            None => break,
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                if ctx.registry.is_programmatic_cancel(id) {
                    if let Sink::File(_) = sink {
                        remove_temp(temp_path).await;
                    }
                    return Pumped::Interrupted(TransferOutcome::canceled());
                }
                let resume_data = resumable_after_error(
                    ctx,
                    accept_ranges,
                    start_byte + bytes_total,
                    temp_path,
                    server_etag,
                );
                if resume_data.is_none() {
                    if let Sink::File(_) = sink {
                        remove_temp(temp_path).await;
                    }
                }
                return Pumped::Interrupted(connection_outcome(ctx, e.to_string(), resume_data));
            }
        };

        match &mut sink {
            Sink::File(file) => {
                if let Err(e) = file.write_all(&chunk).await {
                    remove_temp(temp_path).await;
                    return Pumped::Interrupted(TransferOutcome::failed(TaskError::file_system(
                        e.to_string(),
                    )));
                }
            }
            Sink::Buffer => ctx.registry.push_response_body(id, chunk.to_vec()),
        }
        bytes_total += chunk.len() as i64;
        if content_length > 0 {
            ctx.registry
                .set_remaining_bytes(id, (content_length - bytes_total).max(0));
        }

        let fraction = progress::transfer_fraction(bytes_total, start_byte, content_length);
        let now = Instant::now();
        if progress::should_emit(&info, fraction, content_length, now) {
            info = progress::advance(&info, fraction, bytes_total, now);
            ctx.registry.set_progress_info(id, info.clone());
            ctx.send_event(TransferEvent::Progress {
                progress: fraction,
                expected_file_size: content_length,
                network_speed: info.network_speed,
                time_remaining_ms: progress::time_remaining_ms(
                    bytes_total,
                    content_length,
                    info.network_speed,
                ),
            });
        }

        if ctx.registry.is_paused(id) {
            if task.allow_pause && accept_ranges {
                if let Sink::File(file) = &mut sink {
                    let _ = file.flush().await;
                    let _ = file.sync_all().await;
                }
                let mut outcome = TransferOutcome::paused(ResumeData {
                    task_id: id.to_string(),
                    data: temp_path.to_string_lossy().into_owned(),
                    required_start_byte: start_byte + bytes_total,
                    e_tag: server_etag.map(str::to_string),
                });
                outcome.expected_file_size = content_length;
                return Pumped::Interrupted(outcome);
            }
            if let Sink::File(_) = sink {
                remove_temp(temp_path).await;
            }
            return Pumped::Interrupted(TransferOutcome::failed(TaskError::resume(
                "server does not support pause/resume for this task",
            )));
        }

        if Instant::now() >= deadline {
            if task.allow_pause && accept_ranges {
                if let Sink::File(file) = &mut sink {
                    let _ = file.flush().await;
                    let _ = file.sync_all().await;
                }
                let mut outcome = TransferOutcome::paused(ResumeData {
                    task_id: id.to_string(),
                    data: temp_path.to_string_lossy().into_owned(),
                    required_start_byte: start_byte + bytes_total,
                    e_tag: server_etag.map(str::to_string),
                });
                outcome.expected_file_size = content_length;
                outcome.reenqueue_after = Some(TIMEOUT_REENQUEUE_DELAY);
                return Pumped::Interrupted(outcome);
            }
            if let Sink::File(_) = sink {
                remove_temp(temp_path).await;
            }
            return Pumped::Interrupted(TransferOutcome::failed(TaskError::connection(
                "transfer timed out",
            )));
        }
    }

    if let Sink::File(file) = &mut sink {
        if let Err(e) = file.sync_all().await {
            remove_temp(temp_path).await;
            return Pumped::Interrupted(TransferOutcome::failed(TaskError::file_system(
                e.to_string(),
            )));
        }
    }
    Pumped::Done(bytes_total)
}

/// Classify a transport error: canceled when the abort was ours, otherwise
/// a connection failure carrying optional resume data.
fn connection_outcome(
    ctx: &TransferContext,
    description: String,
    resume_data: Option<ResumeData>,
) -> TransferOutcome {
    let id = ctx.task.task_id.as_str();
    if ctx.registry.is_stopped(id) || ctx.registry.is_programmatic_cancel(id) {
        return TransferOutcome::canceled();
    }
    let mut outcome = TransferOutcome::failed(TaskError::connection(description));
    outcome.resume_data = resume_data;
    outcome
}

/// After a mid-transfer connection error, keep the partial file and hand out
/// resume data when the server supports ranges and enough progress was made.
fn resumable_after_error(
    ctx: &TransferContext,
    accept_ranges: bool,
    bytes_on_disk: i64,
    temp_path: &Path,
    server_etag: Option<&str>,
) -> Option<ResumeData> {
    if !accept_ranges || bytes_on_disk < RESUME_AFTER_ERROR_THRESHOLD || temp_path.as_os_str().is_empty()
    {
        return None;
    }
    Some(ResumeData {
        task_id: ctx.task.task_id.clone(),
        data: temp_path.to_string_lossy().into_owned(),
        required_start_byte: bytes_on_disk,
        e_tag: server_etag.map(str::to_string),
    })
}

/// Expected transfer size: an explicit override wins over Content-Length.
fn expected_size(ctx: &TransferContext, response: &reqwest::Response) -> i64 {
    if let Some(n) = ctx.registry.content_length_override(&ctx.task.task_id) {
        return n;
    }
    response
        .content_length()
        .map(|n| n as i64)
        .unwrap_or(-1)
}

pub(super) fn capture_content_type(ctx: &TransferContext, response: &reqwest::Response) {
    let Some(value) = header_string(response, "content-type") else {
        return;
    };
    let id = ctx.task.task_id.as_str();
    let mut parts = value.split(';');
    if let Some(mime) = parts.next().map(str::trim).filter(|m| !m.is_empty()) {
        ctx.registry.set_mime_type(id, mime.to_string());
    }
    for param in parts {
        if let Some((k, v)) = param.split_once('=') {
            if k.trim().eq_ignore_ascii_case("charset") {
                ctx.registry
                    .set_char_set(id, v.trim().trim_matches('"').to_string());
            }
        }
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Open the temp file for the pump: on resume, truncate to the confirmed
/// offset and append; otherwise create a fresh file in the directory chosen
/// by the cache policy.
async fn open_temp(
    ctx: &TransferContext,
    temp_path: PathBuf,
    resuming: bool,
    start_byte: u64,
    content_length: i64,
) -> Result<(PathBuf, tokio::fs::File)> {
    if resuming {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("cannot reopen partial file {}", temp_path.display()))?;
        file.set_len(start_byte).await?;
        drop(file);
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&temp_path)
            .await?;
        return Ok((temp_path, file));
    }

    let dir = choose_temp_dir(ctx, content_length);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("cannot create temp directory {}", dir.display()))?;
    let named = tempfile::Builder::new()
        .prefix("bgxfer_")
        .suffix(".part")
        .tempfile_in(&dir)
        .with_context(|| format!("cannot create temp file in {}", dir.display()))?;
    // The partial file must outlive this process for pause/resume.
    let path = named
        .into_temp_path()
        .keep()
        .context("cannot persist temp file")?;
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&path)
        .await?;
    Ok((path, file))
}

/// Cache vs application-support placement for the partial file.
fn choose_temp_dir(ctx: &TransferContext, content_length: i64) -> PathBuf {
    use crate::config::CacheDirPolicy;
    match ctx.config.use_cache_dir {
        CacheDirPolicy::Always => ctx.paths.cache_dir.clone(),
        CacheDirPolicy::Never => ctx.paths.support_dir.clone(),
        CacheDirPolicy::WhenAble => {
            let quota = space::available_space(&ctx.paths.cache_dir).unwrap_or(0);
            if content_length > 0 && (content_length as u64) < quota / 2 {
                ctx.paths.cache_dir.clone()
            } else {
                ctx.paths.support_dir.clone()
            }
        }
    }
}

async fn finalize(temp_path: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    match tokio::fs::rename(temp_path, destination).await {
        Ok(()) => Ok(()),
        Err(_) => {
            // Rename fails across filesystems; copy and remove instead.
            tokio::fs::copy(temp_path, destination)
                .await
                .with_context(|| format!("cannot move into {}", destination.display()))?;
            let _ = tokio::fs::remove_file(temp_path).await;
            Ok(())
        }
    }
}

async fn remove_temp(temp_path: &Path) {
    if temp_path.as_os_str().is_empty() {
        return;
    }
    if let Err(e) = tokio::fs::remove_file(temp_path).await {
        tracing::debug!("could not remove temp file {}: {e}", temp_path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_after_error_threshold_is_one_mib() {
        assert_eq!(RESUME_AFTER_ERROR_THRESHOLD, 1_048_576);
    }
}
