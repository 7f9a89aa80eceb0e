//! Parallel download: one resource split into byte-range chunks downloaded
//! concurrently, then concatenated into the destination.
//!
//! The chunk transfers are children of the parent task's execution slot;
//! they do not pass through the holding queue. A failing child cancels its
//! siblings and fails the parent.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;

use super::{TransferContext, TransferEvent, TransferOutcome};
use crate::error::TaskError;
use crate::progress;

/// Interval at which the parent aggregates child progress.
const PROGRESS_TICK: Duration = Duration::from_millis(500);

pub(super) async fn run_parallel(ctx: &TransferContext) -> TransferOutcome {
    let task = &ctx.task;
    let id = task.task_id.as_str();

    // Probe for size and range support.
    let mut head = ctx.client.head(task.url_with_query());
    for (name, value) in &task.headers {
        head = head.header(name, value);
    }
    let response = match head.send().await {
        Ok(r) => r,
        Err(e) => {
            if ctx.registry.is_stopped(id) {
                return TransferOutcome::canceled();
            }
            return TransferOutcome::failed(TaskError::connection(e.to_string()));
        }
    };
    ctx.send_event(TransferEvent::Started);
    let status = response.status().as_u16();
    if status == 404 {
        return TransferOutcome::not_found(None);
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
    let accept_ranges = response
        .headers()
        .get("accept-ranges")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);
    let content_length = response.content_length().map(|n| n as i64).unwrap_or(-1);
    if !accept_ranges || content_length <= 0 {
        return TransferOutcome::failed(TaskError::general(
            "server does not support ranged requests for parallel download",
        ));
    }
    ctx.registry.set_remaining_bytes(id, content_length);

    // Chunk layout: even split, remainder on the last chunk.
    let chunk_count = (task.chunks.max(1) as usize).min(ctx.config.max_concurrent.max(1));
    let chunk_size = content_length as u64 / chunk_count as u64;
    let mut ranges = Vec::with_capacity(chunk_count);
    for i in 0..chunk_count {
        let start = i as u64 * chunk_size;
        let end = if i == chunk_count - 1 {
            content_length as u64 - 1
        } else {
            (i as u64 + 1) * chunk_size - 1
        };
        ranges.push((start, end));
    }

    let temp_dir = ctx.paths.support_dir.clone();
    if let Err(e) = tokio::fs::create_dir_all(&temp_dir).await {
        return TransferOutcome::failed(TaskError::file_system(e.to_string()));
    }

    let bytes_done = Arc::new(AtomicI64::new(0));
    let abort = Arc::new(AtomicBool::new(false));
    let mut join_set: JoinSet<Result<(), TaskError>> = JoinSet::new();
    let mut chunk_paths: Vec<PathBuf> = Vec::with_capacity(chunk_count);

    for (index, (start, end)) in ranges.iter().enumerate() {
        let chunk_path = match tempfile::Builder::new()
            .prefix("bgxfer_chunk_")
            .suffix(".part")
            .tempfile_in(&temp_dir)
            .map_err(|e| e.to_string())
            .and_then(|f| f.into_temp_path().keep().map_err(|e| e.to_string()))
        {
            Ok(p) => p,
            Err(e) => {
                abort.store(true, Ordering::Relaxed);
                join_set.abort_all();
                cleanup_chunks(&chunk_paths).await;
                return TransferOutcome::failed(TaskError::file_system(e));
            }
        };
        chunk_paths.push(chunk_path.clone());
        join_set.spawn(fetch_chunk(
            ctx.client.clone(),
            ctx.task.clone(),
            chunk_path,
            *start,
            *end,
            Arc::clone(&bytes_done),
            Arc::clone(&abort),
            Arc::clone(&ctx.registry),
            index,
        ));
    }

    // Wait for the children, aggregating progress on a fixed tick.
    let mut ticker = tokio::time::interval(PROGRESS_TICK);
    let mut info = progress::ProgressInfo::default();
    let failure: Option<TaskError> = loop {
        tokio::select! {
            joined = join_set.join_next() => {
                match joined {
                    None => break None,
                    Some(Ok(Ok(()))) => continue,
                    Some(Ok(Err(e))) => break Some(e),
                    Some(Err(join_error)) if join_error.is_cancelled() => continue,
                    Some(Err(join_error)) => {
                        break Some(TaskError::general(join_error.to_string()))
                    }
                }
            }
            _ = ticker.tick() => {
                if ctx.registry.is_stopped(id) {
                    abort.store(true, Ordering::Relaxed);
                    join_set.abort_all();
                    while join_set.join_next().await.is_some() {}
                    cleanup_chunks(&chunk_paths).await;
                    return TransferOutcome::canceled();
                }
                let done = bytes_done.load(Ordering::Relaxed);
                ctx.registry.set_remaining_bytes(id, (content_length - done).max(0));
                let fraction = progress::transfer_fraction(done, 0, content_length);
                let now = Instant::now();
                if progress::should_emit(&info, fraction, content_length, now) {
                    info = progress::advance(&info, fraction, done, now);
                    ctx.registry.set_progress_info(id, info.clone());
                    ctx.send_event(TransferEvent::Progress {
                        progress: fraction,
                        expected_file_size: content_length,
                        network_speed: info.network_speed,
                        time_remaining_ms: progress::time_remaining_ms(
                            done,
                            content_length,
                            info.network_speed,
                        ),
                    });
                }
            }
        }
    };

    if let Some(error) = failure {
        abort.store(true, Ordering::Relaxed);
        join_set.abort_all();
        while join_set.join_next().await.is_some() {}
        cleanup_chunks(&chunk_paths).await;
        if ctx.registry.is_stopped(id) || ctx.registry.is_programmatic_cancel(id) {
            return TransferOutcome::canceled();
        }
        return TransferOutcome::failed(TaskError::general(format!(
            "parallel chunk failed: {error}"
        )));
    }

    // All chunks landed; concatenate into the destination.
    let destination = ctx.paths.destination(task);
    if let Err(e) = concatenate(&chunk_paths, &destination).await {
        cleanup_chunks(&chunk_paths).await;
        return TransferOutcome::failed(TaskError::file_system(e.to_string()));
    }
    cleanup_chunks(&chunk_paths).await;
    tracing::info!(task_id = %id, chunks = chunk_count, "parallel download complete");
    let mut outcome = TransferOutcome::complete();
    outcome.expected_file_size = content_length;
    outcome
}

/// Download one byte range into its chunk file.
#[allow(clippy::too_many_arguments)]
async fn fetch_chunk(
    client: reqwest::Client,
    task: crate::task::Task,
    chunk_path: PathBuf,
    start: u64,
    end: u64,
    bytes_done: Arc<AtomicI64>,
    abort: Arc<AtomicBool>,
    registry: Arc<crate::registry::Registry>,
    index: usize,
) -> Result<(), TaskError> {
    let mut request = client
        .get(task.url_with_query())
        .header("Range", format!("bytes={start}-{end}"));
    for (name, value) in &task.headers {
        request = request.header(name, value);
    }
    let response = request
        .send()
        .await
        .map_err(|e| TaskError::connection(e.to_string()))?;
    let status = response.status().as_u16();
    if status != 206 {
        return Err(TaskError::http_response(
            status,
            format!("chunk {index} expected 206"),
        ));
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&chunk_path)
        .await
        .map_err(|e| TaskError::file_system(e.to_string()))?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if abort.load(Ordering::Relaxed) || registry.is_stopped(&task.task_id) {
            return Err(TaskError::general("sibling chunk aborted"));
        }
        let bytes = chunk.map_err(|e| TaskError::connection(e.to_string()))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| TaskError::file_system(e.to_string()))?;
        bytes_done.fetch_add(bytes.len() as i64, Ordering::Relaxed);
    }
    file.sync_all()
        .await
        .map_err(|e| TaskError::file_system(e.to_string()))?;
    Ok(())
}

async fn concatenate(chunk_paths: &[PathBuf], destination: &std::path::Path) -> anyhow::Result<()> {
    use anyhow::Context;
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut out = tokio::fs::File::create(destination)
        .await
        .with_context(|| format!("cannot create {}", destination.display()))?;
    for path in chunk_paths {
        let mut input = tokio::fs::File::open(path).await?;
        tokio::io::copy(&mut input, &mut out).await?;
    }
    out.sync_all().await?;
    Ok(())
}

async fn cleanup_chunks(chunk_paths: &[PathBuf]) {
    for path in chunk_paths {
        let _ = tokio::fs::remove_file(path).await;
    }
}
