//! Resume negotiation: Content-Range parsing and ETag validation.
//!
//! A resume holds only when the server confirmed the range (206), the
//! Content-Range is self-consistent and does not skip past the bytes we
//! already have, and the ETag is unchanged and strong.

use crate::error::TaskError;

/// Parsed `Content-Range: bytes S-E/T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

/// Parse a `Content-Range` header value; only the `bytes S-E/T` form with a
/// known total is accepted.
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    Some(ContentRange {
        start: start.trim().parse().ok()?,
        end: end.trim().parse().ok()?,
        total: total.trim().parse().ok()?,
    })
}

/// A weak validator (`W/"..."`) never proves the partial body matches.
pub fn etag_is_strong(etag: &str) -> bool {
    !etag.trim_start().starts_with("W/")
}

/// Validate a 206 response against stored resume state.
///
/// `temp_len` is the current length of the partial temp file. On success
/// returns the byte offset to truncate the temp file to (the server's range
/// start); on failure the caller must delete the temp file and fail the task
/// with the returned `resume` error.
pub fn validate_resume(
    content_range: Option<&str>,
    server_etag: Option<&str>,
    stored_etag: Option<&str>,
    temp_len: u64,
) -> Result<u64, TaskError> {
    let header = content_range.ok_or_else(|| TaskError::resume("missing Content-Range header"))?;
    let range = parse_content_range(header)
        .ok_or_else(|| TaskError::resume(format!("cannot parse Content-Range: {header}")))?;
    if range.total != range.end + 1 {
        return Err(TaskError::resume(format!(
            "server range {}-{}/{} does not extend to the end of the resource",
            range.start, range.end, range.total
        )));
    }
    if range.start > temp_len {
        return Err(TaskError::resume(format!(
            "server range starts at {} but only {} bytes are on disk",
            range.start, temp_len
        )));
    }
    match (stored_etag, server_etag) {
        (None, _) => {}
        (Some(stored), Some(server)) => {
            if stored != server {
                return Err(TaskError::resume("eTag changed since pause"));
            }
            if !etag_is_strong(server) {
                return Err(TaskError::resume("weak eTag cannot validate a resume"));
            }
        }
        (Some(_), None) => {
            return Err(TaskError::resume("server no longer returns an eTag"));
        }
    }
    Ok(range.start)
}
