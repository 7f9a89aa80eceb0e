//! Multipart/form-data body construction for uploads.
//!
//! The body is assembled as a piece list (header bytes interleaved with file
//! contents) so the exact Content-Length is known before anything is sent
//! and file data can still be streamed.

use std::path::PathBuf;

/// Fixed boundary; CRLF line discipline throughout.
pub const MULTIPART_BOUNDARY: &str = "-----background_downloader-akjhfw281onqciyhnIk";

const CRLF: &str = "\r\n";

/// One piece of the request body, in order. `offset` supports byte-range
/// uploads that start partway into the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyPiece {
    Bytes(Vec<u8>),
    File { path: PathBuf, offset: u64, len: u64 },
}

/// Assembled multipart body with its exact length.
#[derive(Debug, Clone)]
pub struct MultipartBody {
    pub pieces: Vec<BodyPiece>,
    pub content_length: u64,
}

/// A file to include: form field name, filename sent to the server, MIME
/// type, and the local file.
#[derive(Debug, Clone)]
pub struct FilePart {
    pub field: String,
    pub filename: String,
    pub mime_type: String,
    pub path: PathBuf,
    pub len: u64,
}

/// Escape a field name or filename the way browsers do: CR, LF, and CRLF
/// each become the literal `%0D%0A`, and double quotes become `%22`. This is
/// deliberately not RFC-compliant; it matches observed browser behavior.
pub fn browser_encode(s: &str) -> String {
    s.replace("\r\n", "%0D%0A")
        .replace('\r', "%0D%0A")
        .replace('\n', "%0D%0A")
        .replace('"', "%22")
}

/// Split a field value of the form `"v1","v2",..."vn"` (two or more quoted
/// strings, comma separated) into its parts; any other value stays whole.
pub fn split_field_value(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if !trimmed.starts_with('"') || !trimmed.ends_with('"') {
        return vec![value.to_string()];
    }
    let mut parts = Vec::new();
    let mut rest = trimmed;
    loop {
        let Some(after_open) = rest.strip_prefix('"') else {
            return vec![value.to_string()];
        };
        let Some(close) = after_open.find('"') else {
            return vec![value.to_string()];
        };
        parts.push(after_open[..close].to_string());
        rest = after_open[close + 1..].trim_start();
        if rest.is_empty() {
            break;
        }
        let Some(after_comma) = rest.strip_prefix(',') else {
            return vec![value.to_string()];
        };
        rest = after_comma.trim_start();
    }
    if parts.len() >= 2 {
        parts
    } else {
        vec![value.to_string()]
    }
}

/// Extra headers for a form field value: JSON-looking values are sent as
/// `application/json`, non-ASCII text as UTF-8 with binary transfer
/// encoding, plain ASCII with no extra headers.
fn field_content_headers(value: &str) -> String {
    let looks_json = matches!(value.trim_start().as_bytes().first(), Some(b'{') | Some(b'['));
    if looks_json {
        format!("Content-Type: application/json; charset=utf-8{CRLF}")
    } else if !value.is_ascii() {
        format!(
            "Content-Type: text/plain; charset=utf-8{CRLF}Content-Transfer-Encoding: binary{CRLF}"
        )
    } else {
        String::new()
    }
}

/// One complete form-field part, including its leading boundary and the
/// trailing CRLF that separates it from the next part.
fn field_part(name: &str, value: &str) -> String {
    format!(
        "--{MULTIPART_BOUNDARY}{CRLF}Content-Disposition: form-data; name=\"{}\"{CRLF}{}{CRLF}{value}{CRLF}",
        browser_encode(name),
        field_content_headers(value),
    )
}

/// Header block for one file part (the file bytes follow it).
fn file_part_header(file: &FilePart) -> String {
    format!(
        "--{MULTIPART_BOUNDARY}{CRLF}Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"{CRLF}Content-Type: {}{CRLF}{CRLF}",
        browser_encode(&file.field),
        browser_encode(&file.filename),
        file.mime_type,
    )
}

/// Build the full multipart body: fields (list-valued fields expanded into
/// repeated entries), then each file, then the terminator.
pub fn build_multipart(fields: &[(String, String)], files: &[FilePart]) -> MultipartBody {
    let mut pieces: Vec<BodyPiece> = Vec::new();
    let mut text = String::new();
    for (name, value) in fields {
        for entry in split_field_value(value) {
            text.push_str(&field_part(name, &entry));
        }
    }
    for file in files {
        text.push_str(&file_part_header(file));
        if !text.is_empty() {
            pieces.push(BodyPiece::Bytes(text.clone().into_bytes()));
            text.clear();
        }
        pieces.push(BodyPiece::File {
            path: file.path.clone(),
            offset: 0,
            len: file.len,
        });
        text.push_str(CRLF);
    }
    text.push_str(&format!("--{MULTIPART_BOUNDARY}--{CRLF}"));
    pieces.push(BodyPiece::Bytes(text.into_bytes()));

    let content_length = pieces
        .iter()
        .map(|p| match p {
            BodyPiece::Bytes(b) => b.len() as u64,
            BodyPiece::File { len, .. } => *len,
        })
        .sum();
    MultipartBody {
        pieces,
        content_length,
    }
}
