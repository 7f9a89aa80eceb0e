//! Error taxonomy surfaced to callers with failed task updates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Exception attached to a `failed` (and some `notFound`) status update.
///
/// The kind maps onto the wire-level exception types; `http_response_code`
/// is set when the server answered with a status outside the success range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_response_code: Option<u16>,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.description)?;
        if let Some(code) = self.http_response_code {
            write!(f, " (HTTP {code})")?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskError {}

/// Wire-level exception type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Anything not covered by a more specific kind.
    General,
    /// Local filesystem failure (no space, unwritable destination, ...).
    FileSystem,
    /// Network-level failure or timeout.
    Connection,
    /// Server answered with an HTTP status outside 200-206 (and not 404).
    HttpResponse,
    /// Resume could not be honored (ETag mismatch, bad Content-Range, ...).
    Resume,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::General => "general",
            ErrorKind::FileSystem => "fileSystem",
            ErrorKind::Connection => "connection",
            ErrorKind::HttpResponse => "httpResponse",
            ErrorKind::Resume => "resume",
        }
    }
}

impl TaskError {
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            http_response_code: None,
        }
    }

    pub fn general(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::General, description)
    }

    pub fn file_system(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::FileSystem, description)
    }

    pub fn connection(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, description)
    }

    pub fn resume(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resume, description)
    }

    pub fn http_response(code: u16, description: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::HttpResponse,
            description: description.into(),
            http_response_code: Some(code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_code() {
        let e = TaskError::http_response(503, "Service Unavailable");
        let s = e.to_string();
        assert!(s.contains("httpResponse"));
        assert!(s.contains("503"));

        let e = TaskError::resume("eTag mismatch");
        assert_eq!(e.to_string(), "resume: eTag mismatch");
    }

    #[test]
    fn serde_roundtrip() {
        let e = TaskError::http_response(416, "Range Not Satisfiable");
        let json = serde_json::to_string(&e).unwrap();
        let back: TaskError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
