//! Filename derivation: Content-Disposition parsing, URL path fallback,
//! and unique-name suffixing.

mod content_disposition;
mod path;
mod unique;

pub use content_disposition::parse_content_disposition_filename;
pub use path::filename_from_url_path;
pub use unique::unique_filename_in;

/// Resolve the server-suggested filename for a download whose task asked the
/// engine to derive one: Content-Disposition first (RFC 5987 `filename*`
/// preferred), then the last URL path segment, then a fixed fallback.
pub fn suggested_filename(content_disposition: Option<&str>, url: &str) -> String {
    if let Some(header) = content_disposition {
        if let Some(name) = parse_content_disposition_filename(header) {
            return name;
        }
    }
    filename_from_url_path(url).unwrap_or_else(|| "download".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_wins_over_url() {
        let name = suggested_filename(
            Some("attachment; filename=\"report.pdf\""),
            "https://example.com/x/y.bin",
        );
        assert_eq!(name, "report.pdf");
    }

    #[test]
    fn url_segment_when_no_header() {
        assert_eq!(
            suggested_filename(None, "https://example.com/x/y.bin?q=1"),
            "y.bin"
        );
    }

    #[test]
    fn fixed_fallback() {
        assert_eq!(suggested_filename(None, "https://example.com/"), "download");
    }
}
