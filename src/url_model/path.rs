//! Filename extraction from URL path.

/// Extracts the last path segment from a URL for use as a filename.
///
/// Returns `None` if the URL cannot be parsed or the path has no usable
/// segment.
pub fn filename_from_url_path(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .next_back()?;
    if segment == "." || segment == ".." {
        return None;
    }
    Some(segment.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal() {
        assert_eq!(
            filename_from_url_path("https://example.com/a/b/file.bin").as_deref(),
            Some("file.bin")
        );
        assert_eq!(
            filename_from_url_path("https://example.com/single").as_deref(),
            Some("single")
        );
    }

    #[test]
    fn root_or_empty() {
        assert_eq!(filename_from_url_path("https://example.com/"), None);
        assert_eq!(filename_from_url_path("https://example.com"), None);
    }

    #[test]
    fn query_ignored() {
        assert_eq!(
            filename_from_url_path("https://example.com/a/x.iso?mirror=3").as_deref(),
            Some("x.iso")
        );
    }
}
