//! Unique filename selection: `name (N).ext` suffixing.

use std::path::Path;

/// Returns `filename` unchanged if no file with that name exists in `dir`,
/// otherwise the first `name (N).ext` (N = 1, 2, ...) that is free.
pub fn unique_filename_in(dir: &Path, filename: &str) -> String {
    if !dir.join(filename).exists() {
        return filename.to_string();
    }
    let (stem, ext) = match filename.rsplit_once('.') {
        // A leading dot is a hidden file, not an extension.
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (filename, None),
    };
    let mut n = 1u32;
    loop {
        let candidate = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{filename} ({n})"),
        };
        if !dir.join(&candidate).exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_name_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(unique_filename_in(dir.path(), "a.txt"), "a.txt");
    }

    #[test]
    fn suffix_before_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        assert_eq!(unique_filename_in(dir.path(), "a.txt"), "a (1).txt");
        std::fs::write(dir.path().join("a (1).txt"), b"x").unwrap();
        assert_eq!(unique_filename_in(dir.path(), "a.txt"), "a (2).txt");
    }

    #[test]
    fn no_extension_appends_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("archive"), b"x").unwrap();
        assert_eq!(unique_filename_in(dir.path(), "archive"), "archive (1)");
    }

    #[test]
    fn hidden_file_treated_as_extensionless() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), b"x").unwrap();
        assert_eq!(unique_filename_in(dir.path(), ".env"), ".env (1)");
    }
}
