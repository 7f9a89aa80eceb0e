//! Resolution of task base directories and engine-owned directories.
//!
//! Tasks name a [`BaseDirectory`] plus a relative `directory`; the engine
//! maps those onto concrete locations. Tests construct [`EnginePaths`]
//! rooted in a temp dir so nothing touches the real XDG tree.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::task::{BaseDirectory, Task};

/// Concrete directories the engine resolves tasks against.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    /// `BaseDirectory::ApplicationDocuments`.
    pub documents_dir: PathBuf,
    /// `BaseDirectory::ApplicationSupport`; also the non-cache temp-file home.
    pub support_dir: PathBuf,
    /// `BaseDirectory::ApplicationLibrary`.
    pub library_dir: PathBuf,
    /// Cache home used for temp files under the cache-dir policy.
    pub cache_dir: PathBuf,
    /// `BaseDirectory::Temporary`.
    pub temp_dir: PathBuf,
}

impl EnginePaths {
    /// Default locations under the XDG base directories.
    pub fn from_xdg() -> Result<Self> {
        let xdg_dirs =
            xdg::BaseDirectories::with_prefix("bgxfer").context("cannot resolve XDG directories")?;
        Ok(Self {
            documents_dir: xdg_dirs.get_data_home(),
            support_dir: xdg_dirs.get_state_home(),
            library_dir: xdg_dirs.get_data_home().join("library"),
            cache_dir: xdg_dirs.get_cache_home(),
            temp_dir: std::env::temp_dir(),
        })
    }

    /// All directories under one root; used by tests.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            documents_dir: root.join("documents"),
            support_dir: root.join("support"),
            library_dir: root.join("library"),
            cache_dir: root.join("cache"),
            temp_dir: root.join("tmp"),
        }
    }

    pub fn base_dir(&self, base: BaseDirectory) -> PathBuf {
        match base {
            BaseDirectory::ApplicationDocuments => self.documents_dir.clone(),
            BaseDirectory::Temporary => self.temp_dir.clone(),
            BaseDirectory::ApplicationSupport => self.support_dir.clone(),
            BaseDirectory::ApplicationLibrary => self.library_dir.clone(),
            BaseDirectory::Root => PathBuf::from("/"),
        }
    }

    /// Directory a task's file lands in (base + task.directory).
    pub fn task_dir(&self, task: &Task) -> PathBuf {
        let base = self.base_dir(task.base_directory);
        if task.directory.is_empty() {
            base
        } else {
            base.join(&task.directory)
        }
    }

    /// Full destination path for a task's file.
    pub fn destination(&self, task: &Task) -> PathBuf {
        self.task_dir(task).join(&task.filename)
    }

    /// Reverse mapping: split an absolute directory into
    /// `(BaseDirectory, relative directory)` by prefix-matching the known
    /// base directories. Unmatched paths map to `Root` with the path kept
    /// whole, so legacy imports never lose a location.
    pub fn split_absolute_dir(&self, dir: &Path) -> (BaseDirectory, String) {
        let candidates = [
            (BaseDirectory::ApplicationDocuments, &self.documents_dir),
            (BaseDirectory::ApplicationLibrary, &self.library_dir),
            (BaseDirectory::ApplicationSupport, &self.support_dir),
            (BaseDirectory::Temporary, &self.temp_dir),
        ];
        for (base, root) in candidates {
            if let Ok(rel) = dir.strip_prefix(root) {
                return (base, rel.to_string_lossy().into_owned());
            }
        }
        let rel = dir
            .strip_prefix("/")
            .unwrap_or(dir)
            .to_string_lossy()
            .into_owned();
        (BaseDirectory::Root, rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    #[test]
    fn destination_joins_base_directory_and_subdir() {
        let paths = EnginePaths::rooted_at(Path::new("/base"));
        let mut t = Task::download("t", "https://example.com/x.bin", "x.bin");
        t.directory = "sub".into();
        assert_eq!(
            paths.destination(&t),
            PathBuf::from("/base/documents/sub/x.bin")
        );

        t.base_directory = BaseDirectory::Root;
        t.directory = "opt/data".into();
        assert_eq!(paths.destination(&t), PathBuf::from("/opt/data/x.bin"));
    }

    #[test]
    fn split_absolute_dir_prefix_matches() {
        let paths = EnginePaths::rooted_at(Path::new("/base"));
        let (base, rel) = paths.split_absolute_dir(Path::new("/base/documents/downloads"));
        assert_eq!(base, BaseDirectory::ApplicationDocuments);
        assert_eq!(rel, "downloads");

        let (base, rel) = paths.split_absolute_dir(Path::new("/somewhere/else"));
        assert_eq!(base, BaseDirectory::Root);
        assert_eq!(rel, "somewhere/else");
    }
}
