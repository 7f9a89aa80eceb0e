//! Free-disk-space gate, checked before a download opens its stream.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::EngineConfig;
use crate::registry::Registry;

/// Bytes available to unprivileged writes on the filesystem holding `path`.
#[cfg(unix)]
pub fn available_space(path: &Path) -> Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).context("path contains NUL")?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let r = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if r != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("statvfs failed for {}", path.display()));
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
pub fn available_space(_path: &Path) -> Result<u64> {
    // No portable statvfs equivalent wired up; report unlimited so the
    // check never blocks on such platforms.
    Ok(u64::MAX)
}

/// True when starting a download with `content_length` expected bytes would
/// leave less than the configured threshold free, counting the bytes all
/// other active downloads still expect to write.
pub fn insufficient_space(
    config: &EngineConfig,
    registry: &Registry,
    dir: &Path,
    content_length: i64,
) -> bool {
    if config.check_available_space_mb == 0 || content_length <= 0 {
        return false;
    }
    let Ok(available) = available_space(dir) else {
        // An unreadable filesystem shouldn't fail the task here; the write
        // path will surface a real error if there is one.
        return false;
    };
    let threshold = config.check_available_space_mb * 1024 * 1024;
    let pending = registry.total_remaining_bytes().max(0) as u64;
    available.saturating_sub(pending + content_length as u64) < threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn available_space_reports_nonzero_for_tmp() {
        let n = available_space(Path::new("/tmp")).unwrap();
        assert!(n > 0);
    }

    #[test]
    fn disabled_check_never_blocks() {
        let cfg = EngineConfig::default();
        let registry = Registry::new();
        assert!(!insufficient_space(&cfg, &registry, Path::new("/tmp"), i64::MAX / 2));
    }

    #[test]
    fn huge_expected_size_trips_threshold() {
        let mut cfg = EngineConfig::default();
        cfg.check_available_space_mb = 1;
        let registry = Registry::new();
        assert!(insufficient_space(
            &cfg,
            &registry,
            Path::new("/tmp"),
            i64::MAX / 2
        ));
    }
}
