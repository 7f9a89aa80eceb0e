use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::task::RequireWiFi;

/// Policy for placing partial-download temp files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum CacheDirPolicy {
    /// Always use the cache directory.
    Always,
    /// Always use the application-support directory.
    Never,
    /// Use the cache directory iff the expected size fits within half the
    /// cache filesystem's free space.
    #[default]
    WhenAble,
}

/// Global engine configuration.
///
/// The running engine reads an immutable snapshot (`Arc<EngineConfig>`)
/// rebuilt on every change, so transfers never take a lock on the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-request timeout in seconds (connect + headers).
    pub request_timeout_secs: u64,
    /// Wall-clock limit for one running transfer, in seconds.
    pub resource_timeout_secs: u64,
    /// Optional HTTP proxy.
    pub proxy_address: Option<String>,
    pub proxy_port: Option<u16>,
    /// Where partial-download temp files live.
    pub use_cache_dir: CacheDirPolicy,
    /// Threshold (MiB) above which host integrations promote a transfer to
    /// a foreground service. Carried in the config surface; the core
    /// scheduler does not act on it.
    pub run_in_foreground_if_file_larger_than_mb: Option<u64>,
    /// Minimum free space (MiB) that must remain after all active downloads
    /// complete. 0 disables the check.
    pub check_available_space_mb: u64,
    /// Process-wide Wi-Fi requirement; hot-applicable at runtime.
    pub require_wifi: RequireWiFi,
    /// Maximum tasks running at once.
    pub max_concurrent: usize,
    /// Maximum running tasks per host. 0 means unlimited.
    pub max_concurrent_by_host: usize,
    /// Maximum running tasks per group. 0 means unlimited.
    pub max_concurrent_by_group: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            resource_timeout_secs: 9 * 60,
            proxy_address: None,
            proxy_port: None,
            use_cache_dir: CacheDirPolicy::WhenAble,
            run_in_foreground_if_file_larger_than_mb: None,
            check_available_space_mb: 0,
            require_wifi: RequireWiFi::AsSetByTask,
            max_concurrent: 10,
            max_concurrent_by_host: 0,
            max_concurrent_by_group: 0,
        }
    }
}

impl EngineConfig {
    /// Where the engine looks for its config file by default
    /// (`$XDG_CONFIG_HOME/bgxfer/config.toml`).
    pub fn default_path() -> Result<PathBuf> {
        let dirs = xdg::BaseDirectories::with_prefix("bgxfer")
            .context("cannot resolve XDG config home")?;
        Ok(dirs.get_config_home().join("config.toml"))
    }

    /// Read the config at `path`. A missing file is seeded with the
    /// defaults so the operator has something to edit; any other read or
    /// parse problem is an error.
    pub fn load_or_seed(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text)
                .with_context(|| format!("malformed config {}", path.display())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let config = Self::default();
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)?;
                }
                fs::write(path, toml::to_string_pretty(&config)?)
                    .with_context(|| format!("cannot seed config {}", path.display()))?;
                tracing::debug!("seeded default config at {}", path.display());
                Ok(config)
            }
            Err(e) => {
                Err(e).with_context(|| format!("cannot read config {}", path.display()))
            }
        }
    }
}
