//! Tracing setup for the engine.
//!
//! Hosts that embed the engine usually install their own subscriber; this
//! is for standalone use. Logs go to a file in the XDG state directory so a
//! background process leaves a trail, with stderr as the fallback when the
//! state directory cannot be written.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,bgxfer=debug"))
}

fn open_log_file() -> anyhow::Result<(PathBuf, File)> {
    let dirs = xdg::BaseDirectories::with_prefix("bgxfer")?;
    let path = dirs.place_state_file("bgxfer.log")?;
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((path, file))
}

/// Install the engine's subscriber: append to `bgxfer.log` under the XDG
/// state dir, honoring `RUST_LOG`. Returns the log path, or `None` when the
/// state dir was unusable and logging went to stderr instead.
///
/// Panics if a global subscriber is already set; call once, early.
pub fn init() -> Option<PathBuf> {
    match open_log_file() {
        Ok((path, file)) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
            tracing::info!("logging to {}", path.display());
            Some(path)
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(io::stderr)
                .with_ansi(false)
                .init();
            tracing::warn!("state directory unavailable ({e}); logging to stderr");
            None
        }
    }
}
