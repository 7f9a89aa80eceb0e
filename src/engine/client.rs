//! Shared HTTP client construction from the config snapshot.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::config::EngineConfig;

/// Build the outbound client: connect/read timeouts from `request_timeout`,
/// optional proxy, automatic redirects (reqwest's default policy).
///
/// The resource timeout (wall-clock per transfer) is enforced by the byte
/// pump, not here, so long-running downloads are not cut off mid-stream.
pub fn build_client(config: &EngineConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.request_timeout_secs))
        .read_timeout(Duration::from_secs(config.request_timeout_secs));

    if let (Some(address), Some(port)) = (&config.proxy_address, config.proxy_port) {
        let proxy_url = format!("http://{address}:{port}");
        let proxy = reqwest::Proxy::all(&proxy_url)
            .with_context(|| format!("invalid proxy {proxy_url}"))?;
        builder = builder.proxy(proxy);
    }

    builder.build().context("cannot build HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_defaults() {
        assert!(build_client(&EngineConfig::default()).is_ok());
    }

    #[test]
    fn builds_with_proxy() {
        let mut cfg = EngineConfig::default();
        cfg.proxy_address = Some("127.0.0.1".into());
        cfg.proxy_port = Some(3128);
        assert!(build_client(&cfg).is_ok());
    }
}
