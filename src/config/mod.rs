pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl ProberConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults are
    /// used so the prober can start against a pre-provisioned proxy file
    /// without any vendor account.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: ProberConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("json") => serde_json::from_str(&content)?,
                Some("toml") => toml::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .json or .toml"),
                None => anyhow::bail!("config file has no extension, use .json or .toml"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            ProberConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!("loaded prober configuration");
        Ok(config)
    }

    /// Apply environment variable overrides for deployment settings.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NUMPROBE_PROXY_TARGET") {
            self.proxy.target = v;
        }
        if let Ok(v) = std::env::var("NUMPROBE_PROXY_COUNT_TARGET") {
            self.proxy.count_target = v;
        }
        if let Ok(v) = std::env::var("NUMPROBE_PROXY_PROTOCOL") {
            if let Ok(n) = v.parse::<u8>() {
                if let Ok(p) = ProxyProtocol::try_from(n) {
                    self.proxy.protocol = p;
                }
            }
        }
        if let Ok(v) = std::env::var("NUMPROBE_SOCKET_COUNT") {
            if let Ok(n) = v.parse::<u32>() {
                self.proxy.socket_count = n;
            }
        }
        if let Ok(v) = std::env::var("NUMPROBE_FETCH_INTERVAL") {
            if let Ok(n) = v.parse::<u64>() {
                self.proxy.fetch_interval = n;
            }
        }
        if let Ok(v) = std::env::var("NUMPROBE_PROXY_SHARE") {
            self.proxy.share = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("NUMPROBE_TLS_VERIFY") {
            self.proxy.tls_verify = v == "true" || v == "1";
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.proxy.socket_count == 0 {
            anyhow::bail!("proxy.socket_count must be at least 1");
        }
        if self.proxy.fetch_interval == 0 {
            anyhow::bail!("proxy.fetch_interval must be at least 1 second");
        }
        Ok(())
    }

    /// Whether this build is older than what the control plane accepts.
    pub fn requires_upgrade(&self) -> bool {
        self.client_version < MINIMUM_CLIENT_VERSION
    }
}
