//! Service configuration
//!
//! Loaded from a TOML file with per-section defaults. The sealing key
//! is also accepted from `WGVAULT_SEALING_KEY` so it can stay out of
//! the config file.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// State database path
    pub db_path: PathBuf,

    /// Product identifier licenses are validated against
    pub product: String,

    /// Upgrade hint attached to license rejections
    pub upgrade_url: String,

    /// 32-byte sealing key as 64 hex chars; env override wins
    pub sealing_key: Option<String>,

    pub license: LicenseConfig,
    pub pool: PoolConfig,
    pub wireguard: WireguardConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: default_store_path().join("state.db"),
            product: "wgvault-vpn".to_string(),
            upgrade_url: "https://wgvault.dev/upgrade".to_string(),
            sealing_key: None,
            license: LicenseConfig::default(),
            pool: PoolConfig::default(),
            wireguard: WireguardConfig::default(),
        }
    }
}

/// License plan defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    /// Max connects granted to an auto-provisioned trial
    pub trial_max_uses: u32,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self { trial_max_uses: 25 }
    }
}

/// Tunnel address pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    pub subnet: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            start: Ipv4Addr::new(10, 8, 0, 2),
            end: Ipv4Addr::new(10, 8, 0, 254),
            subnet: "10.8.0.0/16".to_string(),
        }
    }
}

/// Remote WireGuard endpoint management
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireguardConfig {
    /// Interface name on the endpoint host
    pub interface: String,

    /// DNS servers pushed into client configs
    pub dns: Vec<String>,

    /// Timeout for establishing the management channel
    pub connect_timeout_secs: u64,

    /// Timeout for a single remote command
    pub command_timeout_secs: u64,
}

impl Default for WireguardConfig {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            dns: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            connect_timeout_secs: 10,
            command_timeout_secs: 15,
        }
    }
}

impl ServiceConfig {
    /// Load from a TOML file, falling back to defaults for absent
    /// sections. Applies the sealing-key env override.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut config: ServiceConfig = toml::from_str(&raw)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.as_ref().display(), e)))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus env overrides, for when no config file exists.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("WGVAULT_SEALING_KEY") {
            self.sealing_key = Some(key);
        }
        if let Ok(path) = std::env::var("WGVAULT_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
    }

    fn validate(&self) -> Result<()> {
        if u32::from(self.pool.start) > u32::from(self.pool.end) {
            return Err(Error::InvalidConfig(format!(
                "pool start {} is above pool end {}",
                self.pool.start, self.pool.end
            )));
        }
        if self.product.is_empty() {
            return Err(Error::InvalidConfig("product must not be empty".to_string()));
        }
        Ok(())
    }

    /// Sealing key, required for any operation touching private keys.
    pub fn sealing_key(&self) -> Result<&str> {
        self.sealing_key
            .as_deref()
            .ok_or_else(|| Error::InvalidConfig("no sealing key configured".to_string()))
    }
}

/// Default store path
pub fn default_store_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".wgvault")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.start, Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(config.wireguard.interface, "wg0");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: ServiceConfig = toml::from_str(
            r#"
            product = "acme-vpn"

            [pool]
            start = "10.9.0.2"
            end = "10.9.0.20"
            "#,
        )
        .unwrap();
        assert_eq!(config.product, "acme-vpn");
        assert_eq!(config.pool.end, Ipv4Addr::new(10, 9, 0, 20));
        assert_eq!(config.license.trial_max_uses, 25);
    }

    #[test]
    fn inverted_pool_rejected() {
        let config: ServiceConfig = toml::from_str(
            r#"
            [pool]
            start = "10.8.0.50"
            end = "10.8.0.2"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
