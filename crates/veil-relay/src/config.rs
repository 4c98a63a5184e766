use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use veil_store::{AssetConfig, MailboxConfig};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "veil";
pub const APP_NAME: &str = "relay";
pub const CONFIG_FILE: &str = "relay.json";

pub const ENV_BIND_ADDR: &str = "VEIL_BIND_ADDR";
pub const ENV_AUTH_SECRET: &str = "VEIL_AUTH_SECRET";
pub const ENV_LOG_LEVEL: &str = "VEIL_LOG_LEVEL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// Hex-encoded HMAC key for bearer tokens.
    pub auth_secret: Option<String>,
    pub users: Vec<DirectoryUser>,
    pub mailbox_capacity: usize,
    pub mailbox_ttl_secs: u64,
    pub mailbox_sweep_secs: u64,
    pub asset_ttl_secs: u64,
    pub asset_sweep_secs: u64,
    pub max_asset_bytes: usize,
    pub max_frame_bytes: usize,
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            auth_secret: None,
            users: vec![],
            mailbox_capacity: 100,
            mailbox_ttl_secs: 24 * 60 * 60,
            mailbox_sweep_secs: 60 * 60,
            asset_ttl_secs: 60 * 60,
            asset_sweep_secs: 30 * 60,
            max_asset_bytes: 50 * 1024 * 1024,
            max_frame_bytes: 64 * 1024 * 1024,
            log_level: "info".into(),
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).map(|d| d.config_dir().join(CONFIG_FILE))
}

impl RelayConfig {
    /// Defaults, then `path` (or the platform config file if it exists),
    /// then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            self.bind_addr = addr
                .parse()
                .map_err(|e| anyhow!("{ENV_BIND_ADDR}={addr}: {e}"))?;
        }
        if let Some(secret) = lookup(ENV_AUTH_SECRET) {
            self.auth_secret = Some(secret);
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn auth_secret_bytes(&self) -> Result<Vec<u8>> {
        let hex_secret = self
            .auth_secret
            .as_deref()
            .ok_or_else(|| anyhow!("auth_secret is not configured (set {ENV_AUTH_SECRET})"))?;
        let secret = hex::decode(hex_secret.trim()).context("auth_secret must be hex")?;
        if secret.len() < 16 {
            return Err(anyhow!("auth_secret must be at least 16 bytes"));
        }
        Ok(secret)
    }

    pub fn mailbox_config(&self) -> Result<MailboxConfig> {
        Ok(MailboxConfig {
            capacity: self.mailbox_capacity,
            ttl: ttl_from_secs("mailbox_ttl_secs", self.mailbox_ttl_secs)?,
        })
    }

    pub fn asset_config(&self) -> Result<AssetConfig> {
        Ok(AssetConfig {
            max_asset_bytes: self.max_asset_bytes,
            ttl: ttl_from_secs("asset_ttl_secs", self.asset_ttl_secs)?,
        })
    }
}

fn ttl_from_secs(field: &str, secs: u64) -> Result<chrono::Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| anyhow!("{field}={secs} is out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_match_service_limits() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.mailbox_capacity, 100);
        assert_eq!(config.mailbox_config().unwrap().ttl, chrono::Duration::hours(24));
        assert_eq!(config.asset_config().unwrap().ttl, chrono::Duration::hours(1));
        assert_eq!(config.max_asset_bytes, 50 * 1024 * 1024);
    }

    #[test]
    fn file_values_fill_missing_fields_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"mailbox_capacity": 5, "users": [{{"user_id": "100001", "display_name": "alice"}}]}}"#
        )
        .unwrap();
        let config = RelayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.mailbox_capacity, 5);
        assert_eq!(config.users.len(), 1);
        assert_eq!(config.asset_sweep_secs, 30 * 60);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_BIND_ADDR, "0.0.0.0:4000"),
            (ENV_AUTH_SECRET, "00112233445566778899aabbccddeeff"),
            (ENV_LOG_LEVEL, "debug"),
        ]);
        let mut config = RelayConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.bind_addr.port(), 4000);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.auth_secret_bytes().unwrap().len(), 16);
    }

    #[test]
    fn bad_bind_addr_is_rejected() {
        let mut config = RelayConfig::default();
        assert!(config
            .apply_env(|k| (k == ENV_BIND_ADDR).then(|| "nope".to_string()))
            .is_err());
    }

    #[test]
    fn out_of_range_ttl_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"mailbox_ttl_secs": 18446744073709551615, "auth_secret": "00112233445566778899aabbccddeeff"}}"#
        )
        .unwrap();
        let config = RelayConfig::from_file(file.path()).unwrap();
        let err = config.mailbox_config().unwrap_err();
        assert!(err.to_string().contains("mailbox_ttl_secs"));
        assert!(crate::build(&config).is_err());

        let config = RelayConfig {
            asset_ttl_secs: i64::MAX as u64,
            ..RelayConfig::default()
        };
        assert!(config.asset_config().is_err());
    }

    #[test]
    fn short_or_missing_secret_is_rejected() {
        let mut config = RelayConfig::default();
        assert!(config.auth_secret_bytes().is_err());
        config.auth_secret = Some("abcd".into());
        assert!(config.auth_secret_bytes().is_err());
    }
}
