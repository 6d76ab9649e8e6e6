use std::path::{Path, PathBuf};
use serde::Deserialize;
use anyhow::{bail, Context, Result};
use shared::protocol::DEFAULT_IDENTITY_HEADER;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub friends: FriendsConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// How long delivered notifications are kept before pruning
    #[serde(default = "default_delivered_retention")]
    pub delivered_retention_secs: u64,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Notification queue routes for the delivery worker, kept off the
    /// owner-facing listener
    #[serde(default = "default_worker_listen")]
    pub worker_listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Header the authenticating front proxy sets to the caller's user id
    #[serde(default = "default_identity_header")]
    pub header: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FriendsConfig {
    /// Friend-graph export, re-read on every lookup
    #[serde(default = "default_friends_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// Service type to display name mapping
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerConfig {
    /// Bearer token the delivery worker must present. Unset rejects all
    /// worker requests.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/share-authority/shares.db")
}

fn default_delivered_retention() -> u64 {
    86400
}

fn default_maintenance_interval() -> u64 {
    300
}

fn default_listen() -> String {
    "[::]:8054".to_string()
}

fn default_worker_listen() -> String {
    "127.0.0.1:8055".to_string()
}

fn default_identity_header() -> String {
    DEFAULT_IDENTITY_HEADER.to_string()
}

fn default_friends_path() -> PathBuf {
    PathBuf::from("/var/lib/share-authority/friends.toml")
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("/etc/share-authority/services.toml")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            delivered_retention_secs: default_delivered_retention(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            worker_listen: default_worker_listen(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            header: default_identity_header(),
        }
    }
}

impl Default for FriendsConfig {
    fn default() -> Self {
        Self {
            path: default_friends_path(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.store.validate()
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.maintenance_interval_secs == 0 {
            bail!("store.maintenance_interval_secs must be greater than zero");
        }

        let retention = i64::try_from(self.delivered_retention_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds);
        if retention.is_none() {
            bail!(
                "store.delivered_retention_secs is out of range: {}",
                self.delivered_retention_secs
            );
        }

        Ok(())
    }
}
