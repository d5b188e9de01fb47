// Blockstash - Cached Chain Data Service
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Service configuration, loadable from TOML

use crate::poller::{warm_ttl, PollSchedule};
use blockstash_common::paths::BlockstashPath;
use eyre::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, warn};

/// Complete service configuration; every field has a default
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP listener
    pub server: ServerConfig,
    /// Upstream node
    pub upstream: UpstreamConfig,
    /// Persistent store
    pub storage: StorageConfig,
    /// Fast cache
    pub cache: CacheConfig,
    /// Tag pollers
    pub poller: PollerConfig,
    /// Admission control
    pub admission: AdmissionConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 8547 }
    }
}

impl ServerConfig {
    /// The socket address to bind
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr =
            self.host.parse().with_context(|| format!("Invalid host address: {}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Upstream node settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// JSON-RPC endpoint of the node
    pub rpc_url: String,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self { rpc_url: "http://127.0.0.1:8545".to_string(), request_timeout_secs: 10 }
    }
}

impl UpstreamConfig {
    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Persistent store settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file (default: `~/.blockstash/data/chain.sqlite3`)
    pub database_path: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolves the database file, creating its parent directory
    pub fn resolve_database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create database directory {}", parent.display())
                    })?;
                }
                Ok(path.clone())
            }
            None => BlockstashPath::default().ensure_chain_db_path(),
        }
    }
}

/// Fast cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Time-to-live of tag entries in seconds
    pub ttl_secs: u64,
    /// Maximum number of entries
    pub max_items: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 10, max_items: 10_000 }
    }
}

/// Tag poller settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Refresh interval of `head` in seconds
    pub head_interval_secs: u64,
    /// Refresh interval of `finalized` in seconds
    pub finalized_interval_secs: u64,
    /// Refresh interval of `safe` in seconds
    pub safe_interval_secs: u64,
    /// Poll blocks with their transactions
    pub full_blocks: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            head_interval_secs: 5,
            finalized_interval_secs: 5,
            safe_interval_secs: 5,
            full_blocks: true,
        }
    }
}

impl PollerConfig {
    /// Intervals as a [`PollSchedule`]
    pub fn schedule(&self) -> PollSchedule {
        PollSchedule {
            head: Duration::from_secs(self.head_interval_secs),
            finalized: Duration::from_secs(self.finalized_interval_secs),
            safe: Duration::from_secs(self.safe_interval_secs),
        }
    }
}

/// Admission control settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Requests admitted per client per window
    pub rate: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { rate: 10, window_secs: 60 }
    }
}

impl AdmissionConfig {
    /// Window length
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl ServiceConfig {
    /// Loads a configuration file; missing keys take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as TOML: {}", path.display()))?;

        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Serializes the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).with_context(|| "Failed to serialize config to TOML")
    }

    /// Rejects settings the service cannot run with
    pub fn validate(&self) -> Result<()> {
        let url = self.upstream.rpc_url.trim();
        ensure!(!url.is_empty(), "upstream.rpc_url must not be empty");
        ensure!(
            url.starts_with("http://") || url.starts_with("https://"),
            "upstream.rpc_url must be an http(s) URL, got {}",
            url
        );
        ensure!(self.upstream.request_timeout_secs > 0, "upstream.request_timeout_secs must be positive");
        ensure!(self.cache.max_items > 0, "cache.max_items must be positive");
        ensure!(self.admission.rate > 0, "admission.rate must be positive");
        ensure!(self.admission.window_secs > 0, "admission.window_secs must be positive");
        ensure!(
            self.poller.head_interval_secs > 0
                && self.poller.finalized_interval_secs > 0
                && self.poller.safe_interval_secs > 0,
            "poller intervals must be positive"
        );
        self.server.socket_addr()?;

        if self.cache_ttl() < self.tag_ttl() {
            warn!(
                "cache.ttl_secs ({}) would let tag entries expire between polls, they will use {:?}",
                self.cache.ttl_secs,
                self.tag_ttl()
            );
        }
        Ok(())
    }

    /// Configured cache TTL
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    /// TTL for tag entries: outlives the longest poll interval with slack
    pub fn tag_ttl(&self) -> Duration {
        warm_ttl(self.cache_ttl(), self.poller.schedule().longest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(
            config.server.socket_addr().unwrap(),
            "127.0.0.1:8547".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.upstream.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.poller.schedule(), PollSchedule::uniform(Duration::from_secs(5)));
        assert_eq!(config.tag_ttl(), Duration::from_secs(10));
        assert_eq!(config.admission.rate, 10);
        assert_eq!(config.admission.window(), Duration::from_secs(60));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("blockstash.toml");
        fs::write(
            &path,
            r#"
[upstream]
rpc_url = "https://node.example:8545"

[poller]
finalized_interval_secs = 30
full_blocks = false

[admission]
rate = 100
"#,
        )
        .unwrap();

        let config = ServiceConfig::from_file(&path).unwrap();
        assert_eq!(config.upstream.rpc_url, "https://node.example:8545");
        assert_eq!(config.upstream.request_timeout_secs, 10);
        assert_eq!(config.poller.finalized_interval_secs, 30);
        assert_eq!(config.poller.head_interval_secs, 5);
        assert!(!config.poller.full_blocks);
        assert_eq!(config.admission.rate, 100);
        assert_eq!(config.admission.window_secs, 60);
        assert_eq!(config.tag_ttl(), Duration::from_secs(45));
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = ServiceConfig::default();
        config.storage.database_path = Some(PathBuf::from("/var/lib/blockstash/chain.sqlite3"));
        config.cache.max_items = 42;

        let parsed: ServiceConfig = toml::from_str(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validation_rejects_bad_settings() {
        let cases: [fn(&mut ServiceConfig); 7] = [
            |c| c.upstream.rpc_url = String::new(),
            |c| c.upstream.rpc_url = "ws://127.0.0.1:8546".into(),
            |c| c.admission.rate = 0,
            |c| c.admission.window_secs = 0,
            |c| c.poller.safe_interval_secs = 0,
            |c| c.cache.max_items = 0,
            |c| c.server.host = "not-an-ip".into(),
        ];

        for mutate in cases {
            let mut config = ServiceConfig::default();
            mutate(&mut config);
            assert!(config.validate().is_err(), "accepted {config:?}");
        }
    }

    #[test]
    fn test_database_path_parent_is_created() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("chain.sqlite3");
        let storage = StorageConfig { database_path: Some(path.clone()) };

        assert_eq!(storage.resolve_database_path().unwrap(), path);
        assert!(temp_dir.path().join("nested").is_dir());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(ServiceConfig::from_file(temp_dir.path().join("absent.toml")).is_err());
    }
}
