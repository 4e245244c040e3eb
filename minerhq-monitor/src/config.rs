use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::alerts::AlertConfig;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub collector: CollectorConfig,
    pub hub: HubConfig,
    pub alerts: AlertConfig,
    pub pricing: PricingConfig,
    pub retention: RetentionConfig,
    /// Device addresses (`host[:port]`) registered at startup.
    pub devices: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for the HTTP server to listen on
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    #[default]
    Memory,
    Sqlite {
        path: PathBuf,
    },
}

/// Timing and buffering of the per-device sessions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Milliseconds between snapshot polls
    pub poll_interval_ms: u64,
    /// Milliseconds to wait before reopening a failed stream
    pub reconnect_backoff_ms: u64,
    /// Timeout for each device request, in milliseconds
    pub request_timeout_ms: u64,
    /// A device is online while its last successful poll is younger than this
    pub online_window_secs: u64,
    pub snapshot_capacity: usize,
    pub share_capacity: usize,
    pub block_capacity: usize,
}

/// Floor for the poll and reconnect timers. A zero period would panic the
/// poll timer and spin the reconnect loop.
const MIN_LOOP_INTERVAL_MS: u64 = 10;

impl CollectorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_LOOP_INTERVAL_MS))
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms.max(MIN_LOOP_INTERVAL_MS))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn online_window(&self) -> Duration {
        Duration::from_secs(self.online_window_secs)
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            reconnect_backoff_ms: 5_000,
            request_timeout_ms: 5_000,
            online_window_secs: 30,
            snapshot_capacity: 100,
            share_capacity: 100,
            block_capacity: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Events waiting for fan-out before new ones are dropped
    pub queue_capacity: usize,
    /// Messages buffered per subscriber before it is considered dead
    pub mailbox_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            mailbox_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Fetch prices and rewards from the network. When off, block values use
    /// the built-in rewards and no price.
    pub enabled: bool,
    /// Asset attributed to blocks from devices without an override
    pub default_asset: String,
    /// Seconds a fetched price stays fresh
    pub price_max_age_secs: u64,
    /// Seconds between background price refreshes
    pub refresh_interval_secs: u64,
    /// Seconds between block reward refreshes
    pub reward_refresh_interval_secs: u64,
    /// Page listing current block rewards as "<amount> <SYMBOL>"
    pub rewards_url: String,
    pub binance_url: String,
    pub coingecko_url: String,
    pub request_timeout_secs: u64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_asset: "dgb".to_owned(),
            price_max_age_secs: 300,
            refresh_interval_secs: 300,
            reward_refresh_interval_secs: 86_400,
            rewards_url: "https://letsmine.it/solo".to_owned(),
            binance_url: "https://api.binance.com".to_owned(),
            coingecko_url: "https://api.coingecko.com".to_owned(),
            request_timeout_secs: 10,
        }
    }
}

/// Housekeeping of stored history and the offline sweep.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Seconds between offline checks
    pub offline_check_interval_secs: u64,
    /// Seconds between purge runs
    pub purge_interval_secs: u64,
    /// Snapshots older than this many seconds are purged
    pub snapshot_max_age_secs: u64,
    /// Shares older than this many seconds are purged
    pub share_max_age_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            offline_check_interval_secs: 60,
            purge_interval_secs: 3_600,
            snapshot_max_age_secs: 3_600,
            share_max_age_secs: 8 * 86_400,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            devices = ["192.168.1.23", "192.168.1.24:8080"]

            [storage]
            type = "sqlite"
            path = "minerhq.db"

            [alerts]
            webhook_url = "https://discord.test/hook"
            temp_ceiling = 70.0
            "#,
        )
        .unwrap();

        assert_eq!(config.devices.len(), 2);
        assert!(matches!(config.storage, StorageConfig::Sqlite { .. }));
        assert_eq!(config.alerts.temp_ceiling, 70.0);
        assert_eq!(config.alerts.hashrate_drop_pct, 20.0);
        assert_eq!(config.collector.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.hub.queue_capacity, 256);
        assert_eq!(config.pricing.default_asset, "dgb");
    }

    #[test]
    fn zero_loop_intervals_are_clamped() {
        let config: Config = toml::from_str(
            r#"
            [collector]
            poll_interval_ms = 0
            reconnect_backoff_ms = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.collector.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.collector.reconnect_backoff(), Duration::from_millis(10));
    }

    #[test]
    fn empty_file_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.server.http_addr.port(), 8080);
        assert!(config.devices.is_empty());
    }
}
