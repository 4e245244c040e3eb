//! HTTP and WebSocket access to a single mining device.

use std::time::Duration;

use jiff::Timestamp;
use minerhq_core::{Device, DeviceAddr, Hashrate, Snapshot};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

pub type DeviceStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status code: {0}")]
    Status(reqwest::StatusCode),

    #[error("stream connection failed: {0}")]
    Stream(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("stream connection timed out after {0:?}")]
    ConnectTimeout(Duration),
}

/// Response of `GET /api/system/info`.
///
/// NerdQAxe and AxeOS firmware share most fields. Fields missing from a
/// firmware's response stay at their zero value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SystemInfo {
    pub device_model: String,
    #[serde(rename = "ASICModel")]
    pub asic_model: String,
    pub hostname: String,
    pub hash_rate: f64,
    #[serde(rename = "hashRate_1m")]
    pub hash_rate_1m: f64,
    #[serde(rename = "hashRate_10m")]
    pub hash_rate_10m: f64,
    #[serde(rename = "hashRate_1h")]
    pub hash_rate_1h: f64,
    #[serde(rename = "hashRate_1d")]
    pub hash_rate_1d: f64,
    pub temp: f64,
    pub vr_temp: f64,
    pub power: f64,
    pub voltage: f64,
    #[serde(rename = "fanrpm")]
    pub fan_rpm: u32,
    #[serde(rename = "fanspeed")]
    pub fan_speed: u32,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub best_diff: f64,
    pub best_session_diff: f64,
    pub found_blocks: u32,
    pub total_found_blocks: u32,
    pub pool_difficulty: f64,
    pub uptime_seconds: u64,
    #[serde(rename = "wifiRSSI")]
    pub wifi_rssi: i32,
    pub stratum: Stratum,

    // AxeOS only
    #[serde(rename = "axeOSVersion")]
    pub axeos_version: String,
    #[serde(rename = "stratumURL")]
    pub stratum_url: String,
    pub block_found: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Stratum {
    pub pools: Vec<StratumPool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StratumPool {
    pub connected: bool,
}

impl SystemInfo {
    pub fn is_axeos(&self) -> bool {
        !self.axeos_version.is_empty()
    }

    /// AxeOS doesn't report a device model, so one is built from the chip.
    pub fn model(&self) -> Box<str> {
        if self.device_model.is_empty() && self.is_axeos() {
            format!("AxeOS ({})", self.asic_model).into()
        } else {
            self.device_model.as_str().into()
        }
    }

    /// AxeOS has no per-pool connection flag; a configured pool that has
    /// accepted shares counts as connected.
    pub fn pool_connected(&self) -> bool {
        if self.is_axeos() {
            self.shares_accepted > 0 && !self.stratum_url.is_empty()
        } else {
            self.stratum.pools.first().is_some_and(|p| p.connected)
        }
    }

    pub fn found_blocks(&self) -> u32 {
        if self.is_axeos() && self.block_found > 0 {
            self.block_found
        } else {
            self.found_blocks
        }
    }

    pub fn to_snapshot(&self, addr: &DeviceAddr, timestamp: Timestamp) -> Snapshot {
        Snapshot {
            addr: addr.clone(),
            timestamp,
            hostname: self.hostname.as_str().into(),
            model: self.model(),
            hashrate: Hashrate {
                current: self.hash_rate,
                avg_1m: self.hash_rate_1m,
                avg_10m: self.hash_rate_10m,
                avg_1h: self.hash_rate_1h,
                avg_1d: self.hash_rate_1d,
            },
            temp: self.temp,
            vr_temp: self.vr_temp,
            power: self.power,
            voltage: self.voltage,
            fan_rpm: self.fan_rpm,
            fan_percent: self.fan_speed,
            shares_accepted: self.shares_accepted,
            shares_rejected: self.shares_rejected,
            best_diff: self.best_diff,
            best_session_diff: self.best_session_diff,
            pool_difficulty: self.pool_difficulty,
            pool_connected: self.pool_connected(),
            uptime_secs: self.uptime_seconds,
            wifi_rssi: self.wifi_rssi,
            found_blocks: self.found_blocks(),
            total_found_blocks: self.total_found_blocks,
        }
    }

    pub fn to_device(&self, addr: &DeviceAddr, seen_at: Timestamp) -> Device {
        let hostname = if self.hostname.is_empty() {
            addr.0.clone()
        } else {
            self.hostname.as_str().into()
        };

        Device {
            addr: addr.clone(),
            hostname,
            model: self.model(),
            asic_model: self.asic_model.as_str().into(),
            active: true,
            last_seen: Some(seen_at),
            asset_override: None,
        }
    }
}

/// Client for the device's REST and log stream endpoints.
///
/// Cheap to clone; clones share one connection pool.
#[derive(Clone)]
pub struct DeviceClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl DeviceClient {
    pub fn new(timeout: Duration) -> Result<Self, DeviceError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, timeout })
    }

    pub async fn fetch_info(&self, addr: &DeviceAddr) -> Result<SystemInfo, DeviceError> {
        let url = format!("http://{}/api/system/info", addr);

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(DeviceError::Status(response.status()));
        }

        Ok(response.json().await?)
    }

    /// Opens the device's log stream.
    pub async fn connect_stream(&self, addr: &DeviceAddr) -> Result<DeviceStream, DeviceError> {
        let url = format!("ws://{}/api/ws", addr);

        let (stream, _) = tokio::time::timeout(self.timeout, connect_async(url))
            .await
            .map_err(|_| DeviceError::ConnectTimeout(self.timeout))??;

        Ok(stream)
    }
}
