use std::fmt;

use serde::{Deserialize, Serialize};

pub mod difficulty;
pub mod parser;

pub use difficulty::format_difficulty;
pub use parser::{MATCHERS, Matched, Matcher, parse_line};

// We use `Box<str>` for strings that never grow after construction. This keeps
// events compact and avoids accidental cloning of large values.
type BoxStr = Box<str>;

/// Network address of a device, `host[:port]`. This is the device's identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddr(pub BoxStr);

impl DeviceAddr {
    pub fn new(addr: impl Into<BoxStr>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddr {
    fn from(addr: &str) -> Self {
        Self::new(addr)
    }
}

/// A monitored mining device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Network address; the stable identity of this device.
    pub addr: DeviceAddr,
    /// Display name reported by the device.
    pub hostname: BoxStr,
    /// Device model string, e.g. "NerdQAxe++".
    pub model: BoxStr,
    /// Model of the hashing chips.
    pub asic_model: BoxStr,
    /// Inactive devices are kept for history but not monitored.
    pub active: bool,
    /// Last successful snapshot poll.
    pub last_seen: Option<jiff::Timestamp>,
    /// Asset mined by this device when it differs from the configured default.
    pub asset_override: Option<BoxStr>,
}

impl Device {
    /// A freshly added device that has not been polled yet.
    pub fn new(addr: DeviceAddr) -> Self {
        Self {
            hostname: addr.0.clone(),
            addr,
            model: BoxStr::default(),
            asic_model: BoxStr::default(),
            active: true,
            last_seen: None,
            asset_override: None,
        }
    }
}

/// Hashrate averages in GH/s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Hashrate {
    pub current: f64,
    pub avg_1m: f64,
    pub avg_10m: f64,
    pub avg_1h: f64,
    pub avg_1d: f64,
}

/// Point-in-time measurement taken from one poll of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub addr: DeviceAddr,
    pub timestamp: jiff::Timestamp,
    pub hostname: BoxStr,
    pub model: BoxStr,
    pub hashrate: Hashrate,
    /// Chip temperature in °C.
    pub temp: f64,
    /// Voltage regulator temperature in °C.
    pub vr_temp: f64,
    /// Power draw in watts.
    pub power: f64,
    /// Input voltage in millivolts.
    pub voltage: f64,
    pub fan_rpm: u32,
    pub fan_percent: u32,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub best_diff: f64,
    pub best_session_diff: f64,
    pub pool_difficulty: f64,
    pub pool_connected: bool,
    pub uptime_secs: u64,
    pub wifi_rssi: i32,
    pub found_blocks: u32,
    pub total_found_blocks: u32,
}

/// One accepted share parsed from a device log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Share {
    pub addr: DeviceAddr,
    pub hostname: BoxStr,
    /// System clock at parse time, not the device clock.
    pub timestamp: jiff::Timestamp,
    /// Decimal counter or hexadecimal token, depending on firmware.
    pub job_id: BoxStr,
    /// Index of the chip that found the share.
    pub asic: u32,
    pub difficulty: f64,
}

/// What a found block is worth. Zeroed until enriched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockValue {
    pub asset_id: BoxStr,
    pub symbol: BoxStr,
    pub unit_reward: f64,
    pub unit_price: f64,
    /// `unit_reward * unit_price`, in USD.
    pub value_usd: f64,
}

impl BlockValue {
    pub fn new(asset: &AssetInfo, unit_price: f64) -> Self {
        Self {
            asset_id: asset.id.clone(),
            symbol: asset.symbol.clone(),
            unit_reward: asset.unit_reward,
            unit_price,
            value_usd: asset.unit_reward * unit_price,
        }
    }
}

/// A block found by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub addr: DeviceAddr,
    pub hostname: BoxStr,
    pub timestamp: jiff::Timestamp,
    pub difficulty: f64,
    pub network_difficulty: f64,
    pub value: BlockValue,
}

/// A mineable asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetInfo {
    /// Short lowercase id, e.g. "dgb".
    pub id: BoxStr,
    pub name: BoxStr,
    pub symbol: BoxStr,
    /// Block reward in units of the asset.
    pub unit_reward: f64,
}

/// Telemetry event flowing from device sessions to subscribers.
///
/// Serialized as `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Event {
    Snapshot(Snapshot),
    Share(Share),
    Block(Block),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Snapshot(_) => "snapshot",
            Event::Share(_) => "share",
            Event::Block(_) => "block",
        }
    }
}
