pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use jiff::Timestamp;
use minerhq_core::{Block, Device, DeviceAddr, Share, Snapshot};

/// Persistence for devices and the telemetry they produce.
///
/// Every operation is independent; callers in the pipeline log failures and
/// carry on.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    /// Error type specific to this storage implementation
    type Error: std::error::Error + Send + Sync + 'static;

    /// Insert a device or refresh its identity fields.
    ///
    /// An existing `asset_override` or `last_seen` is kept when the incoming
    /// device has none.
    async fn upsert_device(&self, device: Device) -> Result<(), Self::Error>;

    async fn get_device(&self, addr: &DeviceAddr) -> Result<Option<Device>, Self::Error>;

    /// All devices that should be monitored.
    async fn list_active_devices(&self) -> Result<Vec<Device>, Self::Error>;

    /// Stop monitoring a device while keeping its history.
    /// Returns `false` if the device is unknown.
    async fn deactivate_device(&self, addr: &DeviceAddr) -> Result<bool, Self::Error>;

    /// Pin the asset a device mines, or clear the pin with `None`.
    async fn set_asset_override(
        &self,
        addr: &DeviceAddr,
        asset: Option<&str>,
    ) -> Result<bool, Self::Error>;

    /// Devices whose asset differs from the configured default.
    async fn devices_with_asset_override(&self) -> Result<Vec<(DeviceAddr, Box<str>)>, Self::Error>;

    async fn insert_snapshot(&self, snapshot: Snapshot) -> Result<(), Self::Error>;

    async fn latest_snapshot(&self, addr: &DeviceAddr) -> Result<Option<Snapshot>, Self::Error>;

    async fn insert_share(&self, share: Share) -> Result<(), Self::Error>;

    /// The highest difficulty share with `start <= timestamp < end`, over all devices.
    async fn best_share_between(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Option<Share>, Self::Error>;

    async fn insert_block(&self, block: Block) -> Result<(), Self::Error>;

    /// Most recent blocks first.
    async fn recent_blocks(&self, limit: usize) -> Result<Vec<Block>, Self::Error>;

    /// Delete snapshots taken before `cutoff`. Returns how many were removed.
    async fn purge_snapshots_before(&self, cutoff: Timestamp) -> Result<u64, Self::Error>;

    /// Delete shares found before `cutoff`. Returns how many were removed.
    async fn purge_shares_before(&self, cutoff: Timestamp) -> Result<u64, Self::Error>;
}
