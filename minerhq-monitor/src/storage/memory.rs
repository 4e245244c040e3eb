use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use jiff::Timestamp;
use minerhq_core::{Block, Device, DeviceAddr, Share, Snapshot};
use ordered_float::OrderedFloat;

use crate::storage::Store;

/// In-memory storage implementation.
/// Used by tests and for runs that don't need history across restarts.
#[derive(Clone, Default)]
pub struct MemoryStore {
    devices: Arc<Mutex<HashMap<DeviceAddr, Device>>>,
    snapshots: Arc<Mutex<Vec<Snapshot>>>,
    shares: Arc<Mutex<Vec<Share>>>,
    blocks: Arc<Mutex<Vec<Block>>>,
}

/// Error type for MemoryStore
#[derive(Debug)]
pub enum MemoryStoreError {
    MutexPoisoned(String),
}

impl std::error::Error for MemoryStoreError {}

impl fmt::Display for MemoryStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryStoreError::MutexPoisoned(msg) => write!(f, "Mutex poisoned: {}", msg),
        }
    }
}

impl<T> From<PoisonError<T>> for MemoryStoreError {
    fn from(err: PoisonError<T>) -> Self {
        MemoryStoreError::MutexPoisoned(err.to_string())
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Error = MemoryStoreError;

    async fn upsert_device(&self, device: Device) -> Result<(), Self::Error> {
        let mut map = self.devices.lock()?;

        match map.get_mut(&device.addr) {
            Some(existing) => {
                existing.hostname = device.hostname;
                existing.model = device.model;
                existing.asic_model = device.asic_model;
                existing.active = device.active;
                if device.last_seen.is_some() {
                    existing.last_seen = device.last_seen;
                }
                if device.asset_override.is_some() {
                    existing.asset_override = device.asset_override;
                }
            }
            None => {
                map.insert(device.addr.clone(), device);
            }
        }

        Ok(())
    }

    async fn get_device(&self, addr: &DeviceAddr) -> Result<Option<Device>, Self::Error> {
        let map = self.devices.lock()?;
        Ok(map.get(addr).cloned())
    }

    async fn list_active_devices(&self) -> Result<Vec<Device>, Self::Error> {
        let map = self.devices.lock()?;

        let mut devices: Vec<_> = map.values().filter(|d| d.active).cloned().collect();
        devices.sort_by(|a, b| a.addr.cmp(&b.addr));

        Ok(devices)
    }

    async fn deactivate_device(&self, addr: &DeviceAddr) -> Result<bool, Self::Error> {
        let mut map = self.devices.lock()?;

        Ok(match map.get_mut(addr) {
            Some(device) => {
                device.active = false;
                true
            }
            None => false,
        })
    }

    async fn set_asset_override(
        &self,
        addr: &DeviceAddr,
        asset: Option<&str>,
    ) -> Result<bool, Self::Error> {
        let mut map = self.devices.lock()?;

        Ok(match map.get_mut(addr) {
            Some(device) => {
                device.asset_override = asset.map(Into::into);
                true
            }
            None => false,
        })
    }

    async fn devices_with_asset_override(&self) -> Result<Vec<(DeviceAddr, Box<str>)>, Self::Error> {
        let map = self.devices.lock()?;

        Ok(map
            .values()
            .filter_map(|d| Some((d.addr.clone(), d.asset_override.clone()?)))
            .filter(|(_, asset)| !asset.is_empty())
            .collect())
    }

    async fn insert_snapshot(&self, snapshot: Snapshot) -> Result<(), Self::Error> {
        self.snapshots.lock()?.push(snapshot);
        Ok(())
    }

    async fn latest_snapshot(&self, addr: &DeviceAddr) -> Result<Option<Snapshot>, Self::Error> {
        let snapshots = self.snapshots.lock()?;

        Ok(snapshots
            .iter()
            .filter(|s| &s.addr == addr)
            .max_by_key(|s| s.timestamp)
            .cloned())
    }

    async fn insert_share(&self, share: Share) -> Result<(), Self::Error> {
        self.shares.lock()?.push(share);
        Ok(())
    }

    async fn best_share_between(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Option<Share>, Self::Error> {
        let shares = self.shares.lock()?;

        Ok(shares
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp < end)
            .max_by_key(|s| OrderedFloat(s.difficulty))
            .cloned())
    }

    async fn insert_block(&self, block: Block) -> Result<(), Self::Error> {
        self.blocks.lock()?.push(block);
        Ok(())
    }

    async fn recent_blocks(&self, limit: usize) -> Result<Vec<Block>, Self::Error> {
        let blocks = self.blocks.lock()?;
        Ok(blocks.iter().rev().take(limit).cloned().collect())
    }

    async fn purge_snapshots_before(&self, cutoff: Timestamp) -> Result<u64, Self::Error> {
        let mut snapshots = self.snapshots.lock()?;

        let before = snapshots.len();
        snapshots.retain(|s| s.timestamp >= cutoff);

        Ok((before - snapshots.len()) as u64)
    }

    async fn purge_shares_before(&self, cutoff: Timestamp) -> Result<u64, Self::Error> {
        let mut shares = self.shares.lock()?;

        let before = shares.len();
        shares.retain(|s| s.timestamp >= cutoff);

        Ok((before - shares.len()) as u64)
    }
}
