use jiff::Timestamp;
use minerhq_core::{Block, BlockValue, Device, DeviceAddr, Hashrate, Share, Snapshot};
use minerhq_monitor::storage::memory::{MemoryStore, MemoryStoreError};
use minerhq_monitor::storage::sqlite::{SqliteStore, SqliteStoreError};
use minerhq_monitor::storage::Store;
use tempfile::NamedTempFile;

fn at(secs: i64) -> Timestamp {
    Timestamp::from_second(1_736_000_000 + secs).unwrap()
}

fn device(addr: &str) -> Device {
    let mut device = Device::new(DeviceAddr::from(addr));
    device.hostname = format!("miner-{addr}").into();
    device.model = "NerdQAxe++".into();
    device
}

fn snapshot(addr: &str, secs: i64) -> Snapshot {
    Snapshot {
        addr: DeviceAddr::from(addr),
        timestamp: at(secs),
        hostname: "nerd".into(),
        model: "NerdQAxe++".into(),
        hashrate: Hashrate {
            current: 580.0 + secs as f64,
            ..Default::default()
        },
        temp: 55.0,
        vr_temp: 50.0,
        power: 72.0,
        voltage: 5100.0,
        fan_rpm: 4200,
        fan_percent: 60,
        shares_accepted: 10,
        shares_rejected: 1,
        best_diff: 4.29e9,
        best_session_diff: 1.2e6,
        pool_difficulty: 2048.0,
        pool_connected: true,
        uptime_secs: 3600,
        wifi_rssi: -48,
        found_blocks: 0,
        total_found_blocks: 1,
    }
}

fn share(hostname: &str, difficulty: f64, secs: i64) -> Share {
    Share {
        addr: DeviceAddr::from("10.0.0.2"),
        hostname: hostname.into(),
        timestamp: at(secs),
        job_id: "1a2b".into(),
        asic: 2,
        difficulty,
    }
}

fn block(difficulty: f64, secs: i64) -> Block {
    Block {
        addr: DeviceAddr::from("10.0.0.2"),
        hostname: "nerd".into(),
        timestamp: at(secs),
        difficulty,
        network_difficulty: 100.0,
        value: BlockValue {
            asset_id: "dgb".into(),
            symbol: "DGB".into(),
            unit_reward: 274.28,
            unit_price: 0.01,
            value_usd: 2.7428,
        },
    }
}

async fn device_lifecycle<S: Store>(store: &S) -> Result<(), S::Error> {
    store.upsert_device(device("10.0.0.3")).await?;
    store.upsert_device(device("10.0.0.2")).await?;

    let active = store.list_active_devices().await?;
    let addrs: Vec<_> = active.iter().map(|d| d.addr.as_str()).collect();
    assert_eq!(addrs, ["10.0.0.2", "10.0.0.3"]);

    let addr = DeviceAddr::from("10.0.0.2");
    assert!(store.set_asset_override(&addr, Some("bc2")).await?);
    assert!(!store.set_asset_override(&DeviceAddr::from("10.9.9.9"), Some("bc2")).await?);

    // A poll refreshes identity without losing the override or last seen.
    let mut polled = device("10.0.0.2");
    polled.hostname = "renamed".into();
    polled.last_seen = Some(at(5));
    store.upsert_device(polled).await?;
    store.upsert_device(device("10.0.0.2")).await?;

    let stored = store.get_device(&addr).await?.unwrap();
    assert_eq!(&*stored.hostname, "miner-10.0.0.2");
    assert_eq!(stored.last_seen, Some(at(5)));
    assert_eq!(stored.asset_override.as_deref(), Some("bc2"));

    let overrides = store.devices_with_asset_override().await?;
    assert_eq!(overrides, vec![(addr.clone(), "bc2".into())]);

    assert!(store.deactivate_device(&addr).await?);
    assert!(!store.deactivate_device(&DeviceAddr::from("10.9.9.9")).await?);
    assert_eq!(store.list_active_devices().await?.len(), 1);
    assert!(!store.get_device(&addr).await?.unwrap().active);

    store.upsert_device(device("10.0.0.2")).await?;
    assert_eq!(store.list_active_devices().await?.len(), 2);

    assert!(store.set_asset_override(&addr, None).await?);
    assert!(store.devices_with_asset_override().await?.is_empty());

    // An empty override means the default asset in both backends.
    assert!(store.set_asset_override(&addr, Some("")).await?);
    assert!(store.devices_with_asset_override().await?.is_empty());

    Ok(())
}

async fn telemetry_history<S: Store>(store: &S) -> Result<(), S::Error> {
    let addr = DeviceAddr::from("10.0.0.2");

    store.insert_snapshot(snapshot("10.0.0.2", 0)).await?;
    store.insert_snapshot(snapshot("10.0.0.2", 10)).await?;
    store.insert_snapshot(snapshot("10.0.0.4", 20)).await?;

    let latest = store.latest_snapshot(&addr).await?.unwrap();
    assert_eq!(latest, snapshot("10.0.0.2", 10));
    assert!(store.latest_snapshot(&DeviceAddr::from("10.9.9.9")).await?.is_none());

    assert_eq!(store.purge_snapshots_before(at(10)).await?, 1);
    assert_eq!(store.latest_snapshot(&addr).await?.unwrap().timestamp, at(10));

    store.insert_share(share("alpha", 500.0, 0)).await?;
    store.insert_share(share("beta", 900.0, 50)).await?;
    store.insert_share(share("gamma", 5000.0, 100)).await?;

    let best = store.best_share_between(at(0), at(100)).await?.unwrap();
    assert_eq!(&*best.hostname, "beta");
    assert_eq!(&*best.job_id, "1a2b");
    assert_eq!(best.asic, 2);

    let best = store.best_share_between(at(0), at(101)).await?.unwrap();
    assert_eq!(&*best.hostname, "gamma");
    assert!(store.best_share_between(at(200), at(300)).await?.is_none());

    assert_eq!(store.purge_shares_before(at(50)).await?, 1);
    let best = store.best_share_between(at(0), at(50)).await?;
    assert!(best.is_none());

    store.insert_block(block(111.0, 0)).await?;
    store.insert_block(block(222.0, 1)).await?;
    store.insert_block(block(333.0, 2)).await?;

    let recent = store.recent_blocks(2).await?;
    let difficulties: Vec<f64> = recent.iter().map(|b| b.difficulty).collect();
    assert_eq!(difficulties, vec![333.0, 222.0]);
    assert_eq!(recent[0], block(333.0, 2));

    Ok(())
}

#[tokio::test]
async fn memory_device_lifecycle() -> Result<(), MemoryStoreError> {
    device_lifecycle(&MemoryStore::default()).await
}

#[tokio::test]
async fn memory_telemetry_history() -> Result<(), MemoryStoreError> {
    telemetry_history(&MemoryStore::default()).await
}

#[tokio::test]
async fn sqlite_device_lifecycle() -> Result<(), SqliteStoreError> {
    let temp_file = NamedTempFile::new().unwrap();
    let store = SqliteStore::new(temp_file.path().to_string_lossy()).await?;
    device_lifecycle(&store).await
}

#[tokio::test]
async fn sqlite_telemetry_history() -> Result<(), SqliteStoreError> {
    let store = SqliteStore::new_in_memory().await?;
    telemetry_history(&store).await
}

#[tokio::test]
async fn sqlite_persistence_across_instances() -> Result<(), SqliteStoreError> {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_string_lossy().to_string();

    {
        let store = SqliteStore::new(&path).await?;
        store.upsert_device(device("10.0.0.2")).await?;
        store.insert_block(block(111.0, 0)).await?;
    }

    let store = SqliteStore::new(&path).await?;
    assert_eq!(store.list_active_devices().await?.len(), 1);
    assert_eq!(store.recent_blocks(10).await?, vec![block(111.0, 0)]);

    Ok(())
}
