//! Wires device sessions to the hub and the alert evaluator.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use jiff::{SignedDuration, Timestamp};
use minerhq_core::{Device, DeviceAddr, Event};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::alerts::{AlertError, AlertEvaluator};
use crate::config::{Config, RetentionConfig};
use crate::device::{DeviceClient, DeviceError};
use crate::hub::{Hub, HubHandle};
use crate::pricing::{Pricing, asset_spec};
use crate::session::{
    DropCounters, EventReceivers, SessionContext, SessionId, SessionRegistry, SessionStatus,
    event_channels,
};
use crate::storage::Store;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("storage error: {0}")]
    Store(Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Alert(#[from] AlertError),

    #[error("invalid device address {0:?}")]
    InvalidAddr(String),

    #[error("unsupported asset {0:?}")]
    UnknownAsset(String),
}

impl MonitorError {
    fn store<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        MonitorError::Store(Box::new(error))
    }
}

/// Tells the forwarding loop that a device was removed. Snapshots still
/// queued from `session` are published but no longer evaluated.
struct Retire {
    addr: DeviceAddr,
    session: Option<SessionId>,
    done: oneshot::Sender<()>,
}

/// A monitored device together with its live session status.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    #[serde(flatten)]
    pub device: Device,
    pub online: bool,
    pub streaming: bool,
}

/// Owns the whole pipeline: sessions, hub, evaluator and the background
/// loops between them.
pub struct Orchestrator<S: Store> {
    store: S,
    registry: SessionRegistry<S>,
    hub: HubHandle,
    evaluator: Arc<AlertEvaluator>,
    retire: mpsc::UnboundedSender<Retire>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Store> Orchestrator<S> {
    /// Builds the pipeline and starts a session for every active device.
    pub async fn start(
        config: Config,
        store: S,
        pricing: Arc<dyn Pricing>,
    ) -> Result<Self, MonitorError> {
        for addr in &config.devices {
            let addr = parse_addr(addr)?;
            let known = store.get_device(&addr).await.map_err(MonitorError::store)?;
            if known.is_none() {
                store
                    .upsert_device(Device::new(addr))
                    .await
                    .map_err(MonitorError::store)?;
            }
        }

        let cancel = CancellationToken::new();
        let (senders, receivers) = event_channels(&config.collector);
        let (retire, retired) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            store: store.clone(),
            client: DeviceClient::new(config.collector.request_timeout())?,
            pricing,
            senders,
            config: config.collector.clone(),
            default_asset: config.pricing.default_asset.as_str().into(),
            drops: Arc::new(DropCounters::default()),
        };
        let registry = SessionRegistry::new(ctx);

        let (hub, handle) = Hub::new(&config.hub);
        let evaluator = Arc::new(AlertEvaluator::new(config.alerts.clone())?);

        seed_weekly_leader(&store, &evaluator).await;

        let devices = store
            .list_active_devices()
            .await
            .map_err(MonitorError::store)?;

        let tasks = vec![
            tokio::spawn(hub.run(cancel.clone())),
            tokio::spawn(forward_events(
                receivers,
                retired,
                handle.clone(),
                Arc::clone(&evaluator),
                cancel.clone(),
            )),
            tokio::spawn(maintain(
                store.clone(),
                Arc::clone(&evaluator),
                config.retention.clone(),
                cancel.clone(),
            )),
        ];

        info!(count = devices.len(), "Starting device sessions");
        registry.start(devices).await;

        Ok(Self {
            store,
            registry,
            hub: handle,
            evaluator,
            retire,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn evaluator(&self) -> &AlertEvaluator {
        &self.evaluator
    }

    pub fn drops(&self) -> &DropCounters {
        self.registry.drops()
    }

    /// Registers a device and starts monitoring it.
    /// Returns `false` if it was already being monitored.
    pub async fn add_device(&self, addr: &str) -> Result<bool, MonitorError> {
        let addr = parse_addr(addr)?;

        let device = match self
            .store
            .get_device(&addr)
            .await
            .map_err(MonitorError::store)?
        {
            Some(mut known) => {
                known.active = true;
                known
            }
            None => Device::new(addr.clone()),
        };
        self.store
            .upsert_device(device)
            .await
            .map_err(MonitorError::store)?;

        Ok(self.registry.add(addr).await)
    }

    /// Stops monitoring a device and marks it inactive. The session is fully
    /// stopped when this returns. Returns `false` if the device was unknown.
    pub async fn remove_device(&self, addr: &str) -> Result<bool, MonitorError> {
        let addr = parse_addr(addr)?;

        let session = self.registry.remove(&addr).await;
        retire_session(&self.retire, &self.evaluator, addr.clone(), session).await;

        let deactivated = self
            .store
            .deactivate_device(&addr)
            .await
            .map_err(MonitorError::store)?;

        Ok(session.is_some() || deactivated)
    }

    /// Pins the asset a device mines, or returns it to the default with `None`.
    pub async fn set_device_asset(
        &self,
        addr: &str,
        asset: Option<&str>,
    ) -> Result<bool, MonitorError> {
        let addr = parse_addr(addr)?;
        if let Some(asset) = asset
            && asset_spec(asset).is_none()
        {
            return Err(MonitorError::UnknownAsset(asset.to_owned()));
        }

        self.store
            .set_asset_override(&addr, asset)
            .await
            .map_err(MonitorError::store)
    }

    /// Active devices with their derived online status.
    pub async fn device_status(&self) -> Result<Vec<DeviceStatus>, MonitorError> {
        let devices = self
            .store
            .list_active_devices()
            .await
            .map_err(MonitorError::store)?;
        let sessions: HashMap<DeviceAddr, SessionStatus> = self.registry.status().await;

        Ok(devices
            .into_iter()
            .map(|device| {
                let status = sessions.get(&device.addr).copied();
                DeviceStatus {
                    online: status.is_some_and(|s| s.online),
                    streaming: status.is_some_and(|s| s.streaming),
                    device,
                }
            })
            .collect())
    }

    pub async fn session_status(&self) -> HashMap<DeviceAddr, SessionStatus> {
        self.registry.status().await
    }

    /// Stops every session, then the hub and the background loops.
    pub async fn shutdown(&self) {
        info!("Stopping device sessions");
        self.registry.stop_all().await;

        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = ?e, "Background task ended abnormally");
            }
        }

        info!(dropped = self.drops().total(), "Pipeline stopped");
    }
}

fn parse_addr(addr: &str) -> Result<DeviceAddr, MonitorError> {
    let trimmed = addr.trim();
    if trimmed.is_empty() || trimmed.contains(char::is_whitespace) || trimmed.contains('/') {
        return Err(MonitorError::InvalidAddr(addr.to_owned()));
    }
    Ok(DeviceAddr::from(trimmed))
}

/// Loads this week's best share so a restart doesn't look like a leader change.
async fn seed_weekly_leader<S: Store>(store: &S, evaluator: &AlertEvaluator) {
    let now = Timestamp::now();
    let week_start = evaluator.week_start(now);

    match store.best_share_between(week_start, now).await {
        Ok(Some(share)) => evaluator.seed_weekly_leader(&share.hostname, share.difficulty, now),
        Ok(None) => evaluator.seed_weekly_leader("", 0.0, now),
        Err(e) => {
            warn!(error = ?e, "Failed to load weekly best share");
            evaluator.seed_weekly_leader("", 0.0, now);
        }
    }
}

/// Clears the evaluator's memory of a removed device. Goes through the
/// forwarding loop so a snapshot it already holds cannot be evaluated after
/// the reset.
async fn retire_session(
    tx: &mpsc::UnboundedSender<Retire>,
    evaluator: &AlertEvaluator,
    addr: DeviceAddr,
    session: Option<SessionId>,
) {
    let (done, ack) = oneshot::channel();
    let request = Retire {
        addr: addr.clone(),
        session,
        done,
    };

    if tx.send(request).is_err() || ack.await.is_err() {
        // Forwarding has stopped, nothing else can touch the evaluator.
        evaluator.forget_device(&addr);
    }
}

#[instrument(name = "forward_events", skip_all)]
async fn forward_events(
    mut receivers: EventReceivers,
    mut retire: mpsc::UnboundedReceiver<Retire>,
    hub: HubHandle,
    evaluator: Arc<AlertEvaluator>,
    cancel: CancellationToken,
) {
    let mut retired = HashSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(request) = retire.recv() => {
                if let Some(session) = request.session {
                    retired.insert(session);
                }
                evaluator.forget_device(&request.addr);
                debug!(device = %request.addr, "Evaluator state cleared");
                let _ = request.done.send(());
            }
            Some((session, snapshot)) = receivers.snapshots.recv() => {
                if !retired.contains(&session) {
                    evaluator.check_snapshot(&snapshot);
                }
                hub.publish(Event::Snapshot(snapshot));
            }
            Some(share) = receivers.shares.recv() => {
                evaluator.check_share(&share);
                hub.publish(Event::Share(share));
            }
            Some(block) = receivers.blocks.recv() => {
                evaluator.check_block(&block);
                hub.publish(Event::Block(block));
            }
            else => break,
        }
    }

    debug!("Event forwarding stopped");
}

/// Periodic offline sweep and history purge.
#[instrument(name = "maintenance", skip_all)]
async fn maintain<S: Store>(
    store: S,
    evaluator: Arc<AlertEvaluator>,
    retention: RetentionConfig,
    cancel: CancellationToken,
) {
    let mut offline = tokio::time::interval(Duration::from_secs(
        retention.offline_check_interval_secs.max(1),
    ));
    offline.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut purge = tokio::time::interval(Duration::from_secs(retention.purge_interval_secs.max(1)));
    purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = offline.tick() => {
                match store.list_active_devices().await {
                    Ok(devices) => {
                        evaluator.check_offline(&devices, Timestamp::now());
                    }
                    Err(e) => error!(error = ?e, "Failed to list devices for offline check"),
                }
            }
            _ = purge.tick() => purge_history(&store, &retention).await,
        }
    }

    debug!("Maintenance stopped");
}

async fn purge_history<S: Store>(store: &S, retention: &RetentionConfig) {
    let now = Timestamp::now();

    let snapshot_cutoff = now.checked_sub(SignedDuration::from_secs(
        retention.snapshot_max_age_secs as i64,
    ));
    match snapshot_cutoff {
        Ok(cutoff) => match store.purge_snapshots_before(cutoff).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Purged old snapshots"),
            Err(e) => error!(error = ?e, "Failed to purge snapshots"),
        },
        Err(e) => warn!(error = %e, "Invalid snapshot retention"),
    }

    let share_cutoff = now.checked_sub(SignedDuration::from_secs(
        retention.share_max_age_secs as i64,
    ));
    match share_cutoff {
        Ok(cutoff) => match store.purge_shares_before(cutoff).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Purged old shares"),
            Err(e) => error!(error = ?e, "Failed to purge shares"),
        },
        Err(e) => warn!(error = %e, "Invalid share retention"),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use minerhq_core::{AssetInfo, Share, Snapshot};

    use super::*;
    use crate::config::PricingConfig;
    use crate::pricing::PriceService;
    use crate::storage::memory::MemoryStore;

    struct NoPricing;

    #[async_trait]
    impl Pricing for NoPricing {
        async fn asset_info(&self, _asset_id: &str) -> Option<AssetInfo> {
            None
        }

        async fn unit_price(&self, _asset_id: &str) -> Option<f64> {
            None
        }
    }

    fn snapshot(addr: &str, at: Timestamp, hashrate: f64) -> Snapshot {
        serde_json::from_value(serde_json::json!({
            "addr": addr,
            "timestamp": at,
            "hostname": "alpha",
            "model": "",
            "hashrate": { "current": hashrate, "avg_1m": 0.0, "avg_10m": 0.0, "avg_1h": 0.0, "avg_1d": 0.0 },
            "temp": 0.0, "vr_temp": 0.0, "power": 0.0, "voltage": 0.0,
            "fan_rpm": 0, "fan_percent": 0,
            "shares_accepted": 0, "shares_rejected": 0,
            "best_diff": 0.0, "best_session_diff": 0.0, "pool_difficulty": 0.0,
            "pool_connected": true, "uptime_secs": 0, "wifi_rssi": 0,
            "found_blocks": 0, "total_found_blocks": 0
        }))
        .unwrap()
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.pricing = PricingConfig {
            enabled: false,
            ..Default::default()
        };
        config
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(parse_addr("192.168.1.23").is_ok());
        assert_eq!(parse_addr(" nerd.local:80 ").unwrap().as_str(), "nerd.local:80");
        assert!(parse_addr("").is_err());
        assert!(parse_addr("10.0.0.1 10.0.0.2").is_err());
        assert!(parse_addr("http://10.0.0.1").is_err());
    }

    #[tokio::test]
    async fn configured_devices_are_registered() {
        let store = MemoryStore::default();
        let mut config = config();
        config.devices = vec!["127.0.0.1:9".to_owned()];

        let orchestrator = Orchestrator::start(config, store.clone(), Arc::new(NoPricing))
            .await
            .unwrap();

        let status = orchestrator.device_status().await.unwrap();
        assert_eq!(status.len(), 1);
        assert!(!status[0].online);
        assert!(orchestrator.session_status().await.contains_key(&DeviceAddr::from("127.0.0.1:9")));

        orchestrator.shutdown().await;
        assert!(orchestrator.session_status().await.is_empty());
    }

    #[tokio::test]
    async fn remove_deactivates_and_add_reactivates() {
        let store = MemoryStore::default();
        let orchestrator = Orchestrator::start(config(), store.clone(), Arc::new(NoPricing))
            .await
            .unwrap();

        assert!(orchestrator.add_device("127.0.0.1:9").await.unwrap());
        assert!(!orchestrator.add_device("127.0.0.1:9").await.unwrap());

        assert!(orchestrator.remove_device("127.0.0.1:9").await.unwrap());
        assert!(store.list_active_devices().await.unwrap().is_empty());
        assert!(
            store
                .get_device(&DeviceAddr::from("127.0.0.1:9"))
                .await
                .unwrap()
                .is_some()
        );
        assert!(!orchestrator.remove_device("10.9.9.9").await.unwrap());

        assert!(orchestrator.add_device("127.0.0.1:9").await.unwrap());
        assert_eq!(store.list_active_devices().await.unwrap().len(), 1);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn readding_keeps_known_device_details() {
        let store = MemoryStore::default();
        let addr = DeviceAddr::from("127.0.0.1:9");
        let mut known = Device::new(addr.clone());
        known.hostname = "nerd-1".into();
        known.model = "NerdQAxe++".into();
        store.upsert_device(known).await.unwrap();

        let orchestrator = Orchestrator::start(config(), store.clone(), Arc::new(NoPricing))
            .await
            .unwrap();
        assert!(orchestrator.remove_device("127.0.0.1:9").await.unwrap());
        assert!(orchestrator.add_device("127.0.0.1:9").await.unwrap());

        let device = store.get_device(&addr).await.unwrap().unwrap();
        assert!(device.active);
        assert_eq!(&*device.hostname, "nerd-1");
        assert_eq!(&*device.model, "NerdQAxe++");

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn asset_override_must_be_supported() {
        let store = MemoryStore::default();
        let orchestrator = Orchestrator::start(config(), store.clone(), Arc::new(NoPricing))
            .await
            .unwrap();
        orchestrator.add_device("127.0.0.1:9").await.unwrap();

        assert!(
            orchestrator
                .set_device_asset("127.0.0.1:9", Some("bc2"))
                .await
                .unwrap()
        );
        assert!(matches!(
            orchestrator.set_device_asset("127.0.0.1:9", Some("doge")).await,
            Err(MonitorError::UnknownAsset(_))
        ));

        let overrides = store.devices_with_asset_override().await.unwrap();
        assert_eq!(overrides.len(), 1);
        assert_eq!(&*overrides[0].1, "bc2");

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn leader_is_seeded_from_history() {
        let store = MemoryStore::default();
        store
            .insert_share(Share {
                addr: DeviceAddr::from("10.0.0.2"),
                hostname: "alpha".into(),
                timestamp: Timestamp::now(),
                job_id: "1".into(),
                asic: 0,
                difficulty: 5000.0,
            })
            .await
            .unwrap();
        // A tiny sleep keeps the share strictly before the seeding instant.
        tokio::time::sleep(Duration::from_millis(5)).await;

        let orchestrator = Orchestrator::start(config(), store, Arc::new(NoPricing))
            .await
            .unwrap();

        assert_eq!(
            orchestrator.evaluator().weekly_leader(),
            Some(("alpha".into(), 5000.0))
        );

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn forwarded_events_reach_subscribers() {
        let config = config();
        let (senders, receivers) = event_channels(&config.collector);
        let (hub, handle) = Hub::new(&config.hub);
        let evaluator = Arc::new(AlertEvaluator::new(config.alerts.clone()).unwrap());
        let cancel = CancellationToken::new();

        tokio::spawn(hub.run(cancel.clone()));
        let mut sub = handle.subscribe().await.unwrap();
        let (_retire, retired) = mpsc::unbounded_channel();
        tokio::spawn(forward_events(
            receivers,
            retired,
            handle.clone(),
            Arc::clone(&evaluator),
            cancel.clone(),
        ));

        let share = Share {
            addr: DeviceAddr::from("10.0.0.2"),
            hostname: "alpha".into(),
            timestamp: Timestamp::now(),
            job_id: "7".into(),
            asic: 1,
            difficulty: 123.0,
        };
        senders.shares.send(share).await.unwrap();

        let message = sub.rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(value["type"], "share");
        assert_eq!(value["data"]["job_id"], "7");
        assert_eq!(evaluator.weekly_leader(), Some(("alpha".into(), 123.0)));

        cancel.cancel();
    }

    #[tokio::test]
    async fn removed_session_snapshots_are_not_evaluated() {
        let config = config();
        let (senders, receivers) = event_channels(&config.collector);
        let (hub, handle) = Hub::new(&config.hub);
        let evaluator = Arc::new(AlertEvaluator::new(config.alerts.clone()).unwrap());
        let cancel = CancellationToken::new();
        let (retire, retired) = mpsc::unbounded_channel();
        let addr = DeviceAddr::from("10.0.0.2");
        let old = SessionId(ulid::Ulid::new());

        tokio::spawn(hub.run(cancel.clone()));
        let mut sub = handle.subscribe().await.unwrap();

        // One snapshot is already queued when the device is removed.
        senders
            .snapshots
            .send((old, snapshot("10.0.0.2", Timestamp::now(), 580.0)))
            .await
            .unwrap();
        tokio::spawn(forward_events(
            receivers,
            retired,
            handle.clone(),
            Arc::clone(&evaluator),
            cancel.clone(),
        ));

        retire_session(&retire, &evaluator, addr.clone(), Some(old)).await;
        senders
            .snapshots
            .send((old, snapshot("10.0.0.2", Timestamp::now(), 580.0)))
            .await
            .unwrap();

        // Both leftovers are still published.
        for _ in 0..2 {
            let message = sub.rx.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&message).unwrap();
            assert_eq!(value["type"], "snapshot");
        }

        // A re-added device starts without a previous hashrate to compare to.
        let fresh = snapshot("10.0.0.2", Timestamp::now(), 300.0);
        assert!(evaluator.check_snapshot(&fresh).is_empty());

        cancel.cancel();
    }

    #[tokio::test]
    async fn purge_removes_old_history() {
        let store = MemoryStore::default();
        let old = Timestamp::now()
            .checked_sub(SignedDuration::from_hours(2))
            .unwrap();

        let mut snapshot = snapshot("10.0.0.2", old, 1.0);
        store.insert_snapshot(snapshot.clone()).await.unwrap();
        snapshot.timestamp = Timestamp::now();
        store.insert_snapshot(snapshot).await.unwrap();

        purge_history(&store, &RetentionConfig::default()).await;

        let latest = store
            .latest_snapshot(&DeviceAddr::from("10.0.0.2"))
            .await
            .unwrap()
            .unwrap();
        assert!(latest.timestamp > old);
        let just_after_old = old.checked_add(SignedDuration::from_secs(1)).unwrap();
        assert_eq!(store.purge_snapshots_before(just_after_old).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn price_service_plugs_in() {
        let pricing = PriceService::new(PricingConfig {
            enabled: false,
            ..Default::default()
        })
        .unwrap();
        let orchestrator = Orchestrator::start(config(), MemoryStore::default(), Arc::new(pricing))
            .await
            .unwrap();
        orchestrator.shutdown().await;
    }
}
