//! Per-device polling and log streaming, and the registry that owns them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use jiff::Timestamp;
use minerhq_core::{Block, BlockValue, Device, DeviceAddr, Event, Share, Snapshot, parse_line};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use ulid::Ulid;

use crate::config::CollectorConfig;
use crate::device::{DeviceClient, DeviceError, DeviceStream};
use crate::pricing::Pricing;
use crate::storage::Store;

/// Identifies one incarnation of a device session. A device that is removed
/// and added again gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Ulid);

/// Counts events dropped because a pipeline channel was full.
#[derive(Debug, Default)]
pub struct DropCounters {
    pub snapshots: AtomicU64,
    pub shares: AtomicU64,
    pub blocks: AtomicU64,
}

impl DropCounters {
    pub fn total(&self) -> u64 {
        self.snapshots.load(Ordering::Relaxed)
            + self.shares.load(Ordering::Relaxed)
            + self.blocks.load(Ordering::Relaxed)
    }
}

/// A polled snapshot tagged with the session that produced it, so consumers
/// can tell a removed session's leftovers from a re-added device's data.
pub type SessionSnapshot = (SessionId, Snapshot);

/// Producer side of the session output channels.
#[derive(Clone)]
pub struct EventSenders {
    pub snapshots: mpsc::Sender<SessionSnapshot>,
    pub shares: mpsc::Sender<Share>,
    pub blocks: mpsc::Sender<Block>,
}

pub struct EventReceivers {
    pub snapshots: mpsc::Receiver<SessionSnapshot>,
    pub shares: mpsc::Receiver<Share>,
    pub blocks: mpsc::Receiver<Block>,
}

pub fn event_channels(config: &CollectorConfig) -> (EventSenders, EventReceivers) {
    let (snapshots_tx, snapshots_rx) = mpsc::channel(config.snapshot_capacity.max(1));
    let (shares_tx, shares_rx) = mpsc::channel(config.share_capacity.max(1));
    let (blocks_tx, blocks_rx) = mpsc::channel(config.block_capacity.max(1));

    (
        EventSenders {
            snapshots: snapshots_tx,
            shares: shares_tx,
            blocks: blocks_tx,
        },
        EventReceivers {
            snapshots: snapshots_rx,
            shares: shares_rx,
            blocks: blocks_rx,
        },
    )
}

/// Everything a device session needs besides its own address.
pub struct SessionContext<S: Store> {
    pub store: S,
    pub client: DeviceClient,
    pub pricing: Arc<dyn Pricing>,
    pub senders: EventSenders,
    pub config: CollectorConfig,
    /// Asset credited for blocks from devices without an override.
    pub default_asset: Arc<str>,
    pub drops: Arc<DropCounters>,
}

impl<S: Store> Clone for SessionContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            client: self.client.clone(),
            pricing: Arc::clone(&self.pricing),
            senders: self.senders.clone(),
            config: self.config.clone(),
            default_asset: Arc::clone(&self.default_asset),
            drops: Arc::clone(&self.drops),
        }
    }
}

struct SessionState {
    id: SessionId,
    last_contact: Option<Instant>,
    streaming: bool,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

type Sessions = Arc<RwLock<HashMap<DeviceAddr, SessionState>>>;

/// Derived view of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub online: bool,
    pub streaming: bool,
}

/// Active device sessions keyed by address.
///
/// All state changes happen under one lock, and no I/O is done while it is
/// held.
pub struct SessionRegistry<S: Store> {
    sessions: Sessions,
    ctx: SessionContext<S>,
}

impl<S: Store> Clone for SessionRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
            ctx: self.ctx.clone(),
        }
    }
}

impl<S: Store> SessionRegistry<S> {
    pub fn new(ctx: SessionContext<S>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ctx,
        }
    }

    /// Starts monitoring `addr`. Returns `false` if a session already exists.
    pub async fn add(&self, addr: DeviceAddr) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&addr) {
            return false;
        }

        let id = SessionId(Ulid::new());
        let cancel = CancellationToken::new();

        let poll = tokio::spawn(poll_loop(
            self.ctx.clone(),
            Arc::clone(&self.sessions),
            id,
            addr.clone(),
            cancel.clone(),
        ));
        let stream = tokio::spawn(stream_loop(
            self.ctx.clone(),
            Arc::clone(&self.sessions),
            id,
            addr.clone(),
            cancel.clone(),
        ));

        sessions.insert(
            addr.clone(),
            SessionState {
                id,
                last_contact: None,
                streaming: false,
                cancel,
                tasks: vec![poll, stream],
            },
        );

        info!(device = %addr, "Device session started");
        true
    }

    /// Stops monitoring `addr` and waits for both loops to exit.
    /// Returns the id of the stopped session, or `None` if there was none.
    pub async fn remove(&self, addr: &DeviceAddr) -> Option<SessionId> {
        let state = {
            let mut sessions = self.sessions.write().await;
            let state = sessions.remove(addr);
            if let Some(state) = &state {
                state.cancel.cancel();
            }
            state
        };

        let state = state?;

        for task in state.tasks {
            if let Err(e) = task.await {
                error!(device = %addr, error = ?e, "Device task ended abnormally");
            }
        }

        info!(device = %addr, "Device session stopped");
        Some(state.id)
    }

    /// Starts a session for every active device.
    pub async fn start(&self, devices: impl IntoIterator<Item = Device>) {
        for device in devices {
            if device.active {
                self.add(device.addr).await;
            }
        }
    }

    pub async fn stop_all(&self) {
        let addrs: Vec<DeviceAddr> = self.sessions.read().await.keys().cloned().collect();
        for addr in addrs {
            self.remove(&addr).await;
        }
    }

    /// Online status of every session, recomputed against the clock.
    pub async fn status(&self) -> HashMap<DeviceAddr, SessionStatus> {
        let window = self.ctx.config.online_window();
        let sessions = self.sessions.read().await;

        sessions
            .iter()
            .map(|(addr, state)| {
                let online = state.last_contact.is_some_and(|t| t.elapsed() < window);
                (
                    addr.clone(),
                    SessionStatus {
                        online,
                        streaming: state.streaming,
                    },
                )
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn drops(&self) -> &DropCounters {
        &self.ctx.drops
    }
}

/// Applies `f` to the session only if it is still the same incarnation.
async fn update_session(
    sessions: &Sessions,
    addr: &DeviceAddr,
    id: SessionId,
    f: impl FnOnce(&mut SessionState),
) {
    let mut sessions = sessions.write().await;
    if let Some(state) = sessions.get_mut(addr)
        && state.id == id
    {
        f(state);
    }
}

/// Non-blocking hand-off; the newest event is dropped when the channel is full.
fn offer<T>(tx: &mpsc::Sender<T>, item: T, dropped: &AtomicU64, kind: &'static str) {
    match tx.try_send(item) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            dropped.fetch_add(1, Ordering::Relaxed);
            debug!(kind, "Event channel full, dropping event");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(kind, "Event channel closed, dropping event");
        }
    }
}

#[instrument(name = "poll_loop", skip_all, fields(device = %addr))]
async fn poll_loop<S: Store>(
    ctx: SessionContext<S>,
    sessions: Sessions,
    id: SessionId,
    addr: DeviceAddr,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(ctx.config.poll_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let info = tokio::select! {
            _ = cancel.cancelled() => break,
            info = ctx.client.fetch_info(&addr) => info,
        };

        let info = match info {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "Failed to poll device");
                continue;
            }
        };

        let now = Timestamp::now();

        if let Err(e) = ctx.store.upsert_device(info.to_device(&addr, now)).await {
            error!(error = ?e, "Failed to store device");
        }

        let snapshot = info.to_snapshot(&addr, now);
        if let Err(e) = ctx.store.insert_snapshot(snapshot.clone()).await {
            error!(error = ?e, "Failed to store snapshot");
        }

        update_session(&sessions, &addr, id, |s| s.last_contact = Some(Instant::now())).await;

        offer(
            &ctx.senders.snapshots,
            (id, snapshot),
            &ctx.drops.snapshots,
            "snapshot",
        );
    }

    debug!("Poll loop stopped");
}

#[instrument(name = "stream_loop", skip_all, fields(device = %addr))]
async fn stream_loop<S: Store>(
    ctx: SessionContext<S>,
    sessions: Sessions,
    id: SessionId,
    addr: DeviceAddr,
    cancel: CancellationToken,
) {
    let backoff = ctx.config.reconnect_backoff();

    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            connected = ctx.client.connect_stream(&addr) => connected,
        };

        match connected {
            Ok(stream) => {
                info!("Connected to device log stream");
                update_session(&sessions, &addr, id, |s| s.streaming = true).await;

                let hostname = resolve_hostname(&ctx.store, &addr).await;
                let result = read_stream(&ctx, &addr, &hostname, stream, &cancel).await;

                update_session(&sessions, &addr, id, |s| s.streaming = false).await;

                match result {
                    Ok(()) if cancel.is_cancelled() => break,
                    Ok(()) => info!("Device closed log stream"),
                    Err(e) => warn!(error = %e, "Log stream failed"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to connect to device log stream");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }

    debug!("Stream loop stopped");
}

async fn resolve_hostname<S: Store>(store: &S, addr: &DeviceAddr) -> Box<str> {
    match store.get_device(addr).await {
        Ok(Some(device)) if !device.hostname.is_empty() => device.hostname,
        Ok(_) => addr.0.clone(),
        Err(e) => {
            warn!(error = ?e, "Failed to look up device name");
            addr.0.clone()
        }
    }
}

/// Reads until the device closes, the connection fails or `cancel` fires.
async fn read_stream<S: Store>(
    ctx: &SessionContext<S>,
    addr: &DeviceAddr,
    hostname: &str,
    mut stream: DeviceStream,
    cancel: &CancellationToken,
) -> Result<(), DeviceError> {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = stream.close(None).await;
                return Ok(());
            }
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => handle_text(ctx, addr, hostname, text.as_str()).await,
            Some(Ok(Message::Binary(bytes))) => {
                if let Ok(text) = std::str::from_utf8(&bytes) {
                    handle_text(ctx, addr, hostname, text).await;
                }
            }
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn handle_text<S: Store>(
    ctx: &SessionContext<S>,
    addr: &DeviceAddr,
    hostname: &str,
    text: &str,
) {
    for line in text.lines() {
        match parse_line(addr, line) {
            Some(Event::Share(mut share)) => {
                share.hostname = hostname.into();

                if let Err(e) = ctx.store.insert_share(share.clone()).await {
                    error!(error = ?e, "Failed to store share");
                }
                offer(&ctx.senders.shares, share, &ctx.drops.shares, "share");
            }
            Some(Event::Block(mut block)) => {
                block.hostname = hostname.into();
                block.value = block_value(ctx, addr).await;

                info!(
                    hostname,
                    difficulty = block.difficulty,
                    network_difficulty = block.network_difficulty,
                    asset = %block.value.asset_id,
                    value_usd = block.value.value_usd,
                    "BLOCK FOUND"
                );

                if let Err(e) = ctx.store.insert_block(block.clone()).await {
                    error!(error = ?e, "Failed to store block");
                }
                offer(&ctx.senders.blocks, block, &ctx.drops.blocks, "block");
            }
            Some(Event::Snapshot(_)) | None => {}
        }
    }
}

/// Values a block in the device's asset, falling back to the default asset.
async fn block_value<S: Store>(ctx: &SessionContext<S>, addr: &DeviceAddr) -> BlockValue {
    let asset_id: Box<str> = match ctx.store.get_device(addr).await {
        Ok(Some(Device {
            asset_override: Some(asset),
            ..
        })) if !asset.is_empty() => asset,
        Ok(_) => ctx.default_asset.as_ref().into(),
        Err(e) => {
            warn!(error = ?e, "Failed to look up device asset");
            ctx.default_asset.as_ref().into()
        }
    };

    let Some(asset) = ctx.pricing.asset_info(&asset_id).await else {
        warn!(asset = %asset_id, "Unknown asset, block left unvalued");
        return BlockValue {
            asset_id,
            ..Default::default()
        };
    };

    let price = ctx.pricing.unit_price(&asset_id).await.unwrap_or(0.0);
    BlockValue::new(&asset, price)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use minerhq_core::AssetInfo;

    use super::*;
    use crate::storage::memory::MemoryStore;

    struct FixedPricing;

    #[async_trait]
    impl Pricing for FixedPricing {
        async fn asset_info(&self, asset_id: &str) -> Option<AssetInfo> {
            (asset_id == "dgb").then(|| AssetInfo {
                id: "dgb".into(),
                name: "DigiByte".into(),
                symbol: "DGB".into(),
                unit_reward: 274.28,
            })
        }

        async fn unit_price(&self, _asset_id: &str) -> Option<f64> {
            Some(0.01)
        }
    }

    fn context(store: MemoryStore) -> (SessionContext<MemoryStore>, EventReceivers) {
        context_with(
            store,
            CollectorConfig {
                poll_interval_ms: 50,
                reconnect_backoff_ms: 50,
                request_timeout_ms: 200,
                ..Default::default()
            },
        )
    }

    fn context_with(
        store: MemoryStore,
        config: CollectorConfig,
    ) -> (SessionContext<MemoryStore>, EventReceivers) {
        let (senders, receivers) = event_channels(&config);

        let ctx = SessionContext {
            store,
            client: DeviceClient::new(config.request_timeout()).unwrap(),
            pricing: Arc::new(FixedPricing),
            senders,
            config,
            default_asset: "dgb".into(),
            drops: Arc::default(),
        };
        (ctx, receivers)
    }

    #[tokio::test]
    async fn add_is_idempotent_and_remove_stops() {
        let (ctx, _rx) = context(MemoryStore::default());
        let registry = SessionRegistry::new(ctx);
        // Nothing listens here, so both loops keep failing and retrying.
        let addr = DeviceAddr::from("127.0.0.1:9");

        assert!(registry.add(addr.clone()).await);
        assert!(!registry.add(addr.clone()).await);
        assert_eq!(registry.len().await, 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let status = registry.status().await;
        assert_eq!(
            status.get(&addr),
            Some(&SessionStatus {
                online: false,
                streaming: false,
            })
        );

        assert!(registry.remove(&addr).await.is_some());
        assert!(registry.remove(&addr).await.is_none());
        assert!(registry.status().await.is_empty());
    }

    #[tokio::test]
    async fn readded_device_gets_a_new_session_id() {
        let (ctx, _rx) = context(MemoryStore::default());
        let registry = SessionRegistry::new(ctx);
        let addr = DeviceAddr::from("127.0.0.1:9");

        registry.add(addr.clone()).await;
        let first = registry.remove(&addr).await.unwrap();
        registry.add(addr.clone()).await;
        let second = registry.remove(&addr).await.unwrap();

        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn zero_intervals_keep_loops_alive() {
        let (ctx, _rx) = context_with(
            MemoryStore::default(),
            CollectorConfig {
                poll_interval_ms: 0,
                reconnect_backoff_ms: 0,
                request_timeout_ms: 200,
                ..Default::default()
            },
        );
        let sessions: Sessions = Arc::default();
        let addr = DeviceAddr::from("127.0.0.1:9");
        let id = SessionId(Ulid::new());
        let cancel = CancellationToken::new();

        let poll = tokio::spawn(poll_loop(
            ctx.clone(),
            Arc::clone(&sessions),
            id,
            addr.clone(),
            cancel.clone(),
        ));
        let stream = tokio::spawn(stream_loop(ctx, sessions, id, addr, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!poll.is_finished());
        assert!(!stream.is_finished());

        cancel.cancel();
        poll.await.unwrap();
        stream.await.unwrap();
    }

    #[tokio::test]
    async fn lines_become_persisted_events() {
        let store = MemoryStore::default();
        let (ctx, mut rx) = context(store.clone());
        let addr = DeviceAddr::from("10.0.0.5");

        let text = "I (1) asic_result: (Pri) Job ID: 18 AsicNr: 3 Ver: 1 Nonce 2; Extranonce2 3 diff 5894.3/18304/3.70G\n\
                    I (2) system: idle\n\
                    I (3) STRATUM_MANAGER: FOUND BLOCK!!! 123456789.0 > 123000.0";
        handle_text(&ctx, &addr, "nerd-1", text).await;

        let share = rx.shares.try_recv().unwrap();
        assert_eq!(&*share.hostname, "nerd-1");
        assert_eq!(share.difficulty, 5894.3);

        let block = rx.blocks.try_recv().unwrap();
        assert_eq!(&*block.value.symbol, "DGB");
        assert!((block.value.value_usd - 2.7428).abs() < 1e-9);

        assert_eq!(store.recent_blocks(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn asset_override_wins_over_default() {
        let store = MemoryStore::default();
        let addr = DeviceAddr::from("10.0.0.6");
        let mut device = Device::new(addr.clone());
        device.asset_override = Some("bc2".into());
        store.upsert_device(device).await.unwrap();

        let (ctx, _rx) = context(store);
        let value = block_value(&ctx, &addr).await;

        // The fixed pricing only knows dgb, so bc2 stays unvalued.
        assert_eq!(&*value.asset_id, "bc2");
        assert_eq!(value.value_usd, 0.0);
    }

    #[test]
    fn full_channel_counts_drop() {
        let (tx, _rx) = mpsc::channel(1);
        let dropped = AtomicU64::new(0);

        offer(&tx, 1u8, &dropped, "test");
        offer(&tx, 2u8, &dropped, "test");

        assert_eq!(dropped.load(Ordering::Relaxed), 1);
    }
}
