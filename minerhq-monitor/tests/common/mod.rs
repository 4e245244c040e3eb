#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use minerhq_core::{AssetInfo, DeviceAddr};
use minerhq_monitor::{CollectorConfig, Config, Pricing, PricingConfig};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Pricing that knows only DigiByte, at one cent.
pub struct FixedPricing;

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

    async fn unit_price(&self, asset_id: &str) -> Option<f64> {
        (asset_id == "dgb").then_some(0.01)
    }
}

/// Fast timings so tests don't wait on production intervals.
pub fn test_config() -> Config {
    Config {
        collector: CollectorConfig {
            poll_interval_ms: 50,
            reconnect_backoff_ms: 100,
            request_timeout_ms: 500,
            online_window_secs: 1,
            ..Default::default()
        },
        pricing: PricingConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[derive(Clone)]
struct FakeState {
    healthy: Arc<AtomicBool>,
    info_requests: Arc<AtomicUsize>,
    stream_opens: Arc<AtomicUsize>,
    stream_closes: Arc<AtomicUsize>,
    lines: Arc<Vec<String>>,
}

/// A device speaking the NerdQAxe HTTP and log stream API on localhost.
pub struct FakeDevice {
    pub addr: DeviceAddr,
    pub healthy: Arc<AtomicBool>,
    pub info_requests: Arc<AtomicUsize>,
    stream_opens: Arc<AtomicUsize>,
    stream_closes: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl FakeDevice {
    /// Serves `lines`, one message each, to every stream connection.
    pub async fn spawn(lines: &[&str]) -> Self {
        let state = FakeState {
            healthy: Arc::new(AtomicBool::new(true)),
            info_requests: Arc::new(AtomicUsize::new(0)),
            stream_opens: Arc::new(AtomicUsize::new(0)),
            stream_closes: Arc::new(AtomicUsize::new(0)),
            lines: Arc::new(lines.iter().map(|l| l.to_string()).collect()),
        };

        let app = Router::new()
            .route("/api/system/info", get(system_info))
            .route("/api/ws", get(log_stream))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local: SocketAddr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let shutdown = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .unwrap();
        });

        Self {
            addr: DeviceAddr::new(local.to_string()),
            healthy: state.healthy,
            info_requests: state.info_requests,
            stream_opens: state.stream_opens,
            stream_closes: state.stream_closes,
            cancel,
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn info_requests(&self) -> usize {
        self.info_requests.load(Ordering::SeqCst)
    }

    /// Log stream connections accepted so far.
    pub fn stream_opens(&self) -> usize {
        self.stream_opens.load(Ordering::SeqCst)
    }

    /// Log stream connections that have ended.
    pub fn stream_closes(&self) -> usize {
        self.stream_closes.load(Ordering::SeqCst)
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn system_info(State(state): State<FakeState>) -> Response {
    state.info_requests.fetch_add(1, Ordering::SeqCst);
    if !state.healthy.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    Json(serde_json::json!({
        "hostname": "nerd-test",
        "deviceModel": "NerdQAxe++",
        "ASICModel": "BM1370",
        "hashRate": 580.0,
        "hashRate_1m": 575.0,
        "temp": 55.0,
        "vrTemp": 50.0,
        "power": 72.0,
        "voltage": 5100.0,
        "fanrpm": 4200,
        "fanspeed": 60,
        "sharesAccepted": 12,
        "sharesRejected": 0,
        "bestDiff": 4.29e9,
        "bestSessionDiff": 1.2e6,
        "poolDifficulty": 2048.0,
        "uptimeSeconds": 3600,
        "wifiRSSI": -48,
        "stratum": { "pools": [{ "connected": true }] }
    }))
    .into_response()
}

async fn log_stream(ws: WebSocketUpgrade, State(state): State<FakeState>) -> Response {
    ws.on_upgrade(move |socket| async move {
        state.stream_opens.fetch_add(1, Ordering::SeqCst);
        stream_lines(socket, &state.lines).await;
        state.stream_closes.fetch_add(1, Ordering::SeqCst);
    })
}

async fn stream_lines(mut socket: WebSocket, lines: &[String]) {
    for line in lines {
        if socket.send(Message::Text(line.as_str().into())).await.is_err() {
            return;
        }
    }

    // Stay connected until the client goes away.
    while let Some(Ok(message)) = socket.recv().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
}

/// Polls `check` until it holds, failing the test after a few seconds.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not met in time");
}
