//! Threshold checks over the event stream and webhook delivery of alerts.
//!
//! The evaluator keeps a little memory per device (last hashrate, best
//! difficulty, rejected counter, last seen) plus the weekly best-share
//! leader. Most alert kinds are rate limited per device; found blocks and
//! leader changes are not.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use jiff::tz::TimeZone;
use jiff::{SignedDuration, Span, Timestamp};
use minerhq_core::{Block, Device, DeviceAddr, Share, Snapshot, format_difficulty};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use ulid::Ulid;

const FOOTER: &str = "MinerHQ Alert System";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertId(pub Ulid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    MinerOffline,
    TempHigh,
    HashrateDrop,
    ShareRejected,
    PoolDisconnected,
    FanLow,
    WifiWeak,
    NewBestDiff,
    BlockFound,
    NewLeader,
}

impl AlertKind {
    pub const ALL: [AlertKind; 10] = [
        AlertKind::MinerOffline,
        AlertKind::TempHigh,
        AlertKind::HashrateDrop,
        AlertKind::ShareRejected,
        AlertKind::PoolDisconnected,
        AlertKind::FanLow,
        AlertKind::WifiWeak,
        AlertKind::NewBestDiff,
        AlertKind::BlockFound,
        AlertKind::NewLeader,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::MinerOffline => "miner_offline",
            AlertKind::TempHigh => "temp_high",
            AlertKind::HashrateDrop => "hashrate_drop",
            AlertKind::ShareRejected => "share_rejected",
            AlertKind::PoolDisconnected => "pool_disconnected",
            AlertKind::FanLow => "fan_low",
            AlertKind::WifiWeak => "wifi_weak",
            AlertKind::NewBestDiff => "new_best_diff",
            AlertKind::BlockFound => "block_found",
            AlertKind::NewLeader => "new_leader",
        }
    }

    /// Emoji, title and embed colour.
    pub fn display(self) -> (&'static str, &'static str, u32) {
        match self {
            AlertKind::MinerOffline => ("🔴", "Miner Offline", 0xFF4444),
            AlertKind::TempHigh => ("🌡️", "High Temperature", 0xFFAA00),
            AlertKind::HashrateDrop => ("📉", "Hashrate Drop", 0xFFAA00),
            AlertKind::ShareRejected => ("❌", "Share Rejected", 0xFF6600),
            AlertKind::PoolDisconnected => ("🔌", "Pool Disconnected", 0xFF4444),
            AlertKind::FanLow => ("💨", "Low Fan Speed", 0xFFAA00),
            AlertKind::WifiWeak => ("📶", "Weak WiFi Signal", 0xFFAA00),
            AlertKind::NewBestDiff => ("🏆", "New Best Difficulty!", 0x00FF88),
            AlertKind::BlockFound => ("⛏️", "Block Found!", 0xFFD700),
            AlertKind::NewLeader => ("👑", "New Weekly Leader!", 0xAA55FF),
        }
    }

    /// Whether repeats for the same device are suppressed within the cooldown.
    pub fn has_cooldown(self) -> bool {
        !matches!(self, AlertKind::BlockFound | AlertKind::NewLeader)
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertKind {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AlertKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| AlertError::UnknownKind(s.to_owned()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

impl AlertField {
    fn inline(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_owned(),
            value: value.into(),
            inline: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: AlertId,
    pub kind: AlertKind,
    pub addr: DeviceAddr,
    pub device_name: Box<str>,
    pub message: String,
    /// The measurement that triggered the alert, when there is one.
    pub value: Option<f64>,
    pub timestamp: Timestamp,
    /// Embed fields. Defaults to device name and address when empty.
    pub fields: Vec<AlertField>,
}

impl Alert {
    fn new(
        kind: AlertKind,
        addr: &DeviceAddr,
        device_name: &str,
        message: String,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: AlertId(Ulid::new()),
            kind,
            addr: addr.clone(),
            device_name: device_name.into(),
            message,
            value: None,
            timestamp,
            fields: Vec::new(),
        }
    }

    fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    fn with_fields(mut self, fields: Vec<AlertField>) -> Self {
        self.fields = fields;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("webhook URL is not configured")]
    NoWebhook,
    #[error("unknown alert kind: {0}")]
    UnknownKind(String),
    #[error("unknown time zone: {0}")]
    TimeZone(#[from] jiff::Error),
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned status {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Master switch; when off nothing fires but device state is still tracked
    pub enabled: bool,
    /// Discord-compatible webhook. Empty means alerts are only logged.
    pub webhook_url: String,
    /// Seconds without a successful poll before a device is offline; 0 disables
    pub offline_secs: u64,
    /// °C; 0 disables
    pub temp_ceiling: f64,
    /// Percent drop between consecutive snapshots; 0 disables
    pub hashrate_drop_pct: f64,
    /// RPM; 0 disables
    pub fan_rpm_floor: u32,
    /// dBm; must be negative to be active
    pub signal_floor: i32,
    /// Seconds between repeats of the same alert for the same device
    pub cooldown_secs: u64,
    pub on_share_rejected: bool,
    pub on_pool_disconnected: bool,
    pub on_new_best_diff: bool,
    pub on_block_found: bool,
    pub on_new_leader: bool,
    /// IANA zone used to find the start of the week; system zone when unset
    pub timezone: Option<String>,
    pub webhook_timeout_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_url: String::new(),
            offline_secs: 300,
            temp_ceiling: 80.0,
            hashrate_drop_pct: 20.0,
            fan_rpm_floor: 1000,
            signal_floor: -70,
            cooldown_secs: 300,
            on_share_rejected: true,
            on_pool_disconnected: true,
            on_new_best_diff: false,
            on_block_found: true,
            on_new_leader: true,
            timezone: None,
            webhook_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Default)]
struct DeviceMemory {
    name: Box<str>,
    last_seen: Option<Timestamp>,
    last_hashrate: Option<f64>,
    last_best_diff: Option<f64>,
    last_rejected: Option<u64>,
}

#[derive(Debug)]
struct WeeklyLeader {
    best: f64,
    holder: Box<str>,
    week_start: Timestamp,
}

struct EvalState {
    config: AlertConfig,
    devices: HashMap<DeviceAddr, DeviceMemory>,
    cooldowns: HashMap<(DeviceAddr, AlertKind), Timestamp>,
    leader: WeeklyLeader,
}

impl EvalState {
    /// Applies the master switch and per-device cooldown. Records the fire time.
    fn admit(&mut self, alert: Alert, out: &mut Vec<Alert>) {
        if !self.config.enabled {
            return;
        }

        if alert.kind.has_cooldown() {
            let key = (alert.addr.clone(), alert.kind);
            let cooldown = SignedDuration::from_secs(self.config.cooldown_secs as i64);

            if let Some(last) = self.cooldowns.get(&key)
                && alert.timestamp.duration_since(*last) < cooldown
            {
                return;
            }
            self.cooldowns.insert(key, alert.timestamp);
        }

        out.push(alert);
    }
}

/// Evaluates snapshots, shares and blocks against the alert rules.
///
/// State sits behind a mutex that is never held across an `.await`, so the
/// evaluator can be shared freely.
pub struct AlertEvaluator {
    http: reqwest::Client,
    tz: TimeZone,
    state: Mutex<EvalState>,
}

impl AlertEvaluator {
    pub fn new(config: AlertConfig) -> Result<Self, AlertError> {
        let tz = match &config.timezone {
            Some(name) => TimeZone::get(name)?,
            None => TimeZone::system(),
        };
        Self::with_time_zone(config, tz)
    }

    pub fn with_time_zone(config: AlertConfig, tz: TimeZone) -> Result<Self, AlertError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.webhook_timeout_secs))
            .build()?;

        let week_start = week_start(&tz, Timestamp::now());

        Ok(Self {
            http,
            tz,
            state: Mutex::new(EvalState {
                config,
                devices: HashMap::new(),
                cooldowns: HashMap::new(),
                leader: WeeklyLeader {
                    best: 0.0,
                    holder: "".into(),
                    week_start,
                },
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, EvalState> {
        // Evaluation never panics midway, so a poisoned state is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> AlertConfig {
        self.state().config.clone()
    }

    pub fn update_config(&self, config: AlertConfig) {
        self.state().config = config;
    }

    /// Start of the week containing `ts`: Sunday 00:00 in the evaluator's zone.
    pub fn week_start(&self, ts: Timestamp) -> Timestamp {
        week_start(&self.tz, ts)
    }

    /// Seeds the weekly leader from history so a restart doesn't announce a
    /// leader change that already happened.
    pub fn seed_weekly_leader(&self, holder: &str, best: f64, now: Timestamp) {
        let week_start = self.week_start(now);
        let mut state = self.state();

        state.leader = WeeklyLeader {
            best,
            holder: holder.into(),
            week_start,
        };

        if !holder.is_empty() {
            info!(holder, best, "Weekly leader initialized");
        }
    }

    /// Drops everything remembered about a device, so a device added again
    /// starts from a clean slate.
    pub fn forget_device(&self, addr: &DeviceAddr) {
        let mut state = self.state();
        state.devices.remove(addr);
        state.cooldowns.retain(|(a, _), _| a != addr);
    }

    pub fn weekly_leader(&self) -> Option<(Box<str>, f64)> {
        let state = self.state();
        (!state.leader.holder.is_empty()).then(|| (state.leader.holder.clone(), state.leader.best))
    }

    /// Checks a snapshot and delivers whatever fires.
    pub fn check_snapshot(&self, snapshot: &Snapshot) -> Vec<Alert> {
        let (alerts, webhook) = {
            let mut state = self.state();
            (evaluate_snapshot(&mut state, snapshot), state.config.webhook_url.clone())
        };
        self.deliver_all(&alerts, &webhook);
        alerts
    }

    /// Tracks the weekly best share and announces a change of leader.
    pub fn check_share(&self, share: &Share) -> Option<Alert> {
        let week_start = self.week_start(share.timestamp);
        let (alert, webhook) = {
            let mut state = self.state();
            (
                evaluate_leader(&mut state, share, week_start),
                state.config.webhook_url.clone(),
            )
        };
        self.deliver_all(alert.as_slice(), &webhook);
        alert
    }

    pub fn check_block(&self, block: &Block) -> Option<Alert> {
        let (alert, webhook) = {
            let mut state = self.state();
            if !state.config.on_block_found {
                return None;
            }

            let mut out = Vec::new();
            state.admit(block_alert(block), &mut out);
            (out.pop(), state.config.webhook_url.clone())
        };
        self.deliver_all(alert.as_slice(), &webhook);
        alert
    }

    /// Flags active devices whose last snapshot is older than the offline
    /// threshold. Devices never seen are skipped.
    pub fn check_offline(&self, devices: &[Device], now: Timestamp) -> Vec<Alert> {
        let (alerts, webhook) = {
            let mut state = self.state();
            if state.config.offline_secs == 0 {
                return Vec::new();
            }
            let threshold = SignedDuration::from_secs(state.config.offline_secs as i64);

            let mut out = Vec::new();
            for device in devices.iter().filter(|d| d.active) {
                let Some(last_seen) = state
                    .devices
                    .get(&device.addr)
                    .and_then(|memory| memory.last_seen)
                else {
                    continue;
                };

                let since = now.duration_since(last_seen);
                if since > threshold {
                    let alert = Alert::new(
                        AlertKind::MinerOffline,
                        &device.addr,
                        &device.hostname,
                        format!("Miner offline for {}", format_elapsed(since)),
                        now,
                    );
                    state.admit(alert, &mut out);
                }
            }
            (out, state.config.webhook_url.clone())
        };
        self.deliver_all(&alerts, &webhook);
        alerts
    }

    fn deliver_all(&self, alerts: &[Alert], webhook: &str) {
        for alert in alerts {
            info!(
                kind = %alert.kind,
                device = %alert.addr,
                name = %alert.device_name,
                message = %alert.message,
                "Alert"
            );

            if webhook.is_empty() {
                continue;
            }

            let http = self.http.clone();
            let url = webhook.to_owned();
            let payload = discord_payload(alert);
            let kind = alert.kind;

            tokio::spawn(async move {
                match http.post(&url).json(&payload).send().await {
                    Ok(response) if response.status().as_u16() >= 400 => {
                        warn!(%kind, status = %response.status(), "Webhook rejected alert");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(%kind, error = %e, "Failed to send webhook"),
                }
            });
        }
    }

    /// Sends a test message to the webhook and waits for the answer.
    ///
    /// With a kind, a realistic sample of that alert is sent; otherwise a
    /// plain confirmation embed. Bypasses cooldown.
    pub async fn send_test_alert(&self, kind: Option<AlertKind>) -> Result<(), AlertError> {
        let webhook = self.state().config.webhook_url.clone();
        if webhook.is_empty() {
            return Err(AlertError::NoWebhook);
        }

        let payload = match kind {
            Some(kind) => discord_payload(&sample_alert(kind)),
            None => json!({
                "embeds": [{
                    "title": "✅ Test Alert",
                    "description": "This is a test alert from MinerHQ. If you see this message, your webhook is configured correctly!",
                    "color": 0x00FF88,
                    "timestamp": Timestamp::now().to_string(),
                    "footer": { "text": format!("{FOOTER} - Test") },
                }]
            }),
        };

        let response = self.http.post(&webhook).json(&payload).send().await?;
        if response.status().as_u16() >= 400 {
            return Err(AlertError::Status(response.status()));
        }

        Ok(())
    }
}

fn week_start(tz: &TimeZone, ts: Timestamp) -> Timestamp {
    let zoned = ts.to_zoned(tz.clone());
    let days_back = i64::from(zoned.weekday().to_sunday_zero_offset());

    zoned
        .date()
        .checked_sub(Span::new().days(days_back))
        .and_then(|sunday| sunday.to_zoned(tz.clone()))
        .map(|midnight| midnight.timestamp())
        .unwrap_or(ts)
}

fn evaluate_snapshot(state: &mut EvalState, snap: &Snapshot) -> Vec<Alert> {
    let mut out = Vec::new();
    let config = state.config.clone();
    let name: &str = &snap.hostname;
    let now = snap.timestamp;

    let memory = state.devices.entry(snap.addr.clone()).or_default();
    memory.name = snap.hostname.clone();
    memory.last_seen = Some(now);
    let previous_hashrate = memory.last_hashrate.replace(snap.hashrate.current);
    let previous_best = memory.last_best_diff.replace(snap.best_session_diff);
    let previous_rejected = memory.last_rejected.replace(snap.shares_rejected);

    let alert = |kind, message| Alert::new(kind, &snap.addr, name, message, now);

    if config.temp_ceiling > 0.0 && snap.temp > config.temp_ceiling {
        let a = alert(
            AlertKind::TempHigh,
            format!(
                "Temperature is {:.1}°C (threshold: {:.1}°C)",
                snap.temp, config.temp_ceiling
            ),
        )
        .with_value(snap.temp);
        state.admit(a, &mut out);
    }

    if let Some(last) = previous_hashrate
        && last > 0.0
    {
        let current = snap.hashrate.current;
        let drop_pct = (last - current) / last * 100.0;
        if config.hashrate_drop_pct > 0.0 && drop_pct > config.hashrate_drop_pct {
            let a = alert(
                AlertKind::HashrateDrop,
                format!(
                    "Hashrate dropped {:.1}% ({:.2} GH/s -> {:.2} GH/s)",
                    drop_pct, last, current
                ),
            )
            .with_value(drop_pct);
            state.admit(a, &mut out);
        }
    }

    if config.fan_rpm_floor > 0 && snap.fan_rpm > 0 && snap.fan_rpm < config.fan_rpm_floor {
        let a = alert(
            AlertKind::FanLow,
            format!(
                "Fan RPM is {} (threshold: {})",
                snap.fan_rpm, config.fan_rpm_floor
            ),
        )
        .with_value(f64::from(snap.fan_rpm));
        state.admit(a, &mut out);
    }

    if config.signal_floor < 0 && snap.wifi_rssi < config.signal_floor {
        let a = alert(
            AlertKind::WifiWeak,
            format!(
                "WiFi signal is {} dBm (threshold: {} dBm)",
                snap.wifi_rssi, config.signal_floor
            ),
        )
        .with_value(f64::from(snap.wifi_rssi));
        state.admit(a, &mut out);
    }

    if config.on_pool_disconnected && !snap.pool_connected {
        let a = alert(AlertKind::PoolDisconnected, "Pool disconnected".to_owned());
        state.admit(a, &mut out);
    }

    if config.on_share_rejected
        && let Some(previous) = previous_rejected
        && snap.shares_rejected > previous
    {
        let new = snap.shares_rejected - previous;
        let a = alert(
            AlertKind::ShareRejected,
            format!(
                "{} share(s) rejected ({} rejected this session)",
                new, snap.shares_rejected
            ),
        )
        .with_value(new as f64);
        state.admit(a, &mut out);
    }

    if config.on_new_best_diff
        && let Some(previous) = previous_best
        && snap.best_session_diff > previous
    {
        let a = alert(
            AlertKind::NewBestDiff,
            format!(
                "New best difficulty: {}",
                format_difficulty(snap.best_session_diff)
            ),
        )
        .with_value(snap.best_session_diff);
        state.admit(a, &mut out);
    }

    out
}

fn evaluate_leader(state: &mut EvalState, share: &Share, week_start: Timestamp) -> Option<Alert> {
    if !state.config.on_new_leader {
        return None;
    }

    let leader = &mut state.leader;
    if week_start > leader.week_start {
        leader.best = 0.0;
        leader.holder = "".into();
        leader.week_start = week_start;
    } else if week_start < leader.week_start {
        // Belongs to a week that is already over.
        return None;
    }

    if share.difficulty <= leader.best {
        return None;
    }

    let previous = std::mem::replace(&mut leader.holder, share.hostname.clone());
    leader.best = share.difficulty;

    if previous.is_empty() || previous == share.hostname {
        return None;
    }

    let alert = Alert::new(
        AlertKind::NewLeader,
        &share.addr,
        &share.hostname,
        format!("{} is the new weekly leader!", share.hostname),
        share.timestamp,
    )
    .with_value(share.difficulty)
    .with_fields(vec![
        AlertField::inline("New Leader", &*share.hostname),
        AlertField::inline("Share Difficulty", format_difficulty(share.difficulty)),
        AlertField::inline("Previous Leader", &*previous),
    ]);

    let mut out = Vec::new();
    state.admit(alert, &mut out);
    out.pop()
}

fn block_alert(block: &Block) -> Alert {
    let value = &block.value;
    let worth = if value.value_usd == 0.0 {
        "N/A".to_owned()
    } else {
        format!("${:.2}", value.value_usd)
    };

    Alert::new(
        AlertKind::BlockFound,
        &block.addr,
        &block.hostname,
        format!("Block found mining {}!", value.symbol),
        block.timestamp,
    )
    .with_value(block.difficulty)
    .with_fields(vec![
        AlertField::inline("Miner", &*block.hostname),
        AlertField::inline("Coin", &*value.symbol),
        AlertField::inline(
            "Reward",
            format!("{:.4} {}", value.unit_reward, value.symbol),
        ),
        AlertField::inline("Value", worth),
        AlertField::inline("Difficulty", format_difficulty(block.difficulty)),
    ])
}

/// `5m30s`, `1h2m0s`, `42s`.
fn format_elapsed(elapsed: SignedDuration) -> String {
    let secs = elapsed.as_secs().max(0);
    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);

    match (h, m) {
        (0, 0) => format!("{s}s"),
        (0, _) => format!("{m}m{s}s"),
        _ => format!("{h}h{m}m{s}s"),
    }
}

pub fn discord_payload(alert: &Alert) -> serde_json::Value {
    let (emoji, title, color) = alert.kind.display();

    let fields = if alert.fields.is_empty() {
        vec![
            AlertField::inline("Miner", &*alert.device_name),
            AlertField::inline("IP", alert.addr.as_str()),
        ]
    } else {
        alert.fields.clone()
    };

    json!({
        "embeds": [{
            "title": format!("{emoji} {title}"),
            "description": alert.message,
            "color": color,
            "fields": fields,
            "timestamp": alert.timestamp.to_string(),
            "footer": { "text": FOOTER },
        }]
    })
}

/// A believable alert of each kind for webhook testing.
pub fn sample_alert(kind: AlertKind) -> Alert {
    let addr = DeviceAddr::from("192.168.1.42");
    let message = match kind {
        AlertKind::MinerOffline => "Miner offline for 5m30s",
        AlertKind::TempHigh => "Temperature is 72.5°C (threshold: 65.0°C)",
        AlertKind::HashrateDrop => "Hashrate dropped 45.2% (580.00 GH/s -> 318.00 GH/s)",
        AlertKind::ShareRejected => "1 share(s) rejected (4 rejected this session)",
        AlertKind::PoolDisconnected => "Pool disconnected",
        AlertKind::FanLow => "Fan RPM is 1200 (threshold: 2000)",
        AlertKind::WifiWeak => "WiFi signal is -78 dBm (threshold: -70 dBm)",
        AlertKind::NewBestDiff => "New best difficulty: 4.29G",
        AlertKind::BlockFound => "Block found mining DGB!",
        AlertKind::NewLeader => "BitAxe-Ultra is the new weekly leader!",
    };

    let fields = match kind {
        AlertKind::BlockFound => vec![
            AlertField::inline("Miner", "BitAxe-Ultra"),
            AlertField::inline("Coin", "DGB"),
            AlertField::inline("Reward", "274.2800 DGB"),
            AlertField::inline("Value", "$2.74"),
            AlertField::inline("Difficulty", "8.59G"),
        ],
        AlertKind::NewLeader => vec![
            AlertField::inline("New Leader", "BitAxe-Ultra"),
            AlertField::inline("Share Difficulty", "4.29G"),
            AlertField::inline("Previous Leader", "BitAxe-Supra"),
        ],
        _ => Vec::new(),
    };

    Alert::new(
        kind,
        &addr,
        "BitAxe-Ultra",
        message.to_owned(),
        Timestamp::now(),
    )
    .with_fields(fields)
}
