//! Asset table and USD price lookup used to value found blocks.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use minerhq_core::AssetInfo;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::PricingConfig;

/// Source of asset metadata and prices for block valuation.
#[async_trait]
pub trait Pricing: Send + Sync + 'static {
    /// Metadata for a supported asset, with the current block reward.
    async fn asset_info(&self, asset_id: &str) -> Option<AssetInfo>;

    /// USD price of one unit. `None` if no price has ever been obtained.
    async fn unit_price(&self, asset_id: &str) -> Option<f64>;
}

/// A mineable asset and where its price is published.
#[derive(Debug, Clone, Copy)]
pub struct AssetSpec {
    pub id: &'static str,
    pub name: &'static str,
    pub symbol: &'static str,
    /// Binance trading pair, if listed there.
    pub binance_pair: Option<&'static str>,
    pub coingecko_id: &'static str,
    /// Reward used until one is fetched.
    pub default_reward: f64,
}

pub const SUPPORTED_ASSETS: &[AssetSpec] = &[
    AssetSpec {
        id: "btc",
        name: "Bitcoin",
        symbol: "BTC",
        binance_pair: Some("BTCUSDT"),
        coingecko_id: "bitcoin",
        default_reward: 3.125,
    },
    AssetSpec {
        id: "bch",
        name: "Bitcoin Cash",
        symbol: "BCH",
        binance_pair: Some("BCHUSDT"),
        coingecko_id: "bitcoin-cash",
        default_reward: 3.125,
    },
    AssetSpec {
        id: "dgb",
        name: "DigiByte",
        symbol: "DGB",
        binance_pair: Some("DGBUSDT"),
        coingecko_id: "digibyte",
        default_reward: 274.28,
    },
    AssetSpec {
        id: "xec",
        name: "eCash",
        symbol: "XEC",
        binance_pair: Some("XECUSDT"),
        coingecko_id: "ecash",
        default_reward: 1_812_500.0,
    },
    AssetSpec {
        id: "bc2",
        name: "BitcoinII",
        symbol: "BC2",
        binance_pair: None,
        coingecko_id: "bitcoinii",
        default_reward: 50.0,
    },
    AssetSpec {
        id: "btcs",
        name: "Fractal Bitcoin",
        symbol: "BTCS",
        binance_pair: None,
        coingecko_id: "fractal-bitcoin",
        default_reward: 50.0,
    },
];

pub fn asset_spec(asset_id: &str) -> Option<&'static AssetSpec> {
    SUPPORTED_ASSETS.iter().find(|a| a.id == asset_id)
}

#[derive(Debug, thiserror::Error)]
pub enum PricingError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status code: {0}")]
    Status(reqwest::StatusCode),
    #[error("no price for {0} in response")]
    Missing(&'static str),
    #[error("invalid price {0:?}")]
    InvalidPrice(String),
}

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    price: f64,
    fetched_at: Instant,
}

#[derive(Deserialize)]
struct BinanceTicker {
    price: String,
}

/// Prices from Binance with CoinGecko as fallback, cached per asset.
///
/// A stale price is served when every source fails.
pub struct PriceService {
    http: reqwest::Client,
    config: PricingConfig,
    prices: RwLock<HashMap<&'static str, CachedPrice>>,
    rewards: RwLock<HashMap<&'static str, f64>>,
}

impl PriceService {
    pub fn new(config: PricingConfig) -> Result<Self, PricingError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            config,
            prices: RwLock::new(HashMap::new()),
            rewards: RwLock::new(HashMap::new()),
        })
    }

    fn max_age(&self) -> Duration {
        Duration::from_secs(self.config.price_max_age_secs)
    }

    async fn fetch_price(&self, spec: &AssetSpec) -> Result<f64, PricingError> {
        if let Some(pair) = spec.binance_pair {
            match self.fetch_binance(pair).await {
                Ok(price) if price > 0.0 => return Ok(price),
                Ok(_) => debug!(asset = spec.id, "Binance returned a zero price"),
                Err(e) => debug!(asset = spec.id, error = %e, "Binance price fetch failed"),
            }
        }

        self.fetch_coingecko(spec.coingecko_id).await
    }

    async fn fetch_binance(&self, pair: &str) -> Result<f64, PricingError> {
        let url = format!("{}/api/v3/ticker/price", self.config.binance_url);

        let response = self.http.get(&url).query(&[("symbol", pair)]).send().await?;
        if !response.status().is_success() {
            return Err(PricingError::Status(response.status()));
        }

        let ticker: BinanceTicker = response.json().await?;
        ticker
            .price
            .parse()
            .map_err(|_| PricingError::InvalidPrice(ticker.price))
    }

    async fn fetch_coingecko(&self, coingecko_id: &'static str) -> Result<f64, PricingError> {
        let url = format!("{}/api/v3/simple/price", self.config.coingecko_url);

        let response = self
            .http
            .get(&url)
            .query(&[("ids", coingecko_id), ("vs_currencies", "usd")])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PricingError::Status(response.status()));
        }

        let body: HashMap<String, HashMap<String, f64>> = response.json().await?;
        body.get(coingecko_id)
            .and_then(|prices| prices.get("usd"))
            .copied()
            .filter(|price| *price > 0.0)
            .ok_or(PricingError::Missing(coingecko_id))
    }

    /// Fetches a fresh price for every supported asset.
    pub async fn refresh_prices(&self) {
        for spec in SUPPORTED_ASSETS {
            match self.fetch_price(spec).await {
                Ok(price) => {
                    self.prices.write().await.insert(
                        spec.id,
                        CachedPrice {
                            price,
                            fetched_at: Instant::now(),
                        },
                    );
                }
                Err(e) => warn!(asset = spec.id, error = %e, "Failed to refresh price"),
            }
        }
    }

    /// Re-reads block rewards from the rewards page.
    pub async fn refresh_rewards(&self) -> Result<usize, PricingError> {
        let response = self.http.get(&self.config.rewards_url).send().await?;
        if !response.status().is_success() {
            return Err(PricingError::Status(response.status()));
        }

        let page = response.text().await?;
        let parsed = parse_block_rewards(&page);
        let count = parsed.len();

        let mut rewards = self.rewards.write().await;
        for (id, reward) in parsed {
            info!(asset = id, reward, "Block reward updated");
            rewards.insert(id, reward);
        }

        Ok(count)
    }

    /// Keeps prices and rewards fresh until cancelled.
    #[instrument(name = "pricing_refresh", skip_all)]
    pub async fn run(&self, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("Price refresh disabled");
            return;
        }

        let mut prices = tokio::time::interval(Duration::from_secs(
            self.config.refresh_interval_secs.max(1),
        ));
        let mut rewards = tokio::time::interval(Duration::from_secs(
            self.config.reward_refresh_interval_secs.max(1),
        ));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Stopping price refresh");
                    break;
                }
                _ = prices.tick() => {
                    self.refresh_prices().await;
                }
                _ = rewards.tick() => {
                    if let Err(e) = self.refresh_rewards().await {
                        warn!(error = %e, "Failed to refresh block rewards");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Pricing for PriceService {
    async fn asset_info(&self, asset_id: &str) -> Option<AssetInfo> {
        let spec = asset_spec(asset_id)?;
        let reward = self
            .rewards
            .read()
            .await
            .get(spec.id)
            .copied()
            .unwrap_or(spec.default_reward);

        Some(AssetInfo {
            id: spec.id.into(),
            name: spec.name.into(),
            symbol: spec.symbol.into(),
            unit_reward: reward,
        })
    }

    async fn unit_price(&self, asset_id: &str) -> Option<f64> {
        let spec = asset_spec(asset_id)?;

        let cached = self.prices.read().await.get(spec.id).copied();
        if let Some(c) = cached
            && c.fetched_at.elapsed() < self.max_age()
        {
            return Some(c.price);
        }

        if !self.config.enabled {
            return cached.map(|c| c.price);
        }

        match self.fetch_price(spec).await {
            Ok(price) => {
                self.prices.write().await.insert(
                    spec.id,
                    CachedPrice {
                        price,
                        fetched_at: Instant::now(),
                    },
                );
                Some(price)
            }
            Err(e) => {
                warn!(asset = spec.id, error = %e, "Price fetch failed, using last known price");
                cached.map(|c| c.price)
            }
        }
    }
}

static REWARD_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    SUPPORTED_ASSETS
        .iter()
        .filter_map(|spec| {
            let pattern = format!(r"([\d.,]+)\s*{}\b", regex::escape(spec.symbol));
            Regex::new(&pattern).ok().map(|re| (spec.id, re))
        })
        .collect()
});

/// Finds "<amount> <SYMBOL>" for each supported asset in a page.
///
/// Thousands separators are ignored. Zero and unparseable amounts are skipped.
pub fn parse_block_rewards(page: &str) -> HashMap<&'static str, f64> {
    REWARD_PATTERNS
        .iter()
        .filter_map(|(id, re)| {
            let caps = re.captures(page)?;
            let reward: f64 = caps[1].replace(',', "").parse().ok()?;
            (reward > 0.0).then_some((*id, reward))
        })
        .collect()
}
