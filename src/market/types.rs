use crate::error::AppError;
use crate::market::numeric::{is_within_bounds, WireNumber};
use crate::market::order_book::CumulativeOrder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use simd_json::OwnedValue;
use tracing::debug;

pub const NATIVE_CURRENCY: &str = "XRP";
pub const DEFAULT_FEED_KIND: FeedKind = FeedKind::Candles;
pub const DEFAULT_SYMBOL_ID: &str = "XRP-USD";
pub const DEFAULT_CURRENCY: &str = "USD";
pub const DEFAULT_RESOLUTION: Resolution = Resolution::H1;
pub const DEFAULT_QUOTE_CURRENCY: &str = "USD";
pub const DEFAULT_QUOTE_ISSUER: &str = "rvYAfWj5gh67oV6fW32ZzP3Aw4Eubs59B";
pub const DEFAULT_HISTORY_LIMIT: u16 = 500;
pub const DEFAULT_PAGE_SIZE: u16 = 300;
pub const DEFAULT_BOOK_LIMIT: u16 = 100;
pub const DEFAULT_BOOK_THROTTLE_MS: u64 = 100;
pub const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 200;
pub const DEFAULT_MAX_RECONNECT_DELAY_MS: u64 = 5_000;
pub const DEFAULT_ZOOM_EDGE_THRESHOLD: u32 = 2;
pub const DEFAULT_LOAD_MORE_THRESHOLD: u32 = 10;
pub const DEFAULT_ZOOM_QUIET_PERIOD_MS: u64 = 400;
pub const MIN_HISTORY_LIMIT: u16 = 50;
pub const MAX_HISTORY_LIMIT: u16 = 10_000;
pub const MIN_PAGE_SIZE: u16 = 50;
pub const MAX_PAGE_SIZE: u16 = 2_000;
pub const MIN_BOOK_LIMIT: u16 = 1;
pub const MAX_BOOK_LIMIT: u16 = 1_000;
pub const MIN_BOOK_THROTTLE_MS: u64 = 16;
pub const MAX_BOOK_THROTTLE_MS: u64 = 1_000;
pub const MIN_PING_INTERVAL_MS: u64 = 1_000;
pub const MAX_PING_INTERVAL_MS: u64 = 120_000;
pub const MAX_RECONNECT_DELAY_CEILING_MS: u64 = 120_000;
pub const MAX_ZOOM_QUIET_PERIOD_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedConnectionState {
    Idle,
    Connecting,
    Live,
    Reconnecting,
    Stopped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Resolution {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
    /// The whole market lifetime in one request; never paged.
    #[serde(rename = "all")]
    All,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
            Self::All => "all",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value {
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "30m" => Ok(Self::M30),
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            "1w" => Ok(Self::W1),
            "1M" => Ok(Self::Mo1),
            "all" => Ok(Self::All),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported resolution '{other}'"
            ))),
        }
    }

    pub fn is_all_time(self) -> bool {
        matches!(self, Self::All)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub currency: String,
    pub issuer: Option<String>,
}

impl Asset {
    pub fn native() -> Self {
        Self {
            currency: NATIVE_CURRENCY.to_string(),
            issuer: None,
        }
    }

    pub fn issued(currency: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            currency: currency.into(),
            issuer: Some(issuer.into()),
        }
    }

    pub fn is_native(&self) -> bool {
        is_native_leg(&self.currency, self.issuer.as_deref())
    }
}

pub fn is_native_leg(currency: &str, issuer: Option<&str>) -> bool {
    currency == NATIVE_CURRENCY && issuer.map(str::is_empty).unwrap_or(true)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookKey {
    pub base: Asset,
    pub quote: Asset,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesKey {
    pub symbol_id: String,
    pub resolution: Resolution,
    pub currency: String,
}

impl SeriesKey {
    pub fn new(symbol_id: impl Into<String>, resolution: Resolution, currency: impl Into<String>) -> Self {
        Self {
            symbol_id: symbol_id.into(),
            resolution,
            currency: currency.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Candles,
    OrderBook,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum FeedTopic {
    #[serde(rename = "orderbook")]
    OrderBook(BookKey),
    #[serde(rename = "candles")]
    Candles(SeriesKey),
}

impl FeedTopic {
    pub fn label(&self) -> String {
        match self {
            Self::OrderBook(key) => format!(
                "book:{}/{}",
                key.base.currency, key.quote.currency
            ),
            Self::Candles(key) => format!(
                "candles:{}@{}:{}",
                key.symbol_id,
                key.resolution.as_str(),
                key.currency
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bid,
    Ask,
}

/// A resting ledger offer as delivered by REST and the live feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    pub account: String,
    pub sequence: u64,
    pub taker_gets_currency: String,
    #[serde(default)]
    pub taker_gets_issuer: Option<String>,
    pub taker_gets_amount: WireNumber,
    pub taker_pays_currency: String,
    #[serde(default)]
    pub taker_pays_issuer: Option<String>,
    pub taker_pays_amount: WireNumber,
    pub quality: WireNumber,
    #[serde(default)]
    pub funded_gets: Option<WireNumber>,
    #[serde(default)]
    pub funded_pays: Option<WireNumber>,
}

impl Offer {
    /// Row identity. Two offers can share a price, never an `account:sequence`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.account, self.sequence)
    }

    pub fn gets_is_native(&self) -> bool {
        is_native_leg(&self.taker_gets_currency, self.taker_gets_issuer.as_deref())
    }

    pub fn pays_is_native(&self) -> bool {
        is_native_leg(&self.taker_pays_currency, self.taker_pays_issuer.as_deref())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// `[time_ms, open, high, low, close, volume]` as returned by the candles endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCandle(
    pub i64,
    pub WireNumber,
    pub WireNumber,
    pub WireNumber,
    pub WireNumber,
    pub WireNumber,
);

impl RawCandle {
    pub fn from_values(time_ms: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self(
            time_ms,
            open.into(),
            high.into(),
            low.into(),
            close.into(),
            volume.into(),
        )
    }
}

impl TryFrom<&RawCandle> for Candle {
    type Error = AppError;

    fn try_from(value: &RawCandle) -> Result<Self, Self::Error> {
        sanitize_candle(
            value.0,
            value.1.to_f64()?,
            value.2.to_f64()?,
            value.3.to_f64()?,
            value.4.to_f64()?,
            value.5.to_f64()?,
        )
    }
}

/// Live candle tick; `time` is the bucket start in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleTick {
    pub time: i64,
    pub open: WireNumber,
    pub high: WireNumber,
    pub low: WireNumber,
    pub close: WireNumber,
    pub volume: WireNumber,
}

impl TryFrom<&CandleTick> for Candle {
    type Error = AppError;

    fn try_from(value: &CandleTick) -> Result<Self, Self::Error> {
        sanitize_candle(
            value.time,
            value.open.to_f64()?,
            value.high.to_f64()?,
            value.low.to_f64()?,
            value.close.to_f64()?,
            value.volume.to_f64()?,
        )
    }
}

fn sanitize_candle(
    time_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
) -> Result<Candle, AppError> {
    if ![open, high, low, close]
        .into_iter()
        .all(is_within_bounds)
    {
        return Err(AppError::MalformedData(format!(
            "candle at {time_ms} has a price outside the accepted bounds"
        )));
    }
    if !volume.is_finite() || volume < 0.0 {
        return Err(AppError::MalformedData(format!(
            "candle at {time_ms} has an invalid volume"
        )));
    }

    Ok(Candle {
        time: time_ms.div_euclid(1_000),
        open,
        high,
        low,
        close,
        volume,
    })
}

/// Decodes every element of a batch independently. Elements that do not
/// match `T` are dropped; the second value is how many were dropped.
pub fn decode_each<T: DeserializeOwned>(values: Vec<OwnedValue>) -> (Vec<T>, usize) {
    let mut dropped = 0_usize;
    let decoded = values
        .into_iter()
        .filter_map(|value| match simd_json::serde::from_owned_value::<T>(value) {
            Ok(record) => Some(record),
            Err(error) => {
                dropped += 1;
                debug!(%error, "dropping malformed record");
                None
            }
        })
        .collect();
    (decoded, dropped)
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum FeedMessageWire {
    #[serde(rename = "orderbook")]
    OrderBook {
        side: BookSide,
        offers: Vec<OwnedValue>,
    },
    Candle(CandleTick),
    Pong,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    OrderBook { side: BookSide, offers: Vec<Offer> },
    Candle(CandleTick),
    Pong,
}

pub fn parse_feed_payload(payload: &mut [u8]) -> Result<FeedMessage, AppError> {
    let wire: FeedMessageWire = simd_json::serde::from_slice(payload)?;
    Ok(match wire {
        FeedMessageWire::OrderBook { side, offers } => FeedMessage::OrderBook {
            side,
            offers: decode_each(offers).0,
        },
        FeedMessageWire::Candle(tick) => FeedMessage::Candle(tick),
        FeedMessageWire::Pong => FeedMessage::Pong,
    })
}

/// Viewport range in logical bar indices, as reported by the chart.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisibleRange {
    pub from: f64,
    pub to: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketFeedStatusSnapshot {
    pub state: FeedConnectionState,
    pub topic: String,
    pub is_live: bool,
    pub has_more: bool,
    pub is_loading_more: bool,
    pub is_zoomed: bool,
    pub reconnect_attempt: u32,
    pub dropped_ticks: u64,
    pub reason: Option<String>,
}

impl MarketFeedStatusSnapshot {
    pub fn stopped(topic: String, reason: Option<String>) -> Self {
        Self {
            state: FeedConnectionState::Stopped,
            topic,
            is_live: false,
            has_more: false,
            is_loading_more: false,
            is_zoomed: false,
            reconnect_attempt: 0,
            dropped_ticks: 0,
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartMarketFeedArgs {
    pub kind: Option<FeedKind>,
    pub symbol_id: Option<String>,
    pub resolution: Option<Resolution>,
    pub currency: Option<String>,
    pub base_currency: Option<String>,
    pub base_issuer: Option<String>,
    pub quote_currency: Option<String>,
    pub quote_issuer: Option<String>,
    pub history_limit: Option<u16>,
    pub page_size: Option<u16>,
    pub book_limit: Option<u16>,
    pub book_throttle_ms: Option<u64>,
    pub ping_interval_ms: Option<u64>,
    pub reconnect_base_delay_ms: Option<u64>,
    pub max_reconnect_delay_ms: Option<u64>,
    pub zoom_edge_threshold: Option<u32>,
    pub load_more_threshold: Option<u32>,
    pub zoom_quiet_period_ms: Option<u64>,
    pub cumulative_order: Option<CumulativeOrder>,
}

#[derive(Debug, Clone)]
pub struct MarketFeedConfig {
    pub topic: FeedTopic,
    pub history_limit: u16,
    pub page_size: u16,
    pub book_limit: u16,
    pub book_throttle_ms: u64,
    pub ping_interval_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub zoom_edge_threshold: u32,
    pub load_more_threshold: u32,
    pub zoom_quiet_period_ms: u64,
    pub cumulative_order: CumulativeOrder,
}

impl Default for MarketFeedConfig {
    fn default() -> Self {
        Self {
            topic: FeedTopic::Candles(SeriesKey::new(
                DEFAULT_SYMBOL_ID,
                DEFAULT_RESOLUTION,
                DEFAULT_CURRENCY,
            )),
            history_limit: DEFAULT_HISTORY_LIMIT,
            page_size: DEFAULT_PAGE_SIZE,
            book_limit: DEFAULT_BOOK_LIMIT,
            book_throttle_ms: DEFAULT_BOOK_THROTTLE_MS,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            reconnect_base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            max_reconnect_delay_ms: DEFAULT_MAX_RECONNECT_DELAY_MS,
            zoom_edge_threshold: DEFAULT_ZOOM_EDGE_THRESHOLD,
            load_more_threshold: DEFAULT_LOAD_MORE_THRESHOLD,
            zoom_quiet_period_ms: DEFAULT_ZOOM_QUIET_PERIOD_MS,
            cumulative_order: CumulativeOrder::default(),
        }
    }
}

fn normalize_code(value: Option<String>, default: &str, field: &str) -> Result<String, AppError> {
    let code = value
        .unwrap_or_else(|| default.to_string())
        .trim()
        .to_string();
    let allowed = |ch: char| ch.is_ascii_alphanumeric() || matches!(ch, '.' | ':' | '-' | '_');
    if code.is_empty() || !code.chars().all(allowed) {
        return Err(AppError::InvalidArgument(format!(
            "{field} must be non-empty ASCII (alphanumeric, '.', ':', '-', '_')"
        )));
    }
    Ok(code)
}

fn normalize_issuer(value: Option<String>, field: &str) -> Result<Option<String>, AppError> {
    match value.map(|issuer| issuer.trim().to_string()) {
        None => Ok(None),
        Some(issuer) if issuer.is_empty() => Ok(None),
        Some(issuer) if issuer.chars().all(|ch| ch.is_ascii_alphanumeric()) => Ok(Some(issuer)),
        Some(_) => Err(AppError::InvalidArgument(format!(
            "{field} must be alphanumeric ASCII"
        ))),
    }
}

fn normalize_asset(
    currency: Option<String>,
    issuer: Option<String>,
    default_currency: &str,
    default_issuer: Option<&str>,
    field: &str,
) -> Result<Asset, AppError> {
    let explicit_currency = currency.is_some();
    let currency = normalize_code(currency, default_currency, &format!("{field}Currency"))?;
    let issuer = match normalize_issuer(issuer, &format!("{field}Issuer"))? {
        Some(issuer) => Some(issuer),
        None if !explicit_currency => default_issuer.map(str::to_string),
        None => None,
    };

    if currency == NATIVE_CURRENCY && issuer.is_some() {
        return Err(AppError::InvalidArgument(format!(
            "{field}Issuer must be empty for the native asset"
        )));
    }
    if currency != NATIVE_CURRENCY && issuer.is_none() {
        return Err(AppError::InvalidArgument(format!(
            "{field}Issuer is required for issued currencies"
        )));
    }

    Ok(Asset { currency, issuer })
}

impl StartMarketFeedArgs {
    pub fn normalize(self) -> Result<MarketFeedConfig, AppError> {
        let topic = match self.kind.unwrap_or(DEFAULT_FEED_KIND) {
            FeedKind::Candles => {
                let symbol_id = normalize_code(self.symbol_id, DEFAULT_SYMBOL_ID, "symbolId")?;
                let currency = normalize_code(self.currency, DEFAULT_CURRENCY, "currency")?;
                let resolution = self.resolution.unwrap_or(DEFAULT_RESOLUTION);
                FeedTopic::Candles(SeriesKey::new(symbol_id, resolution, currency))
            }
            FeedKind::OrderBook => {
                let base = normalize_asset(
                    self.base_currency,
                    self.base_issuer,
                    NATIVE_CURRENCY,
                    None,
                    "base",
                )?;
                let quote = normalize_asset(
                    self.quote_currency,
                    self.quote_issuer,
                    DEFAULT_QUOTE_CURRENCY,
                    Some(DEFAULT_QUOTE_ISSUER),
                    "quote",
                )?;
                if base == quote {
                    return Err(AppError::InvalidArgument(
                        "base and quote assets must differ".to_string(),
                    ));
                }
                FeedTopic::OrderBook(BookKey { base, quote })
            }
        };

        let history_limit = self.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        if !(MIN_HISTORY_LIMIT..=MAX_HISTORY_LIMIT).contains(&history_limit) {
            return Err(AppError::InvalidArgument(format!(
                "historyLimit must be between {MIN_HISTORY_LIMIT} and {MAX_HISTORY_LIMIT}"
            )));
        }

        let page_size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(AppError::InvalidArgument(format!(
                "pageSize must be between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}"
            )));
        }

        let book_limit = self.book_limit.unwrap_or(DEFAULT_BOOK_LIMIT);
        if !(MIN_BOOK_LIMIT..=MAX_BOOK_LIMIT).contains(&book_limit) {
            return Err(AppError::InvalidArgument(format!(
                "bookLimit must be between {MIN_BOOK_LIMIT} and {MAX_BOOK_LIMIT}"
            )));
        }

        let book_throttle_ms = self.book_throttle_ms.unwrap_or(DEFAULT_BOOK_THROTTLE_MS);
        if !(MIN_BOOK_THROTTLE_MS..=MAX_BOOK_THROTTLE_MS).contains(&book_throttle_ms) {
            return Err(AppError::InvalidArgument(format!(
                "bookThrottleMs must be between {MIN_BOOK_THROTTLE_MS} and {MAX_BOOK_THROTTLE_MS}"
            )));
        }

        let ping_interval_ms = self.ping_interval_ms.unwrap_or(DEFAULT_PING_INTERVAL_MS);
        if !(MIN_PING_INTERVAL_MS..=MAX_PING_INTERVAL_MS).contains(&ping_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "pingIntervalMs must be between {MIN_PING_INTERVAL_MS} and {MAX_PING_INTERVAL_MS}"
            )));
        }

        let reconnect_base_delay_ms = self
            .reconnect_base_delay_ms
            .unwrap_or(DEFAULT_RECONNECT_BASE_DELAY_MS);
        let max_reconnect_delay_ms = self
            .max_reconnect_delay_ms
            .unwrap_or(DEFAULT_MAX_RECONNECT_DELAY_MS);
        if reconnect_base_delay_ms == 0
            || max_reconnect_delay_ms < reconnect_base_delay_ms
            || max_reconnect_delay_ms > MAX_RECONNECT_DELAY_CEILING_MS
        {
            return Err(AppError::InvalidArgument(format!(
                "reconnect delays must satisfy 0 < reconnectBaseDelayMs <= maxReconnectDelayMs <= {MAX_RECONNECT_DELAY_CEILING_MS}"
            )));
        }

        let zoom_edge_threshold = self.zoom_edge_threshold.unwrap_or(DEFAULT_ZOOM_EDGE_THRESHOLD);
        let load_more_threshold = self.load_more_threshold.unwrap_or(DEFAULT_LOAD_MORE_THRESHOLD);
        let zoom_quiet_period_ms = self
            .zoom_quiet_period_ms
            .unwrap_or(DEFAULT_ZOOM_QUIET_PERIOD_MS);
        if zoom_quiet_period_ms > MAX_ZOOM_QUIET_PERIOD_MS {
            return Err(AppError::InvalidArgument(format!(
                "zoomQuietPeriodMs must be at most {MAX_ZOOM_QUIET_PERIOD_MS}"
            )));
        }

        Ok(MarketFeedConfig {
            topic,
            history_limit,
            page_size,
            book_limit,
            book_throttle_ms,
            ping_interval_ms,
            reconnect_base_delay_ms,
            max_reconnect_delay_ms,
            zoom_edge_threshold,
            load_more_threshold,
            zoom_quiet_period_ms,
            cumulative_order: self.cumulative_order.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketFeedSession {
    pub running: bool,
    pub topic: FeedTopic,
    pub history_limit: u16,
    pub page_size: u16,
    pub book_throttle_ms: u64,
    pub ping_interval_ms: u64,
    pub cumulative_order: CumulativeOrder,
}

impl MarketFeedSession {
    pub fn from_config(config: &MarketFeedConfig) -> Self {
        Self {
            running: true,
            topic: config.topic.clone(),
            history_limit: config.history_limit,
            page_size: config.page_size,
            book_throttle_ms: config.book_throttle_ms,
            ping_interval_ms: config.ping_interval_ms,
            cumulative_order: config.cumulative_order,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketFeedStopResult {
    pub stopped: bool,
}
