use crate::error::AppError;
use crate::market::backfill::CandleHistorySource;
use crate::market::types::{decode_each, Asset, BookKey, FeedTopic, Offer, RawCandle, SeriesKey};
use async_trait::async_trait;
use futures_util::SinkExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use simd_json::OwnedValue;
use std::env;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::warn;

pub const REST_BASE_URL_ENV: &str = "LEDGER_REST_BASE_URL";
pub const WS_BASE_URL_ENV: &str = "LEDGER_WS_BASE_URL";
const DEFAULT_REST_BASE_URL: &str = "http://127.0.0.1:8080/api";
const DEFAULT_WS_BASE_URL: &str = "ws://127.0.0.1:8080/feed";

pub type LedgerWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEndpoints {
    pub rest_base_url: String,
    pub ws_base_url: String,
}

impl Default for FeedEndpoints {
    fn default() -> Self {
        Self {
            rest_base_url: DEFAULT_REST_BASE_URL.to_string(),
            ws_base_url: DEFAULT_WS_BASE_URL.to_string(),
        }
    }
}

impl FeedEndpoints {
    pub fn new(rest_base_url: impl Into<String>, ws_base_url: impl Into<String>) -> Self {
        Self {
            rest_base_url: trim_base(rest_base_url.into()),
            ws_base_url: trim_base(ws_base_url.into()),
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        let rest = env::var(REST_BASE_URL_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(defaults.rest_base_url);
        let ws = env::var(WS_BASE_URL_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(defaults.ws_base_url);
        Self::new(rest.trim(), ws.trim())
    }
}

fn trim_base(value: String) -> String {
    value.trim_end_matches('/').to_string()
}

fn asset_query(prefix: &str, asset: &Asset) -> String {
    match asset.issuer.as_deref() {
        Some(issuer) if !issuer.is_empty() => {
            format!("{prefix}={}&{prefix}Issuer={issuer}", asset.currency)
        }
        _ => format!("{prefix}={}", asset.currency),
    }
}

fn order_book_endpoint(
    endpoints: &FeedEndpoints,
    taker_gets: &Asset,
    taker_pays: &Asset,
    limit: u16,
) -> String {
    format!(
        "{}/orderbook?{}&{}&limit={limit}",
        endpoints.rest_base_url,
        asset_query("takerGets", taker_gets),
        asset_query("takerPays", taker_pays)
    )
}

fn candles_endpoint(
    endpoints: &FeedEndpoints,
    key: &SeriesKey,
    bar_count: u16,
    before_ms: Option<i64>,
) -> String {
    let mut endpoint = format!("{}/candles/{}", endpoints.rest_base_url, key.symbol_id)
        + &format!(
            "?resolution={}&barCount={bar_count}&currency={}",
            key.resolution.as_str(),
            key.currency
        );
    if let Some(value) = before_ms {
        endpoint.push_str(&format!("&before={value}"));
    }
    endpoint
}

fn session_endpoint(endpoints: &FeedEndpoints) -> String {
    format!("{}/feed/session", endpoints.rest_base_url)
}

fn ws_endpoint(endpoints: &FeedEndpoints, session: &FeedSession) -> String {
    format!("{}?session={}", endpoints.ws_base_url, session.token)
}

/// Issued by the collaborator before a socket may be opened.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSession {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FeedSessionRequest<'a> {
    topic: &'a FeedTopic,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum FeedCommandWire<'a> {
    Subscribe { topic: &'a FeedTopic },
}

pub fn subscribe_message(topic: &FeedTopic) -> Result<String, AppError> {
    Ok(simd_json::serde::to_string(&FeedCommandWire::Subscribe {
        topic,
    })?)
}

pub async fn fetch_order_book(
    client: &Client,
    endpoints: &FeedEndpoints,
    taker_gets: &Asset,
    taker_pays: &Asset,
    limit: u16,
) -> Result<Vec<Offer>, AppError> {
    let endpoint = order_book_endpoint(endpoints, taker_gets, taker_pays, limit);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let payload = response.json::<Vec<OwnedValue>>().await?;
    let (offers, dropped) = decode_each::<Offer>(payload);
    if dropped > 0 {
        warn!(dropped, "order book page had malformed offers");
    }
    Ok(offers)
}

/// Fetches both sides of `key` concurrently; returns `(bids, asks)`.
pub async fn fetch_book_sides(
    client: &Client,
    endpoints: &FeedEndpoints,
    key: &BookKey,
    limit: u16,
) -> Result<(Vec<Offer>, Vec<Offer>), AppError> {
    let (bids, asks) = tokio::join!(
        fetch_order_book(client, endpoints, &key.quote, &key.base, limit),
        fetch_order_book(client, endpoints, &key.base, &key.quote, limit),
    );
    Ok((bids?, asks?))
}

pub async fn fetch_candles(
    client: &Client,
    endpoints: &FeedEndpoints,
    key: &SeriesKey,
    bar_count: u16,
    before_ms: Option<i64>,
) -> Result<Vec<RawCandle>, AppError> {
    let endpoint = candles_endpoint(endpoints, key, bar_count, before_ms);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let payload = response.json::<Vec<OwnedValue>>().await?;
    let (candles, dropped) = decode_each::<RawCandle>(payload);
    if dropped > 0 {
        warn!(dropped, key = ?key, "candle page had malformed rows");
    }
    Ok(candles)
}

pub async fn fetch_feed_session(
    client: &Client,
    endpoints: &FeedEndpoints,
    topic: &FeedTopic,
) -> Result<FeedSession, AppError> {
    let response = client
        .post(session_endpoint(endpoints))
        .json(&FeedSessionRequest { topic })
        .send()
        .await?
        .error_for_status()?;
    let session = response.json::<FeedSession>().await?;
    if session.token.trim().is_empty() {
        return Err(AppError::Session("empty token".to_string()));
    }
    Ok(session)
}

pub async fn connect_feed(
    endpoints: &FeedEndpoints,
    session: &FeedSession,
) -> Result<LedgerWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let request = ws_endpoint(endpoints, session);
    let (stream, _) = connect_async_with_config(request, Some(ws_config), true).await?;
    Ok(stream)
}

/// Opens the socket and sends the subscribe command before any frame is read.
pub async fn connect_and_subscribe(
    endpoints: &FeedEndpoints,
    session: &FeedSession,
    topic: &FeedTopic,
) -> Result<LedgerWsStream, AppError> {
    let mut stream = connect_feed(endpoints, session).await?;
    stream.send(Message::Text(subscribe_message(topic)?)).await?;
    Ok(stream)
}

/// Produces a subscribed feed socket for the transport task.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn open_feed(&self, topic: &FeedTopic) -> Result<LedgerWsStream, AppError>;
}

#[async_trait]
pub trait OrderBookSource: Send + Sync {
    async fn fetch_book(&self, key: &BookKey, limit: u16)
        -> Result<(Vec<Offer>, Vec<Offer>), AppError>;
}

/// REST client bound to one set of endpoints.
#[derive(Debug, Clone)]
pub struct LedgerClient {
    client: Client,
    endpoints: FeedEndpoints,
}

impl LedgerClient {
    pub fn new(client: Client, endpoints: FeedEndpoints) -> Self {
        Self { client, endpoints }
    }
}

#[async_trait]
impl CandleHistorySource for LedgerClient {
    async fn fetch_candles(
        &self,
        key: &SeriesKey,
        bar_count: u16,
        before_ms: Option<i64>,
    ) -> Result<Vec<RawCandle>, AppError> {
        fetch_candles(&self.client, &self.endpoints, key, bar_count, before_ms).await
    }
}

#[async_trait]
impl FeedConnector for LedgerClient {
    async fn open_feed(&self, topic: &FeedTopic) -> Result<LedgerWsStream, AppError> {
        let session = fetch_feed_session(&self.client, &self.endpoints, topic).await?;
        connect_and_subscribe(&self.endpoints, &session, topic).await
    }
}

#[async_trait]
impl OrderBookSource for LedgerClient {
    async fn fetch_book(
        &self,
        key: &BookKey,
        limit: u16,
    ) -> Result<(Vec<Offer>, Vec<Offer>), AppError> {
        fetch_book_sides(&self.client, &self.endpoints, key, limit).await
    }
}
