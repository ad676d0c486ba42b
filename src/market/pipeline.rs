use crate::market::backfill::CandleHistorySource;
use crate::market::candle_store::CandleSeriesView;
use crate::market::coordinator::{
    CloseKind, EngineEffects, FeedCommand, FeedInbound, FeedLifecycle, FeedPhase, FetchRequest,
    MarketEngine, TransportEvent,
};
use crate::market::ledger::{
    FeedConnector, FeedEndpoints, LedgerClient, LedgerWsStream, OrderBookSource,
};
use crate::market::order_book::OrderBookSnapshot;
use crate::market::types::{
    parse_feed_payload, FeedConnectionState, FeedMessage, MarketFeedConfig,
    MarketFeedStatusSnapshot,
};
use crate::market::INBOUND_CHANNEL_CAPACITY;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Client;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STATUS_ERROR_THROTTLE_MS: u64 = 500;

/// Latest immutable snapshots of the running session, for the renderer.
#[derive(Debug, Clone)]
pub struct MarketViews {
    pub order_book: watch::Receiver<Arc<OrderBookSnapshot>>,
    pub candles: watch::Receiver<Arc<CandleSeriesView>>,
}

#[derive(Debug)]
pub struct ViewPublishers {
    order_book: watch::Sender<Arc<OrderBookSnapshot>>,
    candles: watch::Sender<Arc<CandleSeriesView>>,
}

pub fn market_views() -> (ViewPublishers, MarketViews) {
    let (order_book_tx, order_book_rx) = watch::channel(Arc::new(OrderBookSnapshot::default()));
    let (candles_tx, candles_rx) = watch::channel(Arc::new(CandleSeriesView::default()));
    (
        ViewPublishers {
            order_book: order_book_tx,
            candles: candles_tx,
        },
        MarketViews {
            order_book: order_book_rx,
            candles: candles_rx,
        },
    )
}

#[derive(Debug, Default)]
struct StatusPublishThrottle {
    last_state: Option<FeedConnectionState>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

pub struct StatusPublisher {
    store: Arc<RwLock<MarketFeedStatusSnapshot>>,
    throttle: Mutex<StatusPublishThrottle>,
}

impl StatusPublisher {
    pub fn new(store: Arc<RwLock<MarketFeedStatusSnapshot>>) -> Self {
        Self {
            store,
            throttle: Mutex::new(StatusPublishThrottle::default()),
        }
    }

    fn allow(&self, snapshot: &MarketFeedStatusSnapshot) -> bool {
        let mut writable = self.throttle.lock();
        let now = Instant::now();
        if snapshot.state == FeedConnectionState::Reconnecting
            && writable.last_state == Some(snapshot.state)
            && writable.last_reason == snapshot.reason
            && writable
                .last_emit
                .map(|instant| {
                    now.duration_since(instant) < Duration::from_millis(STATUS_ERROR_THROTTLE_MS)
                })
                .unwrap_or(false)
        {
            return false;
        }

        writable.last_state = Some(snapshot.state);
        writable.last_reason = snapshot.reason.clone();
        writable.last_emit = Some(now);
        true
    }

    pub async fn publish(&self, snapshot: MarketFeedStatusSnapshot) {
        if !self.allow(&snapshot) {
            return;
        }
        let mut writable = self.store.write().await;
        *writable = snapshot;
    }
}

pub async fn run_market_feed(
    config: MarketFeedConfig,
    endpoints: FeedEndpoints,
    status: StatusPublisher,
    publishers: ViewPublishers,
    command_rx: mpsc::Receiver<FeedCommand>,
    cancel_token: CancellationToken,
) {
    let ledger = Arc::new(LedgerClient::new(Client::new(), endpoints));
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

    info!(topic = %config.topic.label(), "starting market feed");
    let transport_handle = tokio::spawn(run_transport(
        Arc::clone(&ledger),
        config.clone(),
        inbound_tx.clone(),
        cancel_token.clone(),
    ));

    let engine = MarketEngine::new(&config);
    run_consumer(
        engine,
        ledger,
        ConsumerChannels {
            inbound_tx,
            inbound_rx,
            command_rx,
        },
        publishers,
        &status,
        Duration::from_millis(config.book_throttle_ms),
        cancel_token.clone(),
    )
    .await;

    cancel_token.cancel();
    let _ = transport_handle.await;

    status
        .publish(MarketFeedStatusSnapshot::stopped(
            config.topic.label(),
            Some("feed stopped".to_string()),
        ))
        .await;
    info!(topic = %config.topic.label(), "market feed stopped");
}

pub struct ConsumerChannels {
    pub inbound_tx: mpsc::Sender<FeedInbound>,
    pub inbound_rx: mpsc::Receiver<FeedInbound>,
    pub command_rx: mpsc::Receiver<FeedCommand>,
}

/// Owns the engine for the lifetime of the session. Every mutation of
/// market state happens on this task.
pub async fn run_consumer<S>(
    mut engine: MarketEngine,
    source: Arc<S>,
    channels: ConsumerChannels,
    publishers: ViewPublishers,
    status: &StatusPublisher,
    tick_period: Duration,
    cancel_token: CancellationToken,
) where
    S: CandleHistorySource + OrderBookSource + 'static,
{
    let ConsumerChannels {
        inbound_tx,
        mut inbound_rx,
        mut command_rx,
    } = channels;
    let fetch_token = cancel_token.child_token();

    let mut ticker = tokio::time::interval_at(Instant::now() + tick_period, tick_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let bootstrap = EngineEffects {
        publish_book: true,
        publish_candles: true,
        publish_status: true,
        fetches: engine.bootstrap(),
    };
    apply_effects(&engine, bootstrap, &publishers, status, &source, &inbound_tx, &fetch_token)
        .await;

    let mut commands_open = true;
    loop {
        let effects = tokio::select! {
            _ = cancel_token.cancelled() => break,
            inbound = inbound_rx.recv() => {
                let Some(inbound) = inbound else {
                    break;
                };
                engine.handle_inbound(inbound)
            }
            command = command_rx.recv(), if commands_open => match command {
                Some(command) => engine.handle_command(command, Instant::now()),
                None => {
                    commands_open = false;
                    continue;
                }
            },
            _ = ticker.tick() => engine.on_tick(Instant::now()),
        };

        apply_effects(&engine, effects, &publishers, status, &source, &inbound_tx, &fetch_token)
            .await;
    }

    fetch_token.cancel();
    let cleared = engine.shutdown();
    publish_views(&engine, &cleared, &publishers);
}

fn publish_views(engine: &MarketEngine, effects: &EngineEffects, publishers: &ViewPublishers) {
    if effects.publish_book {
        publishers
            .order_book
            .send_replace(Arc::new(engine.book_snapshot()));
    }
    if effects.publish_candles {
        publishers.candles.send_replace(Arc::new(engine.candle_view()));
    }
}

async fn apply_effects<S>(
    engine: &MarketEngine,
    effects: EngineEffects,
    publishers: &ViewPublishers,
    status: &StatusPublisher,
    source: &Arc<S>,
    inbound_tx: &mpsc::Sender<FeedInbound>,
    fetch_token: &CancellationToken,
) where
    S: CandleHistorySource + OrderBookSource + 'static,
{
    publish_views(engine, &effects, publishers);
    if effects.publish_status {
        status.publish(engine.status()).await;
    }
    for request in effects.fetches {
        spawn_fetch(
            request,
            Arc::clone(source),
            inbound_tx.clone(),
            fetch_token.child_token(),
        );
    }
}

fn spawn_fetch<S>(
    request: FetchRequest,
    source: Arc<S>,
    inbound_tx: mpsc::Sender<FeedInbound>,
    cancel_token: CancellationToken,
) where
    S: CandleHistorySource + OrderBookSource + 'static,
{
    tokio::spawn(async move {
        let inbound = tokio::select! {
            _ = cancel_token.cancelled() => return,
            inbound = perform_fetch(source.as_ref(), request) => inbound,
        };
        if inbound_tx.send(inbound).await.is_err() {
            debug!("consumer gone before fetch result arrived");
        }
    });
}

async fn perform_fetch<S>(source: &S, request: FetchRequest) -> FeedInbound
where
    S: CandleHistorySource + OrderBookSource + ?Sized,
{
    match request {
        FetchRequest::Book { key, limit } => {
            let result = source.fetch_book(&key, limit).await;
            FeedInbound::BookLoaded { key, result }
        }
        FetchRequest::Latest {
            id,
            key,
            limit,
            mode,
        } => {
            let result = source.fetch_candles(&key, limit, None).await;
            FeedInbound::LatestLoaded {
                id,
                key,
                limit,
                mode,
                result,
            }
        }
        FetchRequest::Older(request) => {
            let result = source
                .fetch_candles(&request.key, request.limit, Some(request.before_ms))
                .await;
            FeedInbound::OlderLoaded { request, result }
        }
    }
}

/// Connect, stream and reconnect until cancelled or closed normally.
async fn run_transport<C>(
    connector: Arc<C>,
    config: MarketFeedConfig,
    inbound_tx: mpsc::Sender<FeedInbound>,
    cancel_token: CancellationToken,
) where
    C: FeedConnector + ?Sized,
{
    let mut lifecycle =
        FeedLifecycle::new(config.reconnect_base_delay_ms, config.max_reconnect_delay_ms);
    let ping_interval = Duration::from_millis(config.ping_interval_ms);

    while !cancel_token.is_cancelled() {
        let state = lifecycle.on_connecting();
        let connecting = TransportEvent::Connecting {
            attempt: lifecycle.reconnect_attempt(),
            state,
        };
        if inbound_tx
            .send(FeedInbound::Transport(connecting))
            .await
            .is_err()
        {
            break;
        }

        let opened = tokio::select! {
            _ = cancel_token.cancelled() => break,
            opened = connector.open_feed(&config.topic) => opened,
        };

        let (kind, reason) = match opened {
            Ok(stream) => {
                lifecycle.on_open();
                info!(topic = %config.topic.label(), "feed connected");
                if inbound_tx
                    .send(FeedInbound::Transport(TransportEvent::Open))
                    .await
                    .is_err()
                {
                    break;
                }
                stream_feed(stream, &inbound_tx, ping_interval, &cancel_token).await
            }
            Err(error) => (CloseKind::Abnormal, format!("feed unavailable: {error}")),
        };

        let retry_in = lifecycle.on_close(kind);
        match retry_in {
            Some(delay) => warn!(%reason, delay_ms = delay.as_millis() as u64, "feed closed, reconnecting"),
            None => info!(%reason, "feed closed"),
        }
        let closed = TransportEvent::Closed { reason, retry_in };
        if inbound_tx.send(FeedInbound::Transport(closed)).await.is_err() {
            break;
        }

        let (FeedPhase::Closed, Some(delay)) = (lifecycle.phase(), retry_in) else {
            break;
        };
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

enum FrameDirective {
    Forward(FeedMessage),
    Continue,
    Closed(CloseKind, String),
}

fn handle_frame(message: Message) -> FrameDirective {
    let parsed = match message {
        Message::Text(text_payload) => {
            let mut owned_payload = text_payload.into_bytes();
            parse_feed_payload(owned_payload.as_mut_slice())
        }
        Message::Binary(mut binary_payload) => parse_feed_payload(binary_payload.as_mut_slice()),
        Message::Close(frame) => {
            return match frame {
                Some(frame) if frame.code == CloseCode::Normal => {
                    FrameDirective::Closed(CloseKind::Normal, "feed closed by server".to_string())
                }
                Some(frame) => FrameDirective::Closed(
                    CloseKind::Abnormal,
                    format!("feed closed with code {}: {}", u16::from(frame.code), frame.reason),
                ),
                None => FrameDirective::Closed(
                    CloseKind::Abnormal,
                    "feed closed without status".to_string(),
                ),
            };
        }
        _ => return FrameDirective::Continue,
    };

    match parsed {
        Ok(FeedMessage::Pong) => FrameDirective::Continue,
        Ok(message) => FrameDirective::Forward(message),
        Err(error) => {
            warn!(%error, "failed to decode feed payload");
            FrameDirective::Continue
        }
    }
}

async fn stream_feed(
    stream: LedgerWsStream,
    inbound_tx: &mpsc::Sender<FeedInbound>,
    ping_interval: Duration,
    cancel_token: &CancellationToken,
) -> (CloseKind, String) {
    let (mut write, mut read) = stream.split();
    let mut keep_alive = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: Cow::Borrowed("session closed"),
                };
                if let Err(error) = write.send(Message::Close(Some(frame))).await {
                    debug!(%error, "close frame not delivered");
                }
                return (CloseKind::Normal, "feed cancelled".to_string());
            }
            _ = keep_alive.tick() => {
                if let Err(error) = write.send(Message::Ping(Vec::new())).await {
                    return (CloseKind::Abnormal, format!("keep-alive failed: {error}"));
                }
            }
            frame = read.next() => {
                let Some(frame_result) = frame else {
                    return (CloseKind::Abnormal, "feed ended without close frame".to_string());
                };
                let message = match frame_result {
                    Ok(message) => message,
                    Err(error) => {
                        return (CloseKind::Abnormal, format!("websocket frame error: {error}"));
                    }
                };
                match handle_frame(message) {
                    FrameDirective::Forward(message) => {
                        if inbound_tx.send(FeedInbound::Message(message)).await.is_err() {
                            return (CloseKind::Normal, "consumer stopped".to_string());
                        }
                    }
                    FrameDirective::Continue => {}
                    FrameDirective::Closed(kind, reason) => return (kind, reason),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::market::ledger::{connect_and_subscribe, FeedSession};
    use crate::market::numeric::WireNumber;
    use crate::market::types::{
        Asset, BookKey, BookSide, CandleTick, FeedTopic, Offer, RawCandle, Resolution,
        SeriesKey, VisibleRange,
    };
    use async_trait::async_trait;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

    const WAIT: Duration = Duration::from_secs(5);

    struct FakeLedger {
        candles: Vec<RawCandle>,
        bids: Vec<Offer>,
        older_calls: Mutex<Vec<i64>>,
    }

    impl FakeLedger {
        fn with_candles(times_s: &[i64]) -> Self {
            Self {
                candles: times_s.iter().map(|time| raw(*time)).collect(),
                bids: Vec::new(),
                older_calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CandleHistorySource for FakeLedger {
        async fn fetch_candles(
            &self,
            _key: &SeriesKey,
            _bar_count: u16,
            before_ms: Option<i64>,
        ) -> Result<Vec<RawCandle>, AppError> {
            match before_ms {
                None => Ok(self.candles.clone()),
                Some(cursor) => {
                    self.older_calls.lock().push(cursor);
                    Ok(vec![raw(0)])
                }
            }
        }
    }

    #[async_trait]
    impl OrderBookSource for FakeLedger {
        async fn fetch_book(
            &self,
            _key: &BookKey,
            _limit: u16,
        ) -> Result<(Vec<Offer>, Vec<Offer>), AppError> {
            Ok((self.bids.clone(), Vec::new()))
        }
    }

    fn raw(time_s: i64) -> RawCandle {
        RawCandle::from_values(time_s * 1_000, 1.0, 2.0, 0.5, 1.5, 1.0)
    }

    fn bid(sequence: u64) -> Offer {
        Offer {
            account: "rMaker".to_string(),
            sequence,
            taker_gets_currency: "USD".to_string(),
            taker_gets_issuer: Some("rIssuer".to_string()),
            taker_gets_amount: WireNumber::Number(10.0),
            taker_pays_currency: "XRP".to_string(),
            taker_pays_issuer: None,
            taker_pays_amount: WireNumber::Number(20_000_000.0),
            quality: WireNumber::Number(2_000_000.0),
            funded_gets: None,
            funded_pays: None,
        }
    }

    fn candle_config() -> MarketFeedConfig {
        MarketFeedConfig {
            topic: FeedTopic::Candles(SeriesKey::new("XRP-USD", Resolution::M1, "USD")),
            history_limit: 3,
            page_size: 50,
            ..MarketFeedConfig::default()
        }
    }

    fn book_config() -> MarketFeedConfig {
        MarketFeedConfig {
            topic: FeedTopic::OrderBook(BookKey {
                base: Asset::native(),
                quote: Asset::issued("USD", "rIssuer"),
            }),
            ..MarketFeedConfig::default()
        }
    }

    struct Harness {
        inbound_tx: mpsc::Sender<FeedInbound>,
        command_tx: mpsc::Sender<FeedCommand>,
        views: MarketViews,
        status_store: Arc<RwLock<MarketFeedStatusSnapshot>>,
        cancel_token: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    fn spawn_consumer(config: MarketFeedConfig, source: Arc<FakeLedger>) -> Harness {
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (command_tx, command_rx) = mpsc::channel(16);
        let (publishers, views) = market_views();
        let status_store = Arc::new(RwLock::new(MarketFeedStatusSnapshot::stopped(
            config.topic.label(),
            None,
        )));
        let cancel_token = CancellationToken::new();

        let channels = ConsumerChannels {
            inbound_tx: inbound_tx.clone(),
            inbound_rx,
            command_rx,
        };
        let task_status = Arc::clone(&status_store);
        let task_token = cancel_token.clone();
        let handle = tokio::spawn(async move {
            let status = StatusPublisher::new(task_status);
            let engine = MarketEngine::new(&config);
            run_consumer(
                engine,
                source,
                channels,
                publishers,
                &status,
                Duration::from_millis(config.book_throttle_ms),
                task_token,
            )
            .await;
        });

        Harness {
            inbound_tx,
            command_tx,
            views,
            status_store,
            cancel_token,
            handle,
        }
    }

    fn candle_tick(time_s: i64) -> FeedInbound {
        FeedInbound::Message(FeedMessage::Candle(CandleTick {
            time: time_s * 1_000,
            open: WireNumber::Number(1.0),
            high: WireNumber::Number(2.0),
            low: WireNumber::Number(0.5),
            close: WireNumber::Number(1.25),
            volume: WireNumber::Number(1.0),
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_bulk_loads_then_applies_live_ticks() {
        let mut harness = spawn_consumer(
            candle_config(),
            Arc::new(FakeLedger::with_candles(&[300, 100, 200])),
        );

        harness
            .views
            .candles
            .wait_for(|view| view.candles.len() == 3)
            .await
            .expect("bulk load should publish");

        harness
            .inbound_tx
            .send(candle_tick(400))
            .await
            .expect("consumer should accept ticks");
        let view = harness
            .views
            .candles
            .wait_for(|view| view.candles.len() == 4)
            .await
            .expect("tick should publish")
            .clone();
        assert_eq!(view.candles.last().map(|candle| candle.time), Some(400));

        harness.cancel_token.cancel();
        harness.handle.await.expect("consumer should stop cleanly");
        assert!(harness.views.candles.borrow().candles.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_pages_history_from_viewport() {
        let source = Arc::new(FakeLedger::with_candles(&[100, 200, 300]));
        let mut harness = spawn_consumer(candle_config(), Arc::clone(&source));
        harness
            .views
            .candles
            .wait_for(|view| view.candles.len() == 3)
            .await
            .expect("bulk load should publish");

        harness
            .command_tx
            .send(FeedCommand::Viewport(VisibleRange { from: 0.0, to: 2.5 }))
            .await
            .expect("consumer should accept commands");
        let view = harness
            .views
            .candles
            .wait_for(|view| view.candles.len() == 4)
            .await
            .expect("older page should publish")
            .clone();

        assert_eq!(view.candles.first().map(|candle| candle.time), Some(0));
        assert!(!view.has_more);
        assert_eq!(*source.older_calls.lock(), vec![100_000]);

        tokio::time::sleep(Duration::from_millis(1)).await;
        let status = harness.status_store.read().await.clone();
        assert!(!status.has_more);
        assert!(!status.is_loading_more);

        harness.cancel_token.cancel();
        harness.handle.await.expect("consumer should stop cleanly");
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_throttles_book_updates() {
        let source = Arc::new(FakeLedger {
            candles: Vec::new(),
            bids: vec![bid(1)],
            older_calls: Mutex::new(Vec::new()),
        });
        let mut harness = spawn_consumer(book_config(), source);

        harness
            .views
            .order_book
            .wait_for(|book| book.bids.len() == 1)
            .await
            .expect("snapshot should publish");

        for sequence in [2, 3] {
            harness
                .inbound_tx
                .send(FeedInbound::Message(FeedMessage::OrderBook {
                    side: BookSide::Bid,
                    offers: vec![bid(sequence)],
                }))
                .await
                .expect("consumer should accept book updates");
        }

        let book = harness
            .views
            .order_book
            .wait_for(|book| book.bids.first().is_some_and(|level| level.id == "rMaker:3"))
            .await
            .expect("latest book update should win")
            .clone();
        assert!(book.bids[0].is_new);
        assert!((book.bids[0].price - 0.5).abs() < 1e-12);

        harness.cancel_token.cancel();
        harness.handle.await.expect("consumer should stop cleanly");
    }

    #[tokio::test(start_paused = true)]
    async fn transport_events_reach_status_store() {
        let harness = spawn_consumer(candle_config(), Arc::new(FakeLedger::with_candles(&[])));

        harness
            .inbound_tx
            .send(FeedInbound::Transport(TransportEvent::Closed {
                reason: "connection reset".to_string(),
                retry_in: Some(Duration::from_millis(400)),
            }))
            .await
            .expect("consumer should accept transport events");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = harness.status_store.read().await.clone();
        assert_eq!(status.state, FeedConnectionState::Reconnecting);
        assert_eq!(status.reason.as_deref(), Some("connection reset"));

        harness.cancel_token.cancel();
        harness.handle.await.expect("consumer should stop cleanly");
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_reconnect_status_is_throttled() {
        let store = Arc::new(RwLock::new(MarketFeedStatusSnapshot::stopped(
            "candles".to_string(),
            None,
        )));
        let publisher = StatusPublisher::new(Arc::clone(&store));
        let mut snapshot = MarketFeedStatusSnapshot::stopped("candles".to_string(), None);
        snapshot.state = FeedConnectionState::Reconnecting;
        snapshot.reason = Some("connect error".to_string());

        publisher.publish(snapshot.clone()).await;
        store.write().await.dropped_ticks = 7;
        publisher.publish(snapshot.clone()).await;
        assert_eq!(store.read().await.dropped_ticks, 7);

        tokio::time::advance(Duration::from_millis(STATUS_ERROR_THROTTLE_MS)).await;
        publisher.publish(snapshot).await;
        assert_eq!(store.read().await.dropped_ticks, 0);
    }

    /// Real socket path without the HTTP session call.
    struct LocalFeed {
        endpoints: FeedEndpoints,
    }

    #[async_trait]
    impl FeedConnector for LocalFeed {
        async fn open_feed(&self, topic: &FeedTopic) -> Result<LedgerWsStream, AppError> {
            let session = FeedSession {
                token: "t-local".to_string(),
                expires_at: None,
            };
            connect_and_subscribe(&self.endpoints, &session, topic).await
        }
    }

    type ServerSocket = WebSocketStream<TcpStream>;

    async fn local_feed() -> (TcpListener, Arc<LocalFeed>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("listener has an address");
        let endpoints = FeedEndpoints::new("http://127.0.0.1:9/api", format!("ws://{addr}/feed"));
        (listener, Arc::new(LocalFeed { endpoints }))
    }

    fn spawn_transport(
        connector: Arc<LocalFeed>,
    ) -> (
        mpsc::Receiver<FeedInbound>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let cancel_token = CancellationToken::new();
        let config = MarketFeedConfig {
            ping_interval_ms: 50,
            reconnect_base_delay_ms: 10,
            max_reconnect_delay_ms: 40,
            ..candle_config()
        };
        let handle = tokio::spawn(run_transport(
            connector,
            config,
            inbound_tx,
            cancel_token.clone(),
        ));
        (inbound_rx, cancel_token, handle)
    }

    async fn accept_client(listener: &TcpListener) -> (ServerSocket, String) {
        let (tcp, _) = tokio::time::timeout(WAIT, listener.accept())
            .await
            .expect("client should connect")
            .expect("accept should succeed");
        let uri = Arc::new(Mutex::new(String::new()));
        let seen = Arc::clone(&uri);
        let socket = accept_hdr_async(
            tcp,
            move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                *seen.lock() = request.uri().to_string();
                Ok(response)
            },
        )
        .await
        .expect("handshake should succeed");
        let uri = uri.lock().clone();
        (socket, uri)
    }

    async fn next_frame(socket: &mut ServerSocket) -> Option<Message> {
        tokio::time::timeout(WAIT, socket.next())
            .await
            .expect("frame should arrive")
            .and_then(Result::ok)
    }

    fn transport_events(inbound_rx: &mut mpsc::Receiver<FeedInbound>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(inbound) = inbound_rx.try_recv() {
            if let FeedInbound::Transport(event) = inbound {
                events.push(event);
            }
        }
        events
    }

    #[tokio::test]
    async fn transport_subscribes_pings_and_closes_normally_on_cancel() {
        let (listener, connector) = local_feed().await;
        let (mut inbound_rx, cancel_token, handle) = spawn_transport(connector);

        let (mut socket, uri) = accept_client(&listener).await;
        assert!(uri.ends_with("/feed?session=t-local"));
        let Some(Message::Text(subscribe)) = next_frame(&mut socket).await else {
            panic!("subscribe command should be the first frame");
        };
        assert!(subscribe.starts_with(r#"{"type":"subscribe","topic":{"kind":"candles""#));
        assert!(matches!(
            next_frame(&mut socket).await,
            Some(Message::Ping(_))
        ));

        cancel_token.cancel();
        let close = loop {
            match next_frame(&mut socket).await {
                Some(Message::Ping(_)) => continue,
                other => break other,
            }
        };
        let Some(Message::Close(Some(frame))) = close else {
            panic!("expected a close frame, got {close:?}");
        };
        assert_eq!(frame.code, CloseCode::Normal);

        tokio::time::timeout(WAIT, handle)
            .await
            .expect("transport should stop")
            .expect("transport should not panic");
        assert!(
            tokio::time::timeout(Duration::from_millis(200), listener.accept())
                .await
                .is_err(),
            "a cancelled session must not reconnect"
        );

        let events = transport_events(&mut inbound_rx);
        assert!(matches!(
            events.as_slice(),
            [
                TransportEvent::Connecting { attempt: 0, .. },
                TransportEvent::Open,
                TransportEvent::Closed { retry_in: None, .. },
            ]
        ));
    }

    #[tokio::test]
    async fn transport_reconnects_after_abnormal_close_and_dropped_socket() {
        let (listener, connector) = local_feed().await;
        let (mut inbound_rx, cancel_token, handle) = spawn_transport(connector);

        let (mut first, _) = accept_client(&listener).await;
        assert!(matches!(next_frame(&mut first).await, Some(Message::Text(_))));
        first
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: Cow::Borrowed("restart"),
            })))
            .await
            .expect("server close should send");
        drop(first);

        let (mut second, _) = accept_client(&listener).await;
        assert!(matches!(next_frame(&mut second).await, Some(Message::Text(_))));
        drop(second);

        let (mut third, _) = accept_client(&listener).await;
        assert!(matches!(next_frame(&mut third).await, Some(Message::Text(_))));

        cancel_token.cancel();
        tokio::time::timeout(WAIT, handle)
            .await
            .expect("transport should stop")
            .expect("transport should not panic");

        let events = transport_events(&mut inbound_rx);
        let attempts: Vec<(u32, FeedConnectionState)> = events
            .iter()
            .filter_map(|event| match event {
                TransportEvent::Connecting { attempt, state } => Some((*attempt, *state)),
                _ => None,
            })
            .collect();
        assert_eq!(
            attempts,
            vec![
                (0, FeedConnectionState::Connecting),
                (1, FeedConnectionState::Reconnecting),
                (1, FeedConnectionState::Reconnecting),
            ]
        );
        let retries: Vec<bool> = events
            .iter()
            .filter_map(|event| match event {
                TransportEvent::Closed { retry_in, .. } => Some(retry_in.is_some()),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![true, true, false]);
    }

    #[test]
    fn normal_close_frame_ends_session() {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed(""),
        };
        assert!(matches!(
            handle_frame(Message::Close(Some(frame))),
            FrameDirective::Closed(CloseKind::Normal, _)
        ));
    }

    #[test]
    fn abnormal_close_frame_reconnects() {
        let frame = CloseFrame {
            code: CloseCode::Away,
            reason: Cow::Borrowed("restart"),
        };
        assert!(matches!(
            handle_frame(Message::Close(Some(frame))),
            FrameDirective::Closed(CloseKind::Abnormal, _)
        ));
        assert!(matches!(
            handle_frame(Message::Close(None)),
            FrameDirective::Closed(CloseKind::Abnormal, _)
        ));
    }

    #[test]
    fn text_frames_are_decoded_and_forwarded() {
        let payload = r#"{"type":"candle","time":60000,"open":1,"high":2,"low":0.5,"close":1.5,"volume":3}"#;
        assert!(matches!(
            handle_frame(Message::Text(payload.to_string())),
            FrameDirective::Forward(FeedMessage::Candle(_))
        ));
        assert!(matches!(
            handle_frame(Message::Text(r#"{"type":"pong"}"#.to_string())),
            FrameDirective::Continue
        ));
        assert!(matches!(
            handle_frame(Message::Text("not json".to_string())),
            FrameDirective::Continue
        ));
    }
}
