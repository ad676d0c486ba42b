//! Synchronous core of a feed session.
//!
//! [`FeedLifecycle`] is the connection state machine driven by the transport
//! task. [`MarketEngine`] owns every piece of mutable market state and is
//! driven by the consumer loop in `pipeline`; it never awaits, so each
//! inbound message is applied atomically and the effects it returns tell the
//! loop what to publish or fetch next.

use crate::error::AppError;
use crate::market::backfill::{BackfillLoader, BackfillOutcome, BackfillRequest};
use crate::market::candle_store::{CandleSeriesView, CandleStore, MergeOutcome, UpsertOutcome};
use crate::market::order_book::{OrderBookSnapshot, OrderBookState};
use crate::market::throttle::BookThrottle;
use crate::market::types::{
    BookKey, BookSide, CandleTick, FeedConnectionState, FeedMessage, FeedTopic, MarketFeedConfig,
    MarketFeedStatusSnapshot, Offer, RawCandle, SeriesKey, VisibleRange,
};
use crate::market::zoom::ZoomGate;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const RECONNECT_MAX_EXPONENT: u32 = 6;
const RECONNECT_JITTER_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedPhase {
    Idle,
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Close code 1000 or a local shutdown.
    Normal,
    Abnormal,
}

/// Connection state machine for one session:
/// `Idle -> Connecting -> Open -> Closed(normal) -> Idle`, or
/// `Closed(abnormal) -> Connecting` after a backoff delay.
#[derive(Debug)]
pub struct FeedLifecycle {
    phase: FeedPhase,
    reconnect_attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl FeedLifecycle {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            phase: FeedPhase::Idle,
            reconnect_attempt: 0,
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn phase(&self) -> FeedPhase {
        self.phase
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    pub fn on_connecting(&mut self) -> FeedConnectionState {
        self.phase = FeedPhase::Connecting;
        if self.reconnect_attempt == 0 {
            FeedConnectionState::Connecting
        } else {
            FeedConnectionState::Reconnecting
        }
    }

    pub fn on_open(&mut self) {
        self.phase = FeedPhase::Open;
        self.reconnect_attempt = 0;
    }

    /// Returns the delay before the next connect, or `None` when the session
    /// ends here.
    pub fn on_close(&mut self, kind: CloseKind) -> Option<Duration> {
        match kind {
            CloseKind::Normal => {
                self.phase = FeedPhase::Idle;
                self.reconnect_attempt = 0;
                None
            }
            CloseKind::Abnormal => {
                self.phase = FeedPhase::Closed;
                self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
                Some(reconnect_delay(
                    self.reconnect_attempt,
                    self.base_delay_ms,
                    self.max_delay_ms,
                ))
            }
        }
    }
}

pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64, jitter_ms: u64) -> Duration {
    let exponent = attempt.min(RECONNECT_MAX_EXPONENT);
    let backoff_ms = base_ms.saturating_mul(1_u64 << exponent);
    Duration::from_millis(backoff_ms.saturating_add(jitter_ms).min(max_ms))
}

pub fn reconnect_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let jitter_ms = now_unix_ms().unsigned_abs() % RECONNECT_JITTER_MS;
    backoff_delay(attempt, base_ms, max_ms, jitter_ms)
}

fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    Connecting { attempt: u32, state: FeedConnectionState },
    Open,
    Closed {
        reason: String,
        retry_in: Option<Duration>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatestLoadMode {
    /// First load for the key; replaces the series.
    Replace,
    /// After skipped ticks; merges without dropping scrolled-back history.
    CatchUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchRequest {
    Book {
        key: BookKey,
        limit: u16,
    },
    Latest {
        id: u64,
        key: SeriesKey,
        limit: u16,
        mode: LatestLoadMode,
    },
    Older(BackfillRequest),
}

/// Everything the consumer loop receives from the transport and fetch tasks.
#[derive(Debug)]
pub enum FeedInbound {
    Transport(TransportEvent),
    Message(FeedMessage),
    BookLoaded {
        key: BookKey,
        result: Result<(Vec<Offer>, Vec<Offer>), AppError>,
    },
    LatestLoaded {
        id: u64,
        key: SeriesKey,
        limit: u16,
        mode: LatestLoadMode,
        result: Result<Vec<RawCandle>, AppError>,
    },
    OlderLoaded {
        request: BackfillRequest,
        result: Result<Vec<RawCandle>, AppError>,
    },
}

/// Requests from the command surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeedCommand {
    Viewport(VisibleRange),
    LoadMore,
}

#[derive(Debug, Default, PartialEq)]
pub struct EngineEffects {
    pub publish_book: bool,
    pub publish_candles: bool,
    pub publish_status: bool,
    pub fetches: Vec<FetchRequest>,
}

impl EngineEffects {
    fn merge(&mut self, other: EngineEffects) {
        self.publish_book |= other.publish_book;
        self.publish_candles |= other.publish_candles;
        self.publish_status |= other.publish_status;
        self.fetches.extend(other.fetches);
    }

    fn status() -> Self {
        Self {
            publish_status: true,
            ..Self::default()
        }
    }
}

/// A failed latest-page load waiting for its backoff. `due` is set on the
/// first throttle tick after the failure.
#[derive(Debug, Clone, Copy)]
struct LatestRetry {
    mode: LatestLoadMode,
    delay: Duration,
    due: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct PendingLatest {
    id: u64,
    /// Ticks dropped before the request went out; the page covers them.
    covers_dropped: u64,
}

pub struct MarketEngine {
    topic: FeedTopic,
    history_limit: u16,
    book_limit: u16,
    retry_base_delay_ms: u64,
    retry_max_delay_ms: u64,
    book: OrderBookState,
    throttle: BookThrottle,
    candles: CandleStore,
    backfill: BackfillLoader,
    zoom: ZoomGate,
    connection: FeedConnectionState,
    reconnect_attempt: u32,
    reason: Option<String>,
    dropped_ticks: u64,
    next_latest_id: u64,
    pending_latest: Option<PendingLatest>,
    latest_failures: u32,
    latest_retry: Option<LatestRetry>,
    has_opened: bool,
}

impl MarketEngine {
    pub fn new(config: &MarketFeedConfig) -> Self {
        let mut candles = CandleStore::new();
        if let FeedTopic::Candles(key) = &config.topic {
            candles.activate(key.clone());
        }

        Self {
            topic: config.topic.clone(),
            history_limit: config.history_limit,
            book_limit: config.book_limit,
            retry_base_delay_ms: config.reconnect_base_delay_ms,
            retry_max_delay_ms: config.max_reconnect_delay_ms,
            book: OrderBookState::new(config.cumulative_order),
            throttle: BookThrottle::new(),
            candles,
            backfill: BackfillLoader::new(config.page_size),
            zoom: ZoomGate::new(
                config.zoom_edge_threshold,
                config.load_more_threshold,
                Duration::from_millis(config.zoom_quiet_period_ms),
            ),
            connection: FeedConnectionState::Idle,
            reconnect_attempt: 0,
            reason: None,
            dropped_ticks: 0,
            next_latest_id: 0,
            pending_latest: None,
            latest_failures: 0,
            latest_retry: None,
            has_opened: false,
        }
    }

    pub fn topic(&self) -> &FeedTopic {
        &self.topic
    }

    pub fn candle_store(&self) -> &CandleStore {
        &self.candles
    }

    pub fn is_zoomed(&self) -> bool {
        self.zoom.is_zoomed()
    }

    pub fn dropped_ticks(&self) -> u64 {
        self.dropped_ticks
    }

    pub fn book_snapshot(&self) -> OrderBookSnapshot {
        self.book.snapshot()
    }

    pub fn candle_view(&self) -> CandleSeriesView {
        self.candles.view()
    }

    pub fn status(&self) -> MarketFeedStatusSnapshot {
        let (has_more, loaded) = match &self.topic {
            FeedTopic::Candles(key) => (self.candles.has_more(key), self.candles.is_loaded(key)),
            FeedTopic::OrderBook(_) => (false, true),
        };
        MarketFeedStatusSnapshot {
            state: self.connection,
            topic: self.topic.label(),
            is_live: self.connection == FeedConnectionState::Live
                && !self.zoom.is_zoomed()
                && loaded,
            has_more,
            is_loading_more: self.backfill.is_loading(),
            is_zoomed: self.zoom.is_zoomed(),
            reconnect_attempt: self.reconnect_attempt,
            dropped_ticks: self.dropped_ticks,
            reason: self.reason.clone(),
        }
    }

    /// Fetches issued when the session starts, before the feed connects.
    pub fn bootstrap(&mut self) -> Vec<FetchRequest> {
        match self.topic.clone() {
            FeedTopic::OrderBook(key) => vec![FetchRequest::Book {
                key,
                limit: self.book_limit,
            }],
            FeedTopic::Candles(key) => vec![self.latest_request(key, LatestLoadMode::Replace)],
        }
    }

    fn latest_request(&mut self, key: SeriesKey, mode: LatestLoadMode) -> FetchRequest {
        self.next_latest_id = self.next_latest_id.wrapping_add(1);
        self.pending_latest = Some(PendingLatest {
            id: self.next_latest_id,
            covers_dropped: self.dropped_ticks,
        });
        self.latest_retry = None;
        FetchRequest::Latest {
            id: self.next_latest_id,
            key,
            limit: self.history_limit,
            mode,
        }
    }

    pub fn handle_inbound(&mut self, inbound: FeedInbound) -> EngineEffects {
        match inbound {
            FeedInbound::Transport(event) => self.on_transport(event),
            FeedInbound::Message(message) => self.on_message(message),
            FeedInbound::BookLoaded { key, result } => self.on_book_loaded(key, result),
            FeedInbound::LatestLoaded {
                id,
                key,
                limit,
                mode,
                result,
            } => self.on_latest_loaded(id, key, limit, mode, result),
            FeedInbound::OlderLoaded { request, result } => self.on_older_loaded(request, result),
        }
    }

    pub fn handle_command(&mut self, command: FeedCommand, now: Instant) -> EngineEffects {
        match command {
            FeedCommand::Viewport(range) => {
                let signal = self.zoom.on_visible_range(range, self.candles.len(), now);
                let mut effects = EngineEffects::default();
                if let Some(zoomed) = signal.zoom_changed {
                    effects.merge(self.on_zoom_changed(zoomed));
                }
                if signal.load_more {
                    effects.merge(self.request_older());
                }
                effects
            }
            FeedCommand::LoadMore => self.request_older(),
        }
    }

    /// Runs on the book throttle tick: drains pending book sides and resolves
    /// a debounced return to the live edge.
    pub fn on_tick(&mut self, now: Instant) -> EngineEffects {
        let mut effects = EngineEffects::default();

        let drained = self.throttle.drain();
        if let Some(bids) = drained.bids {
            self.book.apply_side(BookSide::Bid, &bids);
            effects.publish_book = true;
        }
        if let Some(asks) = drained.asks {
            self.book.apply_side(BookSide::Ask, &asks);
            effects.publish_book = true;
        }

        if let Some(zoomed) = self.zoom.poll(now) {
            effects.merge(self.on_zoom_changed(zoomed));
        }
        effects.fetches.extend(self.retry_latest(now));
        effects
    }

    /// Reissues a failed latest-page load once its backoff has elapsed.
    fn retry_latest(&mut self, now: Instant) -> Option<FetchRequest> {
        let FeedTopic::Candles(key) = &self.topic else {
            return None;
        };
        if self.pending_latest.is_some() || self.zoom.is_zoomed() {
            return None;
        }
        let retry = self.latest_retry.as_mut()?;
        let due = *retry.due.get_or_insert(now + retry.delay);
        if now < due {
            return None;
        }
        let (key, mode) = (key.clone(), retry.mode);
        debug!(?mode, attempt = self.latest_failures, "retrying candle history load");
        Some(self.latest_request(key, mode))
    }

    /// Drops the series and the book when the session ends.
    pub fn shutdown(&mut self) -> EngineEffects {
        if let FeedTopic::Candles(key) = &self.topic {
            self.candles.clear(key);
        }
        self.book.clear();
        self.throttle.clear();
        self.backfill.cancel();
        self.zoom.reset();
        self.pending_latest = None;
        self.latest_retry = None;
        EngineEffects {
            publish_book: true,
            publish_candles: true,
            ..EngineEffects::default()
        }
    }

    fn on_transport(&mut self, event: TransportEvent) -> EngineEffects {
        let mut effects = EngineEffects::status();
        match event {
            TransportEvent::Connecting { attempt, state } => {
                self.connection = state;
                self.reconnect_attempt = attempt;
                self.reason = if attempt == 0 {
                    Some("opening feed".to_string())
                } else {
                    Some(format!("reconnect attempt {attempt}"))
                };
            }
            TransportEvent::Open => {
                self.connection = FeedConnectionState::Live;
                self.reconnect_attempt = 0;
                self.reason = Some("feed connected".to_string());
                if self.has_opened {
                    effects.fetches.extend(self.resync_request());
                }
                self.has_opened = true;
            }
            TransportEvent::Closed { reason, retry_in } => {
                self.connection = if retry_in.is_some() {
                    FeedConnectionState::Reconnecting
                } else {
                    FeedConnectionState::Stopped
                };
                self.reason = Some(reason);
            }
        }
        effects
    }

    /// After a reconnect the feed may have skipped updates.
    fn resync_request(&mut self) -> Option<FetchRequest> {
        match self.topic.clone() {
            FeedTopic::OrderBook(key) => Some(FetchRequest::Book {
                key,
                limit: self.book_limit,
            }),
            FeedTopic::Candles(key) if !self.zoom.is_zoomed() => {
                Some(self.latest_request(key, LatestLoadMode::CatchUp))
            }
            FeedTopic::Candles(_) => None,
        }
    }

    fn on_message(&mut self, message: FeedMessage) -> EngineEffects {
        match message {
            FeedMessage::OrderBook { side, offers }
                if matches!(self.topic, FeedTopic::OrderBook(_)) =>
            {
                if self.throttle.push(side, offers) {
                    debug!(?side, "superseded pending book update");
                }
                EngineEffects::default()
            }
            FeedMessage::Candle(tick) if matches!(self.topic, FeedTopic::Candles(_)) => {
                self.on_candle_tick(&tick)
            }
            FeedMessage::Pong => EngineEffects::default(),
            message => {
                debug!(?message, topic = %self.topic.label(), "ignoring message for another topic");
                EngineEffects::default()
            }
        }
    }

    fn on_candle_tick(&mut self, tick: &CandleTick) -> EngineEffects {
        let FeedTopic::Candles(key) = self.topic.clone() else {
            return EngineEffects::default();
        };
        if self.zoom.is_zoomed() {
            self.dropped_ticks = self.dropped_ticks.saturating_add(1);
            return EngineEffects::default();
        }

        let outcome = self.candles.upsert_live(&key, tick);
        let mut effects = EngineEffects {
            publish_candles: outcome.changed(),
            ..EngineEffects::default()
        };
        if outcome == UpsertOutcome::NotLoaded && self.pending_latest.is_none() {
            debug!("live tick before history; reloading");
            effects.publish_status = true;
            effects
                .fetches
                .push(self.latest_request(key, LatestLoadMode::Replace));
        }
        effects
    }

    fn on_book_loaded(
        &mut self,
        key: BookKey,
        result: Result<(Vec<Offer>, Vec<Offer>), AppError>,
    ) -> EngineEffects {
        if self.topic != FeedTopic::OrderBook(key) {
            return EngineEffects::default();
        }

        match result {
            Ok((bids, asks)) => {
                let bid_rows = self.book.apply_side(BookSide::Bid, &bids);
                let ask_rows = self.book.apply_side(BookSide::Ask, &asks);
                debug!(bid_rows, ask_rows, "order book snapshot loaded");
                EngineEffects {
                    publish_book: true,
                    ..EngineEffects::default()
                }
            }
            Err(error) => {
                warn!(%error, "order book snapshot failed");
                self.reason = Some(format!("order book unavailable: {error}"));
                EngineEffects::status()
            }
        }
    }

    fn on_latest_loaded(
        &mut self,
        id: u64,
        key: SeriesKey,
        limit: u16,
        mode: LatestLoadMode,
        result: Result<Vec<RawCandle>, AppError>,
    ) -> EngineEffects {
        let Some(pending) = self.pending_latest.filter(|pending| pending.id == id) else {
            debug!(id, "dropping superseded candle load");
            return EngineEffects::default();
        };
        self.pending_latest = None;

        let page = match result {
            Ok(page) => page,
            Err(error) => {
                self.latest_failures = self.latest_failures.saturating_add(1);
                let delay = backoff_delay(
                    self.latest_failures,
                    self.retry_base_delay_ms,
                    self.retry_max_delay_ms,
                    0,
                );
                let mode = if self.candles.is_loaded(&key) {
                    LatestLoadMode::CatchUp
                } else {
                    LatestLoadMode::Replace
                };
                self.latest_retry = Some(LatestRetry {
                    mode,
                    delay,
                    due: None,
                });
                warn!(%error, key = ?key, delay_ms = delay.as_millis() as u64, "candle history load failed");
                self.reason = Some(format!("candle history unavailable: {error}"));
                return EngineEffects::status();
            }
        };

        let outcome = match mode {
            LatestLoadMode::Replace => self.candles.bulk_load(&key, &page),
            LatestLoadMode::CatchUp => self.candles.catch_up(&key, &page),
        };
        let MergeOutcome::Applied { applied, rejected } = outcome else {
            return EngineEffects::default();
        };
        self.latest_failures = 0;
        self.dropped_ticks = self.dropped_ticks.saturating_sub(pending.covers_dropped);
        if mode == LatestLoadMode::Replace && page.len() < usize::from(limit) {
            self.candles.set_has_more(&key, false);
        }
        info!(applied, rejected, ?mode, "candle history applied");

        EngineEffects {
            publish_candles: true,
            publish_status: true,
            ..EngineEffects::default()
        }
    }

    fn on_older_loaded(
        &mut self,
        request: BackfillRequest,
        result: Result<Vec<RawCandle>, AppError>,
    ) -> EngineEffects {
        match result {
            Ok(page) => match self.backfill.complete(&mut self.candles, &request, &page) {
                BackfillOutcome::Merged { applied, .. } => EngineEffects {
                    publish_candles: applied > 0,
                    publish_status: true,
                    ..EngineEffects::default()
                },
                BackfillOutcome::Stale => EngineEffects::default(),
            },
            Err(error) => {
                if !self.backfill.fail(&request) {
                    return EngineEffects::default();
                }
                warn!(%error, "older candle page failed");
                self.reason = Some(format!("older candles unavailable: {error}"));
                EngineEffects::status()
            }
        }
    }

    fn on_zoom_changed(&mut self, zoomed: bool) -> EngineEffects {
        let mut effects = EngineEffects::status();
        if zoomed {
            debug!("viewport left the live edge");
            return effects;
        }

        debug!(dropped = self.dropped_ticks, "viewport returned to the live edge");
        if let FeedTopic::Candles(key) = self.topic.clone() {
            if (self.dropped_ticks > 0 || !self.candles.is_loaded(&key))
                && self.pending_latest.is_none()
            {
                effects
                    .fetches
                    .push(self.latest_request(key, LatestLoadMode::CatchUp));
            }
        }
        effects
    }

    fn request_older(&mut self) -> EngineEffects {
        let FeedTopic::Candles(key) = &self.topic else {
            return EngineEffects::default();
        };
        match self.backfill.begin(&self.candles, key) {
            Some(request) => EngineEffects {
                publish_status: true,
                fetches: vec![FetchRequest::Older(request)],
                ..EngineEffects::default()
            },
            None => EngineEffects::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::numeric::WireNumber;
    use crate::market::order_book::CumulativeOrder;
    use crate::market::types::{Asset, Resolution};

    fn series_key() -> SeriesKey {
        SeriesKey::new("XRP-USD", Resolution::M1, "USD")
    }

    fn book_key() -> BookKey {
        BookKey {
            base: Asset::native(),
            quote: Asset::issued("USD", "rIssuer"),
        }
    }

    fn candle_config() -> MarketFeedConfig {
        MarketFeedConfig {
            topic: FeedTopic::Candles(series_key()),
            history_limit: 3,
            page_size: 2,
            zoom_quiet_period_ms: 400,
            ..MarketFeedConfig::default()
        }
    }

    fn book_config() -> MarketFeedConfig {
        MarketFeedConfig {
            topic: FeedTopic::OrderBook(book_key()),
            ..MarketFeedConfig::default()
        }
    }

    fn raw(time_s: i64) -> RawCandle {
        RawCandle::from_values(time_s * 1_000, 1.0, 2.0, 0.5, 1.5, 1.0)
    }

    fn tick(time_s: i64, close: f64) -> FeedMessage {
        FeedMessage::Candle(CandleTick {
            time: time_s * 1_000,
            open: WireNumber::Number(1.0),
            high: WireNumber::Number(close.max(2.0)),
            low: WireNumber::Number(0.5),
            close: WireNumber::Number(close),
            volume: WireNumber::Number(1.0),
        })
    }

    fn bid(sequence: u64, quality: f64) -> Offer {
        Offer {
            account: "rMaker".to_string(),
            sequence,
            taker_gets_currency: "USD".to_string(),
            taker_gets_issuer: Some("rIssuer".to_string()),
            taker_gets_amount: WireNumber::Number(10.0),
            taker_pays_currency: "EUR".to_string(),
            taker_pays_issuer: Some("rOther".to_string()),
            taker_pays_amount: WireNumber::Number(10.0),
            quality: WireNumber::Number(quality),
            funded_gets: None,
            funded_pays: None,
        }
    }

    fn loaded_engine(times_s: &[i64]) -> MarketEngine {
        let mut engine = MarketEngine::new(&candle_config());
        let fetches = engine.bootstrap();
        let Some(FetchRequest::Latest { id, key, limit, mode }) = fetches.into_iter().next() else {
            panic!("expected a latest candle request");
        };
        engine.handle_inbound(FeedInbound::LatestLoaded {
            id,
            key,
            limit,
            mode,
            result: Ok(times_s.iter().map(|time| raw(*time)).collect()),
        });
        engine
    }

    fn times(engine: &MarketEngine) -> Vec<i64> {
        engine
            .candle_view()
            .candles
            .iter()
            .map(|candle| candle.time)
            .collect()
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1, 200, 5_000, 0), Duration::from_millis(400));
        assert_eq!(backoff_delay(3, 200, 5_000, 10), Duration::from_millis(1_610));
        assert_eq!(backoff_delay(6, 200, 5_000, 0), Duration::from_millis(5_000));
        assert_eq!(backoff_delay(30, 200, 60_000, 0), Duration::from_millis(12_800));
    }

    #[test]
    fn lifecycle_reconnects_only_after_abnormal_close() {
        let mut lifecycle = FeedLifecycle::new(200, 5_000);
        assert_eq!(lifecycle.phase(), FeedPhase::Idle);
        assert_eq!(lifecycle.on_connecting(), FeedConnectionState::Connecting);
        lifecycle.on_open();
        assert_eq!(lifecycle.phase(), FeedPhase::Open);

        let retry = lifecycle.on_close(CloseKind::Abnormal);
        assert!(retry.is_some_and(|delay| delay <= Duration::from_millis(5_000)));
        assert_eq!(lifecycle.phase(), FeedPhase::Closed);
        assert_eq!(lifecycle.on_connecting(), FeedConnectionState::Reconnecting);
        assert_eq!(lifecycle.reconnect_attempt(), 1);

        lifecycle.on_open();
        assert_eq!(lifecycle.reconnect_attempt(), 0);
        assert_eq!(lifecycle.on_close(CloseKind::Normal), None);
        assert_eq!(lifecycle.phase(), FeedPhase::Idle);
    }

    #[test]
    fn bootstrap_requests_full_history_for_candles() {
        let mut engine = MarketEngine::new(&candle_config());
        let fetches = engine.bootstrap();
        assert!(matches!(
            fetches.as_slice(),
            [FetchRequest::Latest {
                limit: 3,
                mode: LatestLoadMode::Replace,
                ..
            }]
        ));
    }

    #[test]
    fn short_initial_load_disables_paging() {
        let engine = loaded_engine(&[100, 200]);
        assert!(!engine.status().has_more);

        let engine = loaded_engine(&[100, 200, 300]);
        assert!(engine.status().has_more);
    }

    #[test]
    fn live_ticks_apply_immediately_when_not_zoomed() {
        let mut engine = loaded_engine(&[100, 200, 300]);

        let effects = engine.handle_inbound(FeedInbound::Message(tick(300, 3.0)));
        assert!(effects.publish_candles);
        assert_eq!(times(&engine), vec![100, 200, 300]);

        engine.handle_inbound(FeedInbound::Message(tick(400, 4.0)));
        assert_eq!(times(&engine), vec![100, 200, 300, 400]);
    }

    #[test]
    fn zoomed_viewport_drops_ticks_then_catches_up() {
        let mut engine = loaded_engine(&[100, 200, 300]);
        let start = Instant::now();

        let zoom_in = engine.handle_command(
            FeedCommand::Viewport(VisibleRange { from: 0.5, to: 0.5 }),
            start,
        );
        assert!(zoom_in.publish_status);
        assert!(engine.is_zoomed());

        let dropped = engine.handle_inbound(FeedInbound::Message(tick(400, 4.0)));
        assert!(!dropped.publish_candles);
        assert_eq!(engine.dropped_ticks(), 1);
        assert_eq!(times(&engine), vec![100, 200, 300]);

        engine.handle_command(
            FeedCommand::Viewport(VisibleRange { from: 1.0, to: 2.5 }),
            start,
        );
        assert!(engine.is_zoomed());

        let settled = engine.on_tick(start + Duration::from_millis(400));
        assert!(!engine.is_zoomed());
        let Some(FetchRequest::Latest { id, key, limit, mode }) =
            settled.fetches.into_iter().next()
        else {
            panic!("expected a catch-up request");
        };
        assert_eq!(mode, LatestLoadMode::CatchUp);

        engine.handle_inbound(FeedInbound::LatestLoaded {
            id,
            key,
            limit,
            mode,
            result: Ok(vec![raw(300), raw(400)]),
        });
        assert_eq!(times(&engine), vec![100, 200, 300, 400]);
        assert_eq!(engine.dropped_ticks(), 0);
    }

    #[test]
    fn viewport_near_start_requests_older_page_once() {
        let mut engine = loaded_engine(&[100, 200, 300]);
        let now = Instant::now();

        let first = engine.handle_command(
            FeedCommand::Viewport(VisibleRange { from: 0.0, to: 2.5 }),
            now,
        );
        let Some(FetchRequest::Older(request)) = first.fetches.first().cloned() else {
            panic!("expected an older page request");
        };
        assert_eq!(request.before_ms, 100_000);
        assert!(engine.status().is_loading_more);

        let second = engine.handle_command(FeedCommand::LoadMore, now);
        assert!(second.fetches.is_empty());

        let applied = engine.handle_inbound(FeedInbound::OlderLoaded {
            request,
            result: Ok(vec![raw(0), raw(50)]),
        });
        assert!(applied.publish_candles);
        assert_eq!(times(&engine), vec![0, 50, 100, 200, 300]);
        assert!(!engine.status().is_loading_more);
    }

    #[test]
    fn superseded_latest_load_is_ignored() {
        let mut engine = MarketEngine::new(&candle_config());
        let first = engine.bootstrap();
        let _second = engine.bootstrap();
        let Some(FetchRequest::Latest { id, key, limit, mode }) = first.into_iter().next() else {
            panic!("expected a latest candle request");
        };

        let effects = engine.handle_inbound(FeedInbound::LatestLoaded {
            id,
            key,
            limit,
            mode,
            result: Ok(vec![raw(100)]),
        });
        assert_eq!(effects, EngineEffects::default());
        assert!(times(&engine).is_empty());
    }

    #[test]
    fn book_updates_are_throttled_latest_wins() {
        let mut engine = MarketEngine::new(&book_config());
        engine.handle_inbound(FeedInbound::Message(FeedMessage::OrderBook {
            side: BookSide::Bid,
            offers: vec![bid(1, 2.0)],
        }));
        let pending = engine.handle_inbound(FeedInbound::Message(FeedMessage::OrderBook {
            side: BookSide::Bid,
            offers: vec![bid(2, 4.0)],
        }));
        assert!(!pending.publish_book);
        assert!(engine.book_snapshot().bids.is_empty());

        let drained = engine.on_tick(Instant::now());
        assert!(drained.publish_book);
        let snapshot = engine.book_snapshot();
        assert_eq!(snapshot.bids.len(), 1);
        assert_eq!(snapshot.bids[0].id, "rMaker:2");
        assert_eq!(snapshot.bids[0].price, 0.25);

        assert!(!engine.on_tick(Instant::now()).publish_book);
    }

    #[test]
    fn book_snapshot_for_other_key_is_ignored() {
        let mut engine = MarketEngine::new(&book_config());
        let other = BookKey {
            base: Asset::native(),
            quote: Asset::issued("EUR", "rIssuer"),
        };
        let effects = engine.handle_inbound(FeedInbound::BookLoaded {
            key: other,
            result: Ok((vec![bid(1, 2.0)], Vec::new())),
        });
        assert!(!effects.publish_book);
        assert!(engine.book_snapshot().bids.is_empty());
    }

    #[test]
    fn shutdown_discards_series() {
        let mut engine = loaded_engine(&[100, 200, 300]);
        let effects = engine.shutdown();
        assert!(effects.publish_candles);
        let view = engine.candle_view();
        assert!(view.key.is_none());
        assert!(view.candles.is_empty());
    }

    #[test]
    fn candle_ticks_are_ignored_on_book_topic() {
        let mut engine = MarketEngine::new(&book_config());
        let effects = engine.handle_inbound(FeedInbound::Message(tick(100, 1.0)));
        assert_eq!(effects, EngineEffects::default());
    }

    #[test]
    fn reconnect_resyncs_book_snapshot() {
        let mut engine = MarketEngine::new(&book_config());
        let first_open = engine.handle_inbound(FeedInbound::Transport(TransportEvent::Open));
        assert!(first_open.fetches.is_empty());
        assert!(engine.status().is_live);

        engine.handle_inbound(FeedInbound::Transport(TransportEvent::Closed {
            reason: "connection reset".to_string(),
            retry_in: Some(Duration::from_millis(400)),
        }));
        assert_eq!(engine.status().state, FeedConnectionState::Reconnecting);

        let reopened = engine.handle_inbound(FeedInbound::Transport(TransportEvent::Open));
        assert!(matches!(
            reopened.fetches.as_slice(),
            [FetchRequest::Book { .. }]
        ));
    }

    fn only_latest(fetches: Vec<FetchRequest>) -> (u64, SeriesKey, u16, LatestLoadMode) {
        match fetches.as_slice() {
            [FetchRequest::Latest {
                id,
                key,
                limit,
                mode,
            }] => (*id, key.clone(), *limit, *mode),
            other => panic!("expected one latest candle request, got {other:?}"),
        }
    }

    fn fail_latest(engine: &mut MarketEngine, fetches: Vec<FetchRequest>) {
        let (id, key, limit, mode) = only_latest(fetches);
        engine.handle_inbound(FeedInbound::LatestLoaded {
            id,
            key,
            limit,
            mode,
            result: Err(AppError::MalformedData("upstream unavailable".to_string())),
        });
    }

    #[test]
    fn failed_bootstrap_load_retries_after_backoff() {
        let mut engine = MarketEngine::new(&candle_config());
        let bootstrap = engine.bootstrap();
        fail_latest(&mut engine, bootstrap);
        engine.handle_inbound(FeedInbound::Transport(TransportEvent::Open));
        assert!(!engine.status().is_live);

        let start = Instant::now();
        assert!(engine.on_tick(start).fetches.is_empty());
        assert!(engine
            .on_tick(start + Duration::from_millis(399))
            .fetches
            .is_empty());

        let retried = engine.on_tick(start + Duration::from_millis(400));
        let (id, key, limit, mode) = only_latest(retried.fetches);
        assert_eq!(mode, LatestLoadMode::Replace);
        assert!(engine
            .on_tick(start + Duration::from_millis(800))
            .fetches
            .is_empty());

        engine.handle_inbound(FeedInbound::LatestLoaded {
            id,
            key,
            limit,
            mode,
            result: Ok(vec![raw(100), raw(200), raw(300)]),
        });
        assert_eq!(times(&engine), vec![100, 200, 300]);
        assert!(engine.status().is_live);
    }

    #[test]
    fn live_tick_before_history_requests_reload() {
        let mut engine = MarketEngine::new(&candle_config());
        let bootstrap = engine.bootstrap();
        fail_latest(&mut engine, bootstrap);
        engine.handle_inbound(FeedInbound::Transport(TransportEvent::Open));

        let first = engine.handle_inbound(FeedInbound::Message(tick(300, 3.0)));
        let (id, key, limit, mode) = only_latest(first.fetches);
        assert_eq!(mode, LatestLoadMode::Replace);

        let second = engine.handle_inbound(FeedInbound::Message(tick(300, 3.5)));
        assert!(second.fetches.is_empty());

        engine.handle_inbound(FeedInbound::LatestLoaded {
            id,
            key,
            limit,
            mode,
            result: Ok(vec![raw(100), raw(200), raw(300)]),
        });
        let applied = engine.handle_inbound(FeedInbound::Message(tick(400, 4.0)));
        assert!(applied.publish_candles);
        assert!(applied.fetches.is_empty());
        assert_eq!(times(&engine), vec![100, 200, 300, 400]);
    }

    #[test]
    fn failed_catch_up_keeps_dropped_ticks_until_applied() {
        let mut engine = loaded_engine(&[100, 200, 300]);
        let start = Instant::now();
        engine.handle_command(
            FeedCommand::Viewport(VisibleRange { from: 0.5, to: 0.5 }),
            start,
        );
        engine.handle_inbound(FeedInbound::Message(tick(400, 4.0)));
        engine.handle_inbound(FeedInbound::Message(tick(500, 5.0)));
        engine.handle_command(
            FeedCommand::Viewport(VisibleRange { from: 1.0, to: 2.5 }),
            start,
        );

        let settled = engine.on_tick(start + Duration::from_millis(400));
        fail_latest(&mut engine, settled.fetches);
        assert_eq!(engine.dropped_ticks(), 2);

        let armed_at = start + Duration::from_millis(500);
        assert!(engine.on_tick(armed_at).fetches.is_empty());
        let retried = engine.on_tick(armed_at + Duration::from_millis(400));
        let (id, key, limit, mode) = only_latest(retried.fetches);
        assert_eq!(mode, LatestLoadMode::CatchUp);

        engine.handle_inbound(FeedInbound::LatestLoaded {
            id,
            key,
            limit,
            mode,
            result: Ok(vec![raw(300), raw(400), raw(500)]),
        });
        assert_eq!(engine.dropped_ticks(), 0);
        assert_eq!(times(&engine), vec![100, 200, 300, 400, 500]);
    }

    #[test]
    fn display_order_totals_follow_sorted_rows() {
        let offers = vec![bid(1, 4.0), bid(2, 2.0)];

        let mut sweep = MarketEngine::new(&book_config());
        sweep.handle_inbound(FeedInbound::BookLoaded {
            key: book_key(),
            result: Ok((offers.clone(), Vec::new())),
        });
        let mut display = MarketEngine::new(&MarketFeedConfig {
            cumulative_order: CumulativeOrder::Display,
            ..book_config()
        });
        display.handle_inbound(FeedInbound::BookLoaded {
            key: book_key(),
            result: Ok((offers, Vec::new())),
        });

        let sweep_top = &sweep.book_snapshot().bids[0];
        let display_top = &display.book_snapshot().bids[0];
        assert_eq!(sweep_top.id, "rMaker:2");
        assert_eq!(display_top.id, "rMaker:2");
        assert_eq!(sweep_top.cumulative_amount, 20.0);
        assert_eq!(display_top.cumulative_amount, 10.0);
    }

    #[test]
    fn failed_history_load_is_reported_in_status() {
        let mut engine = MarketEngine::new(&candle_config());
        let Some(FetchRequest::Latest { id, key, limit, mode }) =
            engine.bootstrap().into_iter().next()
        else {
            panic!("expected a latest candle request");
        };

        let effects = engine.handle_inbound(FeedInbound::LatestLoaded {
            id,
            key,
            limit,
            mode,
            result: Err(AppError::MalformedData("bad page".to_string())),
        });
        assert!(effects.publish_status);
        assert!(engine
            .status()
            .reason
            .is_some_and(|reason| reason.contains("bad page")));
    }
}
