pub mod commands;
pub mod error;
pub mod market;
pub mod state;

use commands::market_feed::{
    market_feed_status, market_feed_views, start_market_feed, stop_market_feed,
};
use error::AppError;
use market::ledger::FeedEndpoints;
use market::order_book::CumulativeOrder;
use market::types::{FeedKind, Resolution, StartMarketFeedArgs};
use state::AppState;
use std::env;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::info;

const STATUS_LOG_INTERVAL_MS: u64 = 5_000;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Reads the startup topic from `LEDGER_FEED_*` variables; unset fields keep
/// their defaults.
pub fn start_args_from_env() -> Result<StartMarketFeedArgs, AppError> {
    let kind = match env_value("LEDGER_FEED_KIND").as_deref() {
        None | Some("candles") => FeedKind::Candles,
        Some("orderbook") => FeedKind::OrderBook,
        Some(other) => {
            return Err(AppError::InvalidArgument(format!(
                "LEDGER_FEED_KIND must be 'candles' or 'orderbook', got '{other}'"
            )))
        }
    };
    let resolution = env_value("LEDGER_FEED_RESOLUTION")
        .map(|value| Resolution::parse_str(&value))
        .transpose()?;
    let cumulative_order = match env_value("LEDGER_FEED_CUMULATIVE_ORDER").as_deref() {
        None => None,
        Some("sweep") => Some(CumulativeOrder::Sweep),
        Some("display") => Some(CumulativeOrder::Display),
        Some(other) => {
            return Err(AppError::InvalidArgument(format!(
                "LEDGER_FEED_CUMULATIVE_ORDER must be 'sweep' or 'display', got '{other}'"
            )))
        }
    };

    Ok(StartMarketFeedArgs {
        kind: Some(kind),
        symbol_id: env_value("LEDGER_FEED_SYMBOL"),
        resolution,
        currency: env_value("LEDGER_FEED_CURRENCY"),
        base_currency: env_value("LEDGER_FEED_BASE_CURRENCY"),
        base_issuer: env_value("LEDGER_FEED_BASE_ISSUER"),
        quote_currency: env_value("LEDGER_FEED_QUOTE_CURRENCY"),
        quote_issuer: env_value("LEDGER_FEED_QUOTE_ISSUER"),
        cumulative_order,
        ..StartMarketFeedArgs::default()
    })
}

async fn log_feed_summary(state: &AppState) -> Result<(), AppError> {
    let status = market_feed_status(state).await?;
    let Some(views) = market_feed_views(state).await else {
        return Ok(());
    };
    let candles = views.candles.borrow().candles.len();
    let (best_bid, best_ask) = {
        let book = views.order_book.borrow();
        (book.best_bid(), book.best_ask())
    };
    info!(
        state = ?status.state,
        topic = %status.topic,
        candles,
        ?best_bid,
        ?best_ask,
        has_more = status.has_more,
        zoomed = status.is_zoomed,
        reconnect_attempt = status.reconnect_attempt,
        reason = status.reason.as_deref().unwrap_or(""),
        "market feed status"
    );
    Ok(())
}

pub fn run() -> Result<(), AppError> {
    init_logging();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let state = AppState::new(FeedEndpoints::from_env());
        let session = start_market_feed(&state, Some(start_args_from_env()?)).await?;
        info!(topic = %session.topic.label(), "market feed running, ctrl-c to stop");

        let mut ticker = tokio::time::interval(Duration::from_millis(STATUS_LOG_INTERVAL_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    break;
                }
                _ = ticker.tick() => log_feed_summary(&state).await?,
            }
        }

        let stop = stop_market_feed(&state).await?;
        info!(
            stopped = stop.stopped,
            uptime_s = state.started_at.elapsed().as_secs(),
            "shutting down"
        );
        Ok::<(), AppError>(())
    })
}
