use crate::error::AppError;
use crate::market::coordinator::FeedCommand;
use crate::market::pipeline::{market_views, run_market_feed, MarketViews, StatusPublisher};
use crate::market::types::{
    MarketFeedSession, MarketFeedStatusSnapshot, MarketFeedStopResult, StartMarketFeedArgs,
    VisibleRange,
};
use crate::market::COMMAND_CHANNEL_CAPACITY;
use crate::state::{AppState, MarketFeedHandle};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

async fn take_running_feed(state: &AppState) -> bool {
    let existing_handle = {
        let mut feed_slot = state.market_feed.lock().await;
        feed_slot.take()
    };

    match existing_handle {
        Some(handle) => {
            handle.cancellation_token.cancel();
            let _ = handle.join_handle.await;
            true
        }
        None => false,
    }
}

/// Starts a feed session for the requested topic. A running session is
/// cancelled and awaited first, so results for the old key never reach the
/// new engine.
pub async fn start_market_feed(
    state: &AppState,
    args: Option<StartMarketFeedArgs>,
) -> Result<MarketFeedSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;

    if take_running_feed(state).await {
        info!("replaced running market feed");
    }

    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();
    let status = StatusPublisher::new(Arc::clone(&state.market_status));
    let (publishers, views) = market_views();
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let runtime_config = config.clone();
    let endpoints = state.endpoints.clone();

    let join_handle = tokio::spawn(async move {
        run_market_feed(
            runtime_config,
            endpoints,
            status,
            publishers,
            command_rx,
            task_token,
        )
        .await;
    });

    {
        let mut feed_slot = state.market_feed.lock().await;
        *feed_slot = Some(MarketFeedHandle {
            cancellation_token,
            join_handle,
            command_tx,
            views,
        });
    }

    Ok(MarketFeedSession::from_config(&config))
}

pub async fn stop_market_feed(state: &AppState) -> Result<MarketFeedStopResult, AppError> {
    let stopped = take_running_feed(state).await;

    {
        let topic = state.market_status.read().await.topic.clone();
        let mut writable = state.market_status.write().await;
        *writable =
            MarketFeedStatusSnapshot::stopped(topic, Some("feed stopped by command".to_string()));
    }

    Ok(MarketFeedStopResult { stopped })
}

pub async fn market_feed_status(state: &AppState) -> Result<MarketFeedStatusSnapshot, AppError> {
    let snapshot = state.market_status.read().await.clone();
    Ok(snapshot)
}

/// Snapshot receivers of the running session, if any.
pub async fn market_feed_views(state: &AppState) -> Option<MarketViews> {
    let feed_slot = state.market_feed.lock().await;
    feed_slot.as_ref().map(|handle| handle.views.clone())
}

async fn send_command(state: &AppState, command: FeedCommand) -> Result<(), AppError> {
    let command_tx = {
        let feed_slot = state.market_feed.lock().await;
        feed_slot
            .as_ref()
            .map(|handle| handle.command_tx.clone())
            .ok_or(AppError::ChannelClosed("market feed is not running"))?
    };

    command_tx
        .send(command)
        .await
        .map_err(|_| AppError::ChannelClosed("market feed commands"))
}

pub async fn viewport_changed(state: &AppState, range: VisibleRange) -> Result<(), AppError> {
    if !range.from.is_finite() || !range.to.is_finite() || range.from > range.to {
        return Err(AppError::InvalidArgument(
            "visible range must be finite with from <= to".to_string(),
        ));
    }
    send_command(state, FeedCommand::Viewport(range)).await
}

pub async fn load_more_history(state: &AppState) -> Result<(), AppError> {
    send_command(state, FeedCommand::LoadMore).await
}
