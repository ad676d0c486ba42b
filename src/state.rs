use crate::market::coordinator::FeedCommand;
use crate::market::ledger::FeedEndpoints;
use crate::market::pipeline::MarketViews;
use crate::market::types::{MarketFeedConfig, MarketFeedStatusSnapshot};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct MarketFeedHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
    pub command_tx: mpsc::Sender<FeedCommand>,
    pub views: MarketViews,
}

pub struct AppState {
    pub started_at: Instant,
    pub endpoints: FeedEndpoints,
    pub market_feed: Mutex<Option<MarketFeedHandle>>,
    pub market_status: Arc<RwLock<MarketFeedStatusSnapshot>>,
}

impl AppState {
    pub fn new(endpoints: FeedEndpoints) -> Self {
        let market_status = MarketFeedStatusSnapshot::stopped(
            MarketFeedConfig::default().topic.label(),
            Some("feed idle".to_string()),
        );

        Self {
            started_at: Instant::now(),
            endpoints,
            market_feed: Mutex::new(None),
            market_status: Arc::new(RwLock::new(market_status)),
        }
    }
}
