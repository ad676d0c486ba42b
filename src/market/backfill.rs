use crate::error::AppError;
use crate::market::candle_store::{CandleStore, MergeOutcome};
use crate::market::types::{RawCandle, SeriesKey};
use async_trait::async_trait;
use tracing::{debug, info};

/// Anything that can serve a page of candles older than `before_ms`.
#[async_trait]
pub trait CandleHistorySource: Send + Sync {
    async fn fetch_candles(
        &self,
        key: &SeriesKey,
        bar_count: u16,
        before_ms: Option<i64>,
    ) -> Result<Vec<RawCandle>, AppError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillRequest {
    pub id: u64,
    pub key: SeriesKey,
    pub before_ms: i64,
    pub limit: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    Merged { applied: usize, has_more: bool },
    /// The request was superseded, cancelled or targets an inactive key.
    Stale,
}

/// Pages older history into the [`CandleStore`], one request at a time.
#[derive(Debug)]
pub struct BackfillLoader {
    page_size: u16,
    next_id: u64,
    in_flight: Option<u64>,
}

impl BackfillLoader {
    pub fn new(page_size: u16) -> Self {
        Self {
            page_size,
            next_id: 0,
            in_flight: None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Returns the next request, or `None` when a page is already in flight,
    /// the history is exhausted, the key is all-time or not loaded yet.
    pub fn begin(&mut self, store: &CandleStore, key: &SeriesKey) -> Option<BackfillRequest> {
        if self.in_flight.is_some() || key.resolution.is_all_time() || !store.has_more(key) {
            return None;
        }
        let earliest = store.earliest_time()?;

        self.next_id = self.next_id.wrapping_add(1);
        self.in_flight = Some(self.next_id);
        let request = BackfillRequest {
            id: self.next_id,
            key: key.clone(),
            before_ms: earliest.saturating_mul(1_000),
            limit: self.page_size,
        };
        debug!(id = request.id, before_ms = request.before_ms, "requesting older candles");
        Some(request)
    }

    pub fn complete(
        &mut self,
        store: &mut CandleStore,
        request: &BackfillRequest,
        page: &[RawCandle],
    ) -> BackfillOutcome {
        if self.in_flight != Some(request.id) {
            debug!(id = request.id, "dropping superseded history page");
            return BackfillOutcome::Stale;
        }
        self.in_flight = None;

        let applied = match store.prepend_older(&request.key, page) {
            MergeOutcome::Applied { applied, .. } => applied,
            MergeOutcome::Stale => return BackfillOutcome::Stale,
        };

        let exhausted = page.len() < usize::from(request.limit) || applied == 0;
        if exhausted {
            info!(key = ?request.key, "reached the start of candle history");
            store.set_has_more(&request.key, false);
        }

        BackfillOutcome::Merged {
            applied,
            has_more: !exhausted,
        }
    }

    /// Releases the in-flight token after a failed fetch. `has_more` is kept
    /// so the next trigger retries.
    pub fn fail(&mut self, request: &BackfillRequest) -> bool {
        if self.in_flight == Some(request.id) {
            self.in_flight = None;
            return true;
        }
        false
    }

    pub fn cancel(&mut self) {
        self.in_flight = None;
    }
}
