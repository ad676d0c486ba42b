//! Canonical candle series for the active `(symbol, resolution, currency)` key.
//!
//! The store is the only writer of the series. It has three mutation paths,
//! and their effects never overlap: wholesale replace ([`CandleStore::bulk_load`]),
//! union-merge at the head ([`CandleStore::prepend_older`]) and replace-or-append
//! at the tail ([`CandleStore::upsert_live`]). [`CandleStore::catch_up`] applies
//! a refreshed latest page through the last two. Every path checks the active
//! key first, so a response that arrives after a key switch is a no-op.

use crate::market::types::{Candle, CandleTick, RawCandle, SeriesKey};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied { applied: usize, rejected: usize },
    Stale,
}

impl MergeOutcome {
    pub fn applied(self) -> usize {
        match self {
            Self::Applied { applied, .. } => applied,
            Self::Stale => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Same bucket as the last candle; the forming candle was replaced.
    Replaced,
    /// Newer bucket; appended.
    Appended,
    /// Older than the last candle; ignored.
    Late,
    /// Failed bounds or sign checks.
    Rejected,
    /// No bulk load has completed for the key yet.
    NotLoaded,
    Stale,
}

impl UpsertOutcome {
    pub fn changed(self) -> bool {
        matches!(self, Self::Replaced | Self::Appended)
    }
}

/// Read-only copy of the series handed to the renderer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleSeriesView {
    pub key: Option<SeriesKey>,
    pub candles: Vec<Candle>,
    pub has_more: bool,
    pub revision: u64,
}

#[derive(Debug, Clone)]
struct ActiveSeries {
    key: SeriesKey,
    candles: Vec<Candle>,
    loaded: bool,
    has_more: bool,
}

#[derive(Debug, Default)]
pub struct CandleStore {
    active: Option<ActiveSeries>,
    revision: u64,
}

/// Drops malformed candles, sorts by time and keeps the last candle per bucket.
fn sanitize_batch(raw: &[RawCandle]) -> (Vec<Candle>, usize) {
    let mut rejected = 0_usize;
    let mut candles: Vec<Candle> = raw
        .iter()
        .filter_map(|entry| match Candle::try_from(entry) {
            Ok(candle) => Some(candle),
            Err(error) => {
                rejected += 1;
                debug!(%error, "dropping candle");
                None
            }
        })
        .collect();

    candles.sort_by_key(|candle| candle.time);

    let mut deduped: Vec<Candle> = Vec::with_capacity(candles.len());
    for candle in candles {
        match deduped.last_mut() {
            Some(last) if last.time == candle.time => *last = candle,
            _ => deduped.push(candle),
        }
    }
    (deduped, rejected)
}

/// Set-union on `time`; `existing` wins on collision. Returns the merged
/// series and the number of timestamps only present in `incoming`.
fn union_by_time(existing: &[Candle], incoming: &[Candle]) -> (Vec<Candle>, usize) {
    let mut merged = Vec::with_capacity(existing.len() + incoming.len());
    let mut applied = 0_usize;
    let (mut lhs, mut rhs) = (0_usize, 0_usize);

    while lhs < existing.len() && rhs < incoming.len() {
        let (current, older) = (&existing[lhs], &incoming[rhs]);
        if current.time < older.time {
            merged.push(*current);
            lhs += 1;
        } else if older.time < current.time {
            merged.push(*older);
            applied += 1;
            rhs += 1;
        } else {
            merged.push(*current);
            lhs += 1;
            rhs += 1;
        }
    }
    merged.extend_from_slice(&existing[lhs..]);
    applied += incoming.len() - rhs;
    merged.extend_from_slice(&incoming[rhs..]);

    (merged, applied)
}

impl CandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `key` the active key. Any series held for another key is dropped.
    pub fn activate(&mut self, key: SeriesKey) {
        if self.is_active(&key) {
            return;
        }
        self.active = Some(ActiveSeries {
            has_more: !key.resolution.is_all_time(),
            key,
            candles: Vec::new(),
            loaded: false,
        });
        self.bump();
    }

    /// Destroys the series for `key` when the consumer unsubscribes.
    pub fn clear(&mut self, key: &SeriesKey) {
        if self.is_active(key) {
            self.active = None;
            self.bump();
        }
    }

    pub fn active_key(&self) -> Option<&SeriesKey> {
        self.active.as_ref().map(|series| &series.key)
    }

    pub fn is_active(&self, key: &SeriesKey) -> bool {
        self.active_key() == Some(key)
    }

    fn active_mut(&mut self, key: &SeriesKey) -> Option<&mut ActiveSeries> {
        self.active.as_mut().filter(|series| &series.key == key)
    }

    fn bump(&mut self) {
        self.revision = self.revision.saturating_add(1);
    }

    pub fn bulk_load(&mut self, key: &SeriesKey, raw: &[RawCandle]) -> MergeOutcome {
        let Some(series) = self.active_mut(key) else {
            debug!(key = ?key, "ignoring stale bulk load");
            return MergeOutcome::Stale;
        };

        let (candles, rejected) = sanitize_batch(raw);
        let applied = candles.len();
        series.candles = candles;
        series.loaded = true;
        series.has_more = !series.key.resolution.is_all_time();
        self.bump();

        MergeOutcome::Applied { applied, rejected }
    }

    pub fn prepend_older(&mut self, key: &SeriesKey, raw: &[RawCandle]) -> MergeOutcome {
        let Some(series) = self.active_mut(key) else {
            debug!(key = ?key, "ignoring stale history page");
            return MergeOutcome::Stale;
        };

        let (older, rejected) = sanitize_batch(raw);
        let (merged, applied) = union_by_time(&series.candles, &older);
        series.candles = merged;
        series.loaded = true;
        if applied > 0 {
            self.bump();
        }

        MergeOutcome::Applied { applied, rejected }
    }

    pub fn upsert_live(&mut self, key: &SeriesKey, tick: &CandleTick) -> UpsertOutcome {
        let Some(series) = self.active_mut(key) else {
            return UpsertOutcome::Stale;
        };
        if !series.loaded {
            return UpsertOutcome::NotLoaded;
        }

        let candle = match Candle::try_from(tick) {
            Ok(candle) => candle,
            Err(error) => {
                debug!(%error, "dropping live tick");
                return UpsertOutcome::Rejected;
            }
        };

        let outcome = match series.candles.last_mut() {
            Some(last) if candle.time < last.time => UpsertOutcome::Late,
            Some(last) if candle.time == last.time => {
                *last = candle;
                UpsertOutcome::Replaced
            }
            _ => {
                series.candles.push(candle);
                UpsertOutcome::Appended
            }
        };
        if outcome.changed() {
            self.bump();
        }
        outcome
    }

    /// Applies a freshly fetched latest page after ticks were skipped. Candles
    /// older than the current last one fill gaps without overwriting, the rest
    /// replace the forming candle or extend the tail. Falls back to a bulk load
    /// when nothing was loaded yet.
    pub fn catch_up(&mut self, key: &SeriesKey, raw: &[RawCandle]) -> MergeOutcome {
        if !self.is_active(key) {
            return MergeOutcome::Stale;
        }
        if !self.is_loaded(key) {
            return self.bulk_load(key, raw);
        }
        let Some(series) = self.active_mut(key) else {
            return MergeOutcome::Stale;
        };

        let (page, rejected) = sanitize_batch(raw);
        let last_time = series.candles.last().map(|candle| candle.time);
        let (older, tail): (Vec<Candle>, Vec<Candle>) = page
            .into_iter()
            .partition(|candle| last_time.is_some_and(|last| candle.time < last));

        let (merged, mut applied) = union_by_time(&series.candles, &older);
        series.candles = merged;
        let mut changed = applied > 0;
        for candle in tail {
            match series.candles.last_mut() {
                Some(last) if last.time == candle.time => {
                    changed |= *last != candle;
                    *last = candle;
                }
                _ => {
                    series.candles.push(candle);
                    applied += 1;
                    changed = true;
                }
            }
        }
        if changed {
            self.bump();
        }

        MergeOutcome::Applied { applied, rejected }
    }

    pub fn has_more(&self, key: &SeriesKey) -> bool {
        self.active
            .as_ref()
            .filter(|series| &series.key == key)
            .map(|series| series.loaded && series.has_more)
            .unwrap_or(false)
    }

    pub fn set_has_more(&mut self, key: &SeriesKey, has_more: bool) {
        if let Some(series) = self.active_mut(key) {
            if series.has_more != has_more {
                series.has_more = has_more;
                self.bump();
            }
        }
    }

    pub fn is_loaded(&self, key: &SeriesKey) -> bool {
        self.active
            .as_ref()
            .map(|series| &series.key == key && series.loaded)
            .unwrap_or(false)
    }

    pub fn candles(&self) -> &[Candle] {
        self.active
            .as_ref()
            .map(|series| series.candles.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.candles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles().is_empty()
    }

    pub fn earliest_time(&self) -> Option<i64> {
        self.candles().first().map(|candle| candle.time)
    }

    pub fn latest(&self) -> Option<&Candle> {
        self.candles().last()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn view(&self) -> CandleSeriesView {
        match self.active.as_ref() {
            Some(series) => CandleSeriesView {
                key: Some(series.key.clone()),
                candles: series.candles.clone(),
                has_more: series.loaded && series.has_more,
                revision: self.revision,
            },
            None => CandleSeriesView {
                revision: self.revision,
                ..CandleSeriesView::default()
            },
        }
    }
}
