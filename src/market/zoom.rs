use crate::market::types::VisibleRange;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoomSignal {
    /// `Some(state)` when the published zoom state flipped on this event.
    pub zoom_changed: Option<bool>,
    pub load_more: bool,
}

/// Debounced "is the consumer away from the live edge" flag.
///
/// Entering the zoomed state is published on the first viewport event that
/// leaves the edge. Leaving it requires the viewport to stay at the edge for
/// the whole quiet period, so a drag that brushes the edge does not flap.
#[derive(Debug)]
pub struct ZoomGate {
    edge_threshold: u32,
    load_more_threshold: u32,
    quiet_period: Duration,
    is_zoomed: bool,
    last_range: Option<VisibleRange>,
    at_edge_since: Option<Instant>,
}

impl ZoomGate {
    pub fn new(edge_threshold: u32, load_more_threshold: u32, quiet_period: Duration) -> Self {
        Self {
            edge_threshold,
            load_more_threshold,
            quiet_period,
            is_zoomed: false,
            last_range: None,
            at_edge_since: None,
        }
    }

    pub fn is_zoomed(&self) -> bool {
        self.is_zoomed
    }

    pub fn last_range(&self) -> Option<VisibleRange> {
        self.last_range
    }

    pub fn on_visible_range(
        &mut self,
        range: VisibleRange,
        series_len: usize,
        now: Instant,
    ) -> ZoomSignal {
        self.last_range = Some(range);

        let live_edge = series_len as f64 - f64::from(self.edge_threshold);
        let raw_zoomed = range.to < live_edge;

        let zoom_changed = if raw_zoomed {
            self.at_edge_since = None;
            if self.is_zoomed {
                None
            } else {
                self.is_zoomed = true;
                Some(true)
            }
        } else if self.is_zoomed {
            self.at_edge_since.get_or_insert(now);
            self.poll(now)
        } else {
            None
        };

        ZoomSignal {
            zoom_changed,
            load_more: series_len > 0 && range.from <= f64::from(self.load_more_threshold),
        }
    }

    /// Publishes the return to the live edge once the quiet period elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<bool> {
        let since = self.at_edge_since?;
        if !self.is_zoomed || now.saturating_duration_since(since) < self.quiet_period {
            return None;
        }
        self.is_zoomed = false;
        self.at_edge_since = None;
        Some(false)
    }

    pub fn reset(&mut self) {
        self.is_zoomed = false;
        self.last_range = None;
        self.at_edge_since = None;
    }
}
