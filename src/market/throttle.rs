use crate::market::types::{BookSide, Offer};

/// One pending offer list per book side. A newer push replaces the pending
/// list; the consumer drains both slots on its fixed tick.
#[derive(Debug, Default)]
pub struct BookThrottle {
    bids: Option<Vec<Offer>>,
    asks: Option<Vec<Offer>>,
    superseded: u64,
}

#[derive(Debug, Default, PartialEq)]
pub struct DrainedBook {
    pub bids: Option<Vec<Offer>>,
    pub asks: Option<Vec<Offer>>,
}

impl DrainedBook {
    pub fn is_empty(&self) -> bool {
        self.bids.is_none() && self.asks.is_none()
    }
}

impl BookThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when a pending list for the same side was discarded.
    pub fn push(&mut self, side: BookSide, offers: Vec<Offer>) -> bool {
        let slot = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        let replaced = slot.replace(offers).is_some();
        if replaced {
            self.superseded = self.superseded.saturating_add(1);
        }
        replaced
    }

    pub fn has_pending(&self) -> bool {
        self.bids.is_some() || self.asks.is_some()
    }

    pub fn drain(&mut self) -> DrainedBook {
        DrainedBook {
            bids: self.bids.take(),
            asks: self.asks.take(),
        }
    }

    pub fn clear(&mut self) {
        self.bids = None;
        self.asks = None;
    }

    pub fn superseded(&self) -> u64 {
        self.superseded
    }
}
