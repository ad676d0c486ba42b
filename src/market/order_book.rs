//! Depth table builder for ledger offers.
//!
//! Offers arrive in the ledger's natural fill order (best quality first as
//! seen by a taker sweeping the book). Running totals are accumulated in that
//! order and only then are the rows sorted for display, so
//! `cumulative_amount` on a row answers "how much liquidity is consumed
//! before and including this offer when the book is swept in fill order",
//! not "running total of the rows above it on screen". Callers that want the
//! second reading use [`CumulativeOrder::Display`].

use crate::error::AppError;
use crate::market::types::{BookSide, Offer};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

const DROPS_PER_UNIT: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CumulativeOrder {
    /// Totals follow input (fill) order; rows are sorted afterwards.
    #[default]
    Sweep,
    /// Totals follow the sorted display order.
    Display,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthLevel {
    pub id: String,
    pub price: f64,
    pub amount: f64,
    pub value: f64,
    pub cumulative_amount: f64,
    pub cumulative_value: f64,
    pub average_price: f64,
    pub is_new: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookSnapshot {
    /// Descending by price, best bid first.
    pub bids: Vec<DepthLevel>,
    /// Ascending by price, best ask first.
    pub asks: Vec<DepthLevel>,
    pub revision: u64,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|level| level.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|level| level.price)
    }

    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }
}

/// Drops scaling for an offer's quality.
pub fn drops_multiplier(offer: &Offer) -> f64 {
    if offer.gets_is_native() {
        DROPS_PER_UNIT
    } else if offer.pays_is_native() {
        1.0 / DROPS_PER_UNIT
    } else {
        1.0
    }
}

#[derive(Debug, Clone)]
struct PricedOffer {
    id: String,
    price: f64,
    amount: f64,
    value: f64,
}

fn price_offer(offer: &Offer, side: BookSide) -> Result<PricedOffer, AppError> {
    let multiplier = drops_multiplier(offer);
    let quality = offer.quality.to_f64()?;

    let (amount, price) = match side {
        BookSide::Bid => {
            let amount = offer
                .funded_pays
                .as_ref()
                .unwrap_or(&offer.taker_pays_amount)
                .to_f64()?;
            (amount, 1.0 / (quality * multiplier))
        }
        BookSide::Ask => {
            let amount = offer
                .funded_gets
                .as_ref()
                .unwrap_or(&offer.taker_gets_amount)
                .to_f64()?;
            (amount, quality * multiplier)
        }
    };

    if amount <= 0.0 {
        return Err(AppError::MalformedData(format!(
            "offer {} has no remaining amount",
            offer.id()
        )));
    }
    if !price.is_finite() || price <= 0.0 {
        return Err(AppError::MalformedData(format!(
            "offer {} has an unusable quality",
            offer.id()
        )));
    }

    Ok(PricedOffer {
        id: offer.id(),
        price,
        amount,
        value: amount * price,
    })
}

fn average_price(cumulative_value: f64, cumulative_amount: f64) -> f64 {
    if cumulative_amount == 0.0 {
        0.0
    } else {
        cumulative_value / cumulative_amount
    }
}

fn accumulate(levels: &mut [DepthLevel]) {
    let mut cumulative_amount = 0.0;
    let mut cumulative_value = 0.0;
    for level in levels.iter_mut() {
        cumulative_amount += level.amount;
        cumulative_value += level.value;
        level.cumulative_amount = cumulative_amount;
        level.cumulative_value = cumulative_value;
        level.average_price = average_price(cumulative_value, cumulative_amount);
    }
}

fn sort_for_side(levels: &mut [DepthLevel], side: BookSide) {
    match side {
        BookSide::Bid => levels.sort_by(|lhs, rhs| rhs.price.total_cmp(&lhs.price)),
        BookSide::Ask => levels.sort_by(|lhs, rhs| lhs.price.total_cmp(&rhs.price)),
    }
}

pub fn build_depth_levels(
    offers: &[Offer],
    side: BookSide,
    previous_levels: &[DepthLevel],
) -> Vec<DepthLevel> {
    build_depth_levels_with(offers, side, previous_levels, CumulativeOrder::Sweep)
}

pub fn build_depth_levels_with(
    offers: &[Offer],
    side: BookSide,
    previous_levels: &[DepthLevel],
    order: CumulativeOrder,
) -> Vec<DepthLevel> {
    let previous_ids: HashSet<&str> = previous_levels
        .iter()
        .map(|level| level.id.as_str())
        .collect();

    let mut levels: Vec<DepthLevel> = offers
        .iter()
        .filter_map(|offer| match price_offer(offer, side) {
            Ok(priced) => Some(priced),
            Err(error) => {
                debug!(%error, "dropping offer");
                None
            }
        })
        .map(|priced| DepthLevel {
            is_new: !previous_ids.contains(priced.id.as_str()),
            id: priced.id,
            price: priced.price,
            amount: priced.amount,
            value: priced.value,
            cumulative_amount: 0.0,
            cumulative_value: 0.0,
            average_price: 0.0,
        })
        .collect();

    match order {
        CumulativeOrder::Sweep => {
            accumulate(&mut levels);
            sort_for_side(&mut levels, side);
        }
        CumulativeOrder::Display => {
            sort_for_side(&mut levels, side);
            accumulate(&mut levels);
        }
    }

    levels
}

/// Latest depth per side; each side is rebuilt wholesale from its newest offer list.
#[derive(Debug, Clone, Default)]
pub struct OrderBookState {
    bids: Vec<DepthLevel>,
    asks: Vec<DepthLevel>,
    order: CumulativeOrder,
    revision: u64,
}

impl OrderBookState {
    pub fn new(order: CumulativeOrder) -> Self {
        Self {
            order,
            ..Self::default()
        }
    }

    /// Replaces one side and returns how many rows survived sanitising.
    pub fn apply_side(&mut self, side: BookSide, offers: &[Offer]) -> usize {
        let previous = match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        };
        let levels = build_depth_levels_with(offers, side, previous, self.order);
        let row_count = levels.len();
        match side {
            BookSide::Bid => self.bids = levels,
            BookSide::Ask => self.asks = levels,
        }
        self.revision = self.revision.saturating_add(1);
        row_count
    }

    pub fn snapshot(&self) -> OrderBookSnapshot {
        OrderBookSnapshot {
            bids: self.bids.clone(),
            asks: self.asks.clone(),
            revision: self.revision,
        }
    }

    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.revision = self.revision.saturating_add(1);
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}
