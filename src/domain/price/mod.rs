//! Price domain — live price records delivered by the feed.

pub mod state;

use serde::{Deserialize, Serialize};

use crate::shared::price::{format_change, parse_change_percent, round2};
use crate::shared::Ticker;
use rust_decimal::Decimal;

pub use state::PriceBoard;

/// One entry of a `PRICE_UPDATE` batch.
///
/// Transient in the connection core: it is decoded, handed to the consumer
/// and not retained. Retention is up to the app (see [`PriceBoard`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub ticker: Ticker,
    pub price: f64,
    /// Formatted delta, e.g. `"+1.2%"`.
    pub change: String,
    pub positive: bool,
}

impl PriceUpdate {
    pub fn new(
        ticker: impl Into<Ticker>,
        price: f64,
        change: impl Into<String>,
        positive: bool,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            price,
            change: change.into(),
            positive,
        }
    }

    /// Build a record from a last trade price and the previous close,
    /// formatted the way the feed formats it.
    pub fn from_quote(ticker: impl Into<Ticker>, last: f64, previous_close: f64) -> Self {
        let (change, positive) = format_change(last, previous_close);
        Self {
            ticker: ticker.into(),
            price: round2(last),
            change,
            positive,
        }
    }

    /// The change as a decimal percentage, if the display string parses.
    pub fn change_percent(&self) -> Option<Decimal> {
        parse_change_percent(&self.change)
    }
}
