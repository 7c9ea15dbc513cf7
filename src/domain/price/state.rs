//! Price state containers — app-owned, crate-provided update logic.

use super::PriceUpdate;
use crate::shared::Ticker;
use std::collections::HashMap;

/// Latest known price per ticker, folded from `PRICE_UPDATE` batches.
///
/// The connection core never retains updates; the app owns instances of this
/// type if it wants a watchlist view. A later batch supersedes earlier prices.
#[derive(Debug, Clone, Default)]
pub struct PriceBoard {
    prices: HashMap<Ticker, PriceUpdate>,
    batches_applied: u64,
}

impl PriceBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one batch in delivery order. Within a batch, the last record
    /// for a ticker wins.
    pub fn apply_batch(&mut self, batch: &[PriceUpdate]) {
        for update in batch {
            self.prices.insert(update.ticker.clone(), update.clone());
        }
        self.batches_applied += 1;
    }

    pub fn get(&self, ticker: &Ticker) -> Option<&PriceUpdate> {
        self.prices.get(ticker)
    }

    /// Drop tickers the app no longer watches.
    pub fn retain_tickers(&mut self, keep: &[Ticker]) {
        self.prices.retain(|ticker, _| keep.contains(ticker));
    }

    /// Snapshot sorted by ticker, for stable rendering.
    pub fn sorted(&self) -> Vec<&PriceUpdate> {
        let mut rows: Vec<_> = self.prices.values().collect();
        rows.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        rows
    }

    pub fn batches_applied(&self) -> u64 {
        self.batches_applied
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn clear(&mut self) {
        self.prices.clear();
    }
}
