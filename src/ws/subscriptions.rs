//! Subscription registry — the desired state, independent of the connection.

use crate::shared::Ticker;

/// The set of tickers the consumer currently wants updates for.
///
/// Unique, enumerable in insertion order. Never cleared by a disconnect:
/// on every (re)connect the manager replays the whole set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionRegistry {
    tickers: Vec<Ticker>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tickers(tickers: impl IntoIterator<Item = Ticker>) -> Self {
        let mut registry = Self::new();
        registry.add(tickers);
        registry
    }

    /// Add each ticker not already present. Returns how many were new.
    pub fn add(&mut self, tickers: impl IntoIterator<Item = Ticker>) -> usize {
        let before = self.tickers.len();
        for ticker in tickers {
            if !self.tickers.contains(&ticker) {
                tracing::debug!("Tracking subscription: {}", ticker);
                self.tickers.push(ticker);
            }
        }
        self.tickers.len() - before
    }

    /// Remove each ticker present. Returns how many were removed.
    pub fn remove<'a>(&mut self, tickers: impl IntoIterator<Item = &'a Ticker>) -> usize {
        let before = self.tickers.len();
        for ticker in tickers {
            self.tickers.retain(|t| t != ticker);
        }
        let removed = before - self.tickers.len();
        if removed > 0 {
            tracing::debug!("Removed {} subscription(s) from tracking", removed);
        }
        removed
    }

    pub fn contains(&self, ticker: &Ticker) -> bool {
        self.tickers.contains(ticker)
    }

    /// The full desired set, as replayed on (re)connect.
    pub fn current_set(&self) -> &[Ticker] {
        &self.tickers
    }

    pub fn len(&self) -> usize {
        self.tickers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::tickers;

    #[test]
    fn test_add_is_idempotent() {
        let mut registry = SubscriptionRegistry::new();
        assert_eq!(registry.add(tickers(["TCS"])), 1);
        assert_eq!(registry.add(tickers(["TCS"])), 0);
        assert_eq!(registry.current_set(), tickers(["TCS"]).as_slice());
    }

    #[test]
    fn test_duplicates_within_one_call() {
        let mut registry = SubscriptionRegistry::new();
        assert_eq!(registry.add(tickers(["TCS", "INFY", "TCS"])), 2);
        assert_eq!(registry.current_set(), tickers(["TCS", "INFY"]).as_slice());
    }

    #[test]
    fn test_remove_non_member_is_noop() {
        let mut registry = SubscriptionRegistry::with_tickers(tickers(["TCS"]));
        assert_eq!(registry.remove(&tickers(["WIPRO"])), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_net_effect_of_adds_and_removes() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(tickers(["TCS", "INFY", "HDFC"]));
        registry.remove(&tickers(["INFY"]));
        registry.add(tickers(["INFY", "WIPRO"]));
        registry.remove(&tickers(["HDFC", "RELIANCE"]));

        assert_eq!(
            registry.current_set(),
            tickers(["TCS", "INFY", "WIPRO"]).as_slice()
        );
        assert!(registry.contains(&Ticker::new("WIPRO")));
        assert!(!registry.contains(&Ticker::new("HDFC")));
    }
}
