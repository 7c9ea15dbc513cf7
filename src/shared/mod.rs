//! Shared newtypes and utilities.
//!
//! These types are serialization-transparent: they serialize/deserialize identically
//! to the raw format the feed sends, so they can be used directly in wire types
//! without conversion overhead.

pub mod price;

pub use price::{format_change, parse_change_percent};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;

// ─── Ticker ──────────────────────────────────────────────────────────────────

/// Newtype for ticker symbols (e.g. `"TCS"`, `"^NSEI"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticker(String);

impl Ticker {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Ticker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Ticker {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Ticker {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl FromStr for Ticker {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Ticker(s.to_string()))
    }
}

impl Serialize for Ticker {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Ticker {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Ticker(s))
    }
}

/// Convenience for building ticker lists from string literals.
pub fn tickers<I, S>(symbols: I) -> Vec<Ticker>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    symbols.into_iter().map(Ticker::new).collect()
}
