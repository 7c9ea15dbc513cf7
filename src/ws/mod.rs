//! WebSocket layer — messages, subscriptions, connection state machine, events.
//!
//! The connection logic lives in [`manager::ConnectionManager`] and is
//! transport-agnostic. The actual WS transport is compile-time dispatched:
//! - `ws-native` feature → `tokio-tungstenite` (native.rs)
//! - `ws-wasm` feature → `web-sys::WebSocket` (wasm.rs)
//!
//! Both export a `WsClient` with the same consumer surface.
//! This module defines the shared message/event/config types.

pub mod manager;
pub mod subscriptions;
pub mod transport;

#[cfg(feature = "ws-native")]
pub mod native;

#[cfg(feature = "ws-wasm")]
pub mod wasm;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::price::PriceUpdate;
use crate::error::ConfigError;
use crate::network::{self, RECONNECT_DELAY_ENV, WS_URL_ENV};
use crate::shared::Ticker;

pub use subscriptions::SubscriptionRegistry;

// ─── Outbound messages ───────────────────────────────────────────────────────

/// Messages sent from client to feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MessageOut {
    #[serde(rename = "SUBSCRIBE")]
    Subscribe(Vec<Ticker>),
    #[serde(rename = "UNSUBSCRIBE")]
    Unsubscribe(Vec<Ticker>),
}

impl MessageOut {
    pub fn tickers(&self) -> &[Ticker] {
        match self {
            MessageOut::Subscribe(t) | MessageOut::Unsubscribe(t) => t,
        }
    }
}

impl std::fmt::Display for MessageOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => Err(std::fmt::Error),
        }
    }
}

// ─── Inbound messages ────────────────────────────────────────────────────────

/// Inbound message from the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageIn {
    #[serde(rename = "PRICE_UPDATE")]
    PriceUpdate { data: Vec<PriceUpdate> },
    /// Any other `type` (heartbeats, `PONG`, future kinds) — ignored.
    #[serde(other)]
    Unrecognized,
}

// ─── WsEvent ─────────────────────────────────────────────────────────────────

/// Events emitted to the consumer: connection state changes and price batches.
#[derive(Debug, Clone, PartialEq)]
pub enum WsEvent {
    /// Connection established (subscriptions have been replayed).
    Connected,
    /// Connection lost; a reconnect is scheduled.
    Disconnected { code: Option<u16>, reason: String },
    /// One `PRICE_UPDATE` batch, verbatim and in arrival order.
    Prices(Vec<PriceUpdate>),
}

// ─── Connection state ────────────────────────────────────────────────────────

/// Lifecycle of the single logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Connecting = 1,
    Open = 2,
    Closed = 3,
    Disposed = 4,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Open,
            3 => ConnectionState::Closed,
            _ => ConnectionState::Disposed,
        }
    }
}

// ─── Config ──────────────────────────────────────────────────────────────────

/// Configuration for the WS client.
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    /// Fixed delay before each reconnect attempt. No backoff, no retry cap.
    pub reconnect_delay_ms: u64,
    /// Upper bound on the native handshake; expiry counts as a failed attempt.
    /// Browsers bound the handshake themselves.
    pub connect_timeout_ms: u64,
    /// Tickers the registry starts with.
    pub initial_tickers: Vec<Ticker>,
    pub event_channel_capacity: usize,
    pub command_channel_capacity: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: network::DEFAULT_WS_URL.to_string(),
            reconnect_delay_ms: 5_000,
            connect_timeout_ms: 30_000,
            initial_tickers: Vec::new(),
            event_channel_capacity: 256,
            command_channel_capacity: 64,
        }
    }
}

impl WsConfig {
    /// Default config pointed at `url`, validated.
    pub fn new(url: impl Into<String>) -> Result<Self, ConfigError> {
        let url = url.into();
        network::validate_ws_url(&url)?;
        Ok(Self {
            url,
            ..Default::default()
        })
    }

    /// Read `PRICE_STREAM_WS_URL` and `PRICE_STREAM_RECONNECT_DELAY_MS`
    /// from the process environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url_override = std::env::var(WS_URL_ENV).ok();
        let delay = std::env::var(RECONNECT_DELAY_ENV).ok();
        Self::from_overrides(url_override.as_deref(), delay.as_deref(), "127.0.0.1")
    }

    /// Build from optional string overrides and the host to derive the default URL from.
    pub fn from_overrides(
        url_override: Option<&str>,
        reconnect_delay_ms: Option<&str>,
        host: &str,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::new(network::resolve_ws_url(url_override, host))?;

        if let Some(raw) = reconnect_delay_ms.map(str::trim).filter(|s| !s.is_empty()) {
            config.reconnect_delay_ms =
                raw.parse().map_err(|_| ConfigError::InvalidValue {
                    name: RECONNECT_DELAY_ENV,
                    value: raw.to_string(),
                })?;
        }
        Ok(config)
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_initial_tickers(mut self, tickers: Vec<Ticker>) -> Self {
        self.initial_tickers = tickers;
        self
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
