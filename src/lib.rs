//! # price-stream
//!
//! A real-time market price subscription client supporting both native and WASM targets.
//!
//! ## Architecture
//!
//! The crate is organized in layers:
//!
//! 1. **Core** — Tickers, price records, price formatting (always available, WASM-safe)
//! 2. **Connection state machine** — `ConnectionManager` + `SubscriptionRegistry`,
//!    transport-agnostic and driven by notifications
//! 3. **Transports** — Compile-time dispatch: `tokio-tungstenite` (native) / `web-sys` (WASM)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use price_stream::prelude::*;
//!
//! let mut client = WsClient::new(WsConfig::from_env()?);
//! client.subscribe(vec![Ticker::new("TCS"), Ticker::new("INFY")])?;
//! client.connect().await?;
//!
//! let mut batches = client.price_batches();
//! while let Some(batch) = batches.next().await {
//!     for update in batch {
//!         println!("{} {} {}", update.ticker, update.price, update.change);
//!     }
//! }
//! ```

// ── Layer 1: Core ────────────────────────────────────────────────────────────

/// Shared newtypes and price utilities.
pub mod shared;

/// Domain types and app-owned state containers.
pub mod domain;

/// Unified error types.
pub mod error;

/// Endpoint URL constants and resolution.
pub mod network;

// ── Layers 2–3: WebSocket ────────────────────────────────────────────────────

/// WebSocket client: messages, subscriptions, connection state machine, transports.
pub mod ws;

// ── Prelude ──────────────────────────────────────────────────────────────────

pub mod prelude {
    // Shared newtypes
    pub use crate::shared::Ticker;
    pub use crate::shared::price::{format_change, parse_change_percent};

    // Domain types
    pub use crate::domain::price::{PriceBoard, PriceUpdate};

    // Errors
    pub use crate::error::{ConfigError, StreamError, WsError};

    // Network
    pub use crate::network::{DEFAULT_WS_URL, WS_URL_ENV};

    // WebSocket core
    pub use crate::ws::manager::ConnectionManager;
    pub use crate::ws::subscriptions::SubscriptionRegistry;
    pub use crate::ws::transport::{Notification, ReconnectTimer, Transport};
    pub use crate::ws::{ConnectionState, MessageIn, MessageOut, WsConfig, WsEvent};

    #[cfg(feature = "ws-native")]
    pub use crate::ws::native::WsClient;

    #[cfg(all(feature = "ws-wasm", not(feature = "ws-native")))]
    pub use crate::ws::wasm::WsClient;
}
