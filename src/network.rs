//! Endpoint URL constants and resolution.

use url::Url;

use crate::error::ConfigError;

/// Port the feed listens on when no override is given.
pub const DEFAULT_WS_PORT: u16 = 8000;

/// Path of the price stream endpoint.
pub const DEFAULT_WS_PATH: &str = "/api/ws/prices";

/// Default WebSocket URL (native builds have no page host to derive from).
pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000/api/ws/prices";

/// Environment variable overriding the endpoint.
///
/// Read at runtime on native; captured at build time for WASM.
pub const WS_URL_ENV: &str = "PRICE_STREAM_WS_URL";

/// Environment variable overriding the reconnect delay (milliseconds).
pub const RECONNECT_DELAY_ENV: &str = "PRICE_STREAM_RECONNECT_DELAY_MS";

/// Build the default endpoint for a given host.
pub fn ws_url_for_host(host: &str) -> String {
    format!("ws://{}:{}{}", host, DEFAULT_WS_PORT, DEFAULT_WS_PATH)
}

/// Pick the override if present and non-blank, otherwise the host-derived default.
pub fn resolve_ws_url(overridden: Option<&str>, host: &str) -> String {
    match overridden.map(str::trim) {
        Some(url) if !url.is_empty() => url.to_string(),
        _ => ws_url_for_host(host),
    }
}

/// Reject anything that is not a well-formed `ws://` or `wss://` URL with a host.
pub fn validate_ws_url(url: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidUrl(url.to_string());
    let parsed = Url::parse(url).map_err(|_| invalid())?;

    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(invalid());
    }
    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(invalid()),
    }
}
