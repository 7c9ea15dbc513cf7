//! Unified error types.

use thiserror::Error;

/// Top-level crate error.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// WebSocket errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WsError {
    #[error("Not connected")]
    NotConnected,

    #[error("Client not started — call connect() first")]
    NotStarted,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connection closed: code={code:?} reason={reason}")]
    Closed { code: Option<u16>, reason: String },

    #[error("Internal channel closed")]
    ChannelClosed,

    #[error("Client is busy dispatching an event")]
    Busy,
}

/// Configuration errors, raised once at construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid WebSocket URL (expected ws:// or wss://): {0}")]
    InvalidUrl(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

#[cfg(feature = "ws-native")]
impl From<tokio_tungstenite::tungstenite::Error> for WsError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match err {
            Error::ConnectionClosed => WsError::Closed {
                code: Some(1000),
                reason: "Connection closed normally".to_string(),
            },
            Error::AlreadyClosed => WsError::NotConnected,
            Error::Http(resp) => {
                WsError::ConnectionFailed(format!("HTTP error: {:?}", resp.status()))
            }
            other => WsError::ConnectionFailed(other.to_string()),
        }
    }
}

#[cfg(feature = "ws-native")]
impl<T> From<tokio::sync::mpsc::error::TrySendError<T>> for WsError {
    fn from(err: tokio::sync::mpsc::error::TrySendError<T>) -> Self {
        match err {
            tokio::sync::mpsc::error::TrySendError::Full(_) => {
                WsError::SendFailed("Command channel full".into())
            }
            tokio::sync::mpsc::error::TrySendError::Closed(_) => WsError::ChannelClosed,
        }
    }
}
