//! Seams between the connection state machine and the outside world.
//!
//! The manager never touches a socket or a clock directly. A driver owns the
//! event loop, calls the manager's handlers with [`Notification`]s, and
//! supplies a [`Transport`] and a [`ReconnectTimer`].

use std::time::Duration;

use crate::error::WsError;

/// Lifecycle and data notifications fed into the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The transport finished its handshake.
    Open,
    /// A text frame arrived.
    Message(String),
    /// The transport closed, for any reason.
    Close { code: Option<u16>, reason: String },
    /// The transport reported an error. Handled as a close.
    Error(String),
    /// The reconnect timer fired.
    ReconnectDue,
}

/// A push-channel connection primitive.
///
/// `open` starts an asynchronous connection attempt; its outcome arrives later
/// as `Open`, `Error` or `Close`. Only one connection is live at a time.
pub trait Transport {
    /// Begin connecting to `url`. An `Err` means the connection could not
    /// even be constructed.
    fn open(&mut self, url: &str) -> Result<(), WsError>;

    /// Transmit one text frame on the live connection.
    fn send(&mut self, text: &str) -> Result<(), WsError>;

    /// Detach notification delivery for the live connection, then close it.
    /// No notification for that connection may reach the manager afterwards.
    fn close(&mut self);
}

/// A single-shot timer that produces [`Notification::ReconnectDue`].
///
/// `cancel` is only ever called while a schedule is pending.
pub trait ReconnectTimer {
    fn schedule(&mut self, delay: Duration);
    fn cancel(&mut self);
}
