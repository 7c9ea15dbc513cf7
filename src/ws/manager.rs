//! Connection state machine + subscription registry.
//!
//! `Idle → Connecting → Open → Closed → Connecting (after delay) → …`, with a
//! final `Disposed` on teardown. Every failure funnels into one close path,
//! which schedules exactly one reconnect after a fixed delay. On each open the
//! full desired set is replayed as a single `SUBSCRIBE`, so messages dropped
//! while disconnected never need to be queued.

use std::time::Duration;

use crate::shared::Ticker;
use crate::ws::subscriptions::SubscriptionRegistry;
use crate::ws::transport::{Notification, ReconnectTimer, Transport};
use crate::ws::{ConnectionState, MessageIn, MessageOut, WsConfig, WsEvent};

/// Owns one logical connection, the reconnect timer, and the desired set.
///
/// Single-threaded and non-blocking: the driver serializes consumer calls,
/// transport notifications and timer expiry onto `&mut self`.
pub struct ConnectionManager<T, R, F> {
    url: String,
    reconnect_delay: Duration,
    state: ConnectionState,
    registry: SubscriptionRegistry,
    transport: T,
    timer: R,
    reconnect_pending: bool,
    on_event: F,
}

impl<T, R, F> ConnectionManager<T, R, F>
where
    T: Transport,
    R: ReconnectTimer,
    F: FnMut(WsEvent),
{
    /// The endpoint is taken from `config` once and never re-resolved.
    pub fn new(config: &WsConfig, transport: T, timer: R, on_event: F) -> Self {
        Self {
            url: config.url.clone(),
            reconnect_delay: config.reconnect_delay(),
            state: ConnectionState::Idle,
            registry: SubscriptionRegistry::with_tickers(config.initial_tickers.iter().cloned()),
            transport,
            timer,
            reconnect_pending: false,
            on_event,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_open()
    }

    pub fn current_set(&self) -> &[Ticker] {
        self.registry.current_set()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn timer(&self) -> &R {
        &self.timer
    }

    // ── Consumer operations ───────────────────────────────────────────────

    /// Start a connection attempt. No-op while connecting, open or disposed.
    pub fn connect(&mut self) {
        match self.state {
            ConnectionState::Disposed => {
                tracing::warn!("connect() after dispose, ignoring");
                return;
            }
            ConnectionState::Connecting | ConnectionState::Open => {
                tracing::debug!("Already connected or connecting, skipping");
                return;
            }
            ConnectionState::Idle | ConnectionState::Closed => {}
        }

        self.cancel_reconnect();
        self.state = ConnectionState::Connecting;
        tracing::info!("Connecting to price stream at {}", self.url);

        if let Err(e) = self.transport.open(&self.url) {
            tracing::error!("Failed to create WebSocket: {}", e);
            self.state = ConnectionState::Closed;
            self.schedule_reconnect();
        }
    }

    /// Add tickers to the desired set; if open, send an incremental `SUBSCRIBE`
    /// for exactly `tickers`.
    pub fn subscribe(&mut self, tickers: Vec<Ticker>) {
        if tickers.is_empty() {
            return;
        }
        self.registry.add(tickers.iter().cloned());
        self.send_subscribe(tickers);
    }

    /// Remove tickers from the desired set; if open, send an incremental
    /// `UNSUBSCRIBE` for exactly `tickers`.
    pub fn unsubscribe(&mut self, tickers: Vec<Ticker>) {
        if tickers.is_empty() {
            return;
        }
        self.registry.remove(&tickers);
        self.send_unsubscribe(tickers);
    }

    /// Tear down: detach and close the transport, cancel the timer.
    /// Safe from any state; later notifications are ignored.
    pub fn dispose(&mut self) {
        if self.state == ConnectionState::Disposed {
            return;
        }
        let was_open = self.state.is_open();
        self.state = ConnectionState::Disposed;

        self.transport.close();
        self.cancel_reconnect();
        tracing::info!("Price stream disposed");

        if was_open {
            self.emit(WsEvent::Disconnected {
                code: Some(1000),
                reason: "Client disposed".into(),
            });
        }
    }

    // ── Notifications ─────────────────────────────────────────────────────

    pub fn notify(&mut self, notification: Notification) {
        match notification {
            Notification::Open => self.handle_open(),
            Notification::Message(text) => self.handle_message(&text),
            Notification::Close { code, reason } => self.handle_close(code, reason),
            Notification::Error(reason) => self.handle_error(reason),
            Notification::ReconnectDue => self.handle_reconnect_due(),
        }
    }

    fn handle_open(&mut self) {
        if self.state != ConnectionState::Connecting {
            tracing::debug!("Ignoring open notification in state {:?}", self.state);
            return;
        }

        tracing::info!("Price stream connected");
        self.state = ConnectionState::Open;
        self.cancel_reconnect();

        if !self.registry.is_empty() {
            tracing::info!(
                "Resubscribing to {} tracked ticker(s)",
                self.registry.len()
            );
            let full_set = self.registry.current_set().to_vec();
            self.send_subscribe(full_set);
        }

        self.emit(WsEvent::Connected);
    }

    fn handle_message(&mut self, text: &str) {
        if !self.state.is_open() {
            tracing::debug!("Ignoring frame in state {:?}", self.state);
            return;
        }

        match serde_json::from_str::<MessageIn>(text) {
            Ok(MessageIn::PriceUpdate { data }) => self.emit(WsEvent::Prices(data)),
            Ok(MessageIn::Unrecognized) => {
                tracing::trace!("Ignoring unrecognized frame: {}", text);
            }
            Err(e) => {
                tracing::warn!("Error parsing price update: {} — raw: {}", e, text);
            }
        }
    }

    fn handle_error(&mut self, reason: String) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Open => {
                tracing::error!("Price stream WebSocket error: {}", reason);
                self.handle_close(None, reason);
            }
            _ => tracing::debug!("Ignoring transport error in state {:?}", self.state),
        }
    }

    /// The single close path: open/error/close failures all end up here.
    fn handle_close(&mut self, code: Option<u16>, reason: String) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Open => {}
            ConnectionState::Closed => {
                tracing::debug!("Already closed, ignoring duplicate close");
                return;
            }
            ConnectionState::Idle | ConnectionState::Disposed => return,
        }

        let was_open = self.state.is_open();
        self.transport.close();
        self.state = ConnectionState::Closed;
        tracing::info!(
            "Price stream disconnected: code={:?}, reason={}",
            code,
            reason
        );

        if was_open {
            self.emit(WsEvent::Disconnected { code, reason });
        }
        self.schedule_reconnect();
    }

    fn handle_reconnect_due(&mut self) {
        if !self.reconnect_pending {
            tracing::debug!("Stale reconnect timer, ignoring");
            return;
        }
        self.reconnect_pending = false;
        tracing::info!("Reconnect timeout fired");
        self.connect();
    }

    // ── Wire ──────────────────────────────────────────────────────────────

    fn send_subscribe(&mut self, tickers: Vec<Ticker>) {
        self.send(&MessageOut::Subscribe(tickers));
    }

    fn send_unsubscribe(&mut self, tickers: Vec<Ticker>) {
        self.send(&MessageOut::Unsubscribe(tickers));
    }

    /// Transmit if open; otherwise drop. The next open replays the full set.
    fn send(&mut self, message: &MessageOut) {
        if !self.state.is_open() {
            tracing::debug!(
                "Not connected (state: {:?}), dropping {}",
                self.state,
                message
            );
            return;
        }

        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("Failed to serialize message: {}", e);
                return;
            }
        };
        if let Err(e) = self.transport.send(&json) {
            tracing::warn!("Failed to send message ({}): {}", json, e);
        }
    }

    // ── Reconnection ──────────────────────────────────────────────────────

    fn schedule_reconnect(&mut self) {
        if self.reconnect_pending {
            tracing::debug!("Reconnect already scheduled, skipping");
            return;
        }
        tracing::info!(
            "Scheduling reconnect in {}ms",
            self.reconnect_delay.as_millis()
        );
        self.timer.schedule(self.reconnect_delay);
        self.reconnect_pending = true;
    }

    fn cancel_reconnect(&mut self) {
        if self.reconnect_pending {
            self.timer.cancel();
            self.reconnect_pending = false;
        }
    }

    fn emit(&mut self, event: WsEvent) {
        (self.on_event)(event);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::price::PriceUpdate;
    use crate::error::WsError;
    use crate::shared::tickers;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct FakeTransport {
        opened: Vec<String>,
        sent: Vec<String>,
        closes: usize,
        live: bool,
        fail_open: bool,
    }

    impl Transport for FakeTransport {
        fn open(&mut self, url: &str) -> Result<(), WsError> {
            if self.fail_open {
                return Err(WsError::ConnectionFailed("refused".into()));
            }
            self.opened.push(url.to_string());
            self.live = true;
            Ok(())
        }

        fn send(&mut self, text: &str) -> Result<(), WsError> {
            assert!(self.live, "send on a dead transport");
            self.sent.push(text.to_string());
            Ok(())
        }

        fn close(&mut self) {
            self.live = false;
            self.closes += 1;
        }
    }

    #[derive(Default)]
    struct FakeTimer {
        scheduled: Vec<Duration>,
        cancels: usize,
        pending: bool,
    }

    impl ReconnectTimer for FakeTimer {
        fn schedule(&mut self, delay: Duration) {
            assert!(!self.pending, "second timer scheduled while one is pending");
            self.scheduled.push(delay);
            self.pending = true;
        }

        fn cancel(&mut self) {
            assert!(self.pending, "cancel without a pending timer");
            self.cancels += 1;
            self.pending = false;
        }
    }

    type Events = Rc<RefCell<Vec<WsEvent>>>;
    type TestManager = ConnectionManager<FakeTransport, FakeTimer, Box<dyn FnMut(WsEvent)>>;

    fn manager_with(config: WsConfig) -> (TestManager, Events) {
        let events: Events = Rc::default();
        let sink = Rc::clone(&events);
        let manager = ConnectionManager::new(
            &config,
            FakeTransport::default(),
            FakeTimer::default(),
            Box::new(move |e: WsEvent| sink.borrow_mut().push(e)) as Box<dyn FnMut(WsEvent)>,
        );
        (manager, events)
    }

    fn manager() -> (TestManager, Events) {
        manager_with(WsConfig::default())
    }

    fn subscribe_json(symbols: &[&str]) -> String {
        MessageOut::Subscribe(tickers(symbols.iter().copied())).to_string()
    }

    /// Simulate the timer expiring.
    fn fire_timer(m: &mut TestManager) {
        m.timer.pending = false;
        m.notify(Notification::ReconnectDue);
    }

    fn close() -> Notification {
        Notification::Close {
            code: Some(1006),
            reason: "abnormal".into(),
        }
    }

    const PRICE_FRAME: &str = r#"{"type":"PRICE_UPDATE","data":[{"ticker":"TCS","price":3500,"change":"+1.2%","positive":true}]}"#;

    #[test]
    fn test_full_set_replayed_once_on_open() {
        let (mut m, events) = manager();
        m.subscribe(tickers(["TCS", "INFY"]));
        m.connect();
        assert!(m.transport().sent.is_empty());

        m.notify(Notification::Open);
        assert_eq!(m.transport().sent, vec![subscribe_json(&["TCS", "INFY"])]);
        assert!(m.is_connected());
        assert_eq!(*events.borrow(), vec![WsEvent::Connected]);
    }

    #[test]
    fn test_open_with_empty_set_sends_nothing() {
        let (mut m, _) = manager();
        m.connect();
        m.notify(Notification::Open);
        assert!(m.transport().sent.is_empty());
    }

    #[test]
    fn test_net_effect_while_disconnected() {
        let (mut m, _) = manager();
        m.subscribe(tickers(["TCS", "INFY", "HDFC"]));
        m.unsubscribe(tickers(["INFY"]));
        m.subscribe(tickers(["WIPRO", "TCS"]));
        m.unsubscribe(tickers(["RELIANCE"]));
        m.connect();
        m.subscribe(tickers(["INFY"])); // still connecting: dropped on the wire
        m.notify(Notification::Open);

        assert_eq!(
            m.transport().sent,
            vec![subscribe_json(&["TCS", "HDFC", "WIPRO", "INFY"])]
        );
    }

    #[test]
    fn test_incremental_messages_while_open() {
        let (mut m, _) = manager();
        m.subscribe(tickers(["TCS"]));
        m.connect();
        m.notify(Notification::Open);

        m.subscribe(tickers(["INFY", "TCS"]));
        m.unsubscribe(tickers(["TCS"]));
        m.subscribe(Vec::new());

        assert_eq!(
            m.transport().sent,
            vec![
                subscribe_json(&["TCS"]),
                subscribe_json(&["INFY", "TCS"]),
                MessageOut::Unsubscribe(tickers(["TCS"])).to_string(),
            ]
        );
        assert_eq!(m.current_set(), tickers(["INFY"]).as_slice());
    }

    #[test]
    fn test_subscribe_idempotent() {
        let (mut m, _) = manager();
        m.subscribe(tickers(["TCS"]));
        m.subscribe(tickers(["TCS"]));
        m.unsubscribe(tickers(["WIPRO"]));
        assert_eq!(m.current_set(), tickers(["TCS"]).as_slice());
    }

    #[test]
    fn test_close_schedules_exactly_one_reconnect() {
        let (mut m, events) = manager();
        m.connect();
        m.notify(Notification::Open);
        m.notify(close());
        m.notify(close());
        m.notify(Notification::Error("late".into()));

        assert_eq!(m.state(), ConnectionState::Closed);
        assert!(!m.is_connected());
        assert!(m.reconnect_pending());
        assert_eq!(m.timer().scheduled, vec![Duration::from_secs(5)]);
        assert_eq!(
            events.borrow().last(),
            Some(&WsEvent::Disconnected {
                code: Some(1006),
                reason: "abnormal".into()
            })
        );
    }

    #[test]
    fn test_error_is_handled_as_close() {
        let (mut m, events) = manager();
        m.connect();
        m.notify(Notification::Open);
        m.notify(Notification::Error("connection reset".into()));

        assert_eq!(m.state(), ConnectionState::Closed);
        assert!(!m.transport().live);
        assert_eq!(m.timer().scheduled.len(), 1);

        // the transport's own close notification follows; nothing new happens
        m.notify(close());
        assert_eq!(m.timer().scheduled.len(), 1);
        let disconnects = events
            .borrow()
            .iter()
            .filter(|e| matches!(e, WsEvent::Disconnected { .. }))
            .count();
        assert_eq!(disconnects, 1);
    }

    #[test]
    fn test_failed_attempt_reschedules_without_disconnect_event() {
        let (mut m, events) = manager();
        m.connect();
        m.notify(Notification::Error("refused".into()));
        assert_eq!(m.state(), ConnectionState::Closed);
        assert_eq!(m.timer().scheduled.len(), 1);
        assert!(events.borrow().is_empty());
    }

    #[test]
    fn test_unconstructible_transport_schedules_reconnect() {
        let (mut m, _) = manager();
        m.transport_mut().fail_open = true;
        m.connect();

        assert_eq!(m.state(), ConnectionState::Closed);
        assert!(m.reconnect_pending());

        m.transport_mut().fail_open = false;
        fire_timer(&mut m);
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(m.transport().opened.len(), 1);
    }

    #[test]
    fn test_connect_is_idempotent() {
        let (mut m, _) = manager();
        m.connect();
        m.connect();
        m.notify(Notification::Open);
        m.connect();
        assert_eq!(m.transport().opened.len(), 1);
    }

    #[test]
    fn test_manual_connect_supersedes_pending_timer() {
        let (mut m, _) = manager();
        m.connect();
        m.notify(Notification::Open);
        m.notify(close());
        assert!(m.reconnect_pending());

        m.connect();
        assert!(!m.reconnect_pending());
        assert_eq!(m.timer().cancels, 1);

        // timer expiry already in flight when it was cancelled
        m.notify(Notification::ReconnectDue);
        assert_eq!(m.transport().opened.len(), 2);
    }

    #[test]
    fn test_unrecognized_frame_ignored() {
        let (mut m, events) = manager();
        m.connect();
        m.notify(Notification::Open);
        m.notify(Notification::Message(r#"{"type":"PONG"}"#.into()));
        assert_eq!(*events.borrow(), vec![WsEvent::Connected]);
        assert!(m.is_connected());
    }

    #[test]
    fn test_malformed_frame_dropped_connection_kept() {
        let (mut m, events) = manager();
        m.connect();
        m.notify(Notification::Open);
        m.notify(Notification::Message("{not json".into()));
        m.notify(Notification::Message(r#"{"type":"PRICE_UPDATE","data":"oops"}"#.into()));
        m.notify(Notification::Message(PRICE_FRAME.into()));

        assert!(m.is_connected());
        assert_eq!(m.transport().closes, 0);
        assert_eq!(
            *events.borrow(),
            vec![
                WsEvent::Connected,
                WsEvent::Prices(vec![PriceUpdate::new("TCS", 3500.0, "+1.2%", true)])
            ]
        );
    }

    #[test]
    fn test_batches_delivered_in_order() {
        let (mut m, events) = manager();
        m.connect();
        m.notify(Notification::Open);
        for price in [1.0, 2.0, 3.0] {
            let frame = serde_json::json!({
                "type": "PRICE_UPDATE",
                "data": [{"ticker": "TCS", "price": price, "change": "0%", "positive": true}]
            });
            m.notify(Notification::Message(frame.to_string()));
        }

        let prices: Vec<f64> = events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                WsEvent::Prices(batch) => Some(batch[0].price),
                _ => None,
            })
            .collect();
        assert_eq!(prices, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_dispose_while_connecting() {
        let (mut m, _) = manager();
        m.connect();
        m.dispose();

        assert_eq!(m.state(), ConnectionState::Disposed);
        assert!(!m.transport().live);
        assert!(!m.timer().pending);

        // a late open from the aborted attempt is ignored
        m.notify(Notification::Open);
        assert!(!m.is_connected());
    }

    #[test]
    fn test_dispose_while_open() {
        let (mut m, events) = manager();
        m.subscribe(tickers(["TCS"]));
        m.connect();
        m.notify(Notification::Open);
        m.dispose();

        assert!(!m.transport().live);
        assert!(!m.timer().pending);
        assert!(m.timer().scheduled.is_empty());
        assert!(matches!(
            events.borrow().last(),
            Some(WsEvent::Disconnected { code: Some(1000), .. })
        ));

        // close notifications after shutdown never schedule a reconnect
        m.notify(close());
        assert!(m.timer().scheduled.is_empty());
    }

    #[test]
    fn test_dispose_with_pending_reconnect() {
        let (mut m, _) = manager();
        m.connect();
        m.notify(Notification::Open);
        m.notify(close());
        assert!(m.timer().pending);

        m.dispose();
        assert!(!m.timer().pending);
        assert!(!m.reconnect_pending());
        assert!(!m.transport().live);

        m.notify(Notification::ReconnectDue);
        m.connect();
        assert_eq!(m.transport().opened.len(), 1);
        assert_eq!(m.state(), ConnectionState::Disposed);
    }

    #[test]
    fn test_initial_tickers_from_config() {
        let config = WsConfig::default().with_initial_tickers(tickers(["^NSEI", "^BSESN"]));
        let (mut m, _) = manager_with(config);
        assert_eq!(m.registry().len(), 2);
        assert!(m.registry().contains(&Ticker::new("^BSESN")));

        m.connect();
        assert_eq!(m.transport().opened, vec![m.url().to_string()]);
        m.notify(Notification::Open);
        assert_eq!(m.transport().sent, vec![subscribe_json(&["^NSEI", "^BSESN"])]);
    }

    #[test]
    fn test_scenario_subscribe_update_drop_reconnect() {
        let config = WsConfig::new("ws://feed.test:8000/api/ws/prices").unwrap();
        let (mut m, events) = manager_with(config);

        m.subscribe(tickers(["TCS", "INFY"]));
        m.connect();
        m.notify(Notification::Open);
        assert_eq!(m.transport().sent, vec![subscribe_json(&["TCS", "INFY"])]);

        m.notify(Notification::Message(PRICE_FRAME.into()));
        assert_eq!(
            events.borrow().last(),
            Some(&WsEvent::Prices(vec![PriceUpdate::new(
                "TCS", 3500.0, "+1.2%", true
            )]))
        );

        m.notify(close());
        assert!(!m.is_connected());
        assert_eq!(m.timer().scheduled, vec![Duration::from_secs(5)]);

        fire_timer(&mut m);
        m.notify(Notification::Open);

        assert_eq!(
            m.transport().opened,
            vec!["ws://feed.test:8000/api/ws/prices"; 2]
        );
        assert_eq!(
            m.transport().sent,
            vec![subscribe_json(&["TCS", "INFY"]), subscribe_json(&["TCS", "INFY"])]
        );
        assert!(m.is_connected());
    }
}
