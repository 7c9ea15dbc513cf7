//! WASM WebSocket client using `web-sys::WebSocket`.
//!
//! - `web-sys::WebSocket` + `wasm-bindgen` closures as the transport
//! - `gloo-timers` timeout as the reconnect timer
//! - The connection state machine lives behind `Rc<RefCell<_>>`; JS callbacks
//!   reach it through a weak handle, so dropping the client tears everything down
//! - Callback-based event system (`on_event: impl FnMut(WsEvent)`)

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use gloo_timers::callback::Timeout;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{CloseEvent, Event, MessageEvent, WebSocket};

use crate::domain::price::PriceUpdate;
use crate::error::{ConfigError, WsError};
use crate::shared::Ticker;
use crate::ws::manager::ConnectionManager;
use crate::ws::transport::{Notification, ReconnectTimer, Transport};
use crate::ws::{ConnectionState, WsConfig, WsEvent};

type Dispatch = Rc<dyn Fn(Notification)>;
type WasmManager = ConnectionManager<WasmTransport, WasmTimer, Box<dyn FnMut(WsEvent)>>;

// ─── Transport ───────────────────────────────────────────────────────────────

struct Handlers {
    _onopen: Closure<dyn FnMut()>,
    _onmessage: Closure<dyn FnMut(MessageEvent)>,
    _onerror: Closure<dyn FnMut(Event)>,
    _onclose: Closure<dyn FnMut(CloseEvent)>,
}

impl Handlers {
    fn attach(ws: &WebSocket, dispatch: &Dispatch) -> Self {
        let d = dispatch.clone();
        let onopen = Closure::<dyn FnMut()>::new(move || {
            tracing::info!("WebSocket opened");
            d(Notification::Open);
        });
        ws.set_onopen(Some(onopen.as_ref().unchecked_ref()));

        let d = dispatch.clone();
        let onmessage = Closure::<dyn FnMut(_)>::new(move |e: MessageEvent| {
            match e.data().dyn_into::<js_sys::JsString>() {
                Ok(txt) => d(Notification::Message(txt.into())),
                Err(_) => tracing::debug!("Ignoring non-text frame"),
            }
        });
        ws.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));

        // Browsers fire a bare `Event` here; details only surface in onclose.
        let d = dispatch.clone();
        let onerror = Closure::<dyn FnMut(_)>::new(move |e: Event| {
            tracing::error!("WebSocket error event: {}", e.type_());
            d(Notification::Error("WebSocket error".into()));
        });
        ws.set_onerror(Some(onerror.as_ref().unchecked_ref()));

        let d = dispatch.clone();
        let onclose = Closure::<dyn FnMut(_)>::new(move |e: CloseEvent| {
            d(Notification::Close {
                code: Some(e.code()),
                reason: e.reason(),
            });
        });
        ws.set_onclose(Some(onclose.as_ref().unchecked_ref()));

        Self {
            _onopen: onopen,
            _onmessage: onmessage,
            _onerror: onerror,
            _onclose: onclose,
        }
    }
}

struct WasmTransport {
    dispatch: Dispatch,
    socket: Option<(WebSocket, Handlers)>,
    // Handlers of closed sockets. A close can run inside one of them, so they
    // are only dropped on the next open.
    retired: Vec<Handlers>,
}

impl WasmTransport {
    fn new(dispatch: Dispatch) -> Self {
        Self {
            dispatch,
            socket: None,
            retired: Vec::new(),
        }
    }
}

impl Transport for WasmTransport {
    fn open(&mut self, url: &str) -> Result<(), WsError> {
        self.close();
        self.retired.clear();

        tracing::info!("Creating WebSocket connection");
        let ws = WebSocket::new(url).map_err(|err| {
            WsError::ConnectionFailed(format!(
                "Failed to create WebSocket: {}",
                extract_js_error(&err)
            ))
        })?;
        let handlers = Handlers::attach(&ws, &self.dispatch);
        self.socket = Some((ws, handlers));
        Ok(())
    }

    fn send(&mut self, text: &str) -> Result<(), WsError> {
        match &self.socket {
            Some((ws, _)) => ws
                .send_with_str(text)
                .map_err(|e| WsError::SendFailed(extract_js_error(&e))),
            None => Err(WsError::NotConnected),
        }
    }

    fn close(&mut self) {
        if let Some((ws, handlers)) = self.socket.take() {
            ws.set_onopen(None);
            ws.set_onmessage(None);
            ws.set_onerror(None);
            ws.set_onclose(None);
            if let Err(e) = ws.close() {
                tracing::debug!("WebSocket close failed: {}", extract_js_error(&e));
            }
            self.retired.push(handlers);
        }
    }
}

impl Drop for WasmTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ─── Reconnect timer ─────────────────────────────────────────────────────────

struct WasmTimer {
    dispatch: Dispatch,
    pending: Option<Timeout>,
    // The timeout that fired last. Rescheduling happens inside its callback,
    // so it is kept until the following schedule.
    fired: Option<Timeout>,
}

impl WasmTimer {
    fn new(dispatch: Dispatch) -> Self {
        Self {
            dispatch,
            pending: None,
            fired: None,
        }
    }
}

impl ReconnectTimer for WasmTimer {
    fn schedule(&mut self, delay: Duration) {
        let d = self.dispatch.clone();
        let millis = u32::try_from(delay.as_millis()).unwrap_or(u32::MAX);
        let timeout = Timeout::new(millis, move || {
            tracing::info!("Reconnect timeout fired");
            d(Notification::ReconnectDue);
        });
        self.fired = self.pending.replace(timeout);
    }

    fn cancel(&mut self) {
        // Dropping a gloo Timeout clears it.
        self.pending = None;
    }
}

// ─── Public WsClient ─────────────────────────────────────────────────────────

/// WASM price stream client.
///
/// Single-threaded: the state machine sits behind `Rc<RefCell<_>>`. Calling
/// back into the client from inside `on_event` is rejected with
/// [`WsError::Busy`]; the read-only accessors keep working there.
pub struct WsClient {
    manager: Rc<RefCell<WasmManager>>,
    state: Rc<Cell<ConnectionState>>,
    latest: Rc<RefCell<Vec<PriceUpdate>>>,
}

impl WsClient {
    /// Create a client. `on_event` receives every connection event and price batch.
    ///
    /// Does not connect yet.
    pub fn new(config: WsConfig, on_event: impl FnMut(WsEvent) + 'static) -> Self {
        let state = Rc::new(Cell::new(ConnectionState::Idle));
        let latest = Rc::new(RefCell::new(Vec::new()));
        let sink = event_sink(on_event, Rc::clone(&state), Rc::clone(&latest));

        let manager = Rc::new_cyclic(|weak: &Weak<RefCell<WasmManager>>| {
            let weak = weak.clone();
            let state = Rc::clone(&state);
            let dispatch: Dispatch =
                Rc::new(move |notification: Notification| deliver(&weak, &state, notification));
            RefCell::new(ConnectionManager::new(
                &config,
                WasmTransport::new(dispatch.clone()),
                WasmTimer::new(dispatch),
                sink,
            ))
        });

        Self {
            manager,
            state,
            latest,
        }
    }

    /// Begin connecting. A no-op while connecting, open, or disposed.
    pub fn connect(&self) -> Result<(), WsError> {
        self.with_manager(|m| m.connect())
    }

    /// Add tickers to the desired set (sent immediately if connected).
    pub fn subscribe(&self, tickers: Vec<Ticker>) -> Result<(), WsError> {
        self.with_manager(|m| m.subscribe(tickers))
    }

    /// Remove tickers from the desired set (sent immediately if connected).
    pub fn unsubscribe(&self, tickers: Vec<Ticker>) -> Result<(), WsError> {
        self.with_manager(|m| m.unsubscribe(tickers))
    }

    pub fn current_set(&self) -> Result<Vec<Ticker>, WsError> {
        self.manager
            .try_borrow()
            .map(|m| m.current_set().to_vec())
            .map_err(|_| WsError::Busy)
    }

    pub fn is_connected(&self) -> bool {
        self.state.get().is_open()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.get()
    }

    /// The latest delivered batch (replaced, not accumulated).
    pub fn price_updates(&self) -> Vec<PriceUpdate> {
        self.latest.borrow().clone()
    }

    /// Close the connection and cancel any pending reconnect.
    pub fn dispose(&self) -> Result<(), WsError> {
        self.with_manager(|m| m.dispose())
    }

    fn with_manager<T>(&self, f: impl FnOnce(&mut WasmManager) -> T) -> Result<T, WsError> {
        let mut manager = self.manager.try_borrow_mut().map_err(|_| {
            tracing::error!("Price stream is busy dispatching an event");
            WsError::Busy
        })?;
        let out = f(&mut manager);
        self.state.set(manager.state());
        Ok(out)
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        if let Ok(mut manager) = self.manager.try_borrow_mut() {
            manager.dispose();
        }
    }
}

/// Build a config for the page this module is running in.
///
/// The endpoint is `PRICE_STREAM_WS_URL` captured at build time if set,
/// otherwise derived from the page's hostname.
pub fn browser_config() -> Result<WsConfig, ConfigError> {
    let host = web_sys::window()
        .and_then(|w| w.location().hostname().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    WsConfig::from_overrides(
        option_env!("PRICE_STREAM_WS_URL"),
        option_env!("PRICE_STREAM_RECONNECT_DELAY_MS"),
        &host,
    )
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn deliver(
    manager: &Weak<RefCell<WasmManager>>,
    state: &Cell<ConnectionState>,
    notification: Notification,
) {
    let Some(manager) = manager.upgrade() else {
        return;
    };
    let Ok(mut manager) = manager.try_borrow_mut() else {
        tracing::error!("Price stream busy, dropping notification: {:?}", notification);
        return;
    };
    manager.notify(notification);
    state.set(manager.state());
}

fn event_sink(
    mut on_event: impl FnMut(WsEvent) + 'static,
    state: Rc<Cell<ConnectionState>>,
    latest: Rc<RefCell<Vec<PriceUpdate>>>,
) -> Box<dyn FnMut(WsEvent)> {
    Box::new(move |event: WsEvent| {
        match &event {
            WsEvent::Connected => state.set(ConnectionState::Open),
            WsEvent::Disconnected { .. } => state.set(ConnectionState::Closed),
            WsEvent::Prices(batch) => *latest.borrow_mut() = batch.clone(),
        }
        on_event(event);
    })
}

fn extract_js_error(err: &JsValue) -> String {
    if let Some(error) = err.dyn_ref::<js_sys::Error>() {
        let name = error.name().as_string().unwrap_or_else(|| "Error".to_string());
        let message = error.message().as_string().unwrap_or_default();

        return if message.is_empty() {
            name
        } else {
            format!("{}: {}", name, message)
        };
    }

    if let Some(s) = err.as_string().filter(|s| !s.is_empty()) {
        return s;
    }

    if let Ok(json_str) = js_sys::JSON::stringify(err) {
        if let Some(s) = json_str.as_string() {
            if !s.is_empty() && s != "null" && s != "undefined" {
                return s;
            }
        }
    }

    if err.is_undefined() {
        return "undefined error".to_string();
    }
    if err.is_null() {
        return "null error".to_string();
    }

    "Unknown WebSocket error".to_string()
}
