//! Native WebSocket client — `tokio-tungstenite`.
//!
//! - One background tokio task owns the [`ConnectionManager`]; consumer calls,
//!   transport notifications and timer expiry are serialized onto it
//! - Each connection runs in its own task, tagged with a generation so
//!   notifications from a superseded connection are discarded
//! - Fixed-delay reconnection, indefinitely
//! - Event stream (every event, in order) plus a `watch` channel holding the
//!   latest price batch

use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::domain::price::PriceUpdate;
use crate::error::WsError;
use crate::shared::Ticker;
use crate::ws::manager::ConnectionManager;
use crate::ws::transport::{Notification, ReconnectTimer, Transport};
use crate::ws::{ConnectionState, WsConfig, WsEvent};

/// How long `dispose()` waits for a graceful close before aborting.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

type EventSink = Box<dyn FnMut(WsEvent) + Send>;
type NativeManager = ConnectionManager<NativeTransport, NativeTimer, EventSink>;

// ─── Commands from public API to background task ─────────────────────────────

enum Command {
    Subscribe(Vec<Ticker>),
    Unsubscribe(Vec<Ticker>),
    CurrentSet(oneshot::Sender<Vec<Ticker>>),
    Dispose,
}

// ─── Notifications from connection / timer tasks ─────────────────────────────

enum Inbound {
    Transport {
        generation: u64,
        notification: Notification,
    },
    ReconnectDue,
}

// ─── Transport ───────────────────────────────────────────────────────────────

struct NativeTransport {
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    connect_timeout: Duration,
    generation: u64,
    outbound_tx: Option<mpsc::UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
    closing: Option<JoinHandle<()>>,
}

impl NativeTransport {
    fn new(inbound_tx: mpsc::UnboundedSender<Inbound>, connect_timeout: Duration) -> Self {
        Self {
            inbound_tx,
            connect_timeout,
            generation: 0,
            outbound_tx: None,
            task: None,
            closing: None,
        }
    }

    /// Whether a notification tagged `generation` belongs to the live connection.
    fn is_current(&self, generation: u64) -> bool {
        self.outbound_tx.is_some() && generation == self.generation
    }

    /// Wait for the last closed connection to finish its close handshake.
    async fn join_closing(&mut self) {
        if let Some(handle) = self.closing.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(CLOSE_GRACE, handle).await.is_err() {
                tracing::warn!("Connection task did not exit in time, aborting");
                abort.abort();
            }
        }
    }
}

impl Transport for NativeTransport {
    fn open(&mut self, url: &str) -> Result<(), WsError> {
        self.close();
        let request = url.into_client_request().map_err(WsError::from)?;

        self.generation += 1;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.outbound_tx = Some(outbound_tx);
        self.task = Some(tokio::spawn(run_connection(
            request,
            self.connect_timeout,
            self.generation,
            outbound_rx,
            self.inbound_tx.clone(),
        )));
        Ok(())
    }

    fn send(&mut self, text: &str) -> Result<(), WsError> {
        match &self.outbound_tx {
            Some(tx) => tx
                .send(Message::Text(text.to_string().into()))
                .map_err(|_| WsError::NotConnected),
            None => Err(WsError::NotConnected),
        }
    }

    fn close(&mut self) {
        // Dropping the sender detaches this connection (see `is_current`) and
        // makes its task send a close frame and exit.
        self.outbound_tx = None;
        if let Some(handle) = self.task.take() {
            if let Some(previous) = self.closing.replace(handle) {
                previous.abort();
            }
        }
    }
}

impl Drop for NativeTransport {
    fn drop(&mut self) {
        for handle in [self.task.take(), self.closing.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

/// One connection: handshake, then pump frames both ways until either side closes.
async fn run_connection(
    request: Request,
    connect_timeout: Duration,
    generation: u64,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
) {
    let notify = |notification: Notification| {
        let _ = inbound_tx.send(Inbound::Transport {
            generation,
            notification,
        });
    };

    // Nothing is sent before Open, so `recv` resolving here means the
    // transport was closed mid-handshake.
    let connected = tokio::select! {
        res = tokio::time::timeout(connect_timeout, connect_async(request)) => res,
        _ = outbound_rx.recv() => return,
    };

    let (mut sink, mut stream) = match connected {
        Ok(Ok((ws_stream, _))) => ws_stream.split(),
        Ok(Err(e)) => {
            notify(Notification::Error(WsError::from(e).to_string()));
            return;
        }
        Err(_) => {
            tracing::warn!("Handshake did not finish within {:?}", connect_timeout);
            notify(Notification::Error("Connection timeout".into()));
            return;
        }
    };
    notify(Notification::Open);

    loop {
        tokio::select! {
            out = outbound_rx.recv() => match out {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        notify(Notification::Error(e.to_string()));
                        return;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "Client disconnect".into(),
                    }))).await;
                    return;
                }
            },

            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    notify(Notification::Message(text.as_str().to_owned()));
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = extract_close(frame.as_ref());
                    notify(Notification::Close { code: Some(code), reason });
                    return;
                }
                Some(Ok(_)) => {} // Binary, Pong, Frame — ignore
                Some(Err(e)) => {
                    notify(Notification::Error(e.to_string()));
                    return;
                }
                None => {
                    notify(Notification::Close { code: None, reason: "Stream ended".into() });
                    return;
                }
            },
        }
    }
}

/// Extract close code and reason from an optional CloseFrame.
fn extract_close(frame: Option<&CloseFrame>) -> (u16, String) {
    match frame {
        Some(f) => (f.code.into(), f.reason.to_string()),
        None => (1005, "No close frame".into()),
    }
}

// ─── Reconnect timer ─────────────────────────────────────────────────────────

struct NativeTimer {
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    handle: Option<JoinHandle<()>>,
}

impl NativeTimer {
    fn new(inbound_tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self {
            inbound_tx,
            handle: None,
        }
    }
}

impl ReconnectTimer for NativeTimer {
    fn schedule(&mut self, delay: Duration) {
        let tx = self.inbound_tx.clone();
        let previous = self.handle.replace(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Inbound::ReconnectDue);
        }));
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for NativeTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ─── Public WsClient ─────────────────────────────────────────────────────────

/// Native price stream client.
///
/// Uses a background tokio task that owns the connection state machine.
/// The public API communicates with it via mpsc channels and never blocks.
pub struct WsClient {
    config: WsConfig,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: Option<mpsc::Receiver<Command>>,
    event_rx: tokio::sync::Mutex<mpsc::Receiver<WsEvent>>,
    event_tx: mpsc::Sender<WsEvent>,
    prices_tx: Option<watch::Sender<Vec<PriceUpdate>>>,
    prices_rx: watch::Receiver<Vec<PriceUpdate>>,
    state: Arc<AtomicU8>,
    task_handle: Option<JoinHandle<()>>,
}

impl WsClient {
    /// Create a new client. Does not connect yet; subscriptions made before
    /// [`connect`](Self::connect) are buffered and applied in order.
    pub fn new(config: WsConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity.max(1));
        let (prices_tx, prices_rx) = watch::channel(Vec::new());
        Self {
            config,
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            event_rx: tokio::sync::Mutex::new(event_rx),
            event_tx,
            prices_tx: Some(prices_tx),
            prices_rx,
            state: Arc::new(AtomicU8::new(ConnectionState::Idle as u8)),
            task_handle: None,
        }
    }

    /// Start the background task and the first connection attempt.
    ///
    /// Idempotent; a no-op after [`dispose`](Self::dispose).
    pub async fn connect(&mut self) -> Result<(), WsError> {
        let (cmd_rx, prices_tx) = match (self.cmd_rx.take(), self.prices_tx.take()) {
            (Some(cmd_rx), Some(prices_tx)) => (cmd_rx, prices_tx),
            _ => return Ok(()),
        };

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let sink = event_sink(self.event_tx.clone(), prices_tx, Arc::clone(&self.state));
        let manager = ConnectionManager::new(
            &self.config,
            NativeTransport::new(inbound_tx.clone(), self.config.connect_timeout()),
            NativeTimer::new(inbound_tx),
            sink,
        );

        self.task_handle = Some(tokio::spawn(run_task(
            manager,
            cmd_rx,
            inbound_rx,
            Arc::clone(&self.state),
        )));
        Ok(())
    }

    /// Add tickers to the desired set (sent immediately if connected).
    pub fn subscribe(&self, tickers: Vec<Ticker>) -> Result<(), WsError> {
        self.cmd_tx.try_send(Command::Subscribe(tickers))?;
        Ok(())
    }

    /// Remove tickers from the desired set (sent immediately if connected).
    pub fn unsubscribe(&self, tickers: Vec<Ticker>) -> Result<(), WsError> {
        self.cmd_tx.try_send(Command::Unsubscribe(tickers))?;
        Ok(())
    }

    /// The desired set as the background task currently holds it.
    pub async fn current_set(&self) -> Result<Vec<Ticker>, WsError> {
        if self.task_handle.is_none() {
            return Err(WsError::NotStarted);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::CurrentSet(reply_tx))
            .await
            .map_err(|_| WsError::ChannelClosed)?;
        reply_rx.await.map_err(|_| WsError::ChannelClosed)
    }

    /// Whether the connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.connection_state().is_open()
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::SeqCst))
    }

    /// The latest delivered batch (replaced, not accumulated).
    pub fn price_updates(&self) -> Vec<PriceUpdate> {
        self.prices_rx.borrow().clone()
    }

    /// A receiver that always holds the latest batch.
    pub fn watch_prices(&self) -> watch::Receiver<Vec<PriceUpdate>> {
        self.prices_rx.clone()
    }

    /// Stream of batches with latest-wins semantics: a slow reader skips
    /// to the newest batch. Use [`events`](Self::events) to see every batch.
    pub fn price_batches(&self) -> impl Stream<Item = Vec<PriceUpdate>> + Send + 'static {
        let mut rx = self.prices_rx.clone();
        async_stream::stream! {
            while rx.changed().await.is_ok() {
                let batch = rx.borrow_and_update().clone();
                yield batch;
            }
        }
    }

    /// Get a stream of events from the connection.
    ///
    /// The returned stream borrows `self`, so it must be dropped
    /// before calling `dispose()`.
    pub fn events(&self) -> Pin<Box<dyn Stream<Item = WsEvent> + Send + '_>> {
        Box::pin(futures_util::stream::unfold(
            &self.event_rx,
            |rx| async move {
                let mut guard = rx.lock().await;
                guard.recv().await.map(|event| (event, rx))
            },
        ))
    }

    /// Close the connection, cancel any pending reconnect and stop the task.
    pub async fn dispose(&mut self) {
        self.cmd_rx = None;
        self.prices_tx = None;

        if let Some(mut handle) = self.task_handle.take() {
            let _ = self.cmd_tx.send(Command::Dispose).await;
            if tokio::time::timeout(CLOSE_GRACE * 2, &mut handle).await.is_err() {
                tracing::warn!("Price stream task did not exit in time, aborting");
                handle.abort();
            }
        }

        self.state
            .store(ConnectionState::Disposed as u8, Ordering::SeqCst);
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Consumer-facing side effects of manager events.
fn event_sink(
    event_tx: mpsc::Sender<WsEvent>,
    prices_tx: watch::Sender<Vec<PriceUpdate>>,
    state: Arc<AtomicU8>,
) -> EventSink {
    Box::new(move |event: WsEvent| {
        match &event {
            WsEvent::Connected => {
                state.store(ConnectionState::Open as u8, Ordering::SeqCst);
            }
            WsEvent::Disconnected { .. } => {
                state.store(ConnectionState::Closed as u8, Ordering::SeqCst);
            }
            WsEvent::Prices(batch) => {
                prices_tx.send_replace(batch.clone());
            }
        }
        if event_tx.try_send(event).is_err() {
            tracing::warn!("Event channel full or closed, dropping event");
        }
    })
}

// ─── Background task ─────────────────────────────────────────────────────────

async fn run_task(
    mut manager: NativeManager,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    state: Arc<AtomicU8>,
) {
    manager.connect();
    state.store(manager.state() as u8, Ordering::SeqCst);

    loop {
        // Commands first, so calls made before `connect` land before the open.
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Subscribe(tickers)) => manager.subscribe(tickers),
                Some(Command::Unsubscribe(tickers)) => manager.unsubscribe(tickers),
                Some(Command::CurrentSet(reply)) => {
                    let _ = reply.send(manager.current_set().to_vec());
                }
                // WsClient disposed or dropped
                Some(Command::Dispose) | None => break,
            },

            Some(inbound) = inbound_rx.recv() => match inbound {
                Inbound::Transport { generation, notification } => {
                    if manager.transport().is_current(generation) {
                        manager.notify(notification);
                    } else {
                        tracing::trace!("Dropping notification from superseded connection");
                    }
                }
                Inbound::ReconnectDue => manager.notify(Notification::ReconnectDue),
            },
        }
        state.store(manager.state() as u8, Ordering::SeqCst);
    }

    manager.dispose();
    state.store(manager.state() as u8, Ordering::SeqCst);
    manager.transport_mut().join_closing().await;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
