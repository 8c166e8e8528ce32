use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, warn};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WriteHalf = SplitSink<WsStream, WsMessage>;
type ReadHalf = SplitStream<WsStream>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("handshake failed: {0}")]
    Handshake(tokio_tungstenite::tungstenite::Error),

    #[error("socket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("outbound queue is closed")]
    QueueClosed,

    #[error("binary frames are not supported")]
    UnsupportedFrame,

    #[error("connection was never started")]
    NotConnected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Error = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Error,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Legal transitions of the connection state machine. Error and Closed
    /// are terminal; a new connection must be created to reconnect.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Error)
                | (Connected, Error)
                | (Connected, Closing)
                | (Closing, Closed)
        )
    }
}

pub type StateCallback = Box<dyn Fn(ConnectionState, Option<&TransportError>) + Send + Sync>;

/// State cell plus the registered observer. Transitions are validated against
/// the state machine and the observer is invoked synchronously on the task
/// that detected the change.
struct StateCell {
    state: AtomicU8,
    observer: Mutex<Option<StateCallback>>,
}

impl StateCell {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            observer: Mutex::new(None),
        }
    }

    fn current(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, next: ConnectionState, fault: Option<&TransportError>) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);

            if !ConnectionState::from_u8(current).can_transition_to(next) {
                return false;
            }

            if self
                .state
                .compare_exchange(current, next as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if let Some(ref callback) = *self.observer.lock().unwrap() {
                    callback(next, fault);
                }

                return true;
            }
        }
    }
}

enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Client-side transport: one socket, an unbounded outbound queue drained by
/// a background sender task, and a receive loop that hands complete text
/// messages to a caller-supplied handler.
///
/// Senders never block on network I/O; backpressure shows up as queue growth,
/// which `queue_depth` exposes.
pub struct TransportConnection {
    url: String,
    state: Arc<StateCell>,
    outbound_tx: Mutex<Option<UnboundedSender<Outbound>>>,
    outbound_rx: Mutex<Option<UnboundedReceiver<Outbound>>>,
    reader_slot: Mutex<Option<oneshot::Receiver<ReadHalf>>>,
    queue_depth: Arc<AtomicUsize>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closing: AtomicBool,
    disposed: AtomicBool,
}

impl TransportConnection {
    pub fn new(url: impl Into<String>) -> Self {
        let (tx, rx) = unbounded_channel();

        Self {
            url: url.into(),
            state: Arc::new(StateCell::new()),
            outbound_tx: Mutex::new(Some(tx)),
            outbound_rx: Mutex::new(Some(rx)),
            reader_slot: Mutex::new(None),
            queue_depth: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Registers the single state observer. Must be called before `connect`
    /// to observe the Connecting→Connected transition.
    pub fn on_state_change(&self, callback: StateCallback) {
        let mut observer = self.state.observer.lock().unwrap();

        if observer.is_some() {
            warn!("replacing an already-registered state observer");
        }

        *observer = Some(callback);
    }

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    /// Number of items waiting in the outbound queue.
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Begins the handshake without blocking the caller. On success the
    /// sender task starts draining the outbound queue; on failure the state
    /// observer sees Error with the fault attached.
    pub fn connect(&self) {
        let rx = match self.outbound_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                warn!("connect called more than once");
                return;
            }
        };

        let (reader_tx, reader_rx) = oneshot::channel();
        *self.reader_slot.lock().unwrap() = Some(reader_rx);

        let url = self.url.clone();
        let state = Arc::clone(&self.state);
        let depth = Arc::clone(&self.queue_depth);
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = connect_async(url.as_str()) => result,
            };

            let stream = match result {
                Ok((stream, _)) => stream,
                Err(e) => {
                    let fault = TransportError::Handshake(e);
                    error!("handshake with {} failed: {}", url, fault);
                    state.transition(ConnectionState::Error, Some(&fault));
                    return;
                }
            };

            let (write, read) = stream.split();

            state.transition(ConnectionState::Connected, None);
            let _ = reader_tx.send(read);

            Self::sender_loop(write, rx, state, depth, cancel).await;
        });

        self.tasks.lock().unwrap().push(handle);
    }

    async fn sender_loop(
        mut write: WriteHalf,
        mut rx: UnboundedReceiver<Outbound>,
        state: Arc<StateCell>,
        depth: Arc<AtomicUsize>,
        cancel: CancellationToken,
    ) {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            match item {
                Outbound::Text(text) => {
                    depth.fetch_sub(1, Ordering::Relaxed);

                    if let Err(e) = write.send(WsMessage::Text(text)).await {
                        let fault = TransportError::Socket(e);
                        error!("send failed: {}", fault);
                        state.transition(ConnectionState::Error, Some(&fault));
                        break;
                    }
                }
                Outbound::Binary(payload) => {
                    depth.fetch_sub(1, Ordering::Relaxed);

                    if let Err(e) = write.send(WsMessage::Binary(payload)).await {
                        let fault = TransportError::Socket(e);
                        error!("send failed: {}", fault);
                        state.transition(ConnectionState::Error, Some(&fault));
                        break;
                    }
                }
                Outbound::Close => {
                    state.transition(ConnectionState::Closing, None);

                    // Closed is reported even when the close frame cannot be
                    // sent; the fault rides along on the transition.
                    match write.send(WsMessage::Close(None)).await {
                        Ok(()) => {
                            state.transition(ConnectionState::Closed, None);
                        }
                        Err(e) => {
                            let fault = TransportError::Socket(e);
                            debug!("close frame send failed: {}", fault);
                            state.transition(ConnectionState::Closed, Some(&fault));
                        }
                    }

                    break;
                }
            }
        }
    }

    pub fn send_text(&self, payload: String) -> Result<(), TransportError> {
        self.enqueue(Outbound::Text(payload), true)
    }

    pub fn send_binary(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.enqueue(Outbound::Binary(payload), true)
    }

    fn enqueue(&self, item: Outbound, counted: bool) -> Result<(), TransportError> {
        let guard = self.outbound_tx.lock().unwrap();

        let tx = match guard.as_ref() {
            Some(tx) => tx,
            None => {
                error!("enqueue rejected: outbound queue is closed");
                return Err(TransportError::QueueClosed);
            }
        };

        if counted {
            self.queue_depth.fetch_add(1, Ordering::Relaxed);
        }

        if tx.send(item).is_err() {
            if counted {
                self.queue_depth.fetch_sub(1, Ordering::Relaxed);
            }

            error!("enqueue rejected: sender task is gone");
            return Err(TransportError::QueueClosed);
        }

        Ok(())
    }

    /// Drives the read side of the socket until it closes, dispatching each
    /// complete text message to `handler`. Frame reassembly happens below us
    /// in tungstenite, so the handler only ever sees whole messages. Binary
    /// frames are a protocol violation here and abort the loop.
    pub async fn receive<F>(&self, mut handler: F) -> Result<(), TransportError>
    where
        F: FnMut(String),
    {
        let reader_rx = self
            .reader_slot
            .lock()
            .unwrap()
            .take()
            .ok_or(TransportError::NotConnected)?;

        // Resolves once the handshake completes; dropped on handshake failure.
        let mut read = match reader_rx.await {
            Ok(read) => read,
            Err(_) => return Err(TransportError::NotConnected),
        };

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = read.next() => next,
            };

            let frame = match next {
                Some(frame) => frame,
                None => break,
            };

            match frame {
                Ok(WsMessage::Text(text)) => handler(text),
                Ok(WsMessage::Binary(_)) => {
                    let fault = TransportError::UnsupportedFrame;
                    error!("received a binary frame on a text-only transport");
                    self.state.transition(ConnectionState::Error, Some(&fault));
                    return Err(fault);
                }
                Ok(WsMessage::Close(_)) => {
                    debug!("peer sent close, shutting down");
                    self.disconnect().await;
                    break;
                }
                Ok(_) => {} // ping/pong, handled by the library
                Err(e) => {
                    let fault = TransportError::Socket(e);
                    error!("receive failed: {}", fault);
                    self.state.transition(ConnectionState::Error, Some(&fault));
                    return Err(fault);
                }
            }
        }

        Ok(())
    }

    /// Graceful shutdown: queues a close frame behind any pending payloads,
    /// after which the sender task reports Closing then Closed and exits.
    /// Idempotent.
    pub async fn disconnect(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.enqueue(Outbound::Close, false).is_err() {
            // Queue already torn down; nothing left to flush.
            self.state.transition(ConnectionState::Closing, None);
            self.state.transition(ConnectionState::Closed, None);
        }
    }

    /// Synchronous teardown: closes the outbound queue, cancels the loops and
    /// aborts background tasks. Safe to call any number of times.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        self.outbound_tx.lock().unwrap().take();

        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        debug!("transport for {} disposed", self.url);
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        self.dispose();
    }
}
