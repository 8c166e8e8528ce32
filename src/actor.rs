use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::ws::Message as WebSocketMessage;
use futures_util::{Sink, SinkExt};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{Action, ProtocolError, ProtocolMessage};

#[derive(Debug, Error)]
pub enum ActorError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("outbound queue is closed")]
    QueueClosed,

    #[error("loop is already running")]
    AlreadyRunning,
}

#[derive(Clone, Debug)]
pub struct ActorConfig {
    /// Cadence of the throughput report and the coalesced ack.
    pub ack_interval: Duration,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            ack_interval: Duration::from_secs(1),
        }
    }
}

/// Per-connection protocol actor. The external read loop feeds decoded text
/// frames into the inbound queue; the broadcast loop drains the outbound
/// queue back onto the wire; a timer task samples throughput and emits at
/// most one watermark ack per tick.
///
/// The serial counters are atomics: the receive loop writes them while the
/// timer task reads them concurrently.
pub struct ConnectionActor {
    id: String,
    config: ActorConfig,
    inbound_tx: Mutex<Option<UnboundedSender<String>>>,
    inbound_rx: Mutex<Option<UnboundedReceiver<String>>>,
    outbound_tx: UnboundedSender<ProtocolMessage>,
    outbound_rx: Mutex<Option<UnboundedReceiver<ProtocolMessage>>>,
    last_msg_serial: AtomicI64,
    last_ack_serial: AtomicI64,
    messages_received: AtomicU64,
    started: Instant,
    cancel: CancellationToken,
}

impl ConnectionActor {
    pub fn new(config: ActorConfig) -> Self {
        let (inbound_tx, inbound_rx) = unbounded_channel();
        let (outbound_tx, outbound_rx) = unbounded_channel();

        Self {
            id: Uuid::new_v4().to_string(),
            config,
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            last_msg_serial: AtomicI64::new(-1),
            last_ack_serial: AtomicI64::new(-1),
            messages_received: AtomicU64::new(0),
            started: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn last_msg_serial(&self) -> i64 {
        self.last_msg_serial.load(Ordering::Acquire)
    }

    pub fn last_ack_serial(&self) -> i64 {
        self.last_ack_serial.load(Ordering::Acquire)
    }

    /// Producer handle for the external read loop.
    pub fn inbound(&self) -> Option<UnboundedSender<String>> {
        self.inbound_tx.lock().unwrap().clone()
    }

    /// Stops accepting inbound frames; the receive loop drains what is
    /// already queued and then exits.
    pub fn close_inbound(&self) {
        self.inbound_tx.lock().unwrap().take();
    }

    /// Takes the consumer end of the outbound queue, for the broadcast loop.
    pub fn take_outbound(&self) -> Option<UnboundedReceiver<ProtocolMessage>> {
        self.outbound_rx.lock().unwrap().take()
    }

    pub fn enqueue_outbound(&self, msg: ProtocolMessage) -> Result<(), ActorError> {
        self.outbound_tx.send(msg).map_err(|_| {
            error!("[{}] outbound enqueue rejected: queue is closed", self.id);
            ActorError::QueueClosed
        })
    }

    /// Decodes and dispatches inbound frames until the queue closes or the
    /// actor is cancelled. A decode failure means the session is corrupt and
    /// is propagated rather than skipped.
    pub async fn receive_loop(&self) -> Result<(), ActorError> {
        let mut rx = self
            .inbound_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(ActorError::AlreadyRunning)?;

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let msg = ProtocolMessage::decode(&frame)?;
            self.handle(msg)?;
        }

        Ok(())
    }

    fn handle(&self, msg: ProtocolMessage) -> Result<(), ActorError> {
        match msg.action {
            Action::Attach => {
                let channel = msg.channel.as_deref().unwrap_or_default();
                debug!("[{}] attach to channel {}", self.id, channel);

                let token = Uuid::new_v4().to_string();
                self.enqueue_outbound(ProtocolMessage::attached(channel, &token))?;
            }
            Action::Message | Action::Presence => {
                // Last write wins; inbound serials are assumed non-decreasing.
                if msg.requires_ack() {
                    self.last_msg_serial.store(msg.msg_serial, Ordering::Release);
                }

                if msg.action == Action::Message {
                    self.messages_received.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ => {} // heartbeats and the rest carry no state here
        }

        Ok(())
    }

    /// Drains the outbound queue onto the socket, one envelope per text
    /// frame, until cancelled or the sink rejects a write.
    pub async fn broadcast_loop<S>(&self, mut write: S)
    where
        S: Sink<WebSocketMessage> + Unpin,
        S::Error: std::fmt::Display,
    {
        let mut rx = match self.take_outbound() {
            Some(rx) => rx,
            None => {
                warn!("[{}] broadcast loop started twice", self.id);
                return;
            }
        };

        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let text = match msg.encode() {
                Ok(text) => text,
                Err(e) => {
                    error!("[{}] failed to encode outbound envelope: {}", self.id, e);
                    continue;
                }
            };

            if let Err(e) = write.send(WebSocketMessage::Text(text)).await {
                debug!("[{}] socket write failed, stopping broadcast: {}", self.id, e);
                break;
            }
        }
    }

    /// One timer tick: report throughput, then emit a coalesced ack if any
    /// new ack-requiring message arrived since the previous tick.
    pub fn tick(&self) {
        let received = self.messages_received.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            received as f64 / elapsed
        } else {
            0.0
        };

        info!("[{}] received {} messages ({:.1}/s)", self.id, received, rate);

        let last = self.last_msg_serial.load(Ordering::Acquire);

        if last != self.last_ack_serial.load(Ordering::Acquire) {
            if self.enqueue_outbound(ProtocolMessage::ack(last)).is_ok() {
                self.last_ack_serial.store(last, Ordering::Release);
            }
        }
    }

    /// Runs `tick` every `ack_interval` until the actor shuts down.
    pub fn spawn_timer(self: std::sync::Arc<Self>) -> JoinHandle<()> {
        let actor = self;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(actor.config.ack_interval);
            interval.tick().await; // the first tick completes immediately

            loop {
                tokio::select! {
                    _ = actor.cancel.cancelled() => break,
                    _ = interval.tick() => actor.tick(),
                }
            }
        })
    }

    /// Cancels all loops at their next suspension point. Pending outbound
    /// items are discarded, not flushed.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
