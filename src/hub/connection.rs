//! Per-connection state and pumps for the core side
//!
//! Each live agent connection owns a bounded outbound queue and two pumps.
//! The write pump is the sole writer to the transport and fires keepalive
//! pings; the read loop (driven by the protocol handler) enforces a read
//! deadline refreshed on each transport pong.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::Envelope;

/// How long a connection may stay silent before its read deadline elapses.
pub(crate) const PONG_WAIT: Duration = Duration::from_secs(60);

/// Keepalive ping cadence (0.9 x pong wait).
pub(crate) const PING_PERIOD: Duration = Duration::from_secs(54);

/// Capacity of the per-connection outbound queue.
pub(crate) const OUTBOUND_CAPACITY: usize = 256;

/// Error from enqueueing onto a connection's outbound queue.
#[derive(Debug)]
pub(crate) enum LinkSendError {
    QueueFull,
    Closed,
    Encode(String),
}

/// A live agent connection as seen by the hub.
pub struct AgentLink {
    pub agent_id: String,
    outbound: mpsc::Sender<String>,
    closed: CancellationToken,
}

impl AgentLink {
    pub fn new(agent_id: String) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        (
            Arc::new(Self {
                agent_id,
                outbound: tx,
                closed: CancellationToken::new(),
            }),
            rx,
        )
    }

    pub(crate) fn try_send(&self, env: &Envelope) -> Result<(), LinkSendError> {
        if self.closed.is_cancelled() {
            return Err(LinkSendError::Closed);
        }
        let text = env
            .encode()
            .map_err(|e| LinkSendError::Encode(e.to_string()))?;
        self.outbound.try_send(text).map_err(|e| match e {
            TrySendError::Full(_) => LinkSendError::QueueFull,
            TrySendError::Closed(_) => LinkSendError::Closed,
        })
    }

    /// Tear the connection down: the write pump exits and both pumps of a
    /// superseded connection observe the cancellation.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn wait_closed(&self) {
        self.closed.cancelled().await
    }
}

/// Drain the outbound queue onto the socket; sole writer to the transport.
pub(crate) async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    link: Arc<AgentLink>,
) {
    let mut ping = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);

    loop {
        tokio::select! {
            _ = link.wait_closed() => break,

            frame = outbound.recv() => match frame {
                None => break,
                Some(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        debug!("write failed for agent {}", link.agent_id);
                        break;
                    }
                }
            },

            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    debug!("ping failed for agent {}", link.agent_id);
                    break;
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}
