//! Client-side connection lifecycle
//!
//! One persistent WebSocket to the core, with three cooperative loops:
//! a read loop with a pong-refreshed deadline, a write pump that is the
//! sole transport writer and fires keepalive pings, and an application
//! heartbeat loop. Any failure tears the connection down and enters
//! exponential reconnection.
//!
//! The outbound queue is created fresh per connection; frames buffered at
//! teardown are lost (at-most-once). Senders must treat everything they
//! enqueue as best-effort — the core re-pushes pending tasks on every
//! handshake, which is the recovery path that matters.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval_at, timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::protocol::{
    Envelope, ErrorPayload, MessageType, MetricsPayload, RegisterAckPayload, RegisterPayload,
    SeenIds, TaskResultPayload, MAX_FRAME_SIZE,
};

const PONG_WAIT: Duration = Duration::from_secs(60);
const PING_PERIOD: Duration = Duration::from_secs(54);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const OUTBOUND_CAPACITY: usize = 256;
const MAX_BACKOFF_SECS: u64 = 60;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reconnect delay for the given consecutive failure count.
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64
        .checked_shl(attempt)
        .unwrap_or(u64::MAX)
        .min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}

/// Transient error from a non-blocking send attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    /// No connection is established right now.
    Disconnected,

    /// The outbound queue is saturated; the frame was dropped.
    QueueFull,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "not connected"),
            SendError::QueueFull => write!(f, "send buffer full"),
        }
    }
}

impl std::error::Error for SendError {}

/// Callback invoked for every frame the read loop accepts.
pub type MessageHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

struct ClientInner {
    server_url: String,
    token: String,
    version: String,
    outbound: Mutex<Option<mpsc::Sender<Envelope>>>,
    agent_id: RwLock<Option<String>>,
    connected: AtomicBool,
}

/// Handle to the agent's connection. Cloneable; senders use [`try_send`]
/// and observe a disconnected state while reconnection is in progress.
///
/// [`try_send`]: AgentClient::try_send
#[derive(Clone)]
pub struct AgentClient {
    inner: Arc<ClientInner>,
}

impl AgentClient {
    pub fn new(server_url: String, token: String, version: String) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                server_url,
                token,
                version,
                outbound: Mutex::new(None),
                agent_id: RwLock::new(None),
                connected: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Identifier assigned by the core at the most recent handshake.
    pub fn agent_id(&self) -> Option<String> {
        self.inner.agent_id.read().unwrap().clone()
    }

    /// Non-blocking enqueue onto the current connection's outbound queue.
    pub fn try_send(&self, env: Envelope) -> Result<(), SendError> {
        let guard = self.inner.outbound.lock().unwrap();
        let tx = guard.as_ref().ok_or(SendError::Disconnected)?;
        tx.try_send(env).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::Disconnected,
        })
    }

    /// Metric samples are best-effort; drops are expected under pressure.
    pub fn send_metrics(&self, sample: &MetricsPayload) -> Result<(), SendError> {
        let env = Envelope::new(MessageType::Metrics, sample)
            .map_err(|_| SendError::Disconnected)?;
        self.try_send(env)
    }

    pub fn send_task_result(&self, result: &TaskResultPayload) -> Result<(), SendError> {
        let env = Envelope::new(MessageType::TaskResult, result)
            .map_err(|_| SendError::Disconnected)?;
        self.try_send(env)
    }

    /// Drive the connection until shutdown: connect, serve, and reconnect
    /// with exponential backoff. A served session resets the backoff.
    pub async fn run(&self, handler: MessageHandler, shutdown: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.connect_once(&handler, &shutdown).await {
                Ok(()) => attempt = 0,
                Err(e) => warn!("connection attempt failed: {e:#}"),
            }

            if shutdown.is_cancelled() {
                break;
            }

            let delay = backoff_delay(attempt);
            attempt = attempt.saturating_add(1);
            info!("reconnecting in {delay:?} (attempt {attempt})");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        debug!("connection loop stopped");
    }

    /// Dial, handshake, and serve one session. Returns `Err` only for
    /// failures before steady state; once the session is serving, teardown
    /// reasons are logged and the session counts as served.
    async fn connect_once(
        &self,
        handler: &MessageHandler,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<()> {
        let (ws, _) = connect_async(&self.inner.server_url).await?;
        let (mut sink, mut stream) = ws.split();

        let agent_id = self.handshake(&mut sink, &mut stream).await?;
        *self.inner.agent_id.write().unwrap() = Some(agent_id.clone());
        info!("connected to core, agent id {agent_id}");

        // fresh queue per connection: buffered frames do not survive reconnects
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        *self.inner.outbound.lock().unwrap() = Some(tx);
        self.inner.connected.store(true, Ordering::SeqCst);

        let session = CancellationToken::new();
        let writer = tokio::spawn(write_pump(sink, rx, session.clone()));

        if let Err(e) = read_loop(&mut stream, handler, shutdown).await {
            debug!("connection lost: {e:#}");
        }

        self.inner.connected.store(false, Ordering::SeqCst);
        *self.inner.outbound.lock().unwrap() = None;
        session.cancel();
        let _ = writer.await;

        Ok(())
    }

    /// Send `register`, then await exactly one frame: the ack or an error.
    async fn handshake(
        &self,
        sink: &mut SplitSink<WsStream, Message>,
        stream: &mut SplitStream<WsStream>,
    ) -> anyhow::Result<String> {
        let payload = RegisterPayload {
            hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: self.inner.version.clone(),
            token: self.inner.token.clone(),
        };
        let register = Envelope::new(MessageType::Register, &payload)?;
        sink.send(Message::Text(register.encode()?)).await?;

        let text = timeout(HANDSHAKE_TIMEOUT, next_text(stream))
            .await
            .map_err(|_| anyhow::anyhow!("handshake timed out"))??;

        let ack = Envelope::decode(&text)?;
        match ack.kind {
            MessageType::Error => {
                let err: ErrorPayload = ack.payload_as()?;
                anyhow::bail!("handshake rejected: {}", err.message)
            }
            MessageType::RegisterAck => {
                let ack: RegisterAckPayload = ack.payload_as()?;
                if !ack.success {
                    anyhow::bail!(
                        "handshake rejected: {}",
                        ack.error.unwrap_or_else(|| "unknown error".to_string())
                    )
                }
                Ok(ack.agent_id)
            }
            other => anyhow::bail!("unexpected {other:?} frame during handshake"),
        }
    }

    /// Enqueue a `heartbeat` frame every 30 s. Runs across reconnects,
    /// deferring while disconnected.
    pub async fn heartbeat_loop(&self, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.try_send(Envelope::empty(MessageType::Heartbeat)) {
                        Ok(()) => trace!("heartbeat enqueued"),
                        Err(SendError::Disconnected) => trace!("heartbeat deferred, not connected"),
                        Err(SendError::QueueFull) => debug!("heartbeat dropped, queue full"),
                    }
                }
            }
        }
    }

    #[cfg(test)]
    fn install_outbound_for_test(&self, capacity: usize) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(capacity);
        *self.inner.outbound.lock().unwrap() = Some(tx);
        self.inner.connected.store(true, Ordering::SeqCst);
        rx
    }
}

/// Await the next text frame, skipping transport-level messages.
async fn next_text(stream: &mut SplitStream<WsStream>) -> anyhow::Result<String> {
    loop {
        match stream.next().await {
            None => anyhow::bail!("connection closed during handshake"),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Close(_))) => anyhow::bail!("connection closed during handshake"),
            Some(Ok(_)) => continue,
        }
    }
}

/// Sole writer to the transport: drains the outbound queue and fires
/// keepalive pings each 0.9 x pong-wait.
async fn write_pump(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Envelope>,
    session: CancellationToken,
) {
    let mut ping = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);

    loop {
        tokio::select! {
            _ = session.cancelled() => break,

            frame = outbound.recv() => match frame {
                None => break,
                Some(env) => {
                    let text = match env.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("dropping unencodable frame: {e}");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            },

            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}

/// Read frames until error, deadline, or shutdown. The deadline refreshes
/// on each transport pong.
async fn read_loop(
    stream: &mut SplitStream<WsStream>,
    handler: &MessageHandler,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let mut seen = SeenIds::default();
    let mut deadline = Instant::now() + PONG_WAIT;

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),

            res = timeout_at(deadline, stream.next()) => match res {
                Err(_) => anyhow::bail!("read deadline elapsed"),
                Ok(None) => anyhow::bail!("connection closed"),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(msg))) => msg,
            }
        };

        match msg {
            Message::Pong(_) => deadline = Instant::now() + PONG_WAIT,
            Message::Ping(_) => {}
            Message::Close(_) => anyhow::bail!("connection closed by core"),
            Message::Text(text) => {
                if text.len() > MAX_FRAME_SIZE {
                    anyhow::bail!("oversize frame from core");
                }
                let env = Envelope::decode(&text)
                    .map_err(|e| anyhow::anyhow!("invalid frame: {e}"))?;
                if !seen.insert(&env.id) {
                    trace!("duplicate frame {}", env.id);
                    continue;
                }
                handler(env);
            }
            _ => {}
        }
    }
}
