//! Core-side protocol handler
//!
//! Upgrades incoming agent connections, validates the handshake, registers
//! the connection with the hub, and demuxes steady-state frames to the
//! stores and the alert evaluator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::alerts::AlertEvaluator;
use crate::protocol::{
    Envelope, ErrorPayload, MessageType, MetricsPayload, RegisterAckPayload, RegisterPayload,
    SeenIds, TaskAssignPayload, TaskResultPayload, MAX_FRAME_SIZE,
};
use crate::storage::{
    AgentRegistration, AgentRegistry, AgentStatus, MetricStore, ScriptStore, TaskResultRecord,
    TaskStore, TrafficStore,
};

use super::connection::{write_pump, AgentLink, PONG_WAIT};
use super::Hub;

/// How long the core waits for the register frame after upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Geolocation enrichment request, serviced off the hot path by whatever
/// owns the geo lookup. Handshake never waits on it.
#[derive(Debug, Clone)]
pub struct GeoJob {
    pub agent_id: String,
    pub addr: String,
}

/// Shared state for the agent-facing surface of the core.
#[derive(Clone)]
pub struct CoreState {
    pub hub: Arc<Hub>,
    pub agents: Arc<dyn AgentRegistry>,
    pub metrics: Arc<dyn MetricStore>,
    pub traffic: Arc<dyn TrafficStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub scripts: Arc<dyn ScriptStore>,
    pub evaluator: Arc<AlertEvaluator>,

    /// Shared handshake token; empty disables the check.
    pub agent_token: String,

    /// Optional sink for geolocation enrichment jobs.
    pub geo_jobs: Option<mpsc::Sender<GeoJob>>,
}

/// WebSocket upgrade handler for `GET /api/agent/ws`.
pub async fn agent_ws(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<CoreState>,
) -> Response {
    let addr = client_addr(peer, &headers);
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

/// Source address: peer, overridden by proxy headers when present.
fn client_addr(peer: SocketAddr, headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    peer.ip().to_string()
}

async fn handle_socket(socket: WebSocket, addr: String, state: CoreState) {
    let (mut sink, mut stream) = socket.split();

    let record = match handshake(&mut sink, &mut stream, &addr, &state).await {
        Some(record) => record,
        None => return,
    };

    let (link, outbound_rx) = AgentLink::new(record.id.clone());

    // Supersede any prior connection for this id before the new one
    // serves traffic; routing with two live links is undefined.
    if let Some(prior) = state.hub.register(Arc::clone(&link)) {
        debug!("superseding prior connection for agent {}", link.agent_id);
        prior.close();
    }

    info!("agent connected: {} ({})", record.hostname, link.agent_id);

    let writer = tokio::spawn(write_pump(sink, outbound_rx, Arc::clone(&link)));

    push_pending_tasks(&state, &link.agent_id).await;

    read_loop(&mut stream, &state, &link).await;

    let removed = state.hub.unregister(&link);
    if removed {
        if let Err(e) = state
            .agents
            .set_status(&link.agent_id, AgentStatus::Offline)
            .await
        {
            warn!("failed to mark agent {} offline: {e}", link.agent_id);
        }
        info!("agent disconnected: {}", link.agent_id);
    }

    let _ = writer.await;
}

/// Read exactly one frame: it must be a valid `register` with the right
/// token. Replies with the ack (or an error frame) and returns the agent
/// record on success.
async fn handshake(
    sink: &mut SplitSink<WebSocket, Message>,
    stream: &mut SplitStream<WebSocket>,
    addr: &str,
    state: &CoreState,
) -> Option<crate::storage::AgentRecord> {
    let first = match timeout(HANDSHAKE_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => {
            debug!("connection from {addr} closed before register");
            return None;
        }
        Err(_) => {
            debug!("handshake timeout for {addr}");
            return None;
        }
    };

    let env = match Envelope::decode(&first) {
        Ok(env) => env,
        Err(e) => {
            debug!("invalid register frame from {addr}: {e}");
            return None;
        }
    };
    if env.kind != MessageType::Register {
        debug!("expected register from {addr}, got {:?}", env.kind);
        return None;
    }

    let payload: RegisterPayload = match env.payload_as() {
        Ok(payload) => payload,
        Err(e) => {
            debug!("malformed register payload from {addr}: {e}");
            return None;
        }
    };

    if !state.agent_token.is_empty() && payload.token != state.agent_token {
        warn!("invalid token from {addr}");
        send_error(sink, 400, "invalid token").await;
        return None;
    }

    let record = match state
        .agents
        .register_or_update(AgentRegistration {
            hostname: payload.hostname,
            addr: addr.to_string(),
            os: payload.os,
            arch: payload.arch,
            version: payload.version,
        })
        .await
    {
        Ok(record) => record,
        Err(e) => {
            warn!("agent registration failed for {addr}: {e}");
            send_error(sink, 500, "registration failed").await;
            return None;
        }
    };

    // Enrichment runs elsewhere; the handshake never blocks on it.
    if let Some(geo) = &state.geo_jobs {
        let _ = geo.try_send(GeoJob {
            agent_id: record.id.clone(),
            addr: addr.to_string(),
        });
    }

    let ack = Envelope::new(
        MessageType::RegisterAck,
        &RegisterAckPayload {
            agent_id: record.id.clone(),
            success: true,
            error: None,
        },
    )
    .ok()?;
    let text = ack.encode().ok()?;
    if sink.send(Message::Text(text)).await.is_err() {
        return None;
    }

    Some(record)
}

async fn send_error(sink: &mut SplitSink<WebSocket, Message>, code: u16, message: &str) {
    if let Ok(env) = Envelope::new(
        MessageType::Error,
        &ErrorPayload {
            code,
            message: message.to_string(),
        },
    ) {
        if let Ok(text) = env.encode() {
            let _ = sink.send(Message::Text(text)).await;
        }
    }
}

/// Pending and running tasks targeting this agent are re-pushed on every
/// handshake; this is the recovery path for assignments dropped earlier.
async fn push_pending_tasks(state: &CoreState, agent_id: &str) {
    let tasks = match state.tasks.list_pending_for_agent(agent_id).await {
        Ok(tasks) => tasks,
        Err(e) => {
            warn!("failed to list pending tasks for {agent_id}: {e}");
            return;
        }
    };

    for task in tasks {
        let payload: TaskAssignPayload = task.to_assign();
        match Envelope::new(MessageType::TaskAssign, &payload) {
            Ok(env) => {
                if let Err(e) = state.hub.send_to(agent_id, &env) {
                    warn!("failed to push task {} to {agent_id}: {e}", payload.task_id);
                }
            }
            Err(e) => warn!("failed to encode task {}: {e}", payload.task_id),
        }
    }
}

async fn read_loop(stream: &mut SplitStream<WebSocket>, state: &CoreState, link: &Arc<AgentLink>) {
    let mut seen = SeenIds::default();
    // cumulative counters from the previous sample, for traffic deltas
    let mut last_counters: Option<(u64, u64)> = None;
    let mut deadline = Instant::now() + PONG_WAIT;

    loop {
        let msg = tokio::select! {
            _ = link.wait_closed() => return,

            res = timeout_at(deadline, stream.next()) => match res {
                Err(_) => {
                    debug!("read deadline elapsed for agent {}", link.agent_id);
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(e))) => {
                    debug!("read error for agent {}: {e}", link.agent_id);
                    return;
                }
                Ok(Some(Ok(msg))) => msg,
            }
        };

        match msg {
            Message::Pong(_) => deadline = Instant::now() + PONG_WAIT,
            Message::Ping(_) => {}
            Message::Close(_) => return,
            Message::Text(text) => {
                if text.len() > MAX_FRAME_SIZE {
                    warn!("oversize frame from agent {}", link.agent_id);
                    return;
                }
                let env = match Envelope::decode(&text) {
                    Ok(env) => env,
                    Err(e) => {
                        warn!("invalid frame from agent {}: {e}", link.agent_id);
                        return;
                    }
                };
                // redelivered frames are no-ops
                if !seen.insert(&env.id) {
                    trace!("duplicate frame {} from agent {}", env.id, link.agent_id);
                    continue;
                }
                demux(state, link, env, &mut last_counters).await;
            }
            _ => {}
        }
    }
}

async fn demux(
    state: &CoreState,
    link: &Arc<AgentLink>,
    env: Envelope,
    last_counters: &mut Option<(u64, u64)>,
) {
    let agent_id = link.agent_id.as_str();

    match env.kind {
        MessageType::Heartbeat => {
            if let Err(e) = state.agents.update_last_seen(agent_id).await {
                warn!("failed to update last seen for {agent_id}: {e}");
            }
        }

        MessageType::Metrics => {
            let sample: MetricsPayload = match env.payload_as() {
                Ok(sample) => sample,
                Err(e) => {
                    warn!("malformed metrics from {agent_id}: {e}");
                    return;
                }
            };
            if let Err(reason) = sample.validate() {
                warn!("rejecting metrics sample from {agent_id}: {reason}");
                return;
            }

            if let Err(e) = state.metrics.store(agent_id, &sample).await {
                warn!("failed to store metrics for {agent_id}: {e}");
            }
            if let Err(e) = state.agents.update_last_seen(agent_id).await {
                warn!("failed to update last seen for {agent_id}: {e}");
            }

            // Traffic accounting uses increments between successive
            // cumulative counters; a counter reset drops that sample.
            let current = (sample.network.bytes_sent, sample.network.bytes_recv);
            if let Some((last_sent, last_recv)) = *last_counters {
                if current.0 >= last_sent && current.1 >= last_recv {
                    if let Err(e) = state
                        .traffic
                        .record(agent_id, current.0 - last_sent, current.1 - last_recv)
                        .await
                    {
                        warn!("failed to record traffic for {agent_id}: {e}");
                    }
                } else {
                    debug!("counter reset for {agent_id}, dropping traffic delta");
                }
            }
            *last_counters = Some(current);

            state.evaluator.evaluate(agent_id, &sample).await;
        }

        MessageType::TaskResult => {
            let payload: TaskResultPayload = match env.payload_as() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("malformed task result from {agent_id}: {e}");
                    return;
                }
            };
            let record = TaskResultRecord {
                id: Uuid::new_v4().to_string(),
                task_id: payload.task_id,
                agent_id: agent_id.to_string(),
                success: payload.success,
                output: payload.output,
                error: payload.error.unwrap_or_default(),
                duration_ms: payload.duration,
                timestamp: Utc::now(),
            };
            if let Err(e) = state.tasks.record_result(record).await {
                warn!("failed to record task result for {agent_id}: {e}");
            }
        }

        other => {
            trace!("ignoring {other:?} frame from {agent_id}");
        }
    }
}
