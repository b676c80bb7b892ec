//! Helper functions for integration tests

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use probehub::alerts::AlertEvaluator;
use probehub::api;
use probehub::hub::{handler::CoreState, Hub};
use probehub::protocol::{
    DiskStats, Envelope, MemoryStats, MessageType, MetricsPayload, NetworkStats, RegisterPayload,
};
use probehub::storage::memory::MemoryStore;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestCore {
    pub addr: SocketAddr,
    pub store: Arc<MemoryStore>,
    pub hub: Arc<Hub>,
}

impl TestCore {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/agent/ws", self.addr)
    }

    pub fn http_base(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Bind the fabric's router on an ephemeral port over in-memory stores.
pub async fn spawn_core(agent_token: &str) -> TestCore {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(Hub::new());

    let evaluator = AlertEvaluator::new(store.clone(), store.clone());

    let state = CoreState {
        hub: Arc::clone(&hub),
        agents: store.clone(),
        metrics: store.clone(),
        traffic: store.clone(),
        tasks: store.clone(),
        scripts: store.clone(),
        evaluator: Arc::new(evaluator),
        agent_token: agent_token.to_string(),
        geo_jobs: None,
    };

    let app = api::router(state, false);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestCore { addr, store, hub }
}

pub async fn connect(core: &TestCore) -> WsClient {
    let (ws, _) = connect_async(core.ws_url()).await.unwrap();
    ws
}

pub fn register_envelope(hostname: &str, token: &str) -> Envelope {
    Envelope::new(
        MessageType::Register,
        &RegisterPayload {
            hostname: hostname.to_string(),
            os: "linux".to_string(),
            arch: "amd64".to_string(),
            version: "1.0.0".to_string(),
            token: token.to_string(),
        },
    )
    .unwrap()
}

pub async fn send(ws: &mut WsClient, env: &Envelope) {
    ws.send(Message::Text(env.encode().unwrap())).await.unwrap();
}

/// Next application frame, skipping transport messages.
pub async fn next_envelope(ws: &mut WsClient) -> Option<Envelope> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .ok()??
            .ok()?;
        match msg {
            Message::Text(text) => return Some(Envelope::decode(&text).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

/// Register over an open socket and return the assigned agent id.
pub async fn handshake(ws: &mut WsClient, hostname: &str, token: &str) -> String {
    send(ws, &register_envelope(hostname, token)).await;
    let ack = next_envelope(ws).await.expect("no handshake reply");
    assert_eq!(ack.kind, MessageType::RegisterAck);
    let payload: probehub::protocol::RegisterAckPayload = ack.payload_as().unwrap();
    assert!(payload.success);
    payload.agent_id
}

pub fn metrics_sample(cpu: f64) -> MetricsPayload {
    MetricsPayload {
        cpu,
        memory: MemoryStats {
            total: 16_000_000_000,
            used: 8_000_000_000,
            available: 8_000_000_000,
            percent: 50.0,
        },
        disks: vec![DiskStats {
            path: "/".to_string(),
            total: 100,
            used: 50,
            available: 50,
            percent: 50.0,
        }],
        network: NetworkStats::default(),
    }
}

/// Poll until `predicate` holds or the timeout elapses.
pub async fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}
