//! Wire protocol for agent <-> core traffic
//!
//! Every message on the persistent channel is a single JSON text frame:
//!
//! ```text
//! { "type": "<kind>", "id": "<uuid>", "ts": <unix millis>, "payload": {...} }
//! ```
//!
//! The message type set is closed. Frames larger than [`MAX_FRAME_SIZE`]
//! are rejected at decode time, which tears the connection down. Envelope
//! ids are used for duplicate suppression within a connection; across
//! reconnects both sides must tolerate duplicates and gaps.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum size of a single frame on the wire (bytes).
pub const MAX_FRAME_SIZE: usize = 512 * 1024;

/// Closed set of message types carried by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Register,
    RegisterAck,
    Heartbeat,
    Metrics,
    MetricsAck,
    TaskAssign,
    TaskAck,
    TaskResult,
    Config,
    Error,
}

/// Typed frame exchanged over the duplex channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub id: String,
    pub ts: i64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Build a new envelope with a fresh id and the current timestamp.
    pub fn new<P: Serialize>(kind: MessageType, payload: &P) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        Ok(Self {
            kind,
            id: Uuid::new_v4().to_string(),
            ts: chrono::Utc::now().timestamp_millis(),
            payload,
        })
    }

    /// Envelope with a null payload (heartbeats).
    pub fn empty(kind: MessageType) -> Self {
        Self {
            kind,
            id: Uuid::new_v4().to_string(),
            ts: chrono::Utc::now().timestamp_millis(),
            payload: serde_json::Value::Null,
        }
    }

    /// Serialize to the text frame representation, enforcing the size bound.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let text =
            serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(text.len()));
        }
        Ok(text)
    }

    /// Parse a text frame, enforcing the size bound before touching JSON.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(text.len()));
        }
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Deserialize the payload into the concrete type for this message kind.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Errors produced while encoding or decoding frames.
#[derive(Debug)]
pub enum ProtocolError {
    /// Frame exceeds [`MAX_FRAME_SIZE`].
    FrameTooLarge(usize),

    /// Frame is not valid JSON or does not match the expected shape.
    Malformed(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::FrameTooLarge(size) => {
                write!(f, "frame of {} bytes exceeds limit of {}", size, MAX_FRAME_SIZE)
            }
            ProtocolError::Malformed(msg) => write!(f, "malformed frame: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAckPayload {
    pub agent_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot of host metrics sampled by an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsPayload {
    pub cpu: f64,
    pub memory: MemoryStats,
    #[serde(default)]
    pub disks: Vec<DiskStats>,
    pub network: NetworkStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskStats {
    pub path: String,
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkStats {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub bytes_sent_rate: u64,
    pub bytes_recv_rate: u64,
}

impl MetricsPayload {
    /// Check the sample invariants: percents in [0, 100] and used <= total
    /// for memory and every disk. The core rejects samples that fail.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=100.0).contains(&self.cpu) {
            return Err(format!("cpu percent out of range: {}", self.cpu));
        }
        if !(0.0..=100.0).contains(&self.memory.percent) {
            return Err(format!("memory percent out of range: {}", self.memory.percent));
        }
        if self.memory.used > self.memory.total {
            return Err(format!(
                "memory used {} exceeds total {}",
                self.memory.used, self.memory.total
            ));
        }
        for disk in &self.disks {
            if !(0.0..=100.0).contains(&disk.percent) {
                return Err(format!("disk {} percent out of range: {}", disk.path, disk.percent));
            }
            if disk.used > disk.total {
                return Err(format!(
                    "disk {} used {} exceeds total {}",
                    disk.path, disk.used, disk.total
                ));
            }
        }
        Ok(())
    }
}

/// Kind of work a task assignment carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Ping,
    Script,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Ping => write!(f, "ping"),
            TaskKind::Script => write!(f, "script"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignPayload {
    pub task_id: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_id: Option<String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// 0 = one-shot, > 0 = recurring every `interval` seconds.
    #[serde(default)]
    pub interval: u32,
    /// Per-run deadline in seconds; 0 means the default (60).
    #[serde(default)]
    pub timeout: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAckPayload {
    pub task_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultPayload {
    pub task_id: String,
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration of the run in milliseconds.
    pub duration: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPayload {
    pub metric_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

// ============================================================================
// Duplicate suppression
// ============================================================================

/// Bounded set of recently observed envelope ids.
///
/// Both sides keep one per connection; a duplicate id is discarded as a
/// no-op, which makes redelivery after reconnects harmless.
#[derive(Debug)]
pub struct SeenIds {
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an id. Returns `false` if it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.set.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

impl Default for SeenIds {
    fn default() -> Self {
        Self::new(1024)
    }
}
