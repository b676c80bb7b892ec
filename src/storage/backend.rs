//! Store trait definitions and the records they carry
//!
//! These are the interfaces the fabric consumes from the persistence layer.
//! All methods are async and implementations must be `Send + Sync` since
//! they are shared across connection tasks.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::StorageResult;
use crate::protocol::{MetricsPayload, TaskKind};

// ============================================================================
// Agents
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Online => write!(f, "online"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub hostname: String,
    /// Observed source address of the most recent connection.
    pub addr: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub status: AgentStatus,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Attributes presented at handshake time.
#[derive(Debug, Clone)]
pub struct AgentRegistration {
    pub hostname: String,
    pub addr: String,
    pub os: String,
    pub arch: String,
    pub version: String,
}

/// Registry of known agents.
///
/// `register_or_update` implements re-bind semantics: an existing record
/// matching by hostname first, then by source address, is refreshed and
/// reused; otherwise a new record with a fresh identifier is created.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn register_or_update(&self, reg: AgentRegistration) -> StorageResult<AgentRecord>;

    async fn set_status(&self, agent_id: &str, status: AgentStatus) -> StorageResult<()>;

    async fn update_last_seen(&self, agent_id: &str) -> StorageResult<()>;

    async fn get(&self, agent_id: &str) -> StorageResult<Option<AgentRecord>>;

    async fn list_by_ids(&self, agent_ids: &[String]) -> StorageResult<Vec<AgentRecord>>;
}

// ============================================================================
// Metrics & traffic
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRow {
    pub agent_id: String,
    pub sample: MetricsPayload,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn store(&self, agent_id: &str, sample: &MetricsPayload) -> StorageResult<()>;

    async fn latest(&self, agent_id: &str) -> StorageResult<Option<MetricRow>>;

    async fn history(
        &self,
        agent_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<MetricRow>>;

    /// Delete rows older than `before`; returns the number deleted.
    async fn cleanup(&self, before: DateTime<Utc>) -> StorageResult<u64>;
}

/// Per-agent billing cycle: a rolling window with a byte budget that
/// traffic usage is measured against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficCycle {
    pub id: String,
    pub agent_id: String,
    pub start: DateTime<Utc>,
    pub duration_days: u32,
    /// 0 means no budget; usage stays at zero percent.
    pub limit_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl TrafficCycle {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + chrono::Duration::days(i64::from(self.duration_days))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrafficStats {
    /// Bytes accumulated within the current cycle.
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub total_bytes: u64,
    pub limit_bytes: u64,
    /// Share of the cycle's byte budget consumed, as a percentage.
    pub usage_percent: f64,
    pub cycle_start: Option<DateTime<Utc>>,
    pub cycle_end: Option<DateTime<Utc>>,
}

/// Accumulated transfer accounting per agent.
///
/// `record` takes increments derived from successive cumulative counters,
/// not instantaneous rates; counter resets on the agent side are dropped
/// by the caller before they reach the store. Recording for an agent
/// without a cycle installs a default one (30 days, no budget).
#[async_trait]
pub trait TrafficStore: Send + Sync {
    async fn record(&self, agent_id: &str, sent_delta: u64, recv_delta: u64) -> StorageResult<()>;

    /// Install or replace the agent's billing cycle. Replacing a cycle
    /// restarts accumulation: usage is always scoped to the live cycle.
    async fn configure_cycle(
        &self,
        agent_id: &str,
        start: DateTime<Utc>,
        duration_days: u32,
        limit_bytes: u64,
    ) -> StorageResult<()>;

    async fn stats(&self, agent_id: &str) -> StorageResult<TrafficStats>;
}

// ============================================================================
// Tasks & scripts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Canceled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Complete => write!(f, "complete"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Canceled => write!(f, "canceled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub kind: TaskKind,
    pub name: String,
    pub target: Option<String>,
    pub script_id: Option<String>,
    pub params: HashMap<String, String>,
    pub interval_sec: u32,
    pub timeout_sec: u32,
    pub status: TaskStatus,
    pub agent_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Shape this task as the assignment frame pushed to an agent.
    pub fn to_assign(&self) -> crate::protocol::TaskAssignPayload {
        crate::protocol::TaskAssignPayload {
            task_id: self.id.clone(),
            kind: self.kind,
            target: self.target.clone(),
            script_id: self.script_id.clone(),
            params: self.params.clone(),
            interval: self.interval_sec,
            timeout: self.timeout_sec,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultRecord {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    pub success: bool,
    pub output: String,
    pub error: String,
    pub duration_ms: i64,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Tasks in pending or running status whose agent set contains the agent.
    async fn list_pending_for_agent(&self, agent_id: &str) -> StorageResult<Vec<TaskRecord>>;

    async fn record_result(&self, result: TaskResultRecord) -> StorageResult<()>;

    async fn results(&self, task_id: &str, limit: usize) -> StorageResult<Vec<TaskResultRecord>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRecord {
    pub id: String,
    pub name: String,
    pub content: String,
    /// Hex SHA-256 of `content`, served alongside it for agent verification.
    pub checksum: String,
}

#[async_trait]
pub trait ScriptStore: Send + Sync {
    async fn get(&self, script_id: &str) -> StorageResult<Option<ScriptRecord>>;
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    Cpu,
    Memory,
    Disk,
    Traffic,
}

impl fmt::Display for AlertMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertMetric::Cpu => write!(f, "cpu"),
            AlertMetric::Memory => write!(f, "memory"),
            AlertMetric::Disk => write!(f, "disk"),
            AlertMetric::Traffic => write!(f, "traffic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertOperator {
    Gt,
    Lt,
    Eq,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub metric: AlertMetric,
    pub operator: AlertOperator,
    pub threshold: f64,
    /// Minimum time the condition must hold continuously before firing.
    pub duration_sec: u32,
    /// Suppression window after the most recent firing.
    pub cooldown_sec: u32,
    /// Empty means the rule applies to every agent.
    pub agent_ids: Vec<String>,
    pub enabled: bool,
}

impl AlertRule {
    pub fn exceeded(&self, value: f64) -> bool {
        match self.operator {
            AlertOperator::Gt => value > self.threshold,
            AlertOperator::Lt => value < self.threshold,
            AlertOperator::Eq => value == self.threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertInstance {
    pub id: String,
    pub rule_id: String,
    pub agent_id: String,
    pub status: AlertStatus,
    pub metric: AlertMetric,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn list_enabled_rules(&self) -> StorageResult<Vec<AlertRule>>;

    /// The firing instance for (rule, agent), if any. At most one exists.
    async fn firing(&self, rule_id: &str, agent_id: &str) -> StorageResult<Option<AlertInstance>>;

    /// When the most recent instance for (rule, agent) was triggered.
    async fn last_trigger(
        &self,
        rule_id: &str,
        agent_id: &str,
    ) -> StorageResult<Option<DateTime<Utc>>>;

    async fn create(&self, alert: AlertInstance) -> StorageResult<()>;

    async fn resolve(&self, alert_id: &str, at: DateTime<Utc>) -> StorageResult<()>;
}
