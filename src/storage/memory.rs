//! In-memory store implementations
//!
//! A single [`MemoryStore`] implements every store trait over mutex-guarded
//! maps. It backs the test suite and storage-less runs; nothing survives a
//! restart.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::backend::{
    AgentRecord, AgentRegistration, AgentRegistry, AgentStatus, AlertInstance, AlertRule,
    AlertStatus, AlertStore, MetricRow, MetricStore, ScriptRecord, ScriptStore, TaskRecord,
    TaskResultRecord, TaskStore, TrafficCycle, TrafficStats, TrafficStore,
};
use super::error::StorageResult;
use crate::protocol::MetricsPayload;

struct TrafficRow {
    cycle_id: String,
    bytes_sent: u64,
    bytes_recv: u64,
}

#[derive(Default)]
struct Inner {
    agents: HashMap<String, AgentRecord>,
    metrics: HashMap<String, Vec<MetricRow>>,
    cycles: HashMap<String, TrafficCycle>,
    traffic: Vec<TrafficRow>,
    tasks: HashMap<String, TaskRecord>,
    task_results: Vec<TaskResultRecord>,
    scripts: HashMap<String, ScriptRecord>,
    rules: HashMap<String, AlertRule>,
    alerts: Vec<AlertInstance>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a task; used by tests and by external layers that own task CRUD.
    pub fn insert_task(&self, task: TaskRecord) {
        self.inner.lock().unwrap().tasks.insert(task.id.clone(), task);
    }

    pub fn insert_script(&self, script: ScriptRecord) {
        self.inner
            .lock()
            .unwrap()
            .scripts
            .insert(script.id.clone(), script);
    }

    pub fn insert_rule(&self, rule: AlertRule) {
        self.inner.lock().unwrap().rules.insert(rule.id.clone(), rule);
    }

    pub fn alert_count(&self) -> usize {
        self.inner.lock().unwrap().alerts.len()
    }

    pub fn alerts(&self) -> Vec<AlertInstance> {
        self.inner.lock().unwrap().alerts.clone()
    }

    pub fn result_count(&self, task_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .task_results
            .iter()
            .filter(|r| r.task_id == task_id)
            .count()
    }
}

#[async_trait]
impl AgentRegistry for MemoryStore {
    async fn register_or_update(&self, reg: AgentRegistration) -> StorageResult<AgentRecord> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        // re-bind: hostname match takes precedence over address match
        let existing_id = inner
            .agents
            .values()
            .find(|a| a.hostname == reg.hostname)
            .or_else(|| inner.agents.values().find(|a| a.addr == reg.addr))
            .map(|a| a.id.clone());

        if let Some(id) = existing_id {
            let record = inner.agents.get_mut(&id).unwrap();
            record.addr = reg.addr;
            record.os = reg.os;
            record.arch = reg.arch;
            record.version = reg.version;
            record.status = AgentStatus::Online;
            record.last_seen_at = now;
            record.updated_at = now;
            return Ok(record.clone());
        }

        let record = AgentRecord {
            id: Uuid::new_v4().to_string(),
            hostname: reg.hostname,
            addr: reg.addr,
            os: reg.os,
            arch: reg.arch,
            version: reg.version,
            status: AgentStatus::Online,
            last_seen_at: now,
            created_at: now,
            updated_at: now,
        };
        inner.agents.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn set_status(&self, agent_id: &str, status: AgentStatus) -> StorageResult<()> {
        if let Some(agent) = self.inner.lock().unwrap().agents.get_mut(agent_id) {
            agent.status = status;
            agent.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_last_seen(&self, agent_id: &str) -> StorageResult<()> {
        if let Some(agent) = self.inner.lock().unwrap().agents.get_mut(agent_id) {
            agent.last_seen_at = Utc::now();
        }
        Ok(())
    }

    async fn get(&self, agent_id: &str) -> StorageResult<Option<AgentRecord>> {
        Ok(self.inner.lock().unwrap().agents.get(agent_id).cloned())
    }

    async fn list_by_ids(&self, agent_ids: &[String]) -> StorageResult<Vec<AgentRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(agent_ids
            .iter()
            .filter_map(|id| inner.agents.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn store(&self, agent_id: &str, sample: &MetricsPayload) -> StorageResult<()> {
        self.inner
            .lock()
            .unwrap()
            .metrics
            .entry(agent_id.to_string())
            .or_default()
            .push(MetricRow {
                agent_id: agent_id.to_string(),
                sample: sample.clone(),
                timestamp: Utc::now(),
            });
        Ok(())
    }

    async fn latest(&self, agent_id: &str) -> StorageResult<Option<MetricRow>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .metrics
            .get(agent_id)
            .and_then(|rows| rows.last().cloned()))
    }

    async fn history(
        &self,
        agent_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<MetricRow>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .metrics
            .get(agent_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.timestamp >= from && r.timestamp <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn cleanup(&self, before: DateTime<Utc>) -> StorageResult<u64> {
        let mut deleted = 0;
        let mut inner = self.inner.lock().unwrap();
        for rows in inner.metrics.values_mut() {
            let len = rows.len();
            rows.retain(|r| r.timestamp >= before);
            deleted += (len - rows.len()) as u64;
        }
        Ok(deleted)
    }
}

#[async_trait]
impl TrafficStore for MemoryStore {
    async fn record(&self, agent_id: &str, sent_delta: u64, recv_delta: u64) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();

        let cycle_id = match inner.cycles.get(agent_id) {
            Some(cycle) => cycle.id.clone(),
            None => {
                // first traffic for this agent: default 30-day cycle, no budget
                let now = Utc::now();
                let cycle = TrafficCycle {
                    id: Uuid::new_v4().to_string(),
                    agent_id: agent_id.to_string(),
                    start: now,
                    duration_days: 30,
                    limit_bytes: 0,
                    created_at: now,
                };
                let id = cycle.id.clone();
                inner.cycles.insert(agent_id.to_string(), cycle);
                id
            }
        };

        inner.traffic.push(TrafficRow {
            cycle_id,
            bytes_sent: sent_delta,
            bytes_recv: recv_delta,
        });
        Ok(())
    }

    async fn configure_cycle(
        &self,
        agent_id: &str,
        start: DateTime<Utc>,
        duration_days: u32,
        limit_bytes: u64,
    ) -> StorageResult<()> {
        // a fresh cycle id orphans prior records, restarting accumulation
        self.inner.lock().unwrap().cycles.insert(
            agent_id.to_string(),
            TrafficCycle {
                id: Uuid::new_v4().to_string(),
                agent_id: agent_id.to_string(),
                start,
                duration_days,
                limit_bytes,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn stats(&self, agent_id: &str) -> StorageResult<TrafficStats> {
        let inner = self.inner.lock().unwrap();

        let Some(cycle) = inner.cycles.get(agent_id) else {
            return Ok(TrafficStats::default());
        };

        let (bytes_sent, bytes_recv) = inner
            .traffic
            .iter()
            .filter(|row| row.cycle_id == cycle.id)
            .fold((0u64, 0u64), |(sent, recv), row| {
                (sent + row.bytes_sent, recv + row.bytes_recv)
            });

        let total_bytes = bytes_sent + bytes_recv;
        let usage_percent = if cycle.limit_bytes > 0 {
            total_bytes as f64 / cycle.limit_bytes as f64 * 100.0
        } else {
            0.0
        };

        Ok(TrafficStats {
            bytes_sent,
            bytes_recv,
            total_bytes,
            limit_bytes: cycle.limit_bytes,
            usage_percent,
            cycle_start: Some(cycle.start),
            cycle_end: Some(cycle.end()),
        })
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn list_pending_for_agent(&self, agent_id: &str) -> StorageResult<Vec<TaskRecord>> {
        use super::backend::TaskStatus;

        Ok(self
            .inner
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| {
                matches!(t.status, TaskStatus::Pending | TaskStatus::Running)
                    && t.agent_ids.iter().any(|id| id == agent_id)
            })
            .cloned()
            .collect())
    }

    async fn record_result(&self, result: TaskResultRecord) -> StorageResult<()> {
        self.inner.lock().unwrap().task_results.push(result);
        Ok(())
    }

    async fn results(&self, task_id: &str, limit: usize) -> StorageResult<Vec<TaskResultRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<_> = inner
            .task_results
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| std::cmp::Reverse(r.timestamp));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[async_trait]
impl ScriptStore for MemoryStore {
    async fn get(&self, script_id: &str) -> StorageResult<Option<ScriptRecord>> {
        Ok(self.inner.lock().unwrap().scripts.get(script_id).cloned())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn list_enabled_rules(&self) -> StorageResult<Vec<AlertRule>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .rules
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect())
    }

    async fn firing(&self, rule_id: &str, agent_id: &str) -> StorageResult<Option<AlertInstance>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .alerts
            .iter()
            .find(|a| {
                a.rule_id == rule_id && a.agent_id == agent_id && a.status == AlertStatus::Firing
            })
            .cloned())
    }

    async fn last_trigger(
        &self,
        rule_id: &str,
        agent_id: &str,
    ) -> StorageResult<Option<DateTime<Utc>>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .alerts
            .iter()
            .filter(|a| a.rule_id == rule_id && a.agent_id == agent_id)
            .map(|a| a.triggered_at)
            .max())
    }

    async fn create(&self, alert: AlertInstance) -> StorageResult<()> {
        self.inner.lock().unwrap().alerts.push(alert);
        Ok(())
    }

    async fn resolve(&self, alert_id: &str, at: DateTime<Utc>) -> StorageResult<()> {
        if let Some(alert) = self
            .inner
            .lock()
            .unwrap()
            .alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
        {
            alert.status = AlertStatus::Resolved;
            alert.resolved_at = Some(at);
        }
        Ok(())
    }
}
