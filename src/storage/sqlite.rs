//! SQLite store implementation
//!
//! A single [`SqliteStore`] implements every store trait over one sqlx
//! pool. The pool is capped at ONE connection: all persistence serializes
//! through a single writer, which avoids write contention in SQLite at the
//! cost of throughput. Hot paths must therefore keep per-message work
//! bounded.
//!
//! Aggregate columns hold what queries filter on; nested structures
//! (memory, disks, network, params, agent id sets) are stored as JSON text.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};
use uuid::Uuid;

use super::backend::{
    AgentRecord, AgentRegistration, AgentRegistry, AgentStatus, AlertInstance, AlertRule,
    AlertStore, MetricRow, MetricStore, ScriptRecord, ScriptStore, TaskRecord, TaskResultRecord,
    TaskStore, TrafficCycle, TrafficStats, TrafficStore,
};
use super::error::{StorageError, StorageResult};
use crate::protocol::MetricsPayload;

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if necessary) the database at `path` and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_string_lossy().to_string();
        info!("opening SQLite database at {path}");

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        Self::connect(options).await
    }

    /// Private in-memory database; used by tests.
    pub async fn in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> StorageResult<Self> {
        // Single writer: one connection serializes all persistence.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    fn millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn from_millis(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn agent_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<AgentRecord> {
        let status: String = row.try_get("status")?;
        Ok(AgentRecord {
            id: row.try_get("id")?,
            hostname: row.try_get("hostname")?,
            addr: row.try_get("addr")?,
            os: row.try_get("os")?,
            arch: row.try_get("arch")?,
            version: row.try_get("version")?,
            status: if status == "online" {
                AgentStatus::Online
            } else {
                AgentStatus::Offline
            },
            last_seen_at: Self::from_millis(row.try_get("last_seen_at")?),
            created_at: Self::from_millis(row.try_get("created_at")?),
            updated_at: Self::from_millis(row.try_get("updated_at")?),
        })
    }

    fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<TaskRecord> {
        let kind: String = row.try_get("type")?;
        let status: String = row.try_get("status")?;
        let params: String = row.try_get("params")?;
        let agent_ids: String = row.try_get("agent_ids")?;

        Ok(TaskRecord {
            id: row.try_get("id")?,
            kind: serde_json::from_value(serde_json::Value::String(kind))?,
            name: row.try_get("name")?,
            target: row.try_get("target")?,
            script_id: row.try_get("script_id")?,
            params: serde_json::from_str(&params)?,
            interval_sec: row.try_get::<i64, _>("interval_sec")? as u32,
            timeout_sec: row.try_get::<i64, _>("timeout_sec")? as u32,
            status: serde_json::from_value(serde_json::Value::String(status))?,
            agent_ids: serde_json::from_str(&agent_ids)?,
            created_at: Self::from_millis(row.try_get("created_at")?),
            updated_at: Self::from_millis(row.try_get("updated_at")?),
        })
    }

    fn alert_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<AlertInstance> {
        let status: String = row.try_get("status")?;
        let metric: String = row.try_get("metric_type")?;

        Ok(AlertInstance {
            id: row.try_get("id")?,
            rule_id: row.try_get("rule_id")?,
            agent_id: row.try_get("agent_id")?,
            status: serde_json::from_value(serde_json::Value::String(status))?,
            metric: serde_json::from_value(serde_json::Value::String(metric))?,
            value: row.try_get("value")?,
            threshold: row.try_get("threshold")?,
            message: row.try_get("message")?,
            triggered_at: Self::from_millis(row.try_get("triggered_at")?),
            resolved_at: row
                .try_get::<Option<i64>, _>("resolved_at")?
                .map(Self::from_millis),
        })
    }
}

#[async_trait]
impl AgentRegistry for SqliteStore {
    async fn register_or_update(&self, reg: AgentRegistration) -> StorageResult<AgentRecord> {
        let now = Self::millis(&Utc::now());

        // re-bind: hostname match first, then source address
        let mut existing = sqlx::query("SELECT * FROM agents WHERE hostname = ? LIMIT 1")
            .bind(&reg.hostname)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_none() {
            existing = sqlx::query("SELECT * FROM agents WHERE addr = ? LIMIT 1")
                .bind(&reg.addr)
                .fetch_optional(&self.pool)
                .await?;
        }

        if let Some(row) = existing {
            let record = Self::agent_from_row(&row)?;
            sqlx::query(
                "UPDATE agents
                 SET addr = ?, os = ?, arch = ?, version = ?, status = 'online',
                     last_seen_at = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(&reg.addr)
            .bind(&reg.os)
            .bind(&reg.arch)
            .bind(&reg.version)
            .bind(now)
            .bind(now)
            .bind(&record.id)
            .execute(&self.pool)
            .await?;

            return Ok(AgentRecord {
                addr: reg.addr,
                os: reg.os,
                arch: reg.arch,
                version: reg.version,
                status: AgentStatus::Online,
                last_seen_at: Self::from_millis(now),
                updated_at: Self::from_millis(now),
                ..record
            });
        }

        let record = AgentRecord {
            id: Uuid::new_v4().to_string(),
            hostname: reg.hostname,
            addr: reg.addr,
            os: reg.os,
            arch: reg.arch,
            version: reg.version,
            status: AgentStatus::Online,
            last_seen_at: Self::from_millis(now),
            created_at: Self::from_millis(now),
            updated_at: Self::from_millis(now),
        };

        sqlx::query(
            "INSERT INTO agents (id, hostname, addr, os, arch, version, status,
                                 last_seen_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 'online', ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.hostname)
        .bind(&record.addr)
        .bind(&record.os)
        .bind(&record.arch)
        .bind(&record.version)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    async fn set_status(&self, agent_id: &str, status: AgentStatus) -> StorageResult<()> {
        sqlx::query("UPDATE agents SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(Self::millis(&Utc::now()))
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_last_seen(&self, agent_id: &str) -> StorageResult<()> {
        sqlx::query("UPDATE agents SET last_seen_at = ? WHERE id = ?")
            .bind(Self::millis(&Utc::now()))
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, agent_id: &str) -> StorageResult<Option<AgentRecord>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::agent_from_row(&r)).transpose()
    }

    async fn list_by_ids(&self, agent_ids: &[String]) -> StorageResult<Vec<AgentRecord>> {
        let mut records = Vec::with_capacity(agent_ids.len());
        for id in agent_ids {
            if let Some(record) = AgentRegistry::get(self, id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl MetricStore for SqliteStore {
    async fn store(&self, agent_id: &str, sample: &MetricsPayload) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO metrics (id, agent_id, cpu, memory, disks, network, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(agent_id)
        .bind(sample.cpu)
        .bind(serde_json::to_string(&sample.memory)?)
        .bind(serde_json::to_string(&sample.disks)?)
        .bind(serde_json::to_string(&sample.network)?)
        .bind(Self::millis(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest(&self, agent_id: &str) -> StorageResult<Option<MetricRow>> {
        let row = sqlx::query(
            "SELECT * FROM metrics WHERE agent_id = ? ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| metric_from_row(&r)).transpose()
    }

    async fn history(
        &self,
        agent_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<MetricRow>> {
        let rows = sqlx::query(
            "SELECT * FROM metrics
             WHERE agent_id = ? AND timestamp >= ? AND timestamp <= ?
             ORDER BY timestamp ASC",
        )
        .bind(agent_id)
        .bind(Self::millis(&from))
        .bind(Self::millis(&to))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(metric_from_row).collect()
    }

    async fn cleanup(&self, before: DateTime<Utc>) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM metrics WHERE timestamp < ?")
            .bind(Self::millis(&before))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn metric_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<MetricRow> {
    let memory: String = row.try_get("memory")?;
    let disks: String = row.try_get("disks")?;
    let network: String = row.try_get("network")?;

    Ok(MetricRow {
        agent_id: row.try_get("agent_id")?,
        sample: MetricsPayload {
            cpu: row.try_get("cpu")?,
            memory: serde_json::from_str(&memory)?,
            disks: serde_json::from_str(&disks)?,
            network: serde_json::from_str(&network)?,
        },
        timestamp: SqliteStore::from_millis(row.try_get("timestamp")?),
    })
}

impl SqliteStore {
    async fn cycle_for_agent(&self, agent_id: &str) -> StorageResult<Option<TrafficCycle>> {
        let row = sqlx::query("SELECT * FROM billing_cycles WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| {
            Ok(TrafficCycle {
                id: r.try_get("id")?,
                agent_id: r.try_get("agent_id")?,
                start: Self::from_millis(r.try_get("start_date")?),
                duration_days: r.try_get::<i64, _>("duration_days")? as u32,
                limit_bytes: r.try_get::<i64, _>("limit_bytes")? as u64,
                created_at: Self::from_millis(r.try_get("created_at")?),
            })
        })
        .transpose()
    }

    async fn insert_cycle(&self, cycle: &TrafficCycle) -> StorageResult<()> {
        // agent_id is UNIQUE: replacing swaps in the new cycle row
        sqlx::query(
            "INSERT OR REPLACE INTO billing_cycles
                 (id, agent_id, start_date, duration_days, limit_bytes, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&cycle.id)
        .bind(&cycle.agent_id)
        .bind(Self::millis(&cycle.start))
        .bind(i64::from(cycle.duration_days))
        .bind(cycle.limit_bytes as i64)
        .bind(Self::millis(&cycle.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TrafficStore for SqliteStore {
    async fn record(&self, agent_id: &str, sent_delta: u64, recv_delta: u64) -> StorageResult<()> {
        let cycle = match self.cycle_for_agent(agent_id).await? {
            Some(cycle) => cycle,
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
                self.insert_cycle(&cycle).await?;
                cycle
            }
        };

        sqlx::query(
            "INSERT INTO traffic_records (id, cycle_id, agent_id, bytes_sent, bytes_recv, timestamp)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&cycle.id)
        .bind(agent_id)
        .bind(sent_delta as i64)
        .bind(recv_delta as i64)
        .bind(Self::millis(&Utc::now()))
        .execute(&self.pool)
        .await?;
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
        self.insert_cycle(&TrafficCycle {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            start,
            duration_days,
            limit_bytes,
            created_at: Utc::now(),
        })
        .await
    }

    async fn stats(&self, agent_id: &str) -> StorageResult<TrafficStats> {
        let Some(cycle) = self.cycle_for_agent(agent_id).await? else {
            return Ok(TrafficStats::default());
        };

        let row = sqlx::query(
            "SELECT COALESCE(SUM(bytes_sent), 0) AS sent, COALESCE(SUM(bytes_recv), 0) AS recv
             FROM traffic_records WHERE cycle_id = ?",
        )
        .bind(&cycle.id)
        .fetch_one(&self.pool)
        .await?;

        let bytes_sent = row.try_get::<i64, _>("sent")? as u64;
        let bytes_recv = row.try_get::<i64, _>("recv")? as u64;
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
impl TaskStore for SqliteStore {
    async fn list_pending_for_agent(&self, agent_id: &str) -> StorageResult<Vec<TaskRecord>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE status IN ('pending', 'running')")
            .fetch_all(&self.pool)
            .await?;

        // agent_ids is a JSON array column; filter after decoding
        let mut tasks = Vec::new();
        for row in &rows {
            let task = Self::task_from_row(row)?;
            if task.agent_ids.iter().any(|id| id == agent_id) {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    async fn record_result(&self, result: TaskResultRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO task_results (id, task_id, agent_id, success, output, error,
                                       duration_ms, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&result.id)
        .bind(&result.task_id)
        .bind(&result.agent_id)
        .bind(result.success as i64)
        .bind(&result.output)
        .bind(&result.error)
        .bind(result.duration_ms)
        .bind(Self::millis(&result.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn results(&self, task_id: &str, limit: usize) -> StorageResult<Vec<TaskResultRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM task_results WHERE task_id = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(task_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TaskResultRecord {
                    id: row.try_get("id")?,
                    task_id: row.try_get("task_id")?,
                    agent_id: row.try_get("agent_id")?,
                    success: row.try_get::<i64, _>("success")? != 0,
                    output: row.try_get("output")?,
                    error: row.try_get("error")?,
                    duration_ms: row.try_get("duration_ms")?,
                    timestamp: Self::from_millis(row.try_get("timestamp")?),
                })
            })
            .collect()
    }
}

#[async_trait]
impl ScriptStore for SqliteStore {
    async fn get(&self, script_id: &str) -> StorageResult<Option<ScriptRecord>> {
        let row = sqlx::query("SELECT id, name, content, checksum FROM scripts WHERE id = ?")
            .bind(script_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| {
            Ok(ScriptRecord {
                id: r.try_get("id")?,
                name: r.try_get("name")?,
                content: r.try_get("content")?,
                checksum: r.try_get("checksum")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl AlertStore for SqliteStore {
    async fn list_enabled_rules(&self) -> StorageResult<Vec<AlertRule>> {
        let rows = sqlx::query("SELECT * FROM alert_rules WHERE enabled = 1")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let metric: String = row.try_get("metric_type")?;
                let operator: String = row.try_get("operator")?;
                let agent_ids: String = row.try_get("agent_ids")?;

                Ok(AlertRule {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    metric: serde_json::from_value(serde_json::Value::String(metric))?,
                    operator: serde_json::from_value(serde_json::Value::String(operator))?,
                    threshold: row.try_get("threshold")?,
                    duration_sec: row.try_get::<i64, _>("duration_sec")? as u32,
                    cooldown_sec: row.try_get::<i64, _>("cooldown_sec")? as u32,
                    agent_ids: serde_json::from_str(&agent_ids)?,
                    enabled: true,
                })
            })
            .collect()
    }

    async fn firing(&self, rule_id: &str, agent_id: &str) -> StorageResult<Option<AlertInstance>> {
        let row = sqlx::query(
            "SELECT * FROM alerts
             WHERE rule_id = ? AND agent_id = ? AND status = 'firing'
             LIMIT 1",
        )
        .bind(rule_id)
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::alert_from_row(&r)).transpose()
    }

    async fn last_trigger(
        &self,
        rule_id: &str,
        agent_id: &str,
    ) -> StorageResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MAX(triggered_at) AS last FROM alerts WHERE rule_id = ? AND agent_id = ?",
        )
        .bind(rule_id)
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row
            .try_get::<Option<i64>, _>("last")?
            .map(Self::from_millis))
    }

    async fn create(&self, alert: AlertInstance) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO alerts (id, rule_id, agent_id, status, metric_type, value,
                                 threshold, message, triggered_at, resolved_at)
             VALUES (?, ?, ?, 'firing', ?, ?, ?, ?, ?, NULL)",
        )
        .bind(&alert.id)
        .bind(&alert.rule_id)
        .bind(&alert.agent_id)
        .bind(alert.metric.to_string())
        .bind(alert.value)
        .bind(alert.threshold)
        .bind(&alert.message)
        .bind(Self::millis(&alert.triggered_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve(&self, alert_id: &str, at: DateTime<Utc>) -> StorageResult<()> {
        sqlx::query("UPDATE alerts SET status = 'resolved', resolved_at = ? WHERE id = ?")
            .bind(Self::millis(&at))
            .bind(alert_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
