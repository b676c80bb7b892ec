//! Persistence façade for the coordination fabric
//!
//! The fabric does not own the admin CRUD surface; it consumes a small set
//! of store interfaces for the entities it touches (agents, metrics,
//! traffic, tasks, scripts, alerts). Two implementations ship in-tree:
//!
//! - `memory` — Mutex-backed maps, used by tests and storage-less runs
//! - `sqlite` — sqlx-backed, single-writer SQLite database

pub mod backend;
pub mod error;
pub mod memory;
pub mod sqlite;

pub use backend::{
    AgentRecord, AgentRegistration, AgentRegistry, AgentStatus, AlertInstance, AlertMetric,
    AlertOperator, AlertRule, AlertStatus, AlertStore, MetricRow, MetricStore, ScriptRecord,
    ScriptStore, TaskRecord, TaskResultRecord, TaskStatus, TaskStore, TrafficCycle, TrafficStats,
    TrafficStore,
};
pub use error::{StorageError, StorageResult};
