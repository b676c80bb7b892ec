//! Agent-side runtime
//!
//! The agent keeps one persistent connection to the core, samples host
//! metrics on a cadence, and runs assigned probing tasks with bounded
//! concurrency and cooperative cancellation.

pub mod collector;
pub mod connection;
pub mod ping;
pub mod script;
pub mod tasks;

pub use connection::{AgentClient, MessageHandler, SendError};
pub use tasks::TaskRuntime;
