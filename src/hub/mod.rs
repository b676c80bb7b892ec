//! Core-side registry of live agent connections
//!
//! The hub maps agent identifiers to their single live connection. A new
//! successful handshake for an identifier supersedes the prior connection:
//! [`Hub::register`] atomically swaps and hands the displaced link back to
//! the caller, which closes it before the new one serves traffic.

pub mod connection;
pub mod handler;

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::protocol::Envelope;
use connection::AgentLink;

/// Error surfaced by [`Hub::send_to`] when a connection's bounded outbound
/// queue is saturated. An absent agent is not an error: it will pick up
/// pending tasks through the handshake re-push when it reconnects.
#[derive(Debug, PartialEq, Eq)]
pub enum HubSendError {
    QueueFull,
    Encode(String),
}

impl fmt::Display for HubSendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubSendError::QueueFull => write!(f, "outbound queue full"),
            HubSendError::Encode(msg) => write!(f, "failed to encode frame: {}", msg),
        }
    }
}

impl std::error::Error for HubSendError {}

#[derive(Default)]
pub struct Hub {
    agents: DashMap<String, Arc<AgentLink>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a link, returning the connection it displaced, if any.
    /// The caller must close the displaced link before routing to the new one.
    pub fn register(&self, link: Arc<AgentLink>) -> Option<Arc<AgentLink>> {
        self.agents.insert(link.agent_id.clone(), link)
    }

    /// Remove a link, but only if it is still the registered one for its
    /// agent id; a superseded connection must not evict its successor.
    /// Returns whether the link was removed.
    pub fn unregister(&self, link: &Arc<AgentLink>) -> bool {
        let removed = self
            .agents
            .remove_if(&link.agent_id, |_, stored| Arc::ptr_eq(stored, link))
            .is_some();
        link.close();
        removed
    }

    /// Non-blocking enqueue to one agent's connection.
    pub fn send_to(&self, agent_id: &str, env: &Envelope) -> Result<(), HubSendError> {
        let link = match self.agents.get(agent_id) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Ok(()),
        };
        match link.try_send(env) {
            Ok(()) => Ok(()),
            // a closed link means the connection is already going away
            Err(connection::LinkSendError::Closed) => Ok(()),
            Err(connection::LinkSendError::QueueFull) => Err(HubSendError::QueueFull),
            Err(connection::LinkSendError::Encode(msg)) => Err(HubSendError::Encode(msg)),
        }
    }

    /// Enqueue to every live connection. Connections whose queue is full
    /// are dropped from the hub and closed.
    pub fn broadcast(&self, env: &Envelope) {
        let mut evict = Vec::new();
        for entry in self.agents.iter() {
            if let Err(connection::LinkSendError::QueueFull) = entry.value().try_send(env) {
                evict.push(Arc::clone(entry.value()));
            }
        }
        for link in evict {
            tracing::warn!("dropping agent {} with saturated queue", link.agent_id);
            self.unregister(&link);
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentLink>> {
        self.agents.get(agent_id).map(|e| Arc::clone(e.value()))
    }

    pub fn online_ids(&self) -> Vec<String> {
        self.agents.iter().map(|e| e.key().clone()).collect()
    }

    pub fn online_count(&self) -> usize {
        self.agents.len()
    }
}
