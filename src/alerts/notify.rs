//! Alert notification transports
//!
//! Notifier dispatch is fire-and-forget: the evaluator invokes every
//! registered notifier concurrently and a failing transport never affects
//! persistence of the alert instance. Email and instant-message transports
//! live outside this crate; the generic JSON webhook ships in-tree.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tracing::{error, info};

use crate::storage::AlertInstance;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, alert: &AlertInstance);

    async fn send_recovery(&self, alert: &AlertInstance);
}

/// POSTs alert events as JSON to a configured endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }

    async fn post(&self, event: &str, alert: &AlertInstance) {
        let payload = json!({
            "event": event,
            "alert_id": alert.id,
            "rule_id": alert.rule_id,
            "agent_id": alert.agent_id,
            "metric": alert.metric.to_string(),
            "value": alert.value,
            "threshold": alert.threshold,
            "message": alert.message,
            "timestamp": Utc::now().to_rfc3339(),
        });

        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("sent {event} webhook for alert {}", alert.id);
                } else {
                    error!(
                        "{event} webhook for alert {} failed with status {}",
                        alert.id,
                        response.status()
                    );
                }
            }
            Err(e) => {
                error!("failed to send {event} webhook for alert {}: {e}", alert.id);
            }
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, alert: &AlertInstance) {
        self.post("alert", alert).await;
    }

    async fn send_recovery(&self, alert: &AlertInstance) {
        self.post("recovery", alert).await;
    }
}
