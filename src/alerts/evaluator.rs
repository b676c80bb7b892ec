//! Threshold evaluation over the metric stream
//!
//! ## Dwell and cooldown
//!
//! A rule fires only once its condition has held continuously for
//! `duration_sec` (dwell); the evaluator keeps a per (rule, agent)
//! "continuously above since" timestamp which any non-exceeding sample
//! clears. After a firing, new firings for the same pair are suppressed
//! until `cooldown_sec` past the most recent trigger. A non-exceeding
//! sample while an instance is firing resolves it; firing -> resolved is
//! terminal for that instance.
//!
//! Evaluation for a sample runs under one lock so that the firing lookup
//! and insert are atomic: concurrent identical samples produce at most one
//! firing instance per (rule, agent).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::protocol::MetricsPayload;
use crate::storage::{
    AlertInstance, AlertMetric, AlertRule, AlertStatus, AlertStore, TrafficStore,
};

use super::notify::Notifier;

pub struct AlertEvaluator {
    alerts: Arc<dyn AlertStore>,
    traffic: Arc<dyn TrafficStore>,
    notifiers: Vec<Arc<dyn Notifier>>,

    /// Per (rule, agent) timestamp since which the condition has held.
    above_since: Mutex<HashMap<(String, String), DateTime<Utc>>>,
}

impl AlertEvaluator {
    pub fn new(alerts: Arc<dyn AlertStore>, traffic: Arc<dyn TrafficStore>) -> Self {
        Self {
            alerts,
            traffic,
            notifiers: Vec::new(),
            above_since: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_notifier(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    /// Evaluate one arriving sample against every enabled rule.
    pub async fn evaluate(&self, agent_id: &str, sample: &MetricsPayload) {
        let rules = match self.alerts.list_enabled_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                warn!("failed to load alert rules: {e}");
                return;
            }
        };

        // Serializes the check-and-insert step across concurrent samples.
        let mut above_since = self.above_since.lock().await;

        for rule in rules {
            if !rule.agent_ids.is_empty() && !rule.agent_ids.iter().any(|id| id == agent_id) {
                continue;
            }

            let value = self.metric_value(&rule, agent_id, sample).await;
            let exceeded = rule.exceeded(value);
            let now = Utc::now();
            let key = (rule.id.clone(), agent_id.to_string());

            trace!(
                "rule {} agent {agent_id}: value {value:.2} threshold {:.2} exceeded={exceeded}",
                rule.name, rule.threshold
            );

            if exceeded {
                let since = *above_since.entry(key).or_insert(now);
                let held = (now - since).num_seconds();
                if held < rule.duration_sec as i64 {
                    trace!(
                        "rule {} agent {agent_id}: dwell {held}s of {}s, not firing yet",
                        rule.name, rule.duration_sec
                    );
                    continue;
                }

                self.fire(&rule, agent_id, value, now).await;
            } else {
                above_since.remove(&key);
                self.resolve(&rule, agent_id, now).await;
            }
        }
    }

    async fn fire(&self, rule: &AlertRule, agent_id: &str, value: f64, now: DateTime<Utc>) {
        let existing = match self.alerts.firing(&rule.id, agent_id).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!("firing lookup failed for rule {}: {e}", rule.id);
                return;
            }
        };
        if existing.is_some() {
            return;
        }

        // cooldown: suppress while inside the window after the last trigger
        match self.alerts.last_trigger(&rule.id, agent_id).await {
            Ok(Some(last)) => {
                let cooldown_end = last + chrono::Duration::seconds(rule.cooldown_sec as i64);
                if now < cooldown_end {
                    debug!(
                        "rule {} agent {agent_id}: suppressed by cooldown until {cooldown_end}",
                        rule.name
                    );
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("last trigger lookup failed for rule {}: {e}", rule.id);
                return;
            }
        }

        let alert = AlertInstance {
            id: Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            agent_id: agent_id.to_string(),
            status: AlertStatus::Firing,
            metric: rule.metric,
            value,
            threshold: rule.threshold,
            message: format_message(rule, value),
            triggered_at: now,
            resolved_at: None,
        };

        if let Err(e) = self.alerts.create(alert.clone()).await {
            warn!("failed to persist alert for rule {}: {e}", rule.id);
            return;
        }

        debug!("alert firing: {}", alert.message);
        self.dispatch(alert, false);
    }

    async fn resolve(&self, rule: &AlertRule, agent_id: &str, now: DateTime<Utc>) {
        let existing = match self.alerts.firing(&rule.id, agent_id).await {
            Ok(Some(existing)) => existing,
            Ok(None) => return,
            Err(e) => {
                warn!("firing lookup failed for rule {}: {e}", rule.id);
                return;
            }
        };

        if let Err(e) = self.alerts.resolve(&existing.id, now).await {
            warn!("failed to resolve alert {}: {e}", existing.id);
            return;
        }

        let resolved = AlertInstance {
            status: AlertStatus::Resolved,
            resolved_at: Some(now),
            ..existing
        };

        debug!("alert resolved: {}", resolved.message);
        self.dispatch(resolved, true);
    }

    /// Fan notifications out without waiting on any transport.
    fn dispatch(&self, alert: AlertInstance, recovery: bool) {
        for notifier in &self.notifiers {
            let notifier = Arc::clone(notifier);
            let alert = alert.clone();
            tokio::spawn(async move {
                if recovery {
                    notifier.send_recovery(&alert).await;
                } else {
                    notifier.send(&alert).await;
                }
            });
        }
    }

    async fn metric_value(&self, rule: &AlertRule, agent_id: &str, sample: &MetricsPayload) -> f64 {
        match rule.metric {
            AlertMetric::Cpu => sample.cpu,
            AlertMetric::Memory => sample.memory.percent,
            AlertMetric::Disk => sample
                .disks
                .iter()
                .map(|d| d.percent)
                .fold(0.0, f64::max),
            AlertMetric::Traffic => match self.traffic.stats(agent_id).await {
                Ok(stats) => stats.usage_percent,
                Err(e) => {
                    warn!("traffic stats lookup failed for {agent_id}: {e}");
                    0.0
                }
            },
        }
    }
}

fn format_message(rule: &AlertRule, value: f64) -> String {
    format!(
        "[{}] {}: {:.2} (threshold: {:.2})",
        rule.metric, rule.name, value, rule.threshold
    )
}
