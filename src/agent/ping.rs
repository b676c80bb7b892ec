//! TCP-connect reachability probes
//!
//! Works without raw sockets: a probe is a TCP connect to the target, and
//! latency is the time to an established connection. Targets without an
//! explicit port are probed on port 80.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

const DEFAULT_PROBES: u32 = 4;
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_SPACING: Duration = Duration::from_millis(200);

/// Serialized into the task result's `output` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingOutcome {
    pub target: String,
    /// Mean connect latency over successful probes in ms; -1 when all failed.
    pub latency: f64,
    /// Failed probes as a percentage of all probes.
    pub packet_loss: f64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PingProber {
    dial_timeout: Duration,
    probes: u32,
}

impl Default for PingProber {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            probes: DEFAULT_PROBES,
        }
    }
}

impl PingProber {
    pub fn new(dial_timeout: Duration, probes: u32) -> Self {
        Self {
            dial_timeout: if dial_timeout.is_zero() {
                DEFAULT_DIAL_TIMEOUT
            } else {
                dial_timeout
            },
            probes: if probes == 0 { DEFAULT_PROBES } else { probes },
        }
    }

    /// Run the probe series sequentially; cancellation is observed between
    /// probes and inside each dial.
    pub async fn execute(&self, cancel: &CancellationToken, target: &str) -> PingOutcome {
        let addr = with_default_port(target);

        let mut successes = 0u32;
        let mut total_latency = 0.0f64;

        for i in 0..self.probes {
            if cancel.is_cancelled() {
                return PingOutcome {
                    target: target.to_string(),
                    latency: -1.0,
                    packet_loss: 100.0,
                    success: false,
                    error: Some("cancelled".to_string()),
                };
            }

            if let Some(latency) = self.probe_once(cancel, &addr).await {
                successes += 1;
                total_latency += latency;
            }

            if i + 1 < self.probes {
                tokio::select! {
                    _ = sleep(PROBE_SPACING) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }

        let packet_loss = f64::from(self.probes - successes) / f64::from(self.probes) * 100.0;

        if successes > 0 {
            PingOutcome {
                target: target.to_string(),
                latency: total_latency / f64::from(successes),
                packet_loss,
                success: true,
                error: None,
            }
        } else {
            PingOutcome {
                target: target.to_string(),
                latency: -1.0,
                packet_loss,
                success: false,
                error: Some("all pings failed".to_string()),
            }
        }
    }

    /// One connect attempt; `Some(latency_ms)` on success.
    async fn probe_once(&self, cancel: &CancellationToken, addr: &str) -> Option<f64> {
        let start = Instant::now();
        tokio::select! {
            res = timeout(self.dial_timeout, TcpStream::connect(addr)) => match res {
                Ok(Ok(_conn)) => Some(start.elapsed().as_secs_f64() * 1000.0),
                _ => None,
            },
            _ = cancel.cancelled() => None,
        }
    }
}

fn with_default_port(target: &str) -> String {
    if target.contains(':') {
        target.to_string()
    } else {
        format!("{target}:80")
    }
}
