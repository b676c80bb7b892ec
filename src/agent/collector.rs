//! Host metric sampling
//!
//! Samples CPU, memory, per-mount disk usage, and network counters on a
//! fixed cadence. Network rates are derived from the deltas between
//! successive cumulative counters; the first sample after startup and any
//! counter reset yield a rate of zero.

use std::time::Duration;

use sysinfo::{Disks, Networks, System};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::protocol::{DiskStats, MemoryStats, MetricsPayload, NetworkStats};

use super::connection::{AgentClient, SendError};

pub struct MetricCollector {
    sys: System,
    last_counters: Option<(u64, u64)>,
    last_sampled: Option<Instant>,
}

impl Default for MetricCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricCollector {
    pub fn new() -> Self {
        Self {
            sys: System::new_all(),
            last_counters: None,
            last_sampled: None,
        }
    }

    /// Take one snapshot of the host.
    pub fn sample(&mut self) -> MetricsPayload {
        self.sys.refresh_all();

        let cpu = f64::from(self.sys.global_cpu_usage()).clamp(0.0, 100.0);

        let total = self.sys.total_memory();
        let used = self.sys.used_memory();
        let memory = MemoryStats {
            total,
            used,
            available: self.sys.available_memory(),
            percent: if total > 0 {
                used as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        };

        let disks = Disks::new_with_refreshed_list()
            .iter()
            .filter(|disk| disk.total_space() > 0)
            .map(|disk| {
                let total = disk.total_space();
                let available = disk.available_space();
                let used = total - available;
                DiskStats {
                    path: disk.mount_point().to_string_lossy().into_owned(),
                    total,
                    used,
                    available,
                    percent: used as f64 / total as f64 * 100.0,
                }
            })
            .collect();

        let networks = Networks::new_with_refreshed_list();
        let mut bytes_sent = 0u64;
        let mut bytes_recv = 0u64;
        for (_, data) in networks.iter() {
            bytes_sent += data.total_transmitted();
            bytes_recv += data.total_received();
        }

        let now = Instant::now();
        let elapsed = self
            .last_sampled
            .map(|at| now.duration_since(at).as_secs_f64())
            .unwrap_or(0.0);
        let (sent_rate, recv_rate) = match self.last_counters {
            Some((last_sent, last_recv)) => (
                derive_rate(last_sent, bytes_sent, elapsed),
                derive_rate(last_recv, bytes_recv, elapsed),
            ),
            None => (0, 0),
        };
        self.last_counters = Some((bytes_sent, bytes_recv));
        self.last_sampled = Some(now);

        MetricsPayload {
            cpu,
            memory,
            disks,
            network: NetworkStats {
                bytes_sent,
                bytes_recv,
                bytes_sent_rate: sent_rate,
                bytes_recv_rate: recv_rate,
            },
        }
    }
}

/// Bytes-per-second from two cumulative counter readings. A reset
/// (current below previous) or a degenerate elapsed window yields zero.
pub(crate) fn derive_rate(previous: u64, current: u64, elapsed_secs: f64) -> u64 {
    if current < previous || elapsed_secs <= 0.0 {
        return 0;
    }
    ((current - previous) as f64 / elapsed_secs) as u64
}

/// Sample on a cadence and push frames best-effort. The cadence follows
/// `interval_secs`, which `config` frames from the core may change at any
/// time.
pub async fn run(
    client: AgentClient,
    mut interval_rx: tokio::sync::watch::Receiver<u64>,
    shutdown: CancellationToken,
) {
    let mut collector = MetricCollector::new();
    let mut cadence = *interval_rx.borrow();
    let mut ticker = make_ticker(cadence);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            changed = interval_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = *interval_rx.borrow();
                if next != cadence && next > 0 {
                    debug!("metric interval changed to {next}s");
                    cadence = next;
                    ticker = make_ticker(cadence);
                }
            }

            _ = ticker.tick() => {
                let sample = collector.sample();
                match client.send_metrics(&sample) {
                    Ok(()) => trace!("metrics sample enqueued"),
                    Err(SendError::Disconnected) => trace!("metrics deferred, not connected"),
                    Err(SendError::QueueFull) => debug!("metrics dropped, queue full"),
                }
            }
        }
    }

    debug!("metric collector stopped");
}

fn make_ticker(cadence_secs: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(cadence_secs.max(1));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
