use std::sync::Arc;

use clap::Parser;
use probehub::{
    agent::{collector, connection::MessageHandler, AgentClient, TaskRuntime},
    config::{load_or_default, AgentConfig},
    protocol::{ConfigPayload, Envelope, MessageType, TaskAssignPayload},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long running tasks get to observe cancellation at shutdown.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(3);

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(long, default_value = "agent.json")]
    config: String,

    /// Core WebSocket URL (overrides the config file)
    #[arg(long)]
    server: Option<String>,

    /// Authentication token (overrides the config file)
    #[arg(long)]
    token: Option<String>,

    /// Metric collection interval in seconds (overrides the config file)
    #[arg(long)]
    interval: Option<u64>,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("probehub", LevelFilter::DEBUG),
        ("agent", LevelFilter::DEBUG),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let mut config: AgentConfig = load_or_default(&args.config)?;
    if let Some(server) = args.server {
        config.server_url = server;
    }
    if let Some(token) = args.token {
        config.token = token;
    }
    if let Some(interval) = args.interval {
        config.metric_interval = interval;
    }

    if config.server_url.is_empty() {
        anyhow::bail!("server URL is required (--server or config file)");
    }
    let ws_url = ws_url(&config.server_url)?;
    let http_base = http_base(&ws_url);

    info!("probe agent v{VERSION} starting");
    info!("core: {ws_url}");

    let shutdown = CancellationToken::new();
    let client = AgentClient::new(ws_url, config.token.clone(), VERSION.to_string());

    let (runtime, mut result_rx) = TaskRuntime::new(
        http_base,
        config.script_dir.clone(),
        shutdown.child_token(),
    );

    let (interval_tx, interval_rx) = tokio::sync::watch::channel(config.metric_interval.max(1));

    // demux frames from the core
    let handler: MessageHandler = {
        let runtime = Arc::clone(&runtime);
        Arc::new(move |env: Envelope| match env.kind {
            MessageType::TaskAssign => match env.payload_as::<TaskAssignPayload>() {
                Ok(task) => {
                    info!("received task {} ({})", task.task_id, task.kind);
                    runtime.handle_assign(task);
                }
                Err(e) => warn!("invalid task payload: {e}"),
            },
            MessageType::Config => match env.payload_as::<ConfigPayload>() {
                Ok(config) if config.metric_interval > 0 => {
                    info!("metric interval updated to {}s", config.metric_interval);
                    let _ = interval_tx.send(config.metric_interval);
                }
                Ok(_) => {}
                Err(e) => warn!("invalid config payload: {e}"),
            },
            other => debug!("ignoring {other:?} frame"),
        })
    };

    // connection, heartbeat, and collector loops run until shutdown;
    // each observes the disconnected state independently
    let connection = {
        let client = client.clone();
        let shutdown = shutdown.child_token();
        tokio::spawn(async move { client.run(handler, shutdown).await })
    };

    {
        let client = client.clone();
        let shutdown = shutdown.child_token();
        tokio::spawn(async move { client.heartbeat_loop(shutdown).await });
    }

    {
        let client = client.clone();
        let shutdown = shutdown.child_token();
        tokio::spawn(async move { collector::run(client, interval_rx, shutdown).await });
    }

    // forward task results; drops are logged by the runtime side
    {
        let client = client.clone();
        tokio::spawn(async move {
            while let Some(result) = result_rx.recv().await {
                if let Err(e) = client.send_task_result(&result) {
                    warn!("failed to send result for task {}: {e}", result.task_id);
                }
            }
        });
    }

    wait_for_signal().await;
    info!("shutting down");

    runtime.shutdown();
    shutdown.cancel();
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    let _ = connection.await;
    info!("agent stopped");
    Ok(())
}

/// Accept ws://, wss://, or http(s):// core URLs; normalize to WebSocket,
/// and append the agent endpoint path when the URL carries none.
fn ws_url(server_url: &str) -> anyhow::Result<String> {
    let url = server_url
        .replace("http://", "ws://")
        .replace("https://", "wss://");

    if !url.starts_with("ws://") && !url.starts_with("wss://") {
        anyhow::bail!("invalid server URL: {server_url}");
    }

    let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or("");
    if after_scheme.is_empty() {
        anyhow::bail!("invalid server URL: {server_url}");
    }

    if after_scheme.contains('/') {
        Ok(url)
    } else {
        Ok(format!("{url}/api/agent/ws"))
    }
}

/// HTTP base for script downloads, derived from the WebSocket URL.
fn http_base(ws_url: &str) -> String {
    let http = ws_url
        .replacen("wss://", "https://", 1)
        .replacen("ws://", "http://", 1);
    match http.split_once("://") {
        Some((scheme, rest)) => {
            let authority = rest.split('/').next().unwrap_or(rest);
            format!("{scheme}://{authority}")
        }
        None => http,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_normalizes_schemes() {
        assert_eq!(
            ws_url("http://core:8080").unwrap(),
            "ws://core:8080/api/agent/ws"
        );
        assert_eq!(
            ws_url("wss://core/api/agent/ws").unwrap(),
            "wss://core/api/agent/ws"
        );
        assert!(ws_url("ftp://core").is_err());
        assert!(ws_url("ws://").is_err());
    }

    #[test]
    fn http_base_strips_path() {
        assert_eq!(http_base("ws://core:8080/api/agent/ws"), "http://core:8080");
        assert_eq!(http_base("wss://core/api/agent/ws"), "https://core");
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("unable to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!("unable to listen for SIGTERM: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
