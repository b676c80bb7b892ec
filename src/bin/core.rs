use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use probehub::{
    alerts::{AlertEvaluator, WebhookNotifier},
    api,
    config::{load_or_default, CoreConfig},
    hub::{handler::CoreState, Hub},
    storage::{sqlite::SqliteStore, MetricStore},
};
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short, long, default_value = "core.json")]
    config: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("probehub", LevelFilter::DEBUG),
        ("core", LevelFilter::DEBUG),
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

    let config: CoreConfig = load_or_default(&args.config)?;
    info!("starting core on {}", config.listen);

    let store = Arc::new(SqliteStore::new(&config.database).await?);

    let mut evaluator = AlertEvaluator::new(store.clone(), store.clone());
    if let Some(url) = &config.webhook_url {
        info!("alert webhook notifier enabled");
        evaluator.add_notifier(Arc::new(WebhookNotifier::new(url.clone())));
    }

    let state = CoreState {
        hub: Arc::new(Hub::new()),
        agents: store.clone(),
        metrics: store.clone(),
        traffic: store.clone(),
        tasks: store.clone(),
        scripts: store.clone(),
        evaluator: Arc::new(evaluator),
        agent_token: config.agent_token.clone(),
        geo_jobs: None,
    };

    spawn_retention_cleanup(
        store.clone(),
        config.retention_days,
        config.cleanup_interval_hours,
    );

    let app = api::router(state, true);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("core listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("core stopped");
    Ok(())
}

/// Periodically delete metric rows past the retention window.
fn spawn_retention_cleanup(
    metrics: Arc<SqliteStore>,
    retention_days: u32,
    interval_hours: u32,
) {
    let period = std::time::Duration::from_secs(u64::from(interval_hours.max(1)) * 3600);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(retention_days));
            match MetricStore::cleanup(metrics.as_ref(), cutoff).await {
                Ok(0) => {}
                Ok(deleted) => info!("retention cleanup deleted {deleted} metric rows"),
                Err(e) => error!("retention cleanup failed: {e}"),
            }
        }
    });
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => warn!("unable to listen for shutdown signal: {e}"),
    }
}
