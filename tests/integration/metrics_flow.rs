//! Metric ingestion, traffic accounting, and streaming alert scenarios

use std::time::Duration;

use probehub::protocol::{Envelope, MessageType, TaskResultPayload};
use probehub::storage::{
    AlertMetric, AlertOperator, AlertRule, AlertStatus, MetricStore, TrafficStore,
};

use crate::helpers::*;

fn cpu_rule(threshold: f64, cooldown_sec: u32) -> AlertRule {
    AlertRule {
        id: "R".to_string(),
        name: "cpu high".to_string(),
        metric: AlertMetric::Cpu,
        operator: AlertOperator::Gt,
        threshold,
        duration_sec: 0,
        cooldown_sec,
        agent_ids: vec![],
        enabled: true,
    }
}

#[tokio::test]
async fn metrics_are_persisted() {
    let core = spawn_core("T").await;
    let mut ws = connect(&core).await;
    let agent_id = handshake(&mut ws, "h1", "T").await;

    let env = Envelope::new(MessageType::Metrics, &metrics_sample(42.0)).unwrap();
    send(&mut ws, &env).await;

    let store = core.store.clone();
    let mut stored = None;
    for _ in 0..40 {
        stored = store.latest(&agent_id).await.unwrap();
        if stored.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let row = stored.expect("metrics were not persisted");
    assert_eq!(row.sample.cpu, 42.0);
    assert_eq!(row.sample.memory.percent, 50.0);
}

#[tokio::test]
async fn invalid_metrics_are_rejected() {
    let core = spawn_core("T").await;
    let mut ws = connect(&core).await;
    let agent_id = handshake(&mut ws, "h1", "T").await;

    // cpu out of range: the sample must be rejected, not clamped
    let env = Envelope::new(MessageType::Metrics, &metrics_sample(150.0)).unwrap();
    send(&mut ws, &env).await;

    // a valid follow-up proves the connection survived the rejection
    let env = Envelope::new(MessageType::Metrics, &metrics_sample(10.0)).unwrap();
    send(&mut ws, &env).await;

    let store = core.store.clone();
    let mut latest = None;
    for _ in 0..40 {
        latest = store.latest(&agent_id).await.unwrap();
        if latest.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let row = latest.expect("valid sample was not persisted");
    assert_eq!(row.sample.cpu, 10.0);

    let history = store
        .history(
            &agent_id,
            chrono::Utc::now() - chrono::Duration::minutes(1),
            chrono::Utc::now() + chrono::Duration::minutes(1),
        )
        .await
        .unwrap();
    assert_eq!(history.len(), 1, "rejected sample must not be stored");
}

#[tokio::test]
async fn traffic_records_deltas_of_cumulative_counters() {
    let core = spawn_core("T").await;
    let mut ws = connect(&core).await;
    let agent_id = handshake(&mut ws, "h1", "T").await;

    let mut first = metrics_sample(10.0);
    first.network.bytes_sent = 1_000;
    first.network.bytes_recv = 2_000;
    send(&mut ws, &Envelope::new(MessageType::Metrics, &first).unwrap()).await;

    let mut second = metrics_sample(10.0);
    second.network.bytes_sent = 1_500;
    second.network.bytes_recv = 2_300;
    send(&mut ws, &Envelope::new(MessageType::Metrics, &second).unwrap()).await;

    let store = core.store.clone();
    let mut stats = Default::default();
    for _ in 0..40 {
        stats = store.stats(&agent_id).await.unwrap();
        if stats.bytes_sent > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // first sample only establishes the baseline
    assert_eq!(stats.bytes_sent, 500);
    assert_eq!(stats.bytes_recv, 300);

    // counter reset: the delta is dropped, totals unchanged
    let mut reset = metrics_sample(10.0);
    reset.network.bytes_sent = 10;
    reset.network.bytes_recv = 10;
    send(&mut ws, &Envelope::new(MessageType::Metrics, &reset).unwrap()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stats = store.stats(&agent_id).await.unwrap();
    assert_eq!(stats.bytes_sent, 500);
    assert_eq!(stats.bytes_recv, 300);
}

#[tokio::test]
async fn traffic_alert_fires_when_cycle_budget_is_consumed() {
    let core = spawn_core("T").await;
    core.store.insert_rule(AlertRule {
        id: "R-T".to_string(),
        name: "traffic budget".to_string(),
        metric: AlertMetric::Traffic,
        operator: AlertOperator::Gt,
        threshold: 50.0,
        duration_sec: 0,
        cooldown_sec: 0,
        agent_ids: vec![],
        enabled: true,
    });

    let mut ws = connect(&core).await;
    let agent_id = handshake(&mut ws, "h1", "T").await;

    core.store
        .configure_cycle(&agent_id, chrono::Utc::now(), 30, 1_000)
        .await
        .unwrap();

    // baseline counters, then +800 bytes: 80% of the cycle budget
    let first = metrics_sample(10.0);
    send(&mut ws, &Envelope::new(MessageType::Metrics, &first).unwrap()).await;

    let mut second = metrics_sample(10.0);
    second.network.bytes_sent = 600;
    second.network.bytes_recv = 200;
    send(&mut ws, &Envelope::new(MessageType::Metrics, &second).unwrap()).await;

    let store = core.store.clone();
    assert!(wait_until(Duration::from_secs(2), move || store.alert_count() == 1).await);

    let alert = core.store.alerts().pop().unwrap();
    assert_eq!(alert.value, 80.0);
    assert_eq!(alert.threshold, 50.0);
}

#[tokio::test]
async fn alert_fires_resolves_and_cooldown_suppresses() {
    let core = spawn_core("T").await;
    core.store.insert_rule(cpu_rule(90.0, 300));

    let mut ws = connect(&core).await;
    let _agent_id = handshake(&mut ws, "h1", "T").await;

    // cpu=95 -> firing
    send(
        &mut ws,
        &Envelope::new(MessageType::Metrics, &metrics_sample(95.0)).unwrap(),
    )
    .await;
    let store = core.store.clone();
    assert!(wait_until(Duration::from_secs(2), move || store.alert_count() == 1).await);

    // cpu=88 -> resolved
    send(
        &mut ws,
        &Envelope::new(MessageType::Metrics, &metrics_sample(88.0)).unwrap(),
    )
    .await;
    let store = core.store.clone();
    assert!(
        wait_until(Duration::from_secs(2), move || {
            store
                .alerts()
                .first()
                .is_some_and(|a| a.status == AlertStatus::Resolved && a.resolved_at.is_some())
        })
        .await
    );

    // cpu=96 inside the cooldown window -> suppressed
    send(
        &mut ws,
        &Envelope::new(MessageType::Metrics, &metrics_sample(96.0)).unwrap(),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(core.store.alert_count(), 1);
}

#[tokio::test]
async fn task_results_are_persisted() {
    let core = spawn_core("T").await;
    let mut ws = connect(&core).await;
    let _agent_id = handshake(&mut ws, "h1", "T").await;

    let env = Envelope::new(
        MessageType::TaskResult,
        &TaskResultPayload {
            task_id: "T1".to_string(),
            success: false,
            output: "{\"latency\":-1,\"packet_loss\":100}".to_string(),
            error: Some("all pings failed".to_string()),
            duration: 812,
        },
    )
    .unwrap();
    send(&mut ws, &env).await;

    let store = core.store.clone();
    assert!(wait_until(Duration::from_secs(2), move || store.result_count("T1") == 1).await);
}

#[tokio::test]
async fn duplicate_frame_ids_are_noops() {
    let core = spawn_core("T").await;
    let mut ws = connect(&core).await;
    let _agent_id = handshake(&mut ws, "h1", "T").await;

    let env = Envelope::new(
        MessageType::TaskResult,
        &TaskResultPayload {
            task_id: "T2".to_string(),
            success: true,
            output: String::new(),
            error: None,
            duration: 5,
        },
    )
    .unwrap();

    // identical id delivered twice: the second is discarded silently
    send(&mut ws, &env).await;
    send(&mut ws, &env).await;

    let store = core.store.clone();
    assert!(wait_until(Duration::from_secs(2), move || store.result_count("T2") == 1).await);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(core.store.result_count("T2"), 1);
}
