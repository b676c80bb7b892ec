//! Handshake and connection lifecycle scenarios

use std::time::Duration;

use chrono::Utc;
use probehub::protocol::{ErrorPayload, MessageType, TaskAssignPayload, TaskKind};
use probehub::storage::{AgentRegistration, AgentRegistry, AgentStatus, TaskRecord, TaskStatus};

use crate::helpers::*;

#[tokio::test]
async fn happy_handshake_brings_agent_online() {
    let core = spawn_core("T").await;
    let mut ws = connect(&core).await;

    let agent_id = handshake(&mut ws, "h1", "T").await;
    assert!(!agent_id.is_empty());

    assert!(wait_until(Duration::from_secs(2), || core.hub.online_count() == 1).await);
    assert_eq!(core.hub.online_ids(), vec![agent_id.clone()]);

    let record = core.store.get(&agent_id).await.unwrap().unwrap();
    assert_eq!(record.hostname, "h1");
    assert_eq!(record.status, AgentStatus::Online);
}

#[tokio::test]
async fn wrong_token_is_rejected_with_error_frame() {
    let core = spawn_core("T").await;
    let mut ws = connect(&core).await;

    send(&mut ws, &register_envelope("h1", "WRONG")).await;

    let reply = next_envelope(&mut ws).await.expect("expected error frame");
    assert_eq!(reply.kind, MessageType::Error);
    let payload: ErrorPayload = reply.payload_as().unwrap();
    assert_eq!(payload.code, 400);
    assert_eq!(payload.message, "invalid token");

    // connection is closed and nothing was registered
    assert!(next_envelope(&mut ws).await.is_none());
    assert_eq!(core.hub.online_count(), 0);
}

#[tokio::test]
async fn empty_configured_token_disables_the_check() {
    let core = spawn_core("").await;
    let mut ws = connect(&core).await;

    let agent_id = handshake(&mut ws, "h1", "anything").await;
    assert!(wait_until(Duration::from_secs(2), || core.hub.online_count() == 1).await);
    assert!(core.store.get(&agent_id).await.unwrap().is_some());
}

#[tokio::test]
async fn non_register_first_frame_closes_the_connection() {
    let core = spawn_core("T").await;
    let mut ws = connect(&core).await;

    send(
        &mut ws,
        &probehub::protocol::Envelope::empty(MessageType::Heartbeat),
    )
    .await;

    assert!(next_envelope(&mut ws).await.is_none());
    assert_eq!(core.hub.online_count(), 0);
}

#[tokio::test]
async fn new_handshake_supersedes_prior_connection() {
    let core = spawn_core("T").await;

    let mut first = connect(&core).await;
    let first_id = handshake(&mut first, "h1", "T").await;
    assert!(wait_until(Duration::from_secs(2), || core.hub.online_count() == 1).await);

    // same hostname: the registry re-binds to the same identifier and the
    // hub swaps the connection
    let mut second = connect(&core).await;
    let second_id = handshake(&mut second, "h1", "T").await;
    assert_eq!(first_id, second_id);

    // the prior connection is closed, never left dangling in the hub
    assert!(next_envelope(&mut first).await.is_none());
    assert_eq!(core.hub.online_count(), 1);

    // the superseded teardown must not mark the agent offline
    tokio::time::sleep(Duration::from_millis(200)).await;
    let record = core.store.get(&second_id).await.unwrap().unwrap();
    assert_eq!(record.status, AgentStatus::Online);
}

#[tokio::test]
async fn disconnect_marks_agent_offline() {
    let core = spawn_core("T").await;
    let mut ws = connect(&core).await;
    let agent_id = handshake(&mut ws, "h1", "T").await;

    drop(ws);

    assert!(wait_until(Duration::from_secs(2), || core.hub.online_count() == 0).await);

    let mut offline = false;
    for _ in 0..40 {
        let record = core.store.get(&agent_id).await.unwrap().unwrap();
        if record.status == AgentStatus::Offline {
            offline = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(offline, "agent was not marked offline after disconnect");
}

#[tokio::test]
async fn pending_tasks_are_pushed_on_handshake() {
    let core = spawn_core("T").await;

    // mint the identifier up front so the task can target it
    let record = core
        .store
        .register_or_update(AgentRegistration {
            hostname: "h1".to_string(),
            addr: "10.0.0.1".to_string(),
            os: "linux".to_string(),
            arch: "amd64".to_string(),
            version: "1.0.0".to_string(),
        })
        .await
        .unwrap();

    core.store.insert_task(TaskRecord {
        id: "T1".to_string(),
        kind: TaskKind::Ping,
        name: "probe loopback".to_string(),
        target: Some("127.0.0.1:1".to_string()),
        script_id: None,
        params: Default::default(),
        interval_sec: 0,
        timeout_sec: 5,
        status: TaskStatus::Pending,
        agent_ids: vec![record.id.clone()],
        created_at: Utc::now(),
        updated_at: Utc::now(),
    });

    // re-binding handshake picks the same id and receives the assignment
    let mut ws = connect(&core).await;
    let agent_id = handshake(&mut ws, "h1", "T").await;
    assert_eq!(agent_id, record.id);

    let assign = next_envelope(&mut ws).await.expect("expected task_assign");
    assert_eq!(assign.kind, MessageType::TaskAssign);
    let task: TaskAssignPayload = assign.payload_as().unwrap();
    assert_eq!(task.task_id, "T1");
    assert_eq!(task.kind, TaskKind::Ping);
    assert_eq!(task.target.as_deref(), Some("127.0.0.1:1"));
}
