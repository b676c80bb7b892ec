//! End-to-end flows through the real agent client and task runtime

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use probehub::agent::{connection::MessageHandler, AgentClient, TaskRuntime};
use probehub::protocol::{Envelope, MessageType, TaskAssignPayload, TaskKind};
use probehub::storage::ScriptRecord;
use tokio_util::sync::CancellationToken;

use crate::helpers::*;

struct RunningAgent {
    client: AgentClient,
    shutdown: CancellationToken,
    _scripts: tempfile::TempDir,
}

/// Wire a real agent against a test core: connection loop, task runtime,
/// and result forwarding, the way the agent binary assembles them.
async fn start_agent(core: &TestCore, token: &str) -> RunningAgent {
    let shutdown = CancellationToken::new();
    let client = AgentClient::new(core.ws_url(), token.to_string(), "1.0.0".to_string());

    let scripts = tempfile::tempdir().unwrap();
    let (runtime, mut result_rx) = TaskRuntime::new(
        core.http_base(),
        scripts.path().to_string_lossy().into_owned(),
        shutdown.child_token(),
    );

    let handler: MessageHandler = {
        let runtime = Arc::clone(&runtime);
        Arc::new(move |env: Envelope| {
            if env.kind == MessageType::TaskAssign {
                if let Ok(task) = env.payload_as::<TaskAssignPayload>() {
                    runtime.handle_assign(task);
                }
            }
        })
    };

    {
        let client = client.clone();
        let shutdown = shutdown.child_token();
        tokio::spawn(async move { client.run(handler, shutdown).await });
    }

    {
        let client = client.clone();
        tokio::spawn(async move {
            while let Some(result) = result_rx.recv().await {
                let _ = client.send_task_result(&result);
            }
        });
    }

    RunningAgent {
        client,
        shutdown,
        _scripts: scripts,
    }
}

#[tokio::test]
async fn agent_client_registers_and_reports_online() {
    let core = spawn_core("T").await;
    let agent = start_agent(&core, "T").await;

    let client = agent.client.clone();
    assert!(wait_until(Duration::from_secs(5), move || client.is_connected()).await);
    assert_eq!(core.hub.online_count(), 1);

    let agent_id = agent.client.agent_id().unwrap();
    assert_eq!(core.hub.online_ids(), vec![agent_id]);

    agent.shutdown.cancel();
}

#[tokio::test]
async fn one_shot_ping_task_round_trips_a_result() {
    let core = spawn_core("T").await;
    let agent = start_agent(&core, "T").await;

    let client = agent.client.clone();
    assert!(wait_until(Duration::from_secs(5), move || client.is_connected()).await);
    let agent_id = agent.client.agent_id().unwrap();

    // admin layer pushes the assignment through the hub
    let assign = Envelope::new(
        MessageType::TaskAssign,
        &TaskAssignPayload {
            task_id: "T1".to_string(),
            kind: TaskKind::Ping,
            target: Some("127.0.0.1:1".to_string()),
            script_id: None,
            params: HashMap::new(),
            interval: 0,
            timeout: 5,
        },
    )
    .unwrap();
    core.hub.send_to(&agent_id, &assign).unwrap();

    let store = core.store.clone();
    assert!(wait_until(Duration::from_secs(10), move || store.result_count("T1") == 1).await);

    // probes against the closed loopback port fail as a group
    let results = probehub::storage::TaskStore::results(core.store.as_ref(), "T1", 10)
        .await
        .unwrap();
    assert!(!results[0].success);
    assert!(results[0].output.contains("\"packet_loss\":100"));
    assert_eq!(results[0].agent_id, agent_id);

    agent.shutdown.cancel();
}

#[cfg(unix)]
#[tokio::test]
async fn script_task_downloads_verifies_and_runs() {
    let core = spawn_core("T").await;

    let content = "#!/bin/sh\necho hello\n";
    let checksum = {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hex::encode(hasher.finalize())
    };
    core.store.insert_script(ScriptRecord {
        id: "S".to_string(),
        name: "hello".to_string(),
        content: content.to_string(),
        checksum: checksum.clone(),
    });

    let agent = start_agent(&core, "T").await;
    let client = agent.client.clone();
    assert!(wait_until(Duration::from_secs(5), move || client.is_connected()).await);
    let agent_id = agent.client.agent_id().unwrap();

    let mut params = HashMap::new();
    params.insert("checksum".to_string(), checksum);
    let assign = Envelope::new(
        MessageType::TaskAssign,
        &TaskAssignPayload {
            task_id: "T2".to_string(),
            kind: TaskKind::Script,
            target: None,
            script_id: Some("S".to_string()),
            params,
            interval: 0,
            timeout: 10,
        },
    )
    .unwrap();
    core.hub.send_to(&agent_id, &assign).unwrap();

    let store = core.store.clone();
    assert!(wait_until(Duration::from_secs(10), move || store.result_count("T2") == 1).await);

    let results = probehub::storage::TaskStore::results(core.store.as_ref(), "T2", 10)
        .await
        .unwrap();
    assert!(results[0].success);
    assert_eq!(results[0].output, "hello\n");

    agent.shutdown.cancel();
}

#[cfg(unix)]
#[tokio::test]
async fn script_checksum_mismatch_aborts_without_running() {
    let core = spawn_core("T").await;

    core.store.insert_script(ScriptRecord {
        id: "S2".to_string(),
        name: "tampered".to_string(),
        content: "#!/bin/sh\necho should-not-run\n".to_string(),
        checksum: "ignored".to_string(),
    });

    let agent = start_agent(&core, "T").await;
    let client = agent.client.clone();
    assert!(wait_until(Duration::from_secs(5), move || client.is_connected()).await);
    let agent_id = agent.client.agent_id().unwrap();

    let mut params = HashMap::new();
    params.insert("checksum".to_string(), "0".repeat(64));
    let assign = Envelope::new(
        MessageType::TaskAssign,
        &TaskAssignPayload {
            task_id: "T3".to_string(),
            kind: TaskKind::Script,
            target: None,
            script_id: Some("S2".to_string()),
            params,
            interval: 0,
            timeout: 10,
        },
    )
    .unwrap();
    core.hub.send_to(&agent_id, &assign).unwrap();

    let store = core.store.clone();
    assert!(wait_until(Duration::from_secs(10), move || store.result_count("T3") == 1).await);

    let results = probehub::storage::TaskStore::results(core.store.as_ref(), "T3", 10)
        .await
        .unwrap();
    assert!(!results[0].success);
    assert!(results[0].error.contains("checksum mismatch"));
    // the shell never ran, so no stdout was captured
    assert!(results[0].output.is_empty());

    agent.shutdown.cancel();
}

#[cfg(unix)]
#[tokio::test]
async fn script_failing_silently_still_reports_an_error() {
    let core = spawn_core("T").await;

    // exits non-zero without writing a byte to stdout or stderr
    core.store.insert_script(ScriptRecord {
        id: "S3".to_string(),
        name: "silent failure".to_string(),
        content: "#!/bin/sh\nexit 7\n".to_string(),
        checksum: String::new(),
    });

    let agent = start_agent(&core, "T").await;
    let client = agent.client.clone();
    assert!(wait_until(Duration::from_secs(5), move || client.is_connected()).await);
    let agent_id = agent.client.agent_id().unwrap();

    let assign = Envelope::new(
        MessageType::TaskAssign,
        &TaskAssignPayload {
            task_id: "T5".to_string(),
            kind: TaskKind::Script,
            target: None,
            script_id: Some("S3".to_string()),
            params: HashMap::new(),
            interval: 0,
            timeout: 10,
        },
    )
    .unwrap();
    core.hub.send_to(&agent_id, &assign).unwrap();

    let store = core.store.clone();
    assert!(wait_until(Duration::from_secs(10), move || store.result_count("T5") == 1).await);

    let results = probehub::storage::TaskStore::results(core.store.as_ref(), "T5", 10)
        .await
        .unwrap();
    assert!(!results[0].success);
    assert_eq!(results[0].error, "script exited with code 7");

    agent.shutdown.cancel();
}

#[tokio::test]
async fn recurring_assignment_cadence_changes_on_reassign() {
    let core = spawn_core("T").await;
    let agent = start_agent(&core, "T").await;

    let client = agent.client.clone();
    assert!(wait_until(Duration::from_secs(5), move || client.is_connected()).await);
    let agent_id = agent.client.agent_id().unwrap();

    let assign = |interval: u32| {
        Envelope::new(
            MessageType::TaskAssign,
            &TaskAssignPayload {
                task_id: "T4".to_string(),
                kind: TaskKind::Ping,
                target: Some("127.0.0.1:1".to_string()),
                script_id: None,
                params: HashMap::new(),
                interval,
                timeout: 5,
            },
        )
        .unwrap()
    };

    // slow cadence first
    core.hub.send_to(&agent_id, &assign(3600)).unwrap();
    let store = core.store.clone();
    assert!(wait_until(Duration::from_secs(10), move || store.result_count("T4") == 1).await);

    // reassigning the same task id replaces the schedule
    core.hub.send_to(&agent_id, &assign(1)).unwrap();
    let store = core.store.clone();
    assert!(wait_until(Duration::from_secs(15), move || store.result_count("T4") >= 3).await);

    agent.shutdown.cancel();
}
