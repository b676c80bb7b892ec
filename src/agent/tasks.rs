//! Agent task runtime
//!
//! Owns the lifecycle of every accepted assignment. The table is keyed by
//! task id; re-assigning an id REPLACES the schedule: the prior run's
//! token is cancelled and the new parameters installed. Results flow out
//! through a bounded channel — enqueueing never blocks the worker, and a
//! saturated channel drops the result with a log line.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{TaskAssignPayload, TaskKind, TaskResultPayload};

use super::ping::PingProber;
use super::script::ScriptRunner;

const RESULT_CHANNEL_CAPACITY: usize = 100;

struct RunningTask {
    generation: u64,
    cancel: CancellationToken,
}

pub struct TaskRuntime {
    tasks: Mutex<HashMap<String, RunningTask>>,
    generations: AtomicU64,
    prober: PingProber,
    scripts: ScriptRunner,
    result_tx: mpsc::Sender<TaskResultPayload>,
    shutdown: CancellationToken,
}

impl TaskRuntime {
    /// Returns the runtime and the receiving end of the result channel.
    pub fn new(
        core_base: String,
        script_dir: String,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<TaskResultPayload>) {
        let (result_tx, result_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);

        (
            Arc::new(Self {
                tasks: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                prober: PingProber::default(),
                scripts: ScriptRunner::new(core_base, script_dir),
                result_tx,
                shutdown,
            }),
            result_rx,
        )
    }

    /// Accept an assignment, replacing any prior schedule with the same id.
    pub fn handle_assign(self: &Arc<Self>, task: TaskAssignPayload) {
        if self.shutdown.is_cancelled() {
            debug!("shutting down, ignoring task {}", task.task_id);
            return;
        }

        let cancel = self.shutdown.child_token();
        let generation = self.generations.fetch_add(1, Ordering::SeqCst);

        {
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(prior) = tasks.remove(&task.task_id) {
                debug!("replacing schedule for task {}", task.task_id);
                prior.cancel.cancel();
            }
            tasks.insert(
                task.task_id.clone(),
                RunningTask {
                    generation,
                    cancel: cancel.clone(),
                },
            );
        }

        info!("accepted task {} ({})", task.task_id, task.kind);

        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            runtime.worker(task, generation, cancel).await;
        });
    }

    /// Cancel one task and drop it from the table.
    pub fn cancel(&self, task_id: &str) {
        if let Some(task) = self.tasks.lock().unwrap().remove(task_id) {
            task.cancel.cancel();
        }
    }

    /// Cancel every running task. The workers observe their tokens at the
    /// next suspension point.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for (_, task) in tasks.drain() {
            task.cancel.cancel();
        }
    }

    pub fn running_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    async fn worker(&self, task: TaskAssignPayload, generation: u64, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let result = self.run_once(&task, &cancel).await;

            // a cancelled run is a superseded or stopping schedule; its
            // result is not reported
            if cancel.is_cancelled() {
                break;
            }

            if let Err(e) = self.result_tx.try_send(result) {
                warn!("result channel full, dropping result for task {}: {e}", task.task_id);
            }

            if task.interval == 0 {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(Duration::from_secs(u64::from(task.interval))) => {}
            }
        }

        // remove our entry unless a replacement has already taken the slot
        let mut tasks = self.tasks.lock().unwrap();
        if tasks
            .get(&task.task_id)
            .is_some_and(|t| t.generation == generation)
        {
            tasks.remove(&task.task_id);
        }
    }

    /// Run the task body once and shape the result frame.
    async fn run_once(
        &self,
        task: &TaskAssignPayload,
        cancel: &CancellationToken,
    ) -> TaskResultPayload {
        let start = Instant::now();

        let mut result = TaskResultPayload {
            task_id: task.task_id.clone(),
            success: false,
            output: String::new(),
            error: None,
            duration: 0,
        };

        match task.kind {
            TaskKind::Ping => {
                let target = task.target.clone().unwrap_or_default();
                if target.is_empty() {
                    result.error = Some("ping task has no target".to_string());
                } else {
                    let outcome = self.prober.execute(cancel, &target).await;
                    result.success = outcome.success;
                    if !outcome.success {
                        result.error = outcome.error.clone();
                    }
                    result.output = serde_json::to_string(&outcome).unwrap_or_default();
                }
            }

            TaskKind::Script => {
                let script_id = task.script_id.clone().unwrap_or_default();
                if script_id.is_empty() {
                    result.error = Some("script task has no script id".to_string());
                } else {
                    let outcome = self
                        .scripts
                        .execute(cancel, &script_id, &task.params, task.timeout)
                        .await;
                    result.success = outcome.success();
                    result.output = outcome.stdout;
                    if let Some(error) = outcome.error {
                        result.error = Some(error);
                    } else if !outcome.stderr.is_empty() {
                        result.error = Some(outcome.stderr);
                    }
                }
            }
        }

        result.duration = start.elapsed().as_millis() as i64;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> (
        Arc<TaskRuntime>,
        mpsc::Receiver<TaskResultPayload>,
        CancellationToken,
    ) {
        let shutdown = CancellationToken::new();
        let (runtime, rx) = TaskRuntime::new(
            "http://127.0.0.1:1".to_string(),
            std::env::temp_dir()
                .join("probehub-test-scripts")
                .to_string_lossy()
                .into_owned(),
            shutdown.clone(),
        );
        (runtime, rx, shutdown)
    }

    fn ping_task(task_id: &str, interval: u32) -> TaskAssignPayload {
        TaskAssignPayload {
            task_id: task_id.to_string(),
            kind: TaskKind::Ping,
            target: Some("127.0.0.1:1".to_string()),
            script_id: None,
            params: HashMap::new(),
            interval,
            timeout: 5,
        }
    }

    #[tokio::test]
    async fn one_shot_task_emits_single_result_and_clears_table() {
        let (runtime, mut rx, _shutdown) = runtime();

        runtime.handle_assign(ping_task("t-1", 0));

        let result = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("result not produced in time")
            .unwrap();

        assert_eq!(result.task_id, "t-1");
        // probes against a closed loopback port all fail
        assert!(!result.success);
        assert!(result.output.contains("\"packet_loss\":100"));

        // give the worker a moment to drop its entry
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runtime.running_count(), 0);
    }

    #[tokio::test]
    async fn recurring_task_repeats_until_cancelled() {
        let (runtime, mut rx, _shutdown) = runtime();

        runtime.handle_assign(ping_task("t-2", 1));

        let first = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("first result")
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("second result")
            .unwrap();
        assert_eq!(first.task_id, "t-2");
        assert_eq!(second.task_id, "t-2");

        runtime.cancel("t-2");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runtime.running_count(), 0);
    }

    #[tokio::test]
    async fn reassignment_replaces_prior_schedule() {
        let (runtime, mut rx, _shutdown) = runtime();

        // long interval: after the first result the worker sleeps
        runtime.handle_assign(ping_task("t-3", 3600));
        let _ = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("initial result")
            .unwrap();

        // replacement cancels the sleeping run and installs a new one
        runtime.handle_assign(ping_task("t-3", 3600));
        let replaced = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("result from replacement")
            .unwrap();
        assert_eq!(replaced.task_id, "t-3");

        // exactly one schedule in the table
        assert_eq!(runtime.running_count(), 1);

        runtime.cancel("t-3");
    }

    #[tokio::test]
    async fn shutdown_cancels_all_tasks() {
        let (runtime, _rx, shutdown) = runtime();

        runtime.handle_assign(ping_task("t-4", 3600));
        runtime.handle_assign(ping_task("t-5", 3600));
        assert_eq!(runtime.running_count(), 2);

        shutdown.cancel();
        runtime.shutdown();
        assert_eq!(runtime.running_count(), 0);

        // new assignments are refused while shutting down
        runtime.handle_assign(ping_task("t-6", 0));
        assert_eq!(runtime.running_count(), 0);
    }
}
