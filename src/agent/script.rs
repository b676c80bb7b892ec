//! Script download and execution
//!
//! Scripts are fetched from the core, verified against an expected SHA-256
//! when one is supplied, marked executable, and run through the platform
//! shell with task params exported as environment variables. The staged
//! file is always removed, whatever the outcome.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of one script run.
#[derive(Debug, Clone, Default)]
pub struct ScriptOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub timed_out: bool,
}

impl ScriptOutcome {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && self.error.is_none()
    }
}

pub struct ScriptRunner {
    core_base: String,
    script_dir: PathBuf,
    client: reqwest::Client,
}

impl ScriptRunner {
    /// `core_base` is the core's HTTP base URL (scheme + authority).
    pub fn new(core_base: String, script_dir: impl Into<PathBuf>) -> Self {
        let script_dir = script_dir.into();
        if let Err(e) = std::fs::create_dir_all(&script_dir) {
            warn!("failed to create script dir {}: {e}", script_dir.display());
        }

        Self {
            core_base,
            script_dir,
            client: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    /// Download, verify, and run one script.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        script_id: &str,
        params: &HashMap<String, String>,
        timeout_sec: u32,
    ) -> ScriptOutcome {
        let body = match self.download(script_id).await {
            Ok(body) => body,
            Err(e) => return ScriptOutcome::failed(format!("download failed: {e}")),
        };

        // Verify before anything touches the shell.
        if let Some(expected) = params.get("checksum") {
            let actual = sha256_hex(&body);
            if &actual != expected {
                return ScriptOutcome::failed(format!(
                    "checksum mismatch: expected {expected}, got {actual}"
                ));
            }
        }

        let path = self
            .script_dir
            .join(format!("script_{}_{}", script_id, Uuid::new_v4()));
        if let Err(e) = std::fs::write(&path, &body) {
            return ScriptOutcome::failed(format!("failed to stage script: {e}"));
        }

        let exec_timeout = if timeout_sec == 0 {
            DEFAULT_EXEC_TIMEOUT
        } else {
            Duration::from_secs(u64::from(timeout_sec))
        };

        let outcome = run_script_file(&path, params, exec_timeout, cancel).await;

        if let Err(e) = std::fs::remove_file(&path) {
            warn!("failed to remove staged script {}: {e}", path.display());
        }

        outcome
    }

    async fn download(&self, script_id: &str) -> anyhow::Result<Vec<u8>> {
        let url = format!("{}/api/scripts/{}/content", self.core_base, script_id);
        debug!("downloading script from {url}");

        let response = self.client.get(&url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Run a staged script file through the platform shell under a hard
/// deadline. `kill_on_drop` guarantees the child dies when the deadline or
/// cancellation abandons the wait.
pub(crate) async fn run_script_file(
    path: &Path,
    params: &HashMap<String, String>,
    exec_timeout: Duration,
    cancel: &CancellationToken,
) -> ScriptOutcome {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)) {
            return ScriptOutcome::failed(format!("failed to mark script executable: {e}"));
        }
    }

    let mut cmd = if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/c").arg(path);
        cmd
    } else {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg(path);
        cmd
    };

    cmd.envs(params).kill_on_drop(true);

    let child = match cmd
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => return ScriptOutcome::failed(format!("failed to spawn shell: {e}")),
    };

    let output = tokio::select! {
        res = timeout(exec_timeout, child.wait_with_output()) => match res {
            Err(_) => {
                return ScriptOutcome {
                    exit_code: -1,
                    timed_out: true,
                    error: Some(format!("execution timeout after {exec_timeout:?}")),
                    ..ScriptOutcome::default()
                };
            }
            Ok(Err(e)) => return ScriptOutcome::failed(format!("wait failed: {e}")),
            Ok(Ok(output)) => output,
        },
        _ = cancel.cancelled() => {
            return ScriptOutcome::failed("cancelled");
        }
    };

    let exit_code = output.status.code().unwrap_or(-1);
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    // a non-zero exit is a task failure and must carry an error, even
    // when the script wrote nothing to stderr
    let error = if exit_code == 0 {
        None
    } else if stderr.trim().is_empty() {
        Some(format!("script exited with code {exit_code}"))
    } else {
        Some(format!("script exited with code {exit_code}: {}", stderr.trim()))
    };

    ScriptOutcome {
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr,
        error,
        timed_out: false,
    }
}
