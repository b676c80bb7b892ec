use std::path::Path;

use tracing::trace;

/// Core-side configuration, loaded from a JSON file.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Shared token agents must present at handshake. Empty disables the check.
    #[serde(default)]
    pub agent_token: String,

    #[serde(default = "default_database")]
    pub database: String,

    /// How long metric rows are kept before cleanup.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u32,

    /// Optional webhook endpoint for alert notifications.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            agent_token: String::new(),
            database: default_database(),
            retention_days: default_retention_days(),
            cleanup_interval_hours: default_cleanup_interval_hours(),
            webhook_url: None,
        }
    }
}

/// Agent-side configuration, loaded from a JSON file and overridable by flags.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub server_url: String,

    #[serde(default)]
    pub token: String,

    /// Metric collection cadence in seconds.
    #[serde(default = "default_metric_interval")]
    pub metric_interval: u64,

    /// Where downloaded scripts are staged.
    #[serde(default = "default_script_dir")]
    pub script_dir: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            token: String::new(),
            metric_interval: default_metric_interval(),
            script_dir: default_script_dir(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_database() -> String {
    "probehub.db".to_string()
}

fn default_retention_days() -> u32 {
    7
}

fn default_cleanup_interval_hours() -> u32 {
    24
}

fn default_metric_interval() -> u64 {
    10
}

fn default_script_dir() -> String {
    "scripts".to_string()
}

/// Read a config file, falling back to defaults when the file is absent.
///
/// A present-but-invalid file is an error; a missing file is not, because
/// both binaries accept their full configuration via flags.
pub fn load_or_default<T>(path: &str) -> anyhow::Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if !Path::new(path).exists() {
        trace!("config file {path} not found, using defaults");
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("invalid configuration file {path}: {e}"))
        .inspect(|_| trace!("loaded config from {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg: AgentConfig = load_or_default("/nonexistent/agent.json").unwrap();
        assert_eq!(cfg.metric_interval, 10);
        assert!(cfg.server_url.is_empty());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{\"server_url\": \"ws://core:8080/api/agent/ws\"}}").unwrap();

        let cfg: AgentConfig = load_or_default(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.server_url, "ws://core:8080/api/agent/ws");
        assert_eq!(cfg.metric_interval, 10);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();

        let result: anyhow::Result<CoreConfig> = load_or_default(file.path().to_str().unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn core_defaults() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.retention_days, 7);
        assert!(cfg.agent_token.is_empty());
    }
}
