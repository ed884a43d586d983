use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::HttpEngineConfig;
use crate::models::CoreError;
use crate::orchestration::{EnvelopeConfig, RunnerConfig};
use crate::persistence::RetryPolicy;
use crate::workers::ScriptWorkerConfig;

pub const DEFAULT_DATABASE_PATH: &str = "meshq.sqlite3";
pub const DEFAULT_ENGINE_HOST: &str = "localhost";
pub const DEFAULT_ENGINE_PORT: u16 = 8087;

/// Every tunable of a queue process. `Default` carries the production values.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueConfig {
    pub database_path: PathBuf,
    pub engine: HttpEngineConfig,
    pub runner: RunnerConfig,
    pub envelope: EnvelopeConfig,
    pub script: ScriptWorkerConfig,
    pub retry: RetryPolicy,
    /// Settle time after photos are handed to the engine.
    pub photo_load_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            engine: HttpEngineConfig::new(engine_base_url(DEFAULT_ENGINE_HOST, DEFAULT_ENGINE_PORT)),
            runner: RunnerConfig::default(),
            envelope: EnvelopeConfig::default(),
            script: ScriptWorkerConfig::default(),
            retry: RetryPolicy::default(),
            photo_load_delay: Duration::from_secs(5),
        }
    }
}

impl QueueConfig {
    /// Reads overrides from the process environment.
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`QueueConfig::from_env`] over an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut config = Self::default();

        if let Some(path) = get("MESHQ_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        let host = get("PHOTOMESH_EXE_SERVER_URL").unwrap_or_else(|| DEFAULT_ENGINE_HOST.to_string());
        let port = parse_var::<u16>(&get, "PHOTOMESH_EXE_SERVER_PORT")?.unwrap_or(DEFAULT_ENGINE_PORT);
        config.engine.base_url = engine_base_url(&host, port);

        config.script.queue_port = parse_var::<u16>(&get, "PORT")?;
        if let Some(python) = get("MESHQ_PYTHON") {
            config.script.python = PathBuf::from(python);
        }
        if let Some(node) = get("MESHQ_NODE") {
            config.script.node = PathBuf::from(node);
        }

        config.runner.recovery_override = parse_var::<bool>(&get, "MESHQ_QUEUE_RECOVERY")?;
        if let Some(ms) = parse_var::<u64>(&get, "MESHQ_POLL_INTERVAL_MS")? {
            config.runner.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = parse_var::<u64>(&get, "MESHQ_HEALTH_TIMEOUT_MS")? {
            config.envelope.health_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn engine_base_url(host: &str, port: u16) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{host}:{port}")
    } else {
        format!("http://{host}:{port}")
    }
}

fn parse_var<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, CoreError> {
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| CoreError::invalid_input(format!("invalid value for {key}: '{raw}'"))),
    }
}
