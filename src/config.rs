//! Configuration types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Pool-wide settings shared by every operation.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Name this process records on tasks and jobs it touches.
    pub hostname: String,
    /// Job id of this process, when it runs as a job.
    pub job_id: Option<String>,
    /// Rows considered when picking a random task to claim.
    pub claim_window: usize,
    /// Conflicting claim attempts tolerated before giving up.
    pub allowed_failures: u32,
    /// Conflicting writes tolerated by the update-with-retry primitive.
    pub max_update_retries: u32,
    /// Upper bound on active jobs for the submission policy.
    pub max_jobs: u64,
    /// Concurrency slots of the worker pool.
    pub parallelism: u32,
    /// Wall-clock budget for one worker run.
    pub max_runtime: Option<Duration>,
    /// Sleep between polls of an empty queue in endless mode.
    pub poll_interval: Duration,
    /// Per-task limit for the command executor.
    pub task_timeout: Option<Duration>,
    pub submit: SubmitConfig,
    pub webdav: Option<WebDavConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/taskpool.db"),
            hostname: "localhost".to_string(),
            job_id: None,
            claim_window: 100,
            allowed_failures: 10,
            max_update_retries: 20,
            max_jobs: 1,
            parallelism: 1,
            max_runtime: None,
            poll_interval: Duration::from_secs(5),
            task_timeout: None,
            submit: SubmitConfig::default(),
            webdav: None,
        }
    }
}

/// How new jobs are launched.
#[derive(Debug, Clone)]
pub struct SubmitConfig {
    /// Transport name: `local` or `http`.
    pub method: String,
    /// Command the launched job runs.
    pub command: Option<String>,
    /// Endpoint of the HTTP launcher.
    pub launcher_url: Option<String>,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            method: "local".to_string(),
            command: None,
            launcher_url: None,
        }
    }
}

/// WebDAV attachment storage.
#[derive(Debug, Clone)]
pub struct WebDavConfig {
    pub url: String,
    pub username: String,
    pub password: SecretString,
}

impl PoolConfig {
    /// Build config from `TASKPOOL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with("TASKPOOL_") || k == "HOSTNAME")
            .collect();
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let hostname = get("TASKPOOL_HOSTNAME")
            .or_else(|| get("HOSTNAME"))
            .unwrap_or(defaults.hostname);

        let secs = |key: &str| -> Result<Option<Duration>, ConfigError> {
            Ok(parse_opt::<u64>(key, get(key))?.map(Duration::from_secs))
        };

        let webdav = match get("TASKPOOL_WEBDAV_URL") {
            Some(url) => Some(WebDavConfig {
                url,
                username: get("TASKPOOL_WEBDAV_USER").unwrap_or_default(),
                password: SecretString::from(get("TASKPOOL_WEBDAV_PASSWORD").unwrap_or_default()),
            }),
            None => None,
        };

        let config = Self {
            db_path: get("TASKPOOL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            hostname,
            job_id: get("TASKPOOL_JOB_ID"),
            claim_window: parse_opt("TASKPOOL_CLAIM_WINDOW", get("TASKPOOL_CLAIM_WINDOW"))?
                .unwrap_or(defaults.claim_window),
            allowed_failures: parse_opt(
                "TASKPOOL_ALLOWED_FAILURES",
                get("TASKPOOL_ALLOWED_FAILURES"),
            )?
            .unwrap_or(defaults.allowed_failures),
            max_update_retries: parse_opt(
                "TASKPOOL_MAX_UPDATE_RETRIES",
                get("TASKPOOL_MAX_UPDATE_RETRIES"),
            )?
            .unwrap_or(defaults.max_update_retries),
            max_jobs: parse_opt("TASKPOOL_MAX_JOBS", get("TASKPOOL_MAX_JOBS"))?
                .unwrap_or(defaults.max_jobs),
            parallelism: parse_opt("TASKPOOL_PARALLELISM", get("TASKPOOL_PARALLELISM"))?
                .unwrap_or(defaults.parallelism),
            max_runtime: secs("TASKPOOL_MAX_RUNTIME_SECS")?,
            poll_interval: secs("TASKPOOL_POLL_INTERVAL_SECS")?.unwrap_or(defaults.poll_interval),
            task_timeout: secs("TASKPOOL_TASK_TIMEOUT_SECS")?,
            submit: SubmitConfig {
                method: get("TASKPOOL_SUBMIT_METHOD").unwrap_or(defaults.submit.method),
                command: get("TASKPOOL_SUBMIT_COMMAND"),
                launcher_url: get("TASKPOOL_LAUNCHER_URL"),
            },
            webdav,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.claim_window == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TASKPOOL_CLAIM_WINDOW".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.parallelism == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TASKPOOL_PARALLELISM".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

fn parse_opt<T>(key: &str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|s| {
        s.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{s:?}: {e}"),
        })
    })
    .transpose()
}
