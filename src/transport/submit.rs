//! Submission transports: how a registered job gets a process to run it.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::SubmitConfig;
use crate::error::{ConfigError, SubmissionError};
use crate::model::Job;

/// Environment variable carrying the job id into the launched process.
pub const JOB_ID_ENV: &str = "TASKPOOL_JOB_ID";

/// What a transport knows about a launched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Queued,
    Running,
    Exited,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStatus {
    pub job_id: String,
    pub batch_id: Option<String>,
    pub state: BatchState,
}

/// Launches jobs outside this process.
#[async_trait]
pub trait SubmissionTransport: Send + Sync {
    /// Name recorded as the job's `method`.
    fn method(&self) -> &str;

    /// Launch `command` for `job`. Returns the external batch id, if the
    /// transport has one.
    async fn submit(&self, job: &Job, command: &str) -> Result<Option<String>, SubmissionError>;

    async fn status(&self, jobs: &[Job]) -> Result<Vec<BatchStatus>, SubmissionError>;

    async fn kill(&self, job: &Job) -> Result<(), SubmissionError>;
}

/// Build the transport named by `config.method`.
pub fn from_config(config: &SubmitConfig) -> Result<Box<dyn SubmissionTransport>, ConfigError> {
    match config.method.as_str() {
        LocalTransport::METHOD => Ok(Box::new(LocalTransport::new())),
        HttpLauncher::METHOD => {
            let url = config
                .launcher_url
                .clone()
                .ok_or_else(|| ConfigError::MissingRequired {
                    key: "TASKPOOL_LAUNCHER_URL".into(),
                    hint: "the http submission method needs a launcher endpoint".into(),
                })?;
            Ok(Box::new(HttpLauncher::new(url)))
        }
        other => Err(ConfigError::UnknownMethod(other.to_string())),
    }
}

/// Runs each job as a child process of this one (`sh -c <command>`).
pub struct LocalTransport {
    children: Mutex<HashMap<String, Child>>,
}

impl LocalTransport {
    pub const METHOD: &'static str = "local";

    pub fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubmissionTransport for LocalTransport {
    fn method(&self) -> &str {
        Self::METHOD
    }

    async fn submit(&self, job: &Job, command: &str) -> Result<Option<String>, SubmissionError> {
        let child = Command::new("sh")
            .args(["-c", command])
            .env(JOB_ID_ENV, &job.id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SubmissionError::Failed {
                job_id: job.id.clone(),
                method: Self::METHOD.into(),
                reason: format!("Failed to spawn command: {e}"),
            })?;

        let pid = child.id().map(|pid| pid.to_string());
        tracing::debug!(job_id = %job.id, pid = ?pid, "Local job spawned");
        self.children.lock().await.insert(job.id.clone(), child);
        Ok(pid)
    }

    async fn status(&self, jobs: &[Job]) -> Result<Vec<BatchStatus>, SubmissionError> {
        let mut children = self.children.lock().await;
        let mut out = Vec::with_capacity(jobs.len());
        for job in jobs {
            let state = match children.get_mut(&job.id) {
                Some(child) => match child.try_wait() {
                    Ok(Some(_)) => BatchState::Exited,
                    Ok(None) => BatchState::Running,
                    Err(e) => {
                        return Err(SubmissionError::Status {
                            method: Self::METHOD.into(),
                            reason: e.to_string(),
                        });
                    }
                },
                None => BatchState::Unknown,
            };
            out.push(BatchStatus {
                job_id: job.id.clone(),
                batch_id: job.batch_id.clone(),
                state,
            });
        }
        Ok(out)
    }

    async fn kill(&self, job: &Job) -> Result<(), SubmissionError> {
        let mut children = self.children.lock().await;
        let Some(mut child) = children.remove(&job.id) else {
            return Err(SubmissionError::Kill {
                job_id: job.id.clone(),
                method: Self::METHOD.into(),
                reason: "no such child process".into(),
            });
        };
        child.kill().await.map_err(|e| SubmissionError::Kill {
            job_id: job.id.clone(),
            method: Self::METHOD.into(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct LaunchRequest<'a> {
    job_id: &'a str,
    command: &'a str,
    env: HashMap<&'static str, &'a str>,
}

#[derive(Debug, Deserialize)]
struct LaunchResponse {
    #[serde(default)]
    batch_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    state: BatchState,
}

/// Hands jobs to a remote launcher service over HTTP.
///
/// `POST {url}/jobs` launches, `GET {url}/jobs/{batch_id}` reports state,
/// `DELETE {url}/jobs/{batch_id}` kills.
pub struct HttpLauncher {
    url: String,
    client: reqwest::Client,
}

impl HttpLauncher {
    pub const METHOD: &'static str = "http";

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn jobs_url(&self) -> String {
        format!("{}/jobs", self.url)
    }

    fn batch_key(job: &Job) -> &str {
        job.batch_id.as_deref().unwrap_or(&job.id)
    }
}

#[async_trait]
impl SubmissionTransport for HttpLauncher {
    fn method(&self) -> &str {
        Self::METHOD
    }

    async fn submit(&self, job: &Job, command: &str) -> Result<Option<String>, SubmissionError> {
        let failed = |reason: String| SubmissionError::Failed {
            job_id: job.id.clone(),
            method: Self::METHOD.into(),
            reason,
        };

        let body = LaunchRequest {
            job_id: &job.id,
            command,
            env: HashMap::from([(JOB_ID_ENV, job.id.as_str())]),
        };
        let resp = self
            .client
            .post(self.jobs_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(failed(format!("launcher returned {status}: {text}")));
        }

        let parsed: LaunchResponse = resp.json().await.map_err(|e| failed(e.to_string()))?;
        Ok(parsed.batch_id)
    }

    async fn status(&self, jobs: &[Job]) -> Result<Vec<BatchStatus>, SubmissionError> {
        let mut out = Vec::with_capacity(jobs.len());
        for job in jobs {
            let url = format!("{}/{}", self.jobs_url(), Self::batch_key(job));
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| SubmissionError::Status {
                    method: Self::METHOD.into(),
                    reason: e.to_string(),
                })?;

            let state = if resp.status() == reqwest::StatusCode::NOT_FOUND {
                BatchState::Unknown
            } else if resp.status().is_success() {
                resp.json::<StatusResponse>()
                    .await
                    .map(|s| s.state)
                    .unwrap_or(BatchState::Unknown)
            } else {
                return Err(SubmissionError::Status {
                    method: Self::METHOD.into(),
                    reason: format!("GET {url} returned {}", resp.status()),
                });
            };
            out.push(BatchStatus {
                job_id: job.id.clone(),
                batch_id: job.batch_id.clone(),
                state,
            });
        }
        Ok(out)
    }

    async fn kill(&self, job: &Job) -> Result<(), SubmissionError> {
        let kill_err = |reason: String| SubmissionError::Kill {
            job_id: job.id.clone(),
            method: Self::METHOD.into(),
            reason,
        };
        let resp = self
            .client
            .delete(format!("{}/{}", self.jobs_url(), Self::batch_key(job)))
            .send()
            .await
            .map_err(|e| kill_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(kill_err(format!("launcher returned {}", resp.status())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn transport_is_chosen_by_method() {
        let local = from_config(&SubmitConfig::default()).unwrap();
        assert_eq!(local.method(), "local");

        let missing_url = SubmitConfig {
            method: "http".into(),
            ..Default::default()
        };
        assert!(matches!(
            from_config(&missing_url),
            Err(ConfigError::MissingRequired { .. })
        ));

        let http = SubmitConfig {
            method: "http".into(),
            launcher_url: Some("http://launcher.local/".into()),
            ..Default::default()
        };
        assert_eq!(from_config(&http).unwrap().method(), "http");

        let unknown = SubmitConfig {
            method: "slurm".into(),
            ..Default::default()
        };
        assert!(matches!(
            from_config(&unknown),
            Err(ConfigError::UnknownMethod(m)) if m == "slurm"
        ));
    }

    #[tokio::test]
    async fn local_transport_passes_job_id() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("job_id");
        let transport = LocalTransport::new();
        let job = Job::new("job-42", "local", 1);

        let cmd = format!("printf %s \"${JOB_ID_ENV}\" > {}", marker.display());
        let pid = transport.submit(&job, &cmd).await.unwrap();
        assert!(pid.is_some());

        let mut exited = false;
        for _ in 0..100 {
            let status = transport.status(std::slice::from_ref(&job)).await.unwrap();
            if status[0].state == BatchState::Exited {
                exited = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(exited);
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "job-42");
    }

    #[tokio::test]
    async fn local_kill_stops_the_child() {
        let transport = LocalTransport::new();
        let job = Job::new("job-7", "local", 1);
        transport.submit(&job, "sleep 30").await.unwrap();
        transport.kill(&job).await.unwrap();

        let status = transport.status(std::slice::from_ref(&job)).await.unwrap();
        assert_eq!(status[0].state, BatchState::Unknown);
        assert!(transport.kill(&job).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_launcher_fails_submission() {
        let launcher = HttpLauncher::new("http://127.0.0.1:9");
        let job = Job::new("job-1", "http", 1);
        let err = launcher.submit(&job, "taskpool run").await.unwrap_err();
        assert!(matches!(err, SubmissionError::Failed { .. }));
    }
}
