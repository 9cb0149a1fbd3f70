//! Task executors.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::ExecutionError;
use crate::model::{Task, unix_now};

/// Maximum stderr kept on an error record (64KB).
const MAX_STDERR_SIZE: usize = 64 * 1024;

/// Environment variable carrying the task id into the command.
pub const TASK_ID_ENV: &str = "TASKPOOL_TASK_ID";

/// Does the actual work for a claimed task.
///
/// Implementations fill in `output`, or call `record_error` on the task for
/// failures that belong in its history. An `Err` is recorded by the caller.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn process(&self, task: Task) -> Result<Task, ExecutionError>;
}

/// Runs the task's `command` with its `arguments` through `sh -c`.
///
/// `input` is written to stdin as JSON. Stdout is parsed as JSON into
/// `output`; anything else is kept as `{"stdout": ..., "stderr": ...}`.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    timeout: Option<Duration>,
    workdir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    fn build(&self, task: &Task, command: &str) -> Command {
        // "$@" keeps each argument a separate word.
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("{command} \"$@\""))
            .arg("sh")
            .args(&task.arguments)
            .env(TASK_ID_ENV, &task.id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn process(&self, mut task: Task) -> Result<Task, ExecutionError> {
        let command = task.command.clone().ok_or_else(|| ExecutionError::NoCommand {
            task_id: task.id.clone(),
        })?;

        let mut child = self
            .build(&task, &command)
            .spawn()
            .map_err(|e| ExecutionError::Spawn {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        // Fed from its own task: a command that echoes stdin would otherwise
        // block on a full stdout pipe while we block on a full stdin pipe.
        let feeder = child.stdin.take().map(|mut stdin| {
            let input = serde_json::to_vec(&task.input).unwrap_or_default();
            let task_id = task.id.clone();
            tokio::spawn(async move {
                // A command that ignores stdin may close it early.
                if let Err(e) = stdin.write_all(&input).await {
                    tracing::debug!(task_id = %task_id, error = %e, "Command closed stdin");
                }
            })
        });

        let waited = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| limit),
            None => Ok(child.wait_with_output().await),
        };
        if let Some(feeder) = feeder {
            feeder.abort();
        }

        let output = match waited {
            Ok(result) => result?,
            Err(limit) => {
                let err = ExecutionError::Timeout {
                    command,
                    timeout: limit,
                };
                tracing::warn!(task_id = %task.id, error = %err, "Task timed out");
                task.record_error(err.to_string(), None, unix_now());
                return Ok(task);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = truncate(String::from_utf8_lossy(&output.stderr).to_string());

        if !output.status.success() {
            let err = ExecutionError::NonZeroExit {
                command,
                code: output.status.code().unwrap_or(-1),
            };
            tracing::warn!(task_id = %task.id, error = %err, "Task command failed");
            let exception = (!stderr.is_empty()).then_some(stderr);
            task.record_error(err.to_string(), exception, unix_now());
            return Ok(task);
        }

        task.output = match serde_json::from_str::<Value>(stdout.trim()) {
            Ok(parsed) if !stdout.trim().is_empty() => parsed,
            _ => json!({ "stdout": stdout, "stderr": stderr }),
        };
        Ok(task)
    }
}

fn truncate(mut s: String) -> String {
    if s.len() > MAX_STDERR_SIZE {
        let mut cut = MAX_STDERR_SIZE;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("\n... (truncated)");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskState;

    fn task(command: &str, args: &[&str]) -> Task {
        Task::new("t1", 1).with_command(command, args.iter().copied())
    }

    #[tokio::test]
    async fn json_stdout_becomes_output() {
        let t = task("printf '{\"sum\": %d}'", &["7"]);
        let done = CommandExecutor::new().process(t).await.unwrap();
        assert_eq!(done.output, json!({"sum": 7}));
        assert!(!done.is_error());
    }

    #[tokio::test]
    async fn plain_stdout_is_wrapped() {
        let done = CommandExecutor::new()
            .process(task("echo", &["hello", "world"]))
            .await
            .unwrap();
        assert_eq!(done.output["stdout"], "hello world\n");
    }

    #[tokio::test]
    async fn input_arrives_on_stdin() {
        let t = task("cat", &[]).with_input(json!({"n": 3}));
        let done = CommandExecutor::new().process(t).await.unwrap();
        assert_eq!(done.output, json!({"n": 3}));
    }

    #[tokio::test]
    async fn large_input_echoed_back() {
        let blob = "x".repeat(1024 * 1024);
        let t = task("cat", &[]).with_input(json!({"blob": blob}));
        let done = tokio::time::timeout(
            Duration::from_secs(10),
            CommandExecutor::new()
                .with_timeout(Some(Duration::from_secs(5)))
                .process(t),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!done.is_error());
        assert_eq!(done.output["blob"].as_str().map(str::len), Some(1024 * 1024));
    }

    #[tokio::test]
    async fn timeout_fires_while_stdin_is_full() {
        let t = task("sleep 30", &[]).with_input(json!({"blob": "y".repeat(1024 * 1024)}));
        let done = tokio::time::timeout(
            Duration::from_secs(5),
            CommandExecutor::new()
                .with_timeout(Some(Duration::from_millis(300)))
                .process(t),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(done.last_error().unwrap().message.contains("timed out"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_recorded() {
        let done = CommandExecutor::new()
            .process(task("echo oops >&2; exit 3", &[]))
            .await
            .unwrap();
        assert_eq!(done.state(), TaskState::Error);
        let err = done.last_error().unwrap();
        assert!(err.message.contains("status 3"));
        assert_eq!(err.exception.as_deref(), Some("oops\n"));
    }

    #[tokio::test]
    async fn timeout_is_recorded() {
        let done = CommandExecutor::new()
            .with_timeout(Some(Duration::from_millis(100)))
            .process(task("sleep 5", &[]))
            .await
            .unwrap();
        assert!(done.is_error());
        assert!(done.last_error().unwrap().message.contains("timed out"));
    }

    #[tokio::test]
    async fn missing_command_is_an_error() {
        let err = CommandExecutor::new()
            .process(Task::new("t1", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::NoCommand { .. }));
    }

    #[test]
    fn long_stderr_is_truncated() {
        let s = truncate("x".repeat(MAX_STDERR_SIZE + 10));
        assert!(s.ends_with("(truncated)"));
    }
}
