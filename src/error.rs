//! Error types for taskpool.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Claim error: {0}")]
    Claim(#[from] ClaimError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Submission error: {0}")]
    Submission(#[from] SubmissionError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl Error {
    /// True when the underlying cause is a revision conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Store(StoreError::Conflict { .. }))
    }

    /// True when the underlying cause is a missing document.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Store(StoreError::NotFound { .. }))
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("No current job id (pass one explicitly or set TASKPOOL_JOB_ID)")]
    MissingJobId,

    #[error("Unknown submission method: {0}")]
    UnknownMethod(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Document store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Revision conflict on document {id}")]
    Conflict { id: String },

    #[error("Document {id} not found")]
    NotFound { id: String },

    #[error("Document {id} has type {found:?}, expected {expected}")]
    WrongType {
        id: String,
        expected: &'static str,
        found: Option<String>,
    },

    #[error("Gave up updating {id} after {attempts} conflicting writes")]
    RetryExhausted { id: String, attempts: u32 },

    #[error("Unknown view: {0}")]
    UnknownView(String),

    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Claim protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("No task could be claimed from {view} after {attempts} conflicting attempts")]
    Exhausted { view: String, attempts: u32 },
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} is not registered or has already been archived")]
    NotRegistered { id: String },
}

/// Failures of the external submission transport.
#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("Submitting job {job_id} via {method} failed: {reason}")]
    Failed {
        job_id: String,
        method: String,
        reason: String,
    },

    #[error("Cannot query status via {method}: {reason}")]
    Status { method: String, reason: String },

    #[error("Cannot kill job {job_id} via {method}: {reason}")]
    Kill {
        job_id: String,
        method: String,
        reason: String,
    },
}

/// Task execution failures. Recorded on the task, never propagated out of
/// the worker loop.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Task {task_id} has no command")]
    NoCommand { task_id: String },

    #[error("Failed to spawn {command}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("{command} exited with status {code}")]
    NonZeroExit { command: String, code: i32 },

    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Executor panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// File and HTTP transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("{method} {url} returned {status}")]
    Status {
        method: String,
        url: String,
        status: u16,
    },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid attachment {name}: {reason}")]
    InvalidAttachment { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
