//! Job documents: one per worker process or batch submission.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::Record;

/// Prefix of the id an archived job is re-keyed under.
pub const ARCHIVED_PREFIX: &str = "archived-";

/// A fresh job id.
pub fn new_job_id() -> String {
    format!("job-{}", Uuid::new_v4().simple())
}

/// Derived lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Document exists, nothing else has happened.
    Registered,
    /// Handed to a batch scheduler, not running yet.
    Queued,
    Running,
    Finished,
    Archived,
}

impl JobState {
    /// Registered, queued and running jobs count against the job budget.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Registered | Self::Queued | Self::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Registered => "registered",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Archived => "archived",
        };
        write!(f, "{s}")
    }
}

/// A worker process, tracked through its lifecycle.
///
/// All timestamps are unix seconds, 0 meaning "not yet".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Job {
    #[serde(skip)]
    pub id: String,
    #[serde(skip)]
    pub rev: Option<String>,
    pub hostname: String,
    pub created: i64,
    pub start: i64,
    pub done: i64,
    pub queue: i64,
    pub archive: i64,
    /// Submission transport name; empty for a worker started by hand.
    pub method: String,
    pub batch_id: Option<String>,
    pub cancel: i64,
    pub tasks_processed: u64,
}

impl Job {
    pub fn new(id: impl Into<String>, method: impl Into<String>, now: i64) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            created: now,
            ..Default::default()
        }
    }

    pub fn state(&self) -> JobState {
        if self.archive > 0 {
            JobState::Archived
        } else if self.done > 0 {
            JobState::Finished
        } else if self.start > 0 {
            JobState::Running
        } else if self.queue > 0 {
            JobState::Queued
        } else {
            JobState::Registered
        }
    }

    /// True when the job went through a submission transport.
    pub fn is_submitted(&self) -> bool {
        !self.method.is_empty()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel > 0
    }

    pub fn mark_queued(&mut self, batch_id: Option<String>, now: i64) {
        self.queue = now.max(1);
        if batch_id.is_some() {
            self.batch_id = batch_id;
        }
    }

    pub fn mark_started(&mut self, hostname: &str, now: i64) {
        self.start = now.max(1);
        self.hostname = hostname.to_string();
    }

    pub fn mark_finished(&mut self, now: i64) {
        if self.done == 0 {
            self.done = now.max(1);
        }
    }

    /// Set the archive timestamp. Once set it is never changed.
    pub fn mark_archived(&mut self, now: i64) {
        if self.archive == 0 {
            self.archive = now.max(1);
        }
    }

    pub fn request_cancel(&mut self, now: i64) {
        if self.cancel == 0 {
            self.cancel = now.max(1);
        }
    }

    /// Both halves of the lifecycle are complete: the process finished, and
    /// either the submission side has recorded the queueing or there was no
    /// submission at all.
    pub fn is_settled(&self) -> bool {
        self.done > 0 && (self.queue > 0 || !self.is_submitted())
    }

    /// Id this job is re-keyed under when archived at `ts`.
    pub fn archived_id(&self, ts: i64) -> String {
        format!("{ARCHIVED_PREFIX}{}-{ts}", self.id)
    }

    pub fn has_archived_id(&self) -> bool {
        self.id.starts_with(ARCHIVED_PREFIX)
    }
}

impl Record for Job {
    const DOC_TYPE: &'static str = "job";

    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn rev(&self) -> Option<&str> {
        self.rev.as_deref()
    }
    fn set_rev(&mut self, rev: Option<String>) {
        self.rev = rev;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_follow_timestamps() {
        let mut job = Job::new("job-1", "local", 10);
        assert_eq!(job.state(), JobState::Registered);
        job.mark_queued(Some("4242".into()), 11);
        assert_eq!(job.state(), JobState::Queued);
        assert_eq!(job.batch_id.as_deref(), Some("4242"));
        job.mark_started("node-a", 12);
        assert_eq!(job.state(), JobState::Running);
        job.mark_finished(13);
        assert_eq!(job.state(), JobState::Finished);
        assert!(!job.state().is_active());
        job.mark_archived(14);
        assert_eq!(job.state(), JobState::Archived);
    }

    #[test]
    fn archive_timestamp_is_never_reset() {
        let mut job = Job::new("job-1", "", 10);
        job.mark_archived(20);
        job.mark_archived(30);
        assert_eq!(job.archive, 20);
    }

    #[test]
    fn settled_needs_both_halves_for_submitted_jobs() {
        let mut job = Job::new("job-1", "local", 10);
        job.mark_finished(20);
        assert!(!job.is_settled());
        job.mark_queued(None, 21);
        assert!(job.is_settled());

        let mut direct = Job::new("job-2", "", 10);
        assert!(!direct.is_settled());
        direct.mark_finished(20);
        assert!(direct.is_settled());
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = new_job_id();
        assert!(a.starts_with("job-"));
        assert_ne!(a, new_job_id());
    }

    #[test]
    fn archived_id_format() {
        let job = Job::new("job-1", "", 10);
        assert_eq!(job.archived_id(99), "archived-job-1-99");
        assert!(!job.has_archived_id());
    }

    #[test]
    fn cancel_is_a_side_flag() {
        let mut job = Job::new("job-1", "", 10);
        job.mark_started("h", 11);
        job.request_cancel(12);
        job.request_cancel(15);
        assert!(job.is_cancelled());
        assert_eq!(job.cancel, 12);
        assert_eq!(job.state(), JobState::Running);
    }
}
