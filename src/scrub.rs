//! Scrubber: recover work orphaned by dead workers.
//!
//! Stale claimed or failed tasks go back to pending; stale jobs are archived.

use std::fmt;
use std::str::FromStr;

use tracing::{debug, info, warn};

use crate::context::PoolContext;
use crate::error::{Error, JobError, Result, StoreError};
use crate::lifecycle;
use crate::model::{Task, TaskState, unix_now};
use crate::store::{Document, View, ViewQuery, ViewRow, load, persist};

/// A view the scrubber knows how to clean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScrubQueue {
    InProgress,
    Error,
    JobsPending,
    JobsRunning,
    JobsFinished,
}

impl ScrubQueue {
    pub const ALL: [ScrubQueue; 5] = [
        Self::InProgress,
        Self::Error,
        Self::JobsPending,
        Self::JobsRunning,
        Self::JobsFinished,
    ];

    pub fn view(&self) -> View {
        match self {
            Self::InProgress => View::InProgress,
            Self::Error => View::Error,
            Self::JobsPending => View::JobsPending,
            Self::JobsRunning => View::JobsRunning,
            Self::JobsFinished => View::JobsFinished,
        }
    }

    /// Task state a document must still be in to be scrubbed.
    fn task_state(&self) -> Option<TaskState> {
        match self {
            Self::InProgress => Some(TaskState::Claimed),
            Self::Error => Some(TaskState::Error),
            _ => None,
        }
    }
}

impl fmt::Display for ScrubQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.view())
    }
}

impl FromStr for ScrubQueue {
    type Err = StoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|q| q.view().name() == s)
            .ok_or_else(|| StoreError::UnknownView(s.to_string()))
    }
}

pub struct Scrubber {
    ctx: PoolContext,
}

impl Scrubber {
    pub fn new(ctx: PoolContext) -> Self {
        Self { ctx }
    }

    /// Scrub every row of `queue` older than `age_secs` (all rows when
    /// `age_secs <= 0`). Returns `(updated, scanned)`.
    pub async fn scrub(&self, queue: ScrubQueue, age_secs: i64) -> Result<(usize, usize)> {
        let rows = self
            .ctx
            .store()
            .view(queue.view(), ViewQuery::default())
            .await?;
        let scanned = rows.len();
        let cutoff = unix_now() - age_secs;
        let stale: Vec<&ViewRow> = rows
            .iter()
            .filter(|row| age_secs <= 0 || row.key_timestamp().is_some_and(|ts| ts < cutoff))
            .collect();

        let updated = match queue.task_state() {
            Some(state) => self.scrub_tasks(&stale, state).await?,
            None => self.archive_jobs(&stale).await?,
        };

        info!(%queue, updated, scanned, age_secs, "Scrub pass complete");
        Ok((updated, scanned))
    }

    async fn scrub_tasks(&self, rows: &[&ViewRow], state: TaskState) -> Result<usize> {
        let store = self.ctx.store();
        let hostname = self.ctx.hostname();

        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            let mut task: Task = match load(store, &row.id).await {
                Ok(task) => task,
                Err(StoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            if task.state() != state {
                continue;
            }
            task.scrub(hostname);
            docs.push(Document::from_record(&task)?);
        }

        let written = store.save_many(&docs).await?;
        let mut updated = written.iter().filter(|ok| **ok).count();

        for (doc, ok) in docs.iter().zip(&written) {
            if *ok {
                continue;
            }
            debug!(task_id = %doc.id, "Scrub write conflicted, retrying");
            if self.rescrub(&doc.id, state).await? {
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Re-read and scrub one task, as long as it is still in `state`.
    async fn rescrub(&self, id: &str, state: TaskState) -> Result<bool> {
        let store = self.ctx.store();
        for _ in 0..self.ctx.max_update_retries().max(1) {
            let mut task: Task = match load(store, id).await {
                Ok(task) => task,
                Err(StoreError::NotFound { .. }) => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            if task.state() != state {
                return Ok(false);
            }
            task.scrub(self.ctx.hostname());
            match persist(store, &mut task).await {
                Ok(()) => return Ok(true),
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        warn!(task_id = id, "Giving up scrubbing task after repeated conflicts");
        Ok(false)
    }

    async fn archive_jobs(&self, rows: &[&ViewRow]) -> Result<usize> {
        let mut updated = 0;
        for row in rows {
            match lifecycle::archive_job(&self.ctx, &row.id).await {
                Ok(_) => updated += 1,
                Err(Error::Job(JobError::NotRegistered { .. })) => {}
                Err(Error::Store(e @ StoreError::RetryExhausted { .. })) => {
                    warn!(job_id = %row.id, error = %e, "Could not archive job");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(updated)
    }
}
