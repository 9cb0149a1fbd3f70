//! Randomized-window claim protocol.
//!
//! Workers never coordinate directly. Each picks a random row from the first
//! `window` rows of a pending view and tries to take it with a conditional
//! write; losing that race is a `Conflict`, after which it simply picks again.
//! The window spreads concurrent claimers over different documents.

use futures::Stream;
use futures::stream;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::PoolContext;
use crate::error::{ClaimError, Result, StoreError};
use crate::lifecycle;
use crate::model::task::ERROR_MARK;
use crate::model::{ErrorRecord, Task, TaskState, unix_now};
use crate::store::{Document, Store, View, persist};
use crate::worker::shutdown::StopFlag;

/// Claims pending tasks for the current job.
#[derive(Debug, Clone)]
pub struct TaskClaimer {
    ctx: PoolContext,
    views: Vec<View>,
    window: usize,
    allowed_failures: u32,
    endless: Option<StopFlag>,
}

impl TaskClaimer {
    pub fn new(ctx: PoolContext) -> Self {
        let window = ctx.config().claim_window;
        let allowed_failures = ctx.config().allowed_failures;
        Self {
            ctx,
            views: vec![View::Pending],
            window,
            allowed_failures,
            endless: None,
        }
    }

    /// Try `pending_priority` before `pending`.
    pub fn priority(mut self) -> Self {
        self.views = vec![View::PendingPriority, View::Pending];
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn with_allowed_failures(mut self, allowed_failures: u32) -> Self {
        self.allowed_failures = allowed_failures;
        self
    }

    /// Keep polling an empty queue until `stop` is set or the current job
    /// is cancelled.
    pub fn endless(mut self, stop: StopFlag) -> Self {
        self.endless = Some(stop);
        self
    }

    /// Claim the next task, or `None` when the queue is drained.
    ///
    /// In endless mode, `None` only comes back once a stop condition holds.
    pub async fn next_task(&self) -> Result<Option<Task>> {
        loop {
            for view in &self.views {
                if let Some(task) = self.claim_from(*view).await? {
                    return Ok(Some(task));
                }
            }

            let Some(stop) = &self.endless else {
                return Ok(None);
            };
            if self.should_stop(stop).await? {
                return Ok(None);
            }

            debug!(poll_interval = ?self.ctx.config().poll_interval, "Queue empty, waiting");
            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config().poll_interval) => {}
                _ = stop.wait() => return Ok(None),
            }
        }
    }

    /// One run of the claim algorithm against a single view.
    pub async fn claim_from(&self, view: View) -> Result<Option<Task>> {
        let store = self.ctx.store();
        let hostname = self.ctx.hostname();
        let job_id = self.ctx.job_id();

        for attempt in 1..=self.allowed_failures.max(1) {
            let doc = match store.get_random_from_view(view, self.window).await {
                Ok(Some(doc)) => doc,
                Ok(None) => return Ok(None),
                // Deleted between the view read and the get.
                Err(StoreError::NotFound { id }) => {
                    debug!(task_id = %id, attempt, "Picked task is gone");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let mut task: Task = match doc.clone().into_record() {
                Ok(task) => task,
                Err(e @ (StoreError::Serialization(_) | StoreError::WrongType { .. })) => {
                    warn!(task_id = %doc.id, attempt, error = %e, "Skipping unreadable task");
                    quarantine(store, doc, &e).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            // Someone else's write landed between the view read and the get.
            if task.state() != TaskState::Pending {
                debug!(task_id = %task.id, attempt, "Picked task is no longer pending");
                continue;
            }

            task.claim(hostname, job_id, unix_now());
            match persist(store, &mut task).await {
                Ok(()) => {
                    info!(task_id = %task.id, %view, "Task claimed");
                    return Ok(Some(task));
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(task_id = %task.id, attempt, "Claim lost to another worker");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ClaimError::Exhausted {
            view: view.to_string(),
            attempts: self.allowed_failures.max(1),
        }
        .into())
    }

    async fn should_stop(&self, stop: &StopFlag) -> Result<bool> {
        if stop.is_stopped() {
            return Ok(true);
        }
        match self.ctx.job_id() {
            Some(job_id) => lifecycle::is_cancelled(&self.ctx, job_id).await,
            None => Ok(false),
        }
    }

    /// Claimed tasks as a stream. Ends when the queue is drained or after
    /// the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Task>> {
        stream::unfold(Some(self), |state| async move {
            let claimer = state?;
            match claimer.next_task().await {
                Ok(Some(task)) => Some((Ok(task), Some(claimer))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

/// Move a task document that no longer decodes into the error view, so no
/// worker picks it again. Works on the raw body; losing the write to someone
/// else is fine.
async fn quarantine(store: &dyn Store, mut doc: Document, reason: &StoreError) {
    let record = ErrorRecord {
        time: unix_now(),
        message: format!("Unreadable task document: {reason}"),
        exception: None,
    };
    let record = match serde_json::to_value(record) {
        Ok(record) => record,
        Err(e) => {
            warn!(task_id = %doc.id, error = %e, "Could not encode error record");
            return;
        }
    };

    doc.body.insert("lock".into(), Value::from(ERROR_MARK));
    doc.body.insert("done".into(), Value::from(ERROR_MARK));
    match doc.body.get_mut("error") {
        Some(Value::Array(errors)) => errors.push(record),
        _ => {
            doc.body.insert("error".into(), Value::Array(vec![record]));
        }
    }

    match store.save(&doc).await {
        Ok(_) => info!(task_id = %doc.id, "Unreadable task moved to error"),
        Err(e) => debug!(task_id = %doc.id, error = %e, "Could not mark unreadable task"),
    }
}
