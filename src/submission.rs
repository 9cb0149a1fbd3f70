//! Submission policy: decide how many jobs the pool needs and launch them.

use tracing::{info, warn};

use crate::context::PoolContext;
use crate::error::{Error, Result};
use crate::lifecycle;
use crate::model::{Job, new_job_id};
use crate::store::{Store, View};
use crate::transport::SubmissionTransport;

/// Snapshot of the count views the policy looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending_tasks: u64,
    pub in_progress_tasks: u64,
    pub pending_jobs: u64,
    pub running_jobs: u64,
}

impl QueueCounts {
    pub async fn fetch(store: &dyn Store) -> Result<Self> {
        Ok(Self {
            pending_tasks: store.view_count(View::Pending).await?,
            in_progress_tasks: store.view_count(View::InProgress).await?,
            pending_jobs: store.view_count(View::JobsPending).await?,
            running_jobs: store.view_count(View::JobsRunning).await?,
        })
    }

    /// Tasks that still need a worker.
    pub fn tasks(&self) -> u64 {
        self.pending_tasks + self.in_progress_tasks
    }

    /// Jobs that are, or will soon be, working.
    pub fn jobs(&self) -> u64 {
        self.pending_jobs + self.running_jobs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionPolicy {
    pub max_jobs: u64,
}

impl SubmissionPolicy {
    pub fn new(max_jobs: u64) -> Self {
        Self { max_jobs }
    }

    fn target(&self, counts: &QueueCounts) -> u64 {
        counts.tasks().min(self.max_jobs)
    }

    /// One more job is warranted.
    pub fn should_submit(&self, counts: &QueueCounts) -> bool {
        counts.jobs() < self.target(counts)
    }

    /// How many jobs would bring the pool up to its target.
    pub fn jobs_needed(&self, counts: &QueueCounts) -> u64 {
        self.target(counts).saturating_sub(counts.jobs())
    }
}

/// Outcome of [`submit_while_needed`].
#[derive(Debug, Default)]
pub struct SubmissionReport {
    pub needed: u64,
    pub submitted: Vec<Job>,
}

/// Register a new job, hand it to `transport`, and record the queueing.
///
/// When the transport fails, the job is archived and the failure returned.
pub async fn submit_job(
    ctx: &PoolContext,
    transport: &dyn SubmissionTransport,
    command: &str,
) -> Result<Job> {
    let job_id = new_job_id();
    let job = lifecycle::register_job(ctx, &job_id, transport.method()).await?;

    match transport.submit(&job, command).await {
        Ok(batch_id) => {
            let job = lifecycle::queue_job(ctx, &job_id, batch_id).await?;
            info!(job_id = %job_id, method = transport.method(), "Job submitted");
            Ok(job)
        }
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Submission failed, archiving job");
            if let Err(archive_err) = lifecycle::archive_job(ctx, &job_id).await {
                warn!(job_id = %job_id, error = %archive_err, "Failed to archive unsubmitted job");
            }
            Err(Error::Submission(e))
        }
    }
}

/// Submit a single job if the policy calls for one.
pub async fn submit_if_needed(
    ctx: &PoolContext,
    transport: &dyn SubmissionTransport,
    command: &str,
) -> Result<Option<Job>> {
    let counts = QueueCounts::fetch(ctx.store()).await?;
    let policy = SubmissionPolicy::new(ctx.config().max_jobs);
    if !policy.should_submit(&counts) {
        info!(
            tasks = counts.tasks(),
            jobs = counts.jobs(),
            max_jobs = policy.max_jobs,
            "No submission needed"
        );
        return Ok(None);
    }
    submit_job(ctx, transport, command).await.map(Some)
}

/// Submit as many jobs as the policy calls for in one pass. With `dry_run`
/// only the count is reported.
pub async fn submit_while_needed(
    ctx: &PoolContext,
    transport: &dyn SubmissionTransport,
    command: &str,
    dry_run: bool,
) -> Result<SubmissionReport> {
    let counts = QueueCounts::fetch(ctx.store()).await?;
    let policy = SubmissionPolicy::new(ctx.config().max_jobs);
    let needed = policy.jobs_needed(&counts);
    info!(
        tasks = counts.tasks(),
        jobs = counts.jobs(),
        needed,
        dry_run,
        "Submission pass"
    );

    let mut report = SubmissionReport {
        needed,
        submitted: Vec::new(),
    };
    if dry_run {
        return Ok(report);
    }
    for _ in 0..needed {
        report
            .submitted
            .push(submit_job(ctx, transport, command).await?);
    }
    Ok(report)
}
