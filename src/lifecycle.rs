//! Bounded update-with-retry and the job lifecycle transitions.
//!
//! Every transition is one conditional write of a freshly-read document.
//! Finish and queue decide archival inside that same write, so whichever of
//! the two lands second sees the other's timestamp and archives the job.

use tracing::{debug, error, info, warn};

use crate::context::PoolContext;
use crate::error::{JobError, Result, StoreError};
use crate::model::{Job, Task, unix_now};
use crate::store::{Document, Record, Store, load, persist};

/// Read `id`, apply `mutate`, write it back; on conflict re-read and retry.
///
/// When the document does not exist and `construct` yields a record, that
/// record is created instead. Gives up with `RetryExhausted` after
/// `max_retries` conflicting writes.
pub async fn update_or_create<R, C, F>(
    store: &dyn Store,
    id: &str,
    max_retries: u32,
    construct: C,
    mut mutate: F,
) -> std::result::Result<R, StoreError>
where
    R: Record,
    C: Fn() -> Option<R> + Send,
    F: FnMut(&mut R) + Send,
{
    let attempts = max_retries.max(1);
    for attempt in 1..=attempts {
        let mut record = match load::<R>(store, id).await {
            Ok(record) => record,
            Err(StoreError::NotFound { .. }) => match construct() {
                Some(mut fresh) => {
                    fresh.set_id(id.to_string());
                    fresh.set_rev(None);
                    fresh
                }
                None => return Err(StoreError::NotFound { id: id.to_string() }),
            },
            Err(e) => return Err(e),
        };

        mutate(&mut record);

        match persist(store, &mut record).await {
            Ok(()) => return Ok(record),
            Err(StoreError::Conflict { .. }) => {
                debug!(id, attempt, "Conflicting write, re-reading");
            }
            Err(e) => return Err(e),
        }
    }

    warn!(id, attempts, "Update retries exhausted");
    Err(StoreError::RetryExhausted {
        id: id.to_string(),
        attempts,
    })
}

/// [`update_or_create`] for documents that must already exist.
pub async fn update_with_retry<R, F>(
    store: &dyn Store,
    id: &str,
    max_retries: u32,
    mutate: F,
) -> std::result::Result<R, StoreError>
where
    R: Record,
    F: FnMut(&mut R) + Send,
{
    update_or_create(store, id, max_retries, || None, mutate).await
}

/// Persist a processed task without losing the executor's result.
///
/// A plain conditional write is tried first. If someone else wrote the task
/// in the meantime, the result fields are laid over the stored copy with
/// update-with-retry. A task deleted while it ran stays deleted: the result
/// is dropped and `NotFound` returned.
pub async fn persist_task(
    store: &dyn Store,
    task: &mut Task,
    max_retries: u32,
) -> std::result::Result<(), StoreError> {
    match persist(store, task).await {
        Ok(()) => return Ok(()),
        Err(StoreError::Conflict { .. }) => {
            debug!(task_id = %task.id, "Task changed while processing, merging result");
        }
        Err(e) => return Err(e),
    }

    let result = task.clone();
    let merged = update_with_retry(store, &result.id, max_retries, |stored: &mut Task| {
        overlay_result(stored, &result)
    })
    .await?;
    *task = merged;
    Ok(())
}

fn overlay_result(stored: &mut Task, result: &Task) {
    stored.lock = result.lock;
    stored.done = result.done;
    stored.hostname = result.hostname.clone();
    stored.job = result.job.clone();
    stored.output = result.output.clone();
    stored.elapsed = result.elapsed;
    for record in &result.error {
        if !stored.error.contains(record) {
            stored.error.push(record.clone());
        }
    }
    for (name, attachment) in &result.files {
        stored.files.insert(name.clone(), attachment.clone());
    }
}

// ── Job transitions ─────────────────────────────────────────────────

fn not_registered(id: &str, e: StoreError) -> crate::error::Error {
    match e {
        StoreError::NotFound { .. } => JobError::NotRegistered { id: id.to_string() }.into(),
        other => other.into(),
    }
}

/// Create the job document if it does not exist yet.
pub async fn register_job(ctx: &PoolContext, job_id: &str, method: &str) -> Result<Job> {
    let now = unix_now();
    let job = update_or_create(
        ctx.store(),
        job_id,
        ctx.max_update_retries(),
        || Some(Job::new(job_id, method, now)),
        |_: &mut Job| {},
    )
    .await?;
    info!(job_id, method, "Job registered");
    Ok(job)
}

/// Mark the job as running on this host, registering it if needed.
pub async fn start_job(ctx: &PoolContext, job_id: &str) -> Result<Job> {
    let now = unix_now();
    let hostname = ctx.hostname().to_string();
    let job = update_or_create(
        ctx.store(),
        job_id,
        ctx.max_update_retries(),
        || Some(Job::new(job_id, "", now)),
        |job: &mut Job| job.mark_started(&hostname, now),
    )
    .await?;
    info!(job_id, hostname = %job.hostname, "Job started");
    Ok(job)
}

/// Record that the submission transport queued the job.
///
/// Archives the job when it has already finished.
pub async fn queue_job(ctx: &PoolContext, job_id: &str, batch_id: Option<String>) -> Result<Job> {
    let now = unix_now();
    let job = update_with_retry(
        ctx.store(),
        job_id,
        ctx.max_update_retries(),
        |job: &mut Job| {
            job.mark_queued(batch_id.clone(), now);
            if job.is_settled() {
                job.mark_archived(now);
            }
        },
    )
    .await
    .map_err(|e| not_registered(job_id, e))?;
    info!(job_id, batch_id = ?job.batch_id, "Job queued");
    settle(ctx, job).await
}

/// Record that the job's process has finished.
///
/// Archives the job when its queueing has already been recorded, or when it
/// was never submitted.
pub async fn finish_job(ctx: &PoolContext, job_id: &str) -> Result<Job> {
    let now = unix_now();
    let job = update_with_retry(
        ctx.store(),
        job_id,
        ctx.max_update_retries(),
        |job: &mut Job| {
            job.mark_finished(now);
            if job.is_settled() {
                job.mark_archived(now);
            }
        },
    )
    .await
    .map_err(|e| not_registered(job_id, e))?;
    info!(job_id, tasks_processed = job.tasks_processed, "Job finished");
    settle(ctx, job).await
}

/// Archive a job unconditionally and re-key it.
pub async fn archive_job(ctx: &PoolContext, job_id: &str) -> Result<Job> {
    let now = unix_now();
    let job = update_with_retry(
        ctx.store(),
        job_id,
        ctx.max_update_retries(),
        |job: &mut Job| job.mark_archived(now),
    )
    .await
    .map_err(|e| not_registered(job_id, e))?;
    rename_archived(ctx, job).await
}

/// Ask the job to stop after its in-flight tasks.
pub async fn cancel_job(ctx: &PoolContext, job_id: &str) -> Result<Job> {
    let now = unix_now();
    let job = update_with_retry(
        ctx.store(),
        job_id,
        ctx.max_update_retries(),
        |job: &mut Job| job.request_cancel(now),
    )
    .await
    .map_err(|e| not_registered(job_id, e))?;
    info!(job_id, "Job cancellation requested");
    Ok(job)
}

/// Add `count` to the job's processed-task counter.
pub async fn record_processed(ctx: &PoolContext, job_id: &str, count: u64) -> Result<Job> {
    update_with_retry(
        ctx.store(),
        job_id,
        ctx.max_update_retries(),
        |job: &mut Job| job.tasks_processed += count,
    )
    .await
    .map_err(|e| not_registered(job_id, e))
}

/// Whether the job has been asked to stop. A job that no longer exists
/// under `job_id` counts as cancelled.
pub async fn is_cancelled(ctx: &PoolContext, job_id: &str) -> Result<bool> {
    match load::<Job>(ctx.store(), job_id).await {
        Ok(job) => Ok(job.is_cancelled() || job.archive > 0),
        Err(StoreError::NotFound { .. }) => Ok(true),
        Err(e) => Err(e.into()),
    }
}

async fn settle(ctx: &PoolContext, job: Job) -> Result<Job> {
    if job.archive > 0 {
        rename_archived(ctx, job).await
    } else {
        Ok(job)
    }
}

/// Move an archived job to `archived-<id>-<ts>`: delete the current
/// document, then create the archived copy without a revision.
async fn rename_archived(ctx: &PoolContext, mut job: Job) -> Result<Job> {
    if job.has_archived_id() {
        return Ok(job);
    }
    let store = ctx.store();
    let original_id = job.id.clone();
    let attempts = ctx.max_update_retries().max(1);

    for attempt in 1..=attempts {
        let doc = Document::from_record(&job)?;
        match store.delete(&doc).await {
            Ok(()) => {
                let archived_id = job.archived_id(job.archive);
                job.set_id(archived_id.clone());
                job.set_rev(None);
                let job = create_archived(store, job, attempts).await?;
                info!(job_id = %original_id, archived_id = %job.id, "Job archived");
                return Ok(job);
            }
            Err(StoreError::Conflict { .. }) => {
                debug!(job_id = %original_id, attempt, "Job changed before archival, re-reading");
                job = load(store, &original_id).await?;
                job.mark_archived(unix_now());
            }
            Err(StoreError::NotFound { .. }) => {
                return Err(JobError::NotRegistered { id: original_id }.into());
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(StoreError::RetryExhausted {
        id: original_id,
        attempts,
    }
    .into())
}

/// Write the archived copy of a job whose live document is already gone.
/// Transient failures are retried; an existing archived copy wins.
async fn create_archived(store: &dyn Store, mut job: Job, attempts: u32) -> Result<Job> {
    let mut last_err = None;
    for attempt in 1..=attempts {
        match persist(store, &mut job).await {
            Ok(()) => return Ok(job),
            Err(StoreError::Conflict { .. }) => return Ok(load(store, &job.id).await?),
            Err(e) => {
                debug!(archived_id = %job.id, attempt, error = %e, "Archived copy not written, retrying");
                last_err = Some(e);
            }
        }
    }

    let body = serde_json::to_string(&job).unwrap_or_default();
    error!(archived_id = %job.id, body = %body, "Job document lost during archival");
    Err(last_err
        .unwrap_or(StoreError::RetryExhausted {
            id: job.id.clone(),
            attempts,
        })
        .into())
}
