//! Execution loop: claim, process, persist, repeat.
//!
//! One `Runner::run` is the life of one job. The job is started, tasks are
//! claimed until the queue drains or a stop condition holds, and the job is
//! finished (which archives it when nothing else is pending on it).

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::claim::TaskClaimer;
use crate::context::PoolContext;
use crate::error::{Error, ExecutionError, Result, StoreError};
use crate::lifecycle;
use crate::model::{Task, new_job_id, unix_now};
use crate::worker::executor::TaskExecutor;
use crate::worker::shutdown::StopFlag;

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    QueueEmpty,
    /// The next task would likely overrun `max_runtime`.
    Budget,
    Cancelled,
    Stopped,
    /// Too many conflicting claim attempts in a row.
    ClaimExhausted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::QueueEmpty => "queue empty",
            Self::Budget => "runtime budget reached",
            Self::Cancelled => "job cancelled",
            Self::Stopped => "stop requested",
            Self::ClaimExhausted => "claim attempts exhausted",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub job_id: String,
    pub processed: u64,
    pub reason: StopReason,
}

/// Wall-clock budget, judged against the average task duration so far.
#[derive(Debug)]
struct Budget {
    started: Instant,
    max: Option<Duration>,
    total: Duration,
    count: u32,
}

impl Budget {
    fn new(max: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            max,
            total: Duration::ZERO,
            count: 0,
        }
    }

    fn record(&mut self, elapsed: Duration) {
        self.total += elapsed;
        self.count += 1;
    }

    fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count
        }
    }

    fn exhausted(&self) -> bool {
        self.max
            .is_some_and(|max| self.started.elapsed() + self.average() >= max)
    }
}

pub struct Runner {
    ctx: PoolContext,
    executor: Arc<dyn TaskExecutor>,
    stop: StopFlag,
    parallelism: u32,
    endless: bool,
    priority: bool,
}

impl Runner {
    pub fn new(ctx: PoolContext, executor: Arc<dyn TaskExecutor>) -> Self {
        let parallelism = ctx.config().parallelism.max(1);
        Self {
            ctx,
            executor,
            stop: StopFlag::new(),
            parallelism,
            endless: false,
            priority: false,
        }
    }

    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    /// Pool size. 1 runs tasks one after another.
    pub fn with_parallelism(mut self, slots: u32) -> Self {
        self.parallelism = slots.max(1);
        self
    }

    /// Wait for new tasks instead of exiting on an empty queue.
    pub fn endless(mut self, endless: bool) -> Self {
        self.endless = endless;
        self
    }

    pub fn priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    /// Run one job to completion.
    ///
    /// Uses the context's job id, or registers a fresh one for a worker
    /// started by hand.
    pub async fn run(&self) -> Result<RunSummary> {
        let job_id = match self.ctx.job_id() {
            Some(id) => id.to_string(),
            None => new_job_id(),
        };
        let ctx = self.ctx.clone().with_job_id(job_id.clone());
        lifecycle::start_job(&ctx, &job_id).await?;
        info!(job_id = %job_id, parallelism = self.parallelism, endless = self.endless, "Worker starting");

        let outcome = if self.parallelism > 1 {
            self.parallel_loop(&ctx, &job_id).await
        } else {
            self.sequential_loop(&ctx, &job_id).await
        };

        // Finish even when the loop failed, so the job does not look alive.
        let finished = lifecycle::finish_job(&ctx, &job_id).await;
        let (processed, reason) = outcome?;
        finished?;

        info!(job_id = %job_id, processed, %reason, "Worker finished");
        Ok(RunSummary {
            job_id,
            processed,
            reason,
        })
    }

    fn claimer(&self, ctx: &PoolContext) -> TaskClaimer {
        let mut claimer = TaskClaimer::new(ctx.clone());
        if self.priority {
            claimer = claimer.priority();
        }
        if self.endless {
            claimer = claimer.endless(self.stop.clone());
        }
        claimer
    }

    /// Check the conditions that end a run before the next claim.
    async fn should_stop(&self, ctx: &PoolContext, job_id: &str, budget: &Budget) -> Option<StopReason> {
        if self.stop.is_stopped() {
            return Some(StopReason::Stopped);
        }
        if budget.exhausted() {
            return Some(StopReason::Budget);
        }
        match lifecycle::is_cancelled(ctx, job_id).await {
            Ok(true) => Some(StopReason::Cancelled),
            Ok(false) => None,
            Err(e) => {
                warn!(job_id, error = %e, "Could not read job for cancellation check");
                None
            }
        }
    }

    /// What an empty claim means: drained queue, or an endless run told to stop.
    fn drained_reason(&self) -> StopReason {
        if self.stop.is_stopped() {
            StopReason::Stopped
        } else if self.endless {
            StopReason::Cancelled
        } else {
            StopReason::QueueEmpty
        }
    }

    async fn sequential_loop(&self, ctx: &PoolContext, job_id: &str) -> Result<(u64, StopReason)> {
        let claimer = self.claimer(ctx);
        let mut budget = Budget::new(ctx.config().max_runtime);
        let mut processed = 0;

        let reason = loop {
            if let Some(reason) = self.should_stop(ctx, job_id, &budget).await {
                break reason;
            }
            let task = match claimer.next_task().await {
                Ok(Some(task)) => task,
                Ok(None) => break self.drained_reason(),
                Err(Error::Claim(e)) => {
                    warn!(job_id, error = %e, "Giving up on claiming");
                    break StopReason::ClaimExhausted;
                }
                Err(e) => return Err(e),
            };

            let outcome = process_one(ctx.clone(), Arc::clone(&self.executor), task).await;
            budget.record(outcome.elapsed);
            if outcome.persisted {
                processed += 1;
            }
        };
        Ok((processed, reason))
    }

    async fn parallel_loop(&self, ctx: &PoolContext, job_id: &str) -> Result<(u64, StopReason)> {
        let capacity = self.parallelism;
        let slots = Arc::new(Semaphore::new(capacity as usize));
        let claimer = self.claimer(ctx);
        let mut budget = Budget::new(ctx.config().max_runtime);
        let mut inflight: JoinSet<Outcome> = JoinSet::new();
        let mut processed = 0;

        let mut reap = |result: std::result::Result<Outcome, JoinError>, budget: &mut Budget| {
            match result {
                Ok(outcome) => {
                    budget.record(outcome.elapsed);
                    if outcome.persisted {
                        processed += 1;
                    }
                }
                Err(e) => error!(job_id, error = %e, "Task runner aborted"),
            }
        };

        let reason = loop {
            while let Some(result) = inflight.try_join_next() {
                reap(result, &mut budget);
            }
            if let Some(reason) = self.should_stop(ctx, job_id, &budget).await {
                break reason;
            }

            // Only claim once at least one slot is free.
            let Ok(probe) = Arc::clone(&slots).acquire_owned().await else {
                break StopReason::Stopped;
            };
            let task = match claimer.next_task().await {
                Ok(Some(task)) => task,
                Ok(None) => break self.drained_reason(),
                Err(Error::Claim(e)) => {
                    warn!(job_id, error = %e, "Giving up on claiming");
                    break StopReason::ClaimExhausted;
                }
                Err(e) => {
                    while let Some(result) = inflight.join_next().await {
                        reap(result, &mut budget);
                    }
                    return Err(e);
                }
            };
            drop(probe);

            let k = task.parallelism.slots(capacity);
            let Ok(permit) = Arc::clone(&slots).acquire_many_owned(k).await else {
                break StopReason::Stopped;
            };
            debug!(task_id = %task.id, slots = k, "Dispatching task");

            let ctx = ctx.clone();
            let executor = Arc::clone(&self.executor);
            inflight.spawn(async move {
                let outcome = process_one(ctx, executor, task).await;
                drop(permit);
                outcome
            });
        };

        while let Some(result) = inflight.join_next().await {
            reap(result, &mut budget);
        }
        Ok((processed, reason))
    }
}

struct Outcome {
    elapsed: Duration,
    persisted: bool,
}

/// Execute one claimed task and persist the result.
///
/// Executor errors and panics end up in the task's error history; they never
/// escape. A task that cannot be persisted is left for the scrubber.
async fn process_one(ctx: PoolContext, executor: Arc<dyn TaskExecutor>, task: Task) -> Outcome {
    let started = Instant::now();
    let fallback = task.clone();
    let task_id = task.id.clone();

    let handle = tokio::spawn(async move { executor.process(task).await });
    let mut task = match handle.await {
        Ok(Ok(task)) => task,
        Ok(Err(e)) => {
            warn!(task_id = %task_id, error = %e, "Task failed");
            let mut task = fallback;
            task.record_error(e.to_string(), None, unix_now());
            task
        }
        Err(join) => {
            let err = ExecutionError::Panicked(panic_message(join));
            error!(task_id = %task_id, error = %err, "Executor panicked");
            let mut task = fallback;
            task.record_error(err.to_string(), None, unix_now());
            task
        }
    };

    let elapsed = started.elapsed();
    task.elapsed = elapsed.as_secs_f64();
    task.mark_done(unix_now());

    let persisted = match lifecycle::persist_task(ctx.store(), &mut task, ctx.max_update_retries()).await {
        Ok(()) => true,
        Err(StoreError::NotFound { .. }) => {
            warn!(task_id = %task_id, "Task was deleted while running, result dropped");
            false
        }
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Failed to persist task result");
            false
        }
    };

    if persisted {
        info!(task_id = %task_id, state = %task.state(), elapsed = task.elapsed, "Task processed");
        if let Some(job_id) = ctx.job_id() {
            if let Err(e) = lifecycle::record_processed(&ctx, job_id, 1).await {
                warn!(job_id, error = %e, "Failed to update processed count");
            }
        }
    }

    Outcome { elapsed, persisted }
}

fn panic_message(join: JoinError) -> String {
    if !join.is_panic() {
        return join.to_string();
    }
    let payload: Box<dyn Any + Send> = join.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
