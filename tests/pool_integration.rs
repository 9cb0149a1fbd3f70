//! End-to-end scenarios against an in-memory libSQL store.
//!
//! Each test builds its own pool, drives it through the public API, and
//! checks the documents left behind.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use taskpool::config::PoolConfig;
use taskpool::context::PoolContext;
use taskpool::error::{ClaimError, Error, ExecutionError, StoreError, SubmissionError};
use taskpool::model::{Job, JobState, Task, TaskState};
use taskpool::scrub::{ScrubQueue, Scrubber};
use taskpool::store::{Document, LibSqlStore, Store, View, ViewQuery, ViewRow, load, persist};
use taskpool::submission;
use taskpool::tasks;
use taskpool::transport::{BatchState, BatchStatus, SubmissionTransport};
use taskpool::worker::{CommandExecutor, Runner, StopReason, TaskExecutor};
use taskpool::TaskClaimer;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn pool(config: PoolConfig) -> PoolContext {
    let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
    PoolContext::new(store, config)
}

async fn pool_with_tasks(config: PoolConfig, n: usize) -> PoolContext {
    let ctx = pool(config).await;
    let new_tasks = (0..n)
        .map(|i| Task::new(format!("t{i:02}"), 0).with_input(json!({"i": i})))
        .collect();
    tasks::create_tasks(&ctx, new_tasks).await.unwrap();
    ctx
}

/// Transport that launches nothing and hands out sequential batch ids.
#[derive(Default)]
struct RecordingTransport {
    submitted: AtomicUsize,
}

#[async_trait]
impl SubmissionTransport for RecordingTransport {
    fn method(&self) -> &str {
        "recording"
    }

    async fn submit(&self, _job: &Job, _command: &str) -> Result<Option<String>, SubmissionError> {
        let n = self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(Some(format!("batch-{n}")))
    }

    async fn status(&self, jobs: &[Job]) -> Result<Vec<BatchStatus>, SubmissionError> {
        Ok(jobs
            .iter()
            .map(|j| BatchStatus {
                job_id: j.id.clone(),
                batch_id: j.batch_id.clone(),
                state: BatchState::Queued,
            })
            .collect())
    }

    async fn kill(&self, _job: &Job) -> Result<(), SubmissionError> {
        Ok(())
    }
}

struct BrokenTransport;

#[async_trait]
impl SubmissionTransport for BrokenTransport {
    fn method(&self) -> &str {
        "broken"
    }

    async fn submit(&self, job: &Job, _command: &str) -> Result<Option<String>, SubmissionError> {
        Err(SubmissionError::Failed {
            job_id: job.id.clone(),
            method: "broken".into(),
            reason: "scheduler unavailable".into(),
        })
    }

    async fn status(&self, _jobs: &[Job]) -> Result<Vec<BatchStatus>, SubmissionError> {
        Ok(Vec::new())
    }

    async fn kill(&self, _job: &Job) -> Result<(), SubmissionError> {
        Ok(())
    }
}

/// Executor that sleeps for a fixed time per task.
struct Sleeper(Duration);

#[async_trait]
impl TaskExecutor for Sleeper {
    async fn process(&self, mut task: Task) -> Result<Task, ExecutionError> {
        tokio::time::sleep(self.0).await;
        task.output = json!({"slept_ms": self.0.as_millis() as u64});
        Ok(task)
    }
}

/// Store whose task writes always lose, and whose first `vanishing` task
/// reads report the document as deleted.
struct ContestedStore {
    inner: LibSqlStore,
    conflict_tasks: bool,
    vanishing: AtomicU32,
}

impl ContestedStore {
    async fn new(conflict_tasks: bool, vanishing: u32) -> Self {
        Self {
            inner: LibSqlStore::new_memory().await.unwrap(),
            conflict_tasks,
            vanishing: AtomicU32::new(vanishing),
        }
    }
}

#[async_trait]
impl Store for ContestedStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        self.inner.init_schema().await
    }

    async fn get(&self, id: &str) -> Result<Document, StoreError> {
        let doc = self.inner.get(id).await?;
        if doc.doc_type() == Some("task")
            && self
                .vanishing
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        Ok(doc)
    }

    async fn save(&self, doc: &Document) -> Result<Document, StoreError> {
        if self.conflict_tasks && doc.rev.is_some() && doc.doc_type() == Some("task") {
            return Err(StoreError::Conflict { id: doc.id.clone() });
        }
        self.inner.save(doc).await
    }

    async fn delete(&self, doc: &Document) -> Result<(), StoreError> {
        self.inner.delete(doc).await
    }

    async fn view(&self, view: View, query: ViewQuery) -> Result<Vec<ViewRow>, StoreError> {
        self.inner.view(view, query).await
    }

    async fn view_count(&self, view: View) -> Result<u64, StoreError> {
        self.inner.view_count(view).await
    }
}

async fn contested_pool(store: ContestedStore, allowed_failures: u32) -> PoolContext {
    let config = PoolConfig {
        allowed_failures,
        ..Default::default()
    };
    // Seeded underneath the wrapper so setup reads are not affected.
    persist(&store.inner, &mut Task::new("busy", 1)).await.unwrap();
    PoolContext::new(Arc::new(store), config)
}

/// Executor that deletes its own task before returning a result.
struct DeletesItself(PoolContext);

#[async_trait]
impl TaskExecutor for DeletesItself {
    async fn process(&self, mut task: Task) -> Result<Task, ExecutionError> {
        tasks::delete_tasks(&self.0, &[task.id.clone()], None)
            .await
            .unwrap();
        task.output = json!({"late": true});
        Ok(task)
    }
}

#[tokio::test]
async fn claims_give_up_after_allowed_failures() {
    let ctx = contested_pool(ContestedStore::new(true, 0).await, 4).await;
    let err = TaskClaimer::new(ctx.clone().with_job_id("job-x"))
        .claim_from(View::Pending)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Claim(ClaimError::Exhausted { attempts: 4, .. })
    ));
    assert_eq!(ctx.store().view_count(View::Pending).await.unwrap(), 1);
}

#[tokio::test]
async fn exhausted_claims_end_the_run_and_finish_the_job() {
    let ctx = contested_pool(ContestedStore::new(true, 0).await, 3).await;
    let summary = tokio::time::timeout(
        TEST_TIMEOUT,
        Runner::new(ctx.clone(), Arc::new(Sleeper(Duration::ZERO))).run(),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(summary.reason, StopReason::ClaimExhausted);
    assert_eq!(summary.processed, 0);
    assert_eq!(ctx.store().view_count(View::JobsArchived).await.unwrap(), 1);
    assert_eq!(ctx.store().view_count(View::JobsRunning).await.unwrap(), 0);
}

#[tokio::test]
async fn vanished_pick_is_just_a_failed_attempt() {
    let ctx = contested_pool(ContestedStore::new(false, 2).await, 5).await;
    let task = TaskClaimer::new(ctx.clone().with_job_id("job-x"))
        .claim_from(View::Pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.id, "busy");
    assert_eq!(task.state(), TaskState::Claimed);
}

#[tokio::test]
async fn deleted_task_is_not_recreated_by_its_result() {
    let ctx = pool(PoolConfig::default()).await;
    tasks::create_tasks(&ctx, vec![Task::new("gone", 0)]).await.unwrap();

    let summary = Runner::new(ctx.clone(), Arc::new(DeletesItself(ctx.clone())))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.processed, 0);
    assert!(matches!(
        ctx.store().get("gone").await,
        Err(StoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn unreadable_task_does_not_stop_the_worker() {
    let ctx = pool_with_tasks(PoolConfig::default(), 1).await;
    let mut bad = Document::new("bad");
    for (key, value) in [
        ("type", json!("task")),
        ("lock", json!(0)),
        ("done", json!(0)),
        ("created", json!(1)),
        ("parallelism", json!("many")),
    ] {
        bad.body.insert(key.into(), value);
    }
    ctx.store().save(&bad).await.unwrap();

    let summary = Runner::new(ctx.clone(), Arc::new(Sleeper(Duration::ZERO)))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.reason, StopReason::QueueEmpty);
    let good: Task = load(ctx.store(), "t00").await.unwrap();
    assert_eq!(good.state(), TaskState::Done);
    assert_eq!(ctx.store().view_count(View::Error).await.unwrap(), 1);
    assert_eq!(ctx.store().view_count(View::Pending).await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_claimers_never_share_a_task() {
    let config = PoolConfig {
        claim_window: 5,
        allowed_failures: 100,
        ..Default::default()
    };
    let ctx = pool_with_tasks(config, 30).await;

    let mut handles = Vec::new();
    for w in 0..8 {
        let claimer = TaskClaimer::new(ctx.clone().with_job_id(format!("job-w{w}")));
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Ok(Some(task)) = claimer.next_task().await {
                ids.push(task.id);
            }
            ids
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(tokio::time::timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap());
    }
    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(unique.len(), all.len(), "a task was claimed twice");

    let leftover = ctx.store().view_count(View::Pending).await.unwrap() as usize;
    assert_eq!(all.len() + leftover, 30);
    assert_eq!(
        ctx.store().view_count(View::InProgress).await.unwrap() as usize,
        all.len()
    );

    // Each in-progress task names the job that claimed it.
    for id in &all {
        let task: Task = load(ctx.store(), id).await.unwrap();
        assert!(task.job.as_deref().is_some_and(|j| j.starts_with("job-w")));
    }
}

#[tokio::test]
async fn scrubbing_twice_changes_nothing_more() {
    let ctx = pool_with_tasks(PoolConfig::default(), 3).await;
    let claimer = TaskClaimer::new(ctx.clone().with_job_id("job-dead"));
    for _ in 0..3 {
        claimer.next_task().await.unwrap().unwrap();
    }

    let scrubber = Scrubber::new(ctx.clone());
    assert_eq!(scrubber.scrub(ScrubQueue::InProgress, 0).await.unwrap(), (3, 3));
    assert_eq!(scrubber.scrub(ScrubQueue::InProgress, 0).await.unwrap(), (0, 0));

    for i in 0..3 {
        let task: Task = load(ctx.store(), &format!("t{i:02}")).await.unwrap();
        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(task.scrub_count, 1);
    }
}

#[tokio::test]
async fn failed_task_stays_failed_until_scrubbed() {
    let ctx = pool(PoolConfig::default()).await;
    let failing = Task::new("bad", 0).with_command("echo nope >&2; exit 1", Vec::<String>::new());
    tasks::create_tasks(&ctx, vec![failing]).await.unwrap();

    let summary = Runner::new(ctx.clone(), Arc::new(CommandExecutor::new()))
        .run()
        .await
        .unwrap();
    assert_eq!(summary.processed, 1);

    let task: Task = load(ctx.store(), "bad").await.unwrap();
    assert_eq!((task.lock, task.done), (-1, -1));
    assert_eq!(task.error.len(), 1);
    assert_eq!(ctx.store().view_count(View::Done).await.unwrap(), 0);

    Scrubber::new(ctx.clone())
        .scrub(ScrubQueue::Error, 0)
        .await
        .unwrap();
    let task: Task = load(ctx.store(), "bad").await.unwrap();
    assert_eq!(task.state(), TaskState::Pending);
    assert_eq!(task.error.len(), 1);
}

#[tokio::test]
async fn submission_respects_task_and_job_caps() {
    let config = PoolConfig {
        max_jobs: 2,
        ..Default::default()
    };
    let ctx = pool_with_tasks(config, 5).await;
    let transport = RecordingTransport::default();

    let dry = submission::submit_while_needed(&ctx, &transport, "taskpool run", true)
        .await
        .unwrap();
    assert_eq!(dry.needed, 2);
    assert!(dry.submitted.is_empty());
    assert_eq!(transport.submitted.load(Ordering::SeqCst), 0);

    let report = submission::submit_while_needed(&ctx, &transport, "taskpool run", false)
        .await
        .unwrap();
    assert_eq!(report.submitted.len(), 2);
    for job in &report.submitted {
        assert_eq!(job.state(), JobState::Queued);
        assert_eq!(job.method, "recording");
        assert!(job.batch_id.as_deref().is_some_and(|b| b.starts_with("batch-")));
    }
    assert_eq!(ctx.store().view_count(View::JobsPending).await.unwrap(), 2);

    // At the cap: running + pending == min(tasks, max_jobs).
    assert!(
        submission::submit_if_needed(&ctx, &transport, "taskpool run")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn no_jobs_without_tasks() {
    let ctx = pool(PoolConfig {
        max_jobs: 4,
        ..Default::default()
    })
    .await;
    let transport = RecordingTransport::default();
    let report = submission::submit_while_needed(&ctx, &transport, "taskpool run", false)
        .await
        .unwrap();
    assert_eq!(report.needed, 0);
    assert_eq!(transport.submitted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_submission_archives_the_job() {
    let ctx = pool_with_tasks(PoolConfig::default(), 1).await;
    let err = submission::submit_job(&ctx, &BrokenTransport, "taskpool run")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Submission(SubmissionError::Failed { .. })));

    let store = ctx.store();
    assert_eq!(store.view_count(View::JobsPending).await.unwrap(), 0);
    let archived = store
        .view(View::JobsArchived, ViewQuery::default())
        .await
        .unwrap();
    assert_eq!(archived.len(), 1);
    assert!(archived[0].id.starts_with("archived-job-"));
    let job: Job = load(store, &archived[0].id).await.unwrap();
    assert_eq!(job.method, "broken");
    assert_eq!(job.queue, 0);
}

#[tokio::test]
async fn submitted_job_runs_tasks_and_is_archived() {
    let ctx = pool(PoolConfig::default()).await;
    let new_tasks = (0..3)
        .map(|i| Task::new(format!("echo-{i}"), 0).with_command("printf '{\"n\": %s}'", [i.to_string()]))
        .collect();
    tasks::create_tasks(&ctx, new_tasks).await.unwrap();

    let transport = RecordingTransport::default();
    let job = submission::submit_job(&ctx, &transport, "taskpool run")
        .await
        .unwrap();
    assert_eq!(job.state(), JobState::Queued);

    // The launched process picks its id up from the environment.
    let worker_ctx = ctx.clone().with_job_id(job.id.clone());
    let summary = Runner::new(worker_ctx, Arc::new(CommandExecutor::new()))
        .run()
        .await
        .unwrap();
    assert_eq!(summary.job_id, job.id);
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.reason, StopReason::QueueEmpty);

    let store = ctx.store();
    for i in 0..3 {
        let task: Task = load(store, &format!("echo-{i}")).await.unwrap();
        assert_eq!(task.state(), TaskState::Done);
        assert_eq!(task.output, json!({"n": i}));
        assert_eq!(task.job.as_deref(), Some(job.id.as_str()));
        assert!(task.elapsed >= 0.0);
    }

    let archived = store
        .view(View::JobsArchived, ViewQuery::default())
        .await
        .unwrap();
    assert_eq!(archived.len(), 1);
    let finished: Job = load(store, &archived[0].id).await.unwrap();
    assert_eq!(finished.id, format!("archived-{}-{}", job.id, finished.archive));
    assert_eq!(finished.tasks_processed, 3);
    assert_eq!(finished.batch_id.as_deref(), Some("batch-0"));
    assert!(store.get(&job.id).await.is_err());
}

#[tokio::test]
async fn parallel_pool_runs_tasks_side_by_side() {
    let ctx = pool_with_tasks(PoolConfig::default(), 2).await;
    let runner = Runner::new(ctx.clone(), Arc::new(Sleeper(Duration::from_millis(300))))
        .with_parallelism(2);

    let started = Instant::now();
    let summary = tokio::time::timeout(TEST_TIMEOUT, runner.run())
        .await
        .unwrap()
        .unwrap();
    let wall = started.elapsed();

    assert_eq!(summary.processed, 2);
    assert!(wall > Duration::from_millis(300), "finished too fast: {wall:?}");
    assert!(wall < Duration::from_millis(600), "tasks did not overlap: {wall:?}");
}

#[tokio::test]
async fn task_wanting_every_slot_runs_alone() {
    let ctx = pool(PoolConfig::default()).await;
    let greedy = Task::new("greedy", 0).with_parallelism(taskpool::model::Parallelism::All);
    let small = Task::new("small", 0);
    tasks::create_tasks(&ctx, vec![greedy, small]).await.unwrap();

    let runner = Runner::new(ctx.clone(), Arc::new(Sleeper(Duration::from_millis(200))))
        .with_parallelism(2);
    let started = Instant::now();
    let summary = tokio::time::timeout(TEST_TIMEOUT, runner.run())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(summary.processed, 2);
    assert!(started.elapsed() >= Duration::from_millis(400));
}
