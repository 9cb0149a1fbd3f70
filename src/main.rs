use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use taskpool::config::PoolConfig;
use taskpool::context::PoolContext;
use taskpool::lifecycle;
use taskpool::model::Task;
use taskpool::scrub::{ScrubQueue, Scrubber};
use taskpool::store::{LibSqlStore, Store};
use taskpool::submission;
use taskpool::tasks::{self, TaskSpec};
use taskpool::transport::{self, FileTransport, WebDavTransport};
use taskpool::worker::{CommandExecutor, Runner, install_shutdown_handler};

const USAGE: &str = "\
usage: taskpool <command> [args]

commands:
  init                                  create the database schema
  create <tasks.json>                   add tasks from a JSON array
  delete <task-id>...                   delete tasks
  run [--endless] [--priority] [--parallel N] [--job-id ID]
                                        claim and execute tasks as a job
  scrub <queue|all> [--age SECS]        recover stale tasks and jobs
  submit [--dry-run] [--once]           launch jobs while tasks are waiting
  cancel <job-id>                       ask a running job to stop
  status                                print view counts

configuration is read from TASKPOOL_* environment variables";

/// Install the fmt subscriber, plus a daily rolling file when
/// `TASKPOOL_LOG_DIR` is set. The guard must live until exit.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match std::env::var("TASKPOOL_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "taskpool.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

/// Value following `flag` in `args`, if present.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn file_transport(config: &PoolConfig) -> Option<Box<dyn FileTransport>> {
    config
        .webdav
        .as_ref()
        .map(|dav| Box::new(WebDavTransport::new(dav)) as Box<dyn FileTransport>)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };
    let rest = &args[1..];

    let mut config = PoolConfig::from_env().context("invalid configuration")?;
    if let Some(job_id) = flag_value(rest, "--job-id") {
        config.job_id = Some(job_id.to_string());
    }

    // Fail on transport settings before touching the store.
    let submit_transport = if command == "submit" {
        Some(transport::submit::from_config(&config.submit).context("invalid submission settings")?)
    } else {
        None
    };

    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    let ctx = PoolContext::new(store, config);

    match command {
        "init" => {
            ctx.store().init_schema().await?;
            eprintln!("Database ready at {}", ctx.config().db_path.display());
        }

        "create" => {
            let Some(path) = rest.first() else {
                bail!("usage: taskpool create <tasks.json>");
            };
            let files = file_transport(ctx.config());
            let created = create_from_file(&ctx, Path::new(path), files.as_deref()).await?;
            for task in &created {
                println!("{}", task.id);
            }
        }

        "delete" => {
            if rest.is_empty() {
                bail!("usage: taskpool delete <task-id>...");
            }
            let files = file_transport(ctx.config());
            let deleted = tasks::delete_tasks(&ctx, rest, files.as_deref()).await?;
            eprintln!("Deleted {deleted} of {} tasks", rest.len());
        }

        "run" => {
            let parallelism = match flag_value(rest, "--parallel") {
                Some(n) => n.parse().context("--parallel expects a number")?,
                None => ctx.config().parallelism,
            };
            let executor = CommandExecutor::new().with_timeout(ctx.config().task_timeout);
            let summary = Runner::new(ctx.clone(), Arc::new(executor))
                .with_stop_flag(install_shutdown_handler())
                .with_parallelism(parallelism)
                .endless(has_flag(rest, "--endless"))
                .priority(has_flag(rest, "--priority"))
                .run()
                .await?;
            eprintln!(
                "Job {} processed {} tasks ({})",
                summary.job_id, summary.processed, summary.reason
            );
        }

        "scrub" => {
            let Some(target) = rest.first() else {
                bail!("usage: taskpool scrub <queue|all> [--age SECS]");
            };
            let age: i64 = match flag_value(rest, "--age") {
                Some(a) => a.parse().context("--age expects seconds")?,
                None => 0,
            };
            let queues = if target == "all" {
                ScrubQueue::ALL.to_vec()
            } else {
                vec![target.parse::<ScrubQueue>()?]
            };
            let scrubber = Scrubber::new(ctx.clone());
            for queue in queues {
                let (updated, scanned) = scrubber.scrub(queue, age).await?;
                println!("{queue}: {updated}/{scanned}");
            }
        }

        "submit" => {
            let Some(transport) = submit_transport else {
                bail!("submission transport not configured");
            };
            let job_command = ctx
                .config()
                .submit
                .command
                .clone()
                .unwrap_or_else(|| "taskpool run".to_string());
            if has_flag(rest, "--once") {
                match submission::submit_if_needed(&ctx, transport.as_ref(), &job_command).await? {
                    Some(job) => println!("{}", job.id),
                    None => eprintln!("No job needed"),
                }
            } else {
                let dry_run = has_flag(rest, "--dry-run");
                let report =
                    submission::submit_while_needed(&ctx, transport.as_ref(), &job_command, dry_run)
                        .await?;
                for job in &report.submitted {
                    println!("{}", job.id);
                }
                eprintln!(
                    "{} jobs needed, {} submitted",
                    report.needed,
                    report.submitted.len()
                );
            }
        }

        "cancel" => {
            let Some(job_id) = rest.first() else {
                bail!("usage: taskpool cancel <job-id>");
            };
            lifecycle::cancel_job(&ctx, job_id).await?;
            eprintln!("Cancellation requested for {job_id}");
        }

        "status" => {
            for (view, count) in tasks::queue_status(ctx.store()).await? {
                println!("{view:<16} {count}");
            }
        }

        other => {
            eprintln!("unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

async fn create_from_file(
    ctx: &PoolContext,
    path: &Path,
    files: Option<&dyn FileTransport>,
) -> anyhow::Result<Vec<Task>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let specs: Vec<TaskSpec> =
        serde_json::from_str(&raw).with_context(|| format!("invalid task list in {}", path.display()))?;

    let now = taskpool::model::unix_now();
    let mut new_tasks = Vec::with_capacity(specs.len());
    for mut spec in specs {
        let attachments = std::mem::take(&mut spec.files);
        let mut task = spec.into_task(now);
        for (name, local) in attachments {
            let data = tokio::fs::read(&local)
                .await
                .with_context(|| format!("failed to read attachment {}", local.display()))?;
            tasks::store_attachment(&mut task, &name, &data, files).await?;
        }
        new_tasks.push(task);
    }
    Ok(tasks::create_tasks(ctx, new_tasks).await?)
}
