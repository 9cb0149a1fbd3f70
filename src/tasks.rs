//! Task administration: creation, deletion, attachments and queue counts.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::context::PoolContext;
use crate::error::{ConfigError, Result, StoreError, TransportError};
use crate::model::{Attachment, Parallelism, Task, new_task_id, unix_now};
use crate::store::{Document, Store, View, load};
use crate::transport::FileTransport;

/// A task as written by a user, e.g. in a JSON file given to `taskpool create`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    pub id: Option<String>,
    pub command: Option<String>,
    pub arguments: Vec<String>,
    pub input: Value,
    pub parallelism: Parallelism,
    pub priority: i64,
    /// Attachment name → local file to upload.
    pub files: BTreeMap<String, PathBuf>,
}

impl TaskSpec {
    pub fn into_task(self, now: i64) -> Task {
        let mut task = Task::new(self.id.unwrap_or_else(new_task_id), now)
            .with_input(self.input)
            .with_parallelism(self.parallelism)
            .with_priority(self.priority);
        if let Some(command) = self.command {
            task = task.with_command(command, self.arguments);
        }
        task
    }
}

/// Insert new tasks. Ids already in use are skipped. Returns the tasks that
/// were created, with their revisions.
pub async fn create_tasks(ctx: &PoolContext, tasks: Vec<Task>) -> Result<Vec<Task>> {
    let now = unix_now();
    let mut tasks = tasks;
    for task in &mut tasks {
        if task.id.is_empty() {
            task.id = new_task_id();
        }
        if task.created == 0 {
            task.created = now;
        }
        task.rev = None;
    }

    let docs = tasks
        .iter()
        .map(Document::from_record)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let written = ctx.store().save_many(&docs).await?;

    let mut created = Vec::with_capacity(tasks.len());
    for (task, ok) in tasks.into_iter().zip(written) {
        if !ok {
            warn!(task_id = %task.id, "Task id already exists, skipped");
            continue;
        }
        // save_many reports success only; re-read for the revision.
        created.push(load(ctx.store(), &task.id).await?);
    }
    info!(count = created.len(), "Tasks created");
    Ok(created)
}

/// Delete tasks by id, along with their remote attachments. Missing ids are
/// ignored. Returns the number deleted.
pub async fn delete_tasks(
    ctx: &PoolContext,
    ids: &[String],
    files: Option<&dyn FileTransport>,
) -> Result<usize> {
    let store = ctx.store();
    let mut deleted = 0;
    for id in ids {
        for _ in 0..ctx.max_update_retries().max(1) {
            let task: Task = match load(store, id).await {
                Ok(task) => task,
                Err(StoreError::NotFound { .. }) => break,
                Err(e) => return Err(e.into()),
            };
            match store.delete(&Document::from_record(&task)?).await {
                Ok(()) => {
                    deleted += 1;
                    if let Some(files) = files {
                        remove_remote_files(files, &task).await;
                    }
                    break;
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(StoreError::NotFound { .. }) => break,
                Err(e) => return Err(e.into()),
            }
        }
    }
    info!(deleted, requested = ids.len(), "Tasks deleted");
    Ok(deleted)
}

async fn remove_remote_files(files: &dyn FileTransport, task: &Task) {
    for attachment in task.files.values() {
        if let Attachment::Remote { path, .. } = attachment {
            if let Err(e) = files.delete(path, true).await {
                warn!(task_id = %task.id, path, error = %e, "Failed to delete attachment");
            }
        }
    }
}

fn remote_path(task_id: &str, name: &str) -> String {
    format!("tasks/{task_id}/{name}")
}

/// Attach `data` to the task under `name`. With a file transport the bytes
/// are uploaded and referenced; without one they are inlined as base64.
///
/// Only the in-memory task is changed; persist it afterwards.
pub async fn store_attachment(
    task: &mut Task,
    name: &str,
    data: &[u8],
    files: Option<&dyn FileTransport>,
) -> Result<()> {
    let attachment = match files {
        Some(files) => {
            files.mkdir("tasks", true).await?;
            files.mkdir(&format!("tasks/{}", task.id), true).await?;
            let path = remote_path(&task.id, name);
            files.put(&path, data).await?;
            Attachment::remote(path, data.len() as u64)
        }
        None => Attachment::inline(data),
    };
    task.files.insert(name.to_string(), attachment);
    Ok(())
}

/// Read an attachment back.
pub async fn load_attachment(
    task: &Task,
    name: &str,
    files: Option<&dyn FileTransport>,
) -> Result<Vec<u8>> {
    let attachment = task
        .files
        .get(name)
        .ok_or_else(|| TransportError::NotFound(name.to_string()))?;
    if let Some(decoded) = attachment.decode_inline(name) {
        return Ok(decoded?);
    }
    let Attachment::Remote { path, .. } = attachment else {
        return Err(TransportError::NotFound(name.to_string()).into());
    };
    let files = files.ok_or_else(|| ConfigError::MissingRequired {
        key: "TASKPOOL_WEBDAV_URL".into(),
        hint: format!("attachment {name} is stored remotely"),
    })?;
    Ok(files.get(path).await?)
}

/// Row counts of every view.
pub async fn queue_status(store: &dyn Store) -> Result<Vec<(View, u64)>> {
    let mut counts = Vec::with_capacity(View::ALL.len());
    for view in View::ALL {
        counts.push((view, store.view_count(view).await?));
    }
    Ok(counts)
}
