//! Task and job records.

pub mod attachment;
pub mod job;
pub mod task;

pub use attachment::Attachment;
pub use job::{Job, JobState, new_job_id};
pub use task::{ErrorRecord, Parallelism, Task, TaskState, new_task_id};

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
