//! Task documents and their state machine.
//!
//! ```text
//! pending (lock=0, done=0)
//!    │ claim
//!    ▼
//! claimed (lock=t, done=0) ──record_error──▶ error (lock=-1, done=-1)
//!    │ mark_done                                 │
//!    ▼                                           │
//! done (lock=t, done=t2)                         │
//!                                                │
//! claimed | error ──scrub──▶ pending (scrub_count += 1)
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::model::attachment::Attachment;
use crate::store::Record;

/// Marker stored in `lock` and `done` for a task in error.
pub const ERROR_MARK: i64 = -1;

/// A fresh task id.
pub fn new_task_id() -> String {
    format!("task-{}", Uuid::new_v4().simple())
}

/// Derived state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Claimed,
    Done,
    Error,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One entry in a task's error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub time: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

/// Concurrency slots a task asks for.
///
/// Stored as a positive integer, or `"*"` for every slot in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    Slots(u32),
    All,
}

impl Parallelism {
    /// Slots to acquire from a pool of `capacity`. Never zero, never more
    /// than the pool holds.
    pub fn slots(&self, capacity: u32) -> u32 {
        let capacity = capacity.max(1);
        match self {
            Self::Slots(k) => (*k).clamp(1, capacity),
            Self::All => capacity,
        }
    }
}

impl Default for Parallelism {
    fn default() -> Self {
        Self::Slots(1)
    }
}

impl Serialize for Parallelism {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Slots(k) => serializer.serialize_u32(*k),
            Self::All => serializer.serialize_str("*"),
        }
    }
}

impl<'de> Deserialize<'de> for Parallelism {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Ok(Self::Slots(n.clamp(1, u32::MAX as i64) as u32)),
            Raw::Text(s) if s.trim() == "*" => Ok(Self::All),
            Raw::Text(s) => s
                .trim()
                .parse::<u32>()
                .map(|n| Self::Slots(n.max(1)))
                .map_err(|_| serde::de::Error::custom(format!("invalid parallelism {s:?}"))),
        }
    }
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    #[serde(skip)]
    pub id: String,
    #[serde(skip)]
    pub rev: Option<String>,
    /// 0 = unclaimed, >0 = claim time, -1 = error.
    pub lock: i64,
    /// 0 = unfinished, >0 = completion time, -1 = error.
    pub done: i64,
    pub scrub_count: u32,
    pub hostname: String,
    pub input: Value,
    pub output: Value,
    pub error: Vec<ErrorRecord>,
    /// Id of the job that claimed the task.
    pub job: Option<String>,
    pub parallelism: Parallelism,
    pub command: Option<String>,
    pub arguments: Vec<String>,
    pub files: BTreeMap<String, Attachment>,
    pub priority: i64,
    pub created: i64,
    /// Seconds the executor spent on the last attempt.
    pub elapsed: f64,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            id: String::new(),
            rev: None,
            lock: 0,
            done: 0,
            scrub_count: 0,
            hostname: String::new(),
            input: Value::Null,
            output: Value::Null,
            error: Vec::new(),
            job: None,
            parallelism: Parallelism::default(),
            command: None,
            arguments: Vec::new(),
            files: BTreeMap::new(),
            priority: 0,
            created: 0,
            elapsed: 0.0,
        }
    }
}

impl Task {
    /// A new pending task.
    pub fn new(id: impl Into<String>, now: i64) -> Self {
        Self {
            id: id.into(),
            created: now,
            ..Default::default()
        }
    }

    pub fn with_command<I, S>(mut self, command: impl Into<String>, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(command.into());
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_parallelism(mut self, parallelism: Parallelism) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn state(&self) -> TaskState {
        if self.lock == ERROR_MARK || self.done == ERROR_MARK {
            TaskState::Error
        } else if self.done > 0 {
            TaskState::Done
        } else if self.lock > 0 {
            TaskState::Claimed
        } else {
            TaskState::Pending
        }
    }

    pub fn is_error(&self) -> bool {
        self.state() == TaskState::Error
    }

    /// Take ownership of the task for `hostname`.
    pub fn claim(&mut self, hostname: &str, job_id: Option<&str>, now: i64) {
        self.lock = now.max(1);
        self.hostname = hostname.to_string();
        self.job = job_id.map(str::to_string);
    }

    /// Record successful completion. Has no effect once the task is in
    /// error: a later success never masks an earlier failure.
    pub fn mark_done(&mut self, now: i64) {
        if self.is_error() {
            return;
        }
        self.done = now.max(1);
    }

    /// Append an error record and force the error state.
    pub fn record_error(&mut self, message: impl Into<String>, exception: Option<String>, now: i64) {
        self.error.push(ErrorRecord {
            time: now,
            message: message.into(),
            exception,
        });
        self.lock = ERROR_MARK;
        self.done = ERROR_MARK;
    }

    /// Return an orphaned task to the pending set, keeping its error history.
    pub fn scrub(&mut self, hostname: &str) {
        self.lock = 0;
        self.done = 0;
        self.scrub_count += 1;
        self.hostname = hostname.to_string();
    }

    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.error.last()
    }
}

impl Record for Task {
    const DOC_TYPE: &'static str = "task";

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
