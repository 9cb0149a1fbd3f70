//! Named secondary indexes over the document collection.

use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// The views the coordination protocol queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum View {
    /// Unclaimed, unfinished tasks.
    Pending,
    /// Pending tasks with `priority > 0`, highest priority first.
    PendingPriority,
    /// Claimed tasks not yet finished. Keyed by claim time.
    InProgress,
    /// Successfully finished tasks. Keyed by completion time.
    Done,
    /// Tasks in error. Keyed by the time of the last error record.
    Error,
    /// Jobs that have not started yet. Keyed by queue time.
    JobsPending,
    /// Started, unfinished jobs. Keyed by start time.
    JobsRunning,
    /// Finished jobs awaiting archival. Keyed by finish time.
    JobsFinished,
    /// Archived jobs. Keyed by archive time.
    JobsArchived,
    /// Jobs with a cancellation request that are not archived yet.
    JobsCancelled,
}

impl View {
    pub const ALL: [View; 10] = [
        View::Pending,
        View::PendingPriority,
        View::InProgress,
        View::Done,
        View::Error,
        View::JobsPending,
        View::JobsRunning,
        View::JobsFinished,
        View::JobsArchived,
        View::JobsCancelled,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PendingPriority => "pending_priority",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Error => "error",
            Self::JobsPending => "jobs_pending",
            Self::JobsRunning => "jobs_running",
            Self::JobsFinished => "jobs_finished",
            Self::JobsArchived => "jobs_archived",
            Self::JobsCancelled => "jobs_cancelled",
        }
    }

    /// True for views over task documents.
    pub fn is_task_view(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::PendingPriority | Self::InProgress | Self::Done | Self::Error
        )
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for View {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        View::ALL
            .iter()
            .copied()
            .find(|v| v.name() == s)
            .ok_or_else(|| StoreError::UnknownView(s.to_string()))
    }
}

/// Parameters for a view query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewQuery {
    /// Maximum number of rows to return.
    pub limit: Option<usize>,
    /// Reverse the view's natural order.
    pub descending: bool,
}

impl ViewQuery {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            descending: false,
        }
    }

    pub fn descending(mut self) -> Self {
        self.descending = !self.descending;
        self
    }
}
