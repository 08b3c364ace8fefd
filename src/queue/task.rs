//! Admission task identity and lifecycle.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

/// Unique identifier of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a task. Transitions only move forward:
/// `Queued -> Running -> {Completed, Failed, TimedOut}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Point-in-time view of a task still in the active table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub status: TaskStatus,
    /// Accepted for API compatibility; dispatch is FIFO.
    pub priority: u8,
    pub age_secs: f64,
    pub timeout_secs: Option<f64>,
    pub error: Option<String>,
}

pub(crate) enum Outcome<T> {
    Value(T),
    Failed(String),
    TimedOut(Duration),
}

/// Entry in the active-task table.
pub(crate) struct TaskEntry<T> {
    pub(crate) status: TaskStatus,
    pub(crate) priority: u8,
    pub(crate) created_at: Instant,
    pub(crate) timeout: Option<Duration>,
    pub(crate) outcome: Option<Outcome<T>>,
}

impl<T> TaskEntry<T> {
    pub(crate) fn queued(priority: u8, timeout: Option<Duration>) -> Self {
        Self {
            status: TaskStatus::Queued,
            priority,
            created_at: Instant::now(),
            timeout,
            outcome: None,
        }
    }

    /// Move to `Running`. Ignored unless the task is still queued.
    pub(crate) fn start(&mut self) {
        if self.status == TaskStatus::Queued {
            self.status = TaskStatus::Running;
        }
    }

    /// Record a terminal outcome. Ignored once the task is terminal.
    pub(crate) fn finish(&mut self, outcome: Outcome<T>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = match &outcome {
            Outcome::Value(_) => TaskStatus::Completed,
            Outcome::Failed(_) => TaskStatus::Failed,
            Outcome::TimedOut(_) => TaskStatus::TimedOut,
        };
        self.outcome = Some(outcome);
    }

    pub(crate) fn snapshot(&self, id: TaskId) -> TaskSnapshot {
        TaskSnapshot {
            id,
            status: self.status,
            priority: self.priority,
            age_secs: self.created_at.elapsed().as_secs_f64(),
            timeout_secs: self.timeout.map(|t| t.as_secs_f64()),
            error: match &self.outcome {
                Some(Outcome::Failed(message)) => Some(message.clone()),
                Some(Outcome::TimedOut(t)) => Some(format!("timed out after {t:?}")),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        let mut entry: TaskEntry<u32> = TaskEntry::queued(0, None);
        entry.start();
        assert_eq!(entry.status, TaskStatus::Running);

        entry.finish(Outcome::Failed("boom".into()));
        entry.finish(Outcome::Value(1));
        entry.start();
        assert_eq!(entry.status, TaskStatus::Failed);
        assert!(matches!(entry.outcome, Some(Outcome::Failed(_))));
    }

    #[test]
    fn snapshot_reports_failure_message() {
        let mut entry: TaskEntry<()> = TaskEntry::queued(3, Some(Duration::from_secs(2)));
        entry.finish(Outcome::Failed("bad input".into()));
        let snap = entry.snapshot(TaskId::new());
        assert_eq!(snap.status, TaskStatus::Failed);
        assert_eq!(snap.priority, 3);
        assert_eq!(snap.timeout_secs, Some(2.0));
        assert_eq!(snap.error.as_deref(), Some("bad input"));
    }

    #[test]
    fn task_ids_are_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
    }
}
