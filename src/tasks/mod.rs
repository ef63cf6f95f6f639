//! Relational task store (C4 — TaskStore).

pub mod storage;

use serde::{Deserialize, Serialize};

pub use storage::TaskStore;

pub const DEFAULT_BOARD_ID: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    Doing,
    Pending,
    Blocked,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Doing => "doing",
            TaskStatus::Pending => "pending",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "todo" => Some(TaskStatus::Todo),
            "doing" => Some(TaskStatus::Doing),
            "pending" => Some(TaskStatus::Pending),
            "blocked" => Some(TaskStatus::Blocked),
            "done" => Some(TaskStatus::Done),
            _ => None,
        }
    }

    /// `blocked` and `pending` require a non-empty `statusReason` (§3, §4.4).
    pub fn requires_reason(&self) -> bool {
        matches!(self, TaskStatus::Blocked | TaskStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorklogEntry {
    pub created_at: i64,
    pub created_by: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub board_id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub status_updated_at: i64,
    pub owner: String,
    pub assigned_to: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub status_reason: Option<String>,
    pub blockers: Vec<String>,
    pub artifacts: Vec<String>,
    pub worklog: Vec<WorklogEntry>,
    pub project: Option<String>,
}

/// Input to `createTask`. `status` defaults to `todo` when omitted.
#[derive(Debug, Clone)]
pub struct TaskDraft {
    pub assigned_to: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub status_reason: Option<String>,
    pub project: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TaskStatus; 5] = [
        TaskStatus::Todo,
        TaskStatus::Doing,
        TaskStatus::Pending,
        TaskStatus::Blocked,
        TaskStatus::Done,
    ];

    #[test]
    fn requires_reason_matches_blocked_and_pending_only() {
        for status in ALL {
            let expected = matches!(status, TaskStatus::Blocked | TaskStatus::Pending);
            assert_eq!(status.requires_reason(), expected, "{status:?}");
        }
    }

    proptest::proptest! {
        /// `parse` inverts `as_str` for every variant — no status round-trips
        /// to a different one, and no variant's wire string is rejected.
        #[test]
        fn parse_inverts_as_str(idx in 0usize..ALL.len()) {
            let status = ALL[idx];
            proptest::prop_assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
    }
}
