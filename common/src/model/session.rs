use crate::jobs::task::{Operation, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Overall status of an import session's batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Imported, no batch has run yet.
    Pending,
    Running,
    /// Every task reached a terminal state and at least one succeeded.
    Completed,
    Cancelled,
    /// Every task failed.
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// Status of a run whose tasks ended in `states`. Any cancellation wins,
    /// then a run where every task failed is `failed`.
    pub fn settle<I>(states: I, cancel_requested: bool) -> Self
    where
        I: IntoIterator<Item = TaskState>,
    {
        let (mut total, mut failed, mut cancelled) = (0usize, 0usize, false);
        for state in states {
            total += 1;
            failed += usize::from(state.is_failure());
            cancelled |= state == TaskState::Cancelled;
        }
        if cancel_requested || cancelled {
            Self::Cancelled
        } else if total > 0 && failed == total {
            Self::Failed
        } else {
            Self::Completed
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One imported spreadsheet: the batch unit the pipeline works on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSession {
    pub id: Uuid,
    pub filename: String,
    pub sheet_name: String,
    pub status: SessionStatus,
    /// Operation of the most recent batch run, if any ran.
    pub last_operation: Option<Operation>,
    /// Employee ids in sheet order. Scheduling follows this order.
    pub employee_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
