use crate::jobs::task::{Operation, TaskError, TaskState};
use crate::model::session::SessionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One task state transition. The ordered list of these is the session's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    /// Position in the session history, starting at 1.
    pub sequence: u64,
    pub session_id: Uuid,
    pub employee_id: Uuid,
    pub from: TaskState,
    pub to: TaskState,
    /// Task revision the transition belongs to.
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub error: Option<TaskError>,
}

/// Number of tasks in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub queued: usize,
    pub rendering: usize,
    pub rendered: usize,
    pub delivering: usize,
    pub delivered: usize,
    pub render_failed: usize,
    pub delivery_failed: usize,
    pub delivery_unknown: usize,
    pub cancelled: usize,
}

impl StateCounts {
    pub fn record(&mut self, state: TaskState) {
        let slot = match state {
            TaskState::Queued => &mut self.queued,
            TaskState::Rendering => &mut self.rendering,
            TaskState::Rendered => &mut self.rendered,
            TaskState::Delivering => &mut self.delivering,
            TaskState::Delivered => &mut self.delivered,
            TaskState::RenderFailed => &mut self.render_failed,
            TaskState::DeliveryFailed => &mut self.delivery_failed,
            TaskState::DeliveryUnknown => &mut self.delivery_unknown,
            TaskState::Cancelled => &mut self.cancelled,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.queued
            + self.rendering
            + self.rendered
            + self.delivering
            + self.delivered
            + self.render_failed
            + self.delivery_failed
            + self.delivery_unknown
            + self.cancelled
    }
}

/// Aggregate view of a session, always derived from the task states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub session_id: Uuid,
    pub operation: Option<Operation>,
    pub status: SessionStatus,
    pub total: usize,
    pub counts: StateCounts,
    /// Tasks that reached the successful end of the operation.
    pub completed: usize,
    /// Failed tasks, including deliveries with an unknown outcome.
    pub failed: usize,
    /// Tasks that have not reached a terminal state yet.
    pub pending: usize,
}

impl ProgressSnapshot {
    pub fn derive<I>(
        session_id: Uuid,
        operation: Option<Operation>,
        status: SessionStatus,
        states: I,
    ) -> Self
    where
        I: IntoIterator<Item = TaskState>,
    {
        let mut counts = StateCounts::default();
        let (mut completed, mut failed, mut pending) = (0, 0, 0);
        for state in states {
            counts.record(state);
            match operation {
                Some(op) if state.is_success_for(op) => completed += 1,
                _ if state.is_failure() => failed += 1,
                Some(op) if !state.is_terminal_for(op) => pending += 1,
                None if state != TaskState::Cancelled => pending += 1,
                _ => {}
            }
        }
        Self {
            session_id,
            operation,
            status,
            total: counts.total(),
            counts,
            completed,
            failed,
            pending,
        }
    }
}

/// Messages written to a progress stream subscriber.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// First message of every subscription.
    Snapshot { progress: ProgressSnapshot },
    Event {
        event: ProgressEvent,
        progress: ProgressSnapshot,
    },
    Heartbeat { at: DateTime<Utc> },
    /// Last message. The session reached a terminal status.
    Closed { progress: ProgressSnapshot },
}

impl StreamMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Snapshot { .. } => "snapshot",
            Self::Event { .. } => "event",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Closed { .. } => "closed",
        }
    }
}
