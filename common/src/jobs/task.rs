use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What a batch run does for every employee of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Render slips only.
    Generate,
    /// Deliver previously rendered slips.
    Send,
    /// Render (or reuse a cached slip), then deliver.
    GenerateAndSend,
}

impl Operation {
    pub fn renders(self) -> bool {
        matches!(self, Self::Generate | Self::GenerateAndSend)
    }

    pub fn delivers(self) -> bool {
        matches!(self, Self::Send | Self::GenerateAndSend)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Send => "send",
            Self::GenerateAndSend => "generate_and_send",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "generate" => Some(Self::Generate),
            "send" => Some(Self::Send),
            "generate_and_send" => Some(Self::GenerateAndSend),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-employee state within one batch run.
///
/// ```text
/// queued -> rendering -> rendered -> delivering -> delivered
///              |                         |-> delivery_failed
///              |-> render_failed         |-> delivery_unknown
/// any non-terminal -> cancelled
/// ```
///
/// `rendering -> rendering` and `delivering -> delivering` mark a retried
/// attempt. Failed states only leave through an explicit retry, which puts the
/// task back to `queued` with a new revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Rendering,
    Rendered,
    Delivering,
    Delivered,
    RenderFailed,
    DeliveryFailed,
    /// The webhook call timed out after the request went out. The remote side
    /// may or may not have sent the message, so it is never resent automatically.
    DeliveryUnknown,
    Cancelled,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Rendering => "rendering",
            Self::Rendered => "rendered",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::RenderFailed => "render_failed",
            Self::DeliveryFailed => "delivery_failed",
            Self::DeliveryUnknown => "delivery_unknown",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "queued" => Self::Queued,
            "rendering" => Self::Rendering,
            "rendered" => Self::Rendered,
            "delivering" => Self::Delivering,
            "delivered" => Self::Delivered,
            "render_failed" => Self::RenderFailed,
            "delivery_failed" => Self::DeliveryFailed,
            "delivery_unknown" => Self::DeliveryUnknown,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::RenderFailed | Self::DeliveryFailed | Self::DeliveryUnknown
        )
    }

    /// Whether the state ends the task for `operation`. `rendered` is the end of
    /// a generate run but only a waypoint when the run also delivers.
    pub fn is_terminal_for(self, operation: Operation) -> bool {
        match self {
            Self::Rendered => !operation.delivers(),
            Self::Delivered | Self::Cancelled => true,
            other => other.is_failure(),
        }
    }

    pub fn is_success_for(self, operation: Operation) -> bool {
        match self {
            Self::Rendered => !operation.delivers(),
            Self::Delivered => true,
            _ => false,
        }
    }

    /// Automatic transitions a worker may perform during `operation`.
    /// Re-queueing failed tasks is handled by the retry path and is not listed here.
    pub fn can_advance(self, next: TaskState, operation: Operation) -> bool {
        use TaskState::*;
        if self.is_terminal_for(operation) {
            return false;
        }
        match (self, next) {
            (_, Cancelled) => true,
            (Queued, Rendering) | (Queued, Rendered) => operation.renders(),
            (Queued, Delivering) | (Queued, DeliveryFailed) => operation == Operation::Send,
            (Rendering, Rendering) | (Rendering, Rendered) | (Rendering, RenderFailed) => true,
            (Rendered, Delivering) | (Rendered, DeliveryFailed) => operation.delivers(),
            (Delivering, Delivering)
            | (Delivering, Delivered)
            | (Delivering, DeliveryFailed)
            | (Delivering, DeliveryUnknown) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a task failure. Decides whether the pipeline retries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad template, missing field or missing contact. Never retried.
    Configuration,
    /// Renderer crash or timeout, network blip, 5xx. Retried with backoff.
    TransientExternal,
    /// 4xx, rejected payload, corrupt renderer output. Never retried.
    PermanentExternal,
    Cancelled,
    /// Delivery timed out after dispatch.
    UnknownOutcome,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        self == Self::TransientExternal
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Current state of one employee's task, as kept in the session ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub employee_id: Uuid,
    pub employee_name: String,
    pub employee_code: Option<String>,
    pub state: TaskState,
    /// Revision of the task. Starts at 1 and grows with every explicit retry.
    pub attempt: u32,
    pub render_attempts: u32,
    pub delivery_attempts: u32,
    pub cache_hit: bool,
    pub slip_hash: Option<String>,
    pub error: Option<TaskError>,
    pub updated_at: DateTime<Utc>,
}
