//! Batch job vocabulary shared by the pipeline and its observers.
//!
//! `task` holds the per-employee state machine, `progress` the event and
//! snapshot types pushed to progress subscribers.

pub mod progress;
pub mod task;

pub use progress::{ProgressEvent, ProgressSnapshot, StateCounts, StreamMessage};
pub use task::{ErrorKind, Operation, TaskError, TaskRecord, TaskState};
