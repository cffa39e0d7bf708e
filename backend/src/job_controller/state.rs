//! The in-memory ledger of one batch run and the task that writes to it.
//!
//! Workers never touch the ledger directly. They send a [`LedgerUpdate`] over
//! an MPSC channel and `start_ledger_updater`, the single writer, applies it:
//! it validates the transition, appends a [`ProgressEvent`] to the history,
//! persists the new task state and publishes the event together with a
//! snapshot derived from the ledger. All of this happens under one write lock,
//! so subscribers see events in the same order as the history.
//!
//! Progress queries take the read side of the same lock. Aggregate counts are
//! always derived from the task states, never kept as separate counters.

use crate::job_controller::broadcaster::ProgressBroadcaster;
use crate::store::Store;
use chrono::Utc;
use common::jobs::{
    ErrorKind, Operation, ProgressEvent, ProgressSnapshot, TaskError, TaskRecord, TaskState,
};
use common::model::employee::EmployeeRecord;
use common::model::session::SessionStatus;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// A state change requested by the worker that owns the task.
#[derive(Debug, Clone)]
pub struct LedgerUpdate {
    pub(crate) employee_id: Uuid,
    pub(crate) to: TaskState,
    pub(crate) error: Option<TaskError>,
    pub(crate) slip_hash: Option<String>,
    pub(crate) cache_hit: bool,
}

impl LedgerUpdate {
    pub fn new(employee_id: Uuid, to: TaskState) -> Self {
        Self {
            employee_id,
            to,
            error: None,
            slip_hash: None,
            cache_hit: false,
        }
    }

    pub fn with_error(mut self, error: Option<TaskError>) -> Self {
        self.error = error;
        self
    }

    pub fn with_slip(mut self, hash: String, cache_hit: bool) -> Self {
        self.slip_hash = Some(hash);
        self.cache_hit = cache_hit;
        self
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum TransitionError {
    #[error("employee {0} is not part of this batch")]
    UnknownTask(Uuid),

    #[error("employee {employee_id}: {from} -> {to} is not allowed")]
    Rejected {
        employee_id: Uuid,
        from: TaskState,
        to: TaskState,
    },
}

pub struct Ledger {
    session_id: Uuid,
    operation: Operation,
    status: SessionStatus,
    /// Employee ids in scheduling order.
    order: Vec<Uuid>,
    tasks: HashMap<Uuid, TaskRecord>,
    history: Vec<ProgressEvent>,
}

impl Ledger {
    /// One queued task per employee, in the given order.
    pub fn new(session_id: Uuid, operation: Operation, employees: &[EmployeeRecord]) -> Self {
        let now = Utc::now();
        let tasks = employees
            .iter()
            .map(|e| {
                let record = TaskRecord {
                    employee_id: e.id,
                    employee_name: e.name.clone(),
                    employee_code: e.code.clone(),
                    state: TaskState::Queued,
                    attempt: 1,
                    render_attempts: 0,
                    delivery_attempts: 0,
                    cache_hit: false,
                    slip_hash: None,
                    error: None,
                    updated_at: now,
                };
                (e.id, record)
            })
            .collect();
        Self {
            session_id,
            operation,
            status: SessionStatus::Pending,
            order: employees.iter().map(|e| e.id).collect(),
            tasks,
            history: Vec::new(),
        }
    }

    /// Rebuilds the ledger of a finished run from stored task records. Tasks
    /// that did not end under `operation` were not part of that run and are
    /// left out. The history starts empty.
    pub fn from_records(session_id: Uuid, operation: Operation, records: Vec<TaskRecord>) -> Self {
        let records: Vec<TaskRecord> = records
            .into_iter()
            .filter(|r| r.state.is_terminal_for(operation))
            .collect();
        Self {
            session_id,
            operation,
            status: SessionStatus::Pending,
            order: records.iter().map(|r| r.employee_id).collect(),
            tasks: records.into_iter().map(|r| (r.employee_id, r)).collect(),
            history: Vec::new(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
    }

    pub fn task(&self, employee_id: Uuid) -> Option<&TaskRecord> {
        self.tasks.get(&employee_id)
    }

    /// Task records in scheduling order.
    pub fn records(&self) -> Vec<TaskRecord> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect()
    }

    pub fn history(&self) -> &[ProgressEvent] {
        &self.history
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot::derive(
            self.session_id,
            Some(self.operation),
            self.status,
            self.order.iter().filter_map(|id| self.tasks.get(id)).map(|t| t.state),
        )
    }

    /// Ids of queued tasks, in scheduling order.
    pub fn queued(&self) -> Vec<Uuid> {
        self.ids_where(|t| t.state == TaskState::Queued)
    }

    fn ids_where<F: Fn(&TaskRecord) -> bool>(&self, pred: F) -> Vec<Uuid> {
        self.order
            .iter()
            .filter(|id| self.tasks.get(id).is_some_and(&pred))
            .copied()
            .collect()
    }

    pub fn has_failures(&self) -> bool {
        self.tasks.values().any(|t| t.state.is_failure())
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks
            .values()
            .all(|t| t.state.is_terminal_for(self.operation))
    }

    /// Applies a worker transition and records it in the history.
    pub fn apply(&mut self, update: &LedgerUpdate) -> Result<ProgressEvent, TransitionError> {
        let operation = self.operation;
        let record = self
            .tasks
            .get_mut(&update.employee_id)
            .ok_or(TransitionError::UnknownTask(update.employee_id))?;
        if !record.state.can_advance(update.to, operation) {
            return Err(TransitionError::Rejected {
                employee_id: update.employee_id,
                from: record.state,
                to: update.to,
            });
        }

        let from = record.state;
        match update.to {
            TaskState::Rendering => record.render_attempts += 1,
            TaskState::Delivering => record.delivery_attempts += 1,
            _ => {}
        }
        if let Some(hash) = &update.slip_hash {
            record.slip_hash = Some(hash.clone());
            record.cache_hit = update.cache_hit;
        }
        record.state = update.to;
        record.error = update.error.clone();
        record.updated_at = Utc::now();

        let attempt = record.attempt;
        Ok(self.push_event(update.employee_id, from, update.to, attempt, update.error.clone()))
    }

    /// Puts every failed task back to `queued` under a new revision. Earlier
    /// transitions stay in the history. Returns the re-queue events.
    pub fn requeue_failed(&mut self) -> Vec<ProgressEvent> {
        let failed = self.ids_where(|t| t.state.is_failure());
        let now = Utc::now();
        let mut events = Vec::with_capacity(failed.len());
        for id in failed {
            let Some(record) = self.tasks.get_mut(&id) else {
                continue;
            };
            let from = record.state;
            record.state = TaskState::Queued;
            record.attempt += 1;
            record.error = None;
            record.updated_at = now;
            let attempt = record.attempt;
            events.push(self.push_event(id, from, TaskState::Queued, attempt, None));
        }
        events
    }

    /// Fails every task that did not reach a terminal state. Used when a
    /// worker died without reporting its outcome. A delivery that was in
    /// flight ends `delivery_unknown`: the webhook may have received it.
    pub fn fail_unfinished(&mut self, reason: &str) -> Vec<ProgressEvent> {
        let operation = self.operation;
        let unfinished = self.ids_where(|t| !t.state.is_terminal_for(operation));
        let now = Utc::now();
        let mut events = Vec::with_capacity(unfinished.len());
        for id in unfinished {
            let Some(record) = self.tasks.get_mut(&id) else {
                continue;
            };
            let from = record.state;
            let (to, kind) = match from {
                TaskState::Delivering => (TaskState::DeliveryUnknown, ErrorKind::UnknownOutcome),
                TaskState::Queued | TaskState::Rendering if operation.renders() => {
                    (TaskState::RenderFailed, ErrorKind::TransientExternal)
                }
                _ => (TaskState::DeliveryFailed, ErrorKind::TransientExternal),
            };
            let error = TaskError::new(kind, reason);
            record.state = to;
            record.error = Some(error.clone());
            record.updated_at = now;
            let attempt = record.attempt;
            events.push(self.push_event(id, from, to, attempt, Some(error)));
        }
        events
    }

    /// Final session status once every task is terminal.
    pub fn settle(&self, cancel_requested: bool) -> SessionStatus {
        SessionStatus::settle(self.tasks.values().map(|t| t.state), cancel_requested)
    }

    fn push_event(
        &mut self,
        employee_id: Uuid,
        from: TaskState,
        to: TaskState,
        attempt: u32,
        error: Option<TaskError>,
    ) -> ProgressEvent {
        let event = ProgressEvent {
            sequence: self.history.len() as u64 + 1,
            session_id: self.session_id,
            employee_id,
            from,
            to,
            attempt,
            at: Utc::now(),
            error,
        };
        self.history.push(event.clone());
        event
    }
}

/// Persists and publishes events the ledger already recorded. The caller
/// holds the ledger's write lock.
pub(crate) fn commit_events(
    ledger: &Ledger,
    events: Vec<ProgressEvent>,
    store: &Store,
    broadcaster: &ProgressBroadcaster,
) {
    for event in events {
        debug!(
            "Session {}: employee {} {} -> {} (revision {})",
            event.session_id, event.employee_id, event.from, event.to, event.attempt
        );
        if let Err(e) = store.record_task_state(event.employee_id, event.to, event.error.as_ref()) {
            error!(
                "Session {}: failed to persist state of employee {}: {}",
                event.session_id, event.employee_id, e
            );
        }
        broadcaster.publish(event, ledger.snapshot());
    }
}

/// Single writer of a run's ledger.
///
/// Spawned next to the run's workers and ends when every sender of `rx` is
/// dropped, after applying every update that was sent.
pub async fn start_ledger_updater(
    ledger: Arc<RwLock<Ledger>>,
    broadcaster: ProgressBroadcaster,
    store: Store,
    mut rx: mpsc::Receiver<LedgerUpdate>,
) {
    while let Some(update) = rx.recv().await {
        let mut ledger = ledger.write().await;
        match ledger.apply(&update) {
            Ok(event) => commit_events(&ledger, vec![event], &store, &broadcaster),
            Err(e) => warn!("Session {}: {}", ledger.session_id(), e),
        }
    }
}
