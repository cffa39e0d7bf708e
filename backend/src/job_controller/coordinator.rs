//! Batch runs, one per import session at a time.
//!
//! The coordinator keeps an arena of runs keyed by session id. A run owns its
//! ledger, its progress broadcaster and its cancellation token. Starting a run
//! spawns a driver that walks the session's employees in order, waits for a
//! pool slot for each and spawns a worker with it. The driver then waits for
//! the workers and the ledger updater, settles the session status and closes
//! the broadcaster.
//!
//! Finished runs stay in the arena so their full history can still be
//! queried. Only the most recent `retained_runs` finished runs are kept; older
//! ones, and every run after a restart, are answered from the store, which
//! keeps the last operation and the last state of every task.

use crate::config::AppConfig;
use crate::delivery::retry::RetryPolicy;
use crate::delivery::SlipDelivery;
use crate::error::{PipelineError, Result};
use crate::job_controller::broadcaster::{ProgressBroadcaster, Subscription};
use crate::job_controller::pool::WorkerPool;
use crate::job_controller::state::{commit_events, start_ledger_updater, Ledger};
use crate::job_controller::worker::{run_task, RunContext};
use crate::render::{SlipRenderer, SlipTemplate};
use crate::store::Store;
use common::jobs::{Operation, ProgressEvent, ProgressSnapshot, TaskRecord, TaskState};
use common::model::employee::EmployeeRecord;
use common::model::session::{ImportSession, SessionStatus};
use log::{debug, error, info};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const UPDATE_BUFFER: usize = 100;

/// Knobs of a run that come from configuration.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub render_retry: RetryPolicy,
    pub message_content: String,
    pub send_delay: Duration,
    pub subscriber_buffer: usize,
    pub retained_runs: usize,
}

impl BatchSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            render_retry: config.render.retry.clone(),
            message_content: config.delivery.message_content.clone(),
            send_delay: config.delivery.send_delay(),
            subscriber_buffer: config.broadcast.subscriber_buffer,
            retained_runs: config.pool.retained_runs,
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// One batch run of a session.
struct SessionRun {
    session_id: Uuid,
    /// Launch order, used to evict the oldest finished runs first.
    started: u64,
    operation: Operation,
    ledger: Arc<RwLock<Ledger>>,
    broadcaster: ProgressBroadcaster,
    cancel: CancellationToken,
    status: watch::Sender<SessionStatus>,
}

impl SessionRun {
    fn is_running(&self) -> bool {
        *self.status.borrow() == SessionStatus::Running
    }
}

struct Shared {
    store: Store,
    template: Arc<SlipTemplate>,
    renderer: Arc<dyn SlipRenderer>,
    delivery: Option<Arc<dyn SlipDelivery>>,
    pool: WorkerPool,
    settings: BatchSettings,
    launches: AtomicU64,
}

type Runs = Arc<RwLock<HashMap<Uuid, Arc<SessionRun>>>>;

/// Drops the oldest finished runs beyond `keep`.
fn evict_finished(runs: &mut HashMap<Uuid, Arc<SessionRun>>, keep: usize) {
    let mut finished: Vec<(u64, Uuid)> = runs
        .values()
        .filter(|run| !run.is_running())
        .map(|run| (run.started, run.session_id))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort_unstable();
    let excess = finished.len() - keep;
    for (_, session_id) in finished.into_iter().take(excess) {
        runs.remove(&session_id);
        debug!("Session {}: finished run dropped from memory", session_id);
    }
}

#[derive(Clone)]
pub struct BatchCoordinator {
    shared: Arc<Shared>,
    runs: Runs,
}

impl BatchCoordinator {
    pub fn new(
        store: Store,
        template: SlipTemplate,
        renderer: Arc<dyn SlipRenderer>,
        delivery: Option<Arc<dyn SlipDelivery>>,
        pool: WorkerPool,
        settings: BatchSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                template: Arc::new(template),
                renderer,
                delivery,
                pool,
                settings,
                launches: AtomicU64::new(0),
            }),
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.shared.pool
    }

    pub fn store(&self) -> &Store {
        &self.shared.store
    }

    /// Starts `operation` over every employee of the session. Fails with
    /// `Conflict` if a run of that session is still going.
    pub async fn start_batch(
        &self,
        session_id: Uuid,
        operation: Operation,
    ) -> Result<ProgressSnapshot> {
        self.start(session_id, operation, None).await
    }

    /// Runs `operation` for a single employee of the session. The run takes
    /// the session over like a full batch, so it conflicts with any other.
    pub async fn start_employee(
        &self,
        session_id: Uuid,
        employee_id: Uuid,
        operation: Operation,
    ) -> Result<ProgressSnapshot> {
        self.start(session_id, operation, Some(employee_id)).await
    }

    async fn start(
        &self,
        session_id: Uuid,
        operation: Operation,
        only: Option<Uuid>,
    ) -> Result<ProgressSnapshot> {
        self.shared
            .store
            .session(session_id)?
            .ok_or(PipelineError::SessionNotFound(session_id))?;
        let mut employees = self.shared.store.employees(session_id)?;
        if let Some(employee_id) = only {
            employees.retain(|e| e.id == employee_id);
            if employees.is_empty() {
                return Err(PipelineError::EmployeeNotFound(employee_id));
            }
        }

        let mut runs = self.runs.write().await;
        if runs.get(&session_id).is_some_and(|run| run.is_running()) {
            return Err(PipelineError::Conflict(session_id));
        }

        let ledger = Ledger::new(session_id, operation, &employees);
        let snapshot = self.launch(&mut runs, ledger, Vec::new(), employees)?;
        info!(
            "Session {}: {} started for {} employees",
            session_id, operation, snapshot.total
        );
        Ok(snapshot)
    }

    /// Re-queues the failed tasks of the last run and runs them again with
    /// the same operation. Tasks that succeeded are left alone. Without the
    /// run in memory, the last run is rebuilt from the stored task states.
    pub async fn retry_failed(&self, session_id: Uuid) -> Result<ProgressSnapshot> {
        let mut runs = self.runs.write().await;
        let employees = self.shared.store.employees(session_id)?;
        let mut ledger = match runs.get(&session_id).cloned() {
            Some(previous) if previous.is_running() => {
                return Err(PipelineError::Conflict(session_id));
            }
            Some(previous) => {
                let mut ledger = previous.ledger.write().await;
                if !ledger.has_failures() {
                    return Err(PipelineError::NothingToRetry(session_id));
                }
                std::mem::replace(
                    &mut *ledger,
                    Ledger::new(session_id, previous.operation, &[]),
                )
            }
            None => {
                let (session, records) = self.stored_records(session_id)?;
                let operation = session
                    .last_operation
                    .ok_or(PipelineError::NothingToRetry(session_id))?;
                let ledger = Ledger::from_records(session_id, operation, records);
                if !ledger.has_failures() {
                    return Err(PipelineError::NothingToRetry(session_id));
                }
                ledger
            }
        };
        let requeued = ledger.requeue_failed();

        let queued: HashSet<Uuid> = ledger.queued().into_iter().collect();
        let employees: Vec<EmployeeRecord> = employees
            .into_iter()
            .filter(|e| queued.contains(&e.id))
            .collect();

        let snapshot = self.launch(&mut runs, ledger, requeued, employees)?;
        info!(
            "Session {}: retrying {} failed tasks",
            session_id,
            queued.len()
        );
        Ok(snapshot)
    }

    /// Registers a run and spawns its driver. The arena lock is held by the
    /// caller, so no other run of the session can start in between.
    fn launch(
        &self,
        runs: &mut HashMap<Uuid, Arc<SessionRun>>,
        mut ledger: Ledger,
        requeued: Vec<ProgressEvent>,
        employees: Vec<EmployeeRecord>,
    ) -> Result<ProgressSnapshot> {
        let session_id = ledger.session_id();
        let operation = ledger.operation();
        let employee_ids: Vec<Uuid> = employees.iter().map(|e| e.id).collect();
        self.shared
            .store
            .begin_run(session_id, operation, &employee_ids)?;
        ledger.set_status(SessionStatus::Running);

        let broadcaster =
            ProgressBroadcaster::new(ledger.snapshot(), self.shared.settings.subscriber_buffer);
        commit_events(&ledger, requeued, &self.shared.store, &broadcaster);
        let snapshot = ledger.snapshot();

        let (status, _) = watch::channel(SessionStatus::Running);
        let run = Arc::new(SessionRun {
            session_id,
            started: self.shared.launches.fetch_add(1, Ordering::Relaxed),
            operation,
            ledger: Arc::new(RwLock::new(ledger)),
            broadcaster,
            cancel: CancellationToken::new(),
            status,
        });
        runs.insert(session_id, run.clone());
        evict_finished(runs, self.shared.settings.retained_runs);

        let shared = self.shared.clone();
        tokio::spawn(drive(shared, self.runs.clone(), run, employees));
        Ok(snapshot)
    }

    /// Cancels the running batch of a session. Queued work is dropped, renders
    /// and backoff waits are abandoned, webhook calls already in flight finish.
    pub async fn cancel_batch(&self, session_id: Uuid) -> Result<ProgressSnapshot> {
        let run = self
            .runs
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(PipelineError::NotRunning(session_id))?;
        if !run.is_running() {
            return Err(PipelineError::NotRunning(session_id));
        }
        info!("Session {}: cancellation requested", session_id);
        run.cancel.cancel();
        let snapshot = run.ledger.read().await.snapshot();
        Ok(snapshot)
    }

    async fn run(&self, session_id: Uuid) -> Option<Arc<SessionRun>> {
        self.runs.read().await.get(&session_id).cloned()
    }

    /// Current aggregate progress. Without a run in memory, it is rebuilt from
    /// the task states the store kept.
    pub async fn progress(&self, session_id: Uuid) -> Result<ProgressSnapshot> {
        if let Some(run) = self.run(session_id).await {
            return Ok(run.ledger.read().await.snapshot());
        }
        let (session, records) = self.stored_records(session_id)?;
        Ok(ProgressSnapshot::derive(
            session_id,
            session.last_operation,
            session.status,
            records.iter().map(|r| r.state),
        ))
    }

    /// Per-employee task records in sheet order.
    pub async fn tasks(&self, session_id: Uuid) -> Result<Vec<TaskRecord>> {
        if let Some(run) = self.run(session_id).await {
            return Ok(run.ledger.read().await.records());
        }
        Ok(self.stored_records(session_id)?.1)
    }

    /// Transition history of the last run.
    pub async fn history(&self, session_id: Uuid) -> Result<Vec<ProgressEvent>> {
        if let Some(run) = self.run(session_id).await {
            return Ok(run.ledger.read().await.history().to_vec());
        }
        self.stored_records(session_id)?;
        Ok(Vec::new())
    }

    /// Live progress stream of the session: a snapshot, then events, then a
    /// terminal marker.
    pub async fn subscribe(&self, session_id: Uuid) -> Result<Subscription> {
        if let Some(run) = self.run(session_id).await {
            return Ok(run.broadcaster.subscribe());
        }
        let snapshot = self.progress(session_id).await?;
        Ok(ProgressBroadcaster::finished(snapshot, 1).subscribe())
    }

    /// Resolves once the current run of the session is over.
    pub async fn wait_for_completion(&self, session_id: Uuid) -> Result<SessionStatus> {
        let Some(run) = self.run(session_id).await else {
            let session = self
                .shared
                .store
                .session(session_id)?
                .ok_or(PipelineError::SessionNotFound(session_id))?;
            return Ok(session.status);
        };
        let mut rx = run.status.subscribe();
        let status = *rx
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| PipelineError::NotRunning(session_id))?;
        Ok(status)
    }

    /// Deletes a session and everything stored for it, releasing its run.
    /// Refused while a batch of the session is running.
    pub async fn delete_session(&self, session_id: Uuid) -> Result<()> {
        let mut runs = self.runs.write().await;
        if runs.get(&session_id).is_some_and(|run| run.is_running()) {
            return Err(PipelineError::Conflict(session_id));
        }
        runs.remove(&session_id);
        if !self.shared.store.delete_session(session_id)? {
            return Err(PipelineError::SessionNotFound(session_id));
        }
        info!("Session {}: deleted", session_id);
        Ok(())
    }

    fn stored_records(&self, session_id: Uuid) -> Result<(ImportSession, Vec<TaskRecord>)> {
        let store = &self.shared.store;
        let session = store
            .session(session_id)?
            .ok_or(PipelineError::SessionNotFound(session_id))?;
        let mut records = Vec::new();
        for employee in store.employees(session_id)? {
            let stored = store.task_state(employee.id)?;
            let slip_hash = store.slip(employee.id)?.map(|s| s.content_hash);
            records.push(TaskRecord {
                employee_id: employee.id,
                employee_name: employee.name,
                employee_code: employee.code,
                state: stored.as_ref().map_or(TaskState::Queued, |s| s.state),
                attempt: 1,
                render_attempts: 0,
                delivery_attempts: 0,
                cache_hit: false,
                slip_hash,
                error: stored.and_then(|s| s.error),
                updated_at: session.updated_at,
            });
        }
        Ok((session, records))
    }
}

/// Schedules the employees of a run in order, then settles the run.
async fn drive(
    shared: Arc<Shared>,
    runs: Runs,
    run: Arc<SessionRun>,
    employees: Vec<EmployeeRecord>,
) {
    let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
    let updater = tokio::spawn(start_ledger_updater(
        run.ledger.clone(),
        run.broadcaster.clone(),
        shared.store.clone(),
        rx,
    ));

    let ctx = Arc::new(RunContext {
        session_id: run.session_id,
        operation: run.operation,
        template: shared.template.clone(),
        renderer: shared.renderer.clone(),
        delivery: shared.delivery.clone(),
        store: shared.store.clone(),
        cancel: run.cancel.clone(),
        updates: tx,
        render_retry: shared.settings.render_retry.clone(),
        message_content: shared.settings.message_content.clone(),
        send_delay: shared.settings.send_delay,
    });

    let mut workers = JoinSet::new();
    let mut pending = employees.into_iter();
    for employee in pending.by_ref() {
        // Waiting for a slot is the only admission control: the rest of the
        // list stays queued until one frees up.
        let slot = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => None,
            slot = shared.pool.acquire() => slot.ok(),
        };
        let Some(slot) = slot else {
            ctx.cancel_task(employee.id).await;
            break;
        };
        workers.spawn(run_task(ctx.clone(), employee, slot));
    }
    for employee in pending {
        ctx.cancel_task(employee.id).await;
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!("Session {}: worker stopped abnormally: {}", run.session_id, e);
        }
    }
    drop(ctx);
    if let Err(e) = updater.await {
        error!("Session {}: ledger updater stopped abnormally: {}", run.session_id, e);
    }

    let mut ledger = run.ledger.write().await;
    if !ledger.all_terminal() {
        let events = ledger.fail_unfinished("worker stopped before reporting an outcome");
        commit_events(&ledger, events, &shared.store, &run.broadcaster);
    }
    let status = ledger.settle(run.cancel.is_cancelled());
    ledger.set_status(status);
    if let Err(e) = shared.store.set_session_status(run.session_id, status) {
        error!("Session {}: cannot persist status {}: {}", run.session_id, status, e);
    }
    let snapshot = ledger.snapshot();
    info!(
        "Session {}: {} finished {} ({} completed, {} failed, {} cancelled)",
        run.session_id,
        run.operation,
        status,
        snapshot.completed,
        snapshot.failed,
        snapshot.counts.cancelled
    );
    run.broadcaster.close(snapshot);
    drop(ledger);
    run.status.send_replace(status);

    evict_finished(&mut *runs.write().await, shared.settings.retained_runs);
}
