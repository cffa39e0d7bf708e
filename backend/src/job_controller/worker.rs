//! What happens to one employee during a batch run.
//!
//! The worker owns its task: it is the only one that reports transitions for
//! that employee, and it reports them in order through the run's update
//! channel. It holds a pool slot while rendering or delivering and gives the
//! slot back while waiting out a retry backoff.
//!
//! Cancellation is checked before each step and raced against renders and
//! backoff waits. A webhook call that is already in flight is not
//! interrupted: once the request is out, its outcome is recorded.

use crate::delivery::retry::RetryPolicy;
use crate::delivery::{decide, AttemptOutcome, DeliveryPayload, DeliveryResult, SlipDelivery, Step};
use crate::job_controller::pool::SlotToken;
use crate::job_controller::state::LedgerUpdate;
use crate::render::image::content_hash;
use crate::render::{input_digest, slip_data, SlipRenderer, SlipTemplate};
use crate::store::Store;
use chrono::Utc;
use common::jobs::{ErrorKind, Operation, TaskError, TaskState};
use common::model::employee::EmployeeRecord;
use common::model::slip::SlipImage;
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything the workers of one run share.
pub(crate) struct RunContext {
    pub(crate) session_id: Uuid,
    pub(crate) operation: Operation,
    pub(crate) template: Arc<SlipTemplate>,
    pub(crate) renderer: Arc<dyn SlipRenderer>,
    pub(crate) delivery: Option<Arc<dyn SlipDelivery>>,
    pub(crate) store: Store,
    pub(crate) cancel: CancellationToken,
    pub(crate) updates: mpsc::Sender<LedgerUpdate>,
    pub(crate) render_retry: RetryPolicy,
    pub(crate) message_content: String,
    pub(crate) send_delay: Duration,
}

fn label(employee: &EmployeeRecord) -> &str {
    employee.code.as_deref().unwrap_or(&employee.name)
}

fn cancelled_error() -> Option<TaskError> {
    Some(TaskError::new(ErrorKind::Cancelled, "batch cancelled"))
}

impl RunContext {
    pub(crate) async fn emit(&self, update: LedgerUpdate) {
        if self.updates.send(update).await.is_err() {
            error!(
                "Session {}: ledger updater stopped, transition lost",
                self.session_id
            );
        }
    }

    pub(crate) async fn cancel_task(&self, employee_id: Uuid) {
        self.emit(LedgerUpdate::new(employee_id, TaskState::Cancelled).with_error(cancelled_error()))
            .await;
    }

    /// Waits out a backoff without holding the slot. Returns `false` if the
    /// run was cancelled meanwhile.
    async fn pause(&self, slot: &mut SlotToken, delay: Duration) -> bool {
        slot.release();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            reclaimed = slot.reclaim() => reclaimed.is_ok(),
        }
    }
}

/// Runs one employee's task to a terminal state.
pub(crate) async fn run_task(ctx: Arc<RunContext>, employee: EmployeeRecord, mut slot: SlotToken) {
    if ctx.cancel.is_cancelled() {
        ctx.cancel_task(employee.id).await;
        return;
    }

    let slip = if ctx.operation.renders() {
        match render_slip(&ctx, &employee, &mut slot).await {
            Some(slip) => slip,
            None => return,
        }
    } else {
        match load_slip(&ctx, &employee).await {
            Some(slip) => slip,
            None => return,
        }
    };

    if !ctx.operation.delivers() {
        return;
    }
    if ctx.cancel.is_cancelled() {
        ctx.cancel_task(employee.id).await;
        return;
    }
    deliver_slip(&ctx, &employee, &slip, &mut slot).await;
}

/// Renders the slip, or reuses the stored one when its input digest matches.
/// Returns `None` once the task reached a terminal state.
async fn render_slip(
    ctx: &RunContext,
    employee: &EmployeeRecord,
    slot: &mut SlotToken,
) -> Option<SlipImage> {
    let data = slip_data(employee);
    let digest = input_digest(&ctx.template, &data);

    match ctx.store.slip(employee.id) {
        Ok(Some(slip)) if slip.input_digest == digest => {
            debug!(
                "Session {}: {} unchanged, reusing slip {}",
                ctx.session_id,
                label(employee),
                slip.content_hash
            );
            ctx.emit(
                LedgerUpdate::new(employee.id, TaskState::Rendered)
                    .with_slip(slip.content_hash.clone(), true),
            )
            .await;
            return Some(slip);
        }
        Ok(_) => {}
        Err(e) => warn!(
            "Session {}: cannot read cached slip of {}: {}",
            ctx.session_id,
            label(employee),
            e
        ),
    }

    let mut backoff = ctx.render_retry.start();
    let mut last_error: Option<TaskError> = None;
    loop {
        ctx.emit(LedgerUpdate::new(employee.id, TaskState::Rendering).with_error(last_error.take()))
            .await;

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                ctx.cancel_task(employee.id).await;
                return None;
            }
            result = ctx.renderer.render(&ctx.template, &data) => result,
        };

        match result {
            Ok(bytes) => {
                let hash = content_hash(&bytes);
                let slip = SlipImage {
                    employee_id: employee.id,
                    session_id: ctx.session_id,
                    content: bytes,
                    content_hash: hash.clone(),
                    input_digest: digest,
                    rendered_at: Utc::now(),
                };
                if let Err(e) = ctx.store.save_slip(&slip) {
                    error!(
                        "Session {}: cannot store slip of {}: {}",
                        ctx.session_id,
                        label(employee),
                        e
                    );
                    let error = TaskError::new(
                        ErrorKind::PermanentExternal,
                        format!("cannot store slip: {}", e),
                    );
                    ctx.emit(LedgerUpdate::new(employee.id, TaskState::RenderFailed).with_error(Some(error)))
                        .await;
                    return None;
                }
                ctx.emit(LedgerUpdate::new(employee.id, TaskState::Rendered).with_slip(hash, false))
                    .await;
                return Some(slip);
            }
            Err(e) if e.is_retryable() => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        "Session {}: render of {} failed ({}), retrying in {:?}",
                        ctx.session_id,
                        label(employee),
                        e,
                        delay
                    );
                    last_error = Some(e.into());
                    if !ctx.pause(slot, delay).await {
                        ctx.emit(
                            LedgerUpdate::new(employee.id, TaskState::Cancelled)
                                .with_error(cancelled_error()),
                        )
                        .await;
                        return None;
                    }
                }
                None => {
                    let error = TaskError::new(
                        ErrorKind::TransientExternal,
                        format!("giving up after {} attempts: {}", backoff.attempt() - 1, e),
                    );
                    ctx.emit(LedgerUpdate::new(employee.id, TaskState::RenderFailed).with_error(Some(error)))
                        .await;
                    return None;
                }
            },
            Err(e) => {
                warn!(
                    "Session {}: render of {} failed: {}",
                    ctx.session_id,
                    label(employee),
                    e
                );
                ctx.emit(LedgerUpdate::new(employee.id, TaskState::RenderFailed).with_error(Some(e.into())))
                    .await;
                return None;
            }
        }
    }
}

/// Send-only runs deliver the slip rendered by an earlier run.
async fn load_slip(ctx: &RunContext, employee: &EmployeeRecord) -> Option<SlipImage> {
    let error = match ctx.store.slip(employee.id) {
        Ok(Some(slip)) => return Some(slip),
        Ok(None) => TaskError::new(
            ErrorKind::Configuration,
            "no rendered slip for this employee, run generate first",
        ),
        Err(e) => {
            error!(
                "Session {}: cannot load slip of {}: {}",
                ctx.session_id,
                label(employee),
                e
            );
            TaskError::new(ErrorKind::TransientExternal, format!("cannot load slip: {}", e))
        }
    };
    ctx.emit(LedgerUpdate::new(employee.id, TaskState::DeliveryFailed).with_error(Some(error)))
        .await;
    None
}

fn record_attempt(ctx: &RunContext, employee: &EmployeeRecord, outcome: &AttemptOutcome) {
    let (status, error, response) = match outcome {
        AttemptOutcome::Confirmed { message } => ("success", None, message.as_deref()),
        AttemptOutcome::Rejected { message, .. } => ("failed", Some(message.as_str()), None),
        AttemptOutcome::Transient { message } => ("retry", Some(message.as_str()), None),
        AttemptOutcome::Ambiguous { message } => ("unknown", Some(message.as_str()), None),
    };
    if let Err(e) = ctx.store.record_send(employee.id, status, error, response) {
        error!(
            "Session {}: cannot record send attempt of {}: {}",
            ctx.session_id,
            label(employee),
            e
        );
    }
}

async fn deliver_slip(
    ctx: &RunContext,
    employee: &EmployeeRecord,
    slip: &SlipImage,
    slot: &mut SlotToken,
) {
    let Some(client) = ctx.delivery.as_ref() else {
        let error = TaskError::new(ErrorKind::Configuration, "webhook URL is not configured");
        ctx.emit(LedgerUpdate::new(employee.id, TaskState::DeliveryFailed).with_error(Some(error)))
            .await;
        return;
    };

    let payload = match DeliveryPayload::build(employee, slip, &ctx.message_content) {
        Ok(payload) => payload,
        Err(error) => {
            if let Err(e) = ctx
                .store
                .record_send(employee.id, "failed", Some(&error.message), None)
                .and_then(|_| ctx.store.mark_sent(employee.id, None, "failed"))
            {
                error!("Session {}: cannot record send of {}: {}", ctx.session_id, label(employee), e);
            }
            ctx.emit(LedgerUpdate::new(employee.id, TaskState::DeliveryFailed).with_error(Some(error)))
                .await;
            return;
        }
    };

    let mut backoff = client.retry_policy().start();
    let mut last_error: Option<TaskError> = None;
    let result = loop {
        ctx.emit(LedgerUpdate::new(employee.id, TaskState::Delivering).with_error(last_error.take()))
            .await;
        debug!(
            "Session {}: delivering slip of {} (attempt {})",
            ctx.session_id,
            label(employee),
            backoff.attempt()
        );

        let outcome = client.attempt(&payload).await;
        record_attempt(ctx, employee, &outcome);
        let transient = match &outcome {
            AttemptOutcome::Transient { message } => {
                Some(TaskError::new(ErrorKind::TransientExternal, message.clone()))
            }
            _ => None,
        };

        match decide(outcome, &mut backoff) {
            Step::Finish(result) => break result,
            Step::RetryAfter(delay) => {
                warn!(
                    "Session {}: delivery to {} failed transiently, retrying in {:?}",
                    ctx.session_id,
                    label(employee),
                    delay
                );
                last_error = transient;
                if !ctx.pause(slot, delay).await {
                    ctx.cancel_task(employee.id).await;
                    return;
                }
            }
        }
    };

    let (state, delivery_status, sent_at, error) = match result {
        DeliveryResult::Delivered { .. } => (TaskState::Delivered, "success", Some(Utc::now()), None),
        DeliveryResult::Failed { error } => (TaskState::DeliveryFailed, "failed", None, Some(error)),
        DeliveryResult::TimedOutUnknown { message } => (
            TaskState::DeliveryUnknown,
            "unknown",
            None,
            Some(TaskError::new(ErrorKind::UnknownOutcome, message)),
        ),
    };
    if let Some(error) = &error {
        warn!(
            "Session {}: delivery to {} ended {}: {}",
            ctx.session_id,
            label(employee),
            state,
            error.message
        );
    }
    if let Err(e) = ctx.store.mark_sent(employee.id, sent_at, delivery_status) {
        error!("Session {}: cannot update {}: {}", ctx.session_id, label(employee), e);
    }
    ctx.emit(LedgerUpdate::new(employee.id, state).with_error(error)).await;

    if !ctx.send_delay.is_zero() {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {}
            _ = tokio::time::sleep(ctx.send_delay) => {}
        }
    }
}
