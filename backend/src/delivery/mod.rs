//! Slip delivery to the messaging webhook.
//!
//! A delivery is a sequence of attempts. Each attempt yields an
//! [`AttemptOutcome`]; [`decide`] turns it into either a final
//! [`DeliveryResult`] or a delay before the next attempt. Callers that hold
//! pool slots drive the loop themselves so they can give the slot back while
//! waiting; [`deliver`] is the plain loop.

pub mod retry;
pub mod webhook;

use crate::delivery::retry::{Backoff, RetryPolicy};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use common::jobs::{ErrorKind, TaskError};
use common::model::employee::EmployeeRecord;
use common::model::slip::SlipImage;
use log::warn;
use serde::Serialize;
use std::time::Duration;

pub use webhook::WebhookClient;

/// JSON body posted to the webhook. The slip travels inline as a data URL.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeliveryPayload {
    pub phone: String,
    pub name: String,
    pub amount: Option<i64>,
    pub image: String,
    pub content: String,
}

impl DeliveryPayload {
    /// Builds the payload for an employee. Fails without any HTTP call when the
    /// employee has no contact to deliver to.
    pub fn build(
        employee: &EmployeeRecord,
        slip: &SlipImage,
        content: &str,
    ) -> Result<Self, TaskError> {
        let phone = employee
            .phone
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                TaskError::new(
                    ErrorKind::Configuration,
                    format!("employee '{}' has no contact number", employee.name),
                )
            })?;
        Ok(Self {
            phone: phone.to_string(),
            name: employee.name.clone(),
            amount: employee.salary,
            image: inline_image(&slip.content),
            content: content.to_string(),
        })
    }
}

/// `data:image/png;base64,...`
pub fn inline_image(bytes: &[u8]) -> String {
    format!("data:{};base64,{}", SlipImage::CONTENT_TYPE, BASE64.encode(bytes))
}

/// What a single webhook call told us.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// 2xx and the body reports success (or says nothing).
    Confirmed { message: Option<String> },
    /// 4xx, a 2xx body whose status is not `success`, or a request that could
    /// not be built. Retrying would not help.
    Rejected { status: Option<u16>, message: String },
    /// Connection failure or 5xx. Safe to retry: nothing was accepted.
    Transient { message: String },
    /// The request went out but no answer came back in time.
    Ambiguous { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryResult {
    Delivered { message: Option<String> },
    Failed { error: TaskError },
    /// The remote state is unknown. Surfaced to the caller, never resent automatically.
    TimedOutUnknown { message: String },
}

pub enum Step {
    Finish(DeliveryResult),
    RetryAfter(Duration),
}

/// Maps an attempt outcome to the next step of the retry loop.
pub fn decide(outcome: AttemptOutcome, backoff: &mut Backoff) -> Step {
    match outcome {
        AttemptOutcome::Confirmed { message } => Step::Finish(DeliveryResult::Delivered { message }),
        AttemptOutcome::Rejected { status, message } => {
            let message = match status {
                Some(code) => format!("webhook rejected the slip (HTTP {}): {}", code, message),
                None => format!("webhook request failed: {}", message),
            };
            Step::Finish(DeliveryResult::Failed {
                error: TaskError::new(ErrorKind::PermanentExternal, message),
            })
        }
        AttemptOutcome::Ambiguous { message } => {
            Step::Finish(DeliveryResult::TimedOutUnknown { message })
        }
        AttemptOutcome::Transient { message } => match backoff.next_delay() {
            Some(delay) => Step::RetryAfter(delay),
            None => Step::Finish(DeliveryResult::Failed {
                error: TaskError::new(
                    ErrorKind::TransientExternal,
                    format!("giving up after {} attempts: {}", backoff.attempt() - 1, message),
                ),
            }),
        },
    }
}

#[async_trait]
pub trait SlipDelivery: Send + Sync {
    /// One webhook call. Implementations must not retry internally.
    async fn attempt(&self, payload: &DeliveryPayload) -> AttemptOutcome;

    fn retry_policy(&self) -> &RetryPolicy;
}

/// Delivers with retries, sleeping between attempts.
pub async fn deliver(client: &dyn SlipDelivery, payload: &DeliveryPayload) -> DeliveryResult {
    let mut backoff = client.retry_policy().start();
    loop {
        let outcome = client.attempt(payload).await;
        match decide(outcome, &mut backoff) {
            Step::Finish(result) => return result,
            Step::RetryAfter(delay) => {
                warn!(
                    "Delivery to {} failed transiently, retrying in {:?}",
                    payload.phone,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        outcomes: Mutex<VecDeque<AttemptOutcome>>,
        calls: Mutex<u32>,
        policy: RetryPolicy,
    }

    impl Scripted {
        fn new(outcomes: Vec<AttemptOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(0),
                policy: RetryPolicy {
                    max_attempts: 3,
                    base_delay_ms: 1,
                    factor: 2.0,
                    max_delay_ms: 5,
                    jitter: 0.0,
                },
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl SlipDelivery for Scripted {
        async fn attempt(&self, _payload: &DeliveryPayload) -> AttemptOutcome {
            *self.calls.lock().unwrap() += 1;
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(AttemptOutcome::Confirmed { message: None })
        }

        fn retry_policy(&self) -> &RetryPolicy {
            &self.policy
        }
    }

    fn payload() -> DeliveryPayload {
        DeliveryPayload {
            phone: "0901234567".into(),
            name: "Nguyen Van A".into(),
            amount: Some(12_000_000),
            image: inline_image(b"png"),
            content: String::new(),
        }
    }

    fn transient() -> AttemptOutcome {
        AttemptOutcome::Transient {
            message: "HTTP 503".into(),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let client = Scripted::new(vec![transient(), transient()]);
        let result = deliver(&client, &payload()).await;
        assert_eq!(result, DeliveryResult::Delivered { message: None });
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn retries_stop_at_ceiling() {
        let client = Scripted::new(vec![transient(), transient(), transient(), transient()]);
        let result = deliver(&client, &payload()).await;
        match result {
            DeliveryResult::Failed { error } => {
                assert_eq!(error.kind, ErrorKind::TransientExternal);
                assert!(error.message.contains("3 attempts"), "{}", error.message);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let client = Scripted::new(vec![AttemptOutcome::Rejected {
            status: Some(400),
            message: "bad phone".into(),
        }]);
        let result = deliver(&client, &payload()).await;
        assert!(matches!(result, DeliveryResult::Failed { ref error } if error.kind == ErrorKind::PermanentExternal));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn ambiguous_timeout_is_not_retried() {
        let client = Scripted::new(vec![AttemptOutcome::Ambiguous {
            message: "timed out".into(),
        }]);
        let result = deliver(&client, &payload()).await;
        assert!(matches!(result, DeliveryResult::TimedOutUnknown { .. }));
        assert_eq!(client.calls(), 1);
    }

    #[test]
    fn payload_requires_contact() {
        let employee = EmployeeRecord {
            id: uuid::Uuid::new_v4(),
            session_id: uuid::Uuid::new_v4(),
            row_number: 2,
            code: Some("NV01".into()),
            name: "Tran Thi B".into(),
            phone: Some("  ".into()),
            salary: Some(1),
            fields: Default::default(),
            last_sent_at: None,
            delivery_status: None,
        };
        let slip = SlipImage {
            employee_id: employee.id,
            session_id: employee.session_id,
            content: vec![1, 2, 3],
            content_hash: String::new(),
            input_digest: String::new(),
            rendered_at: chrono::Utc::now(),
        };
        let err = DeliveryPayload::build(&employee, &slip, "").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
    }

    #[test]
    fn inline_image_is_a_png_data_url() {
        assert_eq!(inline_image(b"abc"), "data:image/png;base64,YWJj");
    }
}
