use crate::config::DeliveryConfig;
use crate::delivery::retry::RetryPolicy;
use crate::delivery::{AttemptOutcome, DeliveryPayload, DeliveryResult, SlipDelivery};
use async_trait::async_trait;
use common::requests::WebhookCheck;
use log::debug;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Body the webhook answers with. Both fields are optional.
#[derive(Debug, Deserialize)]
struct WebhookReply {
    status: Option<String>,
    message: Option<String>,
}

/// HTTP client for the slip webhook.
pub struct WebhookClient {
    http: reqwest::Client,
    endpoint: String,
    policy: RetryPolicy,
}

impl WebhookClient {
    pub fn new(endpoint: impl Into<String>, config: &DeliveryConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            policy: config.retry.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Delivers one slip, retrying transient failures per the configured policy.
    pub async fn deliver(&self, payload: &DeliveryPayload) -> DeliveryResult {
        super::deliver(self, payload).await
    }

    /// Checks that the endpoint answers at all. Sends no slip data.
    pub async fn check_connection(&self) -> WebhookCheck {
        match self
            .http
            .get(&self.endpoint)
            .timeout(CHECK_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => WebhookCheck {
                reachable: true,
                message: format!("Webhook reachable (HTTP {})", response.status().as_u16()),
            },
            Err(e) => WebhookCheck {
                reachable: false,
                message: format!("Cannot reach webhook: {}", e),
            },
        }
    }
}

#[async_trait]
impl SlipDelivery for WebhookClient {
    async fn attempt(&self, payload: &DeliveryPayload) -> AttemptOutcome {
        debug!("POST {} for {}", self.endpoint, payload.phone);
        let response = match self.http.post(&self.endpoint).json(payload).send().await {
            Ok(response) => response,
            Err(e) => return classify_request_error(e),
        };
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_response(status, &body)
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

/// Errors before a response arrived. Only a failed connect proves the webhook
/// never saw the request; anything later is ambiguous.
fn classify_request_error(e: reqwest::Error) -> AttemptOutcome {
    if e.is_builder() {
        AttemptOutcome::Rejected {
            status: None,
            message: e.to_string(),
        }
    } else if e.is_connect() {
        AttemptOutcome::Transient {
            message: format!("connection failed: {}", e),
        }
    } else if e.is_timeout() {
        AttemptOutcome::Ambiguous {
            message: format!("no response before timeout: {}", e),
        }
    } else {
        AttemptOutcome::Ambiguous {
            message: format!("request interrupted: {}", e),
        }
    }
}

fn classify_response(status: StatusCode, body: &str) -> AttemptOutcome {
    let reply: Option<WebhookReply> = serde_json::from_str(body).ok();

    if status.is_success() {
        return match reply {
            Some(WebhookReply {
                status: Some(remote),
                message,
            }) if !remote.eq_ignore_ascii_case("success") => AttemptOutcome::Rejected {
                status: Some(status.as_u16()),
                message: message.unwrap_or(remote),
            },
            Some(reply) => AttemptOutcome::Confirmed {
                message: reply.message,
            },
            // A 2xx without a JSON body still means the webhook took the slip.
            None => AttemptOutcome::Confirmed { message: None },
        };
    }

    let message = reply
        .and_then(|r| r.message)
        .or_else(|| Some(body.trim().to_string()).filter(|b| !b.is_empty()))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("no body").to_string());

    if status.is_client_error() {
        AttemptOutcome::Rejected {
            status: Some(status.as_u16()),
            message,
        }
    } else {
        AttemptOutcome::Transient {
            message: format!("HTTP {}: {}", status.as_u16(), message),
        }
    }
}
