//! Server-sent events for a session's progress.

use crate::config::BroadcastConfig;
use crate::error::Result;
use crate::job_controller::broadcaster::heartbeat;
use crate::job_controller::{BatchCoordinator, Subscription};
use actix_web::web::Bytes;
use actix_web::{web, HttpResponse};
use common::jobs::StreamMessage;
use futures_util::stream::{self, Stream};
use tokio::time::{interval_at, Instant, Interval};
use uuid::Uuid;

pub async fn process(
    coordinator: web::Data<BatchCoordinator>,
    broadcast: web::Data<BroadcastConfig>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let subscription = coordinator.subscribe(path.into_inner()).await?;
    let period = broadcast.heartbeat();
    let ticker = interval_at(Instant::now() + period, period);

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(event_stream(subscription, ticker)))
}

/// Frames subscription messages as SSE, interleaving heartbeats while idle.
/// Ends after the `closed` message or when the subscriber is disconnected.
pub fn event_stream(
    subscription: Subscription,
    ticker: Interval,
) -> impl Stream<Item = std::result::Result<Bytes, actix_web::Error>> {
    stream::unfold(
        (subscription, ticker, false),
        |(mut subscription, mut ticker, done)| async move {
            if done {
                return None;
            }
            let message = tokio::select! {
                message = subscription.recv() => match message {
                    Some(message) => message,
                    None => return None,
                },
                _ = ticker.tick() => heartbeat(),
            };
            let done = matches!(message, StreamMessage::Closed { .. });
            Some((
                Ok::<_, actix_web::Error>(encode(&message)),
                (subscription, ticker, done),
            ))
        },
    )
}

fn encode(message: &StreamMessage) -> Bytes {
    let data = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("event: {}\ndata: {}\n\n", message.kind(), data))
}
