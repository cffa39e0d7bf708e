//! Control surface of batch runs.
//!
//! - `POST /api/batch/{session_id}/start`: starts `generate`, `send` or
//!   `generate_and_send` over the session. `409` if a run is in progress.
//! - `POST /api/batch/{session_id}/cancel`: cancels the running batch.
//! - `POST /api/batch/{session_id}/retry`: re-queues failed tasks of the last run.
//! - `GET /api/batch/{session_id}/progress`: aggregate snapshot.
//! - `GET /api/batch/{session_id}/tasks`: per-employee task records.
//! - `GET /api/batch/{session_id}/events`: server-sent progress stream. The
//!   first message is a snapshot, then one message per transition, with
//!   heartbeats while idle, and a `closed` message when the run is over.

use actix_web::web::{get, post, scope};
use actix_web::Scope;

mod cancel;
mod progress;
mod retry;
mod start;
mod stream;
mod tasks;

const API_PATH: &str = "/api/batch";

pub fn configure_routes() -> Scope {
    scope(API_PATH)
        .route("/{session_id}/start", post().to(start::process))
        .route(
            "/{session_id}/employees/{employee_id}/start",
            post().to(start::process_employee),
        )
        .route("/{session_id}/cancel", post().to(cancel::process))
        .route("/{session_id}/retry", post().to(retry::process))
        .route("/{session_id}/progress", get().to(progress::process))
        .route("/{session_id}/tasks", get().to(tasks::process))
        .route("/{session_id}/events", get().to(stream::process))
}
