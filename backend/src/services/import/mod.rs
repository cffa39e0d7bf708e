//! Import of payroll sheets.
//!
//! - `POST /api/import/upload`: multipart upload with a `json` part (column
//!   mapping, optional filename) and a `file` part holding the CSV export of
//!   the sheet. Creates a pending session with its employees in sheet order
//!   and returns its id.
//! - `GET /api/import/sessions/{session_id}`: the session and its employees,
//!   including the delivery fields the pipeline wrote back.
//! - `DELETE /api/import/sessions/{session_id}`: removes the session with its
//!   employees, slips and send history. `409` while a batch is running.
//! - `GET /api/import/employees/{employee_id}/history`: the employee and every
//!   delivery attempt recorded for them.

use actix_web::web::{delete, get, post, scope};
use actix_web::Scope;

mod delete;
mod get;
mod history;
mod upload;

const API_PATH: &str = "/api/import";

pub fn configure_routes() -> Scope {
    scope(API_PATH)
        .route("/upload", post().to(upload::process))
        .route("/sessions/{session_id}", get().to(get::process))
        .route("/sessions/{session_id}", delete().to(delete::process))
        .route("/employees/{employee_id}/history", get().to(history::process))
}
