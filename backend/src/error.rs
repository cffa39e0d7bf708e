//! Error types for the payroll notifier.
//!
//! Task-level failures never surface here: they are recorded on the task
//! (`common::jobs::TaskError`) and reported through the progress stream.
//! `PipelineError` covers the control surface: starting, cancelling and
//! querying batches, importing and deleting sessions, persistence.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Bad configuration or input. Not retryable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A batch is already running for the session.
    #[error("A batch is already running for session {0}")]
    Conflict(Uuid),

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Employee not found: {0}")]
    EmployeeNotFound(Uuid),

    #[error("No batch is running for session {0}")]
    NotRunning(Uuid),

    #[error("No failed tasks to retry for session {0}")]
    NothingToRetry(Uuid),

    #[error("Import error: {0}")]
    Import(#[from] crate::import::ImportError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl ResponseError for PipelineError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Conflict(_) | Self::NotRunning(_) | Self::NothingToRetry(_) => {
                StatusCode::CONFLICT
            }
            Self::SessionNotFound(_) | Self::EmployeeNotFound(_) => StatusCode::NOT_FOUND,
            Self::Configuration(_) | Self::Import(_) => StatusCode::BAD_REQUEST,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "error": self.to_string() }))
    }
}
