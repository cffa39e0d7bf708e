use crate::jobs::Operation;
use crate::model::employee::{ColumnMapping, EmployeeRecord, SendRecord};
use crate::model::session::ImportSession;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of `POST /api/batch/{session_id}/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartBatchRequest {
    pub operation: Operation,
}

/// `json` part of the import upload. The mapping fields sit at the top level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRequest {
    pub filename: Option<String>,
    #[serde(flatten)]
    pub mapping: ColumnMapping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResponse {
    pub session_id: Uuid,
    pub total_rows: usize,
}

/// Result of probing the webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookCheck {
    pub reachable: bool,
    pub message: String,
}

/// Body of `GET /api/import/sessions/{session_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetails {
    pub session: ImportSession,
    pub employees: Vec<EmployeeRecord>,
}

/// Body of `GET /api/import/employees/{employee_id}/history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmployeeHistory {
    pub employee: EmployeeRecord,
    /// Delivery attempts, oldest first.
    pub history: Vec<SendRecord>,
}
