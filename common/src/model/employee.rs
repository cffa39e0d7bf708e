use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One employee row imported from the payroll spreadsheet.
///
/// Records are created by the import service and are read-only afterwards,
/// except for the delivery fields (`last_sent_at`, `delivery_status`) that the
/// batch pipeline writes back once a slip has been sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmployeeRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    /// 1-based row number in the source sheet, kept for error messages.
    pub row_number: u32,
    pub code: Option<String>,
    pub name: String,
    /// Messaging contact (phone number) the slip is delivered to.
    pub phone: Option<String>,
    pub salary: Option<i64>,
    /// Raw cell values keyed by normalised header title. Templates may
    /// reference any of them by name.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub last_sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delivery_status: Option<String>,
}

/// Column layout of the sheet an import reads from.
///
/// Rows are 1-based like the spreadsheet UI; columns are letters (`A`, `AB`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ColumnMapping {
    pub sheet_name: String,
    pub header_row: u32,
    pub data_start_row: u32,
    pub code_column: String,
    pub name_column: String,
    pub phone_column: String,
    pub salary_column: String,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            sheet_name: "Danh sách NV".to_string(),
            header_row: 1,
            data_start_row: 2,
            code_column: "A".to_string(),
            name_column: "B".to_string(),
            phone_column: "C".to_string(),
            salary_column: "D".to_string(),
        }
    }
}

/// One delivery attempt of an employee's slip, as kept in the send history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendRecord {
    pub id: i64,
    pub employee_id: Uuid,
    pub sent_at: DateTime<Utc>,
    /// `success`, `failed`, `retry` or `unknown`.
    pub status: String,
    pub error_message: Option<String>,
    pub response_message: Option<String>,
}
