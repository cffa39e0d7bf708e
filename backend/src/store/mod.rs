//! SQLite persistence for everything that outlives a batch run.
//!
//! The pipeline keeps its live state in memory; this store only records what a
//! later run or a later request needs: sessions and their employees, the last
//! task state of every employee, rendered slips (the render cache) and the
//! history of delivery attempts.
//!
//! Opening a store settles sessions a previous process left `running`: tasks
//! that were mid-delivery become `delivery_unknown`, other unfinished tasks
//! become `cancelled`.

use chrono::{DateTime, Utc};
use common::jobs::{ErrorKind, Operation, TaskError, TaskState};
use common::model::employee::{EmployeeRecord, SendRecord};
use common::model::session::{ImportSession, SessionStatus};
use common::model::slip::SlipImage;
use log::warn;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS import_sessions (
    id          TEXT PRIMARY KEY,
    filename    TEXT NOT NULL,
    sheet_name  TEXT NOT NULL,
    status      TEXT NOT NULL,
    last_operation TEXT,
    total_rows  INTEGER NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS employees (
    id              TEXT PRIMARY KEY,
    session_id      TEXT NOT NULL REFERENCES import_sessions(id),
    position        INTEGER NOT NULL,
    row_number      INTEGER NOT NULL,
    employee_code   TEXT,
    name            TEXT NOT NULL,
    phone           TEXT,
    salary          INTEGER,
    fields_json     TEXT NOT NULL,
    task_state      TEXT,
    task_error      TEXT,
    last_sent_at    TEXT,
    delivery_status TEXT
);
CREATE INDEX IF NOT EXISTS idx_employees_session ON employees(session_id, position);
CREATE TABLE IF NOT EXISTS slip_images (
    employee_id  TEXT PRIMARY KEY,
    session_id   TEXT NOT NULL,
    content      BLOB NOT NULL,
    content_hash TEXT NOT NULL,
    input_digest TEXT NOT NULL,
    rendered_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS send_history (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    employee_id      TEXT NOT NULL,
    sent_at          TEXT NOT NULL,
    status           TEXT NOT NULL,
    error_message    TEXT,
    response_message TEXT
);
"#;

const EMPLOYEE_COLUMNS: &str = "id, session_id, row_number, employee_code, name, phone, salary, fields_json, last_sent_at, delivery_status";

/// Last persisted task state of an employee.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTaskState {
    pub state: TaskState,
    pub error: Option<TaskError>,
}

/// Cloneable handle on the database. Statements are short, so one connection
/// behind a mutex is enough.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        // Databases created before runs recorded their operation.
        let has_last_operation = conn
            .prepare("SELECT 1 FROM pragma_table_info('import_sessions') WHERE name = 'last_operation'")?
            .exists([])?;
        if !has_last_operation {
            conn.execute("ALTER TABLE import_sessions ADD COLUMN last_operation TEXT", [])?;
        }
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.recover_interrupted()?;
        Ok(store)
    }

    /// Settles sessions whose run never finished, because the process
    /// stopped while it was going. Returns how many were settled.
    fn recover_interrupted(&self) -> rusqlite::Result<usize> {
        let interrupted: Vec<(Uuid, Option<String>)> = {
            let conn = self.conn();
            let mut stmt =
                conn.prepare("SELECT id, last_operation FROM import_sessions WHERE status = ?1")?;
            let rows = stmt.query_map([SessionStatus::Running.as_str()], |row| {
                Ok((uuid_at(row, 0)?, row.get(1)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        for (session_id, operation) in &interrupted {
            let operation = operation.as_deref().and_then(Operation::parse);
            let mut states = Vec::new();
            for employee in self.employees(*session_id)? {
                let state = self.task_state(employee.id)?.map(|s| s.state);
                let settled = match state {
                    Some(state) if is_finished(state, operation) => state,
                    Some(TaskState::Delivering) => {
                        let error = TaskError::new(
                            ErrorKind::UnknownOutcome,
                            "service stopped while the slip was being delivered",
                        );
                        self.record_task_state(employee.id, TaskState::DeliveryUnknown, Some(&error))?;
                        TaskState::DeliveryUnknown
                    }
                    _ => {
                        let error = TaskError::new(
                            ErrorKind::Cancelled,
                            "service stopped before the task finished",
                        );
                        self.record_task_state(employee.id, TaskState::Cancelled, Some(&error))?;
                        TaskState::Cancelled
                    }
                };
                states.push(settled);
            }
            let status = SessionStatus::settle(states, false);
            self.set_session_status(*session_id, status)?;
            warn!(
                "Session {}: run was interrupted by a restart, settled as {}",
                session_id, status
            );
        }
        Ok(interrupted.len())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied statement.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores a freshly imported session with its employees, in sheet order.
    pub fn create_session(
        &self,
        id: Uuid,
        filename: &str,
        sheet_name: &str,
        employees: &[EmployeeRecord],
    ) -> rusqlite::Result<ImportSession> {
        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO import_sessions (id, filename, sheet_name, status, total_rows, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                id.to_string(),
                filename,
                sheet_name,
                SessionStatus::Pending.as_str(),
                employees.len() as i64,
                now.to_rfc3339()
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO employees (id, session_id, position, row_number, employee_code, name, phone, salary, fields_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (position, emp) in employees.iter().enumerate() {
                let fields = serde_json::to_string(&emp.fields)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                stmt.execute(params![
                    emp.id.to_string(),
                    id.to_string(),
                    position as i64,
                    emp.row_number,
                    emp.code,
                    emp.name,
                    emp.phone,
                    emp.salary,
                    fields
                ])?;
            }
        }
        tx.commit()?;

        Ok(ImportSession {
            id,
            filename: filename.to_string(),
            sheet_name: sheet_name.to_string(),
            status: SessionStatus::Pending,
            last_operation: None,
            employee_ids: employees.iter().map(|e| e.id).collect(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn session(&self, id: Uuid) -> rusqlite::Result<Option<ImportSession>> {
        let conn = self.conn();
        let session = conn
            .query_row(
                "SELECT filename, sheet_name, status, created_at, updated_at, last_operation
                 FROM import_sessions WHERE id = ?1",
                [id.to_string()],
                |row| {
                    let status: String = row.get(2)?;
                    let operation: Option<String> = row.get(5)?;
                    let last_operation = match operation {
                        Some(op) => Some(
                            Operation::parse(&op)
                                .ok_or_else(|| bad_value(5, format!("unknown operation {}", op)))?,
                        ),
                        None => None,
                    };
                    Ok(ImportSession {
                        id,
                        filename: row.get(0)?,
                        sheet_name: row.get(1)?,
                        status: SessionStatus::parse(&status)
                            .ok_or_else(|| bad_value(2, format!("unknown status {}", status)))?,
                        last_operation,
                        employee_ids: Vec::new(),
                        created_at: timestamp(row, 3)?,
                        updated_at: timestamp(row, 4)?,
                    })
                },
            )
            .optional()?;

        let Some(mut session) = session else {
            return Ok(None);
        };
        let mut stmt =
            conn.prepare("SELECT id FROM employees WHERE session_id = ?1 ORDER BY position")?;
        session.employee_ids = stmt
            .query_map([id.to_string()], |row| uuid_at(row, 0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(Some(session))
    }

    pub fn set_session_status(&self, id: Uuid, status: SessionStatus) -> rusqlite::Result<()> {
        self.conn().execute(
            "UPDATE import_sessions SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), status.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Marks the start of a run: the session is `running` with `operation`
    /// and the tasks of `employee_ids` are back to `queued`.
    pub fn begin_run(
        &self,
        id: Uuid,
        operation: Operation,
        employee_ids: &[Uuid],
    ) -> rusqlite::Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE import_sessions SET status = ?2, last_operation = ?3, updated_at = ?4 WHERE id = ?1",
            params![
                id.to_string(),
                SessionStatus::Running.as_str(),
                operation.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "UPDATE employees SET task_state = ?2, task_error = NULL WHERE id = ?1",
            )?;
            for employee_id in employee_ids {
                stmt.execute(params![employee_id.to_string(), TaskState::Queued.as_str()])?;
            }
        }
        tx.commit()
    }

    /// Removes a session with its employees, slips and send history.
    /// Returns `false` if there was no such session.
    pub fn delete_session(&self, id: Uuid) -> rusqlite::Result<bool> {
        let id = id.to_string();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM send_history WHERE employee_id IN (SELECT id FROM employees WHERE session_id = ?1)",
            [&id],
        )?;
        tx.execute("DELETE FROM slip_images WHERE session_id = ?1", [&id])?;
        tx.execute("DELETE FROM employees WHERE session_id = ?1", [&id])?;
        let deleted = tx.execute("DELETE FROM import_sessions WHERE id = ?1", [&id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    /// Employees of a session in sheet order.
    pub fn employees(&self, session_id: Uuid) -> rusqlite::Result<Vec<EmployeeRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM employees WHERE session_id = ?1 ORDER BY position",
            EMPLOYEE_COLUMNS
        ))?;
        let rows = stmt.query_map([session_id.to_string()], employee_from_row)?;
        rows.collect()
    }

    pub fn employee(&self, id: Uuid) -> rusqlite::Result<Option<EmployeeRecord>> {
        self.conn()
            .query_row(
                &format!("SELECT {} FROM employees WHERE id = ?1", EMPLOYEE_COLUMNS),
                [id.to_string()],
                employee_from_row,
            )
            .optional()
    }

    pub fn record_task_state(
        &self,
        employee_id: Uuid,
        state: TaskState,
        error: Option<&TaskError>,
    ) -> rusqlite::Result<()> {
        let error = error
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.conn().execute(
            "UPDATE employees SET task_state = ?2, task_error = ?3 WHERE id = ?1",
            params![employee_id.to_string(), state.as_str(), error],
        )?;
        Ok(())
    }

    pub fn task_state(&self, employee_id: Uuid) -> rusqlite::Result<Option<StoredTaskState>> {
        let row: Option<(Option<String>, Option<String>)> = self
            .conn()
            .query_row(
                "SELECT task_state, task_error FROM employees WHERE id = ?1",
                [employee_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((Some(state), error)) = row else {
            return Ok(None);
        };
        let state = TaskState::parse(&state).ok_or_else(|| bad_value(0, format!("unknown state {}", state)))?;
        let error = error
            .map(|e| serde_json::from_str(&e))
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
        Ok(Some(StoredTaskState { state, error }))
    }

    /// Stores a slip, replacing the previous render of that employee.
    pub fn save_slip(&self, slip: &SlipImage) -> rusqlite::Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO slip_images (employee_id, session_id, content, content_hash, input_digest, rendered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                slip.employee_id.to_string(),
                slip.session_id.to_string(),
                slip.content,
                slip.content_hash,
                slip.input_digest,
                slip.rendered_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn slip(&self, employee_id: Uuid) -> rusqlite::Result<Option<SlipImage>> {
        self.conn()
            .query_row(
                "SELECT session_id, content, content_hash, input_digest, rendered_at
                 FROM slip_images WHERE employee_id = ?1",
                [employee_id.to_string()],
                |row| {
                    Ok(SlipImage {
                        employee_id,
                        session_id: uuid_at(row, 0)?,
                        content: row.get(1)?,
                        content_hash: row.get(2)?,
                        input_digest: row.get(3)?,
                        rendered_at: timestamp(row, 4)?,
                    })
                },
            )
            .optional()
    }

    /// Appends one delivery attempt outcome.
    pub fn record_send(
        &self,
        employee_id: Uuid,
        status: &str,
        error_message: Option<&str>,
        response_message: Option<&str>,
    ) -> rusqlite::Result<()> {
        self.conn().execute(
            "INSERT INTO send_history (employee_id, sent_at, status, error_message, response_message)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                employee_id.to_string(),
                Utc::now().to_rfc3339(),
                status,
                error_message,
                response_message
            ],
        )?;
        Ok(())
    }

    pub fn send_history(&self, employee_id: Uuid) -> rusqlite::Result<Vec<SendRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, sent_at, status, error_message, response_message
             FROM send_history WHERE employee_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([employee_id.to_string()], |row| {
            Ok(SendRecord {
                id: row.get(0)?,
                employee_id,
                sent_at: timestamp(row, 1)?,
                status: row.get(2)?,
                error_message: row.get(3)?,
                response_message: row.get(4)?,
            })
        })?;
        rows.collect()
    }

    /// Writes the delivery fields of the employee record.
    pub fn mark_sent(
        &self,
        employee_id: Uuid,
        at: Option<DateTime<Utc>>,
        delivery_status: &str,
    ) -> rusqlite::Result<()> {
        self.conn().execute(
            "UPDATE employees SET last_sent_at = COALESCE(?2, last_sent_at), delivery_status = ?3 WHERE id = ?1",
            params![employee_id.to_string(), at.map(|t| t.to_rfc3339()), delivery_status],
        )?;
        Ok(())
    }
}

/// Whether a stored task state ends the task. Without a known operation,
/// `rendered` counts as an end.
fn is_finished(state: TaskState, operation: Option<Operation>) -> bool {
    match operation {
        Some(op) => state.is_terminal_for(op),
        None => !matches!(
            state,
            TaskState::Queued | TaskState::Rendering | TaskState::Delivering
        ),
    }
}

fn employee_from_row(row: &Row<'_>) -> rusqlite::Result<EmployeeRecord> {
    let fields_json: String = row.get(7)?;
    let fields: BTreeMap<String, String> = serde_json::from_str(&fields_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
    Ok(EmployeeRecord {
        id: uuid_at(row, 0)?,
        session_id: uuid_at(row, 1)?,
        row_number: row.get(2)?,
        code: row.get(3)?,
        name: row.get(4)?,
        phone: row.get(5)?,
        salary: row.get(6)?,
        fields,
        last_sent_at: optional_timestamp(row, 8)?,
        delivery_status: row.get(9)?,
    })
}

fn bad_value(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(_) => timestamp(row, idx).map(Some),
    }
}
