use crate::error::{PipelineError, Result};
use crate::store::Store;
use actix_web::{web, HttpResponse};
use common::requests::EmployeeHistory;
use uuid::Uuid;

/// Every delivery attempt recorded for the employee, oldest first.
pub async fn process(store: web::Data<Store>, path: web::Path<Uuid>) -> Result<HttpResponse> {
    let employee_id = path.into_inner();
    let employee = store
        .employee(employee_id)?
        .ok_or(PipelineError::EmployeeNotFound(employee_id))?;
    let history = store.send_history(employee_id)?;
    Ok(HttpResponse::Ok().json(EmployeeHistory { employee, history }))
}
