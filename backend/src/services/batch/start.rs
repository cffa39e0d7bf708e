use crate::error::Result;
use crate::job_controller::BatchCoordinator;
use actix_web::{web, HttpResponse};
use common::requests::StartBatchRequest;
use uuid::Uuid;

/// Returns `202 Accepted` with the initial snapshot; the run continues in the background.
pub async fn process(
    coordinator: web::Data<BatchCoordinator>,
    path: web::Path<Uuid>,
    req: web::Json<StartBatchRequest>,
) -> Result<HttpResponse> {
    let snapshot = coordinator
        .start_batch(path.into_inner(), req.into_inner().operation)
        .await?;
    Ok(HttpResponse::Accepted().json(snapshot))
}

pub async fn process_employee(
    coordinator: web::Data<BatchCoordinator>,
    path: web::Path<(Uuid, Uuid)>,
    req: web::Json<StartBatchRequest>,
) -> Result<HttpResponse> {
    let (session_id, employee_id) = path.into_inner();
    let snapshot = coordinator
        .start_employee(session_id, employee_id, req.into_inner().operation)
        .await?;
    Ok(HttpResponse::Accepted().json(snapshot))
}
