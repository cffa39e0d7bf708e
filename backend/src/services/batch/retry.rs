use crate::error::Result;
use crate::job_controller::BatchCoordinator;
use actix_web::{web, HttpResponse};
use uuid::Uuid;

pub async fn process(
    coordinator: web::Data<BatchCoordinator>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let snapshot = coordinator.retry_failed(path.into_inner()).await?;
    Ok(HttpResponse::Accepted().json(snapshot))
}
