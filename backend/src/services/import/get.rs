use crate::error::{PipelineError, Result};
use crate::store::Store;
use actix_web::{web, HttpResponse};
use common::requests::SessionDetails;
use uuid::Uuid;

pub async fn process(store: web::Data<Store>, path: web::Path<Uuid>) -> Result<HttpResponse> {
    let session_id = path.into_inner();
    let session = store
        .session(session_id)?
        .ok_or(PipelineError::SessionNotFound(session_id))?;
    let employees = store.employees(session_id)?;
    Ok(HttpResponse::Ok().json(SessionDetails { session, employees }))
}
