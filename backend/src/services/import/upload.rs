use crate::error::{PipelineError, Result};
use crate::import::read_employees;
use crate::store::Store;
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use common::requests::{ImportRequest, ImportResponse};
use futures_util::StreamExt;
use log::info;
use serde_json::from_slice;
use uuid::Uuid;

const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

pub async fn process(store: web::Data<Store>, payload: Multipart) -> Result<HttpResponse> {
    let response = import_sheet(&store, payload).await?;
    Ok(HttpResponse::Created().json(response))
}

async fn read_field(field: &mut actix_multipart::Field) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| PipelineError::Configuration(format!("upload failed: {}", e)))?;
        if bytes.len() + chunk.len() > MAX_UPLOAD_BYTES {
            return Err(PipelineError::Configuration("upload is too large".into()));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// Parses the multipart body and stores the new session.
pub async fn import_sheet(store: &Store, mut payload: Multipart) -> Result<ImportResponse> {
    let mut request: Option<ImportRequest> = None;
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(item) = payload.next().await {
        let mut field =
            item.map_err(|e| PipelineError::Configuration(format!("invalid multipart body: {}", e)))?;
        let name = field
            .content_disposition()
            .and_then(|cd| cd.get_name().map(|n| n.to_string()));

        match name.as_deref() {
            Some("json") => {
                let bytes = read_field(&mut field).await?;
                request = Some(from_slice(&bytes).map_err(|e| {
                    PipelineError::Configuration(format!("invalid import settings: {}", e))
                })?);
            }
            Some("file") => {
                let filename = field
                    .content_disposition()
                    .and_then(|cd| cd.get_filename().map(|f| f.to_string()))
                    .unwrap_or_default();
                if !filename.to_lowercase().ends_with(".csv") {
                    return Err(PipelineError::Configuration(
                        "the sheet must be uploaded as a .csv export".into(),
                    ));
                }
                upload = Some((filename, read_field(&mut field).await?));
            }
            _ => {
                read_field(&mut field).await?;
            }
        }
    }

    let (uploaded_name, bytes) =
        upload.ok_or_else(|| PipelineError::Configuration("missing 'file' part".into()))?;
    let request = request.unwrap_or(ImportRequest {
        filename: None,
        mapping: Default::default(),
    });
    let filename = request.filename.clone().unwrap_or(uploaded_name);

    let session_id = Uuid::new_v4();
    let employees = read_employees(bytes.as_slice(), &request.mapping, session_id)?;
    store.create_session(session_id, &filename, &request.mapping.sheet_name, &employees)?;
    info!(
        "Session {}: imported {} employees from {}",
        session_id,
        employees.len(),
        filename
    );

    Ok(ImportResponse {
        session_id,
        total_rows: employees.len(),
    })
}
