use crate::delivery::WebhookClient;
use actix_web::{web, HttpResponse, Responder};
use common::requests::WebhookCheck;
use std::sync::Arc;

pub async fn process(client: web::Data<Option<Arc<WebhookClient>>>) -> impl Responder {
    let check = match client.get_ref() {
        Some(client) => client.check_connection().await,
        None => WebhookCheck {
            reachable: false,
            message: "Webhook URL is not configured".to_string(),
        },
    };
    HttpResponse::Ok().json(check)
}
