//! `POST /api/webhook/test`: checks that the configured webhook answers.

use actix_web::web::{post, scope};
use actix_web::Scope;

mod check;

const API_PATH: &str = "/api/webhook";

pub fn configure_routes() -> Scope {
    scope(API_PATH).route("/test", post().to(check::process))
}
