//! Payroll slip notifier.
//!
//! Imports a payroll sheet into a session, renders one salary slip image per
//! employee through an external document converter and delivers each slip to
//! a messaging webhook. Batch runs are bounded by a shared worker pool and
//! stream their progress to any number of observers.

pub mod config;
pub mod delivery;
pub mod error;
pub mod import;
pub mod job_controller;
pub mod render;
pub mod services;
pub mod store;

use crate::config::BroadcastConfig;
use crate::delivery::WebhookClient;
use crate::job_controller::BatchCoordinator;
use crate::store::Store;
use actix_web::web;
use std::sync::Arc;

/// Shared state handed to every HTTP worker.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub coordinator: BatchCoordinator,
    pub webhook: Option<Arc<WebhookClient>>,
    pub broadcast: BroadcastConfig,
}

impl AppState {
    /// Registers the application data and every API scope.
    pub fn configure(&self, cfg: &mut web::ServiceConfig) {
        cfg.app_data(web::Data::new(self.store.clone()))
            .app_data(web::Data::new(self.coordinator.clone()))
            .app_data(web::Data::new(self.webhook.clone()))
            .app_data(web::Data::new(self.broadcast.clone()))
            .service(services::import::configure_routes())
            .service(services::batch::configure_routes())
            .service(services::webhook::configure_routes());
    }
}
