use actix_web::{web, App, HttpServer};
use env_logger::Env;
use log::{error, info, warn};
use payroll_notifier::config::AppConfig;
use payroll_notifier::delivery::{SlipDelivery, WebhookClient};
use payroll_notifier::job_controller::{BatchCoordinator, BatchSettings, WorkerPool};
use payroll_notifier::render::{OfficeRenderer, SlipRenderer, SlipTemplate};
use payroll_notifier::store::Store;
use payroll_notifier::AppState;
use std::io;
use std::sync::Arc;

#[actix_web::main]
async fn main() -> io::Result<()> {
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    let config = AppConfig::load().map_err(|e| {
        error!("{}", e);
        io::Error::other(e)
    })?;
    let store = Store::open(&config.database.path).map_err(|e| {
        error!("Cannot open database {}: {}", config.database.path.display(), e);
        io::Error::other(e)
    })?;
    let template = SlipTemplate::load(&config.render.template_path).map_err(|e| {
        error!(
            "Cannot read slip template {}: {}",
            config.render.template_path.display(),
            e
        );
        e
    })?;
    info!(
        "Slip template {} references {} fields",
        config.render.template_path.display(),
        template.placeholders().len()
    );

    let webhook = match &config.delivery.webhook_url {
        Some(url) => {
            let client =
                WebhookClient::new(url.clone(), &config.delivery).map_err(io::Error::other)?;
            info!("Delivering slips to {}", client.endpoint());
            Some(Arc::new(client))
        }
        None => {
            warn!("No webhook URL configured, sending slips will fail");
            None
        }
    };
    let delivery = webhook.clone().map(|c| c as Arc<dyn SlipDelivery>);
    let renderer: Arc<dyn SlipRenderer> = Arc::new(OfficeRenderer::new(&config.render));

    let coordinator = BatchCoordinator::new(
        store.clone(),
        template,
        renderer,
        delivery,
        WorkerPool::new(config.pool.workers),
        BatchSettings::from_config(&config),
    );
    let state = AppState {
        store,
        coordinator,
        webhook,
        broadcast: config.broadcast.clone(),
    };

    let host = config.server.host.clone();
    let port = config.server.port;
    info!(
        "Server running at http://{}:{} ({} workers)",
        host, port, config.pool.workers
    );

    HttpServer::new(move || {
        App::new()
            .app_data(web::JsonConfig::default().limit(10 * 1024 * 1024)) // 10 MB
            .configure(|cfg| state.configure(cfg))
    })
    .bind((host, port))?
    .run()
    .await
}
