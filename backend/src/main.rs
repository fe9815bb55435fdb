use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use detection_backend::annotate::Annotator;
use detection_backend::config::{AppConfig, CleanupConfig};
use detection_backend::detector::{DetectionService, DetectorSettings};
use detection_backend::routes::configure_routes;
use detection_backend::storage::{FileStore, Pool, SweepPolicy, sweep};
use std::env;
use std::sync::Arc;
use std::time::Duration;

const SWEPT_POOLS: [Pool; 2] = [Pool::Uploads, Pool::Results];

fn sweep_pools(store: &FileStore, policy: &SweepPolicy) {
    for pool in SWEPT_POOLS {
        let dir = store.dir(pool);
        let removed = sweep(dir, policy);
        log::info!("Cleaned {} files from {}", removed, dir.display());
    }
}

fn spawn_periodic_sweep(store: FileStore, cleanup: &CleanupConfig) {
    let Some(minutes) = cleanup.interval_minutes.filter(|m| *m > 0) else {
        return;
    };
    let policy = SweepPolicy::periodic(cleanup);
    log::info!("Scheduling cleanup every {} minutes", minutes);

    actix_web::rt::spawn(async move {
        let period = Duration::from_secs(minutes.saturating_mul(60));
        let mut interval = actix_web::rt::time::interval(period);
        // the first tick completes immediately; startup already swept
        interval.tick().await;
        loop {
            interval.tick().await;
            let store = store.clone();
            if let Err(e) = web::block(move || sweep_pools(&store, &policy)).await {
                log::error!("Periodic cleanup aborted: {}", e);
            }
        }
    });
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    } else {
        log::error!("Failed to get the current working directory.");
    }

    let config = AppConfig::load().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;

    let store = FileStore::new(&config.storage);
    store.ensure_dirs().map_err(std::io::Error::other)?;
    for pool in [Pool::Uploads, Pool::Results, Pool::TestImages] {
        log::info!("{:?} pool: {}", pool, store.dir(pool).display());
    }

    sweep_pools(&store, &SweepPolicy::startup(&config.cleanup));
    spawn_periodic_sweep(store.clone(), &config.cleanup);

    let annotator = Arc::new(Annotator::from_font_path(config.detector.font_path.as_deref()));
    let settings = DetectorSettings::from_config(&config.detector).map_err(std::io::Error::other)?;
    // the model itself is loaded on the first detection request
    let service = web::Data::new(DetectionService::with_settings(
        store.clone(),
        annotator,
        settings,
    ));

    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    log::info!("Starting server on {}", bind_address);

    let storage = config.storage.clone();
    let max_upload_bytes = config.server.max_upload_bytes;
    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(service.clone())
            .configure(|cfg| configure_routes(cfg, &storage, max_upload_bytes))
    })
    .bind(&bind_address)?
    .run()
    .await
}
