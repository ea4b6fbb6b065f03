use clap::Parser;
use figment::{Figment, providers::Env};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use url::Url;

use bindery::alerts::Alerter;
use bindery::cli::Args;
use bindery::config::Config;
use bindery::handlers::site::{SiteClient, StorefrontHandlers};
use bindery::images::ImagePipeline;
use bindery::logging::setup_logging;
use bindery::services::manager::ServiceManager;
use bindery::services::web::WebService;
use bindery::services::worker::WorkerService;
use bindery::services::ServiceResult;
use bindery::state::AppState;
use bindery::store::{ObjectStore, S3ObjectStore};
use bindery::worker::{WorkerContext, WorkerMetrics, WorkerPool};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load configuration first to get log level
    let config: Config = Figment::new()
        .merge(Env::raw())
        .extract()
        .expect("Failed to load config");

    setup_logging(&config, args.tracing);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = config.environment.as_str(),
        "starting bindery"
    );

    let base_site_url =
        Url::parse(&config.base_site_url).expect("BASE_SITE_URL must be an absolute URL");

    // Create database connection pool and bring the schema up to date
    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .expect("Failed to create database pool");

    sqlx::migrate!()
        .run(&db_pool)
        .await
        .expect("Failed to run database migrations");

    info!(
        port = config.port,
        worker_concurrency = config.worker_concurrency,
        lock_ttl = format!("{:.2?}", config.lock_ttl),
        shutdown_timeout = format!("{:.2?}", config.shutdown_timeout),
        base_site_url = %base_site_url,
        "configuration loaded"
    );

    let object_store: Arc<dyn ObjectStore> = Arc::new(
        S3ObjectStore::from_config(&config.object_store)
            .await
            .expect("Failed to create object store client"),
    );

    let site_client = SiteClient::new(
        base_site_url.clone(),
        &config.user_agent,
        config.site_rate_limit.max(config.request_delay),
    )
    .expect("Failed to create site client");
    let handlers = Arc::new(StorefrontHandlers::new(site_client));

    let images = Arc::new(
        ImagePipeline::new(&config.user_agent, base_site_url, object_store.clone())
            .expect("Failed to create image pipeline"),
    );

    let alerter = Arc::new(Alerter::new(config.alert_webhook_url.clone()));
    let worker_pool = Arc::new(WorkerPool::new(
        WorkerContext {
            db_pool: db_pool.clone(),
            handlers,
            images,
            metrics: Arc::new(WorkerMetrics::new()),
            alerter: alerter.clone(),
            lock_ttl: config.lock_ttl,
            poll_interval: config.poll_interval,
        },
        config.worker_concurrency,
    ));

    let app_state = AppState::new(
        db_pool,
        object_store,
        Some(worker_pool.clone()),
        config.retry_attempts,
        config.shutdown_timeout,
    );

    let shutdown_timeout = config.shutdown_timeout;
    let mut service_manager = ServiceManager::new();
    service_manager.register_service("web", Box::new(WebService::new(config.port, app_state.clone())));
    service_manager.register_service(
        "worker",
        Box::new(WorkerService::new(
            app_state,
            worker_pool,
            alerter,
            config.lock_ttl,
            config.cleanup_interval,
            config.cleanup_ttl,
            config.shutdown_timeout,
        )),
    );
    service_manager.spawn_all();

    // Set up signal handling for both SIGINT (Ctrl+C) and SIGTERM
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("received ctrl+c, gracefully shutting down...");
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm_stream =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM signal handler");
        sigterm_stream.recv().await;
        info!("received SIGTERM, gracefully shutting down...");
    };

    #[cfg(not(unix))]
    let sigterm = async {
        // On non-Unix systems, create a future that never completes
        // This ensures the select! macro works correctly
        std::future::pending::<()>().await;
    };

    let mut exit_code = 0;

    tokio::select! {
        (service_name, result) = service_manager.run() => {
            // A service completed unexpectedly
            match result {
                ServiceResult::GracefulShutdown => {
                    info!(service = service_name, "service completed gracefully");
                }
                ServiceResult::NormalCompletion => {
                    warn!(service = service_name, "service completed unexpectedly");
                    exit_code = 1;
                }
                ServiceResult::Error(e) => {
                    error!(service = service_name, error = ?e, "service failed");
                    exit_code = 1;
                }
            }

            if let Err(pending) = service_manager.shutdown(shutdown_timeout).await {
                warn!(pending = ?pending, "graceful shutdown elapsed with pending services");
                exit_code = if exit_code == 0 { 2 } else { exit_code };
            }
        }
        _ = ctrl_c => {
            if let Err(pending) = service_manager.shutdown(shutdown_timeout).await {
                warn!(pending = ?pending, "graceful shutdown elapsed with pending services");
                exit_code = 2;
            }
        }
        _ = sigterm => {
            if let Err(pending) = service_manager.shutdown(shutdown_timeout).await {
                warn!(pending = ?pending, "graceful shutdown elapsed with pending services");
                exit_code = 2;
            }
        }
    }

    info!(exit_code, "application shutdown complete");
    std::process::exit(exit_code);
}
