use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use jobwell::api;
use jobwell::config::Config;
use jobwell::pool::{PoolSettings, WorkerPool};
use jobwell::state::AppState;
use jobwell::store::Store;
use jobwell::worker::SleepHandler;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().expect("invalid configuration");

    let db_pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");
    info!("connected to database");

    let store = Store::new(db_pool);
    store
        .init_schema()
        .await
        .expect("failed to initialize schema");

    let state = AppState::new(&config, store.clone());

    // Concurrency counters are process-local; seed them from the running
    // rows left over from a previous instance.
    let running = store
        .running_counts_by_tenant()
        .await
        .expect("failed to count running jobs");
    state.admission.rebuild_running(running);

    let worker_pool = WorkerPool::start(
        PoolSettings::from(&config),
        store,
        state.admission.clone(),
        state.events.clone(),
        Arc::new(SleepHandler),
    );

    let data = web::Data::new(state);
    let bind_addr = (config.api_host.clone(), config.api_port);
    info!(host = %config.api_host, port = config.api_port, "starting HTTP server");

    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .app_data(api::json_config())
            .app_data(api::query_config())
            .configure(api::configure)
    })
    .bind(bind_addr)?
    .run()
    .await?;

    // The HTTP server handles the termination signal; once it returns,
    // drain the workers before exiting.
    worker_pool.shutdown().await;

    Ok(())
}
