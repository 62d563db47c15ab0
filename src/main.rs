use std::sync::Arc;

use safetransit::clock::SystemClock;
use safetransit::config::AppConfig;
use safetransit::db::{init_pool, run_migrations};
use safetransit::engine::monitor::MonitorServices;
use safetransit::error::AppError;
use safetransit::routes::create_router;
use safetransit::services::{
    geocoding::NominatimGeocoder, notifier::EmailJsNotifier, routing::OsrmRouter,
    store::SqliteStore,
};
use safetransit::state::AppState;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_logging();

    let config = AppConfig::from_env()?;
    let db = init_pool(&config.database_url).await?;

    if let Err(err) = run_migrations(&db).await {
        error!("migration failed: {err:?}");
        return Err(err);
    }

    let notifier = EmailJsNotifier::new(&config.providers);
    if notifier.is_mock() {
        warn!("EmailJS credentials are mock values, SOS emails will only be logged");
    }

    let services = MonitorServices {
        store: Arc::new(SqliteStore::new(db.clone())),
        router: Arc::new(OsrmRouter::new(config.providers.routing_url.clone())),
        notifier: Arc::new(notifier),
        clock: Arc::new(SystemClock),
    };
    let geocoder = Arc::new(NominatimGeocoder::new(config.providers.geocoding_url.clone()));
    let state = AppState::new(config.clone(), db.clone(), geocoder, services);

    let app = create_router(state.clone());

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.monitors.close_all();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("could not listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,safetransit=debug".into());

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
