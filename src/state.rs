use std::sync::Arc;

use crate::{
    clock::Clock,
    config::AppConfig,
    db::DbPool,
    engine::{monitor::MonitorServices, registry::MonitorRegistry},
    services::{geocoding::GeocodingProvider, store::SqliteStore},
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: DbPool,
    pub store: Arc<SqliteStore>,
    pub geocoder: Arc<dyn GeocodingProvider>,
    pub clock: Arc<dyn Clock>,
    pub monitors: MonitorRegistry,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        db: DbPool,
        geocoder: Arc<dyn GeocodingProvider>,
        services: MonitorServices,
    ) -> Self {
        let store = Arc::new(SqliteStore::new(db.clone()));
        let clock = services.clock.clone();
        let monitors = MonitorRegistry::new(config.monitor.clone(), services);
        Self {
            config,
            db,
            store,
            geocoder,
            clock,
            monitors,
        }
    }
}
