use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    models::route::LocationResult, services::geocoding::lookup_destinations, state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/geocode", get(geocode))
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    database: &'static str,
    monitors: usize,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    let database = match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => "ok",
        Err(err) => {
            warn!("health check could not reach the database: {err}");
            "unavailable"
        }
    };
    Json(Health {
        status: if database == "ok" { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        database,
        monitors: state.monitors.len(),
    })
}

#[derive(Deserialize)]
struct GeocodeQuery {
    #[serde(default)]
    q: String,
}

async fn geocode(
    State(state): State<AppState>,
    Query(query): Query<GeocodeQuery>,
) -> Json<Vec<LocationResult>> {
    Json(lookup_destinations(state.geocoder.as_ref(), &query.q).await)
}
