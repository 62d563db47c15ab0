use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::{
    error::AppError,
    models::{position::Coordinates, route::Route},
};

const PROVIDER: &str = "routing";

/// Two coordinates to a path. `Ok(None)` means the provider found no route.
#[async_trait]
pub trait RoutingProvider: Send + Sync {
    async fn route(
        &self,
        origin: Coordinates,
        destination: Coordinates,
    ) -> Result<Option<Route>, AppError>;
}

/// OSRM `route/v1` client using the driving profile.
#[derive(Clone)]
pub struct OsrmRouter {
    client: reqwest::Client,
    base_url: String,
}

impl OsrmRouter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: super::http_client(),
            base_url: base_url.into(),
        }
    }

    // OSRM wants lng,lat order.
    fn route_url(&self, origin: Coordinates, destination: Coordinates) -> Result<Url, AppError> {
        let raw = format!(
            "{}/driving/{},{};{},{}?overview=full&geometries=geojson",
            self.base_url.trim_end_matches('/'),
            origin.lng,
            origin.lat,
            destination.lng,
            destination.lat
        );
        Url::parse(&raw).map_err(|err| AppError::Config(format!("invalid routing url: {err}")))
    }
}

#[async_trait]
impl RoutingProvider for OsrmRouter {
    async fn route(
        &self,
        origin: Coordinates,
        destination: Coordinates,
    ) -> Result<Option<Route>, AppError> {
        let url = self.route_url(origin, destination)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| AppError::unavailable(PROVIDER, err))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| AppError::unavailable(PROVIDER, err))?;
        // OSRM answers NoRoute with a 400 and a JSON body.
        if !status.is_success() && !status.is_client_error() {
            return Err(AppError::unavailable(PROVIDER, format!("HTTP {status}")));
        }
        parse_osrm(&body)
    }
}

#[derive(Deserialize)]
struct OsrmResponse {
    code: String,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Deserialize)]
struct OsrmRoute {
    geometry: OsrmGeometry,
    distance: f64,
    duration: f64,
}

#[derive(Deserialize)]
struct OsrmGeometry {
    coordinates: Vec<[f64; 2]>,
}

fn parse_osrm(body: &str) -> Result<Option<Route>, AppError> {
    let response: OsrmResponse =
        serde_json::from_str(body).map_err(|err| AppError::unavailable(PROVIDER, err))?;
    if response.code != "Ok" {
        return Ok(None);
    }
    let Some(route) = response.routes.into_iter().next() else {
        return Ok(None);
    };
    let waypoints = route
        .geometry
        .coordinates
        .into_iter()
        .map(|[lng, lat]| Coordinates { lat, lng })
        .collect();
    Ok(Some(Route {
        waypoints,
        distance_meters: route.distance,
        duration_seconds: route.duration,
    }))
}
