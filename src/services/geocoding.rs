use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::{error::AppError, models::route::LocationResult};

const PROVIDER: &str = "geocoding";
pub const MIN_QUERY_LEN: usize = 3;
pub const MAX_RESULTS: usize = 5;

/// Free text to ranked candidate coordinates. Results are not stable between calls.
#[async_trait]
pub trait GeocodingProvider: Send + Sync {
    async fn search(&self, text: &str) -> Result<Vec<LocationResult>, AppError>;
}

/// Looks up destination candidates, degrading to an empty list.
pub async fn lookup_destinations(
    provider: &dyn GeocodingProvider,
    text: &str,
) -> Vec<LocationResult> {
    let text = text.trim();
    if text.chars().count() < MIN_QUERY_LEN {
        return Vec::new();
    }
    match provider.search(text).await {
        Ok(mut results) => {
            results.truncate(MAX_RESULTS);
            results
        }
        Err(err) => {
            warn!("geocoding lookup failed: {err}");
            Vec::new()
        }
    }
}

/// Nominatim search client.
#[derive(Clone)]
pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
}

impl NominatimGeocoder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: super::http_client(),
            base_url: base_url.into(),
        }
    }

    fn search_url(&self, text: &str) -> Result<Url, AppError> {
        let limit = MAX_RESULTS.to_string();
        Url::parse_with_params(
            &self.base_url,
            &[
                ("q", text),
                ("format", "json"),
                ("addressdetails", "1"),
                ("limit", limit.as_str()),
            ],
        )
        .map_err(|err| AppError::Config(format!("invalid geocoding url: {err}")))
    }
}

#[async_trait]
impl GeocodingProvider for NominatimGeocoder {
    async fn search(&self, text: &str) -> Result<Vec<LocationResult>, AppError> {
        let url = self.search_url(text)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| AppError::unavailable(PROVIDER, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::unavailable(PROVIDER, format!("HTTP {status}")));
        }
        let body = response
            .text()
            .await
            .map_err(|err| AppError::unavailable(PROVIDER, err))?;
        parse_nominatim(&body)
    }
}

#[derive(Deserialize)]
struct NominatimPlace {
    display_name: String,
    lat: String,
    lon: String,
}

fn parse_nominatim(body: &str) -> Result<Vec<LocationResult>, AppError> {
    let places: Vec<NominatimPlace> =
        serde_json::from_str(body).map_err(|err| AppError::unavailable(PROVIDER, err))?;
    Ok(places
        .into_iter()
        .filter_map(|place| {
            let lat = place.lat.parse().ok()?;
            let lng = place.lon.parse().ok()?;
            Some(LocationResult {
                name: place.display_name.clone(),
                lat,
                lng,
                address: Some(place.display_name),
            })
        })
        .collect())
}
