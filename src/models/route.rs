use serde::{Deserialize, Serialize};

use crate::models::position::Coordinates;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub waypoints: Vec<Coordinates>,
    pub distance_meters: f64,
    pub duration_seconds: f64,
}

/// A ranked geocoding candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationResult {
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    pub address: Option<String>,
}
