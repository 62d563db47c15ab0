use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{clock::elapsed_between, error::AppError};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A validated WGS84 coordinate pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Result<Self, AppError> {
        if !lat.is_finite() || !lng.is_finite() {
            return Err(AppError::BadRequest("coordinates must be finite".into()));
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(AppError::BadRequest(format!(
                "latitude {lat} out of range"
            )));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(AppError::BadRequest(format!(
                "longitude {lng} out of range"
            )));
        }
        Ok(Self { lat, lng })
    }

    /// Great-circle distance in meters.
    pub fn distance_to(self, other: Self) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lng = (other.lng - self.lng).to_radians();
        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }

    pub fn map_link(self) -> String {
        format!("https://www.google.com/maps?q={},{}", self.lat, self.lng)
    }
}

/// A single fix delivered by a position source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub coords: Coordinates,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
}

impl PositionSample {
    pub fn new(coords: Coordinates, captured_at: DateTime<Utc>) -> Self {
        Self {
            coords,
            captured_at,
            accuracy_m: None,
        }
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.captured_at, now)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age_at(now) > max_age
    }

    pub fn ensure_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> Result<(), AppError> {
        if self.is_stale(now, max_age) {
            let age_ms = i64::try_from(self.age_at(now).as_millis()).unwrap_or(i64::MAX);
            return Err(AppError::StaleFix { age_ms });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionErrorKind {
    PermissionDenied,
    Unavailable,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionError {
    pub kind: PositionErrorKind,
    pub message: String,
}

/// What the UI should say about the GPS stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GpsStatus {
    #[default]
    Searching,
    Active,
    Error {
        message: String,
        consecutive_errors: u32,
    },
}
