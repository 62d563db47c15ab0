use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::AppError, models::position::Coordinates};

/// Persisted trip status. A user without a trip record has not started one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Active,
    Emergency,
    Completed,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::Active => "active",
            TripStatus::Emergency => "emergency",
            TripStatus::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(TripStatus::Active),
            "emergency" => Some(TripStatus::Emergency),
            "completed" => Some(TripStatus::Completed),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, TripStatus::Active | TripStatus::Emergency)
    }

    pub fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (TripStatus::Active, TripStatus::Emergency)
                | (TripStatus::Active, TripStatus::Completed)
                | (TripStatus::Emergency, TripStatus::Emergency)
                | (TripStatus::Emergency, TripStatus::Completed)
        )
    }

    pub fn validate_transition(self, to: Self) -> Result<(), AppError> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(AppError::invalid_transition(self, to))
        }
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub display_name: String,
    pub coords: Coordinates,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    pub id: String,
    pub user_id: String,
    pub destination_name: String,
    pub destination: Option<Coordinates>,
    pub start: Coordinates,
    pub current: Coordinates,
    pub status: TripStatus,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Trip {
    pub fn resolved_destination(&self) -> Option<Destination> {
        self.destination.map(|coords| Destination {
            display_name: self.destination_name.clone(),
            coords,
        })
    }
}

/// Fields the persistence layer needs to create a trip record.
#[derive(Debug, Clone)]
pub struct NewTrip {
    pub user_id: String,
    pub destination: Destination,
    pub start: Coordinates,
    pub started_at: DateTime<Utc>,
}
