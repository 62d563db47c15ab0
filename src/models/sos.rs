use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    contact::{Contact, ContactSnapshot},
    position::Coordinates,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SosTrigger {
    Manual,
    Inactivity,
}

impl SosTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SosTrigger::Manual => "manual",
            SosTrigger::Inactivity => "inactivity",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "manual" => Some(SosTrigger::Manual),
            "inactivity" => Some(SosTrigger::Inactivity),
            _ => None,
        }
    }
}

impl fmt::Display for SosTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only record of an emergency broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SosAlert {
    pub id: String,
    pub trip_id: Option<String>,
    pub user_id: String,
    pub coordinates: Coordinates,
    pub triggered_at: DateTime<Utc>,
    pub trigger: SosTrigger,
    pub notified_contacts: Vec<ContactSnapshot>,
}

impl SosAlert {
    pub fn new(
        trip_id: Option<String>,
        user_id: impl Into<String>,
        coordinates: Coordinates,
        triggered_at: DateTime<Utc>,
        trigger: SosTrigger,
        contacts: &[Contact],
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            trip_id,
            user_id: user_id.into(),
            coordinates,
            triggered_at,
            trigger,
            notified_contacts: contacts.iter().map(ContactSnapshot::from).collect(),
        }
    }
}

/// Body handed to the notification provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertPayload {
    pub user_name: String,
    pub location_link: String,
    pub timestamp: String,
    pub trigger: SosTrigger,
}
