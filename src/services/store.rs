use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use tracing::debug;
use uuid::Uuid;

use crate::{
    db::DbPool,
    error::AppError,
    models::{
        contact::{Contact, ContactSnapshot},
        position::Coordinates,
        sos::{SosAlert, SosTrigger},
        trip::{NewTrip, Trip, TripStatus},
    },
};

const PROVIDER: &str = "persistence";

/// Persistence and sync service consumed by the engine.
///
/// Every call may fail with [`AppError::ProviderUnavailable`]; callers must not
/// assume a write is visible to an immediately following read.
#[async_trait]
pub trait TripStore: Send + Sync {
    async fn create_trip(&self, trip: &NewTrip) -> Result<String, AppError>;

    /// Last-write-wins on `captured_at`: an older fix never overwrites a newer one.
    async fn update_trip_location(
        &self,
        trip_id: &str,
        coords: Coordinates,
        captured_at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    async fn update_trip_status(
        &self,
        trip_id: &str,
        status: TripStatus,
        at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    async fn get_active_trip(&self, user_id: &str) -> Result<Option<Trip>, AppError>;

    async fn append_sos_alert(&self, alert: &SosAlert) -> Result<(), AppError>;

    async fn list_contacts(&self, user_id: &str) -> Result<Vec<Contact>, AppError>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn add_contact(
        &self,
        user_id: &str,
        name: &str,
        phone: &str,
        email: Option<&str>,
        relation: Option<&str>,
    ) -> Result<Contact, AppError> {
        let name = name.trim();
        let phone = phone.trim();
        if user_id.trim().is_empty() {
            return Err(AppError::BadRequest("user id required".into()));
        }
        if name.is_empty() || phone.is_empty() {
            return Err(AppError::BadRequest(
                "contact needs a name and a phone number".into(),
            ));
        }
        let contact = Contact {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            phone: phone.to_string(),
            email: normalize_optional(email),
            relation: normalize_optional(relation),
        };
        sqlx::query(
            "INSERT INTO contacts (id, user_id, name, phone, email, relation, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&contact.id)
        .bind(user_id)
        .bind(&contact.name)
        .bind(&contact.phone)
        .bind(&contact.email)
        .bind(&contact.relation)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(contact)
    }

    pub async fn get_trip(&self, trip_id: &str) -> Result<Option<Trip>, AppError> {
        let row = sqlx::query(&format!("{TRIP_COLUMNS} WHERE id = ?1"))
            .bind(trip_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        row.as_ref().map(trip_from_row).transpose()
    }

    pub async fn list_sos_alerts(&self, user_id: &str) -> Result<Vec<SosAlert>, AppError> {
        let rows = sqlx::query(
            "SELECT id, trip_id, user_id, lat, lng, triggered_at, trigger_type, notified_contacts
             FROM sos_alerts WHERE user_id = ?1 ORDER BY triggered_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.iter().map(alert_from_row).collect()
    }
}

const TRIP_COLUMNS: &str = "SELECT id, user_id, destination_name, destination_lat, destination_lng,
    start_lat, start_lng, current_lat, current_lng, status, started_at, last_updated_at, ended_at
    FROM trips";

#[async_trait]
impl TripStore for SqliteStore {
    async fn create_trip(&self, trip: &NewTrip) -> Result<String, AppError> {
        let id = Uuid::new_v4().to_string();
        let started_at = trip.started_at.timestamp_millis();
        sqlx::query(
            "INSERT INTO trips (id, user_id, destination_name, destination_lat, destination_lng,
                start_lat, start_lng, current_lat, current_lng, status,
                started_at, last_updated_at, status_updated_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?6, ?7, 'active', ?8, ?8, ?8, NULL)",
        )
        .bind(&id)
        .bind(&trip.user_id)
        .bind(&trip.destination.display_name)
        .bind(trip.destination.coords.lat)
        .bind(trip.destination.coords.lng)
        .bind(trip.start.lat)
        .bind(trip.start.lng)
        .bind(started_at)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(id)
    }

    async fn update_trip_location(
        &self,
        trip_id: &str,
        coords: Coordinates,
        captured_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE trips SET current_lat = ?1, current_lng = ?2, last_updated_at = ?3
             WHERE id = ?4 AND status != 'completed' AND last_updated_at <= ?3",
        )
        .bind(coords.lat)
        .bind(coords.lng)
        .bind(captured_at.timestamp_millis())
        .bind(trip_id)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        if result.rows_affected() == 0 {
            debug!(trip_id, "location write superseded or trip closed");
        }
        Ok(())
    }

    async fn update_trip_status(
        &self,
        trip_id: &str,
        status: TripStatus,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let at = at.timestamp_millis();
        let query = match status {
            TripStatus::Active => {
                return Err(AppError::invalid_transition("stored status", status));
            }
            TripStatus::Emergency => sqlx::query(
                "UPDATE trips SET status = 'emergency', status_updated_at = ?1,
                    last_updated_at = MAX(last_updated_at, ?1)
                 WHERE id = ?2 AND status != 'completed' AND status_updated_at <= ?1",
            ),
            TripStatus::Completed => sqlx::query(
                "UPDATE trips SET status = 'completed', status_updated_at = ?1, ended_at = ?1
                 WHERE id = ?2 AND status != 'completed' AND status_updated_at <= ?1",
            ),
        };
        let result = query
            .bind(at)
            .bind(trip_id)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        if result.rows_affected() == 0 {
            debug!(trip_id, %status, "status write ignored");
        }
        Ok(())
    }

    async fn get_active_trip(&self, user_id: &str) -> Result<Option<Trip>, AppError> {
        let row = sqlx::query(&format!(
            "{TRIP_COLUMNS} WHERE user_id = ?1 AND status IN ('active', 'emergency')
             ORDER BY started_at DESC LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        row.as_ref().map(trip_from_row).transpose()
    }

    async fn append_sos_alert(&self, alert: &SosAlert) -> Result<(), AppError> {
        let contacts = serde_json::to_string(&alert.notified_contacts)
            .map_err(|err| AppError::Other(err.into()))?;
        sqlx::query(
            "INSERT INTO sos_alerts (id, trip_id, user_id, lat, lng, triggered_at, trigger_type, notified_contacts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&alert.id)
        .bind(&alert.trip_id)
        .bind(&alert.user_id)
        .bind(alert.coordinates.lat)
        .bind(alert.coordinates.lng)
        .bind(alert.triggered_at.timestamp_millis())
        .bind(alert.trigger.as_str())
        .bind(contacts)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn list_contacts(&self, user_id: &str) -> Result<Vec<Contact>, AppError> {
        let rows = sqlx::query(
            "SELECT id, name, phone, email, relation FROM contacts
             WHERE user_id = ?1 ORDER BY created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.iter()
            .map(|row| {
                Ok(Contact {
                    id: row.try_get("id").map_err(unavailable)?,
                    name: row.try_get("name").map_err(unavailable)?,
                    phone: row.try_get("phone").map_err(unavailable)?,
                    email: row.try_get("email").map_err(unavailable)?,
                    relation: row.try_get("relation").map_err(unavailable)?,
                })
            })
            .collect()
    }
}

fn unavailable(err: sqlx::Error) -> AppError {
    AppError::unavailable(PROVIDER, err)
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, AppError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| AppError::Other(anyhow::anyhow!("timestamp {ms} out of range")))
}

fn trip_from_row(row: &SqliteRow) -> Result<Trip, AppError> {
    let status: String = row.try_get("status").map_err(unavailable)?;
    let status = TripStatus::parse(&status)
        .ok_or_else(|| AppError::Other(anyhow::anyhow!("unknown trip status {status}")))?;
    let destination_lat: Option<f64> = row.try_get("destination_lat").map_err(unavailable)?;
    let destination_lng: Option<f64> = row.try_get("destination_lng").map_err(unavailable)?;
    let ended_at: Option<i64> = row.try_get("ended_at").map_err(unavailable)?;
    Ok(Trip {
        id: row.try_get("id").map_err(unavailable)?,
        user_id: row.try_get("user_id").map_err(unavailable)?,
        destination_name: row.try_get("destination_name").map_err(unavailable)?,
        destination: match (destination_lat, destination_lng) {
            (Some(lat), Some(lng)) => Some(Coordinates { lat, lng }),
            _ => None,
        },
        start: Coordinates {
            lat: row.try_get("start_lat").map_err(unavailable)?,
            lng: row.try_get("start_lng").map_err(unavailable)?,
        },
        current: Coordinates {
            lat: row.try_get("current_lat").map_err(unavailable)?,
            lng: row.try_get("current_lng").map_err(unavailable)?,
        },
        status,
        started_at: from_millis(row.try_get("started_at").map_err(unavailable)?)?,
        last_updated_at: from_millis(row.try_get("last_updated_at").map_err(unavailable)?)?,
        ended_at: ended_at.map(from_millis).transpose()?,
    })
}

fn alert_from_row(row: &SqliteRow) -> Result<SosAlert, AppError> {
    let trigger: String = row.try_get("trigger_type").map_err(unavailable)?;
    let contacts: String = row.try_get("notified_contacts").map_err(unavailable)?;
    let notified_contacts: Vec<ContactSnapshot> =
        serde_json::from_str(&contacts).map_err(|err| AppError::Other(err.into()))?;
    Ok(SosAlert {
        id: row.try_get("id").map_err(unavailable)?,
        trip_id: row.try_get("trip_id").map_err(unavailable)?,
        user_id: row.try_get("user_id").map_err(unavailable)?,
        coordinates: Coordinates {
            lat: row.try_get("lat").map_err(unavailable)?,
            lng: row.try_get("lng").map_err(unavailable)?,
        },
        triggered_at: from_millis(row.try_get("triggered_at").map_err(unavailable)?)?,
        trigger: SosTrigger::parse(&trigger).unwrap_or(SosTrigger::Manual),
        notified_contacts,
    })
}

fn normalize_optional(input: Option<&str>) -> Option<String> {
    input.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
