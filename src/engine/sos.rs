use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    clock::Clock,
    error::AppError,
    models::{
        contact::Contact,
        position::Coordinates,
        sos::{AlertPayload, SosAlert, SosTrigger},
        trip::TripStatus,
    },
    services::{notifier::Notifier, store::TripStore},
};

#[derive(Debug, Clone)]
pub struct SosRequest {
    pub trip_id: Option<String>,
    pub user_id: String,
    pub user_name: String,
    pub coordinates: Coordinates,
    pub contacts: Vec<Contact>,
    pub trigger: SosTrigger,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NotificationOutcome {
    Sent { recipients: usize },
    NoRecipients,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SosReport {
    pub alert: SosAlert,
    pub notification: NotificationOutcome,
}

/// Broadcasts an emergency to persistence and to the user's contacts.
///
/// Both effects are attempted concurrently and neither waits on the other.
/// Only the persistence side decides success.
pub struct SosDispatcher {
    store: Arc<dyn TripStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl SosDispatcher {
    pub fn new(store: Arc<dyn TripStore>, notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            notifier,
            clock,
        }
    }

    pub async fn trigger(&self, request: SosRequest) -> Result<SosReport, AppError> {
        let now = self.clock.now();
        let alert = SosAlert::new(
            request.trip_id.clone(),
            request.user_id.clone(),
            request.coordinates,
            now,
            request.trigger,
            &request.contacts,
        );
        let recipients: Vec<String> = request
            .contacts
            .iter()
            .filter_map(Contact::email_address)
            .map(str::to_string)
            .collect();
        let payload = AlertPayload {
            user_name: request.user_name.clone(),
            location_link: request.coordinates.map_link(),
            timestamp: now.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            trigger: request.trigger,
        };

        let (persisted, notification) = tokio::join!(
            self.persist(&alert),
            self.notify(&recipients, &payload)
        );

        if let Err(err) = persisted {
            error!(user_id = %alert.user_id, trip_id = ?alert.trip_id, "SOS not recorded: {err}");
            return Err(AppError::SosNotPersisted(err.to_string()));
        }
        info!(
            alert_id = %alert.id,
            user_id = %alert.user_id,
            trip_id = ?alert.trip_id,
            trigger = %alert.trigger,
            "SOS recorded"
        );
        Ok(SosReport {
            alert,
            notification,
        })
    }

    async fn persist(&self, alert: &SosAlert) -> Result<(), AppError> {
        let status = match &alert.trip_id {
            Some(trip_id) => {
                self.store
                    .update_trip_status(trip_id, TripStatus::Emergency, alert.triggered_at)
                    .await
            }
            None => Ok(()),
        };
        let appended = self.store.append_sos_alert(alert).await;
        status.and(appended)
    }

    async fn notify(&self, recipients: &[String], payload: &AlertPayload) -> NotificationOutcome {
        if recipients.is_empty() {
            warn!(user = %payload.user_name, "no contact has an email address, SOS email skipped");
            return NotificationOutcome::NoRecipients;
        }
        match self.notifier.send_alert(recipients, payload).await {
            Ok(()) => NotificationOutcome::Sent {
                recipients: recipients.len(),
            },
            Err(err) => {
                warn!("SOS email failed: {err}");
                NotificationOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }
}
