//! In-memory collaborators for engine unit tests.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::AppError,
    models::{
        contact::Contact,
        position::Coordinates,
        route::Route,
        sos::{AlertPayload, SosAlert},
        trip::{NewTrip, Trip, TripStatus},
    },
    services::{notifier::Notifier, routing::RoutingProvider, store::TripStore},
};

#[derive(Default)]
pub struct FakeStore {
    pub trips: Mutex<Vec<Trip>>,
    pub contacts: Mutex<Vec<Contact>>,
    pub alerts: Mutex<Vec<SosAlert>>,
    pub location_writes: Mutex<Vec<(String, Coordinates, DateTime<Utc>)>>,
    pub status_writes: Mutex<Vec<(String, TripStatus)>>,
    pub fail_locations: AtomicBool,
    pub fail_status: AtomicBool,
    pub fail_alerts: AtomicBool,
    pub fail_reads: AtomicBool,
    /// Latency added to trip reads and writes, in milliseconds.
    pub delay_ms: AtomicU64,
}

impl FakeStore {
    pub fn seed_trip(&self, trip: Trip) {
        self.trips.lock().unwrap().push(trip);
    }

    pub fn location_write_count(&self) -> usize {
        self.location_writes.lock().unwrap().len()
    }

    pub fn status_of(&self, trip_id: &str) -> Option<TripStatus> {
        self.trips
            .lock()
            .unwrap()
            .iter()
            .find(|trip| trip.id == trip_id)
            .map(|trip| trip.status)
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn latency(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn unavailable() -> AppError {
        AppError::unavailable("persistence", "injected failure")
    }
}

#[async_trait]
impl TripStore for FakeStore {
    async fn create_trip(&self, new: &NewTrip) -> Result<String, AppError> {
        self.latency().await;
        let mut trips = self.trips.lock().unwrap();
        let id = format!("trip-{}", trips.len() + 1);
        trips.push(Trip {
            id: id.clone(),
            user_id: new.user_id.clone(),
            destination_name: new.destination.display_name.clone(),
            destination: Some(new.destination.coords),
            start: new.start,
            current: new.start,
            status: TripStatus::Active,
            started_at: new.started_at,
            last_updated_at: new.started_at,
            ended_at: None,
        });
        Ok(id)
    }

    async fn update_trip_location(
        &self,
        trip_id: &str,
        coords: Coordinates,
        captured_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.latency().await;
        if self.fail_locations.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.location_writes
            .lock()
            .unwrap()
            .push((trip_id.to_string(), coords, captured_at));
        if let Some(trip) = self
            .trips
            .lock()
            .unwrap()
            .iter_mut()
            .find(|trip| trip.id == trip_id)
        {
            trip.current = coords;
            trip.last_updated_at = captured_at;
        }
        Ok(())
    }

    async fn update_trip_status(
        &self,
        trip_id: &str,
        status: TripStatus,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.latency().await;
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.status_writes
            .lock()
            .unwrap()
            .push((trip_id.to_string(), status));
        if let Some(trip) = self
            .trips
            .lock()
            .unwrap()
            .iter_mut()
            .find(|trip| trip.id == trip_id)
        {
            if trip.status != TripStatus::Completed {
                trip.status = status;
                if status == TripStatus::Completed {
                    trip.ended_at = Some(at);
                }
            }
        }
        Ok(())
    }

    async fn get_active_trip(&self, user_id: &str) -> Result<Option<Trip>, AppError> {
        self.latency().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        Ok(self
            .trips
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|trip| trip.user_id == user_id && trip.status.is_open())
            .cloned())
    }

    async fn append_sos_alert(&self, alert: &SosAlert) -> Result<(), AppError> {
        if self.fail_alerts.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }

    async fn list_contacts(&self, _user_id: &str) -> Result<Vec<Contact>, AppError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        Ok(self.contacts.lock().unwrap().clone())
    }
}

/// Router returning a fixed answer and counting calls.
pub struct FakeRouter {
    pub answer: Mutex<Result<Option<Route>, ()>>,
    pub calls: AtomicUsize,
}

impl FakeRouter {
    pub fn returning(route: Option<Route>) -> Self {
        Self {
            answer: Mutex::new(Ok(route)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: Mutex::new(Err(())),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RoutingProvider for FakeRouter {
    async fn route(
        &self,
        _origin: Coordinates,
        _destination: Coordinates,
    ) -> Result<Option<Route>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
            .lock()
            .unwrap()
            .clone()
            .map_err(|()| AppError::unavailable("routing", "injected failure"))
    }
}

#[derive(Default)]
pub struct FakeNotifier {
    pub sent: Mutex<Vec<(Vec<String>, AlertPayload)>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn send_alert(
        &self,
        recipients: &[String],
        payload: &AlertPayload,
    ) -> Result<(), AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::unavailable("notification", "injected failure"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipients.to_vec(), payload.clone()));
        Ok(())
    }
}

pub fn sample_route() -> Route {
    Route {
        waypoints: vec![
            Coordinates { lat: 0.0, lng: 0.0 },
            Coordinates { lat: 1.0, lng: 1.0 },
        ],
        distance_meters: 157_000.0,
        duration_seconds: 7_200.0,
    }
}
