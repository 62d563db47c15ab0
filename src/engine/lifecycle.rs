use std::{fmt, sync::Arc, time::Duration};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    clock::Clock,
    error::AppError,
    models::{
        position::PositionSample,
        route::Route,
        trip::{Destination, NewTrip, TripStatus},
    },
    services::store::TripStore,
};

/// In-memory trip state. `NotStarted` stands for "no trip record".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TripPhase {
    NotStarted,
    Active,
    Emergency,
    Completed,
}

impl TripPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripPhase::NotStarted => "not_started",
            TripPhase::Active => "active",
            TripPhase::Emergency => "emergency",
            TripPhase::Completed => "completed",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, TripPhase::Active | TripPhase::Emergency)
    }

    /// The persisted status for this phase. `NotStarted` has no record.
    pub fn status(&self) -> Option<TripStatus> {
        match self {
            TripPhase::NotStarted => None,
            TripPhase::Active => Some(TripStatus::Active),
            TripPhase::Emergency => Some(TripStatus::Emergency),
            TripPhase::Completed => Some(TripStatus::Completed),
        }
    }
}

impl From<TripStatus> for TripPhase {
    fn from(status: TripStatus) -> Self {
        match status {
            TripStatus::Active => TripPhase::Active,
            TripStatus::Emergency => TripPhase::Emergency,
            TripStatus::Completed => TripPhase::Completed,
        }
    }
}

impl fmt::Display for TripPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed { from: TripPhase, to: TripPhase },
    Unchanged(TripPhase),
}

/// Owns the trip state machine for one user.
///
/// `epoch` is bumped whenever the trip or destination changes so that late
/// results of in-flight work can be recognised and dropped.
pub struct TripLifecycle {
    user_id: String,
    store: Arc<dyn TripStore>,
    clock: Arc<dyn Clock>,
    max_fix_age: Duration,
    phase: TripPhase,
    trip_id: Option<String>,
    destination: Option<Destination>,
    preview: Option<Destination>,
    route: Option<Route>,
    epoch: u64,
}

impl TripLifecycle {
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<dyn TripStore>,
        clock: Arc<dyn Clock>,
        max_fix_age: Duration,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            store,
            clock,
            max_fix_age,
            phase: TripPhase::NotStarted,
            trip_id: None,
            destination: None,
            preview: None,
            route: None,
            epoch: 0,
        }
    }

    pub fn phase(&self) -> TripPhase {
        self.phase
    }

    pub fn trip_id(&self) -> Option<&str> {
        self.trip_id.as_deref()
    }

    /// The trip's destination while one is open, otherwise the preview.
    pub fn destination(&self) -> Option<&Destination> {
        if self.phase.is_open() {
            self.destination.as_ref()
        } else {
            self.preview.as_ref()
        }
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Sets the destination shown before a trip starts.
    pub fn set_preview_destination(&mut self, destination: Destination) -> Result<(), AppError> {
        if self.phase.is_open() {
            return Err(AppError::precondition(
                "destination cannot change while a trip is in progress",
            ));
        }
        if self.preview.as_ref() != Some(&destination) {
            self.preview = Some(destination);
            self.route = None;
            self.epoch += 1;
        }
        Ok(())
    }

    pub async fn start(
        &mut self,
        destination: Option<Destination>,
        fix: Option<&PositionSample>,
    ) -> Result<String, AppError> {
        if self.phase.is_open() {
            return Err(AppError::invalid_transition(self.phase, TripPhase::Active));
        }
        let destination = destination
            .or_else(|| self.preview.clone())
            .ok_or_else(|| AppError::precondition("destination is not set"))?;
        let fix = fix.ok_or_else(|| AppError::precondition("current position is unavailable"))?;
        let now = self.clock.now();
        if fix.is_stale(now, self.max_fix_age) {
            return Err(AppError::precondition(
                "current position is too old to start a trip",
            ));
        }

        let new_trip = NewTrip {
            user_id: self.user_id.clone(),
            destination: destination.clone(),
            start: fix.coords,
            started_at: now,
        };
        let trip_id = self.store.create_trip(&new_trip).await?;

        info!(user_id = %self.user_id, trip_id = %trip_id, destination = %destination.display_name, "trip started");
        if self.preview.as_ref() != Some(&destination) {
            self.route = None;
        }
        self.phase = TripPhase::Active;
        self.trip_id = Some(trip_id.clone());
        self.destination = Some(destination);
        self.preview = None;
        self.epoch += 1;
        Ok(trip_id)
    }

    /// Rebuilds state from a persisted open trip. Persisted state wins over any
    /// preview destination. With no open trip on record the state is unchanged.
    pub async fn restore(&mut self) -> Result<TripPhase, AppError> {
        let Some(trip) = self.store.get_active_trip(&self.user_id).await? else {
            return Ok(self.phase);
        };
        if !trip.status.is_open() {
            return Ok(self.phase);
        }
        info!(user_id = %self.user_id, trip_id = %trip.id, status = %trip.status, "trip restored");
        self.phase = trip.status.into();
        self.destination = trip.resolved_destination();
        self.trip_id = Some(trip.id);
        self.preview = None;
        self.route = None;
        self.epoch += 1;
        Ok(self.phase)
    }

    fn ensure_can_move_to(&self, to: TripStatus) -> Result<(), AppError> {
        match self.phase.status() {
            Some(status) => status.validate_transition(to),
            None => Err(AppError::invalid_transition(self.phase, to)),
        }
    }

    /// Active → Emergency. Already in Emergency is a no-op.
    pub fn trigger_emergency(&mut self) -> Result<Transition, AppError> {
        self.ensure_can_move_to(TripStatus::Emergency)?;
        let from = self.phase;
        if from == TripPhase::Emergency {
            return Ok(Transition::Unchanged(from));
        }
        self.phase = TripPhase::Emergency;
        warn!(user_id = %self.user_id, trip_id = ?self.trip_id, "trip entered emergency");
        Ok(Transition::Changed {
            from,
            to: self.phase,
        })
    }

    /// Closes the open trip and returns its id. The status write is
    /// best-effort: a failure is logged and the local transition stands.
    pub async fn complete(&mut self) -> Result<String, AppError> {
        self.ensure_can_move_to(TripStatus::Completed)?;
        let trip_id = self
            .trip_id
            .take()
            .ok_or_else(|| AppError::Other(anyhow::anyhow!("open trip without an id")))?;
        self.phase = TripPhase::Completed;
        self.destination = None;
        self.preview = None;
        self.route = None;
        self.epoch += 1;

        let now = self.clock.now();
        match self
            .store
            .update_trip_status(&trip_id, TripStatus::Completed, now)
            .await
        {
            Ok(()) => info!(user_id = %self.user_id, trip_id = %trip_id, "trip completed"),
            Err(err) => {
                warn!(user_id = %self.user_id, trip_id = %trip_id, "completion not confirmed by persistence: {err}")
            }
        }
        Ok(trip_id)
    }

    /// Stores a resolved route if it still belongs to the current epoch.
    pub fn apply_route(&mut self, epoch: u64, route: Option<Route>) -> bool {
        if epoch != self.epoch {
            return false;
        }
        self.route = route;
        true
    }
}
