use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    clock::{elapsed_between, Clock},
    models::position::PositionSample,
    services::store::TripStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoActiveTrip,
    StaleFix,
    WithinInterval,
    /// Captured before a fix that was already sent for persistence.
    OutOfOrder,
}

pub enum ThrottleDecision {
    Persist(PendingWrite),
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Persisted { completed_at: DateTime<Utc> },
    Failed,
    /// The trip ended or changed before the write could count.
    Discarded,
}

#[derive(Default)]
struct ThrottleState {
    trip_id: Option<String>,
    last_persisted_at: Option<DateTime<Utc>>,
    last_issued_capture: Option<DateTime<Utc>>,
    in_flight: Option<InFlight>,
    writes_approved: u64,
    writes_issued: u64,
}

/// Approval time of the newest write not yet settled.
#[derive(Clone, Copy)]
struct InFlight {
    seq: u64,
    since: DateTime<Utc>,
}

struct ThrottleInner {
    store: Arc<dyn TripStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    max_sample_age: Duration,
    state: Mutex<ThrottleState>,
}

/// Decides which samples reach persistence.
///
/// Every sample still goes to the UI; this only bounds the write cadence. The
/// watermark moves on write completion, so a failed write is retried by the
/// next sample. A write still in flight holds the gate for one interval from
/// its approval.
#[derive(Clone)]
pub struct LocationThrottle {
    inner: Arc<ThrottleInner>,
}

impl LocationThrottle {
    pub fn new(
        store: Arc<dyn TripStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        max_sample_age: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                store,
                clock,
                interval,
                max_sample_age,
                state: Mutex::new(ThrottleState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ThrottleState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Points the throttle at a trip. Changing trips resets the watermark.
    pub fn set_trip(&self, trip_id: Option<String>) {
        let mut state = self.state();
        if state.trip_id != trip_id {
            *state = ThrottleState {
                trip_id,
                ..ThrottleState::default()
            };
        }
    }

    pub fn active_trip(&self) -> Option<String> {
        self.state().trip_id.clone()
    }

    pub fn last_persisted_at(&self) -> Option<DateTime<Utc>> {
        self.state().last_persisted_at
    }

    pub fn writes_issued(&self) -> u64 {
        self.state().writes_issued
    }

    pub fn on_sample(&self, sample: &PositionSample) -> ThrottleDecision {
        let now = self.inner.clock.now();
        let mut state = self.state();
        let Some(trip_id) = state.trip_id.clone() else {
            return ThrottleDecision::Skip(SkipReason::NoActiveTrip);
        };
        if let Err(err) = sample.ensure_fresh(now, self.inner.max_sample_age) {
            debug!(trip_id = %trip_id, "kept out of persistence: {err}");
            return ThrottleDecision::Skip(SkipReason::StaleFix);
        }
        let gate = [
            state.last_persisted_at,
            state.in_flight.map(|pending| pending.since),
        ];
        if gate
            .into_iter()
            .flatten()
            .any(|at| elapsed_between(at, now) < self.inner.interval)
        {
            return ThrottleDecision::Skip(SkipReason::WithinInterval);
        }
        if state
            .last_issued_capture
            .is_some_and(|issued| sample.captured_at <= issued)
        {
            return ThrottleDecision::Skip(SkipReason::OutOfOrder);
        }
        state.last_issued_capture = Some(sample.captured_at);
        state.writes_approved += 1;
        let seq = state.writes_approved;
        state.in_flight = Some(InFlight { seq, since: now });
        ThrottleDecision::Persist(PendingWrite {
            throttle: self.clone(),
            trip_id,
            seq,
            sample: *sample,
        })
    }
}

/// A location write the throttle has approved but not yet issued.
pub struct PendingWrite {
    throttle: LocationThrottle,
    trip_id: String,
    seq: u64,
    sample: PositionSample,
}

impl PendingWrite {
    fn owns_trip(&self, state: &ThrottleState) -> bool {
        state.trip_id.as_deref() == Some(self.trip_id.as_str())
    }

    fn settle(&self, state: &mut ThrottleState) {
        if state.in_flight.is_some_and(|pending| pending.seq == self.seq) {
            state.in_flight = None;
        }
    }

    pub async fn execute(self) -> WriteOutcome {
        let inner = &self.throttle.inner;
        {
            let mut state = self.throttle.state();
            if !self.owns_trip(&state) {
                return WriteOutcome::Discarded;
            }
            state.writes_issued += 1;
        }

        let result = inner
            .store
            .update_trip_location(&self.trip_id, self.sample.coords, self.sample.captured_at)
            .await;

        match result {
            Ok(()) => {
                let completed_at = inner.clock.now();
                let mut state = self.throttle.state();
                if !self.owns_trip(&state) {
                    return WriteOutcome::Discarded;
                }
                self.settle(&mut state);
                if state.last_persisted_at.map_or(true, |last| last < completed_at) {
                    state.last_persisted_at = Some(completed_at);
                }
                debug!(trip_id = %self.trip_id, "location persisted");
                WriteOutcome::Persisted { completed_at }
            }
            Err(err) => {
                let mut state = self.throttle.state();
                if !self.owns_trip(&state) {
                    return WriteOutcome::Discarded;
                }
                self.settle(&mut state);
                warn!(trip_id = %self.trip_id, "location write failed, retrying next sample: {err}");
                WriteOutcome::Failed
            }
        }
    }
}
