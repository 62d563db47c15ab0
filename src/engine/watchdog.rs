use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::warn;

use crate::clock::{elapsed_between, Clock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InactivityAlert {
    pub last_activity: DateTime<Utc>,
    pub raised_at: DateTime<Utc>,
    pub silent_for: Duration,
}

struct WatchdogState {
    last_activity: DateTime<Utc>,
    alerted: bool,
}

/// Client-side silence detector.
///
/// Edge-triggered: one alert per silence period, re-armed by
/// [`record_activity`](Self::record_activity). It only sees local activity and
/// never consults the persisted `last_updated_at`.
pub struct InactivityWatchdog {
    clock: Arc<dyn Clock>,
    threshold: Duration,
    check_interval: Duration,
    state: Mutex<WatchdogState>,
}

impl InactivityWatchdog {
    pub fn new(clock: Arc<dyn Clock>, threshold: Duration, check_interval: Duration) -> Self {
        let now = clock.now();
        Self {
            clock,
            threshold,
            check_interval,
            state: Mutex::new(WatchdogState {
                last_activity: now,
                alerted: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, WatchdogState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_activity(&self) {
        let now = self.clock.now();
        let mut state = self.state();
        state.last_activity = now;
        state.alerted = false;
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.state().last_activity
    }

    pub fn is_alerting(&self) -> bool {
        self.state().alerted
    }

    pub fn check(&self) -> Option<InactivityAlert> {
        let now = self.clock.now();
        let mut state = self.state();
        let silent_for = elapsed_between(state.last_activity, now);
        if state.alerted || silent_for < self.threshold {
            return None;
        }
        state.alerted = true;
        warn!(silent_secs = silent_for.as_secs(), "inactivity threshold crossed");
        Some(InactivityAlert {
            last_activity: state.last_activity,
            raised_at: now,
            silent_for,
        })
    }

    /// Runs [`check`](Self::check) every check interval until the receiver
    /// goes away or the task is aborted.
    pub fn spawn(self: &Arc<Self>, alerts: mpsc::Sender<InactivityAlert>) -> JoinHandle<()> {
        let watchdog = Arc::clone(self);
        tokio::spawn(async move {
            let period = watchdog.check_interval;
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Some(alert) = watchdog.check() {
                    if alerts.send(alert).await.is_err() {
                        break;
                    }
                }
            }
        })
    }
}
