use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};

use serde::Serialize;
use tokio::{
    sync::{mpsc, watch, Mutex as AsyncMutex},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    config::MonitorConfig,
    engine::{
        lifecycle::{Transition, TripLifecycle, TripPhase},
        position::{PositionEvent, PositionOptions, PositionSource, Subscription},
        route::RouteResolver,
        sos::{SosDispatcher, SosReport, SosRequest},
        throttle::{LocationThrottle, ThrottleDecision},
        watchdog::{InactivityAlert, InactivityWatchdog},
    },
    error::AppError,
    models::{
        position::{Coordinates, GpsStatus, PositionError, PositionErrorKind, PositionSample},
        route::Route,
        sos::SosTrigger,
        trip::Destination,
    },
    services::{notifier::Notifier, routing::RoutingProvider, store::TripStore},
};

/// External collaborators shared by every monitor.
#[derive(Clone)]
pub struct MonitorServices {
    pub store: Arc<dyn TripStore>,
    pub router: Arc<dyn RoutingProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

/// Everything the UI renders for one user.
#[derive(Debug, Clone, Serialize)]
pub struct LiveView {
    pub phase: TripPhase,
    pub trip_id: Option<String>,
    pub destination: Option<Destination>,
    pub route: Option<Route>,
    pub position: Option<PositionSample>,
    pub position_stale: bool,
    pub gps: GpsStatus,
    pub inactivity_warning: Option<InactivityAlert>,
    pub last_sos: Option<SosReport>,
}

impl LiveView {
    fn new() -> Self {
        Self {
            phase: TripPhase::NotStarted,
            trip_id: None,
            destination: None,
            route: None,
            position: None,
            position_stale: false,
            gps: GpsStatus::Searching,
            inactivity_warning: None,
            last_sos: None,
        }
    }
}

#[derive(Default)]
struct Tracking {
    subscription: Option<Subscription>,
    pump: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    alerts: Option<mpsc::Sender<InactivityAlert>>,
}

/// Lifecycle fields the processing loop reads without waiting on the
/// lifecycle lock. Refreshed on every publish.
#[derive(Clone, Copy)]
struct PhaseSnapshot {
    phase: TripPhase,
    epoch: u64,
    destination: Option<Coordinates>,
}

impl PhaseSnapshot {
    fn of(lifecycle: &TripLifecycle) -> Self {
        Self {
            phase: lifecycle.phase(),
            epoch: lifecycle.epoch(),
            destination: lifecycle.destination().map(|destination| destination.coords),
        }
    }
}

struct MonitorInner {
    user_id: String,
    user_name: String,
    config: MonitorConfig,
    store: Arc<dyn TripStore>,
    clock: Arc<dyn Clock>,
    source: Arc<dyn PositionSource>,
    lifecycle: AsyncMutex<TripLifecycle>,
    snapshot: Mutex<PhaseSnapshot>,
    throttle: LocationThrottle,
    resolver: RouteResolver,
    watchdog: Arc<InactivityWatchdog>,
    sos: SosDispatcher,
    view: watch::Sender<LiveView>,
    tracking: Mutex<Tracking>,
    routing: AtomicBool,
}

/// Wires the engine components together for a single user session.
///
/// One processing loop drains the position channel and the watchdog alerts;
/// persistence writes and route lookups run on their own tasks.
#[derive(Clone)]
pub struct TripMonitor {
    inner: Arc<MonitorInner>,
}

impl TripMonitor {
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        config: MonitorConfig,
        services: MonitorServices,
        source: Arc<dyn PositionSource>,
    ) -> Self {
        let user_id = user_id.into();
        let MonitorServices {
            store,
            router,
            notifier,
            clock,
        } = services;
        let lifecycle = TripLifecycle::new(
            user_id.clone(),
            store.clone(),
            clock.clone(),
            config.max_sample_age,
        );
        let throttle = LocationThrottle::new(
            store.clone(),
            clock.clone(),
            config.throttle_interval,
            config.max_sample_age,
        );
        let watchdog = Arc::new(InactivityWatchdog::new(
            clock.clone(),
            config.inactivity_threshold,
            config.inactivity_check_interval,
        ));
        let (view, _) = watch::channel(LiveView::new());
        Self {
            inner: Arc::new(MonitorInner {
                user_name: user_name.into(),
                resolver: RouteResolver::new(router, config.route_min_movement_m),
                sos: SosDispatcher::new(store.clone(), notifier, clock.clone()),
                snapshot: Mutex::new(PhaseSnapshot::of(&lifecycle)),
                lifecycle: AsyncMutex::new(lifecycle),
                tracking: Mutex::new(Tracking::default()),
                routing: AtomicBool::new(false),
                user_id,
                config,
                store,
                clock,
                source,
                throttle,
                watchdog,
                view,
            }),
        }
    }

    pub fn view(&self) -> LiveView {
        self.inner.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<LiveView> {
        self.inner.view.subscribe()
    }

    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.inner
            .tracking
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking()
            .subscription
            .as_ref()
            .is_some_and(Subscription::is_active)
    }

    /// Subscribes to the position source unless a live subscription exists.
    pub fn ensure_tracking(&self) -> Result<(), AppError> {
        let mut tracking = self.tracking();
        if tracking
            .subscription
            .as_ref()
            .is_some_and(Subscription::is_active)
        {
            return Ok(());
        }
        drop(tracking.subscription.take());
        if let Some(pump) = tracking.pump.take() {
            pump.abort();
        }

        let capacity = self.inner.config.channel_capacity.max(1);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (alerts_tx, alerts_rx) = mpsc::channel(4);
        let options = PositionOptions::from(&self.inner.config);
        let subscription = self.inner.source.subscribe(options, events_tx)?;

        tracking.pump = Some(tokio::spawn(pump(self.clone(), events_rx, alerts_rx)));
        if let Some(old) = tracking.watchdog.take() {
            old.abort();
            tracking.watchdog = Some(self.inner.watchdog.spawn(alerts_tx.clone()));
        }
        tracking.subscription = Some(subscription);
        tracking.alerts = Some(alerts_tx);
        debug!(user_id = %self.inner.user_id, "position tracking started");
        Ok(())
    }

    fn arm_watchdog(&self) {
        self.inner.watchdog.record_activity();
        let mut tracking = self.tracking();
        if tracking
            .watchdog
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }
        if let Some(alerts) = tracking.alerts.clone() {
            tracking.watchdog = Some(self.inner.watchdog.spawn(alerts));
        }
    }

    /// Cancels the subscription and stops the loop and the watchdog timer
    /// before returning.
    pub fn stop_tracking(&self) {
        let mut tracking = self.tracking();
        if let Some(mut subscription) = tracking.subscription.take() {
            subscription.cancel();
        }
        for handle in [tracking.pump.take(), tracking.watchdog.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
        tracking.alerts = None;
        debug!(user_id = %self.inner.user_id, "position tracking stopped");
    }

    fn snapshot(&self) -> PhaseSnapshot {
        *self
            .inner
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, lifecycle: &TripLifecycle) {
        *self
            .inner
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = PhaseSnapshot::of(lifecycle);
        self.inner.view.send_modify(|view| {
            view.phase = lifecycle.phase();
            view.trip_id = lifecycle.trip_id().map(str::to_string);
            view.destination = lifecycle.destination().cloned();
            view.route = lifecycle.route().cloned();
        });
    }

    fn latest_fix(&self) -> Option<PositionSample> {
        self.inner.view.borrow().position
    }

    pub async fn restore(&self) -> Result<LiveView, AppError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let phase = lifecycle.restore().await?;
        if phase.is_open() {
            self.inner
                .throttle
                .set_trip(lifecycle.trip_id().map(str::to_string));
            self.inner.resolver.reset();
            if let Err(err) = self.ensure_tracking() {
                warn!(user_id = %self.inner.user_id, "could not resume position tracking: {err}");
            }
            self.arm_watchdog();
        }
        self.publish(&lifecycle);
        drop(lifecycle);
        self.kick_route();
        Ok(self.view())
    }

    pub async fn set_destination(&self, destination: Destination) -> Result<LiveView, AppError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        lifecycle.set_preview_destination(destination)?;
        self.inner.resolver.reset();
        self.publish(&lifecycle);
        drop(lifecycle);
        self.kick_route();
        Ok(self.view())
    }

    /// Starts a trip from the latest delivered fix.
    pub async fn start(&self, destination: Option<Destination>) -> Result<LiveView, AppError> {
        let fix = self.latest_fix();
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let trip_id = lifecycle.start(destination, fix.as_ref()).await?;
        self.inner.throttle.set_trip(Some(trip_id));
        self.inner.resolver.reset();
        if let Err(err) = self.ensure_tracking() {
            warn!(user_id = %self.inner.user_id, "could not start position tracking: {err}");
        }
        self.arm_watchdog();
        self.publish(&lifecycle);
        drop(lifecycle);
        self.inner.view.send_modify(|view| {
            view.inactivity_warning = None;
            view.last_sos = None;
        });
        self.kick_route();
        Ok(self.view())
    }

    pub async fn check_in(&self) -> Result<LiveView, AppError> {
        if !self.snapshot().phase.is_open() {
            return Err(AppError::precondition("no trip in progress"));
        }
        self.inner.watchdog.record_activity();
        self.inner
            .view
            .send_modify(|view| view.inactivity_warning = None);
        info!(user_id = %self.inner.user_id, "user checked in");
        Ok(self.view())
    }

    /// Raises an SOS at the latest known position, with or without a trip.
    pub async fn trigger_sos(&self, trigger: SosTrigger) -> Result<SosReport, AppError> {
        let coordinates = match self.latest_fix() {
            Some(fix) => fix.coords,
            None => self.persisted_position().await?,
        };
        let trip_id = {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            let trip_id = if lifecycle.phase().is_open() {
                match lifecycle.trigger_emergency()? {
                    Transition::Changed { from, to } => {
                        info!(user_id = %self.inner.user_id, %from, %to, "trip escalated")
                    }
                    Transition::Unchanged(phase) => {
                        debug!(user_id = %self.inner.user_id, %phase, "trip already escalated")
                    }
                }
                lifecycle.trip_id().map(str::to_string)
            } else {
                None
            };
            self.publish(&lifecycle);
            trip_id
        };
        let contacts = match self.inner.store.list_contacts(&self.inner.user_id).await {
            Ok(contacts) => contacts,
            Err(err) => {
                warn!(user_id = %self.inner.user_id, "contacts unavailable, alerting without them: {err}");
                Vec::new()
            }
        };

        let report = self
            .inner
            .sos
            .trigger(SosRequest {
                trip_id,
                user_id: self.inner.user_id.clone(),
                user_name: self.inner.user_name.clone(),
                coordinates,
                contacts,
                trigger,
            })
            .await?;
        self.inner
            .view
            .send_modify(|view| view.last_sos = Some(report.clone()));
        Ok(report)
    }

    async fn persisted_position(&self) -> Result<Coordinates, AppError> {
        self.inner
            .store
            .get_active_trip(&self.inner.user_id)
            .await?
            .map(|trip| trip.current)
            .ok_or_else(|| AppError::precondition("no known position to send"))
    }

    /// Ends the open trip. Tracking stops before the status write is issued.
    pub async fn complete(&self) -> Result<String, AppError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let phase = lifecycle.phase();
        if !phase.is_open() {
            return Err(AppError::invalid_transition(phase, TripPhase::Completed));
        }
        self.stop_tracking();
        self.inner.throttle.set_trip(None);
        self.inner.resolver.reset();
        let trip_id = lifecycle.complete().await?;
        self.publish(&lifecycle);
        drop(lifecycle);
        self.inner.view.send_modify(|view| {
            view.gps = GpsStatus::Searching;
            view.inactivity_warning = None;
        });
        Ok(trip_id)
    }

    fn on_sample(&self, sample: PositionSample) {
        let now = self.inner.clock.now();
        let stale = sample.is_stale(now, self.inner.config.max_sample_age);
        self.inner.view.send_modify(|view| {
            view.position = Some(sample);
            view.position_stale = stale;
            view.gps = GpsStatus::Active;
            if !stale {
                view.inactivity_warning = None;
            }
        });
        if stale {
            debug!(user_id = %self.inner.user_id, age = ?sample.age_at(now), "stale fix");
            return;
        }
        self.inner.watchdog.record_activity();
        if let ThrottleDecision::Persist(write) = self.inner.throttle.on_sample(&sample) {
            tokio::spawn(write.execute());
        }
        self.refresh_route(sample.coords);
    }

    fn on_position_error(&self, error: PositionError) {
        warn!(user_id = %self.inner.user_id, kind = ?error.kind, "position error: {}", error.message);
        self.inner.view.send_modify(|view| {
            let consecutive_errors = match &view.gps {
                GpsStatus::Error {
                    consecutive_errors, ..
                } => consecutive_errors + 1,
                _ => 1,
            };
            view.gps = GpsStatus::Error {
                message: error.message,
                consecutive_errors,
            };
        });
    }

    fn on_inactivity(&self, alert: InactivityAlert) {
        self.inner
            .view
            .send_modify(|view| view.inactivity_warning = Some(alert));
        if !self.inner.config.auto_sos_on_inactivity {
            return;
        }
        if self.snapshot().phase != TripPhase::Active {
            return;
        }
        let monitor = self.clone();
        tokio::spawn(async move {
            if let Err(err) = monitor.trigger_sos(SosTrigger::Inactivity).await {
                error!(user_id = %monitor.inner.user_id, "automatic SOS failed: {err}");
            }
        });
    }

    fn kick_route(&self) {
        if let Some(fix) = self.latest_fix() {
            self.refresh_route(fix.coords);
        }
    }

    fn refresh_route(&self, origin: Coordinates) {
        let PhaseSnapshot {
            epoch,
            destination: Some(destination),
            ..
        } = self.snapshot()
        else {
            return;
        };
        if !self.inner.resolver.needs_resolution(origin, destination) {
            return;
        }
        if self.inner.routing.swap(true, Ordering::SeqCst) {
            return;
        }
        let monitor = self.clone();
        tokio::spawn(async move {
            let route = monitor.inner.resolver.resolve(origin, destination).await;
            monitor.inner.routing.store(false, Ordering::SeqCst);
            let mut lifecycle = monitor.inner.lifecycle.lock().await;
            if lifecycle.apply_route(epoch, route) {
                monitor.publish(&lifecycle);
            } else {
                debug!(user_id = %monitor.inner.user_id, "route result superseded, discarded");
                monitor.inner.resolver.reset();
            }
        });
    }
}

async fn pump(
    monitor: TripMonitor,
    mut events: mpsc::Receiver<PositionEvent>,
    mut alerts: mpsc::Receiver<InactivityAlert>,
) {
    let timeout = monitor.inner.config.position_timeout;
    let deadline = time::sleep(timeout);
    tokio::pin!(deadline);
    let mut timed_out = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                deadline.as_mut().reset(Instant::now() + timeout);
                match event {
                    Some(PositionEvent::Sample(sample)) => {
                        timed_out = false;
                        monitor.on_sample(sample);
                    }
                    Some(PositionEvent::Error(error)) => monitor.on_position_error(error),
                    None => break,
                }
            }
            () = &mut deadline, if !timed_out => {
                timed_out = true;
                monitor.on_position_error(PositionError {
                    kind: PositionErrorKind::Timeout,
                    message: format!("no position within {} ms", timeout.as_millis()),
                });
            }
            Some(alert) = alerts.recv() => monitor.on_inactivity(alert),
        }
    }
    debug!(user_id = %monitor.inner.user_id, "position stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        engine::{
            position::{Delivery, PushPositionSource},
            testing::{sample_route, FakeNotifier, FakeRouter, FakeStore},
        },
        models::trip::{Trip, TripStatus},
    };
    use chrono::Utc;
    use std::time::Duration;

    struct Fixture {
        monitor: TripMonitor,
        feed: PushPositionSource,
        store: Arc<FakeStore>,
        notifier: Arc<FakeNotifier>,
        clock: ManualClock,
    }

    fn fixture(config: MonitorConfig) -> Fixture {
        let store = Arc::new(FakeStore::default());
        let notifier = Arc::new(FakeNotifier::default());
        let clock = ManualClock::new(Utc::now());
        let feed = PushPositionSource::new();
        let services = MonitorServices {
            store: store.clone(),
            router: Arc::new(FakeRouter::returning(Some(sample_route()))),
            notifier: notifier.clone(),
            clock: Arc::new(clock.clone()),
        };
        let monitor = TripMonitor::new("u1", "Asha", config, services, Arc::new(feed.clone()));
        Fixture {
            monitor,
            feed,
            store,
            notifier,
            clock,
        }
    }

    fn plaza() -> Destination {
        Destination {
            display_name: "Central Plaza".into(),
            coords: Coordinates { lat: 12.97, lng: 77.59 },
        }
    }

    impl Fixture {
        fn push_fix(&self, lat: f64) -> Delivery {
            self.feed.push_sample(PositionSample::new(
                Coordinates { lat, lng: 77.5 },
                self.clock.now(),
            ))
        }

        async fn wait_for(&self, cond: impl Fn(&LiveView) -> bool) -> LiveView {
            let mut rx = self.monitor.watch();
            let view = time::timeout(Duration::from_secs(2), rx.wait_for(|view| cond(view)))
                .await
                .expect("view condition in time")
                .expect("monitor alive");
            LiveView::clone(&view)
        }

        async fn started(config: MonitorConfig) -> Self {
            let fx = fixture(config);
            fx.monitor.ensure_tracking().unwrap();
            assert_eq!(fx.push_fix(12.9), Delivery::Delivered);
            fx.wait_for(|view| view.position.is_some()).await;
            fx.monitor.start(Some(plaza())).await.unwrap();
            fx
        }
    }

    async fn eventually(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn start_needs_a_fix() {
        let fx = fixture(MonitorConfig::default());
        let err = fx.monitor.start(Some(plaza())).await;
        assert!(matches!(err, Err(AppError::Precondition(_))));
        assert_eq!(fx.monitor.view().phase, TripPhase::NotStarted);
    }

    #[tokio::test]
    async fn started_trip_persists_fixes_and_gets_a_route() {
        let fx = Fixture::started(MonitorConfig::default()).await;
        assert_eq!(fx.monitor.view().phase, TripPhase::Active);
        assert!(fx.monitor.is_tracking());

        fx.clock.advance(Duration::from_secs(1));
        fx.push_fix(12.91);
        eventually(|| fx.store.location_write_count() == 1).await;

        let view = fx.wait_for(|view| view.route.is_some()).await;
        assert_eq!(view.route, Some(sample_route()));
        assert_eq!(view.gps, GpsStatus::Active);
    }

    #[tokio::test]
    async fn complete_cancels_tracking_and_stops_writes() {
        let fx = Fixture::started(MonitorConfig::default()).await;
        let trip_id = fx.monitor.complete().await.unwrap();

        assert!(!fx.monitor.is_tracking());
        assert!(!fx.feed.has_subscriber());
        fx.clock.advance(Duration::from_secs(30));
        assert_eq!(fx.push_fix(13.0), Delivery::NoSubscriber);

        let view = fx.monitor.view();
        assert_eq!(view.phase, TripPhase::Completed);
        assert_eq!(view.trip_id, None);
        assert_eq!(view.destination, None);
        assert_eq!(view.route, None);
        assert_eq!(fx.store.status_of(&trip_id), Some(TripStatus::Completed));
        assert!(fx
            .store
            .location_writes
            .lock()
            .unwrap()
            .iter()
            .all(|(id, _, _)| id != &trip_id));
    }

    #[tokio::test]
    async fn sos_marks_emergency_and_repeats_stay_in_emergency() {
        let fx = Fixture::started(MonitorConfig::default()).await;
        let first = fx.monitor.trigger_sos(SosTrigger::Manual).await.unwrap();
        let second = fx.monitor.trigger_sos(SosTrigger::Manual).await.unwrap();

        assert_eq!(first.alert.trip_id, second.alert.trip_id);
        assert_eq!(fx.monitor.view().phase, TripPhase::Emergency);
        assert_eq!(fx.store.alerts.lock().unwrap().len(), 2);
        assert!(fx.notifier.sent.lock().unwrap().is_empty());
        assert!(fx.monitor.view().last_sos.is_some());
    }

    #[tokio::test]
    async fn sos_without_any_position_is_refused() {
        let fx = fixture(MonitorConfig::default());
        assert!(matches!(
            fx.monitor.trigger_sos(SosTrigger::Manual).await,
            Err(AppError::Precondition(_))
        ));
        assert!(fx.store.alerts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn position_errors_surface_without_ending_the_stream() {
        let fx = fixture(MonitorConfig::default());
        fx.monitor.ensure_tracking().unwrap();
        fx.feed.push_error(PositionError {
            kind: PositionErrorKind::PermissionDenied,
            message: "denied".into(),
        });
        let view = fx
            .wait_for(|view| matches!(view.gps, GpsStatus::Error { .. }))
            .await;
        assert_eq!(
            view.gps,
            GpsStatus::Error {
                message: "denied".into(),
                consecutive_errors: 1
            }
        );

        fx.push_fix(12.9);
        fx.wait_for(|view| view.gps == GpsStatus::Active).await;
        assert!(fx.monitor.is_tracking());
    }

    #[tokio::test]
    async fn silence_raises_a_warning_that_check_in_clears() {
        let config = MonitorConfig {
            inactivity_check_interval: Duration::from_millis(10),
            ..MonitorConfig::default()
        };
        let fx = Fixture::started(config).await;
        fx.clock.advance(Duration::from_secs(20 * 60));
        fx.wait_for(|view| view.inactivity_warning.is_some()).await;
        assert!(fx.store.alerts.lock().unwrap().is_empty());

        let view = fx.monitor.check_in().await.unwrap();
        assert!(view.inactivity_warning.is_none());
    }

    #[tokio::test]
    async fn silence_can_raise_an_sos_on_its_own() {
        let config = MonitorConfig {
            inactivity_check_interval: Duration::from_millis(10),
            auto_sos_on_inactivity: true,
            ..MonitorConfig::default()
        };
        let fx = Fixture::started(config).await;
        fx.clock.advance(Duration::from_secs(20 * 60));
        fx.wait_for(|view| view.phase == TripPhase::Emergency).await;
        eventually(|| fx.store.alerts.lock().unwrap().len() == 1).await;
        let alerts = fx.store.alerts.lock().unwrap();
        assert_eq!(alerts[0].trigger, SosTrigger::Inactivity);
    }

    #[tokio::test]
    async fn restore_resumes_tracking_for_an_open_trip() {
        let fx = fixture(MonitorConfig::default());
        let now = fx.clock.now();
        fx.store.seed_trip(Trip {
            id: "t7".into(),
            user_id: "u1".into(),
            destination_name: "Home".into(),
            destination: Some(Coordinates { lat: 1.0, lng: 1.0 }),
            start: Coordinates { lat: 0.0, lng: 0.0 },
            current: Coordinates { lat: 0.2, lng: 0.2 },
            status: TripStatus::Emergency,
            started_at: now,
            last_updated_at: now,
            ended_at: None,
        });
        let view = fx.monitor.restore().await.unwrap();
        assert_eq!(view.phase, TripPhase::Emergency);
        assert_eq!(view.trip_id.as_deref(), Some("t7"));
        assert!(fx.feed.has_subscriber());

        let report = fx.monitor.trigger_sos(SosTrigger::Manual).await.unwrap();
        assert_eq!(report.alert.coordinates, Coordinates { lat: 0.2, lng: 0.2 });
    }

    fn seed_open_trip(fx: &Fixture) {
        let now = fx.clock.now();
        fx.store.seed_trip(Trip {
            id: "t9".into(),
            user_id: "u1".into(),
            destination_name: "Home".into(),
            destination: Some(Coordinates { lat: 1.0, lng: 1.0 }),
            start: Coordinates { lat: 0.0, lng: 0.0 },
            current: Coordinates { lat: 0.5, lng: 0.5 },
            status: TripStatus::Active,
            started_at: now,
            last_updated_at: now,
            ended_at: None,
        });
    }

    #[tokio::test]
    async fn fixes_reach_the_view_while_a_start_is_being_saved() {
        let fx = fixture(MonitorConfig::default());
        fx.monitor.ensure_tracking().unwrap();
        fx.push_fix(1.1);
        fx.wait_for(|view| view.position.is_some()).await;
        fx.monitor.set_destination(plaza()).await.unwrap();

        fx.store.set_delay(Duration::from_millis(300));
        let monitor = fx.monitor.clone();
        let starting = tokio::spawn(async move { monitor.start(None).await });
        time::sleep(Duration::from_millis(20)).await;
        fx.push_fix(1.2);
        let view = fx
            .wait_for(|view| view.position.is_some_and(|fix| fix.coords.lat == 1.2))
            .await;
        assert!(!starting.is_finished());
        assert_eq!(view.phase, TripPhase::NotStarted);

        let view = starting.await.unwrap().unwrap();
        assert_eq!(view.phase, TripPhase::Active);
    }

    #[tokio::test]
    async fn fixes_reach_the_view_while_a_trip_is_being_restored() {
        let fx = fixture(MonitorConfig::default());
        seed_open_trip(&fx);
        fx.monitor.ensure_tracking().unwrap();
        fx.push_fix(1.1);
        fx.wait_for(|view| view.position.is_some()).await;

        fx.store.set_delay(Duration::from_millis(300));
        let monitor = fx.monitor.clone();
        let restoring = tokio::spawn(async move { monitor.restore().await });
        time::sleep(Duration::from_millis(20)).await;
        fx.push_fix(1.2);
        fx.wait_for(|view| view.position.is_some_and(|fix| fix.coords.lat == 1.2))
            .await;
        assert!(!restoring.is_finished());

        let view = restoring.await.unwrap().unwrap();
        assert_eq!(view.phase, TripPhase::Active);
        assert_eq!(view.trip_id.as_deref(), Some("t9"));
    }

    #[tokio::test]
    async fn location_write_in_flight_when_completing_does_not_count() {
        let fx = Fixture::started(MonitorConfig::default()).await;
        fx.store.set_delay(Duration::from_millis(150));
        fx.clock.advance(Duration::from_secs(1));
        fx.push_fix(12.91);
        eventually(|| fx.monitor.inner.throttle.writes_issued() == 1).await;

        let trip_id = fx.monitor.complete().await.unwrap();
        eventually(|| fx.store.location_write_count() == 1).await;
        time::sleep(Duration::from_millis(10)).await;

        assert_eq!(fx.monitor.inner.throttle.last_persisted_at(), None);
        assert_eq!(fx.monitor.inner.throttle.active_trip(), None);
        assert_eq!(fx.store.status_of(&trip_id), Some(TripStatus::Completed));
        assert_eq!(fx.monitor.view().phase, TripPhase::Completed);
    }

    #[tokio::test]
    async fn position_timeout_is_reported_once_per_silence() {
        let config = MonitorConfig {
            position_timeout: Duration::from_millis(50),
            ..MonitorConfig::default()
        };
        let fx = fixture(config);
        fx.monitor.ensure_tracking().unwrap();
        fx.wait_for(|view| matches!(view.gps, GpsStatus::Error { .. }))
            .await;
        time::sleep(Duration::from_millis(200)).await;
        let GpsStatus::Error {
            consecutive_errors,
            message,
        } = fx.monitor.view().gps
        else {
            panic!("timeout should be reported");
        };
        assert_eq!(consecutive_errors, 1);
        assert!(message.contains("no position"));

        fx.push_fix(12.9);
        fx.wait_for(|view| view.gps == GpsStatus::Active).await;
    }

    #[tokio::test]
    async fn position_timeout_fires_while_inactivity_alerts_arrive() {
        let config = MonitorConfig {
            position_timeout: Duration::from_millis(200),
            inactivity_check_interval: Duration::from_millis(10),
            ..MonitorConfig::default()
        };
        let fx = Fixture::started(config).await;
        let began = Instant::now();
        while !matches!(fx.monitor.view().gps, GpsStatus::Error { .. }) {
            assert!(
                began.elapsed() < Duration::from_secs(2),
                "position timeout never reported"
            );
            fx.clock.advance(Duration::from_secs(20 * 60));
            fx.wait_for(|view| view.inactivity_warning.is_some()).await;
            fx.monitor.check_in().await.unwrap();
        }
        assert_eq!(fx.monitor.view().phase, TripPhase::Active);
    }
}
