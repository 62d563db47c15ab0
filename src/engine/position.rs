use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::{
    config::MonitorConfig,
    error::AppError,
    models::position::{PositionError, PositionErrorKind, PositionSample},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionOptions {
    pub high_accuracy: bool,
    pub timeout: Duration,
    pub max_sample_age: Duration,
}

impl From<&MonitorConfig> for PositionOptions {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            high_accuracy: config.high_accuracy,
            timeout: config.position_timeout,
            max_sample_age: config.max_sample_age,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Sample(PositionSample),
    Error(PositionError),
}

/// A continuous location stream.
///
/// Events are delivered into `sink` until the returned [`Subscription`] is
/// cancelled or dropped. Delivery may continue after an error.
pub trait PositionSource: Send + Sync {
    fn subscribe(
        &self,
        options: PositionOptions,
        sink: mpsc::Sender<PositionEvent>,
    ) -> Result<Subscription, AppError>;
}

/// Handle to a live position subscription. Cancelling releases the device.
pub struct Subscription {
    active: Arc<AtomicBool>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(active: Arc<AtomicBool>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            active,
            release: Some(Box::new(release)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stops all further delivery before returning.
    pub fn cancel(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Delivered,
    /// The consumer is behind; the event was dropped rather than blocking the device.
    Dropped,
    /// Repeat report of a failure already delivered.
    Suppressed,
    NoSubscriber,
}

struct Subscriber {
    id: u64,
    sink: mpsc::Sender<PositionEvent>,
    active: Arc<AtomicBool>,
    options: PositionOptions,
    last_error: Option<PositionErrorKind>,
}

/// Position source fed by a device pushing fixes in, e.g. over HTTP.
#[derive(Clone, Default)]
pub struct PushPositionSource {
    slot: Arc<Mutex<Option<Subscriber>>>,
    next_id: Arc<AtomicU64>,
}

impl PushPositionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_subscriber(&self) -> bool {
        self.slot
            .lock()
            .map(|slot| {
                slot.as_ref()
                    .is_some_and(|sub| sub.active.load(Ordering::SeqCst))
            })
            .unwrap_or(false)
    }

    pub fn options(&self) -> Option<PositionOptions> {
        self.slot
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|sub| sub.options))
    }

    pub fn push_sample(&self, sample: PositionSample) -> Delivery {
        let Ok(mut slot) = self.slot.lock() else {
            return Delivery::NoSubscriber;
        };
        let Some(sub) = slot.as_mut() else {
            return Delivery::NoSubscriber;
        };
        sub.last_error = None;
        Self::deliver(sub, PositionEvent::Sample(sample))
    }

    /// Reports a failure once; repeats of the same failure are suppressed until a
    /// sample arrives.
    pub fn push_error(&self, error: PositionError) -> Delivery {
        let Ok(mut slot) = self.slot.lock() else {
            return Delivery::NoSubscriber;
        };
        let Some(sub) = slot.as_mut() else {
            return Delivery::NoSubscriber;
        };
        if sub.last_error == Some(error.kind) {
            return Delivery::Suppressed;
        }
        sub.last_error = Some(error.kind);
        Self::deliver(sub, PositionEvent::Error(error))
    }

    fn deliver(sub: &Subscriber, event: PositionEvent) -> Delivery {
        if !sub.active.load(Ordering::SeqCst) {
            return Delivery::NoSubscriber;
        }
        match sub.sink.try_send(event) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                debug!(subscription = sub.id, "position channel full, dropping event");
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::NoSubscriber,
        }
    }
}

impl PositionSource for PushPositionSource {
    fn subscribe(
        &self,
        options: PositionOptions,
        sink: mpsc::Sender<PositionEvent>,
    ) -> Result<Subscription, AppError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| AppError::Other(anyhow::anyhow!("position source lock poisoned")))?;
        if slot
            .as_ref()
            .is_some_and(|sub| sub.active.load(Ordering::SeqCst) && !sub.sink.is_closed())
        {
            return Err(AppError::precondition(
                "position source already has an active subscription",
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let active = Arc::new(AtomicBool::new(true));
        *slot = Some(Subscriber {
            id,
            sink,
            active: active.clone(),
            options,
            last_error: None,
        });

        let release_slot = self.slot.clone();
        Ok(Subscription::new(active, move || {
            if let Ok(mut slot) = release_slot.lock() {
                if slot.as_ref().is_some_and(|sub| sub.id == id) {
                    *slot = None;
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::position::Coordinates;
    use chrono::Utc;

    fn options() -> PositionOptions {
        PositionOptions::from(&MonitorConfig::default())
    }

    fn sample(lat: f64) -> PositionSample {
        PositionSample::new(Coordinates { lat, lng: 0.0 }, Utc::now())
    }

    #[tokio::test]
    async fn delivers_until_cancelled() {
        let source = PushPositionSource::new();
        let (tx, mut rx) = mpsc::channel(4);
        let mut sub = source.subscribe(options(), tx).unwrap();

        assert_eq!(source.push_sample(sample(1.0)), Delivery::Delivered);
        assert!(matches!(rx.recv().await, Some(PositionEvent::Sample(_))));

        sub.cancel();
        assert!(!sub.is_active());
        assert!(!source.has_subscriber());
        assert_eq!(source.push_sample(sample(2.0)), Delivery::NoSubscriber);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn only_one_live_subscription() {
        let source = PushPositionSource::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        let first = source.subscribe(options(), tx1).unwrap();
        assert!(matches!(
            source.subscribe(options(), tx2.clone()),
            Err(AppError::Precondition(_))
        ));
        drop(first);
        assert!(source.subscribe(options(), tx2).is_ok());
    }

    #[tokio::test]
    async fn repeated_failure_is_reported_once() {
        let source = PushPositionSource::new();
        let (tx, mut rx) = mpsc::channel(8);
        let _sub = source.subscribe(options(), tx).unwrap();
        let err = PositionError {
            kind: PositionErrorKind::Unavailable,
            message: "no satellites".into(),
        };
        assert_eq!(source.push_error(err.clone()), Delivery::Delivered);
        assert_eq!(source.push_error(err.clone()), Delivery::Suppressed);
        source.push_sample(sample(1.0));
        assert_eq!(source.push_error(err), Delivery::Delivered);

        let mut errors = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PositionEvent::Error(_)) {
                errors += 1;
            }
        }
        assert_eq!(errors, 2);
    }

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let source = PushPositionSource::new();
        let (tx, _rx) = mpsc::channel(1);
        let _sub = source.subscribe(options(), tx).unwrap();
        assert_eq!(source.push_sample(sample(1.0)), Delivery::Delivered);
        assert_eq!(source.push_sample(sample(2.0)), Delivery::Dropped);
    }
}
