use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::debug;

use crate::{
    config::MonitorConfig,
    engine::{
        monitor::{MonitorServices, TripMonitor},
        position::PushPositionSource,
    },
};

/// A user's monitor together with the feed their device pushes into.
#[derive(Clone)]
pub struct MonitorHandle {
    pub monitor: TripMonitor,
    pub feed: PushPositionSource,
}

/// One monitor per user, created on first use.
#[derive(Clone)]
pub struct MonitorRegistry {
    config: MonitorConfig,
    services: MonitorServices,
    monitors: Arc<Mutex<HashMap<String, MonitorHandle>>>,
}

impl MonitorRegistry {
    pub fn new(config: MonitorConfig, services: MonitorServices) -> Self {
        Self {
            config,
            services,
            monitors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get(&self, user_id: &str) -> Option<MonitorHandle> {
        self.monitors
            .lock()
            .ok()
            .and_then(|monitors| monitors.get(user_id).cloned())
    }

    pub fn get_or_create(&self, user_id: &str, user_name: &str) -> MonitorHandle {
        let mut monitors = self
            .monitors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        monitors
            .entry(user_id.to_string())
            .or_insert_with(|| {
                debug!(user_id, "creating trip monitor");
                let feed = PushPositionSource::new();
                let monitor = TripMonitor::new(
                    user_id,
                    user_name,
                    self.config.clone(),
                    self.services.clone(),
                    Arc::new(feed.clone()),
                );
                MonitorHandle { monitor, feed }
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.monitors.lock().map(|monitors| monitors.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops tracking for every monitor. Used on shutdown.
    pub fn close_all(&self) {
        if let Ok(monitors) = self.monitors.lock() {
            for handle in monitors.values() {
                handle.monitor.stop_tracking();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::SystemClock,
        engine::testing::{FakeNotifier, FakeRouter, FakeStore},
    };

    fn registry() -> MonitorRegistry {
        MonitorRegistry::new(
            MonitorConfig::default(),
            MonitorServices {
                store: Arc::new(FakeStore::default()),
                router: Arc::new(FakeRouter::returning(None)),
                notifier: Arc::new(FakeNotifier::default()),
                clock: Arc::new(SystemClock),
            },
        )
    }

    #[tokio::test]
    async fn one_monitor_per_user() {
        let registry = registry();
        let first = registry.get_or_create("u1", "Asha");
        first.monitor.ensure_tracking().unwrap();
        let again = registry.get_or_create("u1", "Asha");
        assert!(again.feed.has_subscriber());
        registry.get_or_create("u2", "Ben");
        assert_eq!(registry.len(), 2);
        assert!(registry.get("u3").is_none());

        registry.close_all();
        assert!(!first.feed.has_subscriber());
    }
}
