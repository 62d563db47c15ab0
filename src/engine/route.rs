use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::{
    models::{position::Coordinates, route::Route},
    services::routing::RoutingProvider,
};

#[derive(Debug, Clone, Copy)]
struct ResolvedInputs {
    origin: Coordinates,
    destination: Coordinates,
}

/// Turns origin and destination into a displayable route.
///
/// Never fails: an unreachable provider or a missing route both come back as
/// `None`, since raw position and SOS keep working without a route.
pub struct RouteResolver {
    provider: Arc<dyn RoutingProvider>,
    min_movement_m: f64,
    last: Mutex<Option<ResolvedInputs>>,
}

impl RouteResolver {
    pub fn new(provider: Arc<dyn RoutingProvider>, min_movement_m: f64) -> Self {
        Self {
            provider,
            min_movement_m,
            last: Mutex::new(None),
        }
    }

    /// True when no answer exists yet for these inputs, the destination moved,
    /// or the origin drifted further than the configured distance.
    pub fn needs_resolution(&self, origin: Coordinates, destination: Coordinates) -> bool {
        let Ok(last) = self.last.lock() else {
            return true;
        };
        match *last {
            None => true,
            Some(prev) => {
                prev.destination != destination
                    || prev.origin.distance_to(origin) > self.min_movement_m
            }
        }
    }

    pub async fn resolve(&self, origin: Coordinates, destination: Coordinates) -> Option<Route> {
        match self.provider.route(origin, destination).await {
            Ok(route) => {
                if let Ok(mut last) = self.last.lock() {
                    *last = Some(ResolvedInputs {
                        origin,
                        destination,
                    });
                }
                if route.is_none() {
                    debug!(?origin, ?destination, "routing provider found no route");
                }
                route
            }
            Err(err) => {
                warn!("route resolution failed: {err}");
                None
            }
        }
    }

    pub fn reset(&self) {
        if let Ok(mut last) = self.last.lock() {
            *last = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{sample_route, FakeRouter};
    use std::sync::atomic::Ordering;

    const ORIGIN: Coordinates = Coordinates { lat: 0.0, lng: 0.0 };

    #[tokio::test]
    async fn not_found_is_none_not_an_error() {
        let router = Arc::new(FakeRouter::returning(None));
        let resolver = RouteResolver::new(router.clone(), 25.0);
        assert_eq!(resolver.resolve(ORIGIN, ORIGIN).await, None);
        assert_eq!(router.calls.load(Ordering::SeqCst), 1);
        assert!(!resolver.needs_resolution(ORIGIN, ORIGIN));
    }

    #[tokio::test]
    async fn unreachable_provider_is_none_and_retried_later() {
        let resolver = RouteResolver::new(Arc::new(FakeRouter::failing()), 25.0);
        let dest = Coordinates { lat: 1.0, lng: 1.0 };
        assert_eq!(resolver.resolve(ORIGIN, dest).await, None);
        assert!(resolver.needs_resolution(ORIGIN, dest));
    }

    #[tokio::test]
    async fn recomputes_only_on_meaningful_change() {
        let resolver = RouteResolver::new(Arc::new(FakeRouter::returning(Some(sample_route()))), 25.0);
        let dest = Coordinates { lat: 1.0, lng: 1.0 };
        assert!(resolver.needs_resolution(ORIGIN, dest));
        assert_eq!(resolver.resolve(ORIGIN, dest).await, Some(sample_route()));

        // ~11 m north
        let nudged = Coordinates { lat: 0.0001, lng: 0.0 };
        assert!(!resolver.needs_resolution(nudged, dest));
        // ~111 m north
        let moved = Coordinates { lat: 0.001, lng: 0.0 };
        assert!(resolver.needs_resolution(moved, dest));
        assert!(resolver.needs_resolution(ORIGIN, Coordinates { lat: 2.0, lng: 2.0 }));

        resolver.reset();
        assert!(resolver.needs_resolution(ORIGIN, dest));
    }
}
