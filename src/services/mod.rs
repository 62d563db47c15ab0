pub mod geocoding;
pub mod notifier;
pub mod routing;
pub mod store;

use std::time::Duration;

const USER_AGENT: &str = concat!("SafeTransit/", env!("CARGO_PKG_VERSION"));

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(20))
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
