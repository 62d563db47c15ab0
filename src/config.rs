use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub listen_addr: SocketAddr,
    pub monitor: MonitorConfig,
    pub providers: ProviderConfig,
}

/// Tuning for a single user's trip monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub throttle_interval: Duration,
    pub max_sample_age: Duration,
    pub position_timeout: Duration,
    pub high_accuracy: bool,
    pub channel_capacity: usize,
    pub inactivity_threshold: Duration,
    pub inactivity_check_interval: Duration,
    pub auto_sos_on_inactivity: bool,
    pub route_min_movement_m: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            throttle_interval: Duration::from_millis(10_000),
            max_sample_age: Duration::from_millis(5_000),
            position_timeout: Duration::from_millis(20_000),
            high_accuracy: true,
            channel_capacity: 64,
            inactivity_threshold: Duration::from_secs(15 * 60),
            inactivity_check_interval: Duration::from_secs(60),
            auto_sos_on_inactivity: false,
            route_min_movement_m: 25.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub geocoding_url: String,
    pub routing_url: String,
    pub emailjs_url: String,
    pub emailjs_service_id: String,
    pub emailjs_template_id: String,
    pub emailjs_user_id: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            geocoding_url: "https://nominatim.openstreetmap.org/search".into(),
            routing_url: "https://router.project-osrm.org/route/v1".into(),
            emailjs_url: "https://api.emailjs.com/api/v1.0/email/send".into(),
            emailjs_service_id: "service_mock".into(),
            emailjs_template_id: "template_mock".into(),
            emailjs_user_id: "user_mock".into(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://safetransit.db".into(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            monitor: MonitorConfig::default(),
            providers: ProviderConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://safetransit.db".to_string());
        let listen_addr: SocketAddr = parse_var("APP_LISTEN_ADDR", "127.0.0.1:3000".parse().ok())?;

        let defaults = MonitorConfig::default();
        let monitor = MonitorConfig {
            throttle_interval: Duration::from_millis(parse_var(
                "THROTTLE_INTERVAL_MS",
                Some(10_000),
            )?),
            max_sample_age: Duration::from_millis(parse_var("MAX_SAMPLE_AGE_MS", Some(5_000))?),
            position_timeout: Duration::from_millis(parse_var(
                "POSITION_TIMEOUT_MS",
                Some(20_000),
            )?),
            high_accuracy: parse_var("POSITION_HIGH_ACCURACY", Some(defaults.high_accuracy))?,
            channel_capacity: parse_var("POSITION_CHANNEL_CAPACITY", Some(defaults.channel_capacity))?,
            inactivity_threshold: Duration::from_secs(parse_var(
                "INACTIVITY_THRESHOLD_SECS",
                Some(900),
            )?),
            inactivity_check_interval: Duration::from_secs(parse_var(
                "INACTIVITY_CHECK_SECS",
                Some(60),
            )?),
            auto_sos_on_inactivity: parse_var("AUTO_SOS_ON_INACTIVITY", Some(false))?,
            route_min_movement_m: parse_var(
                "ROUTE_MIN_MOVEMENT_M",
                Some(defaults.route_min_movement_m),
            )?,
        };
        if monitor.channel_capacity == 0 {
            return Err(AppError::Config(
                "POSITION_CHANNEL_CAPACITY must be at least 1".into(),
            ));
        }
        if monitor.inactivity_check_interval.is_zero() {
            return Err(AppError::Config(
                "INACTIVITY_CHECK_SECS must be at least 1".into(),
            ));
        }

        let fallback = ProviderConfig::default();
        let providers = ProviderConfig {
            geocoding_url: env::var("GEOCODING_URL").unwrap_or(fallback.geocoding_url),
            routing_url: env::var("ROUTING_URL").unwrap_or(fallback.routing_url),
            emailjs_url: env::var("EMAILJS_URL").unwrap_or(fallback.emailjs_url),
            emailjs_service_id: env::var("EMAILJS_SERVICE_ID")
                .unwrap_or(fallback.emailjs_service_id),
            emailjs_template_id: env::var("EMAILJS_TEMPLATE_ID")
                .unwrap_or(fallback.emailjs_template_id),
            emailjs_user_id: env::var("EMAILJS_USER_ID").unwrap_or(fallback.emailjs_user_id),
        };

        Ok(Self {
            database_url,
            listen_addr,
            monitor,
            providers,
        })
    }
}

fn parse_var<T>(key: &str, default: Option<T>) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|err| AppError::Config(format!("invalid {key}: {err}"))),
        Err(_) => default.ok_or_else(|| AppError::Config(format!("{key} is required"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_falls_back_to_default_when_unset() {
        let value: u64 = parse_var("SAFETRANSIT_TEST_UNSET_VAR", Some(42)).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn parse_var_rejects_garbage() {
        env::set_var("SAFETRANSIT_TEST_BAD_VAR", "ten");
        let result: Result<u64, _> = parse_var("SAFETRANSIT_TEST_BAD_VAR", Some(1));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn monitor_defaults_match_documented_values() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.throttle_interval, Duration::from_secs(10));
        assert_eq!(cfg.inactivity_threshold, Duration::from_secs(900));
        assert_eq!(cfg.inactivity_check_interval, Duration::from_secs(60));
        assert!(!cfg.auto_sos_on_inactivity);
    }
}
