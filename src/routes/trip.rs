use axum::{
    extract::State,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    auth::CurrentUser,
    engine::{
        monitor::LiveView,
        position::{Delivery, PositionOptions},
        registry::MonitorHandle,
        sos::SosReport,
    },
    error::AppError,
    models::{
        position::{Coordinates, PositionError, PositionErrorKind, PositionSample},
        sos::SosTrigger,
        trip::Destination,
    },
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(live_view))
        .route("/restore", post(restore))
        .route("/destination", put(set_destination))
        .route("/start", post(start))
        .route("/positions", post(report_position))
        .route("/checkin", post(check_in))
        .route("/sos", post(sos))
        .route("/complete", post(complete))
}

fn monitor_for(state: &AppState, current: &CurrentUser) -> Result<MonitorHandle, AppError> {
    let user = current.require_user()?;
    Ok(state.monitors.get_or_create(&user.id, &user.display_name))
}

#[derive(Debug, Deserialize)]
struct DestinationForm {
    display_name: String,
    lat: f64,
    lng: f64,
}

impl TryFrom<DestinationForm> for Destination {
    type Error = AppError;

    fn try_from(form: DestinationForm) -> Result<Self, Self::Error> {
        let display_name = form.display_name.trim();
        if display_name.is_empty() {
            return Err(AppError::BadRequest("destination needs a name".into()));
        }
        Ok(Destination {
            display_name: display_name.to_string(),
            coords: Coordinates::new(form.lat, form.lng)?,
        })
    }
}

async fn live_view(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<LiveView>, AppError> {
    Ok(Json(monitor_for(&state, &current)?.monitor.view()))
}

async fn restore(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<LiveView>, AppError> {
    let handle = monitor_for(&state, &current)?;
    Ok(Json(handle.monitor.restore().await?))
}

async fn set_destination(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(form): Json<DestinationForm>,
) -> Result<Json<LiveView>, AppError> {
    let handle = monitor_for(&state, &current)?;
    let destination = Destination::try_from(form)?;
    Ok(Json(handle.monitor.set_destination(destination).await?))
}

#[derive(Debug, Default, Deserialize)]
struct StartForm {
    destination: Option<DestinationForm>,
}

async fn start(
    State(state): State<AppState>,
    current: CurrentUser,
    body: Option<Json<StartForm>>,
) -> Result<Json<LiveView>, AppError> {
    let handle = monitor_for(&state, &current)?;
    let form = body.map(|Json(form)| form).unwrap_or_default();
    let destination = form.destination.map(Destination::try_from).transpose()?;
    Ok(Json(handle.monitor.start(destination).await?))
}

/// What a device reports: a fix, or why it could not get one.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PositionReport {
    Fix {
        lat: f64,
        lng: f64,
        captured_at: Option<DateTime<Utc>>,
        accuracy_m: Option<f64>,
    },
    Error {
        kind: PositionErrorKind,
        #[serde(default)]
        message: Option<String>,
    },
}

/// Acquisition settings the device should use for its next fix.
#[derive(Debug, Serialize)]
struct DeviceSettings {
    high_accuracy: bool,
    timeout_ms: u64,
    maximum_age_ms: u64,
}

impl From<PositionOptions> for DeviceSettings {
    fn from(options: PositionOptions) -> Self {
        Self {
            high_accuracy: options.high_accuracy,
            timeout_ms: options.timeout.as_millis() as u64,
            maximum_age_ms: options.max_sample_age.as_millis() as u64,
        }
    }
}

#[derive(Serialize)]
struct PositionAck {
    delivery: Delivery,
    settings: Option<DeviceSettings>,
}

async fn report_position(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(report): Json<PositionReport>,
) -> Result<Json<PositionAck>, AppError> {
    let handle = monitor_for(&state, &current)?;
    handle.monitor.ensure_tracking()?;
    let delivery = match report {
        PositionReport::Fix {
            lat,
            lng,
            captured_at,
            accuracy_m,
        } => {
            let mut sample = PositionSample::new(
                Coordinates::new(lat, lng)?,
                captured_at.unwrap_or_else(|| state.clock.now()),
            );
            sample.accuracy_m = accuracy_m;
            handle.feed.push_sample(sample)
        }
        PositionReport::Error { kind, message } => handle.feed.push_error(PositionError {
            kind,
            message: message.unwrap_or_else(|| default_error_message(kind).to_string()),
        }),
    };
    Ok(Json(PositionAck {
        delivery,
        settings: handle.feed.options().map(DeviceSettings::from),
    }))
}

fn default_error_message(kind: PositionErrorKind) -> &'static str {
    match kind {
        PositionErrorKind::PermissionDenied => "location permission denied",
        PositionErrorKind::Unavailable => "location unavailable",
        PositionErrorKind::Timeout => "location request timed out",
    }
}

async fn check_in(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<LiveView>, AppError> {
    let handle = monitor_for(&state, &current)?;
    Ok(Json(handle.monitor.check_in().await?))
}

async fn sos(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<SosReport>, AppError> {
    let handle = monitor_for(&state, &current)?;
    Ok(Json(handle.monitor.trigger_sos(SosTrigger::Manual).await?))
}

#[derive(Serialize)]
struct Completed {
    trip_id: String,
}

async fn complete(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<Completed>, AppError> {
    let handle = monitor_for(&state, &current)?;
    let trip_id = handle.monitor.complete().await?;
    Ok(Json(Completed { trip_id }))
}
