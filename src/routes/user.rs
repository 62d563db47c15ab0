use axum::{
    extract::State,
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::{
    auth::CurrentUser,
    error::AppError,
    models::{contact::Contact, sos::SosAlert},
    services::store::TripStore,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/contacts", get(list_contacts).post(add_contact))
        .route("/alerts", get(list_alerts))
}

async fn list_contacts(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<Vec<Contact>>, AppError> {
    let user = current.require_user()?;
    Ok(Json(state.store.list_contacts(&user.id).await?))
}

#[derive(Debug, Deserialize)]
struct ContactForm {
    name: String,
    phone: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    relation: Option<String>,
}

async fn add_contact(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(form): Json<ContactForm>,
) -> Result<(StatusCode, Json<Contact>), AppError> {
    let user = current.require_user()?;
    let contact = state
        .store
        .add_contact(
            &user.id,
            &form.name,
            &form.phone,
            form.email.as_deref(),
            form.relation.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(contact)))
}

/// The user's alert history, oldest first.
async fn list_alerts(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<Vec<SosAlert>>, AppError> {
    let user = current.require_user()?;
    Ok(Json(state.store.list_sos_alerts(&user.id).await?))
}
