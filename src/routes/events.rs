use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;

use crate::app_state::AppState;
use crate::models::event::{AlertEvent, BeginRoundResponse};
use crate::models::round::Round;
use crate::routes::error::ApiError;

/// POST /api/v1/events/alert: start the retrieval round for an alert.
pub async fn receive_alert(
    State(state): State<AppState>,
    Json(event): Json<AlertEvent>,
) -> Result<(StatusCode, Json<BeginRoundResponse>), ApiError> {
    event.validate()?;

    tracing::info!(
        asset_id = %event.asset_id,
        alert_incident_time = event.alert_incident_time,
        alert_configuration_id = event.alert_configuration_id.as_deref().unwrap_or(""),
        "Received alert"
    );

    let begun = state
        .tracker
        .begin_round(
            &event.asset_id,
            event.alert_incident_time,
            &state.capture_offsets_ms,
        )
        .await?;

    let status = if begun.created() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let created = begun.created();
    let round = begun.into_round();

    Ok((
        status,
        Json(BeginRoundResponse {
            round_key: round.key(),
            created,
            status: round.status.to_string(),
            capture_times: round.capture_times(),
        }),
    ))
}

/// GET /api/v1/rounds/{asset_id}/{event_time}: current state of a round.
pub async fn get_round(
    State(state): State<AppState>,
    Path((asset_id, event_time)): Path<(String, i64)>,
) -> Result<Json<Round>, ApiError> {
    state
        .tracker
        .round(&asset_id, event_time)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}
