use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use cbc_core::event::TriggerEvent;
use cbc_core::workflow::Run;

use crate::error::AppError;
use crate::state::AppState;

/// POST /api/events: Accept a trigger event and start its run.
///
/// Returns 202 with the new run; the background worker advances it.
pub async fn submit_event(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Run>), AppError> {
    if body.is_empty() {
        return Err(AppError::bad_request("request body is empty"));
    }
    let event = TriggerEvent::from_slice(&body)?;
    let run = app.blocking(move |engine| engine.start(event)).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}
