use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use keel_core::machine::ApprovalEvent;
use tracing::{info, warn};

use crate::error::AppError;
use crate::state::AppState;

/// POST /api/attempts/{id}/approval — verify the signed approval now, then
/// drive the attempt in the background. Poll `GET /api/attempts/{id}` for
/// the outcome.
pub async fn submit_approval(
    State(app): State<AppState>,
    Path(id): Path<u64>,
    Json(event): Json<ApprovalEvent>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let machine = app.machine.clone();
    let checked = event.clone();
    tokio::task::spawn_blocking(move || machine.validate_approval(id, &checked))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    if !app.begin_drive(id) {
        return Err(AppError::conflict(format!(
            "an approval for attempt {id} is already being processed"
        )));
    }

    let approver = event.approver_id.clone();
    let bg = app.clone();
    tokio::spawn(async move {
        match bg.machine.submit_approval(id, event).await {
            Ok(attempt) => info!(attempt_id = id, state = %attempt.state, "approved attempt settled"),
            Err(e) => warn!(attempt_id = id, error = %e, "approved attempt did not run"),
        }
        bg.end_drive(id);
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "attempt_id": id,
            "approver_id": approver,
            "status": "accepted",
        })),
    ))
}
