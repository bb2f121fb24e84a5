use axum::extract::{Path, State};
use axum::Json;
use keel_core::publish::Digest;
use keel_core::store::TargetRecord;
use serde::Deserialize;

use super::blocking;
use crate::error::AppError;
use crate::state::AppState;

/// GET /api/targets — configured targets with their running version and claim.
pub async fn list_targets(
    State(app): State<AppState>,
) -> Result<Json<Vec<serde_json::Value>>, AppError> {
    let machine = app.machine.clone();
    let records = blocking(move || machine.targets()).await?;
    let targets = app
        .machine
        .config()
        .targets
        .iter()
        .map(|(name, cfg)| {
            let record = records.iter().find(|r| &r.host == name);
            serde_json::json!({
                "name": name,
                "address": cfg.address,
                "port": cfg.port,
                "current_version": record.and_then(|r| r.current_version.as_ref()),
                "claimed_by": record.and_then(|r| r.claimed_by),
                "degraded_by": record.and_then(|r| r.degraded_by),
            })
        })
        .collect();
    Ok(Json(targets))
}

#[derive(Debug, Deserialize)]
pub struct RepairBody {
    pub actor: String,
    /// Digest the operator found running; null when nothing is active.
    #[serde(default)]
    pub version: Option<String>,
}

/// POST /api/targets/{name}/repair — release a host degraded by a failed
/// rollback once an operator has checked it.
pub async fn repair_target(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<RepairBody>,
) -> Result<Json<TargetRecord>, AppError> {
    let version = body
        .version
        .as_deref()
        .map(str::parse::<Digest>)
        .transpose()?;
    let machine = app.machine.clone();
    let record = tokio::spawn(async move {
        machine
            .repair_target(&name, version, &body.actor)
            .await
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(record))
}
