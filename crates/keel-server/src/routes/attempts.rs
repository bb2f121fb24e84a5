use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use keel_core::audit::AuditRecord;
use keel_core::machine::{DeployRequest, DeploymentAttempt};
use keel_core::publish::{ArtifactSource, BuildOutput, Digest};
use keel_core::types::AttemptState;
use serde::Deserialize;

use super::blocking;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateAttempt {
    pub target: String,
    pub repository: String,
    pub requested_by: String,
    /// Build output to publish, base64 encoded.
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

impl CreateAttempt {
    fn source(self) -> Result<(String, String, ArtifactSource), AppError> {
        let CreateAttempt {
            target,
            repository,
            requested_by,
            artifact,
            digest,
            tag,
        } = self;
        let source = match (artifact, digest, tag) {
            (Some(blob), None, tag) => {
                let blob = B64
                    .decode(blob.trim())
                    .map_err(|_| AppError::bad_request("artifact is not valid base64"))?;
                ArtifactSource::Build(BuildOutput {
                    repository,
                    tag,
                    blob,
                })
            }
            (None, Some(digest), None) => ArtifactSource::Digest {
                repository,
                digest: digest.parse::<Digest>()?,
            },
            (None, None, Some(tag)) => ArtifactSource::Tag { repository, tag },
            _ => {
                return Err(AppError::bad_request(
                    "give exactly one of artifact, digest or tag (tag may accompany artifact)",
                ))
            }
        };
        Ok((target, requested_by, source))
    }
}

/// POST /api/attempts — request a deployment. The attempt is returned in
/// `pending_approval`, or `aborted` when publishing failed.
///
/// The request runs on its own task: once the attempt exists it must reach
/// `pending_approval` or `aborted` even if the client goes away.
pub async fn create_attempt(
    State(app): State<AppState>,
    Json(body): Json<CreateAttempt>,
) -> Result<(StatusCode, Json<DeploymentAttempt>), AppError> {
    let (target, requested_by, source) = body.source()?;
    let machine = app.machine.clone();
    let attempt = tokio::spawn(async move {
        machine
            .request(DeployRequest {
                target,
                source,
                requested_by,
            })
            .await
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok((StatusCode::CREATED, Json(attempt)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub target: Option<String>,
    pub state: Option<AttemptState>,
}

/// GET /api/attempts — newest first, optionally filtered.
pub async fn list_attempts(
    State(app): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<DeploymentAttempt>>, AppError> {
    let machine = app.machine.clone();
    let attempts = blocking(move || machine.list()).await?;
    let filtered = attempts
        .into_iter()
        .filter(|a| q.target.as_ref().map_or(true, |t| &a.target == t))
        .filter(|a| q.state.map_or(true, |s| a.state == s))
        .collect();
    Ok(Json(filtered))
}

/// GET /api/attempts/{id}
pub async fn get_attempt(
    State(app): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<DeploymentAttempt>, AppError> {
    let machine = app.machine.clone();
    Ok(Json(blocking(move || machine.status(id)).await?))
}

/// GET /api/attempts/{id}/audit
pub async fn get_audit(
    State(app): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Vec<AuditRecord>>, AppError> {
    let machine = app.machine.clone();
    Ok(Json(blocking(move || machine.audit(id)).await?))
}

/// GET /api/audit/verify — walk the whole hash chain.
pub async fn verify_audit(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let machine = app.machine.clone();
    let records = blocking(move || machine.verify_audit()).await?;
    Ok(Json(serde_json::json!({ "verified": true, "records": records })))
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    pub actor: String,
}

/// POST /api/attempts/{id}/cancel
pub async fn cancel_attempt(
    State(app): State<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<CancelBody>,
) -> Result<Json<DeploymentAttempt>, AppError> {
    Ok(Json(app.machine.cancel(id, &body.actor).await?))
}
