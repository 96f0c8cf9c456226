//! The legacy NPS external-review callback endpoint
//! (`/extrev/nps/leg/...`).
//!
//! In the legacy protocol the review system only responds when a
//! reviewer requests changes or the review completes: a null
//! `reviewResponse` marks the review as started, `true` approves (and
//! publishes), and `false` pauses the review and returns the record to
//! its authors.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use midas_shared::models::Permissions;

use crate::dbio::DbioError;
use crate::error::AppError;
use crate::middleware::AuthenticatedAgent;
use crate::project::ProjectService;
use crate::state::AppState;

const REVIEW_SYSTEM: &str = "nps";

#[derive(Deserialize)]
pub struct ReviewResponse {
    #[serde(rename = "reviewResponse")]
    pub review_response: Option<bool>,
}

async fn review_status_for(service: &ProjectService, id: &str) -> Result<Value, AppError> {
    let prec = service.dbclient().get_record_for(id, Permissions::PUBLISH).await?;
    Ok(prec
        .status()
        .get_review_from(REVIEW_SYSTEM)
        .map(|rev| serde_json::to_value(rev).unwrap_or_default())
        .unwrap_or_else(|| json!({})))
}

fn legacy_error(err: AppError, id: &str) -> AppError {
    match err {
        AppError::Dbio(DbioError::NotAuthorized { .. }) => {
            AppError::Conflict(format!(
                "Record has not been submitted for review, yet: {id}"
            ))
        }
        other => other,
    }
}

/// POST /extrev/nps/leg/{id}: receive feedback: approval, rejection,
/// or review-started.
pub async fn post_feedback(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReviewResponse>,
) -> Result<impl IntoResponse, AppError> {
    let service = state.extrev_factory()?.create_service_for(&agent);

    let res: Result<(), AppError> = async {
        match body.review_response {
            None => {
                // a missing response indicates the review has started
                service
                    .apply_external_review(
                        &id,
                        REVIEW_SYSTEM,
                        "in progress",
                        Some(&id),
                        None,
                        None,
                        false,
                        true,
                        Default::default(),
                    )
                    .await?;
            }
            Some(true) => {
                service.approve(&id, REVIEW_SYSTEM, Some(&id), None, true).await?;
            }
            Some(false) => {
                // reviewer wants changes
                let fb = vec![json!({
                    "type": "req",
                    "description": "Visit NPS for reviewer comments"
                })];
                service
                    .apply_external_review(
                        &id,
                        REVIEW_SYSTEM,
                        "paused",
                        Some(&id),
                        None,
                        Some(fb),
                        true,
                        true,
                        Default::default(),
                    )
                    .await?;
            }
        }
        Ok(())
    }
    .await;
    res.map_err(|e| legacy_error(e, &id))?;

    Ok(Json(review_status_for(&service, &id).await.map_err(|e| legacy_error(e, &id))?))
}

/// GET /extrev/nps/leg/{id}: the current review registration for a
/// record.
pub async fn get_review(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let service = state.extrev_factory()?.create_service_for(&agent);
    Ok(Json(review_status_for(&service, &id).await?))
}

/// GET /extrev/nps/leg/: every review registration not yet approved.
pub async fn list_open_reviews(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let service = state.extrev_factory()?.create_service_for(&agent);
    let recs = service
        .dbclient()
        .select_records(Permissions::PUBLISH, &Default::default())
        .await?;

    let mut out = Vec::new();
    for prec in recs {
        if let Some(rev) = prec.status().get_review_from(REVIEW_SYSTEM) {
            if rev.phase != "approved" {
                out.push(serde_json::to_value(rev).unwrap_or_default());
            }
        }
    }
    Ok(Json(out))
}
