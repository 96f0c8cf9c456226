//! Handlers for the project-record endpoints
//! (`/<svc>/<conv>/...`).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use midas_shared::models::Permissions;

use crate::error::AppError;
use crate::middleware::AuthenticatedAgent;
use crate::project::ProjectService;
use crate::state::AppState;

fn service_for(
    state: &AppState,
    svc: &str,
    conv: &str,
    agent: &midas_shared::prov::Agent,
) -> Result<ProjectService, AppError> {
    Ok(state.service_factory(svc, conv)?.create_service_for(agent))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub perm: Option<String>,
    pub name: Option<String>,
    pub owner: Option<String>,
    pub state: Option<String>,
}

fn parse_perm(perm: Option<&str>) -> Result<Permissions, AppError> {
    let Some(perm) = perm else {
        return Ok(Permissions::OWN);
    };
    let mut out = Permissions::empty();
    for name in perm.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        out |= Permissions::from_acl_key(name)
            .ok_or_else(|| AppError::bad_request(format!("unrecognized permission: {name}")))?;
    }
    Ok(out)
}

/// GET /{svc}/{conv}/: list the records visible to the caller under
/// the given permission.
pub async fn list_records(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path((svc, conv)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let service = service_for(&state, &svc, &conv, &agent)?;
    let perm = parse_perm(query.perm.as_deref())?;

    let mut constraints: HashMap<String, Vec<Value>> = HashMap::new();
    for (prop, have) in [
        ("name", &query.name),
        ("owner", &query.owner),
        ("status_state", &query.state),
    ] {
        if let Some(vals) = have {
            constraints.insert(
                prop.to_string(),
                vals.split(',').map(|v| Value::String(v.trim().to_string())).collect(),
            );
        }
    }

    let recs = service.dbclient().select_records(perm, &constraints).await?;
    let out: Vec<Value> = recs.iter().map(|r| r.export()).collect();
    Ok(Json(out))
}

#[derive(Deserialize)]
pub struct CreateRequest {
    pub name: String,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    #[serde(default)]
    pub meta: Option<Map<String, Value>>,
    #[serde(default)]
    pub id: Option<String>,
}

/// POST /{svc}/{conv}/: create a record; returns 201 with the created
/// record.
pub async fn create_record(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path((svc, conv)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRequest>,
) -> Result<impl IntoResponse, AppError> {
    if body.name.is_empty() {
        return Err(AppError::bad_request("missing 'name' property"));
    }
    if agent.actor == midas_shared::models::ANONYMOUS {
        return Err(AppError::Unauthorized);
    }
    let service = service_for(&state, &svc, &conv, &agent)?;
    let rec = service
        .create_record(&body.name, body.data, body.meta, body.id.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(rec.export())))
}

/// GET /{svc}/{conv}/{id}
pub async fn get_record(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path((svc, conv, id)): Path<(String, String, String)>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let service = service_for(&state, &svc, &conv, &agent)?;
    Ok(Json(service.get_record(&id).await?.export()))
}

#[derive(Deserialize)]
pub struct ActionQuery {
    pub action: Option<String>,
    pub message: Option<String>,
}

async fn apply_action(
    service: &ProjectService,
    id: &str,
    action: Option<&str>,
    message: Option<&str>,
) -> Result<(), AppError> {
    match action {
        None => Ok(()),
        Some("finalize") => {
            service.finalize(id, message).await?;
            Ok(())
        }
        Some("publish") => {
            service.submit(id, message).await?;
            Ok(())
        }
        Some(other) => Err(AppError::bad_request(format!("unrecognized action: {other}"))),
    }
}

/// PATCH /{svc}/{conv}/{id}: merge-update the record data;
/// `?action=finalize|publish` then advances the lifecycle.
pub async fn patch_record(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path((svc, conv, id)): Path<(String, String, String)>,
    Query(query): Query<ActionQuery>,
    State(state): State<Arc<AppState>>,
    body: Option<Json<Value>>,
) -> Result<impl IntoResponse, AppError> {
    let service = service_for(&state, &svc, &conv, &agent)?;

    if let Some(Json(body)) = body {
        if body.as_object().is_some_and(|o| !o.is_empty()) {
            service.update_data(&id, body, None, query.message.as_deref()).await?;
        }
    }
    apply_action(&service, &id, query.action.as_deref(), query.message.as_deref()).await?;

    Ok(Json(service.get_record(&id).await?.export()))
}

/// PUT /{svc}/{conv}/{id}: replace the record data.
pub async fn put_record(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path((svc, conv, id)): Path<(String, String, String)>,
    Query(query): Query<ActionQuery>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let service = service_for(&state, &svc, &conv, &agent)?;
    service.replace_data(&id, body, None, query.message.as_deref()).await?;
    apply_action(&service, &id, query.action.as_deref(), query.message.as_deref()).await?;
    Ok(Json(service.get_record(&id).await?.export()))
}

/// DELETE /{svc}/{conv}/{id}: delete the draft, or revert it to the
/// published version.
pub async fn delete_record(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path((svc, conv, id)): Path<(String, String, String)>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let service = service_for(&state, &svc, &conv, &agent)?;
    match service.delete_record(&id).await? {
        Some(stub) => Ok(Json(stub.export())),
        None => Ok(Json(json!({ "id": id, "deleted": true }))),
    }
}

/// GET /{svc}/{conv}/{id}/data
pub async fn get_data(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path((svc, conv, id)): Path<(String, String, String)>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let service = service_for(&state, &svc, &conv, &agent)?;
    Ok(Json(service.get_data(&id, None).await?))
}

/// GET /{svc}/{conv}/{id}/data/{part}
pub async fn get_data_part(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path((svc, conv, id, part)): Path<(String, String, String, String)>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let service = service_for(&state, &svc, &conv, &agent)?;
    Ok(Json(service.get_data(&id, Some(&part)).await?))
}

/// PATCH /{svc}/{conv}/{id}/data: merge into the data.
pub async fn patch_data(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path((svc, conv, id)): Path<(String, String, String)>,
    Query(query): Query<ActionQuery>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let service = service_for(&state, &svc, &conv, &agent)?;
    let data = service.update_data(&id, body, None, query.message.as_deref()).await?;
    Ok(Json(data))
}

/// PATCH /{svc}/{conv}/{id}/data/{part}: merge at a pointer.
pub async fn patch_data_part(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path((svc, conv, id, part)): Path<(String, String, String, String)>,
    Query(query): Query<ActionQuery>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let service = service_for(&state, &svc, &conv, &agent)?;
    let data = service.update_data(&id, body, Some(&part), query.message.as_deref()).await?;
    Ok(Json(data))
}

/// PUT /{svc}/{conv}/{id}/data: replace the data wholesale.
pub async fn put_data(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path((svc, conv, id)): Path<(String, String, String)>,
    Query(query): Query<ActionQuery>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let service = service_for(&state, &svc, &conv, &agent)?;
    let data = service.replace_data(&id, body, None, query.message.as_deref()).await?;
    Ok(Json(data))
}

/// PUT /{svc}/{conv}/{id}/data/{part}: replace at a pointer.
pub async fn put_data_part(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path((svc, conv, id, part)): Path<(String, String, String, String)>,
    Query(query): Query<ActionQuery>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let service = service_for(&state, &svc, &conv, &agent)?;
    let data = service.replace_data(&id, body, Some(&part), query.message.as_deref()).await?;
    Ok(Json(data))
}

/// GET /{svc}/{conv}/{id}/status
pub async fn get_status(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path((svc, conv, id)): Path<(String, String, String)>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let service = service_for(&state, &svc, &conv, &agent)?;
    Ok(Json(service.get_status(&id).await?.export(&id)))
}

#[derive(Deserialize)]
pub struct StatusMessage {
    pub message: String,
}

/// PUT /{svc}/{conv}/{id}/status: attach a message to the current
/// status.
pub async fn put_status(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path((svc, conv, id)): Path<(String, String, String)>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<StatusMessage>,
) -> Result<impl IntoResponse, AppError> {
    let service = service_for(&state, &svc, &conv, &agent)?;
    Ok(Json(service.update_status_message(&id, &body.message).await?.export(&id)))
}

#[derive(Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

/// PUT /{svc}/{conv}/{id}/name: rename the record.
pub async fn put_name(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path((svc, conv, id)): Path<(String, String, String)>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<RenameRequest>,
) -> Result<impl IntoResponse, AppError> {
    let service = service_for(&state, &svc, &conv, &agent)?;
    let name = service.rename_record(&id, &body.name).await?;
    Ok(Json(json!({ "id": id, "name": name })))
}

#[derive(Deserialize)]
pub struct ReassignRequest {
    pub owner: String,
    #[serde(default)]
    pub disown: bool,
}

/// PUT /{svc}/{conv}/{id}/owner: reassign ownership.
pub async fn put_owner(
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path((svc, conv, id)): Path<(String, String, String)>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReassignRequest>,
) -> Result<impl IntoResponse, AppError> {
    let service = service_for(&state, &svc, &conv, &agent)?;
    let owner = service.reassign_record(&id, &body.owner, body.disown).await?;
    Ok(Json(json!({ "id": id, "owner": owner })))
}
