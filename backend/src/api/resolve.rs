//! The resolver endpoints: `/id/...` and `/aip/...`.

use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;

use crate::resolve::format::order_accepts;
use crate::resolve::{aip, pdrid, ready, send_error};
use crate::state::AppState;

/// The ordered `format` query parameters.
fn requested_formats(query: Option<&str>) -> Vec<String> {
    let Some(query) = query else {
        return Vec::new();
    };
    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(k, _)| k == "format")
        .map(|(_, v)| v.to_string())
        .collect()
}

/// The `Accept` content types, ordered by q-value.
fn accepted_types(headers: &HeaderMap) -> Vec<String> {
    let joined: Vec<String> = headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(String::from)
        .collect();
    order_accepts(&joined.join(","))
}

/// GET /id/: resolver readiness probe.
pub async fn resolve_id_root() -> Response {
    ready()
}

/// GET /id/{path}: resolve a PDR identifier.
pub async fn resolve_id(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let formats = requested_formats(query.as_deref());
    let accepts = accepted_types(&headers);
    pdrid::resolve_pdr_path(
        &path,
        &formats,
        &accepts,
        &state.config.resolver,
        &state.mdclient,
        state.readme.as_ref(),
    )
    .await
}

/// GET /aip/: AIP resolver readiness probe.
pub async fn resolve_aip_root() -> Response {
    ready()
}

/// GET /aip/{path}: resolve an AIP identifier against the
/// distribution service.
pub async fn resolve_aip(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let Some(distrib) = &state.distrib else {
        return send_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Distribution service is not configured",
        );
    };
    let formats = requested_formats(query.as_deref());
    let accepts = accepted_types(&headers);
    aip::resolve_aip_path(&path, &formats, &accepts, distrib).await
}
