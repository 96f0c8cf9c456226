//! The publishing resolver: maps PDR identifiers (and their version,
//! component, and AIP sub-forms) onto JSON/HTML/native representations
//! with content negotiation.

pub mod aip;
pub mod format;
pub mod pdrid;

use axum::http::{header, StatusCode};
use axum::response::Response;
use serde::Deserialize;
use serde_json::{json, Value};

use midas_shared::ids::ARK_NAAN;

/// Resolver wiring: the upstream services and identifier authority.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_naan")]
    pub naan: String,
    #[serde(default)]
    pub ignore_naan: bool,
    /// Base URL of the metadata search service (RMM).
    pub md_search: String,
    /// Directory of the oversized-record cache, if present.
    #[serde(default)]
    pub metadata_cache_dir: Option<String>,
    /// Landing-page service that HTML requests redirect to.
    #[serde(default)]
    pub landing_page_service: Option<String>,
    /// This resolver's own public base, for included-resource redirects.
    #[serde(default)]
    pub resolver_service: Option<String>,
    /// Base URL of the distribution service behind the AIP endpoints.
    #[serde(default)]
    pub distribution_service: Option<String>,
}

fn default_naan() -> String {
    ARK_NAAN.to_string()
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            naan: default_naan(),
            ignore_naan: false,
            md_search: String::new(),
            metadata_cache_dir: None,
            landing_page_service: None,
            resolver_service: None,
            distribution_service: None,
        }
    }
}

/// Renders a dataset as human-oriented plain text.  The production
/// generator is an external collaborator; the default briefly renders
/// the core fields.
pub trait ReadmeGenerator: Send + Sync {
    fn generate(&self, nerdm: &Value) -> anyhow::Result<String>;
}

/// A minimal text rendering used when no external generator is wired.
pub struct BriefReadme;

impl ReadmeGenerator for BriefReadme {
    fn generate(&self, nerdm: &Value) -> anyhow::Result<String> {
        let mut out = String::new();
        if let Some(title) = nerdm.get("title").and_then(Value::as_str) {
            out.push_str(title);
            out.push_str("\n\n");
        }
        if let Some(id) = nerdm.get("@id").and_then(Value::as_str) {
            out.push_str(&format!("Identifier: {id}\n"));
        }
        if let Some(ver) = nerdm.get("version").and_then(Value::as_str) {
            out.push_str(&format!("Version: {ver}\n"));
        }
        if let Some(desc) = nerdm.get("description").and_then(Value::as_array) {
            out.push('\n');
            for para in desc.iter().filter_map(Value::as_str) {
                out.push_str(para);
                out.push_str("\n\n");
            }
        }
        Ok(out)
    }
}

pub(crate) fn body_response(code: StatusCode, ctype: &str, body: String) -> Response {
    Response::builder()
        .status(code)
        .header(header::CONTENT_TYPE, ctype)
        .body(body.into())
        .unwrap_or_default()
}

pub(crate) fn json_ok(value: &Value, ctype: &str) -> Response {
    body_response(
        StatusCode::OK,
        ctype,
        serde_json::to_string_pretty(value).unwrap_or_default(),
    )
}

pub(crate) fn send_error(code: StatusCode, message: &str) -> Response {
    body_response(
        code,
        "application/json",
        json!({ "message": message }).to_string(),
    )
}

pub(crate) fn redirect(code: StatusCode, location: &str) -> Response {
    Response::builder()
        .status(code)
        .header(header::LOCATION, location)
        .body(axum::body::Body::empty())
        .unwrap_or_default()
}

pub(crate) fn ready() -> Response {
    json_ok(
        &json!({ "status": "ready", "message": "Resolver is ready" }),
        "application/json",
    )
}
