//! Resolution of AIP (Archive Information Package) identifiers under
//! the `/aip/` endpoint, backed by the distribution service.

use axum::http::StatusCode;
use axum::response::Response;
use serde_json::{json, Map, Value};

use crate::distrib::{bag_serialization, is_legal_bag_name, DistribClient, DistribError};

use super::format::{add_text_support, Format, FormatSupport, NegotiationError};
use super::{json_ok, ready, redirect, send_error};

const VER_DELIM: &str = "pdr:v";
const DIST_DELIM: &str = "pdr:d";
const HEAD_DELIM: &str = "pdr:h";

fn native_ctype(name: &str) -> &'static str {
    match bag_serialization(name).as_deref() {
        Some("zip") => "application/zip",
        Some("tgz") | Some("gz") => "application/gzip",
        Some("7z") => "application/7z",
        _ => "application/octet-stream",
    }
}

fn distrib_error(err: DistribError) -> Response {
    match err {
        DistribError::NotFound(_) => send_error(StatusCode::NOT_FOUND, "AIP Not Found"),
        DistribError::ServerError(e) => {
            log::error!("Trouble accessing distrib service: {e}");
            send_error(StatusCode::BAD_GATEWAY, "Failure from upstream service")
        }
        DistribError::ClientError(e) => {
            log::error!("Failure using distrib service: {e}");
            send_error(StatusCode::BAD_GATEWAY, "Internal Failure")
        }
    }
}

fn negotiate(
    supp: &FormatSupport,
    formats: &[String],
    accepts: &[String],
) -> Result<Option<Format>, Response> {
    match supp.select_format(formats, accepts) {
        Ok(fmt) => Ok(fmt),
        Err(NegotiationError::Unacceptable) => {
            Err(send_error(StatusCode::NOT_ACCEPTABLE, "Not Acceptable"))
        }
        Err(NegotiationError::UnsupportedFormat) => {
            Err(send_error(StatusCode::BAD_REQUEST, "Unsupported Format"))
        }
    }
}

/// Resolve a request path under `/aip/`.
pub async fn resolve_aip_path(
    path: &str,
    formats: &[String],
    accepts: &[String],
    cli: &DistribClient,
) -> Response {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return ready();
    }

    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() == 1 {
        if is_legal_bag_name(parts[0]) {
            return resolve_aip_file(parts[0], formats, accepts, cli).await;
        }
        return resolve_aip_id(parts[0], None, formats, accepts, cli).await;
    }

    let aipid = parts[0];
    match parts[1] {
        DIST_DELIM => resolve_aip_distrib(aipid, &parts[2..].join("/"), formats, accepts, cli).await,
        HEAD_DELIM => {
            resolve_aip_head(aipid, None, &parts[2..].join("/"), formats, accepts, cli).await
        }
        VER_DELIM => {
            let version = parts.get(2).copied();
            let rest = if parts.len() > 3 { parts[3..].join("/") } else { String::new() };
            resolve_aip_version(aipid, version, &rest, formats, accepts, cli).await
        }
        _ => send_error(StatusCode::NOT_FOUND, "Not Found"),
    }
}

/// Information about the AIP: its head bag, versions, and sequence.
async fn resolve_aip_id(
    aipid: &str,
    version: Option<&str>,
    formats: &[String],
    accepts: &[String],
    cli: &DistribClient,
) -> Response {
    let mut supp = FormatSupport::new();
    add_text_support(&mut supp, false);
    supp.support(Format::new("json", "application/json"), &["text/json", "application/json"], true);

    let format = match negotiate(&supp, formats, accepts) {
        Ok(fmt) => fmt
            .or_else(|| supp.default_format())
            .unwrap_or_else(|| Format::new("json", "application/json")),
        Err(resp) => return resp,
    };

    let vers = match cli.list_versions(aipid).await {
        Ok(vers) => vers,
        Err(e) => return distrib_error(e),
    };
    let mut head = match cli.describe_head_for_version(aipid, version).await {
        Ok(head) => head,
        Err(e) => return distrib_error(e),
    };

    let mut out = Map::new();
    out.insert("aipid".to_string(), Value::String(aipid.to_string()));
    out.insert(
        "maxMultibagSequence".to_string(),
        head.get("multibagSequence").cloned().unwrap_or(Value::Null),
    );
    if let Some(since) = head.get("sinceVersion").cloned() {
        let key = if version.is_some() { "version" } else { "latestVersion" };
        out.insert(key.to_string(), since);
    }
    if let Some(obj) = head.as_object_mut() {
        obj.remove("aipid");
    }
    out.insert("headBag".to_string(), head);
    out.insert("versions".to_string(), json!(vers));

    json_ok(&Value::Object(out), &format.ctype)
}

/// Resolve a bag file name to its distribution endpoints.
async fn resolve_aip_file(
    aipbag: &str,
    formats: &[String],
    accepts: &[String],
    cli: &DistribClient,
) -> Response {
    let mut aipbag = aipbag.to_string();
    let mut default_native = true;
    if bag_serialization(&aipbag).is_none() {
        // resolve the name into an available serialized bag name
        let aipid = crate::distrib::bag_aipid(&aipbag).unwrap_or_default();
        let all = match cli.list_all(&aipid).await {
            Ok(all) => all,
            Err(e) => return distrib_error(e),
        };
        let prefix = format!("{aipbag}.");
        match all.into_iter().find(|b| b.starts_with(&prefix)) {
            Some(found) => aipbag = found,
            None => return send_error(StatusCode::NOT_FOUND, "AIP Not Found"),
        }
        default_native = false;
    }

    let mut supp = FormatSupport::new();
    supp.support(Format::new("json", "application/json"), &["text/json", "application/json"], false);
    let nct = native_ctype(&aipbag);
    supp.support(Format::new("native", nct), &[nct], default_native);

    let format = match negotiate(&supp, formats, accepts) {
        Ok(fmt) => fmt
            .or_else(|| supp.default_format())
            .unwrap_or_else(|| Format::new("json", "application/json")),
        Err(resp) => return resp,
    };

    let bagep = format!("{}/_aip/{aipbag}", cli.endpoint());
    match format.name.as_str() {
        "json" => redirect(StatusCode::TEMPORARY_REDIRECT, &format!("{bagep}/_info")),
        _ => redirect(StatusCode::TEMPORARY_REDIRECT, &bagep),
    }
}

/// List the distributions (bag files) of an AIP, or describe one of
/// them selected by sequence number or name.
async fn resolve_aip_distrib(
    aipid: &str,
    distid: &str,
    formats: &[String],
    accepts: &[String],
    cli: &DistribClient,
) -> Response {
    let dists = match cli.describe_all(aipid).await {
        Ok(dists) => dists,
        Err(e) => return distrib_error(e),
    };

    let dist = if distid.is_empty() {
        None
    } else {
        let found = match distid.parse::<i64>() {
            Ok(seq) => dists
                .iter()
                .find(|d| d.get("multibagSequence").and_then(Value::as_i64) == Some(seq)),
            Err(_) => dists.iter().find(|d| d.get("name").and_then(Value::as_str) == Some(distid)),
        };
        match found {
            Some(d) => Some(d.clone()),
            None => return send_error(StatusCode::NOT_FOUND, "Not Found"),
        }
    };

    let mut supp = FormatSupport::new();
    add_text_support(&mut supp, false);
    supp.support(Format::new("json", "application/json"), &["text/json", "application/json"], true);
    if let Some(dist) = &dist {
        let nct = native_ctype(dist.get("name").and_then(Value::as_str).unwrap_or_default());
        supp.support(Format::new("native", nct), &[nct], false);
    }

    let format = match negotiate(&supp, formats, accepts) {
        Ok(fmt) => fmt
            .or_else(|| supp.default_format())
            .unwrap_or_else(|| Format::new("json", "application/json")),
        Err(resp) => return resp,
    };

    match format.name.as_str() {
        "json" | "text" => match dist {
            Some(dist) => json_ok(&dist, &format.ctype),
            None => json_ok(&Value::Array(dists), &format.ctype),
        },
        _ => {
            let Some(dist) = dist else {
                return send_error(StatusCode::NOT_ACCEPTABLE, "Not Acceptable");
            };
            let bagep = dist
                .get("downloadURL")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| {
                    format!(
                        "{}/_aip/{}",
                        cli.endpoint(),
                        dist.get("name").and_then(Value::as_str).unwrap_or_default()
                    )
                });
            redirect(StatusCode::TEMPORARY_REDIRECT, &bagep)
        }
    }
}

/// Describe (or redirect to) the head bag for a version of the AIP.
async fn resolve_aip_head(
    aipid: &str,
    version: Option<&str>,
    path: &str,
    formats: &[String],
    accepts: &[String],
    cli: &DistribClient,
) -> Response {
    if !path.is_empty() {
        return send_error(StatusCode::FORBIDDEN, "Not a supported resource");
    }

    let head = match cli.describe_head_for_version(aipid, version).await {
        Ok(head) => head,
        Err(e) => return distrib_error(e),
    };

    let mut supp = FormatSupport::new();
    add_text_support(&mut supp, false);
    supp.support(Format::new("json", "application/json"), &["text/json", "application/json"], true);
    let nct = native_ctype(head.get("name").and_then(Value::as_str).unwrap_or_default());
    supp.support(Format::new("native", nct), &[nct], false);

    let format = match negotiate(&supp, formats, accepts) {
        Ok(fmt) => fmt
            .or_else(|| supp.default_format())
            .unwrap_or_else(|| Format::new("json", "application/json")),
        Err(resp) => return resp,
    };

    match format.name.as_str() {
        "json" | "text" => json_ok(&head, &format.ctype),
        _ => {
            let bagep = head
                .get("downloadURL")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| {
                    format!(
                        "{}/_aip/{}",
                        cli.endpoint(),
                        head.get("name").and_then(Value::as_str).unwrap_or_default()
                    )
                });
            redirect(StatusCode::TEMPORARY_REDIRECT, &bagep)
        }
    }
}

/// Dispatch under `<aipid>/pdr:v[/<version>[/...]]`.
async fn resolve_aip_version(
    aipid: &str,
    version: Option<&str>,
    path: &str,
    formats: &[String],
    accepts: &[String],
    cli: &DistribClient,
) -> Response {
    let Some(version) = version else {
        // just list the versions available
        let target = format!("{}/{aipid}/_aip/_v", cli.endpoint());
        return redirect(StatusCode::TEMPORARY_REDIRECT, &target);
    };

    let parts: Vec<&str> = path.trim_matches('/').split('/').filter(|p| !p.is_empty()).collect();
    match parts.first() {
        Some(&HEAD_DELIM) => {
            if parts.len() > 1 {
                return send_error(StatusCode::FORBIDDEN, "Not supported");
            }
            resolve_aip_head(aipid, Some(version), "", formats, accepts, cli).await
        }
        Some(&DIST_DELIM) => {
            if parts.len() > 1 {
                return send_error(StatusCode::FORBIDDEN, "Not supported");
            }
            resolve_dists_for_version(aipid, version, formats, accepts, cli).await
        }
        Some(_) => send_error(StatusCode::NOT_FOUND, "Not Found"),
        None => resolve_aip_id(aipid, Some(version), formats, accepts, cli).await,
    }
}

/// The distributions participating in a particular version: the full
/// list filtered down to the members named by the version's head-bag
/// multibag manifest.
async fn resolve_dists_for_version(
    aipid: &str,
    version: &str,
    formats: &[String],
    accepts: &[String],
    cli: &DistribClient,
) -> Response {
    let head = match cli.describe_head_for_version(aipid, Some(version)).await {
        Ok(head) => head,
        Err(e) => return distrib_error(e),
    };
    let dists = match cli.describe_all(aipid).await {
        Ok(dists) => dists,
        Err(e) => return distrib_error(e),
    };

    let mut supp = FormatSupport::new();
    add_text_support(&mut supp, false);
    supp.support(Format::new("json", "application/json"), &["text/json", "application/json"], true);

    let format = match negotiate(&supp, formats, accepts) {
        Ok(fmt) => fmt
            .or_else(|| supp.default_format())
            .unwrap_or_else(|| Format::new("json", "application/json")),
        Err(resp) => return resp,
    };

    let headname = head.get("name").and_then(Value::as_str).unwrap_or_default();
    let members = match cli.head_member_bags(headname).await {
        Ok(members) => members,
        Err(e) => return distrib_error(e),
    };

    let out: Vec<Value> = dists
        .into_iter()
        .filter(|d| {
            d.get("name")
                .and_then(Value::as_str)
                .map(bag_stem)
                .is_some_and(|stem| members.iter().any(|m| *m == stem))
        })
        .collect();

    json_ok(&Value::Array(out), &format.ctype)
}

/// A bag file name without its serialization extension.
fn bag_stem(name: &str) -> String {
    match bag_serialization(name) {
        Some(ext) => name.trim_end_matches(&format!(".{ext}")).to_string(),
        None => name.to_string(),
    }
}
