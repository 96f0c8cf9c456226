//! Resolution of PDR resource identifiers under the `/id/` endpoint.

use axum::http::StatusCode;
use axum::response::Response;
use serde_json::Value;

use midas_shared::ids::{
    classify_path, split_old_version_ext, ArkId, IdPath, AGGCMP_EXTENSION, RELHIST_EXTENSION,
};

use crate::describe::{DescribeError, HybridClient};

use super::format::{add_html_support, add_text_support, Format, FormatSupport, NegotiationError};
use super::{json_ok, ready, redirect, send_error, ReadmeGenerator, ResolverConfig};

/// Resolve a request path under `/id/`.  The path is a PDR identifier
/// (or a short-hand of one), possibly carrying version/component
/// suffixes.
pub async fn resolve_pdr_path(
    path: &str,
    formats: &[String],
    accepts: &[String],
    cfg: &ResolverConfig,
    md: &HybridClient,
    readme: &dyn ReadmeGenerator,
) -> Response {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return ready();
    }

    let (mut dsid, mut rest) = match ArkId::parse(path) {
        Some(ark) => {
            if ark.dsid.is_empty() {
                return send_error(StatusCode::FORBIDDEN, "Missing dataset ID");
            }
            if !cfg.ignore_naan && ark.naan != cfg.naan {
                return send_error(StatusCode::NOT_FOUND, "Unrecognized ID NAAN");
            }
            (ark.base(), ark.path)
        }
        None => {
            // ark: prefix omitted; determine which kind of short-hand
            let (head, tail) = match path.split_once('/') {
                Some((head, tail)) => (head.to_string(), tail.to_string()),
                None => (path.to_string(), String::new()),
            };
            if head.len() < 32 {
                // a reduced PDR ID; longer ids are old-style EDI records
                (format!("ark:/{}/{head}", cfg.naan), tail)
            } else {
                (head, tail)
            }
        }
    };

    // backward compatibility: version access via a ".vN_N_N" extension
    if let Some((bare, ver)) = split_old_version_ext(&dsid) {
        rest = format!("{}/{ver}/{rest}", RELHIST_EXTENSION.trim_start_matches('/'));
        dsid = bare;
    }

    match classify_path(&rest) {
        IdPath::Dataset => resolve_dataset(&dsid, None, formats, accepts, cfg, md, readme).await,
        IdPath::ReleaseHistory => resolve_release_history(&dsid, formats, accepts, md).await,
        IdPath::Version(ver) => {
            resolve_dataset(&dsid, Some(&ver), formats, accepts, cfg, md, readme).await
        }
        IdPath::VersionComponent(ver, cmp) => {
            resolve_component(&dsid, &cmp, Some(&ver), formats, accepts, cfg, md).await
        }
        IdPath::Component(cmp) => {
            resolve_component(&dsid, &cmp, None, formats, accepts, cfg, md).await
        }
    }
}

fn md_error(err: DescribeError, what: &str) -> Response {
    match err {
        DescribeError::IdNotFound(_) => {
            send_error(StatusCode::NOT_FOUND, &format!("{what} Not Found"))
        }
        err => {
            log::error!("Trouble accessing metadata service: {err}");
            send_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "Metadata Service Temporarily Unavailable",
            )
        }
    }
}

/// Send a representation of an identified dataset (possibly a specific
/// version of it).
async fn resolve_dataset(
    dsid: &str,
    version: Option<&str>,
    formats: &[String],
    accepts: &[String],
    cfg: &ResolverConfig,
    md: &HybridClient,
    readme: &dyn ReadmeGenerator,
) -> Response {
    let mut supp = FormatSupport::new();
    add_html_support(&mut supp, false);
    add_text_support(&mut supp, false);
    supp.support(Format::new("nerdm", "application/json"), &["text/json", "application/json"], true);

    let format = match supp.select_format(formats, accepts) {
        Ok(Some(fmt)) => fmt,
        Ok(None) => supp
            .default_format()
            .unwrap_or_else(|| Format::new("nerdm", "application/json")),
        Err(NegotiationError::Unacceptable) => {
            return send_error(StatusCode::NOT_ACCEPTABLE, "Not Acceptable")
        }
        Err(NegotiationError::UnsupportedFormat) => {
            return send_error(StatusCode::BAD_REQUEST, "Unsupported Format")
        }
    };

    if format.name == "html" {
        let Some(base) = &cfg.landing_page_service else {
            return send_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Missing required configuration: landing_page_service",
            );
        };
        let mut target = format!("{}/{dsid}", base.trim_end_matches('/'));
        if let Some(ver) = version {
            target.push_str(RELHIST_EXTENSION);
            target.push('/');
            target.push_str(ver);
        }
        return redirect(StatusCode::TEMPORARY_REDIRECT, &target);
    }

    let nerdm = match md.describe(dsid, version).await {
        Ok(nerdm) => nerdm,
        Err(e) => return md_error(e, "Dataset ID"),
    };

    if format.name == "text" {
        return match readme.generate(&nerdm) {
            Ok(text) => super::body_response(StatusCode::OK, "text/plain", text),
            Err(e) => {
                log::error!("Trouble generating plain text: {e}");
                send_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Trouble generating plain text description",
                )
            }
        };
    }
    json_ok(&nerdm, &format.ctype)
}

/// Send the release-history view of a dataset.
async fn resolve_release_history(
    dsid: &str,
    formats: &[String],
    accepts: &[String],
    md: &HybridClient,
) -> Response {
    let mut supp = FormatSupport::new();
    supp.support(Format::new("nerdm", "application/json"), &["text/json", "application/json"], true);

    let format = match supp.select_format(formats, accepts) {
        Ok(Some(fmt)) => fmt,
        Ok(None) => supp
            .default_format()
            .unwrap_or_else(|| Format::new("nerdm", "application/json")),
        Err(NegotiationError::Unacceptable) => {
            return send_error(StatusCode::NOT_ACCEPTABLE, "Not Acceptable")
        }
        Err(NegotiationError::UnsupportedFormat) => {
            return send_error(StatusCode::BAD_REQUEST, "Unsupported Format")
        }
    };

    let relid = format!("{dsid}{RELHIST_EXTENSION}");
    match md.describe(&relid, None).await {
        Ok(nerdm) => json_ok(&nerdm, &format.ctype),
        Err(e) => md_error(e, "Dataset ID"),
    }
}

/// Send a view of a dataset component (usually a file).
async fn resolve_component(
    dsid: &str,
    cmppath: &str,
    version: Option<&str>,
    formats: &[String],
    accepts: &[String],
    cfg: &ResolverConfig,
    md: &HybridClient,
) -> Response {
    let cmpid = format!("{dsid}/{cmppath}");
    let cmpmd = match md.describe(&cmpid, version).await {
        Ok(cmpmd) => cmpmd,
        Err(e) => return md_error(e, "Component ID"),
    };

    let agg_delim = AGGCMP_EXTENSION.trim_start_matches('/');
    if cmppath.starts_with(agg_delim) {
        // an included resource; does the client want NERDm format?
        let wants_json = formats
            .first()
            .is_some_and(|f| f == "nerdm" || f == "application/json");
        if wants_json {
            return json_ok(&cmpmd, "application/json");
        }

        // otherwise, redirect to it if possible
        if let Some(id) = cmpmd.get("@id").and_then(Value::as_str) {
            if ArkId::parse(id).is_some() {
                let Some(base) = &cfg.resolver_service else {
                    return send_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Missing required config: resolver_service",
                    );
                };
                let target = format!("{}/{id}", base.trim_end_matches('/'));
                return redirect(StatusCode::FOUND, &target);
            }
        }
        if let Some(loc) = cmpmd.get("location").and_then(Value::as_str) {
            return redirect(StatusCode::FOUND, loc);
        }
    }

    let mut supp = FormatSupport::new();
    add_text_support(&mut supp, false);
    supp.support(Format::new("nerdm", "application/json"), &["text/json", "application/json"], true);

    let redirurl = cmpmd
        .get("downloadURL")
        .or_else(|| cmpmd.get("accessURL"))
        .and_then(Value::as_str)
        .map(String::from);
    let media_type = cmpmd.get("mediaType").and_then(Value::as_str).map(String::from);
    let native = media_type.as_deref().map(|mt| Format::new("native", mt));
    if let (Some(native), true) = (&native, redirurl.is_some() || media_type.is_some()) {
        supp.support(native.clone(), &[&native.ctype], true);
    }

    let format = match supp.select_format(formats, accepts) {
        Ok(Some(fmt)) => fmt,
        Ok(None) => match (&redirurl, &native) {
            (Some(_), Some(native)) => native.clone(),
            _ => Format::new("nerdm", "application/json"),
        },
        Err(NegotiationError::Unacceptable) => {
            return send_error(StatusCode::NOT_ACCEPTABLE, "Not Acceptable")
        }
        Err(NegotiationError::UnsupportedFormat) => {
            return send_error(StatusCode::BAD_REQUEST, "Unsupported Format")
        }
    };

    if format.name == "nerdm" || format.name == "text" {
        return json_ok(&cmpmd, &format.ctype);
    }
    if format.name == "native" {
        if let Some(url) = redirurl {
            return redirect(StatusCode::FOUND, &url);
        }
    }
    send_error(StatusCode::NOT_ACCEPTABLE, "Not Acceptable")
}
