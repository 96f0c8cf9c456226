//! Output-format negotiation for the resolver.
//!
//! Selection works over two axes: an ordered list of `format` query
//! parameters takes priority, with the `Accept` header (ordered by
//! q-value) as the fallback.  A requested-but-unsupported format is an
//! [`UnsupportedFormat`](NegotiationError::UnsupportedFormat) (400);
//! a supported format the client cannot accept is
//! [`Unacceptable`](NegotiationError::Unacceptable) (406).

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    pub name: String,
    pub ctype: String,
}

impl Format {
    pub fn new(name: &str, ctype: &str) -> Format {
        Format { name: name.to_string(), ctype: ctype.to_string() }
    }
}

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("format parameter is inconsistent with Accept header")]
    Unacceptable,

    #[error("Unsupported format requested")]
    UnsupportedFormat,
}

/// True if a format label uses MIME-type syntax.
pub fn is_content_type(label: &str) -> bool {
    label.contains('/')
}

/// Match two content types, honoring `*` wildcards; returns the more
/// specific of the two on a match.
pub fn match_accept<'a>(ctype: &'a str, acceptable: &'a str) -> Option<&'a str> {
    if ctype == acceptable {
        return Some(ctype);
    }
    if let Some(prefix) = acceptable.strip_suffix("/*") {
        if ctype.starts_with(prefix) {
            return Some(ctype);
        }
    }
    if let Some(prefix) = ctype.strip_suffix("/*") {
        if acceptable.starts_with(prefix) {
            return Some(acceptable);
        }
    }
    None
}

/// The first acceptable match of a content type against an ordered
/// accept list.
pub fn acceptable<'a>(ctype: &'a str, accepts: &'a [String]) -> Option<&'a str> {
    if accepts.is_empty() {
        return Some(ctype);
    }
    if ctype == "*" || ctype == "*/*" {
        return Some(&accepts[0]);
    }
    accepts.iter().find_map(|acc| match_accept(ctype, acc))
}

static QVAL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r";q=(\d+(\.\d+)?)").unwrap());

/// Order the values of an `Accept` header by q-value, dropping the
/// parameters (and any zero-q entries).
pub fn order_accepts(header: &str) -> Vec<String> {
    let mut entries: Vec<(String, f32)> = header
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            let q = QVAL_RE
                .captures(v)
                .and_then(|c| c[1].parse::<f32>().ok())
                .unwrap_or(1.0);
            let ctype = v.split(';').next().unwrap_or(v).trim().to_string();
            (ctype, q)
        })
        .collect();
    entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    entries.into_iter().filter(|(_, q)| *q > 0.0).map(|(c, _)| c).collect()
}

/// The formats a handler supports, and the negotiation over them.
#[derive(Default)]
pub struct FormatSupport {
    lu: HashMap<String, Format>,
    ctps: HashMap<String, HashSet<String>>,
    default: Option<Format>,
}

impl FormatSupport {
    pub fn new() -> FormatSupport {
        FormatSupport::default()
    }

    /// Register support for a named format, listing the content types
    /// that should select it.
    pub fn support(&mut self, format: Format, cts: &[&str], asdefault: bool) {
        if self.lu.contains_key(&format.name) {
            self.lu.retain(|_, f| f.name != format.name);
        }
        for ct in cts {
            self.lu.insert(ct.to_string(), format.clone());
        }
        self.lu.insert(format.name.clone(), format.clone());
        let mut all: HashSet<String> = cts.iter().map(|c| c.to_string()).collect();
        all.insert(format.ctype.clone());
        self.ctps.insert(format.name.clone(), all);

        if asdefault || self.default.is_none() {
            self.default = Some(format);
        }
    }

    pub fn default_format(&self) -> Option<Format> {
        self.default.clone()
    }

    /// The supported format best matching a content type or format
    /// name.
    pub fn match_format(&self, fmtreq: &str) -> Option<Format> {
        if fmtreq == "*/*" || fmtreq == "*" {
            return self.default_format();
        }
        if let Some(prefix) = fmtreq.strip_suffix("/*") {
            let mimestart = format!("{prefix}/");
            if let Some(def) = &self.default {
                if def.ctype.starts_with(&mimestart) {
                    return Some(def.clone());
                }
            }
            return self
                .lu
                .iter()
                .find(|(ct, _)| ct.starts_with(&mimestart))
                .map(|(_, f)| f.clone());
        }
        let fmt = self.lu.get(fmtreq)?;
        if is_content_type(fmtreq) {
            Some(Format::new(&fmt.name, fmtreq))
        } else {
            Some(fmt.clone())
        }
    }

    /// Pick a format given the client's ordered `format` parameters and
    /// `Accept` content types.  `Ok(None)` means nothing was requested
    /// and the caller should fall back to the default.
    pub fn select_format(&self, formats: &[String], accepts: &[String])
        -> Result<Option<Format>, NegotiationError>
    {
        if !formats.is_empty() {
            let mut unacceptable = false;
            for label in formats {
                let Some(fmt) = self.match_format(label) else {
                    continue;
                };

                if accepts.is_empty()
                    || accepts.iter().any(|a| a == "*" || a == "*/*")
                {
                    return Ok(Some(fmt));
                }

                if is_content_type(label) {
                    if let Some(mct) = acceptable(label, accepts) {
                        if mct.ends_with("/*") && match_accept(mct, &fmt.ctype).is_some() {
                            return Ok(Some(fmt));
                        }
                        return Ok(Some(Format::new(&fmt.name, mct)));
                    }
                } else {
                    // match the acceptable types against all those
                    // associated with the named format
                    let cts: Vec<String> = self
                        .ctps
                        .get(&fmt.name)
                        .map(|s| s.iter().cloned().collect())
                        .unwrap_or_default();
                    for ct in accepts {
                        if let Some(mct) = acceptable(ct, &cts) {
                            if !mct.ends_with("/*") {
                                return Ok(Some(Format::new(&fmt.name, mct)));
                            }
                        }
                    }
                }
                unacceptable = true;
            }

            return if unacceptable {
                Err(NegotiationError::Unacceptable)
            } else {
                Err(NegotiationError::UnsupportedFormat)
            };
        }

        if !accepts.is_empty() {
            for label in accepts {
                if let Some(fmt) = self.match_format(label) {
                    if is_content_type(label) && !label.ends_with("/*") {
                        return Ok(Some(Format::new(&fmt.name, label)));
                    }
                    return Ok(Some(fmt));
                }
            }
            return Err(NegotiationError::Unacceptable);
        }

        Ok(None)
    }
}

/// Add HTML output support to a handler's format set.
pub fn add_html_support(sup: &mut FormatSupport, asdefault: bool) {
    sup.support(
        Format::new("html", "text/html"),
        &["application/html", "text/html", "application/xhtml", "application/xhtml+xml"],
        asdefault,
    );
}

/// Add plain-text output support to a handler's format set.
pub fn add_text_support(sup: &mut FormatSupport, asdefault: bool) {
    sup.support(Format::new("text", "text/plain"), &["text/plain"], asdefault);
}

#[cfg(test)]
mod test {
    use super::*;

    fn nerdm_support() -> FormatSupport {
        let mut sup = FormatSupport::new();
        add_html_support(&mut sup, false);
        add_text_support(&mut sup, false);
        sup.support(Format::new("nerdm", "application/json"), &["text/json", "application/json"], true);
        sup
    }

    #[test]
    fn test_order_accepts() {
        let ordered = order_accepts("text/html;q=0.5, application/json, text/plain;q=0.8");
        assert_eq!(ordered, vec!["application/json", "text/plain", "text/html"]);
        assert!(order_accepts("text/html;q=0").is_empty());
    }

    #[test]
    fn test_accept_header_fallback() {
        let sup = nerdm_support();
        let fmt = sup
            .select_format(&[], &["application/json".to_string()])
            .unwrap()
            .unwrap();
        assert_eq!(fmt.name, "nerdm");
        assert_eq!(fmt.ctype, "application/json");

        // nothing requested: default applies
        assert!(sup.select_format(&[], &[]).unwrap().is_none());
        assert_eq!(sup.default_format().unwrap().name, "nerdm");
    }

    #[test]
    fn test_format_param_overrides_accept() {
        let sup = nerdm_support();
        let fmt = sup
            .select_format(&["text".to_string()], &["text/plain".to_string()])
            .unwrap()
            .unwrap();
        assert_eq!(fmt.name, "text");
    }

    #[test]
    fn test_format_vs_accept_conflict_is_unacceptable() {
        let sup = nerdm_support();
        let err = sup
            .select_format(&["html".to_string()], &["application/json".to_string()])
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Unacceptable));
    }

    #[test]
    fn test_unknown_format_is_unsupported() {
        let sup = nerdm_support();
        let err = sup.select_format(&["datacite".to_string()], &[]).unwrap_err();
        assert!(matches!(err, NegotiationError::UnsupportedFormat));
    }

    #[test]
    fn test_wildcard_accepts() {
        let sup = nerdm_support();
        let fmt = sup
            .select_format(&["html".to_string()], &["*/*".to_string()])
            .unwrap()
            .unwrap();
        assert_eq!(fmt.name, "html");

        let fmt = sup.select_format(&[], &["text/*".to_string()]).unwrap().unwrap();
        assert!(fmt.name == "html" || fmt.name == "text" || fmt.name == "nerdm");
    }
}
