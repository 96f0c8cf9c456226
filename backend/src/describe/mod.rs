//! Clients for resolving public NERDm metadata.
//!
//! Two sources back the resolver: the remote RMM service and a local
//! file cache holding records too large for the RMM's document store.
//! The [`hybrid::HybridClient`] coordinates the two.

pub mod altbig;
pub mod hybrid;
pub mod rmm;

use serde_json::Value;
use thiserror::Error;

pub use hybrid::HybridClient;

#[derive(Error, Debug)]
pub enum DescribeError {
    #[error("identifier not found: {0}")]
    IdNotFound(String),

    #[error("{resource}: client-side metadata error: {code} {reason}")]
    ClientError { resource: String, code: u16, reason: String },

    #[error("{resource}: metadata server error: {message}")]
    ServerError { resource: String, message: String },
}

impl DescribeError {
    pub fn server(resource: &str, message: impl std::fmt::Display) -> Self {
        DescribeError::ServerError { resource: resource.to_string(), message: message.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, DescribeError>;

/// Patch a component record extracted from its containing resource so
/// it stands alone: the `@id` becomes ARK-qualified, `isPartOf` points
/// at the (possibly version-specific) dataset, and the dataset's
/// `@context` and `version` are carried over.
pub fn patch_component(cmpmd: &mut Value, dsmd: &Value, dsid: &str, version: Option<&str>) {
    let mut partof = dsid.to_string();
    if let Some(ver) = version {
        partof.push_str(&midas_shared::ids::version_ext(ver));
    }
    let Some(obj) = cmpmd.as_object_mut() else {
        return;
    };
    obj.insert("isPartOf".to_string(), Value::String(partof.clone()));
    let cmpid = obj.get("@id").and_then(Value::as_str).map(String::from);
    if let Some(cmpid) = cmpid {
        if !cmpid.starts_with('/') && !cmpid.starts_with('#') {
            partof.push('/');
        }
        obj.insert("@id".to_string(), Value::String(format!("{partof}{cmpid}")));
    }
    if let Some(ctx) = dsmd.get("@context") {
        obj.insert("@context".to_string(), ctx.clone());
    }
    if !obj.contains_key("version") {
        if let Some(ver) = dsmd.get("version") {
            obj.insert("version".to_string(), ver.clone());
        }
    }
}

/// Find a component by its relative `@id` within a resource, trying the
/// legacy `cmps/` delimiter as a fallback.
pub fn find_component(dsmd: &Value, cmpid: &str) -> Option<Value> {
    let components = dsmd.get("components")?.as_array()?;
    let find = cmpid.trim_start_matches('/');
    if let Some(hit) = components.iter().find(|c| c.get("@id").and_then(Value::as_str) == Some(find))
    {
        return Some(hit.clone());
    }

    // support the old file-component delimiter in stored ids
    let alt = if let Some(rest) = find.strip_prefix("pdr:f/") {
        format!("cmps/{rest}")
    } else if let Some(rest) = find.strip_prefix("cmps/") {
        format!("pdr:f/{rest}")
    } else {
        return None;
    };
    components.iter().find(|c| c.get("@id").and_then(Value::as_str) == Some(alt.as_str())).cloned()
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_find_component_with_legacy_fallback() {
        let dsmd = json!({"components": [
            {"@id": "pdr:f/dir/file.txt", "filepath": "dir/file.txt"},
            {"@id": "cmps/old/style.dat"},
        ]});
        assert!(find_component(&dsmd, "pdr:f/dir/file.txt").is_some());
        assert!(find_component(&dsmd, "cmps/dir/file.txt").is_some());
        assert!(find_component(&dsmd, "pdr:f/old/style.dat").is_some());
        assert!(find_component(&dsmd, "pdr:f/missing.txt").is_none());
    }

    #[test]
    fn test_patch_component() {
        let dsmd = json!({"@context": ["ctx"], "version": "1.0.0"});
        let mut cmp = json!({"@id": "pdr:f/dir/file.txt"});
        patch_component(&mut cmp, &dsmd, "ark:/88434/mds2-1234", Some("1.0.0"));
        assert_eq!(cmp["isPartOf"], "ark:/88434/mds2-1234/pdr:v/1.0.0");
        assert_eq!(cmp["@id"], "ark:/88434/mds2-1234/pdr:v/1.0.0/pdr:f/dir/file.txt");
        assert_eq!(cmp["version"], "1.0.0");
        assert_eq!(cmp["@context"], json!(["ctx"]));
    }
}
