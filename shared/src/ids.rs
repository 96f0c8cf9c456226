//! The PDR identifier grammar.
//!
//! Record identifiers come in two forms: the compact draft form
//! `SHOULDER:LOCAL` minted by the record store, and the public ARK form
//! `ark:/NAAN/DSID` assigned at publication.  ARK identifiers may carry
//! suffix paths selecting views of the resource:
//!
//! - `/pdr:v`: the release history,
//! - `/pdr:v/VER`: a specific version,
//! - `/pdr:f/PATH`: a file or subcollection component,
//! - `/pdr:a/ID`: an aggregated (included) resource,
//! - `/pdr:c`: the component listing (treated as the dataset itself).

use std::sync::LazyLock;

use regex::Regex;

/// The institution's ARK Name Assigning Authority Number.
pub const ARK_NAAN: &str = "88434";

pub const RELHIST_EXTENSION: &str = "/pdr:v";
pub const FILECMP_EXTENSION: &str = "/pdr:f";
pub const LINKCMP_EXTENSION: &str = "/pdr:d";
pub const AGGCMP_EXTENSION: &str = "/pdr:a";
pub const COMP_EXTENSION: &str = "/pdr:c";
pub const HEADBAG_EXTENSION: &str = "/pdr:h";
pub const OLD_COMP_DELIM: &str = "/cmps";

static ARK_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ark:/(\d+)/([\w.\-]+)(/([^#?]*))?([#?].*)?$").unwrap());

static RECID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\w+):([\w\-/]+)$").unwrap());

static OLD_VER_EXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.v?(\d+(_\d+(_\d+)?)?)$").unwrap());

/// A parsed ARK identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArkId {
    pub naan: String,
    /// The dataset part of the identifier (no path).
    pub dsid: String,
    /// Anything after the dataset id, without its leading slash.
    pub path: String,
}

impl ArkId {
    /// Parse a full `ark:/NAAN/DSID[/PATH]` identifier.
    pub fn parse(id: &str) -> Option<ArkId> {
        let caps = ARK_ID_RE.captures(id)?;
        Some(ArkId {
            naan: caps[1].to_string(),
            dsid: caps[2].to_string(),
            path: caps.get(4).map(|m| m.as_str().to_string()).unwrap_or_default(),
        })
    }

    /// The base dataset identifier: `ark:/NAAN/DSID`.
    pub fn base(&self) -> String {
        format!("ark:/{}/{}", self.naan, self.dsid)
    }
}

/// Classification of the suffix path attached to an ARK identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdPath {
    /// No suffix: the dataset itself.
    Dataset,
    /// `/pdr:v`: the release history view.
    ReleaseHistory,
    /// `/pdr:v/VER`: a specific version of the dataset.
    Version(String),
    /// `/pdr:v/VER/...`: a component of a specific version.
    VersionComponent(String, String),
    /// `/pdr:f/PATH`, `/pdr:a/ID`, or legacy `/cmps/PATH`: a component.
    Component(String),
}

/// Classify the suffix path of an identifier.  Legacy `cmps/` paths are
/// normalized to the `pdr:f/` delimiter, and a bare `pdr:c` is treated
/// as the dataset itself.
pub fn classify_path(path: &str) -> IdPath {
    let mut path = path.trim_matches('/').to_string();
    if path.is_empty() || path == COMP_EXTENSION.trim_start_matches('/') {
        return IdPath::Dataset;
    }
    if let Some(rest) = path.strip_prefix("cmps/") {
        path = format!("pdr:f/{rest}");
    } else if path == "cmps" {
        return IdPath::Dataset;
    }

    let ver_delim = RELHIST_EXTENSION.trim_start_matches('/');
    if path == ver_delim {
        return IdPath::ReleaseHistory;
    }
    if let Some(rest) = path.strip_prefix(&format!("{ver_delim}/")) {
        let mut parts = rest.splitn(2, '/');
        let version = parts.next().unwrap_or_default().to_string();
        match parts.next() {
            Some(sub) if !sub.is_empty() => {
                let mut sub = sub.to_string();
                if let Some(r) = sub.strip_prefix("cmps/") {
                    sub = format!("pdr:f/{r}");
                }
                IdPath::VersionComponent(version, sub)
            }
            _ => IdPath::Version(version),
        }
    } else {
        IdPath::Component(path)
    }
}

/// Rewrite an old-style version extension (`.v1_2_3` or `.1_2_3` on the
/// dataset id) into the `(dsid, version)` pair, if present.
pub fn split_old_version_ext(dsid: &str) -> Option<(String, String)> {
    let m = OLD_VER_EXT_RE.find(dsid)?;
    let ver = OLD_VER_EXT_RE.captures(dsid)?[1].replace('_', ".");
    Some((dsid[..m.start()].to_string(), ver))
}

/// Parse a draft record identifier into its shoulder and record number.
pub fn parse_recid(id: &str) -> Option<(String, u32)> {
    let (shoulder, local) = id.rsplit_once(':')?;
    let num = local.parse::<u32>().ok()?;
    Some((shoulder.to_string(), num))
}

/// Map a draft record identifier (`SHOULDER:LOCAL`) into its public ARK
/// form (`ark:/NAAN/SHOULDER-LOCAL`).  Identifiers not in the draft
/// form, including ones already arkified, are returned unchanged.
pub fn arkify_recid(recid: &str, naan: &str) -> String {
    if recid.starts_with("ark:") {
        return recid.to_string();
    }
    match RECID_RE.captures(recid) {
        Some(caps) => format!("ark:/{}/{}-{}", naan, &caps[1], &caps[2]),
        None => recid.to_string(),
    }
}

/// The suffix that selects a specific version of a resource.
pub fn version_ext(version: &str) -> String {
    format!("{RELHIST_EXTENSION}/{version}")
}

/// Mint the identifier form used for group records.
pub fn group_id(shoulder: &str, owner: &str, name: &str) -> String {
    format!("{shoulder}:{owner}:{name}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_ark() {
        let id = ArkId::parse("ark:/88434/mds2-1234").unwrap();
        assert_eq!(id.naan, "88434");
        assert_eq!(id.dsid, "mds2-1234");
        assert_eq!(id.path, "");
        assert_eq!(id.base(), "ark:/88434/mds2-1234");

        let id = ArkId::parse("ark:/88434/mds2-1234/pdr:v/1.0.0/pdr:f/a/b.txt").unwrap();
        assert_eq!(id.dsid, "mds2-1234");
        assert_eq!(id.path, "pdr:v/1.0.0/pdr:f/a/b.txt");

        assert!(ArkId::parse("doi:10.18434/m32").is_none());
    }

    #[test]
    fn test_classify_path() {
        assert_eq!(classify_path(""), IdPath::Dataset);
        assert_eq!(classify_path("pdr:c"), IdPath::Dataset);
        assert_eq!(classify_path("pdr:v"), IdPath::ReleaseHistory);
        assert_eq!(classify_path("pdr:v/1.2.0"), IdPath::Version("1.2.0".to_string()));
        assert_eq!(
            classify_path("pdr:v/1.0.0/pdr:f/dir/file.txt"),
            IdPath::VersionComponent("1.0.0".to_string(), "pdr:f/dir/file.txt".to_string())
        );
        assert_eq!(
            classify_path("pdr:f/dir/file.txt"),
            IdPath::Component("pdr:f/dir/file.txt".to_string())
        );
        assert_eq!(
            classify_path("cmps/dir/file.txt"),
            IdPath::Component("pdr:f/dir/file.txt".to_string())
        );
        assert_eq!(
            classify_path("pdr:v/1.0.0/cmps/f.txt"),
            IdPath::VersionComponent("1.0.0".to_string(), "pdr:f/f.txt".to_string())
        );
    }

    #[test]
    fn test_old_version_ext() {
        assert_eq!(
            split_old_version_ext("mds2-1234.v1_0_2"),
            Some(("mds2-1234".to_string(), "1.0.2".to_string()))
        );
        assert_eq!(
            split_old_version_ext("mds2-1234.1_3"),
            Some(("mds2-1234".to_string(), "1.3".to_string()))
        );
        assert_eq!(split_old_version_ext("mds2-1234"), None);
    }

    #[test]
    fn test_recid_forms() {
        assert_eq!(parse_recid("mdm1:0004"), Some(("mdm1".to_string(), 4)));
        assert_eq!(parse_recid("mdm1"), None);
        assert_eq!(parse_recid("grp0:u1:friends"), None);

        assert_eq!(arkify_recid("mdm1:0004", ARK_NAAN), "ark:/88434/mdm1-0004");
        assert_eq!(arkify_recid("ark:/88434/x", ARK_NAAN), "ark:/88434/x");
        assert_eq!(group_id("grp0", "u1", "friends"), "grp0:u1:friends");
    }
}
