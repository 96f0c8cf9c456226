//! The alternate file cache for oversized NERDm records.
//!
//! Records too big for the RMM's document store are kept as flat JSON
//! files under a single directory, one full resource record (with
//! components) per released version.  File names have the form
//! `<AIPID>-v<VER>.json` with an underscore-delimited version.  A
//! `latest` pointer is maintained per id, and long-form EDI-IDs are
//! recognized as aliases via the record's embedded `@id`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use regex::Regex;
use serde_json::Value;

use midas_shared::ids::{classify_path, ArkId, IdPath, ARK_NAAN, COMP_EXTENSION, RELHIST_EXTENSION};
use midas_shared::version::OarVersion;

use super::{find_component, patch_component, DescribeError, Result};

static FNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-v(\d+_\d+_\d+)\.json$").unwrap());

static DLURL_VER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/_v/\d+\.\d+\.\d+").unwrap());

static LATEST_DL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/od/ds/(ark:/\d+/)*[\w\-]+/").unwrap());

#[derive(Default)]
struct Index {
    // id -> version label ("latest" included) -> file path
    versions: HashMap<String, HashMap<String, PathBuf>>,
}

pub struct AltBigClient {
    root: PathBuf,
    naan: String,
    index: Mutex<Option<Index>>,
}

impl AltBigClient {
    pub fn new(cachedir: impl Into<PathBuf>) -> Result<AltBigClient> {
        let root = cachedir.into();
        if !root.is_dir() {
            return Err(DescribeError::server(
                "altbig",
                format!("Metadata directory: {}: not found", root.display()),
            ));
        }
        Ok(AltBigClient { root, naan: ARK_NAAN.to_string(), index: Mutex::new(None) })
    }

    /// Scan the cache directory and build the version index.
    fn build_index(&self) -> Index {
        let mut idx = Index::default();
        let mut latest: HashMap<String, OarVersion> = HashMap::new();

        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return idx,
        };
        for entry in entries.flatten() {
            let fname = entry.file_name().to_string_lossy().to_string();
            let Some(m) = FNAME_RE.captures(&fname) else {
                continue;
            };
            let id = fname[..m.get(0).unwrap().start()].to_string();
            let ver = m[1].replace('_', ".");
            let path = entry.path();

            idx.versions.entry(id.clone()).or_default().insert(ver.clone(), path.clone());
            let parsed = OarVersion::parse(&ver);
            if latest.get(&id).map(|have| *have < parsed).unwrap_or(true) {
                latest.insert(id.clone(), parsed);
            }

            if id.len() > 30 {
                // the file is named by its EDI-ID; alias it under the
                // ARK id embedded in the record
                if let Ok(text) = std::fs::read_to_string(&path) {
                    if let Ok(nerdm) = serde_json::from_str::<Value>(&text) {
                        if let Some(ark) = nerdm
                            .get("@id")
                            .and_then(Value::as_str)
                            .and_then(ArkId::parse)
                        {
                            let alias = ark.dsid;
                            idx.versions
                                .entry(alias.clone())
                                .or_default()
                                .insert(ver.clone(), path.clone());
                            let parsed = OarVersion::parse(&ver);
                            if latest.get(&alias).map(|have| *have < parsed).unwrap_or(true) {
                                latest.insert(alias, parsed);
                            }
                        }
                    }
                }
            }
        }

        for (id, ver) in latest {
            let vers = idx.versions.entry(id).or_default();
            if let Some(path) = vers.get(&ver.to_string()).cloned() {
                vers.insert("latest".to_string(), path);
            }
        }
        idx
    }

    fn with_index<T>(&self, f: impl FnOnce(&Index) -> T) -> T {
        let mut guard = self.index.lock().unwrap();
        if guard.is_none() {
            *guard = Some(self.build_index());
        }
        f(guard.as_ref().unwrap())
    }

    fn direct_file(&self, aipid: &str, version: &str) -> PathBuf {
        self.root.join(format!("{aipid}-v{}.json", version.replace('.', "_")))
    }

    /// True if the cache holds the identified dataset (version).
    pub fn exists(&self, id: &str, version: Option<&str>) -> bool {
        let mut dsid = id.to_string();
        let mut version = version.map(String::from);
        if id.starts_with("ark:") {
            let Some(ark) = ArkId::parse(id) else {
                return false;
            };
            dsid = ark.dsid;
            if let IdPath::Version(ver) | IdPath::VersionComponent(ver, _) =
                classify_path(&ark.path)
            {
                version = Some(ver);
            }
        }

        if let Some(ver) = version.as_deref().filter(|v| *v != "latest") {
            if self.direct_file(&dsid, ver).is_file() {
                return true;
            }
        }
        self.with_index(|idx| match idx.versions.get(&dsid) {
            Some(vers) => match version {
                Some(ver) => vers.contains_key(&ver),
                None => true,
            },
            None => false,
        })
    }

    /// Return the NERDm metadata for the identified entity from the
    /// cache.
    pub fn describe(&self, id: &str, version: Option<&str>) -> Result<Value> {
        let mut find = id.trim_end_matches('/').to_string();
        if let Some(base) = find.strip_suffix(COMP_EXTENSION) {
            find = base.to_string();
        }
        if !find.starts_with("ark:") {
            find = format!("ark:/{}/{find}", self.naan);
        }

        let Some(ark) = ArkId::parse(&find) else {
            return Err(DescribeError::IdNotFound(id.to_string()));
        };

        match classify_path(&ark.path) {
            IdPath::Dataset => self.describe_version(&ark.dsid, version.unwrap_or("latest"), id),
            IdPath::ReleaseHistory => self.describe_releases(&ark.dsid, id),
            IdPath::Version(ver) => self.describe_version(&ark.dsid, &ver, id),
            IdPath::VersionComponent(ver, cmp) => {
                self.describe_component(&ark, &cmp, Some(&ver), id)
            }
            IdPath::Component(cmp) => self.describe_component(&ark, &cmp, version, id),
        }
    }

    fn describe_releases(&self, dsid: &str, reqid: &str) -> Result<Value> {
        let mut rec = self.describe_version(dsid, "latest", reqid)?;
        let Some(relhist) = rec.get("releaseHistory").cloned() else {
            return Err(DescribeError::IdNotFound(reqid.to_string()));
        };
        if let Some(obj) = rec.as_object_mut() {
            obj.remove("components");
            obj.insert(
                "hasRelease".to_string(),
                relhist.get("hasRelease").cloned().unwrap_or_else(|| Value::Array(Vec::new())),
            );
            let relid = obj
                .get("@id")
                .and_then(Value::as_str)
                .map(|id| format!("{id}{RELHIST_EXTENSION}"));
            if let Some(relid) = relid {
                obj.insert("@id".to_string(), Value::String(relid));
            }
        }
        Ok(rec)
    }

    fn describe_version(&self, dsid: &str, version: &str, reqid: &str) -> Result<Value> {
        let mut out = self.fetch(dsid, version, reqid)?;
        let recid = out.get("@id").and_then(Value::as_str).map(String::from);
        let idm = recid.as_deref().and_then(ArkId::parse);

        if version == "latest" {
            // strip any version path off the id and the download URLs
            if let Some(ark) = &idm {
                if !ark.path.is_empty() {
                    if let Some(obj) = out.as_object_mut() {
                        obj.insert("@id".to_string(), Value::String(ark.base()));
                    }
                }
            }
            if let Some(cmps) = out.get_mut("components").and_then(Value::as_array_mut) {
                for cmp in cmps {
                    if let Some(dl) = cmp.get("downloadURL").and_then(Value::as_str) {
                        let stripped = DLURL_VER_RE.replace_all(dl, "").to_string();
                        cmp["downloadURL"] = Value::String(stripped);
                    }
                }
            }
        } else if idm.as_ref().is_some_and(|ark| ark.path.is_empty()) {
            if let Some(obj) = out.as_object_mut() {
                let verid = format!("{}{RELHIST_EXTENSION}/{version}", recid.as_deref().unwrap_or(""));
                obj.insert("@id".to_string(), Value::String(verid));
            }
            if let Some(cmps) = out.get_mut("components").and_then(Value::as_array_mut) {
                for cmp in cmps {
                    let Some(dl) = cmp.get("downloadURL").and_then(Value::as_str) else {
                        continue;
                    };
                    if let Some(m) = LATEST_DL_RE.find(dl) {
                        if !dl[m.end()..].starts_with("_v/") {
                            let rewritten = format!(
                                "{}_v/{version}/{}",
                                &dl[..m.end()],
                                &dl[m.end()..]
                            );
                            cmp["downloadURL"] = Value::String(rewritten);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn describe_component(
        &self,
        ark: &ArkId,
        cmpid: &str,
        version: Option<&str>,
        reqid: &str,
    ) -> Result<Value> {
        let dsmd = self.describe_version(&ark.dsid, version.unwrap_or("latest"), reqid)?;
        let mut cmpmd = find_component(&dsmd, cmpid)
            .ok_or_else(|| DescribeError::IdNotFound(reqid.to_string()))?;
        patch_component(&mut cmpmd, &dsmd, &ark.base(), version);
        Ok(cmpmd)
    }

    fn fetch(&self, aipid: &str, version: &str, reqid: &str) -> Result<Value> {
        if version != "latest" {
            let direct = self.direct_file(aipid, version);
            if direct.is_file() {
                return self.read_file(&direct, reqid);
            }
        }
        let path = self.with_index(|idx| {
            idx.versions.get(aipid).and_then(|vers| vers.get(version)).cloned()
        });
        match path {
            Some(path) => self.read_file(&path, reqid),
            None => Err(DescribeError::IdNotFound(reqid.to_string())),
        }
    }

    fn read_file(&self, path: &Path, reqid: &str) -> Result<Value> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DescribeError::server(reqid, format!("Failed to read NERDm record: {e}"))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            DescribeError::server(reqid, format!("Failed to read NERDm record as JSON: {e}"))
        })
    }
}
