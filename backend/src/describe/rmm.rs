//! Client for the remote Resource Metadata Manager (RMM) service.
//!
//! The RMM exposes three collections: `records` (latest versions),
//! `versions` (every released version), and `releaseSets` (release
//! histories).

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use midas_shared::ids::{classify_path, ArkId, IdPath, COMP_EXTENSION, RELHIST_EXTENSION};

use super::{find_component, patch_component, DescribeError, Result};

const COLL_LATEST: &str = "records";
const COLL_VERSIONS: &str = "versions";
const COLL_RELEASES: &str = "releaseSets";

pub struct RmmClient {
    baseurl: String,
    client: reqwest::Client,
}

impl RmmClient {
    pub fn new(baseurl: &str) -> RmmClient {
        let mut baseurl = baseurl.to_string();
        if !baseurl.ends_with('/') {
            baseurl.push('/');
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        RmmClient { baseurl, client }
    }

    /// Return the NERDm metadata for the identified entity: a dataset,
    /// a version, a release history, or a component.
    pub async fn describe(&self, id: &str, version: Option<&str>) -> Result<Value> {
        let mut find = id.trim_end_matches('/').to_string();
        // an ID ending in "/pdr:c" is treated as the dataset itself
        if let Some(base) = find.strip_suffix(COMP_EXTENSION) {
            find = base.to_string();
        }

        if !find.starts_with("ark:") {
            // an old-style EDI-ID
            return self.describe_ediid(&find, version, id).await;
        }

        let Some(ark) = ArkId::parse(&find) else {
            return Err(DescribeError::IdNotFound(id.to_string()));
        };

        match classify_path(&ark.path) {
            IdPath::ReleaseHistory => self.describe_releases(&find, id).await,
            IdPath::Component(cmp) => self.describe_component(&ark.base(), &cmp, version, id).await,
            IdPath::VersionComponent(ver, cmp) => {
                self.describe_component(&ark.base(), &cmp, Some(&ver), id).await
            }
            IdPath::Version(_) => self.describe_version(&find, id).await,
            IdPath::Dataset => match version {
                Some(ver) => {
                    let verid = format!("{}{RELHIST_EXTENSION}/{ver}", ark.base());
                    self.describe_version(&verid, id).await
                }
                None => self.describe_latest(&ark.base(), id).await,
            },
        }
    }

    async fn describe_ediid(&self, ediid: &str, version: Option<&str>, reqid: &str)
        -> Result<Value>
    {
        let url = match version {
            Some(ver) => {
                format!("{}{COLL_VERSIONS}?version={ver}&ediid={ediid}", self.baseurl)
            }
            None => format!("{}{COLL_LATEST}?ediid={ediid}", self.baseurl),
        };
        self.get(&url, reqid).await
    }

    async fn describe_releases(&self, id: &str, reqid: &str) -> Result<Value> {
        let url = format!("{}{COLL_RELEASES}?@id={id}", self.baseurl);
        self.get(&url, reqid).await
    }

    async fn describe_version(&self, id: &str, reqid: &str) -> Result<Value> {
        let url = format!("{}{COLL_VERSIONS}?@id={id}", self.baseurl);
        let mut out = self.get(&url, reqid).await?;

        // inject the latest release history into this record
        let relid = out
            .get("@id")
            .and_then(Value::as_str)
            .unwrap_or(id)
            .to_string()
            + RELHIST_EXTENSION;
        match self.describe_releases(&relid, &relid).await {
            Ok(relset) => {
                if let Some(releases) = relset.get("hasRelease") {
                    if let Some(obj) = out.as_object_mut() {
                        obj.insert(
                            "releaseHistory".to_string(),
                            serde_json::json!({
                                "@id": relset.get("@id"),
                                "@type": "nrdr:ReleaseHistory",
                                "label": "Release History",
                                "hasRelease": releases,
                            }),
                        );
                        obj.remove("versionHistory");
                    }
                }
            }
            // a record without a release set record (shouldn't happen)
            Err(DescribeError::IdNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(out)
    }

    async fn describe_latest(&self, id: &str, reqid: &str) -> Result<Value> {
        let url = format!("{}{COLL_LATEST}?@id={id}", self.baseurl);
        self.get(&url, reqid).await
    }

    async fn describe_component(
        &self,
        dsid: &str,
        cmpid: &str,
        version: Option<&str>,
        reqid: &str,
    ) -> Result<Value> {
        let dsmd = match version {
            Some(ver) => {
                let verid = format!("{dsid}{RELHIST_EXTENSION}/{ver}");
                self.describe_version(&verid, reqid).await?
            }
            None => self.describe_latest(dsid, reqid).await?,
        };

        let mut cmpmd = find_component(&dsmd, cmpid)
            .ok_or_else(|| DescribeError::IdNotFound(reqid.to_string()))?;
        patch_component(&mut cmpmd, &dsmd, dsid, version);
        Ok(cmpmd)
    }

    /// Query the RMM for records matching the given parameters.
    pub async fn search(&self, query: &BTreeMap<String, String>, latest: bool)
        -> Result<Vec<Value>>
    {
        let coll = if latest { COLL_LATEST } else { COLL_VERSIONS };
        let qstr: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let url = format!("{}{coll}?{}", self.baseurl, qstr.join("&"));

        match self.get(&url, coll).await {
            Ok(Value::Array(hits)) => Ok(hits),
            Ok(single) => Ok(vec![single]),
            Err(DescribeError::IdNotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn get(&self, url: &str, reqid: &str) -> Result<Value> {
        let mut out = self.retrieve(url, reqid).await?;

        if let Some(data) = out.get("ResultData") {
            let mut hits = data.as_array().cloned().unwrap_or_default();
            if hits.is_empty() {
                return Err(DescribeError::IdNotFound(reqid.to_string()));
            }
            out = hits.remove(0);
        }
        if let Some(obj) = out.as_object_mut() {
            obj.remove("_id");
        }
        Ok(out)
    }

    async fn retrieve(&self, url: &str, reqid: &str) -> Result<Value> {
        let resp = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                DescribeError::server(reqid, format!("Trouble connecting to metadata service: {e}"))
            })?;

        let code = resp.status().as_u16();
        let reason = resp.status().canonical_reason().unwrap_or("").to_string();
        if code >= 500 {
            return Err(DescribeError::server(reqid, format!("{code} {reason}")));
        }
        if code == 404 {
            return Err(DescribeError::IdNotFound(reqid.to_string()));
        }
        if code == 406 {
            return Err(DescribeError::ClientError {
                resource: reqid.to_string(),
                code,
                reason: "JSON data not available from this URL (is URL correct?)".to_string(),
            });
        }
        if code >= 400 {
            return Err(DescribeError::ClientError { resource: reqid.to_string(), code, reason });
        }
        if code != 200 {
            return Err(DescribeError::server(
                reqid,
                format!("Unexpected response from server: {code} {reason}"),
            ));
        }

        let text = resp.text().await.map_err(|e| DescribeError::server(reqid, e))?;
        let out: Value = serde_json::from_str(&text).map_err(|_| {
            if text.contains("<body") || text.contains("<BODY") {
                DescribeError::server(reqid, "HTML returned where JSON expected (is service URL correct?)")
            } else {
                DescribeError::server(reqid, "Unable to parse response as JSON (is service URL correct?)")
            }
        })?;

        // tolerate the RMM's "Message" error envelope
        if out.get("Message").is_some() && out.get("ResultData").is_none() {
            let message = out["Message"].as_str().unwrap_or_default();
            if message.contains("No record available") {
                return Err(DescribeError::IdNotFound(reqid.to_string()));
            }
            return Err(DescribeError::server(reqid, format!("Unexpected response: {message}")));
        }
        Ok(out)
    }
}
