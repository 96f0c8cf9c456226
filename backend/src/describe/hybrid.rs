//! The coordinator over the RMM service and the alt-big file cache.

use std::collections::BTreeMap;

use serde_json::Value;

use midas_shared::ids::RELHIST_EXTENSION;

use super::altbig::AltBigClient;
use super::rmm::RmmClient;
use super::Result;

pub struct HybridClient {
    rmm: RmmClient,
    alt: Option<AltBigClient>,
}

impl HybridClient {
    /// Set up the client.  Without a cache directory, records are only
    /// retrieved from the RMM.
    pub fn new(baseurl: &str, cachedir: Option<&str>) -> Result<HybridClient> {
        let alt = match cachedir {
            Some(dir) => Some(AltBigClient::new(dir)?),
            None => None,
        };
        Ok(HybridClient { rmm: RmmClient::new(baseurl), alt })
    }

    pub fn alt_record_exists(&self, id: &str, version: Option<&str>) -> bool {
        self.alt.as_ref().is_some_and(|alt| alt.exists(id, version))
    }

    /// Return the NERDm metadata for the identified entity.
    ///
    /// For a latest-version request the cache wins when it holds the
    /// record; for an explicitly version-specific request the RMM is
    /// consulted first to learn the effective version, and the cache is
    /// preferred only when it holds that version.
    pub async fn describe(&self, id: &str, version: Option<&str>) -> Result<Value> {
        let vers_specified = version.is_some_and(|v| v != "latest")
            || id.contains(RELHIST_EXTENSION);
        if !vers_specified && self.alt_record_exists(id, version) {
            if let Some(alt) = &self.alt {
                return alt.describe(id, version);
            }
        }

        let out = match self.rmm.describe(id, version).await {
            Ok(out) => out,
            // the RMM holds component-less stubs for oversized records;
            // what it cannot resolve may still be in the cache
            Err(e @ super::DescribeError::IdNotFound(_)) => {
                if let Some(alt) = &self.alt {
                    if alt.exists(id, version) {
                        return alt.describe(id, version);
                    }
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if vers_specified && !id.ends_with(RELHIST_EXTENSION) {
            let effective = out.get("version").and_then(Value::as_str).unwrap_or("0").to_string();
            if self.alt_record_exists(id, Some(&effective)) {
                if let Some(alt) = &self.alt {
                    return alt.describe(id, version);
                }
            }
        }
        Ok(out)
    }

    /// Search passes straight through to the RMM.
    pub async fn search(&self, query: &BTreeMap<String, String>, latest: bool)
        -> Result<Vec<Value>>
    {
        self.rmm.search(query, latest).await
    }
}
