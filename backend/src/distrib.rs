//! REST client for the (external) distribution service, which serves
//! the preservation bags behind the AIP resolver.
//!
//! The service is an external collaborator; this client only speaks its
//! contract: version listings, head-bag descriptions, distribution
//! enumerations, and head-bag multibag manifests.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DistribError {
    #[error("distribution resource not found: {0}")]
    NotFound(String),

    #[error("client-side distribution error occurred: {0}")]
    ClientError(String),

    #[error("distribution server error: {0}")]
    ServerError(String),
}

pub type Result<T> = std::result::Result<T, DistribError>;

// e.g. "mds2-1234.1_2_0.mbag0_4-2.zip" or "mds2-1234.mbag0_4-1"
static BAG_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\w[\w\-]*)\.((\d+(_\d+)*)\.)?mbag\d+_\d+-\d+(\.(\w+))?$").unwrap()
});

/// True if the name is a legal (multibag) bag name.
pub fn is_legal_bag_name(name: &str) -> bool {
    BAG_NAME_RE.is_match(name)
}

/// The AIP id portion of a bag name.
pub fn bag_aipid(name: &str) -> Option<String> {
    BAG_NAME_RE.captures(name).map(|c| c[1].to_string())
}

/// The serialization extension of a bag name (e.g. "zip"), if any.
pub fn bag_serialization(name: &str) -> Option<String> {
    BAG_NAME_RE.captures(name).and_then(|c| c.get(6).map(|m| m.as_str().to_string()))
}

pub struct DistribClient {
    base: String,
    client: reqwest::Client,
}

impl DistribClient {
    pub fn new(baseurl: &str) -> DistribClient {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        DistribClient { base: baseurl.trim_end_matches('/').to_string(), client }
    }

    /// The service's base endpoint (for building redirect URLs).
    pub fn endpoint(&self) -> &str {
        &self.base
    }

    /// The versions available for an AIP (e.g. `["1.0.0", "1.2.0"]`).
    pub async fn list_versions(&self, aipid: &str) -> Result<Vec<String>> {
        self.get_json(&format!("{}/{aipid}/_aip/_v", self.base), aipid).await.map(as_strings)
    }

    /// The names of every bag file belonging to an AIP.
    pub async fn list_all(&self, aipid: &str) -> Result<Vec<String>> {
        self.get_json(&format!("{}/{aipid}/_aip", self.base), aipid).await.map(as_strings)
    }

    /// Descriptions of every distribution (bag file) of an AIP.
    pub async fn describe_all(&self, aipid: &str) -> Result<Vec<Value>> {
        let out = self.get_json(&format!("{}/{aipid}/_aip/_info", self.base), aipid).await?;
        Ok(out.as_array().cloned().unwrap_or_default())
    }

    /// The head bag description for a version of an AIP (or the latest
    /// version when none is given).
    pub async fn describe_head_for_version(&self, aipid: &str, version: Option<&str>)
        -> Result<Value>
    {
        let url = match version {
            Some(ver) => format!("{}/{aipid}/_aip/_v/{ver}/_head/_info", self.base),
            None => format!("{}/{aipid}/_aip/_head/_info", self.base),
        };
        self.get_json(&url, aipid).await
    }

    /// The member bag names recorded in a head bag's multibag manifest.
    pub async fn head_member_bags(&self, bagname: &str) -> Result<Vec<String>> {
        let url = format!("{}/_aip/{bagname}/_bag/multibag/member_bags.tsv", self.base);
        let text = self.get_text(&url, bagname).await?;
        Ok(text
            .lines()
            .filter_map(|line| line.split('\t').next())
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect())
    }

    async fn send(&self, url: &str, accept: &str, resource: &str) -> Result<reqwest::Response> {
        let resp = self
            .client
            .get(url)
            .header("Accept", accept)
            .send()
            .await
            .map_err(|e| {
                DistribError::ServerError(format!(
                    "Trouble connecting to distribution service: {e}"
                ))
            })?;
        let code = resp.status().as_u16();
        if code == 404 {
            return Err(DistribError::NotFound(resource.to_string()));
        }
        if code >= 500 {
            return Err(DistribError::ServerError(format!("{resource}: {code}")));
        }
        if code >= 400 {
            return Err(DistribError::ClientError(format!("{resource}: {code}")));
        }
        Ok(resp)
    }

    async fn get_json(&self, url: &str, resource: &str) -> Result<Value> {
        let resp = self.send(url, "application/json", resource).await?;
        resp.json().await.map_err(|e| {
            DistribError::ServerError(format!("{resource}: unparseable response: {e}"))
        })
    }

    async fn get_text(&self, url: &str, resource: &str) -> Result<String> {
        let resp = self.send(url, "text/plain", resource).await?;
        resp.text().await.map_err(|e| {
            DistribError::ServerError(format!("{resource}: unreadable response: {e}"))
        })
    }
}

fn as_strings(val: Value) -> Vec<String> {
    val.as_array()
        .map(|l| l.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bag_name_grammar() {
        assert!(is_legal_bag_name("mds2-1234.1_2_0.mbag0_4-2.zip"));
        assert!(is_legal_bag_name("mds2-1234.mbag0_4-1"));
        assert!(!is_legal_bag_name("mds2-1234"));
        assert!(!is_legal_bag_name("mds2-1234.zip"));

        assert_eq!(bag_aipid("mds2-1234.1_2_0.mbag0_4-2.zip").as_deref(), Some("mds2-1234"));
        assert_eq!(bag_serialization("mds2-1234.1_2_0.mbag0_4-2.zip").as_deref(), Some("zip"));
        assert_eq!(bag_serialization("mds2-1234.mbag0_4-1"), None);
    }
}
