//! Restoring a draft's data from its archived publication.
//!
//! A restorer is constructed for one record and one archive location
//! (the record's `archived_at` URL).  `dbio_store:` URLs point at a
//! publication collection in the record store itself; `http(s):` URLs
//! are fetched from a remote endpoint.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};

use midas_shared::models::Permissions;

use crate::dbio::{DbClient, DbioError, ProjectRecord, Result};

static DBIO_STORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^dbio_store:([\w\-]+)/(\w[\w/\-+=:.]*)$").unwrap());

/// Recovers a published record's data from its archive location.
#[async_trait]
pub trait ProjectRestorer: Send {
    /// Fetch the archived data from the archive location and cache it.
    async fn recover(&mut self) -> Result<()>;

    /// Release any cached data.
    fn free(&mut self);

    /// The archived data portion of the record.
    async fn get_data(&mut self) -> Result<Map<String, Value>>;

    /// Load the archived data into the given record's `data` property.
    /// The record is not saved.
    async fn restore(&mut self, prec: &mut ProjectRecord, free_after: bool) -> Result<()> {
        prec.data = self.get_data().await?;
        if free_after {
            self.free();
        }
        Ok(())
    }
}

/// Dispatch an `archived_at` URL to the restorer that understands it.
pub fn from_archived_at(locurl: &str, dbcli: &DbClient) -> Result<Box<dyn ProjectRestorer>> {
    if locurl.starts_with("dbio_store:") {
        let caps = DBIO_STORE_RE.captures(locurl).ok_or_else(|| {
            DbioError::backend(format!("Non-compliant dbio_store URL: {locurl}"))
        })?;
        Ok(Box::new(DbioRestorer::new(dbcli, &caps[1], &caps[2])))
    } else if locurl.starts_with("http://") || locurl.starts_with("https://") {
        Ok(Box::new(UrlRestorer::new(locurl, None)?))
    } else {
        Err(DbioError::backend(format!("Unrecognized archive URL: {locurl}")))
    }
}

/// Pulls record data from a publication collection in the record store
/// (e.g. `dmp_latest`).
pub struct DbioRestorer {
    pubcli: DbClient,
    pubid: String,
    pubrec: Option<ProjectRecord>,
}

impl DbioRestorer {
    pub fn new(dbcli: &DbClient, coll: &str, pubid: &str) -> DbioRestorer {
        DbioRestorer {
            pubcli: dbcli.client_for(coll, None),
            pubid: pubid.to_string(),
            pubrec: None,
        }
    }

    /// The full published record, once recovered.
    pub fn published_record(&self) -> Option<&ProjectRecord> {
        self.pubrec.as_ref()
    }
}

#[async_trait]
impl ProjectRestorer for DbioRestorer {
    async fn recover(&mut self) -> Result<()> {
        self.free();
        self.pubrec = Some(self.pubcli.get_record_for(&self.pubid, Permissions::READ).await?);
        Ok(())
    }

    fn free(&mut self) {
        self.pubrec = None;
    }

    async fn get_data(&mut self) -> Result<Map<String, Value>> {
        if self.pubrec.is_none() {
            self.recover().await?;
        }
        Ok(self.pubrec.as_ref().map(|r| r.data.clone()).unwrap_or_default())
    }
}

/// Fetches record data from an HTTP endpoint that serves it as JSON.
pub struct UrlRestorer {
    src: String,
    projid: Option<String>,
    data: Option<Map<String, Value>>,
    client: reqwest::Client,
}

impl UrlRestorer {
    pub fn new(dataurl: &str, projid: Option<&str>) -> Result<UrlRestorer> {
        if !dataurl.starts_with("http://") && !dataurl.starts_with("https://") {
            return Err(DbioError::backend("UrlRestorer: dataurl not an HTTP(S) URL"));
        }
        url::Url::parse(dataurl)
            .map_err(|_| DbioError::backend("UrlRestorer: dataurl is malformed URL"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(DbioError::backend)?;
        Ok(UrlRestorer {
            src: dataurl.to_string(),
            projid: projid.map(String::from),
            data: None,
            client,
        })
    }

    fn subject(&self) -> &str {
        self.projid.as_deref().unwrap_or(&self.src)
    }
}

#[async_trait]
impl ProjectRestorer for UrlRestorer {
    async fn recover(&mut self) -> Result<()> {
        self.free();
        let resp = self
            .client
            .get(&self.src)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                DbioError::backend(format!(
                    "Server communication error while accessing {}: {e}",
                    self.src
                ))
            })?;

        let code = resp.status();
        if code.as_u16() >= 500 {
            return Err(DbioError::backend(format!(
                "Server error while accessing project data archive: {code}"
            )));
        }
        if code.as_u16() == 404 {
            return Err(DbioError::not_found(self.subject()));
        }
        if code.as_u16() == 401 {
            return Err(DbioError::not_authorized(self.subject(), "access archive URL"));
        }
        if code.as_u16() == 406 {
            return Err(DbioError::backend(format!(
                "Archive URL cannot return JSON as expected: {}",
                self.src
            )));
        }
        if !code.is_success() {
            return Err(DbioError::backend(format!(
                "Unexpected {code} response accessing archive URL, {}",
                self.src
            )));
        }

        let text = resp.text().await.map_err(DbioError::backend)?;
        match serde_json::from_str::<Map<String, Value>>(&text) {
            Ok(data) => {
                self.data = Some(data);
                Ok(())
            }
            Err(_) if text.contains("<body") || text.contains("<BODY") => {
                Err(DbioError::backend(format!(
                    "HTML returned where JSON expected (is service URL correct?): {}",
                    self.src
                )))
            }
            Err(_) => Err(DbioError::backend(format!(
                "Unable to parse response as JSON (is service URL correct?): {}",
                self.src
            ))),
        }
    }

    fn free(&mut self) {
        self.data = None;
    }

    async fn get_data(&mut self) -> Result<Map<String, Value>> {
        if self.data.is_none() {
            self.recover().await?;
        }
        Ok(self.data.clone().unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_url_restorer_rejects_bad_urls() {
        assert!(UrlRestorer::new("ftp://archive/rec", None).is_err());
        assert!(UrlRestorer::new("http://h:badport/x", None).is_err());
        assert!(UrlRestorer::new("https://archive.example/rec.json", None).is_ok());
    }

    #[test]
    fn test_dbio_store_url_grammar() {
        let caps = DBIO_STORE_RE.captures("dbio_store:dmp_latest/ark:/88434/mdm1-0001").unwrap();
        assert_eq!(&caps[1], "dmp_latest");
        assert_eq!(&caps[2], "ark:/88434/mdm1-0001");

        assert!(DBIO_STORE_RE.captures("dbio_store:bad coll/x").is_none());
    }
}
