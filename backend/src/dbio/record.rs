//! ACL-protected records.
//!
//! A record object is a local copy of what is stored in the backend;
//! changes are not persisted until `save()` is called.  Authorization
//! checks evaluate the ACLs as they were when the record was loaded, so
//! in-flight ACL edits cannot self-authorize the save that would commit
//! them.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use midas_shared::models::{AclMap, Permissions};
use midas_shared::prov::{now, Timestamp};
use midas_shared::status::RecordStatus;

use super::client::DbClient;
use super::{DbioError, Result};

/// The fields common to every ACL-bearing record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordCore {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub deactivated: Option<Timestamp>,
    #[serde(default)]
    pub acls: AclMap,
    #[serde(default)]
    pub status: RecordStatus,
    /// The collection this record belongs to.
    #[serde(rename = "type", default)]
    pub rectype: String,
    /// ACL snapshot taken at load time; authorization evaluates this,
    /// not the possibly-edited `acls`.
    #[serde(skip)]
    pub(crate) loaded_acls: AclMap,
}

impl RecordCore {
    /// Fill in required defaults on freshly loaded or created data.
    pub(crate) fn initialize(&mut self, coll: &str, default_owner: &str) {
        if self.owner.is_empty() {
            self.owner = default_owner.to_string();
        }
        for perm in Permissions::BASE {
            self.acls.entry(perm.name().to_string()).or_insert_with(|| {
                if self.owner.is_empty() { Vec::new() } else { vec![self.owner.clone()] }
            });
        }
        self.rectype = coll.to_string();
        self.status.normalize();
        self.loaded_acls = self.acls.clone();
    }

    /// True if the given identities hold the named permission.  Lowlevel:
    /// callers normally want [`authorized`](Self::authorized), which
    /// resolves group membership.
    fn granted(acls: &AclMap, perm: &str, idents: &HashSet<String>) -> bool {
        acls.get(perm).is_some_and(|l| l.iter().any(|id| idents.contains(id)))
    }

    /// Return true if `who` (default: the client's user) holds every
    /// permission in `perms` on this record, directly or through a
    /// group.  Superusers pass unconditionally.
    pub async fn authorized(&self, cli: &DbClient, perms: Permissions, who: Option<&str>)
        -> Result<bool>
    {
        let who = who.unwrap_or(cli.user_id());
        if cli.is_superuser(who) {
            return Ok(true);
        }
        let mut idents = cli.all_groups_for(who).await?;
        idents.insert(who.to_string());

        let acls = if self.loaded_acls.is_empty() { &self.acls } else { &self.loaded_acls };
        for p in perms.each() {
            if !Self::granted(acls, p.name(), &idents) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Grant a permission to the given identities.  Requires `admin`.
    pub async fn grant_perm_to(&mut self, cli: &DbClient, perm: &str, ids: &[&str]) -> Result<()> {
        if !self.authorized(cli, Permissions::ADMIN, None).await? {
            return Err(DbioError::not_authorized(cli.user_id(), "grant permission"));
        }
        self.grant_unchecked(perm, ids);
        Ok(())
    }

    pub(crate) fn grant_unchecked(&mut self, perm: &str, ids: &[&str]) {
        let list = self.acls.entry(perm.to_string()).or_default();
        for id in ids {
            if !list.iter().any(|have| have == id) {
                list.push(id.to_string());
            }
        }
    }

    /// Revoke a permission from the given identities.  Requires `admin`.
    /// With `protect_owner` (the normal case), the owner never loses
    /// `read` or `admin`.
    pub async fn revoke_perm_from(
        &mut self,
        cli: &DbClient,
        perm: &str,
        ids: &[&str],
        protect_owner: bool,
    ) -> Result<()> {
        if !self.authorized(cli, Permissions::ADMIN, None).await? {
            return Err(DbioError::not_authorized(cli.user_id(), "revoke permission"));
        }
        let Some(list) = self.acls.get_mut(perm) else {
            return Ok(());
        };
        for id in ids {
            if protect_owner && *id == self.owner && (perm == "read" || perm == "admin") {
                continue;
            }
            list.retain(|have| have != id);
        }
        Ok(())
    }

    /// Empty a permission's principal list (modulo owner protection).
    pub(crate) fn revoke_all_unchecked(&mut self, perm: &str, protect_owner: bool) {
        let keep_owner = protect_owner
            && (perm == "read" || perm == "admin")
            && self.acls.get(perm).is_some_and(|l| l.iter().any(|id| *id == self.owner));
        let empty = if keep_owner { vec![self.owner.clone()] } else { Vec::new() };
        if let Some(list) = self.acls.get_mut(perm) {
            *list = empty;
        }
    }

    /// Hide this record from default selection.  Returns false if it was
    /// already deactivated.
    pub fn deactivate(&mut self) -> bool {
        if self.deactivated.is_some() {
            return false;
        }
        self.deactivated = Some(now());
        true
    }

    pub fn reactivate(&mut self) -> bool {
        if self.deactivated.is_none() {
            return false;
        }
        self.deactivated = None;
        true
    }

    /// Validate the base invariants, appending to `errs`.
    pub fn validate_into(&self, errs: &mut Vec<String>) {
        if self.id.is_empty() {
            errs.push("'id' property not set".to_string());
        }
        if self.owner.is_empty() {
            errs.push("'owner' property not set".to_string());
        }
        for perm in Permissions::BASE {
            if !self.acls.contains_key(perm.name()) {
                errs.push(format!("ACLs: missing permmission: {}", perm.name()));
            }
        }
    }

    pub(crate) fn refresh_loaded_acls(&mut self) {
        self.loaded_acls = self.acls.clone();
    }
}

/// A single project draft owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    #[serde(flatten)]
    pub core: RecordCore,
    /// Domain payload, directly editable by the client.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Bookkeeping fields not editable by the client.
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub curators: Vec<String>,
}

impl ProjectRecord {
    /// Wrap a raw document pulled from the given collection.
    pub fn from_value(coll: &str, doc: Value, default_owner: &str) -> Result<ProjectRecord> {
        let mut rec: ProjectRecord = serde_json::from_value(doc)
            .map_err(|e| DbioError::backend(format!("record is not decodable: {e}")))?;
        if rec.core.id.is_empty() {
            return Err(DbioError::backend("Record data is missing its 'id' property"));
        }
        rec.core.initialize(coll, default_owner);
        Ok(rec)
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn owner(&self) -> &str {
        &self.core.owner
    }

    pub fn status(&self) -> &RecordStatus {
        &self.core.status
    }

    pub fn status_mut(&mut self) -> &mut RecordStatus {
        &mut self.core.status
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// The export form returned to API clients: the record data plus
    /// formatted status dates.
    pub fn export(&self) -> Value {
        let mut out = self.to_value();
        if let Some(status) = out.get_mut("status").and_then(Value::as_object_mut) {
            status.insert("createdDate".into(), Value::String(self.core.status.created_date()));
            status.insert("modifiedDate".into(), Value::String(self.core.status.modified_date()));
            status.insert("sinceDate".into(), Value::String(self.core.status.since_date()));
        }
        out
    }

    pub async fn authorized(&self, cli: &DbClient, perms: Permissions) -> Result<bool> {
        self.core.authorized(cli, perms, None).await
    }

    /// Persist any updates.  The caller must hold `write`; on a backend
    /// failure the pre-save timestamps are restored.
    pub async fn save(&mut self, cli: &DbClient) -> Result<()> {
        if !self.core.authorized(cli, Permissions::WRITE, None).await? {
            return Err(DbioError::not_authorized(cli.user_id(), "update record"));
        }
        let old = self.core.status.set_times();
        let doc = self.to_value();
        match cli.upsert_raw(&self.core.rectype, &self.core.id, doc).await {
            Ok(_) => {
                self.core.refresh_loaded_acls();
                Ok(())
            }
            Err(e) => {
                self.core.status.restore_times(old);
                Err(e)
            }
        }
    }

    /// Transfer ownership.  Requires `admin`; the recipient is checked
    /// against the people service when one is attached.  With `disown`,
    /// the previous owner's permissions are also revoked.
    pub async fn reassign(&mut self, cli: &DbClient, who: &str, disown: bool) -> Result<()> {
        if !self.core.authorized(cli, Permissions::ADMIN, None).await? {
            return Err(DbioError::not_authorized(cli.user_id(), "change owner"));
        }
        if !cli.validate_user_id(who) {
            return Err(DbioError::invalid_update(
                &self.core.id,
                None,
                vec![format!("Unable to update owner: invalid user ID: {who}")],
            ));
        }
        let former = self.core.owner.clone();
        self.core.owner = who.to_string();
        for perm in Permissions::BASE {
            self.core.grant_unchecked(perm.name(), &[who]);
        }
        if disown && former != who {
            for perm in Permissions::BASE {
                if let Some(list) = self.core.acls.get_mut(perm.name()) {
                    list.retain(|id| *id != former);
                }
            }
        }
        Ok(())
    }

    /// Assign a new mnemonic name.  Requires `admin`; the name must be
    /// unique within the owner's namespace.
    pub async fn rename(&mut self, cli: &DbClient, newname: &str) -> Result<()> {
        if !self.core.authorized(cli, Permissions::ADMIN, None).await? {
            return Err(DbioError::not_authorized(cli.user_id(), "change name"));
        }
        if cli.name_exists(newname, None).await? {
            return Err(DbioError::AlreadyExists(format!(
                "User {} has already defined a record with name={newname}",
                cli.user_id()
            )));
        }
        self.core.name = newname.to_string();
        Ok(())
    }

    /// Validate this record, returning the error statements found.
    pub fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();
        self.core.validate_into(&mut errs);
        if self.core.name.is_empty() {
            errs.push("'name' property not set".to_string());
        }
        errs
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_initializes() {
        let rec = ProjectRecord::from_value("dmp", json!({"id": "mdm1:0001"}), "u1").unwrap();
        assert_eq!(rec.id(), "mdm1:0001");
        assert_eq!(rec.owner(), "u1");
        assert_eq!(rec.core.rectype, "dmp");
        assert_eq!(rec.core.acls.get("read").unwrap(), &vec!["u1".to_string()]);
        assert_eq!(rec.core.loaded_acls, rec.core.acls);
        assert!(rec.data.is_empty());

        assert!(ProjectRecord::from_value("dmp", json!({"name": "x"}), "u1").is_err());
    }

    #[test]
    fn test_deactivate_idempotent() {
        let mut rec = ProjectRecord::from_value("dmp", json!({"id": "mdm1:0001"}), "u1").unwrap();
        assert!(rec.core.deactivate());
        assert!(!rec.core.deactivate());
        assert!(rec.core.reactivate());
        assert!(!rec.core.reactivate());
    }

    #[test]
    fn test_revoke_all_protects_owner() {
        let mut rec = ProjectRecord::from_value("dmp", json!({"id": "mdm1:0001"}), "u1").unwrap();
        rec.core.grant_unchecked("read", &["u2", "grp0:public"]);

        rec.core.revoke_all_unchecked("read", true);
        assert_eq!(rec.core.acls.get("read").unwrap(), &vec!["u1".to_string()]);

        rec.core.revoke_all_unchecked("read", false);
        assert!(rec.core.acls.get("read").unwrap().is_empty());

        rec.core.grant_unchecked("write", &["u2"]);
        rec.core.revoke_all_unchecked("write", true);
        assert!(rec.core.acls.get("write").unwrap().is_empty());
    }

    #[test]
    fn test_validate_reports_missing() {
        let mut rec = ProjectRecord::from_value("dmp", json!({"id": "mdm1:0001"}), "u1").unwrap();
        rec.core.acls.remove("delete");
        let errs = rec.validate();
        assert!(errs.iter().any(|e| e.contains("delete")));
        assert!(errs.iter().any(|e| e.contains("'name'")));
    }

    #[test]
    fn test_export_has_dates() {
        let mut rec = ProjectRecord::from_value("dmp", json!({"id": "mdm1:0001"}), "u1").unwrap();
        rec.core.status.set_times();
        let out = rec.export();
        assert_eq!(out["type"], "dmp");
        assert_ne!(out["status"]["modifiedDate"], "pending");
    }
}
