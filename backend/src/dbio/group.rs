//! User groups: named, owned collections of principals.
//!
//! A group's unique identifier has the form `SHOULDER:OWNER:NAME`; its
//! mnemonic name is unique within the owner's namespace.  Membership is
//! transitive: a group can be a member of another group.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use midas_shared::ids::group_id;
use midas_shared::models::{acls_owned_by, Permissions, PUBLIC_GROUP};

use super::client::DbClient;
use super::record::RecordCore;
use super::{DbioError, Result, GROUPS_COLL};

/// An updatable representation of a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    #[serde(flatten)]
    pub core: RecordCore,
    #[serde(default)]
    pub members: Vec<String>,
}

impl Group {
    pub fn from_value(doc: Value, default_owner: &str) -> Result<Group> {
        let mut grp: Group = serde_json::from_value(doc)
            .map_err(|e| DbioError::backend(format!("group record is not decodable: {e}")))?;
        if grp.core.id.is_empty() {
            return Err(DbioError::backend("Record data is missing its 'id' property"));
        }
        grp.core.initialize(GROUPS_COLL, default_owner);
        Ok(grp)
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn is_member(&self, userid: &str) -> bool {
        self.members.iter().any(|m| m == userid)
    }

    /// Add members (requires `write`); already-present ids are ignored.
    pub async fn add_member(&mut self, cli: &DbClient, memids: &[&str]) -> Result<()> {
        if !self.core.authorized(cli, Permissions::WRITE, None).await? {
            return Err(DbioError::not_authorized(cli.user_id(), "add member"));
        }
        for id in memids {
            if !self.is_member(id) {
                self.members.push(id.to_string());
            }
        }
        Ok(())
    }

    /// Remove members (requires `write`); absent ids are ignored.
    pub async fn remove_member(&mut self, cli: &DbClient, memids: &[&str]) -> Result<()> {
        if !self.core.authorized(cli, Permissions::WRITE, None).await? {
            return Err(DbioError::not_authorized(cli.user_id(), "remove member"));
        }
        self.members.retain(|m| !memids.contains(&m.as_str()));
        Ok(())
    }

    /// Assign a new mnemonic name; requires `admin` and name uniqueness
    /// within the owner's namespace.
    pub async fn rename(&mut self, cli: &DbClient, newname: &str) -> Result<()> {
        if !self.core.authorized(cli, Permissions::ADMIN, None).await? {
            return Err(DbioError::not_authorized(cli.user_id(), "change name"));
        }
        if cli.groups().name_exists(newname, None).await? {
            return Err(DbioError::AlreadyExists(format!(
                "User {} has already defined a group with name={newname}",
                cli.user_id()
            )));
        }
        self.core.name = newname.to_string();
        Ok(())
    }

    pub async fn save(&mut self, cli: &DbClient) -> Result<()> {
        if !self.core.authorized(cli, Permissions::WRITE, None).await? {
            return Err(DbioError::not_authorized(cli.user_id(), "update record"));
        }
        let old = self.core.status.set_times();
        let doc = serde_json::to_value(&*self).map_err(DbioError::backend)?;
        match cli.upsert_raw(GROUPS_COLL, &self.core.id, doc).await {
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

    pub fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();
        self.core.validate_into(&mut errs);
        if self.core.name.is_empty() {
            errs.push("'name' property not set".to_string());
        }
        errs
    }
}

/// The interface for creating and resolving groups.
pub struct DbGroups<'a> {
    cli: &'a DbClient,
    shoulder: String,
}

impl<'a> DbGroups<'a> {
    pub(crate) fn new(cli: &'a DbClient, shoulder: &str) -> DbGroups<'a> {
        DbGroups { cli, shoulder: shoulder.to_string() }
    }

    /// Create a new group owned by `foruser` (default: the client's
    /// user).  Only a superuser can create a group for someone else.
    pub async fn create_group(&self, name: &str, foruser: Option<&str>) -> Result<Group> {
        let foruser = foruser.unwrap_or(self.cli.user_id()).to_string();
        if !self.cli.authorized_group_create(&self.shoulder, &foruser) {
            return Err(DbioError::not_authorized(self.cli.user_id(), "create group"));
        }
        if self.name_exists(name, Some(&foruser)).await? {
            return Err(DbioError::AlreadyExists(format!(
                "User {foruser} has already defined a group with name={name}"
            )));
        }

        let doc = serde_json::json!({
            "id": group_id(&self.shoulder, &foruser, name),
            "name": name,
            "owner": foruser,
            "members": [foruser],
            "acls": acls_owned_by(&foruser),
        });
        let mut grp = Group::from_value(doc, &foruser)?;
        grp.save(self.cli).await?;
        self.cli.recache_user_groups().await?;
        Ok(grp)
    }

    /// True if a group with the given id exists; no permission needed.
    pub async fn exists(&self, gid: &str) -> Result<bool> {
        Ok(self.cli.get_raw(GROUPS_COLL, gid).await?.is_some())
    }

    /// True if the owner has a group with this name; no permission
    /// needed.
    pub async fn name_exists(&self, name: &str, owner: Option<&str>) -> Result<bool> {
        let owner = owner.unwrap_or(self.cli.user_id());
        let found = self
            .cli
            .select_raw(
                GROUPS_COLL,
                true,
                &[
                    ("name".to_string(), Value::String(name.to_string())),
                    ("owner".to_string(), Value::String(owner.to_string())),
                ],
            )
            .await?;
        Ok(!found.is_empty())
    }

    /// Fetch a group by id; requires `read` on the group.
    pub async fn get(&self, gid: &str) -> Result<Option<Group>> {
        let Some(doc) = self.cli.get_raw(GROUPS_COLL, gid).await? else {
            return Ok(None);
        };
        let grp = Group::from_value(doc, self.cli.user_id())?;
        if grp.core.authorized(self.cli, Permissions::READ, None).await? {
            Ok(Some(grp))
        } else {
            Err(DbioError::not_authorized(self.cli.user_id(), "read"))
        }
    }

    /// Fetch the group the owner gave this name to.
    pub async fn get_by_name(&self, name: &str, owner: Option<&str>) -> Result<Option<Group>> {
        let owner = owner.unwrap_or(self.cli.user_id());
        let matches = self
            .cli
            .select_raw(
                GROUPS_COLL,
                true,
                &[
                    ("name".to_string(), Value::String(name.to_string())),
                    ("owner".to_string(), Value::String(owner.to_string())),
                ],
            )
            .await?;
        for doc in matches {
            let grp = Group::from_value(doc, self.cli.user_id())?;
            if grp.core.authorized(self.cli, Permissions::READ, None).await? {
                return Ok(Some(grp));
            }
        }
        Ok(None)
    }

    /// Resolve every group the given user (or group) is a member of,
    /// directly or transitively.  Deactivated groups are excluded; the
    /// implicit public group is always included.
    pub async fn select_ids_for_user(&self, id: &str) -> Result<HashSet<String>> {
        let mut out: HashSet<String> = HashSet::new();
        for doc in self.cli.select_prop_contains_raw(GROUPS_COLL, "members", id).await? {
            if let Some(gid) = doc.get("id").and_then(Value::as_str) {
                out.insert(gid.to_string());
            }
        }

        let mut checked: HashSet<String> = HashSet::new();
        let mut follow: Vec<String> = out.iter().cloned().collect();
        while let Some(gg) = follow.pop() {
            if checked.contains(&gg) {
                continue;
            }
            for doc in self.cli.select_prop_contains_raw(GROUPS_COLL, "members", &gg).await? {
                if let Some(gid) = doc.get("id").and_then(Value::as_str) {
                    if out.insert(gid.to_string()) || !checked.contains(gid) {
                        follow.push(gid.to_string());
                    }
                }
            }
            checked.insert(gg);
        }

        out.insert(PUBLIC_GROUP.to_string());
        Ok(out)
    }

    /// Delete a group; the caller must hold `delete` on it.  Returns
    /// false if the group does not exist.
    pub async fn delete_group(&self, gid: &str) -> Result<bool> {
        let Some(grp) = self.get(gid).await? else {
            return Ok(false);
        };
        if !grp.core.authorized(self.cli, Permissions::DELETE, None).await? {
            return Err(DbioError::not_authorized(self.cli.user_id(), "delete group"));
        }
        self.cli.delete_raw(GROUPS_COLL, gid).await?;
        self.cli.recache_user_groups().await?;
        Ok(true)
    }
}
