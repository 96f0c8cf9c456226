//! The backend-agnostic DBIO client.
//!
//! A client is bound to one project collection and one user; every
//! record it hands out is authorization-checked against that user.  The
//! user's effective group set (ad-hoc groups resolved transitively, plus
//! virtual groups from the staff directory) is cached on the client and
//! refreshed via [`DbClient::recache_user_groups`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use midas_shared::ids::parse_recid;
use midas_shared::models::{Permissions, ANONYMOUS, DEF_GROUPS_SHOULDER};
use midas_shared::prov::{Action, ActionType};

use super::backend::{Constraint, DbBackend};
use super::group::DbGroups;
use super::people::{virtual_groups_for, PeopleService};
use super::record::ProjectRecord;
use super::search::{check_query_structure, searched};
use super::{DbioError, Result};

/// Client configuration common to all backends.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DbioConfig {
    /// Identifiers afforded authorization for all operations.
    #[serde(default)]
    pub superusers: Vec<String>,
    /// The shoulder used for new records when none is requested.
    #[serde(default)]
    pub default_shoulder: Option<String>,
    #[serde(default)]
    pub allowed_project_shoulders: Vec<String>,
    #[serde(default)]
    pub allowed_group_shoulders: Vec<String>,
}

impl DbioConfig {
    /// Merge this configuration over a base: empty/unset fields fall
    /// back to the base values.
    pub fn merged_over(mut self, base: &DbioConfig) -> DbioConfig {
        if self.superusers.is_empty() {
            self.superusers = base.superusers.clone();
        }
        if self.default_shoulder.is_none() {
            self.default_shoulder = base.default_shoulder.clone();
        }
        if self.allowed_project_shoulders.is_empty() {
            self.allowed_project_shoulders = base.allowed_project_shoulders.clone();
        }
        if self.allowed_group_shoulders.is_empty() {
            self.allowed_group_shoulders = base.allowed_group_shoulders.clone();
        }
        self
    }
}

/// Constraint names supported by [`DbClient::select_records`].
const SUPPORTED_CONSTRAINTS: [&str; 4] = ["name", "id", "owner", "status_state"];

pub struct DbClient {
    backend: Arc<dyn DbBackend>,
    cfg: DbioConfig,
    projcoll: String,
    who: String,
    people: Option<Arc<dyn PeopleService>>,
    // effective-group cache, keyed by principal
    groups_cache: RwLock<HashMap<String, HashSet<String>>>,
}

impl DbClient {
    pub(crate) fn new(
        backend: Arc<dyn DbBackend>,
        cfg: DbioConfig,
        projcoll: &str,
        foruser: &str,
        people: Option<Arc<dyn PeopleService>>,
    ) -> DbClient {
        DbClient {
            backend,
            cfg,
            projcoll: projcoll.to_string(),
            who: foruser.to_string(),
            people,
            groups_cache: RwLock::new(HashMap::new()),
        }
    }

    /// The collection of project records this client handles.
    pub fn project(&self) -> &str {
        &self.projcoll
    }

    /// The user this client acts on behalf of.
    pub fn user_id(&self) -> &str {
        &self.who
    }

    pub fn config(&self) -> &DbioConfig {
        &self.cfg
    }

    pub fn is_superuser(&self, who: &str) -> bool {
        // AUTOADMIN is the service's own publication identity
        who == midas_shared::models::AUTOADMIN || self.cfg.superusers.iter().any(|s| s == who)
    }

    /// Access to group management over the same backend.
    pub fn groups(&self) -> DbGroups<'_> {
        DbGroups::new(self, DEF_GROUPS_SHOULDER)
    }

    /// A client on the same backend bound to a different collection
    /// (and possibly user).
    pub fn client_for(&self, projcoll: &str, foruser: Option<&str>) -> DbClient {
        DbClient::new(
            self.backend.clone(),
            self.cfg.clone(),
            projcoll,
            foruser.unwrap_or(&self.who),
            self.people.clone(),
        )
    }

    pub fn people_service(&self) -> Option<&Arc<dyn PeopleService>> {
        self.people.as_ref()
    }

    /// Check a user id before assigning ownership: non-empty, and known
    /// to the staff directory when one is attached.
    pub fn validate_user_id(&self, who: &str) -> bool {
        if who.is_empty() {
            return false;
        }
        match &self.people {
            Some(svc) => svc.get_person_by_eid(who).is_some(),
            None => true,
        }
    }

    /// All groups the given principal belongs to, transitively, plus
    /// any virtual groups from the staff directory.  Results are cached
    /// until [`recache_user_groups`](Self::recache_user_groups).
    pub async fn all_groups_for(&self, who: &str) -> Result<HashSet<String>> {
        {
            let cache = self.groups_cache.read().await;
            if let Some(groups) = cache.get(who) {
                return Ok(groups.clone());
            }
        }
        let mut groups = self.groups().select_ids_for_user(who).await?;
        if let Some(svc) = &self.people {
            if let Some(person) = svc.get_person_by_eid(who) {
                groups.extend(virtual_groups_for(&person));
            }
        }
        self.groups_cache.write().await.insert(who.to_string(), groups.clone());
        Ok(groups)
    }

    /// The cached effective-group set of this client's user.
    pub async fn user_groups(&self) -> Result<HashSet<String>> {
        self.all_groups_for(&self.who).await
    }

    /// Drop the effective-group cache; call after group membership
    /// changes.
    pub async fn recache_user_groups(&self) -> Result<()> {
        self.groups_cache.write().await.clear();
        Ok(())
    }

    // ------------------------------------------------------------------
    // raw backend access, shared with the record/group wrappers
    // ------------------------------------------------------------------

    pub(crate) async fn upsert_raw(&self, coll: &str, id: &str, doc: Value) -> Result<bool> {
        self.backend.upsert(coll, id, doc).await
    }

    pub(crate) async fn get_raw(&self, coll: &str, id: &str) -> Result<Option<Value>> {
        self.backend.get(coll, id).await
    }

    pub(crate) async fn select_raw(&self, coll: &str, incl_deact: bool, cst: &[Constraint])
        -> Result<Vec<Value>>
    {
        self.backend.select(coll, incl_deact, cst).await
    }

    pub(crate) async fn select_prop_contains_raw(&self, coll: &str, prop: &str, target: &str)
        -> Result<Vec<Value>>
    {
        self.backend.select_prop_contains(coll, prop, target, false).await
    }

    pub(crate) async fn delete_raw(&self, coll: &str, id: &str) -> Result<bool> {
        self.backend.delete(coll, id).await
    }

    // ------------------------------------------------------------------
    // record operations
    // ------------------------------------------------------------------

    fn default_shoulder(&self) -> Result<String> {
        self.cfg
            .default_shoulder
            .clone()
            .ok_or_else(|| DbioError::Config("Missing required configuration parameter: default_shoulder".into()))
    }

    fn authorized_create(&self, shoulder: &str, allowed: &HashSet<&str>, who: &str) -> bool {
        if !self.who.is_empty() && who != self.who && !self.is_superuser(&self.who) {
            return false;
        }
        allowed.contains(shoulder)
    }

    fn authorized_project_create(&self, shoulder: &str, who: &str) -> bool {
        let mut allowed: HashSet<&str> =
            self.cfg.allowed_project_shoulders.iter().map(String::as_str).collect();
        if let Some(def) = &self.cfg.default_shoulder {
            allowed.insert(def);
        }
        self.authorized_create(shoulder, &allowed, who)
    }

    pub(crate) fn authorized_group_create(&self, shoulder: &str, who: &str) -> bool {
        let mut allowed: HashSet<&str> =
            self.cfg.allowed_group_shoulders.iter().map(String::as_str).collect();
        allowed.insert(DEF_GROUPS_SHOULDER);
        self.authorized_create(shoulder, &allowed, who)
    }

    /// Create (and save) a new project record with a newly minted
    /// identifier.
    ///
    /// `shoulder` defaults to the configured default; `localid`, when
    /// given, is used instead of a minted number; `foruser` registers a
    /// different owner (superusers only).
    pub async fn create_record(
        &self,
        name: &str,
        shoulder: Option<&str>,
        localid: Option<&str>,
        foruser: Option<&str>,
    ) -> Result<ProjectRecord> {
        let foruser = foruser.unwrap_or(&self.who).to_string();
        let shoulder = match shoulder {
            Some(s) => s.to_string(),
            None => self.default_shoulder()?,
        };
        if !self.authorized_project_create(&shoulder, &foruser) {
            return Err(DbioError::not_authorized(&self.who, "create record"));
        }
        if self.name_exists(name, Some(&foruser)).await? {
            return Err(DbioError::AlreadyExists(format!(
                "User {foruser} has already defined a record with name={name}"
            )));
        }

        let id = match localid {
            Some(local) => {
                let id = format!("{shoulder}:{local}");
                if self.exists(&id).await? {
                    return Err(DbioError::AlreadyExists(format!(
                        "Record with id={id} already exists"
                    )));
                }
                id
            }
            None => self.mint_id(&shoulder).await?,
        };

        let doc = json!({
            "id": id,
            "name": name,
            "owner": foruser,
            "status": { "created_by": self.who },
        });
        let mut rec = ProjectRecord::from_value(&self.projcoll, doc, &foruser)?;
        rec.save(self).await?;
        Ok(rec)
    }

    /// Mint a new identifier under the shoulder; record numbers are
    /// rendered with a 4-digit minimum.
    async fn mint_id(&self, shoulder: &str) -> Result<String> {
        let num = self.backend.next_recnum(shoulder).await?;
        Ok(format!("{shoulder}:{num:04}"))
    }

    /// True if a record with the given id exists; no permission needed.
    pub async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.backend.get(&self.projcoll, id).await?.is_some())
    }

    /// True if the owner already has a record with this name.
    pub async fn name_exists(&self, name: &str, owner: Option<&str>) -> Result<bool> {
        let owner = owner.unwrap_or(&self.who);
        let found = self
            .backend
            .select(
                &self.projcoll,
                true,
                &[
                    ("name".to_string(), Value::String(name.to_string())),
                    ("owner".to_string(), Value::String(owner.to_string())),
                ],
            )
            .await?;
        Ok(!found.is_empty())
    }

    /// Fetch the record the owner gave this name to, if readable.
    pub async fn get_record_by_name(&self, name: &str, owner: Option<&str>)
        -> Result<Option<ProjectRecord>>
    {
        let owner = owner.unwrap_or(&self.who);
        let matches = self
            .backend
            .select(
                &self.projcoll,
                true,
                &[
                    ("name".to_string(), Value::String(name.to_string())),
                    ("owner".to_string(), Value::String(owner.to_string())),
                ],
            )
            .await?;
        for doc in matches {
            let rec = ProjectRecord::from_value(&self.projcoll, doc, &self.who)?;
            if rec.authorized(self, Permissions::READ).await? {
                return Ok(Some(rec));
            }
        }
        Ok(None)
    }

    /// Fetch a single record by id, requiring the given permission.
    pub async fn get_record_for(&self, id: &str, perm: Permissions) -> Result<ProjectRecord> {
        let Some(doc) = self.backend.get(&self.projcoll, id).await? else {
            return Err(DbioError::not_found(id));
        };
        let rec = ProjectRecord::from_value(&self.projcoll, doc, &self.who)?;
        if !rec.authorized(self, perm).await? {
            return Err(DbioError::not_authorized(&self.who, perm.name()));
        }
        Ok(rec)
    }

    /// Select the records for which the user holds at least one of the
    /// permissions in `perm`, further filtered by the supported
    /// constraints (`name`, `id`, `owner`, `status_state`).  Constraint
    /// values are OR-ed within a name and AND-ed across names.
    pub async fn select_records(
        &self,
        perm: Permissions,
        constraints: &HashMap<String, Vec<Value>>,
    ) -> Result<Vec<ProjectRecord>> {
        let docs = self.backend.select(&self.projcoll, false, &[]).await?;
        let mut out = Vec::new();
        'rec: for doc in docs {
            for prop in SUPPORTED_CONSTRAINTS {
                let Some(vals) = constraints.get(prop).filter(|v| !v.is_empty()) else {
                    continue;
                };
                let have = if prop == "status_state" {
                    doc.get("status").and_then(|s| s.get("state"))
                } else {
                    doc.get(prop)
                };
                if !vals.iter().any(|v| have == Some(v)) {
                    continue 'rec;
                }
            }
            let rec = ProjectRecord::from_value(&self.projcoll, doc, &self.who)?;
            for p in perm.each() {
                if rec.authorized(self, p).await? {
                    out.push(rec);
                    continue 'rec;
                }
            }
        }
        Ok(out)
    }

    /// Select records matching a restricted `$and`/`$or` filter.  The
    /// filter structure is validated first; drivers without advanced
    /// query support reject the call.
    pub async fn adv_select_records(&self, filter: &Value, perm: Permissions)
        -> Result<Vec<ProjectRecord>>
    {
        if !self.backend.supports_advanced_queries() {
            return Err(DbioError::backend(
                "advanced queries are not supported by this backend",
            ));
        }
        if !check_query_structure(filter) {
            return Err(DbioError::InvalidQuery(filter.to_string()));
        }

        let docs = self.backend.select(&self.projcoll, false, &[]).await?;
        let mut out = Vec::new();
        'rec: for doc in docs {
            if !searched(&doc, filter) {
                continue;
            }
            let rec = ProjectRecord::from_value(&self.projcoll, doc, &self.who)?;
            for p in perm.each() {
                if rec.authorized(self, p).await? {
                    out.push(rec);
                    continue 'rec;
                }
            }
        }
        Ok(out)
    }

    /// Delete the record entirely.  The caller must hold `delete`.  The
    /// record's number is returned to the shoulder sequence if it is
    /// still the most recently minted.
    pub async fn delete_record(&self, id: &str) -> Result<bool> {
        let rec = match self.get_record_for(id, Permissions::DELETE).await {
            Ok(rec) => rec,
            Err(DbioError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        self.backend.delete(&self.projcoll, rec.id()).await?;
        if let Some((shoulder, num)) = parse_recid(rec.id()) {
            self.backend.try_push_recnum(&shoulder, num).await?;
        }
        Ok(true)
    }

    /// Save a provenance action.  The action's subject must name an
    /// existing record the user can write.
    pub async fn record_action(&self, act: &Action, coll: Option<&str>) -> Result<()> {
        if act.subject.is_empty() {
            return Err(DbioError::backend(
                "record_action(): action is missing a subject identifier",
            ));
        }
        if act.acttype == ActionType::Process
            && !act.object.as_ref().is_some_and(|o| o.get("name").is_some())
        {
            return Err(DbioError::backend(
                "record_action(): action object is missing name property",
            ));
        }

        let coll = coll.unwrap_or(&self.projcoll);
        let Some(doc) = self.backend.get(coll, &act.subject).await? else {
            return Err(DbioError::not_found(&act.subject));
        };
        let rec = ProjectRecord::from_value(coll, doc, &self.who)?;
        if !rec.authorized(self, Permissions::WRITE).await? {
            return Err(DbioError::not_authorized(
                &self.who,
                &format!("record action for id={}", rec.id()),
            ));
        }

        self.backend.save_action(&act.subject, act.to_value()).await
    }

    /// All actions currently logged for a record.
    pub async fn actions_for(&self, id: &str) -> Result<Vec<Value>> {
        self.backend.select_actions_for(id).await
    }

    /// Archive the record's action log into a history document ending
    /// with `close_action`, then clear the log.  The archive is readable
    /// by whoever can read the record; nothing else is granted.  Empty
    /// logs are skipped unless `force`.
    pub async fn close_actionlog_with(
        &self,
        rec: &ProjectRecord,
        close_action: Action,
        extra: Option<&serde_json::Map<String, Value>>,
        force: bool,
    ) -> Result<()> {
        if !rec.authorized(self, Permissions::WRITE).await? {
            return Err(DbioError::not_authorized(
                &self.who,
                &format!("close record history for id={}", rec.id()),
            ));
        }

        let mut history = self.backend.select_actions_for(rec.id()).await?;
        if history.is_empty() && !force {
            return Ok(());
        }
        history.push(close_action.to_value());

        let mut close_label = serde_json::to_value(close_action.acttype)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        if close_action.acttype == ActionType::Process {
            if let Some(obj) = &close_action.object {
                let name = obj.get("name").and_then(Value::as_str).map(String::from);
                close_label.push(':');
                close_label.push_str(&name.unwrap_or_else(|| obj.to_string()));
            }
        }

        let mut archive = serde_json::Map::new();
        archive.insert("recid".to_string(), Value::String(rec.id().to_string()));
        archive.insert("close_action".to_string(), Value::String(close_label));
        if let Some(extra) = extra {
            for (key, val) in extra {
                if key == "recid" || key == "close_action" {
                    continue;
                }
                archive.insert(key.clone(), val.clone());
            }
        }
        // readers of the record can read its history; no one can update it
        let read = rec.core.acls.get("read").cloned().unwrap_or_default();
        archive.insert("acls".to_string(), json!({ "read": read }));
        archive.insert("history".to_string(), Value::Array(history));

        self.backend.save_history(rec.id(), Value::Object(archive)).await?;
        self.backend.delete_actions_for(rec.id()).await
    }
}

/// Creates [`DbClient`] instances bound to a storage driver.
pub struct DbClientFactory {
    backend: Arc<dyn DbBackend>,
    cfg: DbioConfig,
    people: Option<Arc<dyn PeopleService>>,
}

impl DbClientFactory {
    pub fn new(backend: Arc<dyn DbBackend>, cfg: DbioConfig) -> DbClientFactory {
        DbClientFactory { backend, cfg, people: None }
    }

    pub fn with_people(mut self, people: Arc<dyn PeopleService>) -> DbClientFactory {
        self.people = Some(people);
        self
    }

    pub fn backend(&self) -> Arc<dyn DbBackend> {
        self.backend.clone()
    }

    /// Create a client for the given service collection acting for the
    /// given user.
    pub fn create_client(&self, servicetype: &str, foruser: &str) -> DbClient {
        self.create_client_with(servicetype, DbioConfig::default(), foruser)
    }

    /// As [`create_client`](Self::create_client), with service-specific
    /// configuration merged over the factory defaults.
    pub fn create_client_with(&self, servicetype: &str, cfg: DbioConfig, foruser: &str)
        -> DbClient
    {
        let foruser = if foruser.is_empty() { ANONYMOUS } else { foruser };
        DbClient::new(
            self.backend.clone(),
            cfg.merged_over(&self.cfg),
            servicetype,
            foruser,
            self.people.clone(),
        )
    }
}
