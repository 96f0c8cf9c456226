//! The stateful workflow engine over project records.
//!
//! A service instance acts on behalf of one [`Agent`] and enforces the
//! record lifecycle: edit, finalize, submit, publish, and the
//! update-prep transition that reopens a published record for revision.
//! Multi-step transitions take a per-record lock; provenance recording
//! is best-effort and never blocks a state change.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::OwnedMutexGuard;

use midas_shared::ids::{arkify_recid, version_ext, ARK_NAAN, RELHIST_EXTENSION};
use midas_shared::models::{Permissions, ANONYMOUS, AUTOADMIN, PUBLIC_GROUP};
use midas_shared::prov::{process_object, Action, ActionType, Agent};
use midas_shared::status::{
    ProjectState, RecordStatus, ACTION_CLEAR, ACTION_CREATE, ACTION_FINALIZE, ACTION_PUBLISH,
    ACTION_RESTORE, ACTION_SUBMIT, ACTION_UPDATE, ACTION_UPDATE_PREP,
};
use midas_shared::version::{OarVersion, EDIT_SUFFIX, MINOR_LEVEL};

use crate::dbio::{DbClient, DbClientFactory, DbioConfig, DbioError, ProjectRecord, Result};
use crate::restore::from_archived_at;

use super::merge::{apply_at_part, extract_part, merge_into, PartUpdate};
use super::validate::{DataValidator, NoopValidator};

/// Provenance patches above this serialized size are summarized rather
/// than stored verbatim.
const PATCH_SIZE_CAP: usize = 8192;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectServiceConfig {
    /// ACLs granted on newly created records: permission name to the
    /// principals receiving it.
    #[serde(default)]
    pub default_perms: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub ark_naan: Option<String>,
    /// DBIO client parameters for this project type (shoulders,
    /// superusers).
    #[serde(default)]
    pub dbio: DbioConfig,
    /// Prefix for `archived_at` URLs; defaults to the record store
    /// scheme.
    #[serde(default)]
    pub archive_prefix: Option<String>,
}

/// Coarse-grained per-record locks serialising multi-step transitions.
#[derive(Default)]
pub struct RecordLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RecordLocks {
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().unwrap();
            map.entry(id.to_string()).or_default().clone()
        };
        entry.lock_owned().await
    }
}

pub struct ProjectService {
    dbcli: DbClient,
    cfg: ProjectServiceConfig,
    who: Agent,
    locks: Arc<RecordLocks>,
    validator: Arc<dyn DataValidator>,
}

impl ProjectService {
    pub fn new(
        dbcli: DbClient,
        cfg: ProjectServiceConfig,
        who: Agent,
        locks: Arc<RecordLocks>,
        validator: Arc<dyn DataValidator>,
    ) -> ProjectService {
        ProjectService { dbcli, cfg, who, locks, validator }
    }

    /// The agent this service acts on behalf of.
    pub fn user(&self) -> &Agent {
        &self.who
    }

    /// The DBIO client bound to this service's project type and user.
    pub fn dbclient(&self) -> &DbClient {
        &self.dbcli
    }

    fn naan(&self) -> &str {
        self.cfg.ark_naan.as_deref().unwrap_or(ARK_NAAN)
    }

    fn arkify(&self, recid: &str) -> String {
        arkify_recid(recid, self.naan())
    }

    fn archived_at_for(&self, arkid: &str) -> String {
        let prefix = self.cfg.archive_prefix.as_deref().unwrap_or("dbio_store:");
        format!("{}{}_latest/{}", prefix, self.dbcli.project(), arkid)
    }

    pub async fn exists(&self, id: &str) -> Result<bool> {
        self.dbcli.exists(id).await
    }

    // provenance recording is tolerant of failure
    async fn record_action(&self, act: Action) {
        if let Err(e) = self.dbcli.record_action(&act, None).await {
            log::error!(
                "Failed to record provenance action for {} ({:?}: {}): {e}",
                act.subject,
                act.acttype,
                act.message.as_deref().unwrap_or("")
            );
        }
    }

    async fn try_save(&self, prec: &mut ProjectRecord) {
        if let Err(e) = prec.save(&self.dbcli).await {
            log::error!("Failed to save project record, {}: {e}", prec.id());
        }
    }

    /// A JSON-Patch describing the change from `old` to `new`,
    /// summarized when structurally large.
    fn jsondiff(old: &Value, new: &Value) -> Value {
        let patch = json_patch::diff(old, new);
        let val = serde_json::to_value(&patch).unwrap_or(Value::Null);
        if val.to_string().len() > PATCH_SIZE_CAP {
            json!({
                "summary": format!("large update: {} patch operations elided", patch.0.len())
            })
        } else {
            val
        }
    }

    // ------------------------------------------------------------------
    // creation / retrieval
    // ------------------------------------------------------------------

    /// Create a new project record with the given name, minting an
    /// identifier for it.
    ///
    /// `dbid` may request a shoulder (no colon) or a full identifier;
    /// `meta.foruser` reassigns the new record when the caller is
    /// authorized to do so.
    pub async fn create_record(
        &self,
        name: &str,
        data: Option<Map<String, Value>>,
        meta: Option<Map<String, Value>>,
        dbid: Option<&str>,
    ) -> Result<ProjectRecord> {
        let (shoulder, localid) = match dbid {
            Some(dbid) => match dbid.split_once(':') {
                Some((sh, local)) => (Some(sh.to_string()), Some(local.to_string())),
                None => (Some(dbid.to_string()), None),
            },
            None => (None, None),
        };

        // format of foruser: either "newuserid" or "olduserid:newuserid"
        let foruser = meta
            .as_ref()
            .and_then(|m| m.get("foruser"))
            .and_then(Value::as_str)
            .and_then(|v| v.rsplit(':').next())
            .filter(|v| !v.is_empty())
            .map(String::from);

        if self.dbcli.user_id() == ANONYMOUS {
            log::warn!("A new record requested for an anonymous user");
        }

        let mut prec = self
            .dbcli
            .create_record(name, shoulder.as_deref(), localid.as_deref(), None)
            .await?;
        let shoulder = prec.id().split(':').next().unwrap_or_default().to_string();

        for (perm, ids) in &self.cfg.default_perms {
            let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
            prec.core.grant_perm_to(&self.dbcli, perm, &ids).await?;
        }
        prec.status_mut().created_by = Some(self.who.id().to_string());

        if let Some(foruser) = foruser {
            if self.dbcli.user_id() == ANONYMOUS {
                log::warn!("{} wants to reassign new record to {foruser}", self.dbcli.user_id());
            }
            if let Err(DbioError::NotAuthorized { .. }) =
                prec.reassign(&self.dbcli, &foruser, false).await
            {
                log::warn!(
                    "{}: {} not authorized to reassign owner to {foruser}",
                    prec.id(),
                    self.dbcli.user_id()
                );
            }
        }

        let mut newmeta = self.new_metadata_for(&shoulder);
        if let Some(meta) = meta {
            merge_into(&meta, &mut newmeta, -1);
        }
        newmeta.insert("agent_vehicle".to_string(), Value::String(self.who.vehicle.clone()));
        if prec.meta.is_empty() {
            prec.meta = newmeta;
        } else {
            merge_into(&newmeta, &mut prec.meta, -1);
        }
        prec.data = self.new_data_for(prec.id());
        prec.status_mut().act(ACTION_CREATE, "draft created", -1.0);

        if let Some(data) = data {
            self.update_data_on(&mut prec, Value::Object(data), None, None, false).await?;
        } else {
            prec.save(&self.dbcli).await?;
        }

        let msg = prec.status().message.clone();
        self.record_action(Action::new(ActionType::Create, prec.id(), &self.who, &msg)).await;
        log::info!(
            "Created {} record {} ({}) for {}",
            self.dbcli.project(),
            prec.id(),
            prec.name(),
            self.who
        );
        Ok(prec)
    }

    /// The default data skeleton for a new (or cleared) record.  An
    /// editable draft always carries a pending-marked version.
    fn new_data_for(&self, _recid: &str) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("@version".to_string(), Value::String(format!("1.0.0{EDIT_SUFFIX}")));
        data
    }

    /// The default bookkeeping metadata for a new record.
    fn new_metadata_for(&self, _shoulder: &str) -> Map<String, Value> {
        Map::new()
    }

    /// Fetch the record; requires `read`.
    pub async fn get_record(&self, id: &str) -> Result<ProjectRecord> {
        self.dbcli.get_record_for(id, Permissions::READ).await
    }

    /// The current status of the record.
    pub async fn get_status(&self, id: &str) -> Result<RecordStatus> {
        Ok(self.get_record(id).await?.status().clone())
    }

    /// Return the record's data, or the part of it selected by a
    /// slash-delimited pointer.
    pub async fn get_data(&self, id: &str, part: Option<&str>) -> Result<Value> {
        let prec = self.get_record(id).await?;
        match part {
            None => Ok(Value::Object(prec.data.clone())),
            Some(part) => extract_part(&prec.data, part)
                .cloned()
                .ok_or_else(|| DbioError::not_found_part(id, part)),
        }
    }

    /// Review the record for completeness.  The default validator
    /// applies no tests.
    pub async fn review(&self, id: &str) -> Result<super::validate::ValidationResults> {
        let prec = self.get_record(id).await?;
        Ok(self.validator.finally_validate(&prec))
    }

    // ------------------------------------------------------------------
    // data updates
    // ------------------------------------------------------------------

    /// Merge the given data into the record's saved content.  See
    /// [`merge_into`] for the merge contract.
    pub async fn update_data(
        &self,
        id: &str,
        newdata: Value,
        part: Option<&str>,
        message: Option<&str>,
    ) -> Result<Value> {
        let _guard = self.locks.lock(id).await;
        let mut prec = self.dbcli.get_record_for(id, Permissions::WRITE).await?;
        self.update_data_on(&mut prec, newdata, part, message, true).await
    }

    async fn update_data_on(
        &self,
        prec: &mut ProjectRecord,
        newdata: Value,
        part: Option<&str>,
        message: Option<&str>,
        set_action: bool,
    ) -> Result<Value> {
        let id = prec.id().to_string();
        if prec.status().state == ProjectState::Published {
            log::info!("{id}: Preparing published record for revision");
            self.prep_for_update(prec).await?;
        }
        if !prec.status().state.is_editable() {
            return Err(DbioError::NotEditable { id });
        }

        let diffobj;
        let mut provact;
        match part {
            None => {
                let olddata = Value::Object(prec.data.clone());
                if let Value::Object(upd) = &newdata {
                    merge_into(upd, &mut prec.data, -1);
                }
                diffobj = Self::jsondiff(&olddata, &Value::Object(prec.data.clone()));
                provact = Action::new(ActionType::Patch, &id, &self.who, &prec.status().message)
                    .with_object(diffobj);
            }
            Some(part) => {
                let old = apply_at_part(&mut prec.data, part, newdata, PartUpdate::Merge)
                    .map_err(|()| DbioError::PartNotAccessible {
                        id: id.clone(),
                        part: part.to_string(),
                    })?;
                let newleaf = extract_part(&prec.data, part).cloned().unwrap_or(Value::Null);
                diffobj = Self::jsondiff(&old.unwrap_or(Value::Null), &newleaf);
                let msg = message.unwrap_or("draft updated");
                provact = Action::new(ActionType::Patch, &id, &self.who, msg);
                provact.add_subaction(
                    Action::new(
                        ActionType::Patch,
                        &format!("{id}#data.{part}"),
                        &self.who,
                        &format!("updating data.{part}"),
                    )
                    .with_object(diffobj),
                );
            }
        }

        let message = message.unwrap_or("draft updated");
        let action = set_action.then_some(ACTION_UPDATE);
        let res = self.save_data(prec, message, action, set_action).await;
        match &res {
            Err(e @ DbioError::InvalidUpdate { .. }) => {
                provact.set_message(&format!(
                    "Failed to save update due to invalid data: {}",
                    e.format_errors()
                ));
            }
            Err(e) => {
                log::error!("Failed to save update for project, {id}: {e}");
                provact.set_message("Failed to save update due to an internal error");
            }
            Ok(()) => {}
        }
        self.record_action(provact).await;
        res?;

        log::info!(
            "Updated data for {} record {} ({}) for {}",
            self.dbcli.project(),
            id,
            prec.name(),
            self.who
        );
        match part {
            None => Ok(Value::Object(prec.data.clone())),
            Some(part) => Ok(extract_part(&prec.data, part).cloned().unwrap_or(Value::Null)),
        }
    }

    /// Replace the record's data (or a part of it) outright, starting
    /// from the default skeleton.
    pub async fn replace_data(
        &self,
        id: &str,
        newdata: Value,
        part: Option<&str>,
        message: Option<&str>,
    ) -> Result<Value> {
        let _guard = self.locks.lock(id).await;
        let mut prec = self.dbcli.get_record_for(id, Permissions::WRITE).await?;
        if prec.status().state == ProjectState::Published {
            log::info!("{id}: Preparing published record for revision");
            self.prep_for_update(&mut prec).await?;
        }
        if !prec.status().state.is_editable() {
            return Err(DbioError::NotEditable { id: id.to_string() });
        }

        let olddata = Value::Object(prec.data.clone());
        let mut provact;
        match part {
            None => {
                let mut data = self.new_data_for(id);
                if let Value::Object(upd) = &newdata {
                    merge_into(upd, &mut data, -1);
                }
                prec.data = data;
                let diffobj = Self::jsondiff(&olddata, &Value::Object(prec.data.clone()));
                provact = Action::new(ActionType::Put, id, &self.who, &prec.status().message)
                    .with_object(diffobj);
            }
            Some(part) => {
                let old = apply_at_part(&mut prec.data, part, newdata, PartUpdate::Replace)
                    .map_err(|()| DbioError::PartNotAccessible {
                        id: id.to_string(),
                        part: part.to_string(),
                    })?;
                let newleaf = extract_part(&prec.data, part).cloned().unwrap_or(Value::Null);
                let diffobj = Self::jsondiff(&old.unwrap_or(Value::Null), &newleaf);
                provact = Action::new(ActionType::Patch, id, &self.who, &prec.status().message);
                provact.add_subaction(
                    Action::new(
                        ActionType::Put,
                        &format!("{id}#data.{part}"),
                        &self.who,
                        &format!("replacing data.{part}"),
                    )
                    .with_object(diffobj),
                );
            }
        }

        let message = message.unwrap_or("draft updated");
        let res = self.save_data(&mut prec, message, Some(ACTION_UPDATE), true).await;
        match &res {
            Err(DbioError::PartNotAccessible { .. }) => {
                // client request error; don't record the action
                res?;
            }
            Err(e) => {
                log::error!("Failed to save update to project, {id}: {e}");
                provact.set_message("Failed to save update due to an internal error");
                self.record_action(provact).await;
                res?;
            }
            Ok(()) => {
                self.record_action(provact).await;
            }
        }

        log::info!(
            "Replaced data for {} record {} ({}) for {}",
            self.dbcli.project(),
            id,
            prec.name(),
            self.who
        );
        match part {
            None => Ok(Value::Object(prec.data.clone())),
            Some(part) => Ok(extract_part(&prec.data, part).cloned().unwrap_or(Value::Null)),
        }
    }

    /// Final transformations and minimal validation applied on every
    /// data save.
    async fn save_data(
        &self,
        prec: &mut ProjectRecord,
        message: &str,
        action: Option<&str>,
        update_state: bool,
    ) -> Result<()> {
        let errors = self.validator.minimally_validate(&prec.data, prec.id());
        if !errors.is_empty() {
            return Err(DbioError::invalid_update(prec.id(), None, errors));
        }

        if let Some(action) = action {
            prec.status_mut().act(action, message, -1.0);
        } else {
            prec.status_mut().message = message.to_string();
        }
        if update_state {
            prec.status_mut().set_state(ProjectState::Edit, -1.0);
        }
        prec.save(&self.dbcli).await
    }

    /// Reset the record's data (or a part of it) to its default
    /// skeleton.  Returns false if `part` does not exist in either the
    /// data or the defaults.
    pub async fn clear_data(&self, id: &str, part: Option<&str>, message: Option<&str>)
        -> Result<bool>
    {
        let _guard = self.locks.lock(id).await;
        let mut prec = self.dbcli.get_record_for(id, Permissions::WRITE).await?;
        if !prec.status().state.is_editable() {
            return Err(DbioError::NotEditable { id: id.to_string() });
        }

        let initdata = self.new_data_for(id);
        let mut provact;
        match part {
            None => {
                prec.data = initdata;
                let message = message.unwrap_or("reset draft to initial defaults");
                prec.status_mut().act(ACTION_CLEAR, message, -1.0);
                provact = Action::new(ActionType::Delete, id, &self.who, message);
            }
            Some(part) => {
                match extract_part(&initdata, part) {
                    Some(default) => {
                        let default = default.clone();
                        if apply_at_part(&mut prec.data, part, default, PartUpdate::Replace)
                            .is_err()
                        {
                            return Err(DbioError::PartNotAccessible {
                                id: id.to_string(),
                                part: part.to_string(),
                            });
                        }
                    }
                    None => {
                        if !remove_part(&mut prec.data, part) {
                            return Ok(false);
                        }
                    }
                }
                let message =
                    message.map(String::from).unwrap_or(format!("reset {part} to initial defaults"));
                prec.status_mut().act(ACTION_UPDATE, &message, -1.0);
                provact = Action::new(ActionType::Patch, id, &self.who, &message);
                provact.add_subaction(Action::new(
                    ActionType::Delete,
                    &format!("{id}#data.{part}"),
                    &self.who,
                    &format!("clearing data.{part}"),
                ));
            }
        }
        prec.status_mut().set_state(ProjectState::Edit, -1.0);

        let res = prec.save(&self.dbcli).await;
        if let Err(e) = &res {
            log::error!("Failed to save cleared data for project, {id}: {e}");
            provact.set_message("Failed to clear requested data due to internal error");
        }
        self.record_action(provact).await;
        res?;

        log::info!(
            "Cleared out data for {} record {} ({}) for {}",
            self.dbcli.project(),
            id,
            prec.name(),
            self.who
        );
        Ok(true)
    }

    /// Attach a message to the record's current status.  The record
    /// must be in the edit state.
    pub async fn update_status_message(&self, id: &str, message: &str) -> Result<RecordStatus> {
        let mut prec = self.dbcli.get_record_for(id, Permissions::WRITE).await?;
        if prec.status().state != ProjectState::Edit {
            return Err(DbioError::NotEditable { id: id.to_string() });
        }
        prec.status_mut().message = message.to_string();
        prec.save(&self.dbcli).await?;
        self.record_action(Action::new(ActionType::Comment, id, &self.who, message)).await;
        Ok(prec.status().clone())
    }

    // ------------------------------------------------------------------
    // ownership / naming
    // ------------------------------------------------------------------

    /// Reassign ownership of the record and log the change.  Returns
    /// the new owner.
    pub async fn reassign_record(&self, id: &str, recipient: &str, disown: bool)
        -> Result<String>
    {
        let mut prec = self.dbcli.get_record_for(id, Permissions::READ).await?;
        let message = format!("from {} to {recipient}", prec.owner());
        log::info!("Reassigning ownership of {id} {message}");
        prec.reassign(&self.dbcli, recipient, disown).await?;
        prec.save(&self.dbcli).await?;
        self.record_action(Action::new(
            ActionType::Comment,
            id,
            &self.who,
            &format!("Reassigned ownership {message}"),
        ))
        .await;
        Ok(prec.owner().to_string())
    }

    /// Rename the record and log the change.  Returns the new name.
    pub async fn rename_record(&self, id: &str, newname: &str) -> Result<String> {
        let mut prec = self.dbcli.get_record_for(id, Permissions::READ).await?;
        let message = format!("from {} to {newname}", prec.name());
        log::info!("Renaming {id} {message}");
        prec.rename(&self.dbcli, newname).await?;
        prec.save(&self.dbcli).await?;
        self.record_action(Action::new(
            ActionType::Comment,
            id,
            &self.who,
            &format!("Renaming {message}"),
        ))
        .await;
        Ok(prec.name().to_string())
    }

    // ------------------------------------------------------------------
    // deletion / restore
    // ------------------------------------------------------------------

    /// Delete the draft.  A previously published record is not erased;
    /// its data is restored to the last published snapshot and the stub
    /// returned.
    pub async fn delete_record(&self, id: &str) -> Result<Option<ProjectRecord>> {
        let _guard = self.locks.lock(id).await;
        let mut prec = self.dbcli.get_record_for(id, Permissions::DELETE).await?;

        let mut provact = Action::new(ActionType::Delete, id, &self.who, "deleted draft record");
        let published = prec.status().published_as.is_some();
        let res: Result<Option<ProjectRecord>> = if published {
            self.restore_last_published(
                &mut prec,
                Some("Deleted draft revision (restored previously published version)"),
                Some(&mut provact),
                true,
            )
            .await
            .map(|()| Some(prec))
        } else {
            self.dbcli.delete_record(id).await.map(|_| None)
        };

        if let Err(e) = &res {
            log::error!("Failed to delete draft for rec, {id}: {e}");
            provact.set_message("Failed to delete draft due to internal error");
        }
        self.record_action(provact).await;
        res
    }

    /// Restore the record's data to the last published snapshot via the
    /// archive location recorded in its status.
    async fn restore_last_published(
        &self,
        prec: &mut ProjectRecord,
        message: Option<&str>,
        foract: Option<&mut Action>,
        reset_state: bool,
    ) -> Result<()> {
        if prec.status().published_as.is_none() {
            return Err(DbioError::backend(
                "restore_last_published(): project record is missing published_as property",
            ));
        }
        if prec.status().archived_at.is_some() {
            log::warn!("{}: archived_at property is set but will be ignored; assuming default", prec.id());
        }
        let archived_at = self.archived_at_for(&self.arkify(prec.id()));

        let mut provact = Action::new(
            ActionType::Process,
            prec.id(),
            &self.who,
            &format!("restored data to last published ({archived_at})"),
        )
        .with_object(process_object("restore_last_published", None));

        let res: Result<()> = async {
            let mut restorer = from_archived_at(&archived_at, &self.dbcli)?;
            restorer.restore(prec, true).await?;
            if reset_state {
                // published copies are stored in the published state
                prec.status_mut().set_state(ProjectState::Published, -1.0);
            }
            prec.status_mut().act(
                ACTION_RESTORE,
                message.unwrap_or("Restored draft to last published version"),
                -1.0,
            );
            prec.save(&self.dbcli).await
        }
        .await;

        if let Err(e) = &res {
            log::error!(
                "Failed to save prepped-for-revision record for project, {}: {e}",
                prec.id()
            );
            provact.set_message("Failed to save prepped-for-revision data due to internal error");
        }
        match foract {
            Some(parent) => parent.add_subaction(provact),
            None => self.record_action(provact).await,
        }
        res
    }

    /// Reopen a published record for editing: restore the last
    /// published data and return the state to `edit`.
    async fn prep_for_update(&self, prec: &mut ProjectRecord) -> Result<()> {
        let mut provact =
            Action::new(ActionType::Process, prec.id(), &self.who, "prep for update")
                .with_object(process_object("prep_for_update", None));

        let res: Result<()> = async {
            if prec.status().published_as.is_some() {
                let archived_at = self.archived_at_for(&self.arkify(prec.id()));
                let mut restorer = from_archived_at(&archived_at, &self.dbcli)?;
                restorer.restore(prec, true).await?;
            }
            // reopen the version for further edits
            if let Some(Value::String(vers)) = prec.data.get("@version").cloned() {
                let mut vers = OarVersion::parse(&vers);
                prec.data
                    .insert("@version".to_string(), Value::String(vers.as_draft().to_string()));
            }
            prec.status_mut().set_state(ProjectState::Edit, -1.0);
            prec.status_mut().act(
                ACTION_UPDATE_PREP,
                "Previous publication is ready for revision",
                -1.0,
            );
            prec.save(&self.dbcli).await
        }
        .await;

        if let Err(e) = &res {
            log::error!("Failed to save prepped record for project, {}: {e}", prec.id());
            provact.set_message("Failed to save prepped record due to internal error");
        }
        self.record_action(provact).await;
        res
    }

    // ------------------------------------------------------------------
    // finalize / submit / publish
    // ------------------------------------------------------------------

    /// Apply the final automated updates (version, identifier, release
    /// history) and validate the result.  On success the record is left
    /// in the `ready` state.
    pub async fn finalize(&self, id: &str, message: Option<&str>) -> Result<RecordStatus> {
        let _guard = self.locks.lock(id).await;
        let mut prec = self.dbcli.get_record_for(id, Permissions::WRITE).await?;
        self.finalize_on(&mut prec, message, true).await
    }

    async fn finalize_on(
        &self,
        prec: &mut ProjectRecord,
        message: Option<&str>,
        reset_state: bool,
    ) -> Result<RecordStatus> {
        let id = prec.id().to_string();
        if !prec.status().state.is_editable() {
            return Err(DbioError::NotEditable { id });
        }

        prec.status_mut().set_state(ProjectState::Processing, -1.0);
        prec.status_mut().act(ACTION_FINALIZE, "in progress", -1.0);
        prec.save(&self.dbcli).await?;

        match self.apply_final_updates(prec, message).await {
            Err(e @ (DbioError::InvalidRecord { .. } | DbioError::InvalidUpdate { .. })) => {
                let emsg = format!("finalize process failed: {e}");
                self.record_action(
                    Action::new(ActionType::Process, &id, &self.who, &emsg)
                        .with_object(process_object("finalize", Some(e.errors()))),
                )
                .await;
                prec.status_mut().set_state(ProjectState::Edit, -1.0);
                prec.status_mut().act(ACTION_FINALIZE, &e.format_errors(), -1.0);
                self.try_save(prec).await;
                Err(e)
            }
            Err(e) => {
                log::error!("Failed to finalize project record, {id}: {e}");
                let emsg = "Failed to finalize due to an internal error".to_string();
                self.record_action(
                    Action::new(ActionType::Process, &id, &self.who, &emsg)
                        .with_object(process_object("finalize", Some(&[emsg.clone()]))),
                )
                .await;
                prec.status_mut().set_state(ProjectState::Edit, -1.0);
                prec.status_mut().act(ACTION_FINALIZE, &emsg, -1.0);
                self.try_save(prec).await;
                Err(e)
            }
            Ok(defmsg) => {
                self.record_action(
                    Action::new(ActionType::Process, &id, &self.who, &defmsg)
                        .with_object(process_object("finalize", None)),
                )
                .await;
                if reset_state {
                    prec.status_mut().set_state(ProjectState::Ready, -1.0);
                }
                prec.status_mut().act(ACTION_FINALIZE, message.unwrap_or(&defmsg), -1.0);
                prec.save(&self.dbcli).await?;
                log::info!(
                    "Finalized {} record {} ({}) for {}",
                    self.dbcli.project(),
                    id,
                    prec.name(),
                    self.who
                );
                Ok(prec.status().clone())
            }
        }
    }

    async fn apply_final_updates(&self, prec: &mut ProjectRecord, message: Option<&str>)
        -> Result<String>
    {
        let level = self.determine_update_level(prec);
        let ver = self.finalize_version(prec, level);
        let id = self.finalize_id(prec);
        self.update_release_history(prec, &ver, message);

        let mut note = "";
        let res = self.validator.finally_validate(prec);
        if !res.applied {
            log::warn!("{}: No final validations applied!", prec.id());
        } else if res.count_failed() > 0 {
            return Err(DbioError::InvalidUpdate {
                id: Some(prec.id().to_string()),
                part: None,
                errors: res.failed,
            });
        } else if res.count_warnings() > 0 {
            note = " (some warnings detected)";
        }

        Ok(format!("draft is ready for submission as {id}, {ver}{note}"))
    }

    /// Which version field a finalization should increment, or None
    /// when the version should be kept as-is.  The first publication
    /// drops the edit marker without incrementing, producing `1.0.0`;
    /// a draft with a publication behind it gets a minor increment.
    fn determine_update_level(&self, prec: &ProjectRecord) -> Option<usize> {
        let has_release = prec
            .data
            .get("releaseHistory")
            .and_then(|r| r.get("hasRelease"))
            .and_then(Value::as_array)
            .is_some_and(|l| !l.is_empty());
        if prec.status().published_as.is_none() && !has_release {
            return None;
        }
        Some(MINOR_LEVEL)
    }

    /// Settle the version the record will be published as.  A draft
    /// suffix is dropped and, when a level is given, that field is
    /// incremented; a record without a version becomes `1.0.0`.
    fn finalize_version(&self, prec: &mut ProjectRecord, level: Option<usize>) -> String {
        let current = prec
            .data
            .get("@version")
            .and_then(Value::as_str)
            .unwrap_or("1.0.0")
            .to_string();
        let mut vers = OarVersion::parse(&current);
        if vers.is_draft() {
            vers.drop_suffix();
            if let Some(level) = level {
                vers.increment_field(level);
            }
        }
        let vers = vers.to_string();
        prec.data.insert("@version".to_string(), Value::String(vers.clone()));
        vers
    }

    /// Settle the public identifier: assigned once, on the first
    /// finalization.
    fn finalize_id(&self, prec: &mut ProjectRecord) -> String {
        if let Some(id) = prec.data.get("@id").and_then(Value::as_str) {
            if !id.is_empty() {
                return id.to_string();
            }
        }
        let arkid = self.arkify(prec.id());
        prec.data.insert("@id".to_string(), Value::String(arkid.clone()));
        arkid
    }

    /// Insert or update the release-history entry for the version being
    /// finalized.
    fn update_release_history(&self, prec: &mut ProjectRecord, version: &str, message: Option<&str>) {
        let arkid = prec
            .data
            .get("@id")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| self.arkify(prec.id()));

        let relhist = prec
            .data
            .entry("releaseHistory".to_string())
            .or_insert_with(|| {
                json!({
                    "@id": format!("{arkid}{RELHIST_EXTENSION}"),
                    "@type": ["nrdr:ReleaseHistory"],
                    "label": "Release History",
                    "hasRelease": [],
                })
            });
        let Some(releases) = relhist.get_mut("hasRelease").and_then(Value::as_array_mut) else {
            return;
        };

        let entry = json!({
            "version": version,
            "@id": format!("{arkid}{}", version_ext(version)),
            "description": message.unwrap_or("initial release"),
        });
        match releases
            .iter_mut()
            .find(|r| r.get("version").and_then(Value::as_str) == Some(version))
        {
            Some(existing) => *existing = entry,
            None => releases.push(entry),
        }
    }

    /// Finalize the record and send it to its post-editing destination.
    pub async fn submit(&self, id: &str, message: Option<&str>) -> Result<RecordStatus> {
        let _guard = self.locks.lock(id).await;
        let mut prec = self.dbcli.get_record_for(id, Permissions::ADMIN).await?;
        if !prec.status().state.is_editable() {
            return Err(DbioError::NotSubmitable {
                id: id.to_string(),
                message: format!(
                    "Project not in submitable state: {}",
                    prec.status().state.label()
                ),
                errors: Vec::new(),
            });
        }
        self.finalize_on(&mut prec, message, false).await?;

        match self.do_submit(&mut prec).await {
            Err(e @ (DbioError::InvalidRecord { .. } | DbioError::InvalidUpdate { .. })) => {
                let emsg = format!("submit process failed: {e}");
                self.record_action(
                    Action::new(ActionType::Process, id, &self.who, &emsg)
                        .with_object(process_object("submit", Some(e.errors()))),
                )
                .await;
                prec.status_mut().set_state(ProjectState::Edit, -1.0);
                prec.status_mut().act(ACTION_SUBMIT, &e.format_errors(), -1.0);
                self.try_save(&mut prec).await;
                Err(DbioError::SubmissionFailed {
                    id: id.to_string(),
                    message: format!("Invalid record could not be submitted: {e}"),
                })
            }
            Err(e) => {
                let emsg = "Submit process failed due to an internal error".to_string();
                self.record_action(
                    Action::new(ActionType::Process, id, &self.who, &emsg)
                        .with_object(process_object("submit", Some(&[emsg.clone()]))),
                )
                .await;
                prec.status_mut().set_state(ProjectState::Edit, -1.0);
                prec.status_mut().act(ACTION_SUBMIT, &emsg, -1.0);
                self.try_save(&mut prec).await;
                Err(DbioError::SubmissionFailed {
                    id: id.to_string(),
                    message: format!("Submission action failed: {e}"),
                })
            }
            Ok(poststat) => {
                let message = match message {
                    Some(m) => m.to_string(),
                    None => {
                        let initial = prec.data.get("@version").and_then(Value::as_str)
                            == Some("1.0.0");
                        let kind = if initial { "Initial version" } else { "Revision" };
                        format!("{kind} {}", poststat.label())
                    }
                };
                self.record_action(
                    Action::new(ActionType::Process, id, &self.who, &message)
                        .with_object(process_object("submit", None)),
                )
                .await;
                prec.status_mut().set_state(poststat, -1.0);
                prec.status_mut().act(ACTION_SUBMIT, &message, -1.0);
                prec.save(&self.dbcli).await?;
                log::info!(
                    "Submitted {} record {} ({}) for {}",
                    self.dbcli.project(),
                    id,
                    prec.name(),
                    self.who
                );
                Ok(prec.status().clone())
            }
        }
    }

    /// Send the finalized record to its post-editing destination.  The
    /// default destination publishes immediately.
    async fn do_submit(&self, prec: &mut ProjectRecord) -> Result<ProjectState> {
        self.do_publish(prec).await
    }

    /// The terminal transition: archive the record into the publication
    /// collections.  The record must have been submitted (or accepted)
    /// and every registered external review approved.
    pub async fn publish(&self, id: &str) -> Result<RecordStatus> {
        let _guard = self.locks.lock(id).await;
        let mut prec = self.dbcli.get_record_for(id, Permissions::PUBLISH).await?;
        let state = prec.status().state;
        let refuse = |message: String| {
            Err(DbioError::NotSubmitable { id: id.to_string(), message, errors: Vec::new() })
        };
        match state {
            ProjectState::Published => return refuse("Already published".to_string()),
            ProjectState::InPress => return refuse("Publication already in progress".to_string()),
            ProjectState::Edit => {
                return refuse("Project has not been submitted for publication yet".to_string())
            }
            ProjectState::Submitted | ProjectState::Accepted => {}
            other => {
                return refuse(format!("Project not in a publishable state: {}", other.label()))
            }
        }
        if state != ProjectState::Accepted
            && prec
                .status()
                .publish_review
                .values()
                .any(|rev| rev.phase != "approved")
        {
            return refuse("Not all external reviews are completed".to_string());
        }

        log::info!("Submitting rec, {id}, for publication");
        match self.do_publish(&mut prec).await {
            Err(e @ (DbioError::InvalidRecord { .. } | DbioError::InvalidUpdate { .. })) => {
                let emsg = format!("publishing process failed: {e}");
                log::error!("{emsg}");
                self.record_action(
                    Action::new(ActionType::Process, id, &self.who, &emsg)
                        .with_object(process_object("publish", Some(e.errors()))),
                )
                .await;
                prec.status_mut().set_state(ProjectState::Unwell, -1.0);
                prec.status_mut().act(ACTION_PUBLISH, &e.format_errors(), -1.0);
                self.try_save(&mut prec).await;
                Err(e)
            }
            Err(e) => {
                let mut emsg = "Publishing process failed due to an internal error".to_string();
                log::error!("{emsg}: {e}");
                self.record_action(
                    Action::new(ActionType::Process, id, &self.who, &emsg)
                        .with_object(process_object("publish", Some(&[emsg.clone()]))),
                )
                .await;
                prec.status_mut().set_state(ProjectState::Unwell, -1.0);
                emsg.push_str(&format!(": {e}"));
                prec.status_mut().act(ACTION_PUBLISH, &emsg, -1.0);
                self.try_save(&mut prec).await;
                Err(e)
            }
            Ok(poststat) => {
                let initial =
                    prec.data.get("@version").and_then(Value::as_str) == Some("1.0.0");
                let mut message =
                    if initial { "Initial publication" } else { "Revised publication" }.to_string();
                if poststat == ProjectState::Published {
                    message.push_str(" successful");
                } else {
                    message.push_str(" in progress");
                }
                self.record_action(
                    Action::new(ActionType::Process, id, &self.who, &message)
                        .with_object(process_object("publish", None)),
                )
                .await;
                prec.status_mut().set_state(poststat, -1.0);
                prec.status_mut().act(ACTION_PUBLISH, &message, -1.0);
                prec.save(&self.dbcli).await?;
                Ok(prec.status().clone())
            }
        }
    }

    /// Write the published copies: `<proj>_latest/<ARK-ID>` (replaced
    /// on each publication) and the immutable
    /// `<proj>_version/<ARK-ID>/pdr:v/<VERSION>`.  Both carry read-only
    /// public ACLs.
    async fn do_publish(&self, prec: &mut ProjectRecord) -> Result<ProjectState> {
        let endstate = ProjectState::Published;
        let arkid = self.arkify(prec.id());
        let version = prec
            .data
            .get("@version")
            .and_then(Value::as_str)
            .unwrap_or("0")
            .to_string();

        let latest_coll = format!("{}_latest", self.dbcli.project());
        let version_coll = format!("{}_version", self.dbcli.project());
        let latestcli = self.dbcli.client_for(&latest_coll, Some(AUTOADMIN));
        let versioncli = self.dbcli.client_for(&version_coll, Some(AUTOADMIN));

        let res: Result<()> = async {
            let mut recd = prec.to_value();
            recd["id"] = Value::String(arkid.clone());
            let mut latest = ProjectRecord::from_value(&latest_coll, recd.clone(), AUTOADMIN)?;
            recd["id"] = Value::String(format!("{arkid}{}", version_ext(&version)));
            let mut verrec = ProjectRecord::from_value(&version_coll, recd, AUTOADMIN)?;

            for pubrec in [&mut latest, &mut verrec] {
                pubrec.status_mut().set_state(endstate, -1.0);

                // no one can delete, write, or admin (except superusers);
                // everyone can read
                pubrec.core.revoke_all_unchecked("delete", true);
                pubrec.core.revoke_all_unchecked("write", true);
                pubrec.core.revoke_all_unchecked("admin", false);
                pubrec.core.revoke_all_unchecked("read", false);
                pubrec.core.grant_unchecked("read", &[PUBLIC_GROUP]);
            }

            verrec.save(&versioncli).await?;
            latest.save(&latestcli).await?;
            Ok(())
        }
        .await;

        if let Err(e) = res {
            log::error!("{}: Problem with default publication submission: {e}", prec.id());
            return Err(DbioError::SubmissionFailed {
                id: prec.id().to_string(),
                message: e.to_string(),
            });
        }

        if endstate == ProjectState::Published {
            let archived_at = self.archived_at_for(&arkid);
            prec.status_mut().publish(&arkid, &version, &archived_at);
        }
        log::info!(
            "Successfully published {} as {arkid} version {version} (into {latest_coll} collection)",
            prec.id()
        );
        Ok(endstate)
    }

    // ------------------------------------------------------------------
    // external review
    // ------------------------------------------------------------------

    /// Register information from an external review system.  With
    /// `request_changes` and a submitted record, the record is returned
    /// to the authors for edits.  Returns the resulting state.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_external_review(
        &self,
        id: &str,
        revsys: &str,
        phase: &str,
        revid: Option<&str>,
        infourl: Option<&str>,
        feedback: Option<Vec<Value>>,
        request_changes: bool,
        fbreplace: bool,
        extras: BTreeMap<String, Value>,
    ) -> Result<ProjectState> {
        let _guard = self.locks.lock(id).await;
        let mut prec = self.dbcli.get_record_for(id, Permissions::PUBLISH).await?;

        let revmd = prec
            .status_mut()
            .pubreview(revsys, phase, revid, infourl, feedback, fbreplace, extras);
        if request_changes && prec.status().state == ProjectState::Submitted {
            prec.status_mut().set_state(ProjectState::Edit, -1.0);
        }
        prec.save(&self.dbcli).await?;

        let mut msg = "external review phase in progress".to_string();
        if !revmd.phase.is_empty() {
            msg.push_str(&format!(": {}", revmd.phase));
        }
        if !revmd.feedback.is_empty() {
            msg.push_str("; feedback provided");
        }
        self.record_action(Action::new(ActionType::Comment, id, &self.who, &msg)).await;
        log::info!("{id}: {msg}");

        Ok(prec.status().state)
    }

    /// Mark the project approved by an external review system and, by
    /// default, trigger publication.
    pub async fn approve(
        &self,
        id: &str,
        revsys: &str,
        revid: Option<&str>,
        infourl: Option<&str>,
        publish: bool,
    ) -> Result<ProjectState> {
        self.apply_external_review(
            id,
            revsys,
            "approved",
            revid,
            infourl,
            Some(Vec::new()),
            false,
            true,
            BTreeMap::new(),
        )
        .await?;
        if publish {
            return Ok(self.publish(id).await?.state);
        }
        self.get_status(id).await.map(|s| s.state)
    }

    /// Cancel the review process for one system, or all registered
    /// systems when none is named.
    pub async fn cancel_external_review(&self, id: &str, revsys: Option<&str>)
        -> Result<ProjectState>
    {
        let prec = self.dbcli.get_record_for(id, Permissions::PUBLISH).await?;
        let systems: Vec<String> = match revsys {
            Some(sys) => vec![sys.to_string()],
            None => prec.status().publish_review.keys().cloned().collect(),
        };
        let mut state = prec.status().state;
        for sys in systems {
            state = self
                .apply_external_review(
                    id,
                    &sys,
                    "canceled",
                    None,
                    None,
                    Some(Vec::new()),
                    false,
                    true,
                    BTreeMap::new(),
                )
                .await?;
        }
        Ok(state)
    }
}

/// Removes the value at a slash-delimited pointer; returns false if the
/// pointer does not resolve.
fn remove_part(data: &mut Map<String, Value>, part: &str) -> bool {
    let steps: Vec<&str> = part.split('/').collect();
    let mut cur = data;
    for (i, prop) in steps.iter().enumerate() {
        if i + 1 == steps.len() {
            return cur.remove(*prop).is_some();
        }
        cur = match cur.get_mut(*prop) {
            Some(Value::Object(sub)) => sub,
            _ => return false,
        };
    }
    false
}

/// Creates [`ProjectService`] instances bound to a backend and acting
/// for a particular agent.
pub struct ProjectServiceFactory {
    project_type: String,
    dbfactory: Arc<DbClientFactory>,
    cfg: ProjectServiceConfig,
    locks: Arc<RecordLocks>,
    validator: Arc<dyn DataValidator>,
}

impl ProjectServiceFactory {
    pub fn new(
        project_type: &str,
        dbfactory: Arc<DbClientFactory>,
        cfg: ProjectServiceConfig,
    ) -> ProjectServiceFactory {
        ProjectServiceFactory {
            project_type: project_type.to_string(),
            dbfactory,
            cfg,
            locks: Arc::new(RecordLocks::default()),
            validator: Arc::new(NoopValidator),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn DataValidator>) -> ProjectServiceFactory {
        self.validator = validator;
        self
    }

    pub fn project_type(&self) -> &str {
        &self.project_type
    }

    /// Create a service acting on behalf of the given agent.
    pub fn create_service_for(&self, who: &Agent) -> ProjectService {
        let dbcli = self.dbfactory.create_client_with(
            &self.project_type,
            self.cfg.dbio.clone(),
            who.id(),
        );
        ProjectService::new(
            dbcli,
            self.cfg.clone(),
            who.clone(),
            self.locks.clone(),
            self.validator.clone(),
        )
    }
}
