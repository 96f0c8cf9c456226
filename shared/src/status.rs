//! Status bookkeeping embedded in every record: the lifecycle state, the
//! last action applied, and the timestamps tying them together.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::prov::{isodate, now, Timestamp};

/// A distinct stage in a record's evolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProjectState {
    #[default]
    #[serde(rename = "edit")]
    Edit,
    #[serde(rename = "processing")]
    Processing,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "submitted")]
    Submitted,
    #[serde(rename = "accepted")]
    Accepted,
    #[serde(rename = "in press")]
    InPress,
    #[serde(rename = "published")]
    Published,
    #[serde(rename = "unwell")]
    Unwell,
}

impl ProjectState {
    pub fn label(self) -> &'static str {
        match self {
            ProjectState::Edit => "edit",
            ProjectState::Processing => "processing",
            ProjectState::Ready => "ready",
            ProjectState::Submitted => "submitted",
            ProjectState::Accepted => "accepted",
            ProjectState::InPress => "in press",
            ProjectState::Published => "published",
            ProjectState::Unwell => "unwell",
        }
    }

    /// States in which a user may change the record's data.
    pub fn is_editable(self) -> bool {
        matches!(self, ProjectState::Edit | ProjectState::Ready)
    }
}

// Common record actions.
pub const ACTION_CREATE: &str = "create";
pub const ACTION_UPDATE: &str = "update";
pub const ACTION_CLEAR: &str = "clear";
pub const ACTION_FINALIZE: &str = "finalize";
pub const ACTION_SUBMIT: &str = "submit";
pub const ACTION_PUBLISH: &str = "publish";
pub const ACTION_UPDATE_PREP: &str = "update-prep";
pub const ACTION_RESTORE: &str = "restore";

/// The registration one external review system holds against a record.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReviewInfo {
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feedback: Vec<Value>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, Value>,
}

/// The status sub-record of a project or group record.
///
/// Timestamps are epoch seconds; zero means "pending" (to be stamped at
/// save time) and renders as the literal string `"pending"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordStatus {
    #[serde(default)]
    pub state: ProjectState,
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default)]
    pub since: Timestamp,
    #[serde(default)]
    pub modified: Timestamp,
    #[serde(default)]
    pub created: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_as: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<String>,
    #[serde(rename = "publishReview", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub publish_review: BTreeMap<String, ReviewInfo>,
}

fn default_action() -> String {
    ACTION_CREATE.to_string()
}

impl Default for RecordStatus {
    fn default() -> Self {
        RecordStatus {
            state: ProjectState::Edit,
            action: default_action(),
            since: 0.0,
            modified: 0.0,
            created: 0.0,
            created_by: None,
            message: String::new(),
            published_as: None,
            published_version: None,
            archived_at: None,
            publish_review: BTreeMap::new(),
        }
    }
}

impl RecordStatus {
    /// Fill in defaults on freshly loaded data: negative timestamps mean
    /// "now", and `since` tracks `modified` where unset.
    pub fn normalize(&mut self) {
        if self.since == 0.0 && self.modified > 0.0 {
            self.since = self.modified;
        }
        if self.since < 0.0 {
            self.since = now();
        }
        if self.modified < 0.0 {
            self.modified = now();
        }
        if self.created < 0.0 {
            self.created = now();
        }
    }

    /// Record that `action` was applied.  `when` semantics: negative
    /// means now; zero means "stamp at save time"; positive is taken as
    /// the actual time.
    pub fn act(&mut self, action: &str, message: &str, when: Timestamp) {
        let when = if when < 0.0 { now() } else { when };
        self.action = action.to_string();
        self.message = message.to_string();
        self.modified = when;
    }

    /// Record entry into a new state; `when` as for [`act`](Self::act).
    pub fn set_state(&mut self, state: ProjectState, when: Timestamp) {
        let when = if when < 0.0 { now() } else { when };
        self.state = state;
        self.since = when;
    }

    /// Stamp any pending timestamps with the current time.  Returns the
    /// previous `(created, modified, since)` triple so a failed save can
    /// roll them back.
    pub fn set_times(&mut self) -> (Timestamp, Timestamp, Timestamp) {
        let old = (self.created, self.modified, self.since);
        let stamp = now();
        if self.created <= 0.0 {
            self.created = stamp;
        }
        if self.modified <= 0.0 {
            self.modified = stamp;
        }
        if self.since <= 0.0 {
            self.since = self.modified;
        }
        old
    }

    pub fn restore_times(&mut self, old: (Timestamp, Timestamp, Timestamp)) {
        (self.created, self.modified, self.since) = old;
    }

    pub fn created_date(&self) -> String {
        isodate(self.created)
    }

    pub fn modified_date(&self) -> String {
        isodate(self.modified)
    }

    pub fn since_date(&self) -> String {
        isodate(self.since)
    }

    /// Register (or update) the review sub-record for an external review
    /// system and return the resulting registration.
    #[allow(clippy::too_many_arguments)]
    pub fn pubreview(
        &mut self,
        system: &str,
        phase: &str,
        review_id: Option<&str>,
        info_url: Option<&str>,
        feedback: Option<Vec<Value>>,
        replace: bool,
        extras: BTreeMap<String, Value>,
    ) -> ReviewInfo {
        let entry = self.publish_review.entry(system.to_string()).or_default();
        entry.phase = phase.to_string();
        if let Some(id) = review_id {
            entry.id = Some(id.to_string());
        }
        if let Some(url) = info_url {
            entry.url = Some(url.to_string());
        }
        if let Some(fb) = feedback {
            if replace {
                entry.feedback = fb;
            } else {
                entry.feedback.extend(fb);
            }
        }
        entry.extras.extend(extras);
        entry.clone()
    }

    pub fn get_review_from(&self, system: &str) -> Option<&ReviewInfo> {
        self.publish_review.get(system)
    }

    /// Record a successful publication of this record.
    pub fn publish(&mut self, published_as: &str, version: &str, archived_at: &str) {
        self.published_as = Some(published_as.to_string());
        self.published_version = Some(version.to_string());
        self.archived_at = Some(archived_at.to_string());
    }

    /// Export for API responses: the raw data plus the formatted dates
    /// and the record id under `@id`.
    pub fn export(&self, id: &str) -> Value {
        let mut out = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(obj) = out.as_object_mut() {
            obj.insert("@id".to_string(), Value::String(id.to_string()));
            obj.insert("createdDate".to_string(), Value::String(self.created_date()));
            obj.insert("modifiedDate".to_string(), Value::String(self.modified_date()));
            obj.insert("sinceDate".to_string(), Value::String(self.since_date()));
        }
        out
    }
}
