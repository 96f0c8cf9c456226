//! Provenance records: who did what to a record, and when.
//!
//! An [`Action`] captures one change applied to a record (or a part of
//! one).  Actions form a tree: a compound operation records its steps as
//! subactions.  The [`Agent`] identifies the actor as seen through a
//! particular client vehicle.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{ANONYMOUS, PUBLIC_GROUP};

/// Epoch timestamp in seconds.  Zero means "not set".
pub type Timestamp = f64;

/// Current time as an epoch timestamp.
pub fn now() -> Timestamp {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Render an epoch timestamp as a local-free ISO string, or "pending"
/// when the timestamp has not been set yet.
pub fn isodate(ts: Timestamp) -> String {
    if ts <= 0.0 {
        return "pending".to_string();
    }
    match DateTime::<Utc>::from_timestamp(ts.floor() as i64, 0) {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
        None => "pending".to_string(),
    }
}

/// Broad trust classification of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentClass {
    #[default]
    Public,
    Admin,
    Invalid,
}

/// The actor behind a request: the identity plus the vehicle (client
/// application) it arrived through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Name of the client application the actor is operating through.
    pub vehicle: String,
    /// The user (or system) identity.
    pub actor: String,
    #[serde(default)]
    pub class: AgentClass,
    /// Groups this actor claims membership of.
    #[serde(default)]
    pub groups: BTreeSet<String>,
    /// Upstream agents this request was delegated through, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delegation: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub props: BTreeMap<String, Value>,
}

impl Agent {
    pub fn new(vehicle: &str, actor: &str, class: AgentClass) -> Self {
        let mut groups = BTreeSet::new();
        groups.insert(PUBLIC_GROUP.to_string());
        Agent {
            vehicle: vehicle.to_string(),
            actor: actor.to_string(),
            class,
            groups,
            delegation: Vec::new(),
            props: BTreeMap::new(),
        }
    }

    /// The agent standing in for unauthenticated requests.
    pub fn anonymous(vehicle: &str) -> Self {
        Agent::new(vehicle, ANONYMOUS, AgentClass::Invalid)
    }

    /// Record that `upstream` handed this request to the current vehicle.
    pub fn delegated_from(mut self, upstream: &str) -> Self {
        self.delegation.push(upstream.to_string());
        self
    }

    /// The actor identifier; this is the id used in ACLs.
    pub fn id(&self) -> &str {
        &self.actor
    }
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.actor, self.vehicle)
    }
}

/// The kind of change an [`Action`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionType {
    Create,
    Put,
    Patch,
    Move,
    Delete,
    Process,
    Comment,
}

/// One provenance record.  Serializes to the JSON shape stored in the
/// action-log collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub acttype: ActionType,
    /// Identifier of the record (or record part) acted on.
    pub subject: String,
    pub agent: Agent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// What was applied: arbitrary JSON, often a JSON-Patch document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    #[serde(default, skip_serializing_if = "ts_unset")]
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subactions: Vec<Action>,
}

fn ts_unset(ts: &Timestamp) -> bool {
    *ts <= 0.0
}

impl Action {
    /// Create an action stamped with the current time.
    pub fn new(acttype: ActionType, subject: &str, agent: &Agent, message: &str) -> Self {
        let ts = now();
        Action {
            acttype,
            subject: subject.to_string(),
            agent: agent.clone(),
            message: if message.is_empty() { None } else { Some(message.to_string()) },
            object: None,
            timestamp: ts,
            date: Some(isodate(ts)),
            subactions: Vec::new(),
        }
    }

    pub fn with_object(mut self, obj: Value) -> Self {
        self.object = Some(obj);
        self
    }

    pub fn set_message(&mut self, msg: &str) {
        self.message = Some(msg.to_string());
    }

    /// Append a subaction; subaction order doubles as occurrence order.
    pub fn add_subaction(&mut self, act: Action) {
        self.subactions.push(act);
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A convenience for PROCESS actions, which carry a required operation
/// name in their object.
pub fn process_object(name: &str, errors: Option<&[String]>) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("name".to_string(), Value::String(name.to_string()));
    if let Some(errs) = errors {
        obj.insert(
            "errors".to_string(),
            Value::Array(errs.iter().map(|e| Value::String(e.clone())).collect()),
        );
    }
    Value::Object(obj)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_isodate_pending() {
        assert_eq!(isodate(0.0), "pending");
        assert_eq!(isodate(-3.0), "pending");
        assert!(isodate(1_700_000_000.0).starts_with("2023-11-14T"));
    }

    #[test]
    fn test_agent_defaults() {
        let who = Agent::new("midas", "u1", AgentClass::Public);
        assert!(who.groups.contains(PUBLIC_GROUP));
        assert_eq!(who.to_string(), "u1@midas");

        let anon = Agent::anonymous("midas");
        assert_eq!(anon.actor, ANONYMOUS);
        assert_eq!(anon.class, AgentClass::Invalid);
    }

    #[test]
    fn test_action_tree_serializes() {
        let who = Agent::new("midas", "u1", AgentClass::Public);
        let mut act = Action::new(ActionType::Patch, "mdm1:0001", &who, "updated");
        act.add_subaction(
            Action::new(ActionType::Patch, "mdm1:0001#data.a", &who, "updating data.a")
                .with_object(serde_json::json!([{"op": "replace", "path": "/a", "value": 1}])),
        );

        let val = act.to_value();
        assert_eq!(val["type"], "PATCH");
        assert_eq!(val["subactions"][0]["subject"], "mdm1:0001#data.a");
        assert!(val["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_process_object_shape() {
        let obj = process_object("finalize", Some(&["bad title".to_string()]));
        assert_eq!(obj["name"], "finalize");
        assert_eq!(obj["errors"][0], "bad title");
        assert!(process_object("submit", None).get("errors").is_none());
    }
}
