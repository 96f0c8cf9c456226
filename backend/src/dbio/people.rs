//! The staff-directory lookup used for user validation and virtual
//! groups.
//!
//! The directory service itself is an external collaborator; only the
//! lookup contract is defined here, together with a map-backed
//! implementation for wiring and tests.

use std::collections::HashMap;

use serde_json::Value;

/// Lookup of people by their enterprise id.
pub trait PeopleService: Send + Sync {
    /// Return the directory entry for the given id, if known.
    fn get_person_by_eid(&self, eid: &str) -> Option<Value>;
}

/// The organizational-unit properties that map onto virtual groups.
const VIRTUAL_GROUP_PROPS: [&str; 3] = ["ou", "div", "grp"];

/// Derive the virtual-group ids a directory entry confers.
pub fn virtual_groups_for(person: &Value) -> Vec<String> {
    let mut out = Vec::new();
    for prop in VIRTUAL_GROUP_PROPS {
        if let Some(val) = person.get(prop).and_then(Value::as_str) {
            if !val.is_empty() {
                out.push(format!("{prop}:{val}"));
            }
        }
    }
    out
}

/// A directory held in memory, for tests and single-node deployments.
#[derive(Default)]
pub struct MapPeopleService {
    people: HashMap<String, Value>,
}

impl MapPeopleService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_person(&mut self, eid: &str, entry: Value) {
        self.people.insert(eid.to_string(), entry);
    }
}

impl PeopleService for MapPeopleService {
    fn get_person_by_eid(&self, eid: &str) -> Option<Value> {
        self.people.get(eid).cloned()
    }
}
