//! The in-memory DBIO driver, used primarily by tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use super::backend::{is_deactivated, matches_constraints, Constraint, DbBackend};
use super::{DbioError, Result};

/// Nested maps keyed by collection then record id, shared by every
/// client created from the same factory.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    colls: Arc<Mutex<HashMap<String, HashMap<String, Value>>>>,
    nextnum: Arc<Mutex<HashMap<String, u32>>>,
    actions: Arc<Mutex<HashMap<String, Vec<Value>>>>,
    history: Arc<Mutex<HashMap<String, Vec<Value>>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all state; intended for unit tests that share a factory.
    pub fn reset(&self) {
        self.colls.lock().unwrap().clear();
        self.nextnum.lock().unwrap().clear();
        self.actions.lock().unwrap().clear();
        self.history.lock().unwrap().clear();
    }

    /// The current top of a shoulder's sequence (0 if never minted).
    pub fn recnum_top(&self, shoulder: &str) -> u32 {
        self.nextnum.lock().unwrap().get(shoulder).copied().unwrap_or(0)
    }

    /// All history archives written for a record, oldest first.
    pub fn history_for(&self, recid: &str) -> Vec<Value> {
        self.history.lock().unwrap().get(recid).cloned().unwrap_or_default()
    }

    /// Peek at a stored document without going through a client.
    pub fn colls_get(&self, coll: &str, id: &str) -> Option<Value> {
        self.colls.lock().unwrap().get(coll).and_then(|c| c.get(id)).cloned()
    }
}

#[async_trait]
impl DbBackend for InMemoryBackend {
    async fn upsert(&self, coll: &str, id: &str, rec: Value) -> Result<bool> {
        let mut colls = self.colls.lock().unwrap();
        let coll = colls.entry(coll.to_string()).or_default();
        Ok(coll.insert(id.to_string(), rec).is_none())
    }

    async fn get(&self, coll: &str, id: &str) -> Result<Option<Value>> {
        let colls = self.colls.lock().unwrap();
        Ok(colls.get(coll).and_then(|c| c.get(id)).cloned())
    }

    async fn select(&self, coll: &str, incl_deact: bool, constraints: &[Constraint])
        -> Result<Vec<Value>>
    {
        let colls = self.colls.lock().unwrap();
        let Some(coll) = colls.get(coll) else {
            return Ok(Vec::new());
        };
        Ok(coll
            .values()
            .filter(|rec| incl_deact || !is_deactivated(rec))
            .filter(|rec| matches_constraints(rec, constraints))
            .cloned()
            .collect())
    }

    async fn select_prop_contains(&self, coll: &str, prop: &str, target: &str, incl_deact: bool)
        -> Result<Vec<Value>>
    {
        let colls = self.colls.lock().unwrap();
        let Some(coll) = colls.get(coll) else {
            return Ok(Vec::new());
        };
        Ok(coll
            .values()
            .filter(|rec| incl_deact || !is_deactivated(rec))
            .filter(|rec| {
                rec.get(prop)
                    .and_then(Value::as_array)
                    .is_some_and(|l| l.iter().any(|v| v.as_str() == Some(target)))
            })
            .cloned()
            .collect())
    }

    async fn delete(&self, coll: &str, id: &str) -> Result<bool> {
        let mut colls = self.colls.lock().unwrap();
        Ok(colls.get_mut(coll).map(|c| c.remove(id).is_some()).unwrap_or(false))
    }

    async fn next_recnum(&self, shoulder: &str) -> Result<u32> {
        let mut nums = self.nextnum.lock().unwrap();
        let num = nums.entry(shoulder.to_string()).or_insert(0);
        *num += 1;
        Ok(*num)
    }

    async fn try_push_recnum(&self, shoulder: &str, recnum: u32) -> Result<()> {
        let mut nums = self.nextnum.lock().unwrap();
        if let Some(num) = nums.get_mut(shoulder) {
            if *num == recnum {
                *num -= 1;
            }
        }
        Ok(())
    }

    async fn save_action(&self, subject: &str, act: Value) -> Result<()> {
        if subject.is_empty() {
            return Err(DbioError::backend("save_action: missing subject id"));
        }
        let mut actions = self.actions.lock().unwrap();
        actions.entry(subject.to_string()).or_default().push(act);
        Ok(())
    }

    async fn select_actions_for(&self, id: &str) -> Result<Vec<Value>> {
        let actions = self.actions.lock().unwrap();
        Ok(actions.get(id).cloned().unwrap_or_default())
    }

    async fn delete_actions_for(&self, id: &str) -> Result<()> {
        self.actions.lock().unwrap().remove(id);
        Ok(())
    }

    async fn save_history(&self, recid: &str, hist: Value) -> Result<()> {
        let mut history = self.history.lock().unwrap();
        history.entry(recid.to_string()).or_default().push(hist);
        Ok(())
    }

    fn supports_advanced_queries(&self) -> bool {
        true
    }
}
