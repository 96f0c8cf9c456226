//! The storage contract every DBIO driver implements.
//!
//! These are the leaf operations; everything richer (authorization,
//! minting policy, provenance bookkeeping) lives in
//! [`client::DbClient`](super::client::DbClient) on top of them.

use async_trait::async_trait;
use serde_json::Value;

use super::Result;

/// One property constraint on a record selection: the record's property
/// must equal the value.
pub type Constraint = (String, Value);

/// A storage driver for the DBIO collections.
///
/// Record documents are JSON objects carrying at least an `id` property.
/// Drivers must treat `upsert` as a whole-document replace and implement
/// `next_recnum` atomically per shoulder.
#[async_trait]
pub trait DbBackend: Send + Sync {
    /// Insert or replace the record in the collection.  Returns true if
    /// the record was added for the first time.
    async fn upsert(&self, coll: &str, id: &str, rec: Value) -> Result<bool>;

    /// Fetch one record by id, deactivated or not.
    async fn get(&self, coll: &str, id: &str) -> Result<Option<Value>>;

    /// Return the records matching all given property constraints.
    /// Deactivated records are skipped unless `incl_deact`.
    async fn select(&self, coll: &str, incl_deact: bool, constraints: &[Constraint])
        -> Result<Vec<Value>>;

    /// Return the records whose list-valued property `prop` contains
    /// `target`.
    async fn select_prop_contains(&self, coll: &str, prop: &str, target: &str, incl_deact: bool)
        -> Result<Vec<Value>>;

    /// Remove a record; returns true if it existed.
    async fn delete(&self, coll: &str, id: &str) -> Result<bool>;

    /// Atomically claim the next number in the shoulder's sequence.
    async fn next_recnum(&self, shoulder: &str) -> Result<u32>;

    /// Return `recnum` to the shoulder's sequence iff it is still the
    /// most recently minted number.  Recovers numbers for records that
    /// are deleted immediately after creation.
    async fn try_push_recnum(&self, shoulder: &str, recnum: u32) -> Result<()>;

    /// Append a provenance action for its subject record.  Appends are
    /// order-preserving within a subject.
    async fn save_action(&self, subject: &str, act: Value) -> Result<()>;

    /// All actions currently logged for the subject, oldest first.
    async fn select_actions_for(&self, id: &str) -> Result<Vec<Value>>;

    /// Purge the action log for the subject.
    async fn delete_actions_for(&self, id: &str) -> Result<()>;

    /// Append an archive document to the subject's history.
    async fn save_history(&self, recid: &str, hist: Value) -> Result<()>;

    /// Whether this driver can serve `$and`/`$or` advanced queries.
    fn supports_advanced_queries(&self) -> bool {
        false
    }
}

/// True if the record document should be hidden from default selection.
pub fn is_deactivated(rec: &Value) -> bool {
    match rec.get("deactivated") {
        None | Some(Value::Null) => false,
        Some(_) => true,
    }
}

/// Evaluate an equality constraint against a record document.
pub fn matches_constraints(rec: &Value, constraints: &[Constraint]) -> bool {
    constraints.iter().all(|(prop, want)| rec.get(prop) == Some(want))
}
