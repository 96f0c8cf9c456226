//! The production DBIO driver backed by an ArangoDB document database.
//!
//! Record replacement uses AQL `UPSERT` and sequence minting an atomic
//! upsert against the `nextnum` collection keyed by `{slot: shoulder}`.
//! ArangoDB's UPSERT is a read-then-write, so concurrent writers on the
//! same key can produce a write-write conflict (error 1200); both
//! writers carry the same intent, so those are retried with a short
//! backoff instead of surfacing to the caller.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use arangors::client::reqwest::ReqwestClient;
use arangors::database::Database;
use arangors::Connection;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::backend::{Constraint, DbBackend};
use super::{DbioError, Result, NEXTNUM_COLL};

const UPSERT_RETRIES: u32 = 4;

pub struct ArangoBackend {
    db: Database<ReqwestClient>,
    ensured: Mutex<HashSet<String>>,
}

impl ArangoBackend {
    /// Connect with basic auth and obtain the database handle, creating
    /// the database if it does not exist yet.
    pub async fn connect_basic(url: &str, user: &str, pass: &str, db_name: &str)
        -> Result<ArangoBackend>
    {
        let conn = Connection::establish_basic_auth(url, user, pass)
            .await
            .map_err(DbioError::backend)?;
        let db = match conn.db(db_name).await {
            Ok(db) => db,
            Err(_) => {
                conn.create_database(db_name).await.map_err(DbioError::backend)?;
                conn.db(db_name).await.map_err(DbioError::backend)?
            }
        };
        Ok(ArangoBackend { db, ensured: Mutex::new(HashSet::new()) })
    }

    async fn ensure_collection(&self, name: &str) -> Result<()> {
        {
            let ensured = self.ensured.lock().unwrap();
            if ensured.contains(name) {
                return Ok(());
            }
        }
        if self.db.collection(name).await.is_err() {
            self.db
                .create_collection(name)
                .await
                .map_err(|e| DbioError::backend(format!("{name}: cannot create collection: {e}")))?;
        }
        self.ensured.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn aql<R: DeserializeOwned>(&self, query: &str, vars: HashMap<&str, Value>)
        -> Result<Vec<R>>
    {
        self.db
            .aql_bind_vars(query, vars)
            .await
            .map_err(|e| DbioError::backend(e.to_string()))
    }

    /// Run an UPSERT-bearing query, retrying benign write-write
    /// conflicts (error 1200).
    async fn aql_upsert(&self, query: &str, vars: HashMap<&str, Value>) -> Result<Vec<Value>> {
        let mut delay = Duration::from_millis(25);
        let mut last = None;
        for _ in 0..UPSERT_RETRIES {
            match self.aql::<Value>(query, vars.clone()).await {
                Ok(out) => return Ok(out),
                Err(e) if e.to_string().contains("1200") => {
                    last = Some(e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| DbioError::backend("upsert retries exhausted")))
    }

    fn strip(doc: Value) -> Value {
        match doc {
            Value::Object(mut obj) => {
                obj.remove("_key");
                obj.remove("_id");
                obj.remove("_rev");
                Value::Object(obj)
            }
            other => other,
        }
    }
}

#[async_trait]
impl DbBackend for ArangoBackend {
    async fn upsert(&self, coll: &str, id: &str, rec: Value) -> Result<bool> {
        self.ensure_collection(coll).await?;
        let query = r#"
            UPSERT { id: @id }
            INSERT @rec
            REPLACE @rec
            IN @@coll
            RETURN OLD == null
        "#;
        let vars = HashMap::from([
            ("@coll", Value::String(coll.to_string())),
            ("id", Value::String(id.to_string())),
            ("rec", rec),
        ]);
        let created: Vec<Value> = self.aql_upsert(query, vars).await?;
        Ok(created.first().and_then(Value::as_bool).unwrap_or(false))
    }

    async fn get(&self, coll: &str, id: &str) -> Result<Option<Value>> {
        self.ensure_collection(coll).await?;
        let query = r#"
            FOR doc IN @@coll
                FILTER doc.id == @id
                LIMIT 1
                RETURN doc
        "#;
        let vars = HashMap::from([
            ("@coll", Value::String(coll.to_string())),
            ("id", Value::String(id.to_string())),
        ]);
        let mut found: Vec<Value> = self.aql(query, vars).await?;
        Ok(found.pop().map(Self::strip))
    }

    async fn select(&self, coll: &str, incl_deact: bool, constraints: &[Constraint])
        -> Result<Vec<Value>>
    {
        self.ensure_collection(coll).await?;
        let mut query = String::from("FOR doc IN @@coll\n");
        if !incl_deact {
            query.push_str("    FILTER doc.deactivated == null\n");
        }
        // attribute names are bound, not spliced, to keep the query safe
        let mut keys: Vec<(String, Value)> =
            vec![("@coll".to_string(), Value::String(coll.to_string()))];
        for (i, (prop, val)) in constraints.iter().enumerate() {
            query.push_str(&format!("    FILTER doc[@p{i}] == @v{i}\n"));
            keys.push((format!("p{i}"), Value::String(prop.clone())));
            keys.push((format!("v{i}"), val.clone()));
        }
        query.push_str("    RETURN doc");
        let vars: HashMap<&str, Value> =
            keys.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
        let found: Vec<Value> = self.aql(&query, vars).await?;
        Ok(found.into_iter().map(Self::strip).collect())
    }

    async fn select_prop_contains(&self, coll: &str, prop: &str, target: &str, incl_deact: bool)
        -> Result<Vec<Value>>
    {
        self.ensure_collection(coll).await?;
        let mut query = String::from("FOR doc IN @@coll\n");
        if !incl_deact {
            query.push_str("    FILTER doc.deactivated == null\n");
        }
        query.push_str("    FILTER IS_LIST(doc[@prop]) AND @target IN doc[@prop]\n");
        query.push_str("    RETURN doc");
        let vars = HashMap::from([
            ("@coll", Value::String(coll.to_string())),
            ("prop", Value::String(prop.to_string())),
            ("target", Value::String(target.to_string())),
        ]);
        let found: Vec<Value> = self.aql(&query, vars).await?;
        Ok(found.into_iter().map(Self::strip).collect())
    }

    async fn delete(&self, coll: &str, id: &str) -> Result<bool> {
        self.ensure_collection(coll).await?;
        let query = r#"
            FOR doc IN @@coll
                FILTER doc.id == @id
                REMOVE doc IN @@coll
                RETURN 1
        "#;
        let vars = HashMap::from([
            ("@coll", Value::String(coll.to_string())),
            ("id", Value::String(id.to_string())),
        ]);
        let removed: Vec<Value> = self.aql(query, vars).await?;
        Ok(!removed.is_empty())
    }

    async fn next_recnum(&self, shoulder: &str) -> Result<u32> {
        self.ensure_collection(NEXTNUM_COLL).await?;
        let query = r#"
            UPSERT { slot: @slot }
            INSERT { slot: @slot, next: 1 }
            UPDATE { next: OLD.next + 1 }
            IN nextnum
            RETURN NEW.next
        "#;
        let vars = HashMap::from([("slot", Value::String(shoulder.to_string()))]);
        let next = self.aql_upsert(query, vars).await?;
        next.first()
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .ok_or_else(|| DbioError::backend(format!("{shoulder}: failed to mint record number")))
    }

    async fn try_push_recnum(&self, shoulder: &str, recnum: u32) -> Result<()> {
        self.ensure_collection(NEXTNUM_COLL).await?;
        let query = r#"
            FOR doc IN nextnum
                FILTER doc.slot == @slot AND doc.next == @num
                UPDATE doc WITH { next: doc.next - 1 } IN nextnum
        "#;
        let vars = HashMap::from([
            ("slot", Value::String(shoulder.to_string())),
            ("num", json!(recnum)),
        ]);
        // sequence recovery is best-effort
        let _: Vec<Value> = self.aql(query, vars).await.unwrap_or_default();
        Ok(())
    }

    async fn save_action(&self, subject: &str, mut act: Value) -> Result<()> {
        if subject.is_empty() {
            return Err(DbioError::backend("save_action: missing subject id"));
        }
        self.ensure_collection(super::PROV_ACT_LOG).await?;
        if let Some(obj) = act.as_object_mut() {
            obj.entry("subject").or_insert_with(|| Value::String(subject.to_string()));
        }
        let query = "INSERT @doc IN @@coll";
        let vars = HashMap::from([
            ("@coll", Value::String(super::PROV_ACT_LOG.to_string())),
            ("doc", act),
        ]);
        let _: Vec<Value> = self.aql(query, vars).await?;
        Ok(())
    }

    async fn select_actions_for(&self, id: &str) -> Result<Vec<Value>> {
        self.ensure_collection(super::PROV_ACT_LOG).await?;
        // the action timestamp preserves append order within a subject
        let query = r#"
            FOR doc IN @@coll
                FILTER doc.subject == @id
                SORT doc.timestamp ASC
                RETURN doc
        "#;
        let vars = HashMap::from([
            ("@coll", Value::String(super::PROV_ACT_LOG.to_string())),
            ("id", Value::String(id.to_string())),
        ]);
        let found: Vec<Value> = self.aql(query, vars).await?;
        Ok(found.into_iter().map(Self::strip).collect())
    }

    async fn delete_actions_for(&self, id: &str) -> Result<()> {
        self.ensure_collection(super::PROV_ACT_LOG).await?;
        let query = r#"
            FOR doc IN @@coll
                FILTER doc.subject == @id
                REMOVE doc IN @@coll
        "#;
        let vars = HashMap::from([
            ("@coll", Value::String(super::PROV_ACT_LOG.to_string())),
            ("id", Value::String(id.to_string())),
        ]);
        let _: Vec<Value> = self.aql(query, vars).await?;
        Ok(())
    }

    async fn save_history(&self, recid: &str, mut hist: Value) -> Result<()> {
        self.ensure_collection(super::HISTORY_COLL).await?;
        if let Some(obj) = hist.as_object_mut() {
            obj.entry("recid").or_insert_with(|| Value::String(recid.to_string()));
        }
        let query = "INSERT @doc IN @@coll";
        let vars = HashMap::from([
            ("@coll", Value::String(super::HISTORY_COLL.to_string())),
            ("doc", hist),
        ]);
        let _: Vec<Value> = self.aql(query, vars).await?;
        Ok(())
    }

    fn supports_advanced_queries(&self) -> bool {
        true
    }
}
