//! DBClient behavior over the in-memory driver.

use std::collections::HashMap;

use serde_json::{json, Value};

use midas_shared::models::Permissions;
use midas_shared::prov::{Action, ActionType};
use midas_shared::status::ProjectState;

use crate::dbio::DbioError;

use super::{agent, inmem_factory};

#[tokio::test]
async fn test_create_and_round_trip() {
    let (_backend, factory) = inmem_factory();
    let cli = factory.create_client("dmp", "u1");

    let rec = cli.create_record("Alpha", None, None, None).await.unwrap();
    assert_eq!(rec.id(), "mdm1:0001");
    assert_eq!(rec.owner(), "u1");
    assert_eq!(rec.status().state, ProjectState::Edit);
    assert!(rec.status().created > 0.0);

    // save() then get_record_for() round-trips the serialized form
    let fetched = cli.get_record_for("mdm1:0001", Permissions::READ).await.unwrap();
    assert_eq!(fetched.to_value(), rec.to_value());
}

#[tokio::test]
async fn test_duplicate_name_rejected_and_sequence_unchanged() {
    let (backend, factory) = inmem_factory();
    let cli = factory.create_client("dmp", "u1");

    cli.create_record("Alpha", None, None, None).await.unwrap();
    assert_eq!(backend.recnum_top("mdm1"), 1);

    let err = cli.create_record("Alpha", None, None, None).await.unwrap_err();
    assert!(matches!(err, DbioError::AlreadyExists(_)));
    // the failed attempt did not consume a number
    assert_eq!(backend.recnum_top("mdm1"), 1);

    // a different owner may reuse the name
    let cli2 = factory.create_client("dmp", "u2");
    let rec = cli2.create_record("Alpha", None, None, None).await.unwrap();
    assert_eq!(rec.id(), "mdm1:0002");
}

#[tokio::test]
async fn test_delete_returns_sequence_number() {
    let (backend, factory) = inmem_factory();
    let cli = factory.create_client("dmp", "u1");

    cli.create_record("Alpha", None, None, None).await.unwrap();
    assert!(cli.exists("mdm1:0001").await.unwrap());

    assert!(cli.delete_record("mdm1:0001").await.unwrap());
    assert!(!cli.exists("mdm1:0001").await.unwrap());
    assert_eq!(backend.recnum_top("mdm1"), 0);

    // the next record gets the recovered number
    let rec = cli.create_record("Beta", None, None, None).await.unwrap();
    assert_eq!(rec.id(), "mdm1:0001");
}

#[tokio::test]
async fn test_shoulder_authorization() {
    let (_backend, factory) = inmem_factory();
    let cli = factory.create_client("dmp", "u1");

    let err = cli.create_record("Alpha", Some("secret"), None, None).await.unwrap_err();
    assert!(matches!(err, DbioError::NotAuthorized { .. }));

    // only a superuser can create a record for someone else
    let err = cli.create_record("Alpha", None, None, Some("u2")).await.unwrap_err();
    assert!(matches!(err, DbioError::NotAuthorized { .. }));

    let root = factory.create_client("dmp", "rlp");
    let rec = root.create_record("Alpha", None, None, Some("u2")).await.unwrap();
    assert_eq!(rec.owner(), "u2");
}

#[tokio::test]
async fn test_authorized_through_groups() {
    let (_backend, factory) = inmem_factory();
    let owner = factory.create_client("dmp", "u1");
    let rec = owner.create_record("Alpha", None, None, None).await.unwrap();

    // u2 has no grant at all
    let reader = factory.create_client("dmp", "u2");
    let err = reader.get_record_for(rec.id(), Permissions::READ).await.unwrap_err();
    assert!(matches!(err, DbioError::NotAuthorized { .. }));

    // grant read to a group u2 belongs to
    let grp = owner.groups().create_group("reviewers", None).await.unwrap();
    let mut grp = grp;
    grp.add_member(&owner, &["u2"]).await.unwrap();
    grp.save(&owner).await.unwrap();
    owner.recache_user_groups().await.unwrap();

    let mut rec = owner.get_record_for(rec.id(), Permissions::ADMIN).await.unwrap();
    rec.core.grant_perm_to(&owner, "read", &[grp.id()]).await.unwrap();
    rec.save(&owner).await.unwrap();

    reader.recache_user_groups().await.unwrap();
    let fetched = reader.get_record_for(rec.id(), Permissions::READ).await.unwrap();
    assert_eq!(fetched.id(), rec.id());
    // read does not confer write
    let err = reader.get_record_for(rec.id(), Permissions::WRITE).await.unwrap_err();
    assert!(matches!(err, DbioError::NotAuthorized { .. }));

    // superusers pass unconditionally
    let root = factory.create_client("dmp", "rlp");
    assert!(root.get_record_for(rec.id(), Permissions::OWN).await.is_ok());
}

#[tokio::test]
async fn test_select_records_constraints() {
    let (_backend, factory) = inmem_factory();
    let cli = factory.create_client("dmp", "u1");
    cli.create_record("Alpha", None, None, None).await.unwrap();
    cli.create_record("Beta", None, None, None).await.unwrap();

    let other = factory.create_client("dmp", "u2");
    other.create_record("Gamma", None, None, None).await.unwrap();

    let all = cli.select_records(Permissions::OWN, &HashMap::new()).await.unwrap();
    assert_eq!(all.len(), 2);

    // OR within a constraint
    let mut cst = HashMap::new();
    cst.insert(
        "name".to_string(),
        vec![Value::String("Alpha".into()), Value::String("Gamma".into())],
    );
    let hits = cli.select_records(Permissions::OWN, &cst).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name(), "Alpha");

    // AND across constraints
    cst.insert("owner".to_string(), vec![Value::String("u2".into())]);
    assert!(cli.select_records(Permissions::OWN, &cst).await.unwrap().is_empty());

    let mut cst = HashMap::new();
    cst.insert("status_state".to_string(), vec![Value::String("edit".into())]);
    assert_eq!(cli.select_records(Permissions::OWN, &cst).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_adv_select_records() {
    let (_backend, factory) = inmem_factory();
    let cli = factory.create_client("dmp", "u1");
    cli.create_record("Alpha", None, None, None).await.unwrap();
    cli.create_record("Beta", None, None, None).await.unwrap();

    let filter = json!({"$and": [
        {"owner": "u1"},
        {"$or": [{"name": "Alpha"}, {"name": "Gamma"}]}
    ]});
    let hits = cli.adv_select_records(&filter, Permissions::OWN).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name(), "Alpha");

    let err = cli
        .adv_select_records(&json!({"name": "Alpha"}), Permissions::OWN)
        .await
        .unwrap_err();
    assert!(matches!(err, DbioError::InvalidQuery(_)));
}

#[tokio::test]
async fn test_deactivated_records_hidden_from_selection() {
    let (_backend, factory) = inmem_factory();
    let cli = factory.create_client("dmp", "u1");
    let mut rec = cli.create_record("Alpha", None, None, None).await.unwrap();

    rec.core.deactivate();
    rec.save(&cli).await.unwrap();

    assert!(cli.select_records(Permissions::OWN, &HashMap::new()).await.unwrap().is_empty());
    // still retrievable by id
    assert!(cli.get_record_for("mdm1:0001", Permissions::READ).await.is_ok());
}

#[tokio::test]
async fn test_record_action_and_close_log() {
    let (backend, factory) = inmem_factory();
    let cli = factory.create_client("dmp", "u1");
    let rec = cli.create_record("Alpha", None, None, None).await.unwrap();
    let who = agent("u1");

    cli.record_action(&Action::new(ActionType::Patch, rec.id(), &who, "tweak"), None)
        .await
        .unwrap();
    let acts = cli.actions_for(rec.id()).await.unwrap();
    assert_eq!(acts.len(), 1);
    assert_eq!(acts[0]["type"], "PATCH");

    // subject must exist
    let err = cli
        .record_action(&Action::new(ActionType::Patch, "mdm1:9999", &who, "x"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DbioError::NotFound { .. }));

    // closing the log moves the entries into a history archive
    let close = Action::new(ActionType::Process, rec.id(), &who, "published")
        .with_object(midas_shared::prov::process_object("publish", None));
    cli.close_actionlog_with(&rec, close, None, false).await.unwrap();

    assert!(cli.actions_for(rec.id()).await.unwrap().is_empty());
    let hist = backend.history_for(rec.id());
    assert_eq!(hist.len(), 1);
    assert_eq!(hist[0]["recid"], rec.id());
    assert_eq!(hist[0]["close_action"], "PROCESS:publish");
    assert_eq!(hist[0]["history"].as_array().unwrap().len(), 2);
    // the archive inherits only the read ACL
    assert_eq!(hist[0]["acls"]["read"], json!(["u1"]));
    assert!(hist[0]["acls"].get("write").is_none());
}

#[tokio::test]
async fn test_close_actionlog_skips_empty() {
    let (backend, factory) = inmem_factory();
    let cli = factory.create_client("dmp", "u1");
    let rec = cli.create_record("Alpha", None, None, None).await.unwrap();
    let who = agent("u1");

    let close = Action::new(ActionType::Delete, rec.id(), &who, "deleted");
    cli.close_actionlog_with(&rec, close.clone(), None, false).await.unwrap();
    assert!(backend.history_for(rec.id()).is_empty());

    // forced closing archives the close action alone
    cli.close_actionlog_with(&rec, close, None, true).await.unwrap();
    assert_eq!(backend.history_for(rec.id()).len(), 1);
}
