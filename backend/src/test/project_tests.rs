//! Project lifecycle behavior: drafting, finalization, publication,
//! revision, and external review.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use midas_shared::models::Permissions;
use midas_shared::status::ProjectState;

use crate::dbio::{DbClientFactory, DbioError};
use crate::project::{ProjectService, ProjectServiceConfig, ProjectServiceFactory};

use super::{agent, dmp_service_factory, inmem_factory};

fn data(v: Value) -> Map<String, Value> {
    v.as_object().unwrap().clone()
}

fn service(factory: &ProjectServiceFactory, actor: &str) -> ProjectService {
    factory.create_service_for(&agent(actor))
}

/// A service factory whose agents hold the publish permission by
/// default (granted to the public group on each new record).
fn publishing_factory(dbfactory: std::sync::Arc<DbClientFactory>) -> ProjectServiceFactory {
    let mut cfg = ProjectServiceConfig::default();
    cfg.default_perms = BTreeMap::from([(
        "publish".to_string(),
        vec![midas_shared::models::PUBLIC_GROUP.to_string()],
    )]);
    ProjectServiceFactory::new("dmp", dbfactory, cfg)
}

#[tokio::test]
async fn test_create_with_initial_data() {
    let (_backend, dbf) = inmem_factory();
    let svcf = dmp_service_factory(dbf);
    let svc = service(&svcf, "u1");

    let rec = svc
        .create_record("Alpha", Some(data(json!({"title": "Alpha"}))), None, None)
        .await
        .unwrap();
    assert_eq!(rec.id(), "mdm1:0001");
    assert_eq!(rec.data.get("title"), Some(&json!("Alpha")));
    // an editable draft carries the pending version marker from the start
    assert_eq!(rec.data.get("@version"), Some(&json!("1.0.0+ (in edit)")));
    assert_eq!(rec.status().state, ProjectState::Edit);
    assert_eq!(rec.meta.get("agent_vehicle"), Some(&json!("midas")));

    // the creation (and the initial-data patch) land in the log
    let acts = svc.dbclient().actions_for(rec.id()).await.unwrap();
    assert!(acts.iter().any(|a| a["type"] == "CREATE"));
    assert_eq!(acts.last().unwrap()["type"], "CREATE");
}

#[tokio::test]
async fn test_partial_update_merges_and_records_patch() {
    let (_backend, dbf) = inmem_factory();
    let svcf = dmp_service_factory(dbf);
    let svc = service(&svcf, "u1");

    let rec = svc
        .create_record("Alpha", Some(data(json!({"a": {"b": 1, "c": 2}}))), None, None)
        .await
        .unwrap();

    let out = svc
        .update_data(rec.id(), json!({"a": {"b": 5}}), None, None)
        .await
        .unwrap();
    assert_eq!(out["a"], json!({"b": 5, "c": 2}));

    // the PATCH action's object is the JSON-Patch of the change
    let acts = svc.dbclient().actions_for(rec.id()).await.unwrap();
    let patch = acts.last().unwrap();
    assert_eq!(patch["type"], "PATCH");
    assert_eq!(
        patch["object"],
        json!([{"op": "replace", "path": "/a/b", "value": 5}])
    );
}

#[tokio::test]
async fn test_part_update_and_get_data() {
    let (_backend, dbf) = inmem_factory();
    let svcf = dmp_service_factory(dbf);
    let svc = service(&svcf, "u1");
    let rec = svc
        .create_record("Alpha", Some(data(json!({"a": {"b": 1}}))), None, None)
        .await
        .unwrap();

    svc.update_data(rec.id(), json!(5), Some("a/b"), None).await.unwrap();
    assert_eq!(svc.get_data(rec.id(), Some("a/b")).await.unwrap(), json!(5));

    svc.update_data(rec.id(), json!({"d": 1}), Some("a/new"), None).await.unwrap();
    assert_eq!(svc.get_data(rec.id(), Some("a/new/d")).await.unwrap(), json!(1));

    let err = svc.get_data(rec.id(), Some("a/x")).await.unwrap_err();
    assert!(matches!(err, DbioError::NotFound { part: Some(_), .. }));

    // a scalar in the path blocks part updates
    let err = svc.update_data(rec.id(), json!(1), Some("a/b/c"), None).await.unwrap_err();
    assert!(matches!(err, DbioError::PartNotAccessible { .. }));
}

#[tokio::test]
async fn test_replace_and_clear_data() {
    let (_backend, dbf) = inmem_factory();
    let svcf = dmp_service_factory(dbf);
    let svc = service(&svcf, "u1");
    let rec = svc
        .create_record("Alpha", Some(data(json!({"a": 1, "b": 2}))), None, None)
        .await
        .unwrap();

    // replacement starts over from the default skeleton
    let out = svc.replace_data(rec.id(), json!({"c": 3}), None, None).await.unwrap();
    assert_eq!(out["c"], 3);
    assert_eq!(out["@version"], "1.0.0+ (in edit)");
    assert!(out.get("a").is_none());

    assert!(svc.clear_data(rec.id(), None, None).await.unwrap());
    assert_eq!(
        svc.get_data(rec.id(), None).await.unwrap(),
        json!({"@version": "1.0.0+ (in edit)"})
    );

    // clearing an absent part reports false
    svc.update_data(rec.id(), json!({"a": {"b": 1}}), None, None).await.unwrap();
    assert!(svc.clear_data(rec.id(), Some("a/b"), None).await.unwrap());
    assert!(!svc.clear_data(rec.id(), Some("a/zz"), None).await.unwrap());
}

#[tokio::test]
async fn test_finalize_assigns_version_and_release_history() {
    let (_backend, dbf) = inmem_factory();
    let svcf = dmp_service_factory(dbf);
    let svc = service(&svcf, "u1");
    let rec = svc
        .create_record("Alpha", Some(data(json!({"title": "Alpha"}))), None, None)
        .await
        .unwrap();

    let stat = svc.finalize(rec.id(), Some("first release")).await.unwrap();
    assert_eq!(stat.state, ProjectState::Ready);

    let rec = svc.get_record(rec.id()).await.unwrap();
    assert_eq!(rec.data["@version"], "1.0.0");
    assert_eq!(rec.data["@id"], "ark:/88434/mdm1-0001");
    let releases = rec.data["releaseHistory"]["hasRelease"].as_array().unwrap();
    assert_eq!(releases.len(), 1);
    assert_eq!(releases[0]["version"], "1.0.0");
    assert_eq!(releases[0]["description"], "first release");
}

#[tokio::test]
async fn test_initial_finalize_drops_edit_marker_without_increment() {
    let (_backend, dbf) = inmem_factory();
    let svcf = dmp_service_factory(dbf);
    let svc = service(&svcf, "u1");
    let rec = svc
        .create_record(
            "Alpha",
            Some(data(json!({"@version": "1.0.0+ (in edit)"}))),
            None,
            None,
        )
        .await
        .unwrap();

    // the first publication produces exactly 1.0.0
    svc.finalize(rec.id(), None).await.unwrap();
    let rec = svc.get_record(rec.id()).await.unwrap();
    assert_eq!(rec.data["@version"], "1.0.0");
    let versions: Vec<&str> = rec.data["releaseHistory"]["hasRelease"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["version"].as_str().unwrap())
        .collect();
    assert_eq!(versions, vec!["1.0.0"]);
}

#[tokio::test]
async fn test_finalize_increments_drafts_with_release_history() {
    let (_backend, dbf) = inmem_factory();
    let svcf = dmp_service_factory(dbf);
    let svc = service(&svcf, "u1");
    let rec = svc
        .create_record(
            "Alpha",
            Some(data(json!({
                "@version": "1.2.0+ (in edit)",
                "releaseHistory": {"hasRelease": [{"version": "1.2.0"}]}
            }))),
            None,
            None,
        )
        .await
        .unwrap();

    svc.finalize(rec.id(), None).await.unwrap();
    let rec = svc.get_record(rec.id()).await.unwrap();
    assert_eq!(rec.data["@version"], "1.3.0");
    let versions: Vec<&str> = rec.data["releaseHistory"]["hasRelease"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["version"].as_str().unwrap())
        .collect();
    assert_eq!(versions, vec!["1.2.0", "1.3.0"]);
}

#[tokio::test]
async fn test_finalize_requires_editable_state() {
    let (_backend, dbf) = inmem_factory();
    let svcf = publishing_factory(dbf);
    let svc = service(&svcf, "u1");
    let rec = svc.create_record("Alpha", None, None, None).await.unwrap();

    svc.submit(rec.id(), None).await.unwrap();
    let err = svc.finalize(rec.id(), None).await.unwrap_err();
    assert!(matches!(err, DbioError::NotEditable { .. }));
}

#[tokio::test]
async fn test_submit_publishes_and_archives_copies() {
    let (backend, dbf) = inmem_factory();
    let svcf = dmp_service_factory(dbf);
    let svc = service(&svcf, "u1");
    let rec = svc
        .create_record("Alpha", Some(data(json!({"title": "Alpha"}))), None, None)
        .await
        .unwrap();

    svc.finalize(rec.id(), None).await.unwrap();
    let stat = svc.submit(rec.id(), None).await.unwrap();
    assert_eq!(stat.state, ProjectState::Published);

    let rec = svc.get_record(rec.id()).await.unwrap();
    assert_eq!(rec.status().published_as.as_deref(), Some("ark:/88434/mdm1-0001"));
    assert_eq!(
        rec.status().archived_at.as_deref(),
        Some("dbio_store:dmp_latest/ark:/88434/mdm1-0001")
    );

    // the latest copy: ARK id, public read, nothing else
    let latest = backend.colls_get("dmp_latest", "ark:/88434/mdm1-0001");
    let latest = latest.expect("latest copy missing");
    assert_eq!(latest["status"]["state"], "published");
    assert_eq!(latest["acls"]["read"], json!(["grp0:public"]));
    assert_eq!(latest["acls"]["write"], json!([]));
    assert_eq!(latest["acls"]["admin"], json!([]));
    assert_eq!(latest["acls"]["delete"], json!([]));

    // the immutable version copy
    let ver = backend.colls_get("dmp_version", "ark:/88434/mdm1-0001/pdr:v/1.0.0");
    assert!(ver.is_some());
}

#[tokio::test]
async fn test_publish_requires_submitted_state() {
    let (_backend, dbf) = inmem_factory();
    let svcf = publishing_factory(dbf);
    let svc = service(&svcf, "u1");
    let rec = svc.create_record("Alpha", None, None, None).await.unwrap();

    let err = svc.publish(rec.id()).await.unwrap_err();
    assert!(matches!(err, DbioError::NotSubmitable { .. }));
}

#[tokio::test]
async fn test_update_after_publish_preps_for_revision() {
    let (backend, dbf) = inmem_factory();
    let svcf = dmp_service_factory(dbf);
    let svc = service(&svcf, "u1");
    let rec = svc
        .create_record("Alpha", Some(data(json!({"title": "Alpha"}))), None, None)
        .await
        .unwrap();
    let id = rec.id().to_string();

    svc.submit(&id, None).await.unwrap();
    assert_eq!(svc.get_status(&id).await.unwrap().state, ProjectState::Published);

    // updating a published record first reopens it from the archive
    svc.update_data(&id, json!({"title": "Alpha revised"}), None, None).await.unwrap();
    let rec = svc.get_record(&id).await.unwrap();
    assert_eq!(rec.status().state, ProjectState::Edit);
    assert_eq!(rec.data["title"], "Alpha revised");
    // the draft version is reopened with the edit marker
    assert_eq!(rec.data["@version"], "1.0.0+ (in edit)");

    // everything but the applied update and the version marker matches
    // the published copy
    let latest = backend.colls_get("dmp_latest", "ark:/88434/mdm1-0001").unwrap();
    assert_eq!(latest["data"]["title"], "Alpha");
    assert_eq!(rec.data["@id"], latest["data"]["@id"]);
    assert_eq!(rec.data["releaseHistory"], latest["data"]["releaseHistory"]);

    // the next finalization increments the minor field
    svc.finalize(&id, None).await.unwrap();
    let rec = svc.get_record(&id).await.unwrap();
    assert_eq!(rec.data["@version"], "1.1.0");
}

#[tokio::test]
async fn test_delete_published_record_leaves_stub() {
    let (_backend, dbf) = inmem_factory();
    let svcf = dmp_service_factory(dbf);
    let svc = service(&svcf, "u1");
    let rec = svc
        .create_record("Alpha", Some(data(json!({"title": "Alpha"}))), None, None)
        .await
        .unwrap();
    let id = rec.id().to_string();
    svc.submit(&id, None).await.unwrap();

    // edit the draft, then discard the revision
    svc.update_data(&id, json!({"title": "Oops"}), None, None).await.unwrap();
    let stub = svc.delete_record(&id).await.unwrap();
    let stub = stub.expect("published record should leave a stub");
    assert_eq!(stub.data["title"], "Alpha");
    assert!(svc.exists(&id).await.unwrap());

    // a never-published record disappears entirely
    let rec2 = svc.create_record("Beta", None, None, None).await.unwrap();
    assert!(svc.delete_record(rec2.id()).await.unwrap().is_none());
    assert!(!svc.exists(rec2.id()).await.unwrap());
}

#[tokio::test]
async fn test_external_review_gates_publication() {
    let (_backend, dbf) = inmem_factory();
    let svcf = publishing_factory(dbf.clone());
    let svc = service(&svcf, "u1");
    let rec = svc.create_record("Alpha", None, None, None).await.unwrap();
    let id = rec.id().to_string();

    svc.finalize(&id, None).await.unwrap();
    svc.apply_external_review(
        &id,
        "nps",
        "in progress",
        Some(&id),
        None,
        None,
        false,
        true,
        BTreeMap::new(),
    )
    .await
    .unwrap();

    let stat = svc.get_status(&id).await.unwrap();
    assert_eq!(stat.get_review_from("nps").unwrap().phase, "in progress");
}

#[tokio::test]
async fn test_request_changes_returns_record_to_edit() {
    let (_backend, dbf) = inmem_factory();
    let svcf = publishing_factory(dbf);
    let svc = service(&svcf, "u1");
    let rec = svc.create_record("Alpha", None, None, None).await.unwrap();
    let id = rec.id().to_string();

    // force the record into the submitted state
    {
        let cli = svc.dbclient();
        let mut prec = cli.get_record_for(&id, Permissions::WRITE).await.unwrap();
        prec.status_mut().set_state(ProjectState::Submitted, -1.0);
        prec.save(cli).await.unwrap();
    }

    let fb = vec![json!({"type": "req", "description": "Visit NPS for reviewer comments"})];
    let state = svc
        .apply_external_review(&id, "nps", "paused", Some(&id), None, Some(fb), true, true,
            BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(state, ProjectState::Edit);

    let stat = svc.get_status(&id).await.unwrap();
    let rev = stat.get_review_from("nps").unwrap();
    assert_eq!(rev.phase, "paused");
    assert_eq!(
        rev.feedback,
        vec![json!({"type": "req", "description": "Visit NPS for reviewer comments"})]
    );
}

#[tokio::test]
async fn test_rename_and_reassign() {
    let (_backend, dbf) = inmem_factory();
    let svcf = dmp_service_factory(dbf);
    let svc = service(&svcf, "u1");
    let rec = svc.create_record("Alpha", None, None, None).await.unwrap();
    svc.create_record("Beta", None, None, None).await.unwrap();

    let err = svc.rename_record(rec.id(), "Beta").await.unwrap_err();
    assert!(matches!(err, DbioError::AlreadyExists(_)));

    let name = svc.rename_record(rec.id(), "Gamma").await.unwrap();
    assert_eq!(name, "Gamma");

    let owner = svc.reassign_record(rec.id(), "u2", false).await.unwrap();
    assert_eq!(owner, "u2");
    let rec = svc.get_record(rec.id()).await.unwrap();
    // the former owner keeps their permissions unless disowned
    assert!(rec.core.acls["read"].contains(&"u1".to_string()));
    assert!(rec.core.acls["read"].contains(&"u2".to_string()));
}
