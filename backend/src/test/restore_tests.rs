//! Restorer behavior: the record-store path and the HTTP path.

use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::dbio::DbioError;
use crate::restore::{from_archived_at, ProjectRestorer, UrlRestorer};

use super::{dmp_service_factory, inmem_factory, agent};

#[tokio::test]
async fn test_dbio_restorer_pulls_from_published_collection() {
    let (_backend, dbf) = inmem_factory();
    let svcf = dmp_service_factory(dbf.clone());
    let svc = svcf.create_service_for(&agent("u1"));

    let rec = svc
        .create_record(
            "Alpha",
            Some(json!({"title": "Alpha"}).as_object().unwrap().clone()),
            None,
            None,
        )
        .await
        .unwrap();
    svc.submit(rec.id(), None).await.unwrap();

    let cli = dbf.create_client("dmp", "u1");
    let mut restorer =
        from_archived_at("dbio_store:dmp_latest/ark:/88434/mdm1-0001", &cli).unwrap();
    let data = restorer.get_data().await.unwrap();
    assert_eq!(data.get("title"), Some(&json!("Alpha")));

    // a missing publication is NotFound
    let mut restorer =
        from_archived_at("dbio_store:dmp_latest/ark:/88434/mdm1-9999", &cli).unwrap();
    assert!(matches!(restorer.get_data().await.unwrap_err(), DbioError::NotFound { .. }));
}

#[tokio::test]
async fn test_from_archived_at_dispatch() {
    let (_backend, dbf) = inmem_factory();
    let cli = dbf.create_client("dmp", "u1");

    assert!(from_archived_at("dbio_store:dmp_latest/ark:/88434/mdm1-0001", &cli).is_ok());
    assert!(from_archived_at("https://archive.example/rec.json", &cli).is_ok());
    assert!(from_archived_at("dbio_store:bad coll/id", &cli).is_err());
    assert!(from_archived_at("s3://bucket/rec", &cli).is_err());
}

#[tokio::test]
async fn test_url_restorer_fetches_json() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/archive/rec"))
        .and(header("Accept", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"title": "Alpha"})))
        .mount(&server)
        .await;

    let mut restorer =
        UrlRestorer::new(&format!("{}/archive/rec", server.uri()), Some("mdm1:0001")).unwrap();
    let data = restorer.get_data().await.unwrap();
    assert_eq!(data.get("title"), Some(&json!("Alpha")));
}

#[tokio::test]
async fn test_url_restorer_maps_status_codes() {
    let server = MockServer::start().await;
    for (route, code) in
        [("/missing", 404), ("/private", 401), ("/nojson", 406), ("/broken", 500)]
    {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(code))
            .mount(&server)
            .await;
    }

    let mut r = UrlRestorer::new(&format!("{}/missing", server.uri()), None).unwrap();
    assert!(matches!(r.get_data().await.unwrap_err(), DbioError::NotFound { .. }));

    let mut r = UrlRestorer::new(&format!("{}/private", server.uri()), None).unwrap();
    assert!(matches!(r.get_data().await.unwrap_err(), DbioError::NotAuthorized { .. }));

    let mut r = UrlRestorer::new(&format!("{}/nojson", server.uri()), None).unwrap();
    let err = r.get_data().await.unwrap_err();
    assert!(err.to_string().contains("cannot return JSON"));

    let mut r = UrlRestorer::new(&format!("{}/broken", server.uri()), None).unwrap();
    let err = r.get_data().await.unwrap_err();
    assert!(err.to_string().contains("Server error"));
}

#[tokio::test]
async fn test_url_restorer_flags_html_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/landing"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<html><body>A landing page</body></html>"),
        )
        .mount(&server)
        .await;

    let mut r = UrlRestorer::new(&format!("{}/landing", server.uri()), None).unwrap();
    let err = r.get_data().await.unwrap_err();
    assert!(err.to_string().contains("HTML returned where JSON expected"));
}
