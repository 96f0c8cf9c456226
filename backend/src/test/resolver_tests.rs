//! Resolver behavior against stubbed upstream services.

use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::config::AppConfig;
use crate::create_app;
use crate::dbio::inmem::InMemoryBackend;
use crate::describe::HybridClient;
use crate::state::AppState;

use axum_test::TestServer;

fn resolver_state(md_search: &str, cachedir: Option<&str>, distrib: Option<&str>)
    -> Arc<AppState>
{
    let mut config = AppConfig::default();
    config.jwt_auth.key = "test-secret".to_string();
    config.resolver.md_search = md_search.to_string();
    config.resolver.metadata_cache_dir = cachedir.map(String::from);
    config.resolver.distribution_service = distrib.map(String::from);
    config.resolver.landing_page_service = Some("https://data.example/od/id".to_string());
    let backend = Arc::new(InMemoryBackend::new());
    Arc::new(AppState::build_with_backend(config, backend).unwrap())
}

fn big_record() -> Value {
    json!({
        "@id": "ark:/88434/mds2-1234",
        "@type": ["nrdp:PublicDataResource"],
        "title": "A large dataset",
        "version": "1.0.0",
        "releaseHistory": {"hasRelease": [{"version": "1.0.0"}]},
        "components": [
            {"@id": "pdr:f/dir/file.txt",
             "filepath": "dir/file.txt",
             "mediaType": "text/plain",
             "downloadURL": "https://data.example/od/ds/mds2-1234/dir/file.txt"}
        ]
    })
}

fn seed_cache(dir: &TempDir) {
    std::fs::write(
        dir.path().join("mds2-1234-v1_0_0.json"),
        serde_json::to_string(&big_record()).unwrap(),
    )
    .unwrap();
}

#[tokio::test]
async fn test_release_history_view() {
    let rmm = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/releaseSets"))
        .and(query_param("@id", "ark:/88434/mds2-1234/pdr:v"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ResultData": [{
                "@id": "ark:/88434/mds2-1234/pdr:v",
                "@type": ["nrdr:ReleaseHistory"],
                "hasRelease": [{"version": "1.0.0"}]
            }]
        })))
        .mount(&rmm)
        .await;

    let state = resolver_state(&rmm.uri(), None, None);
    let server = TestServer::new(create_app(state)).unwrap();

    let resp = server
        .get("/id/ark:/88434/mds2-1234/pdr:v")
        .add_header("Accept", "application/json")
        .await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["@id"], "ark:/88434/mds2-1234/pdr:v");
    assert!(body["@type"]
        .as_array()
        .unwrap()
        .iter()
        .any(|t| t == "nrdr:ReleaseHistory"));
    assert!(body.get("components").is_none());
}

#[tokio::test]
async fn test_format_param_overrides_accept_to_406() {
    let state = resolver_state("http://localhost:1", None, None);
    let server = TestServer::new(create_app(state)).unwrap();

    // format=html cannot satisfy an Accept of application/json
    let resp = server
        .get("/id/ark:/88434/mds2-1234")
        .add_query_param("format", "html")
        .add_header("Accept", "application/json")
        .await;
    resp.assert_status(axum::http::StatusCode::NOT_ACCEPTABLE);

    let resp = server
        .get("/id/ark:/88434/mds2-1234")
        .add_query_param("format", "datacite")
        .await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_html_redirects_to_landing_page() {
    let state = resolver_state("http://localhost:1", None, None);
    let server = TestServer::new(create_app(state)).unwrap();

    let resp = server
        .get("/id/ark:/88434/mds2-1234")
        .add_header("Accept", "text/html")
        .await;
    resp.assert_status(axum::http::StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        resp.header("Location").to_str().unwrap(),
        "https://data.example/od/id/ark:/88434/mds2-1234"
    );
}

#[tokio::test]
async fn test_unknown_naan_is_404() {
    let state = resolver_state("http://localhost:1", None, None);
    let server = TestServer::new(create_app(state)).unwrap();

    let resp = server.get("/id/ark:/99999/mds2-1234").await;
    resp.assert_status(axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_versioned_component_from_cache() {
    // the RMM knows nothing about this record; the cache holds it
    let rmm = MockServer::start().await;
    let cache = TempDir::new().unwrap();
    seed_cache(&cache);

    let state = resolver_state(&rmm.uri(), Some(cache.path().to_str().unwrap()), None);
    let server = TestServer::new(create_app(state)).unwrap();

    let resp = server
        .get("/id/ark:/88434/mds2-1234/pdr:v/1.0.0/pdr:f/dir/file.txt")
        .add_header("Accept", "application/json")
        .add_query_param("format", "nerdm")
        .await;
    resp.assert_status_ok();
    let cmp: Value = resp.json();
    assert_eq!(cmp["@id"], "ark:/88434/mds2-1234/pdr:v/1.0.0/pdr:f/dir/file.txt");
    assert!(cmp["downloadURL"].as_str().unwrap().contains("/_v/1.0.0/"));
    assert_eq!(cmp["filepath"], "dir/file.txt");
}

#[tokio::test]
async fn test_hybrid_prefers_cache_for_latest_and_rmm_for_versions() {
    let rmm = MockServer::start().await;
    // RMM serves a component-less stub for the latest...
    Mock::given(method("GET"))
        .and(path("/records"))
        .and(query_param("@id", "ark:/88434/mds2-1234"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ResultData": [{"@id": "ark:/88434/mds2-1234", "title": "stub", "version": "1.0.0"}]
        })))
        .mount(&rmm)
        .await;
    // ...and the only copy of version 2.0.0
    Mock::given(method("GET"))
        .and(path("/versions"))
        .and(query_param("@id", "ark:/88434/mds2-1234/pdr:v/2.0.0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ResultData": [{
                "@id": "ark:/88434/mds2-1234/pdr:v/2.0.0",
                "title": "version two",
                "version": "2.0.0"
            }]
        })))
        .mount(&rmm)
        .await;
    Mock::given(method("GET"))
        .and(path("/releaseSets"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&rmm)
        .await;

    let cache = TempDir::new().unwrap();
    seed_cache(&cache);
    let hybrid = HybridClient::new(&rmm.uri(), cache.path().to_str()).unwrap();

    // no explicit version: the oversized-record cache wins
    let rec = hybrid.describe("ark:/88434/mds2-1234", None).await.unwrap();
    assert_eq!(rec["title"], "A large dataset");

    // a version present only in the RMM: the RMM wins
    let rec = hybrid.describe("ark:/88434/mds2-1234", Some("2.0.0")).await.unwrap();
    assert_eq!(rec["title"], "version two");
}

#[tokio::test]
async fn test_aip_info_and_version_scoped_distributions() {
    let dist = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mds2-1234/_aip/_v"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["1.0.0", "1.2.0"])))
        .mount(&dist)
        .await;
    let head = json!({
        "aipid": "mds2-1234",
        "name": "mds2-1234.1_2_0.mbag0_4-2.zip",
        "multibagSequence": 2,
        "sinceVersion": "1.2.0"
    });
    Mock::given(method("GET"))
        .and(path("/mds2-1234/_aip/_head/_info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(head.clone()))
        .mount(&dist)
        .await;
    Mock::given(method("GET"))
        .and(path("/mds2-1234/_aip/_v/1.0.0/_head/_info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "aipid": "mds2-1234",
            "name": "mds2-1234.mbag0_4-1.zip",
            "multibagSequence": 1,
            "sinceVersion": "1.0.0"
        })))
        .mount(&dist)
        .await;
    Mock::given(method("GET"))
        .and(path("/mds2-1234/_aip/_info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"name": "mds2-1234.mbag0_4-1.zip", "multibagSequence": 1},
            {"name": "mds2-1234.1_2_0.mbag0_4-2.zip", "multibagSequence": 2}
        ])))
        .mount(&dist)
        .await;
    Mock::given(method("GET"))
        .and(path("/_aip/mds2-1234.mbag0_4-1.zip/_bag/multibag/member_bags.tsv"))
        .respond_with(ResponseTemplate::new(200).set_body_string("mds2-1234.mbag0_4-1\n"))
        .mount(&dist)
        .await;

    let state = resolver_state("http://localhost:1", None, Some(&dist.uri()));
    let server = TestServer::new(create_app(state)).unwrap();

    // AIP info view
    let resp = server
        .get("/aip/mds2-1234")
        .add_header("Accept", "application/json")
        .await;
    resp.assert_status_ok();
    let info: Value = resp.json();
    assert_eq!(info["aipid"], "mds2-1234");
    assert_eq!(info["maxMultibagSequence"], 2);
    assert_eq!(info["latestVersion"], "1.2.0");
    assert_eq!(info["versions"], json!(["1.0.0", "1.2.0"]));
    assert!(info["headBag"].get("aipid").is_none());

    // distributions participating in version 1.0.0 only
    let resp = server
        .get("/aip/mds2-1234/pdr:v/1.0.0/pdr:d")
        .add_header("Accept", "application/json")
        .await;
    resp.assert_status_ok();
    let dists: Value = resp.json();
    let names: Vec<&str> = dists
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["mds2-1234.mbag0_4-1.zip"]);
}

#[tokio::test]
async fn test_aip_unconfigured_is_503() {
    let state = resolver_state("http://localhost:1", None, None);
    let server = TestServer::new(create_app(state)).unwrap();
    let resp = server.get("/aip/mds2-1234").await;
    resp.assert_status(axum::http::StatusCode::SERVICE_UNAVAILABLE);
}
