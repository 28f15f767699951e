//! Snapshot mirror downloads.

use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use jwxt_harvest::{download_cloud_snapshot, HarvestConfig, HarvestError};

async fn mount_mirror(server: &MockServer, index: Value) {
    Mock::given(method("GET"))
        .and(path("/mirror/current.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(index))
        .mount(server)
        .await;
    for term in ["2023-1", "2024-3--xkkz-R1"] {
        Mock::given(method("GET"))
            .and(path(format!("/mirror/terms/{term}.json")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"termId": term, "courses": []})))
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn test_latest_term_only_by_default() {
    let server = MockServer::start().await;
    mount_mirror(
        &server,
        json!(["2023-1", {"termId": "2024-3--xkkz-R1", "jwxtRound": {"xkkzId": "R1"}}]),
    )
    .await;
    let out = tempfile::tempdir().unwrap();

    let base = format!("{}/mirror/", server.uri());
    let terms = download_cloud_snapshot(&base, out.path(), false, &HarvestConfig::default())
        .await
        .unwrap();

    assert_eq!(terms, ["2024-3--xkkz-R1"]);
    assert!(out.path().join("terms/2024-3--xkkz-R1.json").exists());
    assert!(!out.path().join("terms/2023-1.json").exists());

    let index: Value =
        serde_json::from_str(&std::fs::read_to_string(out.path().join("current.json")).unwrap())
            .unwrap();
    assert_eq!(index.as_array().unwrap().len(), 2);
    assert_eq!(index[0], json!({"termId": "2023-1"}));
}

#[tokio::test]
async fn test_all_terms() {
    let server = MockServer::start().await;
    mount_mirror(&server, json!(["2023-1", "2024-3--xkkz-R1"])).await;
    let out = tempfile::tempdir().unwrap();

    let base = format!("{}/mirror", server.uri());
    let terms = download_cloud_snapshot(&base, out.path(), true, &HarvestConfig::default())
        .await
        .unwrap();

    assert_eq!(terms.len(), 2);
    let body = std::fs::read_to_string(out.path().join("terms/2023-1.json")).unwrap();
    assert!(body.contains("2023-1"));
}

#[tokio::test]
async fn test_empty_mirror_index_is_an_error() {
    let server = MockServer::start().await;
    mount_mirror(&server, json!([])).await;
    let out = tempfile::tempdir().unwrap();

    let base = format!("{}/mirror", server.uri());
    let err = download_cloud_snapshot(&base, out.path(), false, &HarvestConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::Parse(_)));
    assert!(!out.path().join("current.json").exists());
}

#[tokio::test]
async fn test_missing_term_file_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mirror/current.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["2025-1"])))
        .mount(&server)
        .await;
    let out = tempfile::tempdir().unwrap();

    let base = format!("{}/mirror", server.uri());
    let err = download_cloud_snapshot(&base, out.path(), false, &HarvestConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::UnexpectedStatus { status: 404, .. }));
}

#[tokio::test]
async fn test_path_like_term_ids_stay_inside_output_dir() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mirror/current.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["../../escaped"])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/escaped.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pwned"))
        .expect(0)
        .mount(&server)
        .await;
    let root = tempfile::tempdir().unwrap();
    let out = root.path().join("out");

    let base = format!("{}/mirror", server.uri());
    let err = download_cloud_snapshot(&base, &out, false, &HarvestConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::Parse(_)));
    assert!(!root.path().join("escaped.json").exists());
    assert!(!out.join("current.json").exists());
}

#[tokio::test]
async fn test_unsafe_ids_skipped_among_valid_terms() {
    let server = MockServer::start().await;
    mount_mirror(&server, json!(["2023-1", "../2024-3--xkkz-R1", "2024-3--xkkz-R1"])).await;
    let out = tempfile::tempdir().unwrap();

    let base = format!("{}/mirror", server.uri());
    let terms = download_cloud_snapshot(&base, out.path(), true, &HarvestConfig::default())
        .await
        .unwrap();

    assert_eq!(terms, ["2023-1", "2024-3--xkkz-R1"]);
    let index: Value =
        serde_json::from_str(&std::fs::read_to_string(out.path().join("current.json")).unwrap())
            .unwrap();
    assert_eq!(index.as_array().unwrap().len(), 2);
}
