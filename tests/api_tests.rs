mod common;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use serde_json::{json, Value};
use std::sync::Arc;

use common::{build_index, numbered_csv, test_config, NamedEmbedder, StubGenerator, SCENARIO_CSV};
use vibewatch::{
    error::FailureKind,
    routes::{create_router, AppState},
    services::{
        index_build::IndexPaths,
        index_store::{load_snapshot, IndexExpectation, IndexStore},
        recommendations::RecommendationService,
    },
};

const MODEL: &str = "test-embedding-v1";

fn create_test_server(paths: IndexPaths, generator: StubGenerator, load: bool) -> TestServer {
    let expectation = IndexExpectation::for_model(MODEL);
    let store = Arc::new(IndexStore::empty());
    if load {
        store.publish(load_snapshot(&paths.catalog, &paths.index, &expectation).unwrap());
    }

    let recommender = RecommendationService::with_models(
        &test_config(),
        Arc::clone(&store),
        Arc::new(NamedEmbedder::new(MODEL)),
        Arc::new(generator),
    );

    let state = AppState {
        store,
        recommender: Arc::new(recommender),
        paths,
        expectation,
    };
    TestServer::new(create_router(state)).unwrap()
}

async fn scenario_server(generator: StubGenerator) -> (tempfile::TempDir, TestServer) {
    let dir = tempfile::tempdir().unwrap();
    let paths = build_index(dir.path(), SCENARIO_CSV, Arc::new(NamedEmbedder::new(MODEL))).await;
    let server = create_test_server(paths, generator, true);
    (dir, server)
}

fn picks(reply: &str) -> StubGenerator {
    StubGenerator::Reply(reply.to_string())
}

#[tokio::test]
async fn test_health_check_reports_index() {
    let (_dir, server) = scenario_server(picks("[]")).await;
    let response = server.get("/health").await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["index"]["loaded"], true);
    assert_eq!(body["index"]["records"], 3);
    assert_eq!(body["index"]["embedding_model"], MODEL);
}

#[tokio::test]
async fn test_recommendations_ranked() {
    let (_dir, server) = scenario_server(picks(
        r#"[{"id": 1, "title": "Up", "reason": "Warm family adventure."}]"#,
    ))
    .await;

    let response = server
        .post("/api/v1/recommendations")
        .json(&json!({ "query_text": "something for the whole family", "k": 3 }))
        .await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["degraded"], false);
    assert_eq!(body["recommendations"][0]["id"], 1);
    assert_eq!(body["recommendations"][0]["title"], "Up");
    assert_eq!(body["recommendations"][0]["rationale"], "Warm family adventure.");
}

#[tokio::test]
async fn test_recommendations_degrade_on_transient_failure() {
    let (_dir, server) = scenario_server(StubGenerator::Fail(FailureKind::Transient)).await;

    let response = server
        .post("/api/v1/recommendations")
        .json(&json!({ "query_text": "rainy sunday", "k": 2 }))
        .await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["degraded"], true);
    let items = body["recommendations"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|item| item["rationale"].is_null()));
}

#[tokio::test]
async fn test_recommendations_fatal_generation_error() {
    let (_dir, server) = scenario_server(StubGenerator::Fail(FailureKind::Fatal)).await;

    let response = server
        .post("/api/v1/recommendations")
        .json(&json!({ "query_text": "rainy sunday", "k": 2 }))
        .await;
    response.assert_status(StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_empty_query_is_bad_request() {
    let (_dir, server) = scenario_server(picks("[]")).await;

    let response = server
        .post("/api/v1/recommendations")
        .json(&json!({ "query_text": "   ", "k": 3 }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let body: Value = response.json();
    assert_eq!(body["error"], "query_text must not be empty");
}

#[tokio::test]
async fn test_non_positive_k_is_bad_request() {
    let (_dir, server) = scenario_server(picks("[]")).await;

    for k in [0, -1] {
        let response = server
            .post("/api/v1/recommendations")
            .json(&json!({ "query_text": "anything", "k": k }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn test_k_defaults_to_ten() {
    let dir = tempfile::tempdir().unwrap();
    let paths = build_index(dir.path(), &numbered_csv(12), Arc::new(NamedEmbedder::new(MODEL))).await;
    let server = create_test_server(paths, StubGenerator::Fail(FailureKind::Transient), true);

    let response = server
        .post("/api/v1/recommendations")
        .json(&json!({ "query_text": "a drama" }))
        .await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["recommendations"].as_array().unwrap().len(), 10);
}

#[tokio::test]
async fn test_unloaded_index_is_unavailable_until_reload() {
    let dir = tempfile::tempdir().unwrap();
    let paths = build_index(dir.path(), SCENARIO_CSV, Arc::new(NamedEmbedder::new(MODEL))).await;
    let server = create_test_server(paths, StubGenerator::Fail(FailureKind::Transient), false);

    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["index"]["loaded"], false);

    let request = json!({ "query_text": "anything", "k": 3 });
    server
        .post("/api/v1/recommendations")
        .json(&request)
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);

    let response = server.post("/api/v1/index/reload").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["records"], 3);

    server
        .post("/api/v1/recommendations")
        .json(&request)
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_failed_reload_keeps_current_index() {
    let dir = tempfile::tempdir().unwrap();
    let paths = build_index(dir.path(), SCENARIO_CSV, Arc::new(NamedEmbedder::new(MODEL))).await;
    let server = create_test_server(paths.clone(), StubGenerator::Fail(FailureKind::Transient), true);

    // Replace the index with one built by a different model
    build_index(dir.path(), SCENARIO_CSV, Arc::new(NamedEmbedder::new("other-model"))).await;

    server
        .post("/api/v1/index/reload")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);

    let body: Value = server.get("/health").await.json();
    assert_eq!(body["index"]["loaded"], true);
    assert_eq!(body["index"]["embedding_model"], MODEL);

    server
        .post("/api/v1/recommendations")
        .json(&json!({ "query_text": "anything", "k": 3 }))
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let (_dir, server) = scenario_server(picks("[]")).await;

    let response = server
        .get("/health")
        .add_header(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_static("req-123"),
        )
        .await;
    assert_eq!(response.header("x-request-id"), "req-123");

    let response = server.get("/health").await;
    let generated = response.header("x-request-id");
    assert!(uuid::Uuid::parse_str(generated.to_str().unwrap()).is_ok());
}
