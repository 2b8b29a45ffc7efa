mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{build_index, numbered_csv, test_config, NamedEmbedder, StubGenerator, SCENARIO_CSV};
use vibewatch::{
    db::{read_catalog, read_index},
    error::{AppError, FailureKind},
    models::CatalogId,
    services::{
        embedding_builder::BuilderSettings,
        index_build::embed_catalog,
        index_store::{load_snapshot, IndexExpectation, IndexStore},
        providers::RetryPolicy,
        recommendations::RecommendationService,
        retriever::Retriever,
    },
};

fn no_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 0,
        base_delay: Duration::from_millis(1),
    }
}

fn loaded_store(paths: &vibewatch::services::index_build::IndexPaths, model: &str) -> Arc<IndexStore> {
    let snapshot = load_snapshot(&paths.catalog, &paths.index, &IndexExpectation::for_model(model)).unwrap();
    Arc::new(IndexStore::with_snapshot(snapshot))
}

#[tokio::test]
async fn test_index_covers_catalog_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let paths = build_index(dir.path(), &numbered_csv(25), Arc::new(NamedEmbedder::new("v1"))).await;

    let catalog = read_catalog(&paths.catalog).unwrap();
    let artifact = read_index(&paths.index).unwrap();

    assert_eq!(artifact.ids.len(), catalog.len());
    assert_eq!(artifact.vectors.len(), catalog.len());
    for (row, id) in artifact.ids.iter().enumerate() {
        let record = catalog.get(*id).unwrap();
        assert_eq!(artifact.content_hashes[row], record.content_hash());
    }
}

#[tokio::test]
async fn test_rebuild_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let paths = build_index(dir.path(), &numbered_csv(8), Arc::new(NamedEmbedder::new("v1"))).await;
    let first = read_index(&paths.index).unwrap();

    let model = Arc::new(NamedEmbedder::new("v1"));
    let outcome = embed_catalog(&paths, model.clone(), BuilderSettings::default())
        .await
        .unwrap();

    assert_eq!(model.calls(), 0);
    assert_eq!(outcome.embedded, 0);
    assert_eq!(outcome.artifact.ids, first.ids);
    assert_eq!(outcome.artifact.vectors, first.vectors);
    assert_eq!(outcome.artifact.manifest.catalog_fingerprint, first.manifest.catalog_fingerprint);
}

#[tokio::test]
async fn test_index_from_other_model_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let paths = build_index(dir.path(), SCENARIO_CSV, Arc::new(NamedEmbedder::new("v1"))).await;

    let result = load_snapshot(&paths.catalog, &paths.index, &IndexExpectation::for_model("v2"));
    assert!(matches!(result, Err(AppError::IndexUnavailable(_))));
}

#[tokio::test]
async fn test_scenario_returns_min_k_and_n() {
    let dir = tempfile::tempdir().unwrap();
    let paths = build_index(dir.path(), SCENARIO_CSV, Arc::new(NamedEmbedder::new("v1"))).await;
    let retriever = Retriever::new(loaded_store(&paths, "v1"), Arc::new(NamedEmbedder::new("v1")), no_retry());

    for (k, expected) in [(1, 1), (2, 2), (3, 3), (5, 3)] {
        let candidates = retriever.retrieve("cozy family night", k).await.unwrap();
        assert_eq!(candidates.len(), expected);
        assert!(candidates.windows(2).all(|w| w[0].score >= w[1].score));
    }
}

#[tokio::test]
async fn test_large_k_returns_whole_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let paths = build_index(dir.path(), &numbered_csv(10), Arc::new(NamedEmbedder::new("v1"))).await;

    let service = RecommendationService::with_models(
        &test_config(),
        loaded_store(&paths, "v1"),
        Arc::new(NamedEmbedder::new("v1")),
        Arc::new(StubGenerator::Fail(FailureKind::Transient)),
    );

    let response = service.recommend("a quiet drama", Some(100)).await.unwrap();
    assert!(response.degraded);
    assert_eq!(response.recommendations.len(), 10);

    let mut ids: Vec<u64> = response.recommendations.iter().map(|r| r.id.0).collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_equal_scores_order_by_id() {
    let dir = tempfile::tempdir().unwrap();
    let csv = "movieId,title,genres\n9,Twin,Drama\n5,Twin,Drama\n7,Other film,Comedy\n";
    let paths = build_index(dir.path(), csv, Arc::new(NamedEmbedder::new("v1"))).await;
    let retriever = Retriever::new(loaded_store(&paths, "v1"), Arc::new(NamedEmbedder::new("v1")), no_retry());

    let candidates = retriever.retrieve("twin drama", 3).await.unwrap();
    assert_eq!(candidates[0].record.id, CatalogId(5));
    assert_eq!(candidates[1].record.id, CatalogId(9));
    assert_eq!(candidates[0].score, candidates[1].score);
}

#[tokio::test]
async fn test_empty_query_makes_no_model_call() {
    let dir = tempfile::tempdir().unwrap();
    let paths = build_index(dir.path(), SCENARIO_CSV, Arc::new(NamedEmbedder::new("v1"))).await;
    let embedder = Arc::new(NamedEmbedder::new("v1"));
    let retriever = Retriever::new(loaded_store(&paths, "v1"), embedder.clone(), no_retry());

    let result = retriever.retrieve("", 3).await;
    assert!(matches!(result, Err(AppError::InvalidInput(_))));
    assert_eq!(embedder.calls(), 0);
}

#[tokio::test]
async fn test_catalog_edit_requires_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let paths = build_index(dir.path(), SCENARIO_CSV, Arc::new(NamedEmbedder::new("v1"))).await;

    // Re-normalize a changed source without re-embedding
    let source = dir.path().join("movies.csv");
    std::fs::write(&source, format!("{}4,Heat (1995),Crime\n", SCENARIO_CSV)).unwrap();
    vibewatch::services::index_build::normalize_catalog(&source, &paths).unwrap();

    let result = load_snapshot(&paths.catalog, &paths.index, &IndexExpectation::for_model("v1"));
    assert!(matches!(result, Err(AppError::IndexUnavailable(_))));

    // Re-embedding only the new record brings them back together
    let model = Arc::new(NamedEmbedder::new("v1"));
    let outcome = embed_catalog(&paths, model.clone(), BuilderSettings::default())
        .await
        .unwrap();
    assert_eq!(outcome.embedded, 1);
    assert_eq!(outcome.reused, 3);
    assert!(load_snapshot(&paths.catalog, &paths.index, &IndexExpectation::for_model("v1")).is_ok());
}
