//! Incremental extraction semantics against a SQLite source.

use serde_json::{json, Value};

use granary_connectors::fetch_incremental;
use granary_core::DbEngine;

async fn seeded_engine(dir: &tempfile::TempDir) -> DbEngine {
    let url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("incremental.db").display()
    );
    let engine = DbEngine::connect(&url, 5).await.unwrap();
    sqlx::query("CREATE TABLE events (id INTEGER, label TEXT)")
        .execute(engine.pool())
        .await
        .unwrap();
    sqlx::query("INSERT INTO events VALUES (1, 'a'), (2, 'b'), (3, 'c'), (4, 'd')")
        .execute(engine.pool())
        .await
        .unwrap();
    engine
}

#[tokio::test]
async fn batches_walk_the_watermark_forward() {
    let dir = tempfile::tempdir().unwrap();
    let engine = seeded_engine(&dir).await;

    let (rows, watermark) = fetch_incremental(&engine, "events", "id", &Value::Null, 2, None)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], json!(1));
    assert_eq!(rows[1]["id"], json!(2));
    assert_eq!(watermark, json!(2));

    let (rows, watermark) = fetch_incremental(&engine, "events", "id", &watermark, 2, None)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], json!(3));
    assert_eq!(watermark, json!(4));

    engine.close().await;
}

#[tokio::test]
async fn quiescent_source_yields_zero_new_rows() {
    let dir = tempfile::tempdir().unwrap();
    let engine = seeded_engine(&dir).await;

    let (rows, watermark) = fetch_incremental(&engine, "events", "id", &Value::Null, 100, None)
        .await
        .unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(watermark, json!(4));

    // Re-running with the returned watermark is idempotent.
    let (rows, unchanged) = fetch_incremental(&engine, "events", "id", &watermark, 100, None)
        .await
        .unwrap();
    assert!(rows.is_empty());
    assert_eq!(unchanged, watermark);

    engine.close().await;
}

#[tokio::test]
async fn zero_batch_size_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = seeded_engine(&dir).await;

    let err = fetch_incremental(&engine, "events", "id", &Value::Null, 0, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("batch_size"));

    engine.close().await;
}
