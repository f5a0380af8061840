#![cfg(feature = "memory-engine")]

mod common;

use futures::TryStreamExt;
use serde_json::json;
use stagestore::engine::LogicalEntity;
use stagestore::storage::MAX_TUPLES_PER_BATCH;
use uuid::Uuid;

#[tokio::test]
async fn test_25k_rows_flush_in_three_batches() {
    assert_eq!(MAX_TUPLES_PER_BATCH, 10_000);
    let fx = common::fixture().await;
    let activity = Uuid::new_v4();

    let mut writer = fx
        .manager
        .create_rel_checkpoint(activity, 0, &common::key_value(), true, None)
        .await
        .unwrap();
    for i in 0..25_000 {
        writer.write(vec![json!(null), json!(format!("v{}", i))]).await.unwrap();
    }
    assert_eq!(writer.batch_size(), Some(10_000));
    assert_eq!(writer.flush_count(), 2);
    writer.close().await.unwrap();
    assert_eq!(writer.flush_count(), 3);

    let table = writer.table().clone();
    assert_eq!(common::flushed_into(&fx.engine, &table.name), vec![10_000, 10_000, 5_000]);
    assert_eq!(writer.metadata().tuple_count(), 25_000);
    assert!(!writer.metadata().is_open());
    assert_eq!(fx.engine.stored_count(&LogicalEntity::Table(table)), Some(25_000));

    let reader = fx.manager.read_checkpoint(activity, 0).await.unwrap();
    let rows: Vec<_> = reader.iter().await.unwrap().try_collect().await.unwrap();
    assert_eq!(rows.len(), 25_000);
    // Surrogate keys replace whatever was written in column 0
    let mut keys: Vec<i64> = rows
        .iter()
        .map(|t| t.as_row().unwrap()[0].as_i64().unwrap())
        .collect();
    keys.sort_unstable();
    assert_eq!(keys, (0..25_000).collect::<Vec<i64>>());
    reader.close().await.unwrap();

    fx.manager.close().await.unwrap();
}

#[tokio::test]
async fn test_same_sample_gives_same_threshold() {
    let fx = common::fixture_with(stagestore::storage::BatchLimits {
        max_bytes: 1_000,
        max_rows: 10_000,
    })
    .await;

    let mut thresholds = Vec::new();
    for output in 0..3 {
        let mut writer = fx
            .manager
            .create_rel_checkpoint(Uuid::new_v4(), output, &common::key_value(), false, None)
            .await
            .unwrap();
        writer.write(vec![json!(1), json!("same sample")]).await.unwrap();
        thresholds.push(writer.batch_size().unwrap());
        writer.close().await.unwrap();
    }

    assert!(thresholds[0] >= 1 && thresholds[0] <= 10_000);
    assert!(thresholds.iter().all(|t| *t == thresholds[0]));
}
