#![cfg(feature = "memory-engine")]

mod common;

use serde_json::json;
use stagestore::engine::memory::WriteFault;
use stagestore::engine::LogicalEntity;
use stagestore::StorageError;
use uuid::Uuid;

#[tokio::test]
async fn test_short_flush_fails_writer_and_rolls_back() {
    let fx = common::fixture_with(common::rows_per_batch(3)).await;
    let activity = Uuid::new_v4();
    let mut writer = fx
        .manager
        .create_rel_checkpoint(activity, 0, &common::key_value(), true, None)
        .await
        .unwrap();

    fx.engine.inject_write_fault(WriteFault::Truncate(1));
    writer.write(vec![json!(0), json!("a")]).await.unwrap();
    writer.write(vec![json!(0), json!("b")]).await.unwrap();
    let err = writer.write(vec![json!(0), json!("c")]).await.unwrap_err();
    assert!(
        matches!(err.root(), StorageError::PartialWrite { expected: 3, actual: 2, .. }),
        "unexpected error: {}",
        err
    );

    let again = writer.write(vec![json!(0), json!("d")]).await.unwrap_err();
    assert!(matches!(again, StorageError::IllegalState(_)));

    writer.close().await.unwrap();
    let table = LogicalEntity::Table(writer.table().clone());
    assert_eq!(fx.engine.stored_count(&table), Some(0));
    assert!(!writer.metadata().is_open());
    assert_discarded(&fx, activity, 0).await;
}

#[tokio::test]
async fn test_short_final_flush_fails_close() {
    let fx = common::fixture_with(common::rows_per_batch(3)).await;
    let activity = Uuid::new_v4();
    let mut writer = fx
        .manager
        .create_rel_checkpoint(activity, 0, &common::key_value(), true, None)
        .await
        .unwrap();

    fx.engine.inject_write_fault(WriteFault::Truncate(1));
    writer.write(vec![json!(0), json!("a")]).await.unwrap();
    writer.write(vec![json!(0), json!("b")]).await.unwrap();
    let err = writer.close().await.unwrap_err();
    assert!(
        matches!(err.root(), StorageError::PartialWrite { expected: 2, actual: 1, .. }),
        "unexpected error: {}",
        err
    );

    let table = LogicalEntity::Table(writer.table().clone());
    assert_eq!(fx.engine.stored_count(&table), Some(0));
    assert_discarded(&fx, activity, 0).await;
}

#[tokio::test]
async fn test_failed_statement_surfaces_as_execution_error() {
    let fx = common::fixture_with(common::rows_per_batch(2)).await;
    let activity = Uuid::new_v4();
    let mut writer = fx.manager.create_doc_checkpoint(activity, 0, None).await.unwrap();

    fx.engine.inject_write_fault(WriteFault::Fail("disk full".to_string()));
    writer.write(json!({"n": 1})).await.unwrap();
    let err = writer.write(json!({"n": 2})).await.unwrap_err();
    assert!(matches!(err.root(), StorageError::Execution { .. }));
    assert!(err.to_string().contains("disk full"));

    writer.close().await.unwrap();
    let collection = LogicalEntity::Collection(writer.collection().clone());
    assert_eq!(fx.engine.stored_count(&collection), Some(0));
    assert_discarded(&fx, activity, 0).await;
}

#[tokio::test]
async fn test_abort_discards_flushed_rows() {
    let fx = common::fixture_with(common::rows_per_batch(2)).await;
    let activity = Uuid::new_v4();
    let mut writer = fx
        .manager
        .create_rel_checkpoint(activity, 0, &common::key_value(), true, None)
        .await
        .unwrap();
    writer.write_all((0..5).map(|i| vec![json!(0), json!(i.to_string())])).await.unwrap();
    assert_eq!(writer.flush_count(), 2);

    writer.abort().await.unwrap();
    let table = LogicalEntity::Table(writer.table().clone());
    assert_eq!(fx.engine.stored_count(&table), Some(0));
    assert!(matches!(
        writer.write(vec![json!(0), json!("late")]).await,
        Err(StorageError::IllegalState(_))
    ));
    assert_discarded(&fx, activity, 0).await;

    // A discarded checkpoint still goes away with its activity
    fx.manager.drop_checkpoints(activity).await.unwrap();
    assert!(!fx.manager.has_checkpoint(activity, 0));
}

#[tokio::test]
async fn test_aborted_graph_is_not_readable() {
    let fx = common::fixture().await;
    let activity = Uuid::new_v4();
    let mut writer = fx.manager.create_lpg_checkpoint(activity, 0, None).await.unwrap();
    writer.abort().await.unwrap();
    assert_discarded(&fx, activity, 0).await;
}

/// The checkpoint is closed, flagged as discarded and refused to readers
async fn assert_discarded(fx: &common::Fixture, activity: Uuid, output: usize) {
    let metadata = fx.manager.checkpoint_metadata(activity, output).unwrap();
    assert!(!metadata.is_open());
    assert!(metadata.is_discarded());

    let summary = fx
        .manager
        .checkpoints()
        .into_iter()
        .find(|c| c.activity_id == activity && c.output_index == output)
        .unwrap();
    assert!(summary.discarded);
    assert!(!summary.open);

    let err = fx.manager.read_checkpoint(activity, output).await.unwrap_err();
    assert!(matches!(err, StorageError::IllegalState(_)), "unexpected error: {}", err);
}
