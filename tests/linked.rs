#![cfg(feature = "memory-engine")]

mod common;

use futures::TryStreamExt;
use serde_json::json;
use stagestore::engine::memory::DdlEvent;
use stagestore::storage::ManagerOptions;
use stagestore::{DataModel, StorageError, Tuple};
use uuid::Uuid;

#[tokio::test]
async fn test_dropping_linked_checkpoint_keeps_its_entity() {
    let engine = common::engine();
    let producer = common::manager_on(&engine, ManagerOptions::default()).await;
    let consumer = common::manager_on(&engine, ManagerOptions::default()).await;

    let upstream = Uuid::new_v4();
    let mut writer = producer
        .create_rel_checkpoint(upstream, 0, &common::key_value(), true, None)
        .await
        .unwrap();
    writer.write_all((0..5).map(|i| vec![json!(0), json!(i.to_string())])).await.unwrap();
    writer.close().await.unwrap();
    let shared_name = writer.table().name.clone();

    let activity = Uuid::new_v4();
    let reader = producer.read_checkpoint(upstream, 0).await.unwrap();
    consumer.link_checkpoint(activity, 0, &reader).unwrap();
    assert!(consumer.is_linked(activity, 0));
    assert_eq!(consumer.data_model(activity, 0).unwrap(), DataModel::Relational);

    let mut owned = consumer
        .create_rel_checkpoint(activity, 1, &common::key_value(), true, None)
        .await
        .unwrap();
    owned.close().await.unwrap();
    let owned_name = owned.table().name.clone();
    assert!(consumer.has_all_checkpoints(activity, 2));

    engine.clear_history();
    consumer.drop_checkpoints(activity).await.unwrap();

    let dropped: Vec<String> = engine
        .ddl_history()
        .into_iter()
        .filter_map(|event| match event {
            DdlEvent::DroppedEntity { name, .. } => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(dropped, vec![owned_name]);
    assert!(!consumer.has_checkpoint(activity, 0));
    assert!(!consumer.is_linked(activity, 0));

    // The producer's table is intact
    let rows: Vec<Tuple> = reader.iter().await.unwrap().try_collect().await.unwrap();
    assert_eq!(rows.len(), 5);
    assert!(!dropped_contains(&engine, &shared_name));
    reader.close().await.unwrap();

    consumer.close().await.unwrap();
    producer.close().await.unwrap();
}

fn dropped_contains(engine: &stagestore::engine::memory::MemoryEngine, name: &str) -> bool {
    engine
        .ddl_history()
        .iter()
        .any(|e| matches!(e, DdlEvent::DroppedEntity { name: n, .. } if n == name))
}

#[tokio::test]
async fn test_linking_over_existing_output_is_rejected() {
    let fx = common::fixture().await;
    let activity = Uuid::new_v4();
    let mut writer = fx.manager.create_doc_checkpoint(activity, 0, None).await.unwrap();
    writer.write(json!({"a": 1})).await.unwrap();
    writer.close().await.unwrap();

    let reader = fx.manager.read_checkpoint(activity, 0).await.unwrap();
    let err = fx.manager.link_checkpoint(activity, 0, &reader).unwrap_err();
    assert!(matches!(err, StorageError::IllegalState(_)));
    reader.close().await.unwrap();
}
