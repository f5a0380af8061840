#![cfg(feature = "memory-engine")]

mod common;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::json;
use stagestore::engine::{NamespaceId, Transaction, TransactionManager};
use stagestore::storage::{ManagerOptions, StorageManager, TypePreview};
use stagestore::{
    CommonPhase, DataModel, Field, FieldType, RowType, StorageError, StorageResult, TransactionScope, Tuple,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

#[tokio::test]
async fn test_row_type_validation() {
    let fx = common::fixture().await;
    let activity = Uuid::new_v4();

    let empty = RowType::new(vec![]);
    let no_pk = RowType::new(vec![Field::new("value", FieldType::Text), Field::primary_key()]);
    let duplicate = RowType::new(vec![
        Field::primary_key(),
        Field::new("\"name\"", FieldType::Text),
        Field::new("name", FieldType::Text),
    ]);
    for row_type in [empty, no_pk, duplicate] {
        let result = fx.manager.create_rel_checkpoint(activity, 0, &row_type, false, None).await;
        assert!(matches!(result, Err(StorageError::InvalidArgument(_))));
    }
    assert!(!fx.manager.has_checkpoint(activity, 0));

    let unknown_store = fx
        .manager
        .create_rel_checkpoint(activity, 0, &common::key_value(), false, Some("tape"))
        .await;
    assert!(matches!(unknown_store, Err(StorageError::InvalidArgument(_))));

    // A quoted name is stored unquoted
    let quoted = RowType::new(vec![Field::primary_key(), Field::new("\"city\"", FieldType::Text)]);
    let mut writer = fx
        .manager
        .create_rel_checkpoint(activity, 0, &quoted, false, Some("archive"))
        .await
        .unwrap();
    writer.close().await.unwrap();
    assert_eq!(writer.table().row_type.field_names(), vec!["_key", "city"]);
}

#[tokio::test]
async fn test_unknown_default_store_rejects_session() {
    let engine = common::engine();
    let options = ManagerOptions {
        default_stores: HashMap::from([(DataModel::Document, "tape".to_string())]),
        ..ManagerOptions::default()
    };
    let result = StorageManager::new(Uuid::new_v4(), engine.handles(), options).await;
    assert!(matches!(result, Err(StorageError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_lookup_and_read_preconditions() {
    let fx = common::fixture().await;
    let activity = Uuid::new_v4();

    assert!(fx.manager.read_checkpoint(activity, 0).await.unwrap_err().is_not_found());
    assert!(fx.manager.data_model(activity, 0).unwrap_err().is_not_found());

    let mut writer = fx.manager.create_doc_checkpoint(activity, 0, None).await.unwrap();
    writer.write(json!({"a": 1})).await.unwrap();
    assert!(matches!(
        fx.manager.read_checkpoint(activity, 0).await,
        Err(StorageError::IllegalState(_))
    ));
    assert!(matches!(
        fx.manager.create_doc_checkpoint(activity, 0, None).await,
        Err(StorageError::IllegalState(_))
    ));
    writer.close().await.unwrap();

    let reader = fx.manager.read_checkpoint(activity, 0).await.unwrap();
    assert_eq!(reader.data_model(), DataModel::Document);
    assert_eq!(reader.metadata().tuple_count(), 1);
    reader.close().await.unwrap();

    assert!(fx.manager.has_all_checkpoints(activity, 0));
    assert!(fx.manager.has_all_checkpoints(activity, 1));
    assert!(!fx.manager.has_all_checkpoints(activity, 2));
    assert!(!fx.manager.has_all_checkpoints(activity, -1));
}

#[tokio::test]
async fn test_preview_types_have_gaps_for_missing_outputs() {
    let fx = common::fixture().await;
    let activity = Uuid::new_v4();
    assert!(fx.manager.checkpoint_preview_types(activity).is_empty());

    let mut rel = fx
        .manager
        .create_rel_checkpoint(activity, 0, &common::key_value(), true, None)
        .await
        .unwrap();
    rel.close().await.unwrap();

    // 25 distinct keys, only the first 20 are kept
    let document: serde_json::Map<String, serde_json::Value> =
        (0..25).map(|i| (format!("f{:02}", i), json!(i))).collect();
    let mut doc = fx.manager.create_doc_checkpoint(activity, 2, None).await.unwrap();
    doc.write(serde_json::Value::Object(document)).await.unwrap();
    doc.close().await.unwrap();

    let previews = fx.manager.checkpoint_preview_types(activity);
    assert_eq!(previews.len(), 3);
    assert!(matches!(&previews[0], Some(TypePreview::Relational { fields }) if fields.len() == 2));
    assert!(previews[1].is_none());
    match &previews[2] {
        Some(TypePreview::Document { fields, complete }) => {
            assert_eq!(fields.len(), 20);
            assert!(!complete);
        }
        other => panic!("unexpected preview {:?}", other),
    }

    // Closed metadata is frozen
    assert!(matches!(doc.metadata().add_field("late"), Err(StorageError::IllegalState(_))));
    assert!(matches!(rel.metadata().set_tuple_count(9), Err(StorageError::IllegalState(_))));
}

#[tokio::test]
async fn test_local_transactions_are_reused_until_finished() {
    let fx = common::fixture().await;
    let activity = Uuid::new_v4();

    let first = fx.manager.transaction(activity, TransactionScope::Local).await.unwrap();
    let again = fx.manager.transaction(activity, TransactionScope::Local).await.unwrap();
    assert_eq!(first.id(), again.id());

    fx.manager.commit_transaction(activity).await.unwrap();
    assert!(!first.is_active());
    let fresh = fx.manager.transaction(activity, TransactionScope::Local).await.unwrap();
    assert_ne!(fresh.id(), first.id());

    fx.manager.rollback_transaction(activity).await.unwrap();
    assert!(!fresh.is_active());
    // Nothing left to finish
    fx.manager.commit_transaction(activity).await.unwrap();
}

#[tokio::test]
async fn test_common_transactions_per_phase() {
    let fx = common::fixture().await;
    let activity = Uuid::new_v4();
    let extract = TransactionScope::Common(CommonPhase::Extract);

    assert!(matches!(
        fx.manager.transaction(activity, extract).await,
        Err(StorageError::IllegalState(_))
    ));
    assert!(matches!(
        fx.manager.commit_common(CommonPhase::Extract).await,
        Err(StorageError::IllegalState(_))
    ));

    fx.manager.start_common(CommonPhase::Extract).await.unwrap();
    assert!(fx.manager.is_common_active(CommonPhase::Extract));
    assert!(!fx.manager.is_common_active(CommonPhase::Load));
    assert!(matches!(
        fx.manager.start_common(CommonPhase::Extract).await,
        Err(StorageError::IllegalState(_))
    ));

    let a = fx.manager.transaction(activity, extract).await.unwrap();
    let b = fx.manager.transaction(Uuid::new_v4(), extract).await.unwrap();
    assert_eq!(a.id(), b.id());
    assert_eq!(a.origin(), "Workflow-Extract");

    fx.manager.commit_common(CommonPhase::Extract).await.unwrap();
    assert!(!fx.manager.is_common_active(CommonPhase::Extract));

    fx.manager.start_common(CommonPhase::Load).await.unwrap();
    fx.manager.rollback_common(CommonPhase::Load).await.unwrap();
    assert!(!fx.manager.is_common_active(CommonPhase::Load));
}

#[tokio::test]
async fn test_close_drops_everything_once() {
    let fx = common::fixture().await;
    let activity = Uuid::new_v4();

    let mut rel = fx
        .manager
        .create_rel_checkpoint(activity, 0, &common::key_value(), true, None)
        .await
        .unwrap();
    rel.write(vec![json!(0), json!("x")]).await.unwrap();
    rel.close().await.unwrap();
    let mut graph = fx.manager.create_lpg_checkpoint(activity, 1, None).await.unwrap();
    graph.close().await.unwrap();
    fx.manager.start_common(CommonPhase::Load).await.unwrap();

    let namespaces = fx.manager.registered_namespaces();
    assert_eq!(namespaces.len(), 3);

    fx.manager.close().await.unwrap();
    assert!(fx.manager.is_closed());
    let catalog = fx.engine.handles().catalog;
    for name in &namespaces {
        assert!(catalog.namespace_by_name(name).is_none(), "{} still exists", name);
    }
    assert!(fx.manager.registered_namespaces().is_empty());
    assert!(!fx.manager.is_common_active(CommonPhase::Load));

    fx.engine.clear_history();
    fx.manager.close().await.unwrap();
    assert!(fx.engine.ddl_history().is_empty());

    assert!(matches!(
        fx.manager.create_doc_checkpoint(activity, 5, None).await,
        Err(StorageError::IllegalState(_))
    ));
}

#[tokio::test]
async fn test_open_reader_blocks_namespace_teardown() {
    let fx = common::fixture().await;
    let activity = Uuid::new_v4();
    let mut writer = fx.manager.create_doc_checkpoint(activity, 0, None).await.unwrap();
    writer.write(json!({"k": "v"})).await.unwrap();
    writer.close().await.unwrap();

    let reader = fx.manager.read_checkpoint(activity, 0).await.unwrap();
    let err = fx.manager.close().await.unwrap_err();
    assert!(err.is_deadlock(), "unexpected error: {}", err);

    reader.close().await.unwrap();
    // The failed teardown was rolled back as a whole
    let catalog = fx.engine.handles().catalog;
    let namespaces = fx.manager.registered_namespaces();
    assert_eq!(namespaces.len(), 2);
    for name in &namespaces {
        assert!(catalog.namespace_by_name(name).is_some(), "{} was dropped", name);
    }
}

#[tokio::test]
async fn test_open_reader_blocks_checkpoint_drop() {
    let fx = common::fixture().await;
    let activity = Uuid::new_v4();
    let mut writer = fx
        .manager
        .create_rel_checkpoint(activity, 0, &common::key_value(), true, None)
        .await
        .unwrap();
    writer
        .write_all((0..5).map(|i| vec![json!(0), json!(i.to_string())]))
        .await
        .unwrap();
    writer.close().await.unwrap();

    let reader = fx.manager.read_checkpoint(activity, 0).await.unwrap();
    let err = fx.manager.drop_checkpoints(activity).await.unwrap_err();
    assert!(err.is_deadlock(), "unexpected error: {}", err);

    // The checkpoint survives and stays readable
    assert!(fx.manager.has_checkpoint(activity, 0));
    let rows: Vec<Tuple> = reader.as_rel().unwrap().iter_batched(2).unwrap().try_collect().await.unwrap();
    assert_eq!(rows.len(), 5);
    reader.close().await.unwrap();

    fx.manager.drop_checkpoints(activity).await.unwrap();
    assert!(!fx.manager.has_checkpoint(activity, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_activity_tasks() {
    let fx = common::fixture().await;
    let manager = Arc::new(fx.manager);
    let activity = Uuid::new_v4();

    let mut writers = Vec::new();
    for output in 0..8usize {
        let manager = Arc::clone(&manager);
        writers.push(tokio::spawn(async move {
            if output % 2 == 0 {
                let mut writer = manager
                    .create_rel_checkpoint(activity, output, &common::key_value(), true, None)
                    .await?;
                writer.write(vec![json!(0), json!(output.to_string())]).await?;
                writer.close().await
            } else {
                let mut writer = manager.create_doc_checkpoint(activity, output, None).await?;
                writer.write(json!({"output": output})).await?;
                writer.close().await
            }
        }));
    }
    let mut locals = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        locals.push(tokio::spawn(async move {
            manager.transaction(activity, TransactionScope::Local).await.map(|tx| tx.id())
        }));
    }

    for task in writers {
        task.await.unwrap().unwrap();
    }
    let mut ids = HashSet::new();
    for task in locals {
        ids.insert(task.await.unwrap().unwrap());
    }
    assert_eq!(ids.len(), 1);

    let summaries = manager.checkpoints();
    assert_eq!(summaries.len(), 8);
    let entities: HashSet<&str> = summaries.iter().map(|c| c.entity.as_str()).collect();
    assert_eq!(entities.len(), 8);
    for output in 0..8 {
        let metadata = manager.checkpoint_metadata(activity, output).unwrap();
        assert_eq!(metadata.tuple_count(), 1);
    }

    manager.close().await.unwrap();
    assert!(manager.checkpoints().is_empty());
    let catalog = fx.engine.handles().catalog;
    assert!(manager.registered_namespaces().is_empty());
    for summary in &summaries {
        assert!(
            catalog.namespaces().iter().all(|ns| catalog.entities(ns.id).iter().all(|e| e.name() != summary.entity)),
            "{} still exists",
            summary.entity
        );
    }
}

/// Transaction manager whose write transactions cannot be started
struct NoWriteTransactions {
    inner: Arc<dyn TransactionManager>,
}

#[async_trait]
impl TransactionManager for NoWriteTransactions {
    async fn start_transaction(&self, namespace: NamespaceId, origin: &str) -> StorageResult<Arc<dyn Transaction>> {
        if origin.ends_with("Write") {
            return Err(StorageError::execution(origin, "transaction limit reached"));
        }
        self.inner.start_transaction(namespace, origin).await
    }
}

#[tokio::test]
async fn test_failed_writer_start_leaves_no_checkpoint() {
    let engine = common::engine();
    let mut handles = engine.handles();
    handles.transactions = Arc::new(NoWriteTransactions {
        inner: Arc::clone(&handles.transactions),
    });
    let manager = StorageManager::new(Uuid::new_v4(), handles, ManagerOptions::default())
        .await
        .unwrap();
    let activity = Uuid::new_v4();

    let err = manager
        .create_rel_checkpoint(activity, 0, &common::key_value(), true, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("transaction limit reached"));
    assert!(matches!(
        manager.create_doc_checkpoint(activity, 1, None).await,
        Err(StorageError::Execution { .. })
    ));
    assert!(matches!(
        manager.create_lpg_checkpoint(activity, 2, None).await,
        Err(StorageError::Execution { .. })
    ));

    for output in 0..3 {
        assert!(!manager.has_checkpoint(activity, output));
    }
    assert!(manager.checkpoints().is_empty());
    let catalog = engine.handles().catalog;
    for name in manager.registered_namespaces() {
        let namespace = catalog.namespace_by_name(&name).unwrap();
        assert!(catalog.entities(namespace.id).is_empty(), "{} is not empty", name);
    }
    // Only the relational and document namespaces are left
    assert_eq!(manager.registered_namespaces().len(), 2);

    // Nothing is left behind for the failed output
    let err = manager.read_checkpoint(activity, 0).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_default_store_can_be_switched() {
    let fx = common::fixture().await;
    assert_eq!(fx.manager.default_store(DataModel::Relational), "memory");

    fx.manager.set_default_store(DataModel::Relational, "archive").unwrap();
    assert_eq!(fx.manager.default_store(DataModel::Relational), "archive");
    assert_eq!(fx.manager.default_store(DataModel::Document), "memory");

    assert!(matches!(
        fx.manager.set_default_store(DataModel::Graph, "tape"),
        Err(StorageError::InvalidArgument(_))
    ));
    assert_eq!(fx.manager.default_store(DataModel::Graph), "memory");
}
