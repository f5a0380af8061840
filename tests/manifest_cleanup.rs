#![cfg(feature = "memory-engine")]

mod common;

use serde_json::json;
use stagestore::session::SessionManifest;
use stagestore::storage::{clear_all, ManagerOptions};
use stagestore::DataModel;
use tempfile::TempDir;
use uuid::Uuid;

async fn manifest(dir: &TempDir) -> SessionManifest {
    SessionManifest::open_in(dir.path()).await.unwrap()
}

fn with_manifest(manifest: &SessionManifest) -> ManagerOptions {
    ManagerOptions {
        manifest: Some(manifest.clone()),
        ..ManagerOptions::default()
    }
}

#[tokio::test]
async fn test_crashed_session_is_reclaimed_and_closed_one_is_not() {
    let dir = TempDir::new().unwrap();
    let manifest = manifest(&dir).await;
    let engine = common::engine();
    let handles = engine.handles();

    // A session that shuts down cleanly
    let closed = common::manager_on(&engine, with_manifest(&manifest)).await;
    closed.close().await.unwrap();

    // A session that never gets to close
    let crashed = common::manager_on(&engine, with_manifest(&manifest)).await;
    let crashed_id = crashed.session_id();
    let activity = Uuid::new_v4();
    let mut rel = crashed
        .create_rel_checkpoint(activity, 0, &common::key_value(), true, None)
        .await
        .unwrap();
    rel.write(vec![json!(0), json!("left behind")]).await.unwrap();
    rel.close().await.unwrap();
    let mut graph = crashed.create_lpg_checkpoint(activity, 1, None).await.unwrap();
    graph.close().await.unwrap();
    let leftovers = crashed.registered_namespaces();
    drop(crashed);

    let recorded = manifest.namespaces(&crashed_id).await.unwrap();
    assert_eq!(recorded.len(), 3);
    assert!(recorded.iter().any(|ns| ns.data_model == DataModel::Graph));

    // Unrelated namespace shaped like a checkpoint namespace
    let lookalike = format!("rel_{}", Uuid::new_v4().simple());
    handles
        .ddl
        .create_namespace(&lookalike, DataModel::Relational, false, false)
        .await
        .unwrap();

    engine.clear_history();
    let report = clear_all(&handles, Some(&manifest), false).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.sessions, 1);
    let mut dropped = report.dropped_namespaces.clone();
    dropped.sort();
    let mut expected = leftovers.clone();
    expected.sort();
    assert_eq!(dropped, expected);

    for name in &leftovers {
        assert!(handles.catalog.namespace_by_name(name).is_none());
    }
    assert!(handles.catalog.namespace_by_name(&lookalike).is_some());
    assert!(manifest.unclosed_sessions().await.unwrap().is_empty());
    assert!(manifest.session(&crashed_id).await.unwrap().unwrap().closed_at.is_some());

    // Nothing left for a second sweep
    let again = clear_all(&handles, Some(&manifest), false).await.unwrap();
    assert_eq!(again.sessions, 0);
    assert!(again.dropped_namespaces.is_empty());
}

#[tokio::test]
async fn test_manifest_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let session_id = {
        let manifest = manifest(&dir).await;
        let engine = common::engine();
        let manager = common::manager_on(&engine, with_manifest(&manifest)).await;
        manager.session_id()
    };

    let reopened = manifest(&dir).await;
    let unclosed = reopened.unclosed_sessions().await.unwrap();
    assert_eq!(unclosed.len(), 1);
    assert_eq!(unclosed[0].id, session_id);
    assert!(reopened.session(&Uuid::new_v4()).await.unwrap().is_none());
}
