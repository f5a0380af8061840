/// Startup sweep for namespaces left behind by crashed sessions
///
/// The manifest pass is authoritative: every namespace recorded for a session that
/// never reached `closed_at` is dropped, then the session is marked closed. The
/// name-shape pass enumerates all namespaces and drops those whose names look like
/// checkpoint namespaces. It cannot tell a leftover from a user namespace that happens
/// to share the shape, so it only runs when explicitly enabled.

use crate::engine::{EngineHandles, LockType, LogicalEntity, Transaction};
use crate::error::{StorageError, StorageResult};
use crate::session::manifest::SessionManifest;
use crate::storage::naming;
use serde::Serialize;

const ORIGIN_CLEANUP: &str = "Workflow-Cleanup";

/// What a sweep removed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    /// Unclosed sessions whose namespaces were reclaimed
    pub sessions: usize,
    pub dropped_namespaces: Vec<String>,
    /// Namespaces that could not be dropped, with the reason
    pub failures: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drop leftovers of crashed sessions
///
/// Failures on single namespaces are collected in the report and do not stop the sweep;
/// only manifest I/O errors abort it.
pub async fn clear_all(
    handles: &EngineHandles,
    manifest: Option<&SessionManifest>,
    name_shape_sweep: bool,
) -> StorageResult<CleanupReport> {
    let mut report = CleanupReport::default();

    if let Some(manifest) = manifest {
        for session in manifest.unclosed_sessions().await? {
            let mut clean = true;
            for namespace in manifest.namespaces(&session.id).await? {
                match drop_namespace(handles, &namespace.name).await {
                    Ok(true) => report.dropped_namespaces.push(namespace.name),
                    Ok(false) => {}
                    Err(e) => {
                        clean = false;
                        tracing::error!("❌ Failed to drop namespace {} of session {}: {}", namespace.name, session.id, e);
                        report.failures.push(format!("{}: {}", namespace.name, e));
                    }
                }
            }
            if clean {
                manifest.mark_closed(&session.id).await?;
            }
            report.sessions += 1;
        }
    }

    if name_shape_sweep {
        let leftovers: Vec<String> = handles
            .catalog
            .namespaces()
            .into_iter()
            .map(|ns| ns.name)
            .filter(|name| naming::is_checkpoint_namespace(name))
            .collect();
        for name in leftovers {
            match drop_namespace(handles, &name).await {
                Ok(true) => report.dropped_namespaces.push(name),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("❌ Failed to drop namespace {}: {}", name, e);
                    report.failures.push(format!("{}: {}", name, e));
                }
            }
        }
    }

    if report.dropped_namespaces.is_empty() && report.failures.is_empty() {
        tracing::info!("🧹 Startup cleanup found nothing to remove");
    } else {
        tracing::info!(
            "🧹 Startup cleanup dropped {} namespaces from {} unclosed sessions ({} failures)",
            report.dropped_namespaces.len(),
            report.sessions,
            report.failures.len()
        );
    }
    Ok(report)
}

/// Drop all entities of a namespace, then the namespace; false if it no longer exists
async fn drop_namespace(handles: &EngineHandles, name: &str) -> StorageResult<bool> {
    let Some(namespace) = handles.catalog.namespace_by_name(name) else {
        return Ok(false);
    };
    let tx = handles.transactions.start_transaction(namespace.id, ORIGIN_CLEANUP).await?;
    let result = async {
        tx.acquire_lock(&namespace, LockType::Exclusive).await?;
        for entity in handles.catalog.entities(namespace.id) {
            match &entity {
                LogicalEntity::Table(table) => handles.ddl.drop_table(table, tx.as_ref()).await?,
                LogicalEntity::Collection(collection) => handles.ddl.drop_collection(collection, tx.as_ref()).await?,
                LogicalEntity::Graph(graph) => handles.ddl.drop_graph(graph.id, true, tx.as_ref()).await?,
            }
        }
        handles.ddl.drop_namespace(name, true, tx.as_ref()).await
    }
    .await;

    match result {
        Ok(()) => {
            tx.commit().await?;
            tracing::info!("🗑️ Dropped leftover namespace {}", name);
            Ok(true)
        }
        Err(e) => {
            rollback_quietly(tx.as_ref(), &e).await;
            Err(e)
        }
    }
}

async fn rollback_quietly(tx: &dyn Transaction, cause: &StorageError) {
    if tx.is_active() {
        if let Err(e) = tx.rollback(Some(&cause.to_string())).await {
            tracing::error!("❌ Rollback of {} failed: {}", tx.origin(), e);
        }
    }
}

#[cfg(all(test, feature = "memory-engine"))]
mod tests {
    use super::*;
    use crate::engine::memory::{DdlEvent, MemoryEngine};
    use crate::model::DataModel;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_name_shape_sweep_is_opt_in() {
        let engine = MemoryEngine::default();
        let handles = engine.handles();
        let leftover = naming::namespace_name(naming::REL_PREFIX, &Uuid::new_v4());
        handles
            .ddl
            .create_namespace(&leftover, DataModel::Relational, false, false)
            .await
            .unwrap();
        handles
            .ddl
            .create_namespace("analytics", DataModel::Relational, false, false)
            .await
            .unwrap();

        let report = clear_all(&handles, None, false).await.unwrap();
        assert!(report.dropped_namespaces.is_empty());
        assert!(handles.catalog.namespace_by_name(&leftover).is_some());

        let report = clear_all(&handles, None, true).await.unwrap();
        assert_eq!(report.dropped_namespaces, vec![leftover.clone()]);
        assert!(handles.catalog.namespace_by_name(&leftover).is_none());
        assert!(handles.catalog.namespace_by_name("analytics").is_some());
        assert!(engine.ddl_history().contains(&DdlEvent::DroppedNamespace(leftover)));
    }
}
