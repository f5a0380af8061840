/// Lock-free registry of live storage sessions using ArcSwap
///
/// Every open/close swaps the whole map pointer, so lookups from request handlers
/// never block while sessions come and go.

use crate::engine::EngineHandles;
use crate::model::DataModel;
use crate::session::manifest::SessionManifest;
use crate::storage::{BatchLimits, ManagerOptions, StorageManager};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};
use uuid::Uuid;

/// Process-wide map of session id to storage manager
#[derive(Debug)]
pub struct SessionRegistry {
    /// Key: session id, Value: the session's storage manager
    sessions: ArcSwap<HashMap<Uuid, Arc<StorageManager>>>,

    /// Engine every session stores its checkpoints in
    handles: EngineHandles,

    batch_limits: BatchLimits,

    /// Present when sessions should be recorded for crash recovery
    manifest: Option<SessionManifest>,
}

impl SessionRegistry {
    pub fn new(handles: EngineHandles, batch_limits: BatchLimits, manifest: Option<SessionManifest>) -> Self {
        Self {
            sessions: ArcSwap::new(Arc::new(HashMap::new())),
            handles,
            batch_limits,
            manifest,
        }
    }

    pub fn handles(&self) -> &EngineHandles {
        &self.handles
    }

    pub fn manifest(&self) -> Option<&SessionManifest> {
        self.manifest.as_ref()
    }

    /// Open a new session and register its storage manager
    pub async fn open_session(&self, default_stores: HashMap<DataModel, String>) -> Result<Arc<StorageManager>> {
        let session_id = Uuid::new_v4();
        let options = ManagerOptions {
            default_stores,
            batch_limits: self.batch_limits,
            manifest: self.manifest.clone(),
        };
        let manager = Arc::new(StorageManager::new(session_id, self.handles.clone(), options).await?);
        self.insert(Arc::clone(&manager));
        Ok(manager)
    }

    /// Register an already constructed manager
    pub fn insert(&self, manager: Arc<StorageManager>) {
        // Retried against the latest map if another open or close swapped it meanwhile
        self.sessions.rcu(|current| {
            let mut sessions = (**current).clone();
            sessions.insert(manager.session_id(), Arc::clone(&manager));
            sessions
        });
    }

    /// Lock-free lookup
    pub fn get(&self, session_id: &Uuid) -> Option<Arc<StorageManager>> {
        self.sessions.load().get(session_id).cloned()
    }

    pub fn list_session_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.sessions.load().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.load().is_empty()
    }

    /// Unregister a session and tear down its storage
    ///
    /// Returns false if the session is unknown.
    pub async fn close_session(&self, session_id: &Uuid) -> Result<bool> {
        let mut removed = None;
        self.sessions.rcu(|current| {
            let mut sessions = (**current).clone();
            removed = sessions.remove(session_id);
            sessions
        });
        let Some(manager) = removed else {
            return Ok(false);
        };

        manager.close().await?;
        tracing::info!("🗑️ Closed session {}", session_id);
        Ok(true)
    }

    /// Close every session, used on shutdown
    pub async fn close_all(&self) -> Result<()> {
        let sessions = self.sessions.swap(Arc::new(HashMap::new()));
        let mut failed = 0;
        for (id, manager) in sessions.iter() {
            if let Err(e) = manager.close().await {
                failed += 1;
                tracing::error!("❌ Failed to close session {}: {}", id, e);
            }
        }
        if failed > 0 {
            anyhow::bail!("{} of {} sessions failed to close", failed, sessions.len());
        }
        Ok(())
    }
}
