/// Transactions and schema locks of the in-process engine
///
/// Schema locks are tokio RwLocks created lazily per namespace. A transaction keeps
/// the owned guards until it commits or rolls back, so a lock always spans the whole
/// transaction. Changes are applied eagerly and compensated from an undo log on
/// rollback; a transaction dropped while still active rolls itself back.

use super::state::{EngineState, UndoEntry};
use crate::engine::{LockType, LogicalNamespace, NamespaceId, Transaction};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock as AsyncRwLock};

/// Lazily created lockables, one per namespace
#[derive(Debug, Default)]
pub(crate) struct LockRegistry {
    lockables: AsyncRwLock<HashMap<NamespaceId, Arc<AsyncRwLock<()>>>>,
}

impl LockRegistry {
    /// Get or create the lockable of a namespace
    pub(crate) async fn lockable(&self, namespace: NamespaceId) -> Arc<AsyncRwLock<()>> {
        // Fast path for namespaces that were locked before
        {
            let lockables = self.lockables.read().await;
            if let Some(lock) = lockables.get(&namespace) {
                return Arc::clone(lock);
            }
        }

        let mut lockables = self.lockables.write().await;

        // Double-check, another transaction might have created it meanwhile
        Arc::clone(
            lockables
                .entry(namespace)
                .or_insert_with(|| Arc::new(AsyncRwLock::new(()))),
        )
    }
}

#[derive(Debug)]
enum HeldLock {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// Transaction of the in-process engine
#[derive(Debug)]
pub struct MemoryTransaction {
    id: u64,
    origin: String,
    active: AtomicBool,
    statements: AtomicUsize,
    state: Arc<RwLock<EngineState>>,
    locks: Arc<LockRegistry>,
    lock_timeout: Duration,
    held: Mutex<HashMap<NamespaceId, HeldLock>>,
    undo: Mutex<Vec<UndoEntry>>,
}

impl MemoryTransaction {
    pub(crate) fn new(
        id: u64,
        origin: String,
        state: Arc<RwLock<EngineState>>,
        locks: Arc<LockRegistry>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            id,
            origin,
            active: AtomicBool::new(true),
            statements: AtomicUsize::new(0),
            state,
            locks,
            lock_timeout,
            held: Mutex::new(HashMap::new()),
            undo: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn ensure_active(&self) -> StorageResult<()> {
        if self.active.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::IllegalState(format!(
                "transaction {} ({}) is no longer active",
                self.id, self.origin
            )))
        }
    }

    /// Count a new statement against this transaction
    pub(crate) fn begin_statement(&self) -> StorageResult<()> {
        self.ensure_active()?;
        self.statements.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn record(&self, entry: UndoEntry) {
        self.undo.lock().push(entry);
    }

    fn undo_all(&self) {
        let entries: Vec<UndoEntry> = std::mem::take(&mut *self.undo.lock());
        if entries.is_empty() {
            return;
        }
        let mut state = self.state.write();
        for entry in entries.into_iter().rev() {
            state.undo(entry);
        }
    }

    fn release_locks(&self) {
        self.held.lock().clear();
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn id(&self) -> u64 {
        self.id
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn statement_count(&self) -> usize {
        self.statements.load(Ordering::SeqCst)
    }

    async fn acquire_lock(&self, namespace: &LogicalNamespace, lock: LockType) -> StorageResult<()> {
        self.ensure_active()?;

        {
            let mut held = self.held.lock();
            match (held.get(&namespace.id), lock) {
                (Some(HeldLock::Exclusive(_)), _) | (Some(HeldLock::Shared(_)), LockType::Shared) => {
                    return Ok(());
                }
                (Some(HeldLock::Shared(_)), LockType::Exclusive) => {
                    // Upgrade: give up the shared guard before queueing for the exclusive one
                    held.remove(&namespace.id);
                }
                (None, _) => {}
            }
        }

        let lockable = self.locks.lockable(namespace.id).await;
        let acquired = match lock {
            LockType::Shared => tokio::time::timeout(self.lock_timeout, lockable.read_owned())
                .await
                .map(HeldLock::Shared),
            LockType::Exclusive => tokio::time::timeout(self.lock_timeout, lockable.write_owned())
                .await
                .map(HeldLock::Exclusive),
        };

        let guard = acquired.map_err(|_| {
            tracing::warn!(
                "🔒 Transaction {} ({}) timed out waiting for {} lock on '{}'",
                self.id,
                self.origin,
                lock,
                namespace.name
            );
            StorageError::Deadlock {
                namespace: namespace.name.clone(),
                lock: lock.to_string(),
            }
        })?;

        tracing::debug!(
            "🔒 Transaction {} acquired {} lock on '{}'",
            self.id,
            lock,
            namespace.name
        );
        self.held.lock().insert(namespace.id, guard);
        Ok(())
    }

    async fn commit(&self) -> StorageResult<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Err(StorageError::IllegalState(format!(
                "cannot commit transaction {} ({}), it is no longer active",
                self.id, self.origin
            )));
        }
        self.undo.lock().clear();
        self.release_locks();
        tracing::debug!("✅ Committed transaction {} ({})", self.id, self.origin);
        Ok(())
    }

    async fn rollback(&self, cause: Option<&str>) -> StorageResult<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.undo_all();
        self.release_locks();
        tracing::debug!(
            "↩️ Rolled back transaction {} ({}): {}",
            self.id,
            self.origin,
            cause.unwrap_or("no cause given")
        );
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.active.swap(false, Ordering::SeqCst) {
            tracing::debug!(
                "↩️ Transaction {} ({}) dropped while active, rolling back",
                self.id,
                self.origin
            );
            self.undo_all();
        }
    }
}
