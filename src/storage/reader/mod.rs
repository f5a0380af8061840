/// Checkpoint readers
///
/// A reader owns a read transaction holding a SHARED lock on the checkpoint's
/// namespace. Every iterator it hands out is a lazy, single-pass `TupleStream`; streams
/// keep the transaction alive until they are dropped. `close()` commits the read
/// transaction and releases the lock, after which the reader refuses further use.

// Relational reader with keyset paging
pub mod rel;

// Document reader
pub mod doc;

// Labeled property graph reader
pub mod lpg;

pub use doc::DocReader;
pub use lpg::{CheckpointGraph, LpgReader};
pub use rel::RelReader;

use crate::engine::{AlgebraNode, EntityId, LogicalEntity, Query, Transaction, TupleStream};
use crate::error::{StorageError, StorageResult};
use crate::model::{DataModel, TupleType};
use crate::query::{validate_read_only, QueryBridge};
use crate::storage::metadata::CheckpointMetadata;
use parking_lot::Mutex;
use std::sync::Arc;

/// Read transaction handling shared by all readers
#[derive(Debug)]
pub(crate) struct ReaderCore {
    bridge: QueryBridge,
    tx: Arc<dyn Transaction>,
    context: String,
    closed: Mutex<bool>,
}

impl ReaderCore {
    pub(crate) fn new(bridge: QueryBridge, tx: Arc<dyn Transaction>, context: String) -> Self {
        Self {
            bridge,
            tx,
            context,
            closed: Mutex::new(false),
        }
    }

    pub(crate) fn bridge(&self) -> &QueryBridge {
        &self.bridge
    }

    pub(crate) fn transaction(&self) -> Arc<dyn Transaction> {
        Arc::clone(&self.tx)
    }

    pub(crate) fn ensure_open(&self) -> StorageResult<()> {
        if *self.closed.lock() {
            return Err(StorageError::IllegalState(format!(
                "reader for {} is already closed",
                self.context
            )));
        }
        Ok(())
    }

    /// Run a plan built by the reader itself
    pub(crate) async fn stream(&self, root: AlgebraNode) -> StorageResult<TupleStream> {
        self.ensure_open()?;
        let result = self
            .bridge
            .execute_algebra(root, self.tx.as_ref())
            .await
            .map_err(|e| e.wrap(format!("read of {}", self.context)))?;
        Ok(result.into_stream())
    }

    /// Run a caller-supplied query restricted to `entity`
    pub(crate) async fn stream_query(&self, query: Query, entity: EntityId) -> StorageResult<TupleStream> {
        self.ensure_open()?;
        let plan = self.bridge.parse_and_translate(query, self.tx.as_ref()).await?;
        validate_read_only(&plan, &[entity])?;
        let result = self
            .bridge
            .execute(&plan, self.tx.as_ref())
            .await
            .map_err(|e| e.wrap(format!("query on {}", self.context)))?;
        Ok(result.into_stream())
    }

    pub(crate) async fn close(&self) -> StorageResult<()> {
        {
            let mut closed = self.closed.lock();
            if *closed {
                return Ok(());
            }
            *closed = true;
        }
        if self.tx.is_active() {
            self.tx.commit().await?;
        }
        tracing::debug!("📕 Closed reader for {}", self.context);
        Ok(())
    }
}

/// Reader of any data model, as returned by `StorageManager::read_checkpoint`
#[derive(Debug)]
pub enum CheckpointReader {
    Relational(RelReader),
    Document(DocReader),
    Graph(LpgReader),
}

impl CheckpointReader {
    pub fn data_model(&self) -> DataModel {
        match self {
            CheckpointReader::Relational(_) => DataModel::Relational,
            CheckpointReader::Document(_) => DataModel::Document,
            CheckpointReader::Graph(_) => DataModel::Graph,
        }
    }

    pub fn tuple_type(&self) -> TupleType {
        match self {
            CheckpointReader::Relational(r) => r.tuple_type(),
            CheckpointReader::Document(r) => r.tuple_type(),
            CheckpointReader::Graph(r) => r.tuple_type(),
        }
    }

    /// The backing table, collection or graph
    pub fn entity(&self) -> LogicalEntity {
        match self {
            CheckpointReader::Relational(r) => LogicalEntity::Table(r.table().clone()),
            CheckpointReader::Document(r) => LogicalEntity::Collection(r.collection().clone()),
            CheckpointReader::Graph(r) => LogicalEntity::Graph(r.graph().clone()),
        }
    }

    pub fn metadata(&self) -> CheckpointMetadata {
        match self {
            CheckpointReader::Relational(r) => CheckpointMetadata::Relational(Arc::clone(r.metadata())),
            CheckpointReader::Document(r) => CheckpointMetadata::Document(Arc::clone(r.metadata())),
            CheckpointReader::Graph(r) => CheckpointMetadata::Graph(Arc::clone(r.metadata())),
        }
    }

    /// Every stored tuple; graphs yield all nodes followed by all edges
    pub async fn iter(&self) -> StorageResult<TupleStream> {
        match self {
            CheckpointReader::Relational(r) => r.iter().await,
            CheckpointReader::Document(r) => r.iter().await,
            CheckpointReader::Graph(r) => r.iter().await,
        }
    }

    /// Query in the reader's native language (SQL, MQL or Cypher)
    pub async fn iter_from_query(&self, query: &str) -> StorageResult<TupleStream> {
        match self {
            CheckpointReader::Relational(r) => r.iter_from_query(query).await,
            CheckpointReader::Document(r) => r.iter_from_query(query).await,
            CheckpointReader::Graph(r) => r.iter_from_query(query).await,
        }
    }

    pub fn as_rel(&self) -> StorageResult<&RelReader> {
        match self {
            CheckpointReader::Relational(r) => Ok(r),
            other => Err(other.mismatch(DataModel::Relational)),
        }
    }

    pub fn as_doc(&self) -> StorageResult<&DocReader> {
        match self {
            CheckpointReader::Document(r) => Ok(r),
            other => Err(other.mismatch(DataModel::Document)),
        }
    }

    pub fn as_lpg(&self) -> StorageResult<&LpgReader> {
        match self {
            CheckpointReader::Graph(r) => Ok(r),
            other => Err(other.mismatch(DataModel::Graph)),
        }
    }

    pub async fn close(&self) -> StorageResult<()> {
        match self {
            CheckpointReader::Relational(r) => r.close().await,
            CheckpointReader::Document(r) => r.close().await,
            CheckpointReader::Graph(r) => r.close().await,
        }
    }

    fn mismatch(&self, expected: DataModel) -> StorageError {
        StorageError::TypeMismatch {
            expected: format!("{} reader", expected),
            actual: format!("{} reader", self.data_model()),
        }
    }
}
