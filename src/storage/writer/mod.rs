/// Batch writers for checkpoints
///
/// Each data model has its own writer; all of them buffer items in a `Batch`, flush
/// full batches synchronously as one insert plan inside the writer's own transaction,
/// and verify the affected count of every flush. Closing a writer flushes the remainder,
/// records counts in the metadata, closes the metadata and commits.

// Pending-item buffer and limits
pub mod batch;

// Relational writer
pub mod rel;

// Document writer
pub mod doc;

// Labeled property graph writer
pub mod lpg;

pub use batch::{BatchLimits, MAX_BYTES_PER_BATCH, MAX_TUPLES_PER_BATCH};
pub use doc::DocWriter;
pub use lpg::LpgWriter;
pub use rel::RelWriter;

use crate::engine::{AlgebraNode, Transaction};
use crate::error::{StorageError, StorageResult};
use crate::model::{DataModel, Tuple};
use crate::query::QueryBridge;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterStatus {
    Open,
    /// A flush failed; only `close`/`abort` remain allowed
    Failed,
    Closed,
}

/// Transaction handling and flush accounting shared by all writers
#[derive(Debug)]
pub(crate) struct WriterCore {
    bridge: QueryBridge,
    tx: Arc<dyn Transaction>,
    /// Quoted entity name used in errors
    entity: String,
    /// Human readable checkpoint description used in errors
    context: String,
    status: WriterStatus,
    flushes: usize,
}

impl WriterCore {
    pub(crate) fn new(bridge: QueryBridge, tx: Arc<dyn Transaction>, entity: String, context: String) -> Self {
        Self {
            bridge,
            tx,
            entity,
            context,
            status: WriterStatus::Open,
            flushes: 0,
        }
    }

    pub(crate) fn ensure_open(&self) -> StorageResult<()> {
        match self.status {
            WriterStatus::Open => Ok(()),
            WriterStatus::Failed => Err(StorageError::IllegalState(format!(
                "writer for {} failed earlier and must be closed or aborted",
                self.context
            ))),
            WriterStatus::Closed => Err(StorageError::IllegalState(format!(
                "writer for {} is already closed",
                self.context
            ))),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.status == WriterStatus::Closed
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.status == WriterStatus::Failed
    }

    pub(crate) fn flushes(&self) -> usize {
        self.flushes
    }

    /// Execute one insert plan of `expected` items
    ///
    /// Any failure marks the writer as failed and is wrapped with the checkpoint context.
    pub(crate) async fn flush(&mut self, plan: AlgebraNode, expected: usize) -> StorageResult<()> {
        match self.execute_insert(plan, expected as u64).await {
            Ok(()) => {
                self.flushes += 1;
                tracing::debug!("💾 Flushed {} items into {}", expected, self.entity);
                Ok(())
            }
            Err(e) => {
                self.status = WriterStatus::Failed;
                tracing::error!("❌ Flush into {} failed: {}", self.entity, e);
                Err(e.wrap(format!("flush of {} items for {}", expected, self.context)))
            }
        }
    }

    async fn execute_insert(&self, plan: AlgebraNode, expected: u64) -> StorageResult<()> {
        let result = self.bridge.execute_algebra(plan, self.tx.as_ref()).await?;
        let actual = result.affected.unwrap_or(0);
        if actual != expected {
            return Err(StorageError::PartialWrite {
                entity: self.entity.clone(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    pub(crate) async fn commit(&mut self) -> StorageResult<()> {
        self.status = WriterStatus::Closed;
        self.tx
            .commit()
            .await
            .map_err(|e| e.wrap(format!("commit of writer for {}", self.context)))
    }

    pub(crate) async fn rollback(&mut self, cause: &str) -> StorageResult<()> {
        self.status = WriterStatus::Closed;
        tracing::warn!("↩️ Rolling back writer for {}: {}", self.context, cause);
        self.tx.rollback(Some(cause)).await
    }
}

impl Drop for WriterCore {
    fn drop(&mut self) {
        if self.status != WriterStatus::Closed {
            tracing::warn!(
                "⚠️ Writer for {} dropped without close, pending writes are discarded",
                self.context
            );
        }
    }
}

/// Writer of any data model, as returned by `StorageManager::create_checkpoint`
#[derive(Debug)]
pub enum CheckpointWriter {
    Relational(RelWriter),
    Document(DocWriter),
    Graph(LpgWriter),
}

impl CheckpointWriter {
    pub fn data_model(&self) -> DataModel {
        match self {
            CheckpointWriter::Relational(_) => DataModel::Relational,
            CheckpointWriter::Document(_) => DataModel::Document,
            CheckpointWriter::Graph(_) => DataModel::Graph,
        }
    }

    /// Write a tuple of the writer's data model
    pub async fn write(&mut self, tuple: Tuple) -> StorageResult<()> {
        match (self, tuple) {
            (CheckpointWriter::Relational(w), Tuple::Row(row)) => w.write(row).await,
            (CheckpointWriter::Document(w), Tuple::Document(doc)) => w.write(doc).await,
            (CheckpointWriter::Graph(w), Tuple::Node(node)) => w.write_node(node).await,
            (CheckpointWriter::Graph(w), Tuple::Edge(edge)) => w.write_edge(edge).await,
            (writer, tuple) => Err(StorageError::TypeMismatch {
                expected: format!("{} tuple", writer.data_model()),
                actual: format!("{} tuple", tuple.data_model()),
            }),
        }
    }

    /// Number of tuples accepted so far
    pub fn written(&self) -> u64 {
        match self {
            CheckpointWriter::Relational(w) => w.written(),
            CheckpointWriter::Document(w) => w.written(),
            CheckpointWriter::Graph(w) => w.written(),
        }
    }

    pub async fn close(&mut self) -> StorageResult<()> {
        match self {
            CheckpointWriter::Relational(w) => w.close().await,
            CheckpointWriter::Document(w) => w.close().await,
            CheckpointWriter::Graph(w) => w.close().await,
        }
    }

    pub async fn abort(&mut self) -> StorageResult<()> {
        match self {
            CheckpointWriter::Relational(w) => w.abort().await,
            CheckpointWriter::Document(w) => w.abort().await,
            CheckpointWriter::Graph(w) => w.abort().await,
        }
    }
}
