/// Document checkpoint writer

use super::batch::{Batch, BatchLimits};
use super::WriterCore;
use crate::engine::{AlgebraNode, LogicalCollection};
use crate::error::{StorageError, StorageResult};
use crate::model::Tuple;
use crate::storage::metadata::DocMetadata;
use serde_json::Value;
use std::sync::Arc;

/// Writes JSON documents into the collection backing a document checkpoint
///
/// Top-level field names of every document are offered to the metadata; the preview
/// is capped, so wide collections end up with an incomplete field list.
#[derive(Debug)]
pub struct DocWriter {
    core: WriterCore,
    collection: LogicalCollection,
    metadata: Arc<DocMetadata>,
    batch: Batch<Value>,
    written: u64,
    flushed: u64,
}

impl DocWriter {
    pub(crate) fn new(
        core: WriterCore,
        collection: LogicalCollection,
        metadata: Arc<DocMetadata>,
        limits: BatchLimits,
    ) -> Self {
        Self {
            core,
            collection,
            metadata,
            batch: Batch::new(limits),
            written: 0,
            flushed: 0,
        }
    }

    pub fn collection(&self) -> &LogicalCollection {
        &self.collection
    }

    pub fn metadata(&self) -> &Arc<DocMetadata> {
        &self.metadata
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.batch.threshold()
    }

    pub fn flush_count(&self) -> usize {
        self.core.flushes()
    }

    pub async fn write(&mut self, document: Value) -> StorageResult<()> {
        self.core.ensure_open()?;
        if !document.is_object() {
            return Err(StorageError::InvalidArgument(format!(
                "documents must be JSON objects, got {}",
                document
            )));
        }
        // A false return only means the preview is incomplete
        self.metadata.add_fields(&document)?;

        self.written += 1;
        if self.batch.push(document, |d| Tuple::Document(d.clone())) {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn write_all<I>(&mut self, documents: I) -> StorageResult<()>
    where
        I: IntoIterator<Item = Value>,
    {
        for document in documents {
            self.write(document).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> StorageResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let documents = self.batch.take();
        let count = documents.len();
        let plan = AlgebraNode::InsertDocuments {
            collection: self.collection.clone(),
            documents,
        };
        self.core.flush(plan, count).await?;
        self.flushed += count as u64;
        self.metadata.set_tuple_count(self.flushed)?;
        Ok(())
    }

    pub async fn close(&mut self) -> StorageResult<()> {
        if self.core.is_closed() {
            return Ok(());
        }
        if self.core.has_failed() {
            self.batch.clear();
            self.metadata.discard();
            return self.core.rollback("closing writer after failed flush").await;
        }

        if let Err(e) = self.flush().await {
            self.batch.clear();
            self.metadata.discard();
            self.core.rollback("final flush failed").await?;
            return Err(e);
        }
        self.metadata.set_tuple_count(self.flushed)?;
        self.metadata.close();
        self.core.commit().await?;
        tracing::info!(
            "✅ Closed document checkpoint {} with {} documents",
            self.collection.name,
            self.flushed
        );
        Ok(())
    }

    pub async fn abort(&mut self) -> StorageResult<()> {
        if self.core.is_closed() {
            return Ok(());
        }
        self.batch.clear();
        self.metadata.discard();
        self.core.rollback("writer aborted").await
    }
}
