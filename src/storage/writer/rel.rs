/// Relational checkpoint writer

use super::batch::{Batch, BatchLimits};
use super::WriterCore;
use crate::engine::{AlgebraNode, LogicalTable};
use crate::error::{StorageError, StorageResult};
use crate::model::Tuple;
use crate::storage::metadata::RelMetadata;
use serde_json::Value;
use std::sync::Arc;

/// Writes rows into the table backing a relational checkpoint
///
/// In primary-key reset mode the writer overwrites column 0 of every row with its own
/// surrogate keys `0, 1, 2, ...`. This is only accepted when the table's primary key is
/// the single numeric column at index 0.
#[derive(Debug)]
pub struct RelWriter {
    core: WriterCore,
    table: LogicalTable,
    metadata: Arc<RelMetadata>,
    batch: Batch<Vec<Value>>,
    reset_pk: bool,
    next_key: i64,
    written: u64,
    flushed: u64,
}

impl RelWriter {
    pub(crate) fn new(
        core: WriterCore,
        table: LogicalTable,
        metadata: Arc<RelMetadata>,
        reset_pk: bool,
        limits: BatchLimits,
    ) -> StorageResult<Self> {
        if reset_pk {
            let single_numeric_pk = table.primary_key.len() == 1
                && table
                    .row_type
                    .fields
                    .first()
                    .is_some_and(|f| f.is_pk_col() && table.primary_key[0] == f.name);
            if !single_numeric_pk {
                return Err(StorageError::InvalidArgument(format!(
                    "primary key reset requires a single numeric key column, table {} has {:?}",
                    table.name, table.primary_key
                )));
            }
        }
        Ok(Self {
            core,
            table,
            metadata,
            batch: Batch::new(limits),
            reset_pk,
            next_key: 0,
            written: 0,
            flushed: 0,
        })
    }

    pub fn table(&self) -> &LogicalTable {
        &self.table
    }

    pub fn metadata(&self) -> &Arc<RelMetadata> {
        &self.metadata
    }

    /// Rows accepted by `write`
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Batch threshold, fixed by the first written row
    pub fn batch_size(&self) -> Option<usize> {
        self.batch.threshold()
    }

    pub fn flush_count(&self) -> usize {
        self.core.flushes()
    }

    pub async fn write(&mut self, mut row: Vec<Value>) -> StorageResult<()> {
        self.core.ensure_open()?;
        let width = self.table.row_type.field_count();
        if row.len() != width {
            return Err(StorageError::InvalidArgument(format!(
                "row has {} values but table {} has {} columns",
                row.len(),
                self.table.name,
                width
            )));
        }
        if self.reset_pk {
            row[0] = Value::from(self.next_key);
            self.next_key += 1;
        }

        self.written += 1;
        if self.batch.push(row, |r| Tuple::Row(r.clone())) {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn write_all<I>(&mut self, rows: I) -> StorageResult<()>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        for row in rows {
            self.write(row).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> StorageResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let rows = self.batch.take();
        let count = rows.len();
        let plan = AlgebraNode::InsertRows {
            table: self.table.clone(),
            rows,
        };
        self.core.flush(plan, count).await?;
        self.flushed += count as u64;
        Ok(())
    }

    /// Flush the remainder, finalize the metadata and commit
    ///
    /// Calling `close` again is a no-op. A writer whose flush failed is rolled back instead
    /// and its metadata is discarded, so the checkpoint can no longer be read.
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
            "✅ Closed relational checkpoint {} with {} rows in {} flushes",
            self.table.name,
            self.flushed,
            self.core.flushes()
        );
        Ok(())
    }

    /// Discard pending rows and roll back everything flushed so far
    pub async fn abort(&mut self) -> StorageResult<()> {
        if self.core.is_closed() {
            return Ok(());
        }
        self.batch.clear();
        self.metadata.discard();
        self.core.rollback("writer aborted").await
    }
}
