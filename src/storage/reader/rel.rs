/// Relational checkpoint reader
///
/// Besides full scans and pushed-down SQL, large tables can be read in pages keyed on a
/// unique sort column: each page asks for `sort_col > last_seen ORDER BY sort_col LIMIT n`
/// and iteration ends with the first short page. The async variant runs that loop on a
/// spawned task feeding a bounded channel of `2 × page_size` tuples.

use super::ReaderCore;
use crate::engine::{
    AlgebraNode, CompareOp, LogicalEntity, LogicalTable, Predicate, Query, Transaction, TupleStream,
};
use crate::error::{StorageError, StorageResult};
use crate::model::{Tuple, TupleType};
use crate::query::QueryBridge;
use crate::storage::metadata::RelMetadata;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Upper bound for the async reader's channel
const MAX_QUEUE_CAPACITY: usize = 1 << 20;

#[derive(Debug)]
pub struct RelReader {
    core: ReaderCore,
    table: LogicalTable,
    metadata: Arc<RelMetadata>,
}

/// Paging position carried between pages
struct PageCursor {
    bridge: QueryBridge,
    tx: Arc<dyn Transaction>,
    table: LogicalTable,
    sort_col: String,
    sort_idx: usize,
    page_size: usize,
    last: Option<Value>,
    done: bool,
}

impl PageCursor {
    async fn next_page(mut self) -> StorageResult<Option<(Vec<Tuple>, PageCursor)>> {
        if self.done {
            return Ok(None);
        }

        let mut plan = AlgebraNode::scan(LogicalEntity::Table(self.table.clone()));
        if let Some(last) = &self.last {
            plan = plan.filter(vec![Predicate::new(self.sort_col.clone(), CompareOp::Gt, last.clone())]);
        }
        let plan = plan.sort(self.sort_col.clone(), false).limit(self.page_size);

        let page = self
            .bridge
            .execute_algebra(plan, self.tx.as_ref())
            .await?
            .collect_all()
            .await?;

        if page.len() < self.page_size {
            self.done = true;
        }
        if page.is_empty() {
            return Ok(None);
        }
        match page.last().and_then(|t| t.as_row()).and_then(|row| row.get(self.sort_idx)) {
            Some(value) if !value.is_null() => self.last = Some(value.clone()),
            _ => {
                return Err(StorageError::IllegalState(format!(
                    "sort column '{}' of {} yielded no value to continue paging from",
                    self.sort_col, self.table.name
                )))
            }
        }
        tracing::debug!("📄 Read page of {} rows from {}", page.len(), self.table.name);
        Ok(Some((page, self)))
    }
}

impl RelReader {
    pub(crate) fn new(core: ReaderCore, table: LogicalTable, metadata: Arc<RelMetadata>) -> Self {
        Self { core, table, metadata }
    }

    pub fn table(&self) -> &LogicalTable {
        &self.table
    }

    pub fn metadata(&self) -> &Arc<RelMetadata> {
        &self.metadata
    }

    pub fn tuple_type(&self) -> TupleType {
        TupleType::Relational(self.table.row_type.clone())
    }

    pub async fn iter(&self) -> StorageResult<TupleStream> {
        self.core
            .stream(AlgebraNode::scan(LogicalEntity::Table(self.table.clone())))
            .await
    }

    /// SQL query that may only read this checkpoint's table
    pub async fn iter_from_query(&self, sql: &str) -> StorageResult<TupleStream> {
        self.core
            .stream_query(Query::sql(sql, self.table.namespace_id), self.table.id)
            .await
    }

    /// Pages keyed on the primary-key column
    pub fn iter_batched(&self, page_size: usize) -> StorageResult<TupleStream> {
        let pk = self
            .table
            .row_type
            .fields
            .first()
            .map(|f| f.name.clone())
            .ok_or_else(|| StorageError::IllegalState(format!("table {} has no columns", self.table.name)))?;
        self.iter_batched_by(&pk, page_size)
    }

    /// Pages keyed on `sort_col`, which must hold unique non-null values
    pub fn iter_batched_by(&self, sort_col: &str, page_size: usize) -> StorageResult<TupleStream> {
        self.core.ensure_open()?;
        if page_size == 0 {
            return Err(StorageError::InvalidArgument("page size must be at least 1".to_string()));
        }
        let sort_idx = self.table.row_type.index_of(sort_col).ok_or_else(|| {
            StorageError::InvalidArgument(format!("table {} has no column '{}'", self.table.name, sort_col))
        })?;

        let cursor = PageCursor {
            bridge: self.core.bridge().clone(),
            tx: self.core.transaction(),
            table: self.table.clone(),
            sort_col: sort_col.to_string(),
            sort_idx,
            page_size,
            last: None,
            done: false,
        };
        let pages = stream::try_unfold(cursor, PageCursor::next_page);
        Ok(pages
            .map_ok(|page| stream::iter(page.into_iter().map(Ok::<Tuple, StorageError>)))
            .try_flatten()
            .boxed())
    }

    /// Same pages as `iter_batched`, produced ahead by a background task
    ///
    /// The producer is spawned on the current Tokio runtime; outside one this returns
    /// `IllegalState`.
    pub fn iter_batched_async(&self, page_size: usize) -> StorageResult<TupleStream> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            StorageError::IllegalState(format!("background paging of {} needs a Tokio runtime", self.table.name))
        })?;
        let mut pages = self.iter_batched(page_size)?;
        let capacity = page_size.saturating_mul(2).min(MAX_QUEUE_CAPACITY);
        let (sender, receiver) = mpsc::channel::<StorageResult<Tuple>>(capacity);
        let table = self.table.name.clone();

        runtime.spawn(async move {
            while let Some(item) = pages.next().await {
                let failed = item.is_err();
                if sender.send(item).await.is_err() {
                    tracing::debug!("📭 Consumer of {} went away, stopping producer", table);
                    break;
                }
                if failed {
                    break;
                }
            }
        });

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    pub async fn close(&self) -> StorageResult<()> {
        self.core.close().await
    }
}
