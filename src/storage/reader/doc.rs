/// Document checkpoint reader

use super::ReaderCore;
use crate::engine::{AlgebraNode, LogicalCollection, LogicalEntity, Query, QueryLanguage, TupleStream};
use crate::error::StorageResult;
use crate::model::TupleType;
use crate::storage::metadata::DocMetadata;
use std::sync::Arc;

#[derive(Debug)]
pub struct DocReader {
    core: ReaderCore,
    collection: LogicalCollection,
    metadata: Arc<DocMetadata>,
}

impl DocReader {
    pub(crate) fn new(core: ReaderCore, collection: LogicalCollection, metadata: Arc<DocMetadata>) -> Self {
        Self {
            core,
            collection,
            metadata,
        }
    }

    pub fn collection(&self) -> &LogicalCollection {
        &self.collection
    }

    pub fn metadata(&self) -> &Arc<DocMetadata> {
        &self.metadata
    }

    pub fn tuple_type(&self) -> TupleType {
        TupleType::Document
    }

    pub async fn iter(&self) -> StorageResult<TupleStream> {
        self.core
            .stream(AlgebraNode::scan(LogicalEntity::Collection(self.collection.clone())))
            .await
    }

    /// MQL `find` that may only read this checkpoint's collection
    pub async fn iter_from_query(&self, mql: &str) -> StorageResult<TupleStream> {
        let query = Query::text(QueryLanguage::Mql, mql, self.collection.namespace_id);
        self.core.stream_query(query, self.collection.id).await
    }

    pub async fn close(&self) -> StorageResult<()> {
        self.core.close().await
    }
}
