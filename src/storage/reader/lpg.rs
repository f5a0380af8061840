/// Labeled property graph checkpoint reader
///
/// Streams nodes and edges separately or together, and can materialize the whole
/// checkpoint as a petgraph `DiGraph` for in-process graph algorithms.

use super::ReaderCore;
use crate::engine::{AlgebraNode, GraphElement, LogicalEntity, LogicalGraph, Query, QueryLanguage, TupleStream};
use crate::error::{StorageError, StorageResult};
use crate::model::{GraphEdge, GraphNode, Tuple, TupleType};
use crate::storage::metadata::LpgMetadata;
use futures::TryStreamExt;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
pub struct LpgReader {
    core: ReaderCore,
    graph: LogicalGraph,
    metadata: Arc<LpgMetadata>,
}

/// A graph checkpoint loaded into memory
#[derive(Debug)]
pub struct CheckpointGraph {
    pub graph: DiGraph<GraphNode, GraphEdge>,
    /// Mapping from node id to graph index
    pub node_index: HashMap<String, NodeIndex>,
}

impl CheckpointGraph {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.node_index.get(id).map(|&index| &self.graph[index])
    }
}

impl LpgReader {
    pub(crate) fn new(core: ReaderCore, graph: LogicalGraph, metadata: Arc<LpgMetadata>) -> Self {
        Self { core, graph, metadata }
    }

    pub fn graph(&self) -> &LogicalGraph {
        &self.graph
    }

    pub fn metadata(&self) -> &Arc<LpgMetadata> {
        &self.metadata
    }

    pub fn tuple_type(&self) -> TupleType {
        TupleType::Graph
    }

    /// All nodes followed by all edges
    pub async fn iter(&self) -> StorageResult<TupleStream> {
        self.core
            .stream(AlgebraNode::scan(LogicalEntity::Graph(self.graph.clone())))
            .await
    }

    pub async fn node_iter(&self) -> StorageResult<TupleStream> {
        self.scan(GraphElement::Nodes).await
    }

    pub async fn edge_iter(&self) -> StorageResult<TupleStream> {
        self.scan(GraphElement::Edges).await
    }

    async fn scan(&self, element: GraphElement) -> StorageResult<TupleStream> {
        self.core
            .stream(AlgebraNode::ScanGraph {
                graph: self.graph.clone(),
                element,
                label: None,
            })
            .await
    }

    /// Cypher `MATCH` that may only read this checkpoint's graph
    pub async fn iter_from_query(&self, cypher: &str) -> StorageResult<TupleStream> {
        let query = Query::text(QueryLanguage::Cypher, cypher, self.graph.namespace_id);
        self.core.stream_query(query, self.graph.id).await
    }

    /// Materialize the checkpoint as a directed graph
    pub async fn to_graph(&self) -> StorageResult<CheckpointGraph> {
        tracing::debug!("🏗️ Materializing graph checkpoint '{}'", self.graph.name);
        let mut graph = DiGraph::new();
        let mut node_index = HashMap::new();

        let nodes: Vec<Tuple> = self.node_iter().await?.try_collect().await?;
        for node in nodes.into_iter().filter_map(Tuple::into_node) {
            let id = node.id.clone();
            let index = graph.add_node(node);
            node_index.insert(id, index);
        }

        let edges: Vec<Tuple> = self.edge_iter().await?.try_collect().await?;
        for edge in edges.into_iter().filter_map(Tuple::into_edge) {
            let source = *node_index.get(&edge.source).ok_or_else(|| {
                StorageError::Validation(format!("edge '{}' references unknown node '{}'", edge.id, edge.source))
            })?;
            let target = *node_index.get(&edge.target).ok_or_else(|| {
                StorageError::Validation(format!("edge '{}' references unknown node '{}'", edge.id, edge.target))
            })?;
            graph.add_edge(source, target, edge);
        }

        tracing::debug!(
            "✅ Materialized '{}' with {} nodes and {} edges",
            self.graph.name,
            graph.node_count(),
            graph.edge_count()
        );
        Ok(CheckpointGraph { graph, node_index })
    }

    pub async fn close(&self) -> StorageResult<()> {
        self.core.close().await
    }
}
