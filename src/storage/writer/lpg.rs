/// Labeled property graph checkpoint writer

use super::batch::{Batch, BatchLimits};
use super::WriterCore;
use crate::engine::{AlgebraNode, LogicalGraph};
use crate::error::StorageResult;
use crate::model::{GraphEdge, GraphNode, Tuple};
use crate::storage::metadata::LpgMetadata;
use std::sync::Arc;

/// Writes nodes and edges into the graph backing a graph checkpoint
///
/// Nodes and edges live in two independent batches with their own thresholds, each
/// flushed as its own insert plan. Node and edge counts in the metadata follow every
/// flush.
#[derive(Debug)]
pub struct LpgWriter {
    core: WriterCore,
    graph: LogicalGraph,
    metadata: Arc<LpgMetadata>,
    nodes: Batch<GraphNode>,
    edges: Batch<GraphEdge>,
    written_nodes: u64,
    written_edges: u64,
    flushed_nodes: u64,
    flushed_edges: u64,
}

impl LpgWriter {
    pub(crate) fn new(core: WriterCore, graph: LogicalGraph, metadata: Arc<LpgMetadata>, limits: BatchLimits) -> Self {
        Self {
            core,
            graph,
            metadata,
            nodes: Batch::new(limits),
            edges: Batch::new(limits),
            written_nodes: 0,
            written_edges: 0,
            flushed_nodes: 0,
            flushed_edges: 0,
        }
    }

    pub fn graph(&self) -> &LogicalGraph {
        &self.graph
    }

    pub fn metadata(&self) -> &Arc<LpgMetadata> {
        &self.metadata
    }

    /// Nodes plus edges accepted so far
    pub fn written(&self) -> u64 {
        self.written_nodes + self.written_edges
    }

    pub fn node_batch_size(&self) -> Option<usize> {
        self.nodes.threshold()
    }

    pub fn edge_batch_size(&self) -> Option<usize> {
        self.edges.threshold()
    }

    pub fn flush_count(&self) -> usize {
        self.core.flushes()
    }

    pub async fn write_node(&mut self, node: GraphNode) -> StorageResult<()> {
        self.core.ensure_open()?;
        self.metadata.add_node_labels(&node.labels)?;
        self.written_nodes += 1;
        if self.nodes.push(node, |n| Tuple::Node(n.clone())) {
            self.flush_nodes().await?;
        }
        Ok(())
    }

    pub async fn write_edge(&mut self, edge: GraphEdge) -> StorageResult<()> {
        self.core.ensure_open()?;
        self.metadata.add_edge_labels(&edge.labels)?;
        self.written_edges += 1;
        if self.edges.push(edge, |e| Tuple::Edge(e.clone())) {
            self.flush_edges().await?;
        }
        Ok(())
    }

    pub async fn write_nodes<I>(&mut self, nodes: I) -> StorageResult<()>
    where
        I: IntoIterator<Item = GraphNode>,
    {
        for node in nodes {
            self.write_node(node).await?;
        }
        Ok(())
    }

    pub async fn write_edges<I>(&mut self, edges: I) -> StorageResult<()>
    where
        I: IntoIterator<Item = GraphEdge>,
    {
        for edge in edges {
            self.write_edge(edge).await?;
        }
        Ok(())
    }

    async fn flush_nodes(&mut self) -> StorageResult<()> {
        if self.nodes.is_empty() {
            return Ok(());
        }
        let count = self.nodes.len();
        let plan = AlgebraNode::InsertNodes {
            graph: self.graph.clone(),
            nodes: self.nodes.take(),
        };
        self.core.flush(plan, count).await?;
        self.flushed_nodes += count as u64;
        self.metadata.set_node_count(self.flushed_nodes)
    }

    async fn flush_edges(&mut self) -> StorageResult<()> {
        if self.edges.is_empty() {
            return Ok(());
        }
        let count = self.edges.len();
        let plan = AlgebraNode::InsertEdges {
            graph: self.graph.clone(),
            edges: self.edges.take(),
        };
        self.core.flush(plan, count).await?;
        self.flushed_edges += count as u64;
        self.metadata.set_edge_count(self.flushed_edges)
    }

    /// Flush pending nodes, then pending edges, then commit
    pub async fn close(&mut self) -> StorageResult<()> {
        if self.core.is_closed() {
            return Ok(());
        }
        if self.core.has_failed() {
            self.nodes.clear();
            self.edges.clear();
            self.metadata.discard();
            return self.core.rollback("closing writer after failed flush").await;
        }

        let flushed = match self.flush_nodes().await {
            Ok(()) => self.flush_edges().await,
            Err(e) => Err(e),
        };
        if let Err(e) = flushed {
            self.nodes.clear();
            self.edges.clear();
            self.metadata.discard();
            self.core.rollback("final flush failed").await?;
            return Err(e);
        }
        self.metadata.set_node_count(self.flushed_nodes)?;
        self.metadata.set_edge_count(self.flushed_edges)?;
        self.metadata.close();
        self.core.commit().await?;
        tracing::info!(
            "✅ Closed graph checkpoint {} with {} nodes and {} edges",
            self.graph.name,
            self.flushed_nodes,
            self.flushed_edges
        );
        Ok(())
    }

    pub async fn abort(&mut self) -> StorageResult<()> {
        if self.core.is_closed() {
            return Ok(());
        }
        self.nodes.clear();
        self.edges.clear();
        self.metadata.discard();
        self.core.rollback("writer aborted").await
    }
}
