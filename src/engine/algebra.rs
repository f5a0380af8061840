/// Algebra trees, query descriptions and executable plans
///
/// Writers and paged readers build algebra trees directly; caller-supplied text
/// queries are translated into the same trees by the engine.

use super::{EntityId, LogicalCollection, LogicalEntity, LogicalGraph, LogicalTable, NamespaceId};
use crate::error::StorageResult;
use crate::model::{GraphEdge, GraphNode, Tuple};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lazy, single-pass stream of stored tuples
pub type TupleStream = BoxStream<'static, StorageResult<Tuple>>;

/// Text query languages understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryLanguage {
    Sql,
    Mql,
    Cypher,
}

impl QueryLanguage {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sql" => Some(QueryLanguage::Sql),
            "mql" | "mongo" => Some(QueryLanguage::Mql),
            "cypher" | "opencypher" => Some(QueryLanguage::Cypher),
            _ => None,
        }
    }
}

impl fmt::Display for QueryLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryLanguage::Sql => write!(f, "SQL"),
            QueryLanguage::Mql => write!(f, "MQL"),
            QueryLanguage::Cypher => write!(f, "Cypher"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

/// `field <op> value`
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub op: CompareOp,
    pub value: Value,
}

impl Predicate {
    pub fn new(field: impl Into<String>, op: CompareOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphElement {
    Nodes,
    Edges,
}

/// Logical operator tree
#[derive(Debug, Clone, PartialEq)]
pub enum AlgebraNode {
    /// Full scan of an entity; graphs yield all nodes followed by all edges
    Scan { entity: LogicalEntity },
    /// Scan only the nodes or edges of a graph, optionally restricted to one label
    ScanGraph {
        graph: LogicalGraph,
        element: GraphElement,
        label: Option<String>,
    },
    Filter {
        input: Box<AlgebraNode>,
        predicates: Vec<Predicate>,
    },
    Project {
        input: Box<AlgebraNode>,
        fields: Vec<String>,
    },
    Sort {
        input: Box<AlgebraNode>,
        field: String,
        descending: bool,
    },
    Limit {
        input: Box<AlgebraNode>,
        count: usize,
    },
    InsertRows {
        table: LogicalTable,
        rows: Vec<Vec<Value>>,
    },
    InsertDocuments {
        collection: LogicalCollection,
        documents: Vec<Value>,
    },
    InsertNodes {
        graph: LogicalGraph,
        nodes: Vec<GraphNode>,
    },
    InsertEdges {
        graph: LogicalGraph,
        edges: Vec<GraphEdge>,
    },
}

impl AlgebraNode {
    pub fn scan(entity: LogicalEntity) -> Self {
        AlgebraNode::Scan { entity }
    }

    pub fn filter(self, predicates: Vec<Predicate>) -> Self {
        AlgebraNode::Filter {
            input: Box::new(self),
            predicates,
        }
    }

    pub fn project(self, fields: Vec<String>) -> Self {
        AlgebraNode::Project {
            input: Box::new(self),
            fields,
        }
    }

    pub fn sort(self, field: impl Into<String>, descending: bool) -> Self {
        AlgebraNode::Sort {
            input: Box::new(self),
            field: field.into(),
            descending,
        }
    }

    pub fn limit(self, count: usize) -> Self {
        AlgebraNode::Limit {
            input: Box::new(self),
            count,
        }
    }

    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            AlgebraNode::InsertRows { .. }
                | AlgebraNode::InsertDocuments { .. }
                | AlgebraNode::InsertNodes { .. }
                | AlgebraNode::InsertEdges { .. }
        )
    }

    pub fn inputs(&self) -> Vec<&AlgebraNode> {
        match self {
            AlgebraNode::Filter { input, .. }
            | AlgebraNode::Project { input, .. }
            | AlgebraNode::Sort { input, .. }
            | AlgebraNode::Limit { input, .. } => vec![input.as_ref()],
            _ => Vec::new(),
        }
    }

    /// Entity read by this node itself (not by its inputs)
    pub fn scanned_entity(&self) -> Option<EntityId> {
        match self {
            AlgebraNode::Scan { entity } => Some(entity.id()),
            AlgebraNode::ScanGraph { graph, .. } => Some(graph.id),
            _ => None,
        }
    }

    /// Entity written by this node itself
    pub fn modified_entity(&self) -> Option<EntityId> {
        match self {
            AlgebraNode::InsertRows { table, .. } => Some(table.id),
            AlgebraNode::InsertDocuments { collection, .. } => Some(collection.id),
            AlgebraNode::InsertNodes { graph, .. } | AlgebraNode::InsertEdges { graph, .. } => Some(graph.id),
            _ => None,
        }
    }
}

/// Input of `QueryEngine::parse_and_translate`
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Text {
        language: QueryLanguage,
        text: String,
        namespace: NamespaceId,
    },
    Algebra(AlgebraNode),
}

impl Query {
    pub fn text(language: QueryLanguage, text: impl Into<String>, namespace: NamespaceId) -> Self {
        Query::Text {
            language,
            text: text.into(),
            namespace,
        }
    }

    pub fn sql(text: impl Into<String>, namespace: NamespaceId) -> Self {
        Query::text(QueryLanguage::Sql, text, namespace)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Query,
    Dml,
}

/// A validated plan ready for execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutablePlan {
    pub root: AlgebraNode,
    pub kind: PlanKind,
    /// Original query text, if the plan came from one
    pub source: Option<String>,
}

impl ExecutablePlan {
    pub fn new(root: AlgebraNode, source: Option<String>) -> Self {
        let kind = if root.is_dml() { PlanKind::Dml } else { PlanKind::Query };
        Self { root, kind, source }
    }
}

/// Outcome of executing a plan
pub struct ResultIterator {
    /// Number of affected tuples for DML plans
    pub affected: Option<u64>,
    tuples: TupleStream,
}

impl ResultIterator {
    pub fn from_tuples(tuples: Vec<Tuple>) -> Self {
        Self {
            affected: None,
            tuples: stream::iter(tuples.into_iter().map(Ok)).boxed(),
        }
    }

    pub fn from_stream(tuples: TupleStream) -> Self {
        Self { affected: None, tuples }
    }

    pub fn affected(count: u64) -> Self {
        Self {
            affected: Some(count),
            tuples: stream::empty::<StorageResult<Tuple>>().boxed(),
        }
    }

    pub fn into_stream(self) -> TupleStream {
        self.tuples
    }

    pub async fn collect_all(self) -> StorageResult<Vec<Tuple>> {
        self.tuples.try_collect().await
    }
}

impl fmt::Debug for ResultIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultIterator")
            .field("affected", &self.affected)
            .finish_non_exhaustive()
    }
}
