/// Catalog and data of the in-process engine
///
/// One `EngineState` holds every namespace together with its tables, collections
/// and (for graph namespaces) its single graph. It sits behind a parking_lot RwLock
/// and is never held across an await point.

use crate::engine::{
    EntityId, LogicalCollection, LogicalEntity, LogicalGraph, LogicalNamespace, LogicalTable,
    NamespaceId,
};
use crate::error::{StorageError, StorageResult};
use crate::model::{GraphEdge, GraphNode};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Default)]
pub(crate) struct EngineState {
    next_id: u64,
    pub(crate) namespaces: BTreeMap<NamespaceId, NamespaceData>,
}

#[derive(Debug, Clone)]
pub(crate) struct NamespaceData {
    pub(crate) namespace: LogicalNamespace,
    pub(crate) tables: BTreeMap<String, TableData>,
    pub(crate) collections: BTreeMap<String, CollectionData>,
    pub(crate) graph: Option<GraphData>,
}

impl NamespaceData {
    pub(crate) fn new(namespace: LogicalNamespace) -> Self {
        Self {
            namespace,
            tables: BTreeMap::new(),
            collections: BTreeMap::new(),
            graph: None,
        }
    }

    pub(crate) fn entities(&self) -> Vec<LogicalEntity> {
        let mut entities: Vec<LogicalEntity> = self
            .tables
            .values()
            .map(|t| LogicalEntity::Table(t.table.clone()))
            .collect();
        entities.extend(
            self.collections
                .values()
                .map(|c| LogicalEntity::Collection(c.collection.clone())),
        );
        if let Some(graph) = &self.graph {
            entities.push(LogicalEntity::Graph(graph.graph.clone()));
        }
        entities
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TableData {
    pub(crate) table: LogicalTable,
    pub(crate) rows: Vec<Vec<Value>>,
    /// Serialized primary-key values of all stored rows
    pub(crate) keys: HashSet<String>,
}

impl TableData {
    pub(crate) fn new(table: LogicalTable) -> Self {
        Self {
            table,
            rows: Vec::new(),
            keys: HashSet::new(),
        }
    }

    pub(crate) fn pk_indices(&self) -> Vec<usize> {
        self.table
            .primary_key
            .iter()
            .filter_map(|name| self.table.row_type.index_of(name))
            .collect()
    }

    pub(crate) fn key_of(row: &[Value], pk_indices: &[usize]) -> String {
        let key: Vec<&Value> = pk_indices.iter().filter_map(|&i| row.get(i)).collect();
        serde_json::to_string(&key).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CollectionData {
    pub(crate) collection: LogicalCollection,
    pub(crate) documents: Vec<Value>,
}

#[derive(Debug, Clone)]
pub(crate) struct GraphData {
    pub(crate) graph: LogicalGraph,
    pub(crate) nodes: Vec<GraphNode>,
    pub(crate) edges: Vec<GraphEdge>,
    pub(crate) node_ids: HashSet<String>,
}

impl GraphData {
    pub(crate) fn new(graph: LogicalGraph) -> Self {
        Self {
            graph,
            nodes: Vec::new(),
            edges: Vec::new(),
            node_ids: HashSet::new(),
        }
    }
}

/// Compensation recorded by a transaction for every change it applied
#[derive(Debug)]
pub(crate) enum UndoEntry {
    CreatedNamespace(NamespaceId),
    CreatedTable { namespace: NamespaceId, name: String },
    CreatedCollection { namespace: NamespaceId, name: String },
    DroppedNamespace(Box<NamespaceData>),
    DroppedTable { namespace: NamespaceId, data: Box<TableData> },
    DroppedCollection { namespace: NamespaceId, data: Box<CollectionData> },
    InsertedRows { namespace: NamespaceId, table: String, count: usize },
    InsertedDocuments { namespace: NamespaceId, collection: String, count: usize },
    InsertedNodes { namespace: NamespaceId, count: usize },
    InsertedEdges { namespace: NamespaceId, count: usize },
}

impl EngineState {
    pub(crate) fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn namespace(&self, id: NamespaceId) -> Option<&NamespaceData> {
        self.namespaces.get(&id)
    }

    pub(crate) fn namespace_mut(&mut self, id: NamespaceId) -> StorageResult<&mut NamespaceData> {
        self.namespaces
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("namespace {}", id)))
    }

    pub(crate) fn namespace_by_name(&self, name: &str) -> Option<&NamespaceData> {
        self.namespaces.values().find(|ns| {
            if ns.namespace.case_sensitive {
                ns.namespace.name == name
            } else {
                ns.namespace.name.eq_ignore_ascii_case(name)
            }
        })
    }

    pub(crate) fn table(&self, namespace: NamespaceId, name: &str) -> Option<&TableData> {
        self.namespace(namespace).and_then(|ns| ns.tables.get(name))
    }

    pub(crate) fn table_mut(&mut self, namespace: NamespaceId, name: &str) -> StorageResult<&mut TableData> {
        self.namespace_mut(namespace)?
            .tables
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound(format!("table {}", name)))
    }

    pub(crate) fn collection(&self, namespace: NamespaceId, name: &str) -> Option<&CollectionData> {
        self.namespace(namespace).and_then(|ns| ns.collections.get(name))
    }

    pub(crate) fn collection_mut(
        &mut self,
        namespace: NamespaceId,
        name: &str,
    ) -> StorageResult<&mut CollectionData> {
        self.namespace_mut(namespace)?
            .collections
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound(format!("collection {}", name)))
    }

    pub(crate) fn graph(&self, id: EntityId) -> Option<&GraphData> {
        self.namespace(id).and_then(|ns| ns.graph.as_ref())
    }

    pub(crate) fn graph_mut(&mut self, id: EntityId) -> StorageResult<&mut GraphData> {
        self.namespace_mut(id)?
            .graph
            .as_mut()
            .ok_or_else(|| StorageError::NotFound(format!("graph {}", id)))
    }

    /// Whether the entity still exists under the same namespace and name
    pub(crate) fn contains(&self, entity: &LogicalEntity) -> bool {
        match entity {
            LogicalEntity::Table(t) => self.table(t.namespace_id, &t.name).is_some(),
            LogicalEntity::Collection(c) => self.collection(c.namespace_id, &c.name).is_some(),
            LogicalEntity::Graph(g) => self.graph(g.id).is_some(),
        }
    }

    /// Revert one recorded change; entries are replayed newest first
    pub(crate) fn undo(&mut self, entry: UndoEntry) {
        match entry {
            UndoEntry::CreatedNamespace(id) => {
                self.namespaces.remove(&id);
            }
            UndoEntry::CreatedTable { namespace, name } => {
                if let Some(ns) = self.namespaces.get_mut(&namespace) {
                    ns.tables.remove(&name);
                }
            }
            UndoEntry::CreatedCollection { namespace, name } => {
                if let Some(ns) = self.namespaces.get_mut(&namespace) {
                    ns.collections.remove(&name);
                }
            }
            UndoEntry::DroppedNamespace(data) => {
                self.namespaces.insert(data.namespace.id, *data);
            }
            UndoEntry::DroppedTable { namespace, data } => {
                if let Some(ns) = self.namespaces.get_mut(&namespace) {
                    ns.tables.insert(data.table.name.clone(), *data);
                }
            }
            UndoEntry::DroppedCollection { namespace, data } => {
                if let Some(ns) = self.namespaces.get_mut(&namespace) {
                    ns.collections.insert(data.collection.name.clone(), *data);
                }
            }
            UndoEntry::InsertedRows { namespace, table, count } => {
                if let Ok(data) = self.table_mut(namespace, &table) {
                    let pk_indices = data.pk_indices();
                    let keep = data.rows.len().saturating_sub(count);
                    for row in data.rows.drain(keep..) {
                        data.keys.remove(&TableData::key_of(&row, &pk_indices));
                    }
                }
            }
            UndoEntry::InsertedDocuments { namespace, collection, count } => {
                if let Ok(data) = self.collection_mut(namespace, &collection) {
                    let keep = data.documents.len().saturating_sub(count);
                    data.documents.truncate(keep);
                }
            }
            UndoEntry::InsertedNodes { namespace, count } => {
                if let Ok(graph) = self.graph_mut(namespace) {
                    let keep = graph.nodes.len().saturating_sub(count);
                    for node in graph.nodes.drain(keep..) {
                        graph.node_ids.remove(&node.id);
                    }
                }
            }
            UndoEntry::InsertedEdges { namespace, count } => {
                if let Ok(graph) = self.graph_mut(namespace) {
                    let keep = graph.edges.len().saturating_sub(count);
                    graph.edges.truncate(keep);
                }
            }
        }
    }
}
