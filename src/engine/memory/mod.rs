/// In-process reference engine
///
/// Implements every collaborator trait on top of a single in-memory state. It backs the
/// bundled binary and the test suite, and records DDL calls and executed writes so the
/// storage layer's behavior can be observed from the outside. Write faults can be
/// injected to exercise partial-write and execution-failure paths.

mod executor;
mod parser;
mod state;
mod transaction;

pub use transaction::MemoryTransaction;

use crate::engine::{
    AdapterRegistry, AlgebraNode, Catalog, CollectionDefinition, ConstraintType, DdlManager, EngineHandles,
    EntityId, ExecutablePlan, GraphDefinition, LogicalCollection, LogicalEntity, LogicalGraph,
    LogicalNamespace, LogicalTable, NamespaceId, Predicate, Query, QueryEngine, QueryLanguage, ResultIterator,
    TableDefinition, Transaction, TransactionManager,
};
use crate::error::{StorageError, StorageResult};
use crate::model::{DataModel, Field, RowType};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use parser::ParsedQuery;
use state::{CollectionData, EngineState, GraphData, NamespaceData, TableData, UndoEntry};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use transaction::LockRegistry;

/// Store name used when the engine is created with `Default`
pub const DEFAULT_STORE: &str = "memory";

/// A schema change issued against the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdlEvent {
    CreatedNamespace(String),
    DroppedNamespace(String),
    CreatedEntity { model: DataModel, name: String },
    DroppedEntity { model: DataModel, name: String },
}

/// One successfully executed insert plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEvent {
    pub entity: String,
    /// Number of tuples in the plan
    pub tuples: usize,
}

/// Fault applied to the next executed insert plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteFault {
    /// Silently drop the last `n` tuples of the batch
    Truncate(usize),
    /// Fail the statement with the given message
    Fail(String),
}

#[derive(Debug)]
struct EngineInner {
    state: Arc<RwLock<EngineState>>,
    locks: Arc<LockRegistry>,
    stores: Vec<String>,
    lock_timeout: Duration,
    next_transaction: AtomicU64,
    ddl_history: Mutex<Vec<DdlEvent>>,
    write_history: Mutex<Vec<WriteEvent>>,
    faults: Mutex<VecDeque<WriteFault>>,
}

/// Cheaply cloneable handle to the in-process engine
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    inner: Arc<EngineInner>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new(vec![DEFAULT_STORE.to_string()], Duration::from_secs(5))
    }
}

impl MemoryEngine {
    /// Create an engine exposing the given store names
    pub fn new(stores: Vec<String>, lock_timeout: Duration) -> Self {
        tracing::debug!("🧠 Creating in-process engine with stores {:?}", stores);
        Self {
            inner: Arc::new(EngineInner {
                state: Arc::new(RwLock::new(EngineState::default())),
                locks: Arc::new(LockRegistry::default()),
                stores,
                lock_timeout,
                next_transaction: AtomicU64::new(1),
                ddl_history: Mutex::new(Vec::new()),
                write_history: Mutex::new(Vec::new()),
                faults: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Collaborator handles backed by this engine
    pub fn handles(&self) -> EngineHandles {
        EngineHandles {
            catalog: Arc::new(self.clone()),
            ddl: Arc::new(self.clone()),
            transactions: Arc::new(self.clone()),
            queries: Arc::new(self.clone()),
            adapters: Arc::new(self.clone()),
        }
    }

    pub fn ddl_history(&self) -> Vec<DdlEvent> {
        self.inner.ddl_history.lock().clone()
    }

    pub fn write_history(&self) -> Vec<WriteEvent> {
        self.inner.write_history.lock().clone()
    }

    pub fn clear_history(&self) {
        self.inner.ddl_history.lock().clear();
        self.inner.write_history.lock().clear();
    }

    /// Queue a fault for the next insert plan
    pub fn inject_write_fault(&self, fault: WriteFault) {
        self.inner.faults.lock().push_back(fault);
    }

    /// Number of tuples currently stored in an entity
    pub fn stored_count(&self, entity: &LogicalEntity) -> Option<usize> {
        let state = self.inner.state.read();
        match entity {
            LogicalEntity::Table(t) => state.table(t.namespace_id, &t.name).map(|d| d.rows.len()),
            LogicalEntity::Collection(c) => state
                .collection(c.namespace_id, &c.name)
                .map(|d| d.documents.len()),
            LogicalEntity::Graph(g) => state.graph(g.id).map(|d| d.nodes.len() + d.edges.len()),
        }
    }

    fn transaction<'a>(&self, tx: &'a dyn Transaction) -> StorageResult<&'a MemoryTransaction> {
        tx.as_any()
            .downcast_ref::<MemoryTransaction>()
            .ok_or_else(|| StorageError::InvalidArgument(format!("transaction {} is not an in-process transaction", tx.id())))
    }

    fn log_ddl(&self, event: DdlEvent) {
        tracing::debug!("🛠️ DDL: {:?}", event);
        self.inner.ddl_history.lock().push(event);
    }

    fn check_stores(&self, stores: &[String]) -> StorageResult<()> {
        match stores.iter().find(|s| !self.has_store(s)) {
            Some(unknown) => Err(StorageError::execution(
                "placement",
                format!("unknown store '{}'", unknown),
            )),
            None => Ok(()),
        }
    }

    /// Resolve a parsed text query against the catalog
    fn translate(&self, parsed: ParsedQuery, namespace: NamespaceId) -> StorageResult<AlgebraNode> {
        let state = self.inner.state.read();
        match parsed {
            ParsedQuery::Select {
                namespace: qualifier,
                table,
                fields,
                predicates,
                order_by,
                limit,
            } => {
                let namespace = match qualifier {
                    Some(name) => state
                        .namespace_by_name(&name)
                        .map(|ns| ns.namespace.id)
                        .ok_or_else(|| StorageError::Validation(format!("unknown namespace '{}'", name)))?,
                    None => namespace,
                };
                let data = state
                    .table(namespace, &table)
                    .ok_or_else(|| StorageError::Validation(format!("unknown table '{}'", table)))?;
                let row_type = &data.table.row_type;
                let check = |column: &str| -> StorageResult<()> {
                    match row_type.index_of(column) {
                        Some(_) => Ok(()),
                        None => Err(StorageError::Validation(format!(
                            "unknown column '{}' in table '{}'",
                            column, table
                        ))),
                    }
                };

                let mut node = AlgebraNode::scan(LogicalEntity::Table(data.table.clone()));
                if !predicates.is_empty() {
                    predicates.iter().try_for_each(|p| check(&p.field))?;
                    node = node.filter(predicates);
                }
                if let Some((column, descending)) = order_by {
                    check(&column)?;
                    node = node.sort(column, descending);
                }
                if let Some(count) = limit {
                    node = node.limit(count);
                }
                if let Some(fields) = fields {
                    fields.iter().try_for_each(|f| check(f))?;
                    node = node.project(fields);
                }
                Ok(node)
            }
            ParsedQuery::Find {
                collection,
                predicates,
                limit,
            } => {
                let data = state
                    .collection(namespace, &collection)
                    .ok_or_else(|| StorageError::Validation(format!("unknown collection '{}'", collection)))?;
                let mut node = AlgebraNode::scan(LogicalEntity::Collection(data.collection.clone()));
                if !predicates.is_empty() {
                    node = node.filter(predicates);
                }
                if let Some(count) = limit {
                    node = node.limit(count);
                }
                Ok(node)
            }
            ParsedQuery::Match { element, label, limit } => {
                let data = state
                    .graph(namespace)
                    .ok_or_else(|| StorageError::Validation(format!("namespace {} holds no graph", namespace)))?;
                let node = AlgebraNode::ScanGraph {
                    graph: data.graph.clone(),
                    element,
                    label,
                };
                Ok(match limit {
                    Some(count) => node.limit(count),
                    None => node,
                })
            }
        }
    }

    /// Every entity referenced by an algebra tree must still exist
    fn validate_algebra(&self, node: &AlgebraNode) -> StorageResult<()> {
        let state = self.inner.state.read();
        let mut pending = vec![node];
        while let Some(current) = pending.pop() {
            let referenced = match current {
                AlgebraNode::Scan { entity } => Some(entity.clone()),
                AlgebraNode::ScanGraph { graph, .. }
                | AlgebraNode::InsertNodes { graph, .. }
                | AlgebraNode::InsertEdges { graph, .. } => Some(LogicalEntity::Graph(graph.clone())),
                AlgebraNode::InsertRows { table, .. } => Some(LogicalEntity::Table(table.clone())),
                AlgebraNode::InsertDocuments { collection, .. } => {
                    Some(LogicalEntity::Collection(collection.clone()))
                }
                _ => None,
            };
            if let Some(entity) = referenced {
                if !state.contains(&entity) {
                    return Err(StorageError::Validation(format!(
                        "unknown {} entity '{}'",
                        entity.data_model(),
                        entity.name()
                    )));
                }
            }
            if let AlgebraNode::Filter { predicates, .. } = current {
                predicates.iter().try_for_each(validate_predicate)?;
            }
            pending.extend(current.inputs());
        }
        Ok(())
    }
}

fn validate_predicate(predicate: &Predicate) -> StorageResult<()> {
    if predicate.field.is_empty() {
        return Err(StorageError::Validation("predicate without field".to_string()));
    }
    Ok(())
}

impl Catalog for MemoryEngine {
    fn namespace(&self, id: NamespaceId) -> Option<LogicalNamespace> {
        self.inner.state.read().namespace(id).map(|ns| ns.namespace.clone())
    }

    fn namespace_by_name(&self, name: &str) -> Option<LogicalNamespace> {
        self.inner
            .state
            .read()
            .namespace_by_name(name)
            .map(|ns| ns.namespace.clone())
    }

    fn namespaces(&self) -> Vec<LogicalNamespace> {
        self.inner
            .state
            .read()
            .namespaces
            .values()
            .map(|ns| ns.namespace.clone())
            .collect()
    }

    fn entities(&self, namespace: NamespaceId) -> Vec<LogicalEntity> {
        self.inner
            .state
            .read()
            .namespace(namespace)
            .map(NamespaceData::entities)
            .unwrap_or_default()
    }

    fn table(&self, namespace: NamespaceId, name: &str) -> Option<LogicalTable> {
        self.inner.state.read().table(namespace, name).map(|t| t.table.clone())
    }

    fn collection(&self, namespace: NamespaceId, name: &str) -> Option<LogicalCollection> {
        self.inner
            .state
            .read()
            .collection(namespace, name)
            .map(|c| c.collection.clone())
    }

    fn graph(&self, id: EntityId) -> Option<LogicalGraph> {
        self.inner.state.read().graph(id).map(|g| g.graph.clone())
    }
}

#[async_trait]
impl DdlManager for MemoryEngine {
    async fn create_namespace(
        &self,
        name: &str,
        data_model: DataModel,
        if_not_exists: bool,
        case_sensitive: bool,
    ) -> StorageResult<NamespaceId> {
        let id = {
            let mut state = self.inner.state.write();
            if let Some(existing) = state.namespace_by_name(name) {
                if if_not_exists {
                    return Ok(existing.namespace.id);
                }
                return Err(StorageError::execution(
                    "create namespace",
                    format!("namespace '{}' already exists", name),
                ));
            }
            let id = state.allocate_id();
            state.namespaces.insert(
                id,
                NamespaceData::new(LogicalNamespace {
                    id,
                    name: name.to_string(),
                    data_model,
                    case_sensitive,
                }),
            );
            id
        };
        self.log_ddl(DdlEvent::CreatedNamespace(name.to_string()));
        Ok(id)
    }

    async fn create_table(&self, definition: TableDefinition, tx: &dyn Transaction) -> StorageResult<()> {
        let tx = self.transaction(tx)?;
        tx.begin_statement()?;
        self.check_stores(&definition.stores)?;

        let mut fields = definition.fields.clone();
        fields.sort_by_key(|f| f.position);
        let row_type = RowType::new(
            fields
                .into_iter()
                .map(|f| Field {
                    name: f.name,
                    field_type: f.field_type,
                    nullable: f.nullable,
                })
                .collect(),
        );
        let primary_key: Vec<String> = definition
            .constraints
            .iter()
            .filter(|c| c.constraint_type == ConstraintType::PrimaryKey)
            .flat_map(|c| c.columns.iter().cloned())
            .collect();
        if let Some(missing) = primary_key.iter().find(|c| row_type.index_of(c).is_none()) {
            return Err(StorageError::execution(
                format!("create table {}", definition.name),
                format!("primary key column '{}' is not a column of the table", missing),
            ));
        }

        {
            let mut state = self.inner.state.write();
            let id = state.allocate_id();
            let namespace = state.namespace_mut(definition.namespace_id)?;
            if namespace.namespace.data_model != DataModel::Relational {
                return Err(StorageError::TypeMismatch {
                    expected: DataModel::Relational.to_string(),
                    actual: namespace.namespace.data_model.to_string(),
                });
            }
            if namespace.tables.contains_key(&definition.name) {
                if definition.if_not_exists {
                    return Ok(());
                }
                return Err(StorageError::execution(
                    "create table",
                    format!("table '{}' already exists", definition.name),
                ));
            }
            let table = LogicalTable {
                id,
                namespace_id: definition.namespace_id,
                namespace_name: namespace.namespace.name.clone(),
                name: definition.name.clone(),
                row_type,
                primary_key,
            };
            namespace.tables.insert(definition.name.clone(), TableData::new(table));
        }
        tx.record(UndoEntry::CreatedTable {
            namespace: definition.namespace_id,
            name: definition.name.clone(),
        });
        self.log_ddl(DdlEvent::CreatedEntity {
            model: DataModel::Relational,
            name: definition.name,
        });
        Ok(())
    }

    async fn create_collection(
        &self,
        definition: CollectionDefinition,
        tx: &dyn Transaction,
    ) -> StorageResult<()> {
        let tx = self.transaction(tx)?;
        tx.begin_statement()?;
        self.check_stores(&definition.stores)?;

        {
            let mut state = self.inner.state.write();
            let id = state.allocate_id();
            let namespace = state.namespace_mut(definition.namespace_id)?;
            if namespace.namespace.data_model != DataModel::Document {
                return Err(StorageError::TypeMismatch {
                    expected: DataModel::Document.to_string(),
                    actual: namespace.namespace.data_model.to_string(),
                });
            }
            if namespace.collections.contains_key(&definition.name) {
                if definition.if_not_exists {
                    return Ok(());
                }
                return Err(StorageError::execution(
                    "create collection",
                    format!("collection '{}' already exists", definition.name),
                ));
            }
            let collection = LogicalCollection {
                id,
                namespace_id: definition.namespace_id,
                namespace_name: namespace.namespace.name.clone(),
                name: definition.name.clone(),
            };
            namespace.collections.insert(
                definition.name.clone(),
                CollectionData {
                    collection,
                    documents: Vec::new(),
                },
            );
        }
        tx.record(UndoEntry::CreatedCollection {
            namespace: definition.namespace_id,
            name: definition.name.clone(),
        });
        self.log_ddl(DdlEvent::CreatedEntity {
            model: DataModel::Document,
            name: definition.name,
        });
        Ok(())
    }

    async fn create_graph(&self, definition: GraphDefinition, tx: &dyn Transaction) -> StorageResult<EntityId> {
        let tx = self.transaction(tx)?;
        tx.begin_statement()?;
        self.check_stores(&definition.stores)?;

        let id = {
            let mut state = self.inner.state.write();
            if let Some(existing) = state.namespace_by_name(&definition.name) {
                if definition.if_not_exists && existing.graph.is_some() {
                    return Ok(existing.namespace.id);
                }
                return Err(StorageError::execution(
                    "create graph",
                    format!("namespace '{}' already exists", definition.name),
                ));
            }
            let id = state.allocate_id();
            let mut namespace = NamespaceData::new(LogicalNamespace {
                id,
                name: definition.name.clone(),
                data_model: DataModel::Graph,
                case_sensitive: definition.case_sensitive,
            });
            namespace.graph = Some(GraphData::new(LogicalGraph {
                id,
                namespace_id: id,
                name: definition.name.clone(),
            }));
            state.namespaces.insert(id, namespace);
            id
        };
        tx.record(UndoEntry::CreatedNamespace(id));
        self.log_ddl(DdlEvent::CreatedEntity {
            model: DataModel::Graph,
            name: definition.name,
        });
        Ok(id)
    }

    async fn drop_table(&self, table: &LogicalTable, tx: &dyn Transaction) -> StorageResult<()> {
        let tx = self.transaction(tx)?;
        tx.begin_statement()?;
        let data = {
            let mut state = self.inner.state.write();
            state
                .namespace_mut(table.namespace_id)?
                .tables
                .remove(&table.name)
                .ok_or_else(|| StorageError::NotFound(format!("table {}", table.name)))?
        };
        tx.record(UndoEntry::DroppedTable {
            namespace: table.namespace_id,
            data: Box::new(data),
        });
        self.log_ddl(DdlEvent::DroppedEntity {
            model: DataModel::Relational,
            name: table.name.clone(),
        });
        Ok(())
    }

    async fn drop_collection(&self, collection: &LogicalCollection, tx: &dyn Transaction) -> StorageResult<()> {
        let tx = self.transaction(tx)?;
        tx.begin_statement()?;
        let data = {
            let mut state = self.inner.state.write();
            state
                .namespace_mut(collection.namespace_id)?
                .collections
                .remove(&collection.name)
                .ok_or_else(|| StorageError::NotFound(format!("collection {}", collection.name)))?
        };
        tx.record(UndoEntry::DroppedCollection {
            namespace: collection.namespace_id,
            data: Box::new(data),
        });
        self.log_ddl(DdlEvent::DroppedEntity {
            model: DataModel::Document,
            name: collection.name.clone(),
        });
        Ok(())
    }

    async fn drop_graph(&self, graph_id: EntityId, if_exists: bool, tx: &dyn Transaction) -> StorageResult<()> {
        let tx = self.transaction(tx)?;
        tx.begin_statement()?;
        let removed = {
            let mut state = self.inner.state.write();
            if state.graph(graph_id).is_some() {
                state.namespaces.remove(&graph_id)
            } else {
                None
            }
        };
        match removed {
            Some(data) => {
                let name = data.namespace.name.clone();
                tx.record(UndoEntry::DroppedNamespace(Box::new(data)));
                self.log_ddl(DdlEvent::DroppedEntity {
                    model: DataModel::Graph,
                    name,
                });
                Ok(())
            }
            None if if_exists => Ok(()),
            None => Err(StorageError::NotFound(format!("graph {}", graph_id))),
        }
    }

    async fn drop_namespace(&self, name: &str, if_exists: bool, tx: &dyn Transaction) -> StorageResult<()> {
        let tx = self.transaction(tx)?;
        tx.begin_statement()?;
        let removed = {
            let mut state = self.inner.state.write();
            let id = state.namespace_by_name(name).map(|ns| ns.namespace.id);
            id.and_then(|id| state.namespaces.remove(&id))
        };
        match removed {
            Some(data) => {
                tx.record(UndoEntry::DroppedNamespace(Box::new(data)));
                self.log_ddl(DdlEvent::DroppedNamespace(name.to_string()));
                Ok(())
            }
            None if if_exists => Ok(()),
            None => Err(StorageError::NotFound(format!("namespace {}", name))),
        }
    }
}

#[async_trait]
impl TransactionManager for MemoryEngine {
    async fn start_transaction(&self, namespace: NamespaceId, origin: &str) -> StorageResult<Arc<dyn Transaction>> {
        let id = self.inner.next_transaction.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("🔄 Starting transaction {} ({}) on namespace {}", id, origin, namespace);
        Ok(Arc::new(MemoryTransaction::new(
            id,
            origin.to_string(),
            Arc::clone(&self.inner.state),
            Arc::clone(&self.inner.locks),
            self.inner.lock_timeout,
        )))
    }
}

#[async_trait]
impl QueryEngine for MemoryEngine {
    async fn parse_and_translate(&self, query: Query, tx: &dyn Transaction) -> StorageResult<ExecutablePlan> {
        self.transaction(tx)?.ensure_active()?;
        match query {
            Query::Text {
                language,
                text,
                namespace,
            } => {
                let parsed = parser::parse(language, &text)?;
                let root = self.translate(parsed, namespace)?;
                tracing::debug!("📝 Translated {} query: {}", language, text);
                Ok(ExecutablePlan::new(root, Some(text)))
            }
            Query::Algebra(root) => {
                self.validate_algebra(&root)?;
                Ok(ExecutablePlan::new(root, None))
            }
        }
    }

    async fn execute(&self, plan: &ExecutablePlan, tx: &dyn Transaction) -> StorageResult<ResultIterator> {
        let tx = self.transaction(tx)?;
        tx.begin_statement()?;

        if plan.root.is_dml() {
            let fault = self.inner.faults.lock().pop_front();
            let (affected, undo) = {
                let mut state = self.inner.state.write();
                executor::apply_insert(&plan.root, &mut state, fault)?
            };
            tx.record(undo);
            if let Some(entity) = plan.root.modified_entity() {
                let name = modified_name(&plan.root).unwrap_or_else(|| entity.to_string());
                self.inner.write_history.lock().push(WriteEvent {
                    entity: name,
                    tuples: insert_len(&plan.root),
                });
            }
            Ok(ResultIterator::affected(affected))
        } else {
            let relation = {
                let state = self.inner.state.read();
                executor::evaluate(&plan.root, &state)?
            };
            Ok(ResultIterator::from_tuples(relation.tuples))
        }
    }
}

impl AdapterRegistry for MemoryEngine {
    fn has_store(&self, name: &str) -> bool {
        self.inner.stores.iter().any(|s| s == name)
    }

    fn fallback_store(&self) -> String {
        self.inner
            .stores
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_STORE.to_string())
    }
}

fn modified_name(node: &AlgebraNode) -> Option<String> {
    match node {
        AlgebraNode::InsertRows { table, .. } => Some(table.name.clone()),
        AlgebraNode::InsertDocuments { collection, .. } => Some(collection.name.clone()),
        AlgebraNode::InsertNodes { graph, .. } | AlgebraNode::InsertEdges { graph, .. } => Some(graph.name.clone()),
        _ => None,
    }
}

fn insert_len(node: &AlgebraNode) -> usize {
    match node {
        AlgebraNode::InsertRows { rows, .. } => rows.len(),
        AlgebraNode::InsertDocuments { documents, .. } => documents.len(),
        AlgebraNode::InsertNodes { nodes, .. } => nodes.len(),
        AlgebraNode::InsertEdges { edges, .. } => edges.len(),
        _ => 0,
    }
}

/// Convenience for tests and tooling: run a text query in its own transaction
pub async fn query_text(
    engine: &MemoryEngine,
    language: QueryLanguage,
    text: &str,
    namespace: NamespaceId,
) -> StorageResult<Vec<crate::model::Tuple>> {
    let tx = engine.start_transaction(namespace, "Workflow-AdHoc").await?;
    let plan = engine.parse_and_translate(Query::text(language, text, namespace), tx.as_ref()).await?;
    let tuples = engine.execute(&plan, tx.as_ref()).await?.collect_all().await?;
    tx.commit().await?;
    Ok(tuples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ConstraintInformation, FieldInformation, LockType, PlacementType};
    use crate::model::{FieldType, Tuple};
    use serde_json::json;

    async fn table_fixture(engine: &MemoryEngine) -> (NamespaceId, LogicalTable) {
        let ns = engine
            .create_namespace("rel_test", DataModel::Relational, true, false)
            .await
            .unwrap();
        let row_type = RowType::new(vec![Field::primary_key(), Field::new("value", FieldType::Text)]);
        let tx = engine.start_transaction(ns, "test").await.unwrap();
        engine
            .create_table(
                TableDefinition {
                    namespace_id: ns,
                    name: "t_demo".to_string(),
                    fields: FieldInformation::from_row_type(&row_type),
                    constraints: vec![ConstraintInformation::primary_key("_key")],
                    if_not_exists: false,
                    stores: vec![DEFAULT_STORE.to_string()],
                    placement: PlacementType::Manual,
                },
                tx.as_ref(),
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();
        (ns, engine.table(ns, "t_demo").unwrap())
    }

    fn insert(table: &LogicalTable, keys: &[i64]) -> Query {
        Query::Algebra(AlgebraNode::InsertRows {
            table: table.clone(),
            rows: keys.iter().map(|k| vec![json!(k), json!(format!("v{}", k))]).collect(),
        })
    }

    #[tokio::test]
    async fn test_rollback_undoes_inserts_and_ddl() {
        let engine = MemoryEngine::default();
        let (ns, table) = table_fixture(&engine).await;

        let tx = engine.start_transaction(ns, "test").await.unwrap();
        let plan = engine.parse_and_translate(insert(&table, &[1, 2, 3]), tx.as_ref()).await.unwrap();
        let result = engine.execute(&plan, tx.as_ref()).await.unwrap();
        assert_eq!(result.affected, Some(3));
        engine.drop_table(&table, tx.as_ref()).await.unwrap();
        tx.rollback(Some("test")).await.unwrap();

        let entity = LogicalEntity::Table(table);
        assert_eq!(engine.stored_count(&entity), Some(0));
    }

    #[tokio::test]
    async fn test_duplicate_primary_key_rejects_whole_batch() {
        let engine = MemoryEngine::default();
        let (ns, table) = table_fixture(&engine).await;

        let tx = engine.start_transaction(ns, "test").await.unwrap();
        let plan = engine.parse_and_translate(insert(&table, &[1, 2, 2]), tx.as_ref()).await.unwrap();
        let err = engine.execute(&plan, tx.as_ref()).await.unwrap_err();
        assert!(matches!(err, StorageError::Execution { .. }));
        assert_eq!(engine.stored_count(&LogicalEntity::Table(table)), Some(0));
    }

    #[tokio::test]
    async fn test_truncate_fault_reports_fewer_affected() {
        let engine = MemoryEngine::default();
        let (ns, table) = table_fixture(&engine).await;
        engine.inject_write_fault(WriteFault::Truncate(1));

        let tx = engine.start_transaction(ns, "test").await.unwrap();
        let plan = engine.parse_and_translate(insert(&table, &[1, 2, 3]), tx.as_ref()).await.unwrap();
        let result = engine.execute(&plan, tx.as_ref()).await.unwrap();
        assert_eq!(result.affected, Some(2));
    }

    #[tokio::test]
    async fn test_sql_subset_filters_sorts_and_limits() {
        let engine = MemoryEngine::default();
        let (ns, table) = table_fixture(&engine).await;

        let tx = engine.start_transaction(ns, "test").await.unwrap();
        let plan = engine.parse_and_translate(insert(&table, &[5, 1, 9, 3]), tx.as_ref()).await.unwrap();
        engine.execute(&plan, tx.as_ref()).await.unwrap();
        tx.commit().await.unwrap();

        let tuples = query_text(
            &engine,
            QueryLanguage::Sql,
            "SELECT _key FROM t_demo WHERE _key > 1 ORDER BY _key DESC LIMIT 2",
            ns,
        )
        .await
        .unwrap();
        assert_eq!(tuples, vec![Tuple::Row(vec![json!(9)]), Tuple::Row(vec![json!(5)])]);

        let err = query_text(&engine, QueryLanguage::Sql, "SELECT missing FROM t_demo", ns)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[tokio::test]
    async fn test_exclusive_lock_times_out_as_deadlock() {
        let engine = MemoryEngine::new(vec![DEFAULT_STORE.to_string()], Duration::from_millis(50));
        let (ns, _) = table_fixture(&engine).await;
        let namespace = engine.namespace(ns).unwrap();

        let reader = engine.start_transaction(ns, "reader").await.unwrap();
        reader.acquire_lock(&namespace, LockType::Shared).await.unwrap();

        let dropper = engine.start_transaction(ns, "dropper").await.unwrap();
        let err = dropper.acquire_lock(&namespace, LockType::Exclusive).await.unwrap_err();
        assert!(err.is_deadlock());

        reader.commit().await.unwrap();
        dropper.acquire_lock(&namespace, LockType::Exclusive).await.unwrap();
    }
}
