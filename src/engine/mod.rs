/// Engine collaborator contracts
///
/// The storage layer never talks to a concrete database directly. Everything it needs
/// from the engine underneath is expressed here as a small set of traits:
/// - Catalog: read-only lookups of namespaces and entities
/// - DdlManager: create/drop namespaces, tables, collections and graphs
/// - TransactionManager / Transaction: transaction scoping and schema locks
/// - QueryEngine: translate queries into executable plans and run them
/// - AdapterRegistry: which physical stores exist
///
/// The handles are bundled in `EngineHandles` and injected into the storage manager.

// Algebra trees, query descriptions and executable plans
pub mod algebra;

// In-process reference engine used by the binary and the test suite
#[cfg(feature = "memory-engine")]
pub mod memory;

use crate::error::StorageResult;
use crate::model::{DataModel, FieldType, RowType, TupleType};
use async_trait::async_trait;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

pub use algebra::{
    AlgebraNode, CompareOp, ExecutablePlan, GraphElement, PlanKind, Predicate, Query,
    QueryLanguage, ResultIterator, TupleStream,
};

/// Catalog id of a namespace
pub type NamespaceId = u64;

/// Catalog id of a table, collection or graph
pub type EntityId = u64;

/// Mode of a schema-level lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    Shared,
    Exclusive,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Shared => write!(f, "SHARED"),
            LockType::Exclusive => write!(f, "EXCLUSIVE"),
        }
    }
}

/// How placements of a new entity are chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementType {
    Automatic,
    Manual,
}

/// A namespace as currently known to the catalog
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogicalNamespace {
    pub id: NamespaceId,
    pub name: String,
    pub data_model: DataModel,
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogicalTable {
    pub id: EntityId,
    pub namespace_id: NamespaceId,
    pub namespace_name: String,
    pub name: String,
    pub row_type: RowType,
    pub primary_key: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogicalCollection {
    pub id: EntityId,
    pub namespace_id: NamespaceId,
    pub namespace_name: String,
    pub name: String,
}

/// A graph always owns its namespace, so `id == namespace_id`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogicalGraph {
    pub id: EntityId,
    pub namespace_id: NamespaceId,
    pub name: String,
}

/// The physical backing object of a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LogicalEntity {
    Table(LogicalTable),
    Collection(LogicalCollection),
    Graph(LogicalGraph),
}

impl LogicalEntity {
    pub fn id(&self) -> EntityId {
        match self {
            LogicalEntity::Table(t) => t.id,
            LogicalEntity::Collection(c) => c.id,
            LogicalEntity::Graph(g) => g.id,
        }
    }

    pub fn namespace_id(&self) -> NamespaceId {
        match self {
            LogicalEntity::Table(t) => t.namespace_id,
            LogicalEntity::Collection(c) => c.namespace_id,
            LogicalEntity::Graph(g) => g.namespace_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            LogicalEntity::Table(t) => &t.name,
            LogicalEntity::Collection(c) => &c.name,
            LogicalEntity::Graph(g) => &g.name,
        }
    }

    pub fn data_model(&self) -> DataModel {
        match self {
            LogicalEntity::Table(_) => DataModel::Relational,
            LogicalEntity::Collection(_) => DataModel::Document,
            LogicalEntity::Graph(_) => DataModel::Graph,
        }
    }

    pub fn tuple_type(&self) -> TupleType {
        match self {
            LogicalEntity::Table(t) => TupleType::Relational(t.row_type.clone()),
            LogicalEntity::Collection(_) => TupleType::Document,
            LogicalEntity::Graph(_) => TupleType::Graph,
        }
    }
}

/// Column description handed to the DDL service
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInformation {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub position: usize,
}

impl FieldInformation {
    pub fn from_row_type(row_type: &RowType) -> Vec<FieldInformation> {
        row_type
            .fields
            .iter()
            .enumerate()
            .map(|(position, field)| FieldInformation {
                name: field.name.clone(),
                field_type: field.field_type,
                nullable: field.nullable,
                position,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintType {
    PrimaryKey,
    Unique,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintInformation {
    pub name: String,
    pub constraint_type: ConstraintType,
    pub columns: Vec<String>,
}

impl ConstraintInformation {
    pub fn primary_key(column: &str) -> Self {
        Self {
            name: "PRIMARY KEY".to_string(),
            constraint_type: ConstraintType::PrimaryKey,
            columns: vec![column.to_string()],
        }
    }
}

/// Everything the DDL service needs to create a table
#[derive(Debug, Clone)]
pub struct TableDefinition {
    pub namespace_id: NamespaceId,
    pub name: String,
    pub fields: Vec<FieldInformation>,
    pub constraints: Vec<ConstraintInformation>,
    pub if_not_exists: bool,
    pub stores: Vec<String>,
    pub placement: PlacementType,
}

#[derive(Debug, Clone)]
pub struct CollectionDefinition {
    pub namespace_id: NamespaceId,
    pub name: String,
    pub if_not_exists: bool,
    pub stores: Vec<String>,
    pub placement: PlacementType,
}

#[derive(Debug, Clone)]
pub struct GraphDefinition {
    pub name: String,
    pub if_not_exists: bool,
    pub stores: Vec<String>,
    pub case_sensitive: bool,
}

/// Read-only snapshot lookups
pub trait Catalog: Send + Sync {
    fn namespace(&self, id: NamespaceId) -> Option<LogicalNamespace>;

    fn namespace_by_name(&self, name: &str) -> Option<LogicalNamespace>;

    fn namespaces(&self) -> Vec<LogicalNamespace>;

    /// All tables, collections and graphs living in a namespace
    fn entities(&self, namespace: NamespaceId) -> Vec<LogicalEntity>;

    fn table(&self, namespace: NamespaceId, name: &str) -> Option<LogicalTable>;

    fn collection(&self, namespace: NamespaceId, name: &str) -> Option<LogicalCollection>;

    fn graph(&self, id: EntityId) -> Option<LogicalGraph>;
}

/// Schema changes; every call except `create_namespace` runs inside the given transaction
#[async_trait]
pub trait DdlManager: Send + Sync {
    async fn create_namespace(
        &self,
        name: &str,
        data_model: DataModel,
        if_not_exists: bool,
        case_sensitive: bool,
    ) -> StorageResult<NamespaceId>;

    async fn create_table(&self, definition: TableDefinition, tx: &dyn Transaction) -> StorageResult<()>;

    async fn create_collection(
        &self,
        definition: CollectionDefinition,
        tx: &dyn Transaction,
    ) -> StorageResult<()>;

    /// Creates the graph together with its dedicated namespace and returns the graph id
    async fn create_graph(&self, definition: GraphDefinition, tx: &dyn Transaction) -> StorageResult<EntityId>;

    async fn drop_table(&self, table: &LogicalTable, tx: &dyn Transaction) -> StorageResult<()>;

    async fn drop_collection(&self, collection: &LogicalCollection, tx: &dyn Transaction) -> StorageResult<()>;

    async fn drop_graph(&self, graph_id: EntityId, if_exists: bool, tx: &dyn Transaction) -> StorageResult<()>;

    async fn drop_namespace(&self, name: &str, if_exists: bool, tx: &dyn Transaction) -> StorageResult<()>;
}

/// A running engine transaction
#[async_trait]
pub trait Transaction: Send + Sync + fmt::Debug {
    fn id(&self) -> u64;

    /// Label describing who started the transaction (e.g. "Workflow-RelWrite")
    fn origin(&self) -> &str;

    fn is_active(&self) -> bool;

    /// Number of statements executed so far
    fn statement_count(&self) -> usize;

    /// Acquire a schema lock on a namespace, held until commit or rollback
    async fn acquire_lock(&self, namespace: &LogicalNamespace, lock: LockType) -> StorageResult<()>;

    async fn commit(&self) -> StorageResult<()>;

    async fn rollback(&self, cause: Option<&str>) -> StorageResult<()>;

    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn start_transaction(
        &self,
        namespace: NamespaceId,
        origin: &str,
    ) -> StorageResult<Arc<dyn Transaction>>;
}

/// Query translation and execution
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Parse, validate and translate; must not modify any store
    async fn parse_and_translate(&self, query: Query, tx: &dyn Transaction) -> StorageResult<ExecutablePlan>;

    /// Execute inside the caller's transaction without committing or rolling back
    async fn execute(&self, plan: &ExecutablePlan, tx: &dyn Transaction) -> StorageResult<ResultIterator>;
}

/// Physical stores (adapters) entities can be placed on
pub trait AdapterRegistry: Send + Sync {
    fn has_store(&self, name: &str) -> bool;

    /// Store used when a session does not configure one for a data model
    fn fallback_store(&self) -> String;
}

/// Injected collaborator handles
#[derive(Clone)]
pub struct EngineHandles {
    pub catalog: Arc<dyn Catalog>,
    pub ddl: Arc<dyn DdlManager>,
    pub transactions: Arc<dyn TransactionManager>,
    pub queries: Arc<dyn QueryEngine>,
    pub adapters: Arc<dyn AdapterRegistry>,
}

impl fmt::Debug for EngineHandles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandles").finish_non_exhaustive()
    }
}
