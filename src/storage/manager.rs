/// Session-scoped checkpoint orchestrator
///
/// One `StorageManager` exists per workflow session. It owns two shared namespaces
/// (`rel_<session>` for tables and `doc_<session>` for collections) and one dedicated
/// namespace per graph checkpoint. It creates checkpoints and hands out writers,
/// resolves checkpoints for readers, keeps track of linked checkpoints it does not own,
/// scopes per-activity and common transactions, and tears everything down on `close()`.
///
/// Map state lives behind `parking_lot` locks that are never held across an await;
/// checkpoint creation is serialized by an async mutex.

use crate::engine::{
    CollectionDefinition, ConstraintInformation, EngineHandles, FieldInformation, GraphDefinition,
    LockType, LogicalCollection, LogicalEntity, LogicalGraph, LogicalTable, NamespaceId, PlacementType,
    TableDefinition, Transaction,
};
use crate::error::{StorageError, StorageResult};
use crate::model::{DataModel, RowType, TupleType};
use crate::query::{quoted_identifier, QueryBridge};
use crate::session::manifest::SessionManifest;
use crate::storage::metadata::{CheckpointMetadata, DocMetadata, LpgMetadata, RelMetadata, TypePreview};
use crate::storage::naming;
use crate::storage::reader::{CheckpointReader, DocReader, LpgReader, ReaderCore, RelReader};
use crate::storage::writer::{BatchLimits, CheckpointWriter, DocWriter, LpgWriter, RelWriter, WriterCore};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Transaction labels, visible in engine logs
const ORIGIN_REL_CREATE: &str = "Workflow-RelCreate";
const ORIGIN_REL_WRITE: &str = "Workflow-RelWrite";
const ORIGIN_REL_READ: &str = "Workflow-RelRead";
const ORIGIN_DOC_CREATE: &str = "Workflow-DocCreate";
const ORIGIN_DOC_WRITE: &str = "Workflow-DocWrite";
const ORIGIN_DOC_READ: &str = "Workflow-DocRead";
const ORIGIN_LPG_CREATE: &str = "Workflow-LpgCreate";
const ORIGIN_LPG_WRITE: &str = "Workflow-LpgWrite";
const ORIGIN_LPG_READ: &str = "Workflow-LpgRead";
const ORIGIN_DROP_CHECKPOINT: &str = "Workflow-DropCheckpoint";
const ORIGIN_DROP_NAMESPACES: &str = "Workflow-DropNamespaces";
const ORIGIN_LOCAL: &str = "Workflow-LocalTx";

/// Phase of a transaction shared by several activities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommonPhase {
    Extract,
    Load,
}

impl CommonPhase {
    pub const ALL: [CommonPhase; 2] = [CommonPhase::Extract, CommonPhase::Load];

    fn origin(&self) -> &'static str {
        match self {
            CommonPhase::Extract => "Workflow-Extract",
            CommonPhase::Load => "Workflow-Load",
        }
    }
}

impl fmt::Display for CommonPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommonPhase::Extract => write!(f, "EXTRACT"),
            CommonPhase::Load => write!(f, "LOAD"),
        }
    }
}

/// Which transaction an activity runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionScope {
    /// Private to the activity, created on first use
    Local,
    /// Shared with every activity of the same phase
    Common(CommonPhase),
}

/// A registered checkpoint: backing entity plus its metadata
#[derive(Debug, Clone)]
pub enum Checkpoint {
    Relational {
        table: LogicalTable,
        metadata: Arc<RelMetadata>,
    },
    Document {
        collection: LogicalCollection,
        metadata: Arc<DocMetadata>,
    },
    Graph {
        graph: LogicalGraph,
        metadata: Arc<LpgMetadata>,
    },
}

impl Checkpoint {
    pub fn entity(&self) -> LogicalEntity {
        match self {
            Checkpoint::Relational { table, .. } => LogicalEntity::Table(table.clone()),
            Checkpoint::Document { collection, .. } => LogicalEntity::Collection(collection.clone()),
            Checkpoint::Graph { graph, .. } => LogicalEntity::Graph(graph.clone()),
        }
    }

    pub fn metadata(&self) -> CheckpointMetadata {
        match self {
            Checkpoint::Relational { metadata, .. } => CheckpointMetadata::Relational(Arc::clone(metadata)),
            Checkpoint::Document { metadata, .. } => CheckpointMetadata::Document(Arc::clone(metadata)),
            Checkpoint::Graph { metadata, .. } => CheckpointMetadata::Graph(Arc::clone(metadata)),
        }
    }

    pub fn data_model(&self) -> DataModel {
        match self {
            Checkpoint::Relational { .. } => DataModel::Relational,
            Checkpoint::Document { .. } => DataModel::Document,
            Checkpoint::Graph { .. } => DataModel::Graph,
        }
    }

    fn from_reader(reader: &CheckpointReader) -> Self {
        match reader {
            CheckpointReader::Relational(r) => Checkpoint::Relational {
                table: r.table().clone(),
                metadata: Arc::clone(r.metadata()),
            },
            CheckpointReader::Document(r) => Checkpoint::Document {
                collection: r.collection().clone(),
                metadata: Arc::clone(r.metadata()),
            },
            CheckpointReader::Graph(r) => Checkpoint::Graph {
                graph: r.graph().clone(),
                metadata: Arc::clone(r.metadata()),
            },
        }
    }
}

/// Serializable view of one checkpoint
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointSummary {
    pub activity_id: Uuid,
    pub output_index: usize,
    pub data_model: DataModel,
    pub entity: String,
    pub tuple_count: u64,
    pub open: bool,
    /// The writer failed or was aborted
    pub discarded: bool,
    pub linked: bool,
}

/// Construction options of a storage manager
#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    /// Store per data model; missing models fall back to the engine's fallback store
    pub default_stores: HashMap<DataModel, String>,
    pub batch_limits: BatchLimits,
    pub manifest: Option<SessionManifest>,
}

/// Checkpoint lifecycle of one workflow session
pub struct StorageManager {
    session_id: Uuid,
    handles: EngineHandles,
    bridge: QueryBridge,
    default_stores: ArcSwap<HashMap<DataModel, String>>,
    batch_limits: BatchLimits,
    manifest: Option<SessionManifest>,

    rel_namespace: NamespaceId,
    doc_namespace: NamespaceId,

    /// activity -> output index -> checkpoint
    checkpoints: RwLock<HashMap<Uuid, BTreeMap<usize, Checkpoint>>>,
    /// Checkpoints registered by `link_checkpoint`, owned by another manager
    linked: RwLock<HashSet<(Uuid, usize)>>,
    /// Namespaces to drop on close
    namespaces: RwLock<BTreeMap<NamespaceId, String>>,

    local_transactions: Mutex<HashMap<Uuid, Arc<dyn Transaction>>>,
    common_transactions: Mutex<HashMap<CommonPhase, Arc<dyn Transaction>>>,

    create_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageManager")
            .field("session_id", &self.session_id)
            .field("rel_namespace", &self.rel_namespace)
            .field("doc_namespace", &self.doc_namespace)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl StorageManager {
    /// Create the session's relational and document namespaces and start tracking them
    pub async fn new(session_id: Uuid, handles: EngineHandles, options: ManagerOptions) -> StorageResult<Self> {
        let fallback = handles.adapters.fallback_store();
        let mut stores = options.default_stores;
        for model in DataModel::ALL {
            stores.entry(model).or_insert_with(|| fallback.clone());
        }
        for (model, store) in &stores {
            if !handles.adapters.has_store(store) {
                return Err(StorageError::InvalidArgument(format!(
                    "default {} store '{}' does not exist",
                    model, store
                )));
            }
        }

        if let Some(manifest) = &options.manifest {
            manifest.record_session(&session_id).await?;
        }

        let rel_name = naming::namespace_name(naming::REL_PREFIX, &session_id);
        let doc_name = naming::namespace_name(naming::DOC_PREFIX, &session_id);
        if let Some(manifest) = &options.manifest {
            manifest
                .record_namespace(&session_id, &rel_name, DataModel::Relational)
                .await?;
            manifest
                .record_namespace(&session_id, &doc_name, DataModel::Document)
                .await?;
        }
        let rel_namespace = handles
            .ddl
            .create_namespace(&rel_name, DataModel::Relational, true, false)
            .await?;
        let doc_namespace = handles
            .ddl
            .create_namespace(&doc_name, DataModel::Document, true, false)
            .await?;

        let mut namespaces = BTreeMap::new();
        namespaces.insert(rel_namespace, rel_name);
        namespaces.insert(doc_namespace, doc_name);

        tracing::info!("🚀 Opened storage session {}", session_id);
        Ok(Self {
            session_id,
            bridge: QueryBridge::new(Arc::clone(&handles.queries)),
            handles,
            default_stores: ArcSwap::from_pointee(stores),
            batch_limits: options.batch_limits,
            manifest: options.manifest,
            rel_namespace,
            doc_namespace,
            checkpoints: RwLock::new(HashMap::new()),
            linked: RwLock::new(HashSet::new()),
            namespaces: RwLock::new(namespaces),
            local_transactions: Mutex::new(HashMap::new()),
            common_transactions: Mutex::new(HashMap::new()),
            create_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn batch_limits(&self) -> BatchLimits {
        self.batch_limits
    }

    /// Names of the namespaces this session will drop on close
    pub fn registered_namespaces(&self) -> Vec<String> {
        self.namespaces.read().values().cloned().collect()
    }

    pub fn default_store(&self, model: DataModel) -> String {
        self.default_stores
            .load()
            .get(&model)
            .cloned()
            .unwrap_or_else(|| self.handles.adapters.fallback_store())
    }

    pub fn set_default_store(&self, model: DataModel, store: &str) -> StorageResult<()> {
        self.check_store(store)?;
        let current = self.default_stores.load();
        let mut stores = (**current).clone();
        stores.insert(model, store.to_string());
        self.default_stores.store(Arc::new(stores));
        tracing::info!("🔧 Default {} store of session {} is now '{}'", model, self.session_id, store);
        Ok(())
    }

    // Checkpoint creation

    /// Create a table checkpoint and return a writer bound to a fresh write transaction
    ///
    /// The row type needs at least one column, column 0 must be the numeric `_key`
    /// primary key, and names must be unique once double quotes are stripped.
    pub async fn create_rel_checkpoint(
        &self,
        activity: Uuid,
        output: usize,
        row_type: &RowType,
        reset_pk: bool,
        store: Option<&str>,
    ) -> StorageResult<RelWriter> {
        self.ensure_open()?;
        let store = self.resolve_store(DataModel::Relational, store)?;
        let first = row_type
            .fields
            .first()
            .ok_or_else(|| StorageError::InvalidArgument("an output table must contain at least one column".to_string()))?;
        if !first.is_pk_col() {
            return Err(StorageError::InvalidArgument(format!(
                "the first column of an output table must be its numeric primary key named {}",
                crate::model::PK_COL
            )));
        }
        let row_type = row_type.without_quotes();
        if let Some(duplicate) = row_type.find_duplicate() {
            return Err(StorageError::InvalidArgument(format!(
                "found duplicate column in output table: {}",
                duplicate
            )));
        }

        let _guard = self.create_lock.lock().await;
        self.ensure_vacant(activity, output)?;

        let name = naming::table_name(&activity, output);
        let definition = TableDefinition {
            namespace_id: self.rel_namespace,
            name: name.clone(),
            fields: FieldInformation::from_row_type(&row_type),
            constraints: vec![ConstraintInformation::primary_key(&row_type.fields[0].name)],
            if_not_exists: false,
            stores: vec![store],
            placement: PlacementType::Automatic,
        };
        let tx = self
            .handles
            .transactions
            .start_transaction(self.rel_namespace, ORIGIN_REL_CREATE)
            .await?;
        let result = async {
            self.acquire_schema_lock(tx.as_ref(), self.rel_namespace, LockType::Shared)
                .await?;
            self.handles.ddl.create_table(definition, tx.as_ref()).await
        }
        .await;
        finish_ddl(tx.as_ref(), result).await?;

        let table = self
            .handles
            .catalog
            .table(self.rel_namespace, &name)
            .ok_or_else(|| StorageError::NotFound(format!("table {} after creating it", name)))?;
        let metadata = Arc::new(RelMetadata::new(table.row_type.clone()));
        let core = self
            .writer_core(LogicalEntity::Table(table.clone()), activity, output, ORIGIN_REL_WRITE)
            .await?;
        let writer = RelWriter::new(core, table.clone(), Arc::clone(&metadata), reset_pk, self.batch_limits)?;
        self.register(activity, output, Checkpoint::Relational { table, metadata });
        tracing::info!("📝 Created relational checkpoint {} for output {} of {}", name, output, activity);
        Ok(writer)
    }

    pub async fn create_doc_checkpoint(
        &self,
        activity: Uuid,
        output: usize,
        store: Option<&str>,
    ) -> StorageResult<DocWriter> {
        self.ensure_open()?;
        let store = self.resolve_store(DataModel::Document, store)?;

        let _guard = self.create_lock.lock().await;
        self.ensure_vacant(activity, output)?;

        let name = naming::collection_name(&self.session_id, &activity, output);
        let definition = CollectionDefinition {
            namespace_id: self.doc_namespace,
            name: name.clone(),
            if_not_exists: false,
            stores: vec![store],
            placement: PlacementType::Automatic,
        };
        let tx = self
            .handles
            .transactions
            .start_transaction(self.doc_namespace, ORIGIN_DOC_CREATE)
            .await?;
        let result = async {
            self.acquire_schema_lock(tx.as_ref(), self.doc_namespace, LockType::Shared)
                .await?;
            self.handles.ddl.create_collection(definition, tx.as_ref()).await
        }
        .await;
        finish_ddl(tx.as_ref(), result).await?;

        let collection = self
            .handles
            .catalog
            .collection(self.doc_namespace, &name)
            .ok_or_else(|| StorageError::NotFound(format!("collection {} after creating it", name)))?;
        let metadata = Arc::new(DocMetadata::new());
        let core = self
            .writer_core(LogicalEntity::Collection(collection.clone()), activity, output, ORIGIN_DOC_WRITE)
            .await?;
        let writer = DocWriter::new(core, collection.clone(), Arc::clone(&metadata), self.batch_limits);
        self.register(activity, output, Checkpoint::Document { collection, metadata });
        tracing::info!("📝 Created document checkpoint {} for output {} of {}", name, output, activity);
        Ok(writer)
    }

    /// Create a graph checkpoint in its own namespace
    pub async fn create_lpg_checkpoint(
        &self,
        activity: Uuid,
        output: usize,
        store: Option<&str>,
    ) -> StorageResult<LpgWriter> {
        self.ensure_open()?;
        let store = self.resolve_store(DataModel::Graph, store)?;

        let _guard = self.create_lock.lock().await;
        self.ensure_vacant(activity, output)?;

        let name = naming::graph_name(&self.session_id, &activity, output);
        if let Some(manifest) = &self.manifest {
            manifest
                .record_namespace(&self.session_id, &name, DataModel::Graph)
                .await?;
        }
        let definition = GraphDefinition {
            name: name.clone(),
            if_not_exists: true,
            stores: vec![store],
            case_sensitive: false,
        };
        // The graph's namespace does not exist yet, so there is nothing to lock
        let tx = self
            .handles
            .transactions
            .start_transaction(self.rel_namespace, ORIGIN_LPG_CREATE)
            .await?;
        let result = self.handles.ddl.create_graph(definition, tx.as_ref()).await;
        let graph_id = finish_ddl(tx.as_ref(), result).await?;

        let graph = self
            .handles
            .catalog
            .graph(graph_id)
            .ok_or_else(|| StorageError::NotFound(format!("graph {} after creating it", name)))?;
        self.namespaces.write().insert(graph.namespace_id, name.clone());
        let metadata = Arc::new(LpgMetadata::new());
        let core = self
            .writer_core(LogicalEntity::Graph(graph.clone()), activity, output, ORIGIN_LPG_WRITE)
            .await?;
        let writer = LpgWriter::new(core, graph.clone(), Arc::clone(&metadata), self.batch_limits);
        self.register(activity, output, Checkpoint::Graph { graph, metadata });
        tracing::info!("📝 Created graph checkpoint {} for output {} of {}", name, output, activity);
        Ok(writer)
    }

    /// Create a checkpoint of any data model; `row_type` and `reset_pk` only apply to tables
    pub async fn create_checkpoint(
        &self,
        activity: Uuid,
        output: usize,
        model: DataModel,
        row_type: Option<&RowType>,
        reset_pk: bool,
        store: Option<&str>,
    ) -> StorageResult<CheckpointWriter> {
        match model {
            DataModel::Relational => {
                let row_type = row_type.ok_or_else(|| {
                    StorageError::InvalidArgument("a relational checkpoint needs a row type".to_string())
                })?;
                self.create_rel_checkpoint(activity, output, row_type, reset_pk, store)
                    .await
                    .map(CheckpointWriter::Relational)
            }
            DataModel::Document => self
                .create_doc_checkpoint(activity, output, store)
                .await
                .map(CheckpointWriter::Document),
            DataModel::Graph => self
                .create_lpg_checkpoint(activity, output, store)
                .await
                .map(CheckpointWriter::Graph),
        }
    }

    // Reading and inspection

    /// Open a reader on a closed checkpoint
    ///
    /// The reader runs in its own transaction holding a SHARED lock on the checkpoint's
    /// namespace until the reader is closed or dropped.
    pub async fn read_checkpoint(&self, activity: Uuid, output: usize) -> StorageResult<CheckpointReader> {
        self.ensure_open()?;
        let checkpoint = self.checkpoint(activity, output)?;
        let metadata = checkpoint.metadata();
        if metadata.is_discarded() {
            return Err(StorageError::IllegalState(format!(
                "the writer of output {} of activity {} failed or was aborted, drop and recreate it",
                output, activity
            )));
        }
        if metadata.is_open() {
            return Err(StorageError::IllegalState(format!(
                "output {} of activity {} is still being written",
                output, activity
            )));
        }

        let entity = checkpoint.entity();
        let origin = match checkpoint.data_model() {
            DataModel::Relational => ORIGIN_REL_READ,
            DataModel::Document => ORIGIN_DOC_READ,
            DataModel::Graph => ORIGIN_LPG_READ,
        };
        let namespace = entity.namespace_id();
        let tx = self.handles.transactions.start_transaction(namespace, origin).await?;
        if let Err(e) = self.acquire_schema_lock(tx.as_ref(), namespace, LockType::Shared).await {
            tx.rollback(Some("could not lock checkpoint for reading")).await?;
            return Err(e);
        }

        let core = ReaderCore::new(self.bridge.clone(), tx, describe(activity, output));
        tracing::debug!("📖 Reading {} checkpoint {}", checkpoint.data_model(), entity.name());
        Ok(match checkpoint {
            Checkpoint::Relational { table, metadata } => CheckpointReader::Relational(RelReader::new(core, table, metadata)),
            Checkpoint::Document { collection, metadata } => {
                CheckpointReader::Document(DocReader::new(core, collection, metadata))
            }
            Checkpoint::Graph { graph, metadata } => CheckpointReader::Graph(LpgReader::new(core, graph, metadata)),
        })
    }

    pub fn data_model(&self, activity: Uuid, output: usize) -> StorageResult<DataModel> {
        Ok(self.checkpoint(activity, output)?.data_model())
    }

    pub fn tuple_type(&self, activity: Uuid, output: usize) -> StorageResult<TupleType> {
        Ok(self.checkpoint(activity, output)?.entity().tuple_type())
    }

    pub fn checkpoint_metadata(&self, activity: Uuid, output: usize) -> StorageResult<CheckpointMetadata> {
        Ok(self.checkpoint(activity, output)?.metadata())
    }

    /// One preview per output index up to the highest registered one; gaps are `None`
    pub fn checkpoint_preview_types(&self, activity: Uuid) -> Vec<Option<TypePreview>> {
        let checkpoints = self.checkpoints.read();
        let Some(outputs) = checkpoints.get(&activity) else {
            return Vec::new();
        };
        let count = outputs.keys().next_back().map_or(0, |last| last + 1);
        (0..count)
            .map(|output| outputs.get(&output).map(|c| c.metadata().preview()))
            .collect()
    }

    pub fn has_checkpoint(&self, activity: Uuid, output: usize) -> bool {
        self.checkpoints
            .read()
            .get(&activity)
            .is_some_and(|outputs| outputs.contains_key(&output))
    }

    /// Whether outputs `0..count` all exist; a negative count never matches
    pub fn has_all_checkpoints(&self, activity: Uuid, count: i64) -> bool {
        if count < 0 {
            return false;
        }
        let checkpoints = self.checkpoints.read();
        let outputs = checkpoints.get(&activity);
        (0..count as usize).all(|output| outputs.is_some_and(|o| o.contains_key(&output)))
    }

    pub fn is_linked(&self, activity: Uuid, output: usize) -> bool {
        self.linked.read().contains(&(activity, output))
    }

    /// All checkpoints ordered by activity and output
    pub fn checkpoints(&self) -> Vec<CheckpointSummary> {
        let checkpoints = self.checkpoints.read();
        let linked = self.linked.read();
        let mut summaries: Vec<CheckpointSummary> = checkpoints
            .iter()
            .flat_map(|(activity, outputs)| {
                outputs.iter().map(|(output, checkpoint)| {
                    let metadata = checkpoint.metadata();
                    CheckpointSummary {
                        activity_id: *activity,
                        output_index: *output,
                        data_model: checkpoint.data_model(),
                        entity: checkpoint.entity().name().to_string(),
                        tuple_count: metadata.tuple_count(),
                        open: metadata.is_open(),
                        discarded: metadata.is_discarded(),
                        linked: linked.contains(&(*activity, *output)),
                    }
                })
            })
            .collect();
        summaries.sort_by(|a, b| (a.activity_id, a.output_index).cmp(&(b.activity_id, b.output_index)));
        summaries
    }

    /// Expose another session's checkpoint under this session's identity
    ///
    /// The checkpoint is readable like an owned one but `drop_checkpoints` never drops
    /// its entity.
    pub fn link_checkpoint(&self, activity: Uuid, output: usize, reader: &CheckpointReader) -> StorageResult<()> {
        self.ensure_open()?;
        if self.has_checkpoint(activity, output) {
            return Err(StorageError::IllegalState(format!(
                "{} already has a checkpoint",
                describe(activity, output)
            )));
        }
        self.register(activity, output, Checkpoint::from_reader(reader));
        self.linked.write().insert((activity, output));
        tracing::info!("🔗 Linked {} to {}", describe(activity, output), reader.entity().name());
        Ok(())
    }

    // Dropping

    /// Drop every owned checkpoint of an activity and forget all of its outputs
    ///
    /// Linked checkpoints are forgotten without touching their entities. Each drop takes
    /// an EXCLUSIVE schema lock, so it waits for open readers and reports `Deadlock` when
    /// they outlive the lock timeout. Outputs whose drop failed stay registered. Every
    /// entity is attempted; the first failure is returned afterwards.
    pub async fn drop_checkpoints(&self, activity: Uuid) -> StorageResult<()> {
        let outputs = self.checkpoints.write().remove(&activity).unwrap_or_default();
        let mut first_error = None;
        for (output, checkpoint) in outputs {
            let was_linked = self.linked.write().remove(&(activity, output));
            if was_linked {
                tracing::debug!("🔗 Forgetting linked {}", describe(activity, output));
                continue;
            }
            if let Err(e) = self.drop_entity(&checkpoint.entity()).await {
                tracing::error!("❌ Failed to drop {}: {}", describe(activity, output), e);
                self.register(activity, output, checkpoint);
                keep_first(&mut first_error, Err(e));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn drop_all_checkpoints(&self) -> StorageResult<()> {
        let activities: Vec<Uuid> = self.checkpoints.read().keys().copied().collect();
        let mut first_error = None;
        for activity in activities {
            keep_first(&mut first_error, self.drop_checkpoints(activity).await);
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn drop_entity(&self, entity: &LogicalEntity) -> StorageResult<()> {
        let namespace = entity.namespace_id();
        let tx = self
            .handles
            .transactions
            .start_transaction(namespace, ORIGIN_DROP_CHECKPOINT)
            .await?;
        let result = async {
            // Waits for every open reader of the namespace; dropping a graph also removes its namespace
            self.acquire_schema_lock(tx.as_ref(), namespace, LockType::Exclusive)
                .await?;
            match entity {
                LogicalEntity::Table(table) => self.handles.ddl.drop_table(table, tx.as_ref()).await,
                LogicalEntity::Collection(collection) => {
                    self.handles.ddl.drop_collection(collection, tx.as_ref()).await
                }
                LogicalEntity::Graph(graph) => self.handles.ddl.drop_graph(graph.id, true, tx.as_ref()).await,
            }
        }
        .await;
        finish_ddl(tx.as_ref(), result).await?;
        tracing::debug!("🗑️ Dropped checkpoint entity {}", quoted_identifier(entity));
        Ok(())
    }

    async fn drop_namespaces(&self) -> StorageResult<()> {
        let namespaces: Vec<(NamespaceId, String)> = self
            .namespaces
            .read()
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect();
        if namespaces.is_empty() {
            return Ok(());
        }

        let tx = self
            .handles
            .transactions
            .start_transaction(self.rel_namespace, ORIGIN_DROP_NAMESPACES)
            .await?;
        let result = async {
            for (id, name) in &namespaces {
                self.acquire_schema_lock(tx.as_ref(), *id, LockType::Exclusive).await?;
                self.handles.ddl.drop_namespace(name, true, tx.as_ref()).await?;
            }
            Ok(())
        }
        .await;
        finish_ddl(tx.as_ref(), result).await?;

        self.namespaces.write().clear();
        tracing::info!("🗑️ Dropped {} namespaces of session {}", namespaces.len(), self.session_id);
        Ok(())
    }

    // Transactions

    /// Transaction an activity should run its own statements in
    ///
    /// Local transactions are created on first request and reused until committed or
    /// rolled back. Common transactions must have been started with `start_common`.
    pub async fn transaction(&self, activity: Uuid, scope: TransactionScope) -> StorageResult<Arc<dyn Transaction>> {
        self.ensure_open()?;
        match scope {
            TransactionScope::Local => {
                let existing = self.local_transactions.lock().get(&activity).cloned();
                if let Some(tx) = existing {
                    return Ok(tx);
                }
                let tx = self
                    .handles
                    .transactions
                    .start_transaction(self.rel_namespace, ORIGIN_LOCAL)
                    .await?;
                let (chosen, spare) = {
                    let mut locals = self.local_transactions.lock();
                    match locals.get(&activity) {
                        Some(winner) => (Arc::clone(winner), Some(tx)),
                        None => {
                            locals.insert(activity, Arc::clone(&tx));
                            (tx, None)
                        }
                    }
                };
                // Another task registered a local transaction for this activity first
                if let Some(spare) = spare {
                    if let Err(e) = spare.rollback(None).await {
                        tracing::warn!("⚠️ Failed to roll back spare local transaction of {}: {}", activity, e);
                    }
                }
                Ok(chosen)
            }
            TransactionScope::Common(phase) => self
                .common_transactions
                .lock()
                .get(&phase)
                .cloned()
                .ok_or_else(|| StorageError::IllegalState(format!("common {} transaction was not started", phase))),
        }
    }

    pub async fn commit_transaction(&self, activity: Uuid) -> StorageResult<()> {
        let tx = self.local_transactions.lock().remove(&activity);
        match tx {
            Some(tx) if tx.is_active() => tx.commit().await,
            _ => Ok(()),
        }
    }

    pub async fn rollback_transaction(&self, activity: Uuid) -> StorageResult<()> {
        let tx = self.local_transactions.lock().remove(&activity);
        match tx {
            Some(tx) => tx.rollback(None).await,
            None => Ok(()),
        }
    }

    pub async fn start_common(&self, phase: CommonPhase) -> StorageResult<()> {
        self.ensure_open()?;
        if self.is_common_active(phase) {
            return Err(StorageError::IllegalState(format!(
                "common {} transaction is already running",
                phase
            )));
        }
        let tx = self
            .handles
            .transactions
            .start_transaction(self.rel_namespace, phase.origin())
            .await?;
        self.common_transactions.lock().insert(phase, tx);
        tracing::info!("🔄 Started common {} transaction for session {}", phase, self.session_id);
        Ok(())
    }

    pub async fn commit_common(&self, phase: CommonPhase) -> StorageResult<()> {
        let tx = self.common_transactions.lock().remove(&phase);
        match tx {
            Some(tx) if tx.is_active() => tx.commit().await,
            Some(_) => Ok(()),
            None => Err(StorageError::IllegalState(format!(
                "common {} transaction was not started",
                phase
            ))),
        }
    }

    /// Roll back the phase's transaction if one is running
    pub async fn rollback_common(&self, phase: CommonPhase) -> StorageResult<()> {
        let tx = self.common_transactions.lock().remove(&phase);
        match tx {
            Some(tx) => tx.rollback(None).await,
            None => Ok(()),
        }
    }

    pub fn is_common_active(&self, phase: CommonPhase) -> bool {
        self.common_transactions
            .lock()
            .get(&phase)
            .is_some_and(|tx| tx.is_active())
    }

    // Teardown

    /// Release everything the session holds
    ///
    /// Common and local transactions still running are rolled back with a warning,
    /// owned checkpoints are dropped, then every registered namespace. Each step runs
    /// even if an earlier one failed; the first failure is returned. Closing twice is
    /// a no-op. The session is only marked closed in the manifest when teardown fully
    /// succeeded, so the startup sweep retries anything left behind.
    pub async fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("🛑 Closing storage session {}", self.session_id);
        let mut first_error = None;

        let commons: Vec<(CommonPhase, Arc<dyn Transaction>)> = self.common_transactions.lock().drain().collect();
        for (phase, tx) in commons {
            if !tx.is_active() {
                continue;
            }
            if tx.statement_count() > 0 {
                tracing::warn!(
                    "⚠️ Common {} transaction has {} pending statements and should have been committed or rolled back",
                    phase,
                    tx.statement_count()
                );
            }
            keep_first(&mut first_error, tx.rollback(Some("storage session closed")).await);
        }

        let locals: Vec<(Uuid, Arc<dyn Transaction>)> = self.local_transactions.lock().drain().collect();
        for (activity, tx) in locals {
            if tx.is_active() {
                tracing::warn!("⚠️ Local transaction of activity {} was still active, rolling back", activity);
            }
            keep_first(&mut first_error, tx.rollback(Some("storage session closed")).await);
        }

        keep_first(&mut first_error, self.drop_all_checkpoints().await);
        keep_first(&mut first_error, self.drop_namespaces().await);

        match first_error {
            None => {
                if let Some(manifest) = &self.manifest {
                    manifest.mark_closed(&self.session_id).await?;
                }
                tracing::info!("✅ Closed storage session {}", self.session_id);
                Ok(())
            }
            Some(e) => {
                tracing::error!("❌ Storage session {} closed with errors: {}", self.session_id, e);
                Err(e)
            }
        }
    }

    // Helpers

    fn ensure_open(&self) -> StorageResult<()> {
        if self.is_closed() {
            return Err(StorageError::IllegalState(format!(
                "storage session {} is closed",
                self.session_id
            )));
        }
        Ok(())
    }

    fn ensure_vacant(&self, activity: Uuid, output: usize) -> StorageResult<()> {
        if self.has_checkpoint(activity, output) {
            return Err(StorageError::IllegalState(format!(
                "{} already has a checkpoint",
                describe(activity, output)
            )));
        }
        Ok(())
    }

    fn check_store(&self, store: &str) -> StorageResult<()> {
        if !self.handles.adapters.has_store(store) {
            return Err(StorageError::InvalidArgument(format!("adapter does not exist: {}", store)));
        }
        Ok(())
    }

    /// Explicit store, or the session default when none or an empty name is given
    fn resolve_store(&self, model: DataModel, store: Option<&str>) -> StorageResult<String> {
        let store = match store {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.default_store(model),
        };
        self.check_store(&store)?;
        Ok(store)
    }

    fn checkpoint(&self, activity: Uuid, output: usize) -> StorageResult<Checkpoint> {
        self.checkpoints
            .read()
            .get(&activity)
            .and_then(|outputs| outputs.get(&output))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("checkpoint does not exist for {}", describe(activity, output))))
    }

    fn register(&self, activity: Uuid, output: usize, checkpoint: Checkpoint) {
        self.checkpoints
            .write()
            .entry(activity)
            .or_default()
            .insert(output, checkpoint);
    }

    async fn writer_core(
        &self,
        entity: LogicalEntity,
        activity: Uuid,
        output: usize,
        origin: &str,
    ) -> StorageResult<WriterCore> {
        let tx = match self
            .handles
            .transactions
            .start_transaction(entity.namespace_id(), origin)
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                // The entity is not registered yet, so nothing else would drop it
                tracing::error!("❌ Could not start the writer for {}: {}", describe(activity, output), e);
                match self.drop_entity(&entity).await {
                    Ok(()) => {
                        if let LogicalEntity::Graph(graph) = &entity {
                            self.namespaces.write().remove(&graph.namespace_id);
                        }
                    }
                    Err(drop_error) => {
                        tracing::error!("❌ Failed to drop {}: {}", quoted_identifier(&entity), drop_error)
                    }
                }
                return Err(e);
            }
        };
        Ok(WriterCore::new(
            self.bridge.clone(),
            tx,
            quoted_identifier(&entity),
            describe(activity, output),
        ))
    }

    /// Lock a namespace if it still exists; a dropped graph namespace needs no lock
    async fn acquire_schema_lock(&self, tx: &dyn Transaction, namespace: NamespaceId, lock: LockType) -> StorageResult<()> {
        match self.handles.catalog.namespace(namespace) {
            Some(namespace) => tx.acquire_lock(&namespace, lock).await,
            None => Ok(()),
        }
    }
}

fn describe(activity: Uuid, output: usize) -> String {
    format!("output {} of activity {}", output, activity)
}

fn keep_first(first: &mut Option<StorageError>, result: StorageResult<()>) {
    if let Err(e) = result {
        if first.is_none() {
            *first = Some(e);
        }
    }
}

/// Commit a DDL transaction on success, roll it back otherwise
async fn finish_ddl<T>(tx: &dyn Transaction, result: StorageResult<T>) -> StorageResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if tx.is_active() {
                let cause = e.to_string();
                if let Err(rollback) = tx.rollback(Some(&cause)).await {
                    tracing::error!("❌ Rollback of {} failed: {}", tx.origin(), rollback);
                }
            }
            Err(e)
        }
    }
}
