/// stagestore: checkpoint storage for multi-model workflow runs
///
/// This library stores the intermediate results of workflow activities as relational
/// tables, document collections or property graphs, writes them in byte- and row-bounded
/// batches, streams them back to later activities and tears them down per session.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Data models, row types and tuples
pub mod model;

// Engine collaborator contracts and the in-process reference engine
pub mod engine;

// Query translation and execution bridge
pub mod query;

// Checkpoint metadata, writers, readers and the storage manager
pub mod storage;

// Session manifest and live session registry
pub mod session;

// HTTP API layer - admin endpoints for storage sessions
pub mod api;

// Server setup and initialization
#[cfg(feature = "memory-engine")]
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{StorageError, StorageResult};
pub use model::{DataModel, Field, FieldType, GraphEdge, GraphNode, RowType, Tuple, TupleType};
#[cfg(feature = "memory-engine")]
pub use server::start_server;
pub use storage::{CheckpointReader, CheckpointWriter, CommonPhase, StorageManager, TransactionScope};
