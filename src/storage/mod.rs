/// Checkpoint storage layer
///
/// Everything between a workflow step and the engine: checkpoint metadata, batch
/// writers, streaming readers, the session-scoped storage manager and the startup
/// sweep that reclaims namespaces of crashed sessions.

// Per-checkpoint metadata with open/closed discipline
pub mod metadata;

// Batch writers
pub mod writer;

// Streaming readers
pub mod reader;

// Physical naming of namespaces and entities
pub mod naming;

// Session-scoped orchestrator
pub mod manager;

// Startup garbage collection
pub mod cleanup;

pub use cleanup::{clear_all, CleanupReport};
pub use manager::{
    Checkpoint, CheckpointSummary, CommonPhase, ManagerOptions, StorageManager, TransactionScope,
};
pub use metadata::{CheckpointMetadata, DocMetadata, LpgMetadata, RelMetadata, TypePreview};
pub use reader::{CheckpointGraph, CheckpointReader, DocReader, LpgReader, RelReader};
pub use writer::{
    BatchLimits, CheckpointWriter, DocWriter, LpgWriter, RelWriter, MAX_BYTES_PER_BATCH, MAX_TUPLES_PER_BATCH,
};
