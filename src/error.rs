/// Error taxonomy for the checkpoint storage layer
///
/// Every failure either surfaces immediately or is wrapped with enough context
/// (activity, output index, expected vs. actual counts) for the workflow engine to
/// decide whether the whole activity should be retried. Nothing here is retried.

use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by the bridge, metadata, writers, readers and the storage manager
#[derive(Debug, Error)]
pub enum StorageError {
    /// Malformed query text
    #[error("parse error: {0}")]
    Parse(String),

    /// Query is well formed but references unknown or forbidden entities
    #[error("validation error: {0}")]
    Validation(String),

    /// The engine failed while executing a plan
    #[error("execution failed ({context}): {source}")]
    Execution {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A flush affected fewer tuples than were in the batch
    #[error("partial write to {entity}: expected {expected} affected tuples, got {actual}")]
    PartialWrite {
        entity: String,
        expected: u64,
        actual: u64,
    },

    /// Mutation of closed metadata or use of a released writer/reader
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Checkpoint, namespace or entity lookup miss
    #[error("not found: {0}")]
    NotFound(String),

    /// Schema lock could not be acquired
    #[error("deadlock while acquiring {lock} lock on namespace {namespace}")]
    Deadlock { namespace: String, lock: String },

    /// Metadata or entity is not of the requested data model
    #[error("type mismatch: expected {expected} but found {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Caller supplied an unusable argument (row type, store name, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Failure inside a writer or reader, wrapping the underlying cause
    #[error("{context}: {source}")]
    Runtime {
        context: String,
        #[source]
        source: Box<StorageError>,
    },

    /// Session manifest persistence failed
    #[error("session manifest error: {0}")]
    Manifest(#[from] sqlx::Error),
}

impl StorageError {
    /// Wrap an arbitrary engine failure as an execution error
    pub fn execution(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        StorageError::Execution {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Wrap this error with writer/reader context
    pub fn wrap(self, context: impl Into<String>) -> Self {
        StorageError::Runtime {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through runtime wrappers
    pub fn root(&self) -> &StorageError {
        match self {
            StorageError::Runtime { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), StorageError::NotFound(_))
    }

    pub fn is_deadlock(&self) -> bool {
        matches!(self.root(), StorageError::Deadlock { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_error_keeps_root() {
        let err = StorageError::PartialWrite {
            entity: "t_x_0".to_string(),
            expected: 10,
            actual: 7,
        }
        .wrap("flush of relational batch");

        assert!(matches!(
            err.root(),
            StorageError::PartialWrite { expected: 10, actual: 7, .. }
        ));
        assert!(err.to_string().contains("flush of relational batch"));
    }
}
