/// Per-checkpoint metadata with an open/closed discipline
///
/// Metadata is mutable while the owning writer is open. `close()` is one-way: after it,
/// every mutator fails with `IllegalState` and `is_open()` stays false. Field and label
/// inventories are capped so previews stay small for wide documents and graphs.

use crate::error::{StorageError, StorageResult};
use crate::model::{DataModel, Field, RowType};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Maximum number of distinct field names or labels kept in a preview
pub const MAX_PREVIEW_ENTRIES: usize = 20;

/// Capped, insertion-ordered set of names
#[derive(Debug, Default, Clone)]
struct BoundedNames {
    names: Vec<String>,
    truncated: bool,
}

impl BoundedNames {
    /// Returns false if the cap dropped the name
    fn insert(&mut self, name: &str) -> bool {
        if self.names.iter().any(|n| n == name) {
            return true;
        }
        if self.names.len() >= MAX_PREVIEW_ENTRIES {
            self.truncated = true;
            return false;
        }
        self.names.push(name.to_string());
        true
    }

    fn insert_all<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) -> bool {
        // Every name is offered, even after one was dropped
        names.into_iter().fold(true, |all, name| self.insert(name) && all)
    }
}

fn closed_error(model: DataModel, mutator: &str) -> StorageError {
    StorageError::IllegalState(format!("{} on closed {} metadata", mutator, model))
}

#[derive(Debug)]
struct RelState {
    open: bool,
    discarded: bool,
    tuple_count: Option<u64>,
}

/// Metadata of a relational checkpoint
#[derive(Debug)]
pub struct RelMetadata {
    row_type: RowType,
    state: RwLock<RelState>,
}

impl RelMetadata {
    pub fn new(row_type: RowType) -> Self {
        Self {
            row_type,
            state: RwLock::new(RelState {
                open: true,
                discarded: false,
                tuple_count: None,
            }),
        }
    }

    pub fn row_type(&self) -> &RowType {
        &self.row_type
    }

    pub fn tuple_count(&self) -> u64 {
        self.state.read().tuple_count.unwrap_or(0)
    }

    /// First write wins; later calls are ignored while a count is set
    pub fn set_tuple_count(&self, count: u64) -> StorageResult<()> {
        let mut state = self.state.write();
        if !state.open {
            return Err(closed_error(DataModel::Relational, "set_tuple_count"));
        }
        match state.tuple_count {
            Some(existing) => {
                tracing::debug!("Ignoring tuple count {}, already set to {}", count, existing);
            }
            None => state.tuple_count = Some(count),
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.state.read().open
    }

    pub fn close(&self) {
        self.state.write().open = false;
    }

    /// Close as the result of a failed or aborted write; the checkpoint holds no data
    pub fn discard(&self) {
        let mut state = self.state.write();
        state.open = false;
        state.discarded = true;
    }

    pub fn is_discarded(&self) -> bool {
        self.state.read().discarded
    }
}

#[derive(Debug)]
struct DocState {
    open: bool,
    discarded: bool,
    tuple_count: u64,
    fields: BoundedNames,
}

/// Metadata of a document checkpoint
#[derive(Debug)]
pub struct DocMetadata {
    state: RwLock<DocState>,
}

impl Default for DocMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl DocMetadata {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(DocState {
                open: true,
                discarded: false,
                tuple_count: 0,
                fields: BoundedNames::default(),
            }),
        }
    }

    pub fn tuple_count(&self) -> u64 {
        self.state.read().tuple_count
    }

    pub fn set_tuple_count(&self, count: u64) -> StorageResult<()> {
        let mut state = self.state.write();
        if !state.open {
            return Err(closed_error(DataModel::Document, "set_tuple_count"));
        }
        state.tuple_count = count;
        Ok(())
    }

    /// Returns false if the field cap dropped the name
    pub fn add_field(&self, name: &str) -> StorageResult<bool> {
        let mut state = self.state.write();
        if !state.open {
            return Err(closed_error(DataModel::Document, "add_field"));
        }
        Ok(state.fields.insert(name))
    }

    /// Add the top-level field names of a document
    pub fn add_fields(&self, document: &Value) -> StorageResult<bool> {
        let mut state = self.state.write();
        if !state.open {
            return Err(closed_error(DataModel::Document, "add_fields"));
        }
        Ok(match document.as_object() {
            Some(object) => state.fields.insert_all(object.keys().map(String::as_str)),
            None => true,
        })
    }

    pub fn field_names(&self) -> Vec<String> {
        self.state.read().fields.names.clone()
    }

    /// False once the cap dropped at least one field name
    pub fn is_complete(&self) -> bool {
        !self.state.read().fields.truncated
    }

    pub fn is_open(&self) -> bool {
        self.state.read().open
    }

    pub fn close(&self) {
        self.state.write().open = false;
    }

    /// Close as the result of a failed or aborted write; the checkpoint holds no data
    pub fn discard(&self) {
        let mut state = self.state.write();
        state.open = false;
        state.discarded = true;
    }

    pub fn is_discarded(&self) -> bool {
        self.state.read().discarded
    }
}

#[derive(Debug)]
struct LpgState {
    open: bool,
    discarded: bool,
    node_count: u64,
    edge_count: u64,
    node_labels: BoundedNames,
    edge_labels: BoundedNames,
}

/// Metadata of a graph checkpoint
///
/// Node and edge counts may be set any number of times since node and edge batches
/// are flushed independently.
#[derive(Debug)]
pub struct LpgMetadata {
    state: RwLock<LpgState>,
}

impl Default for LpgMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl LpgMetadata {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LpgState {
                open: true,
                discarded: false,
                node_count: 0,
                edge_count: 0,
                node_labels: BoundedNames::default(),
                edge_labels: BoundedNames::default(),
            }),
        }
    }

    pub fn node_count(&self) -> u64 {
        self.state.read().node_count
    }

    pub fn edge_count(&self) -> u64 {
        self.state.read().edge_count
    }

    /// Derived from node and edge counts
    pub fn tuple_count(&self) -> u64 {
        let state = self.state.read();
        state.node_count + state.edge_count
    }

    pub fn set_node_count(&self, count: u64) -> StorageResult<()> {
        let mut state = self.state.write();
        if !state.open {
            return Err(closed_error(DataModel::Graph, "set_node_count"));
        }
        state.node_count = count;
        Ok(())
    }

    pub fn set_edge_count(&self, count: u64) -> StorageResult<()> {
        let mut state = self.state.write();
        if !state.open {
            return Err(closed_error(DataModel::Graph, "set_edge_count"));
        }
        state.edge_count = count;
        Ok(())
    }

    pub fn add_node_labels(&self, labels: &[String]) -> StorageResult<bool> {
        let mut state = self.state.write();
        if !state.open {
            return Err(closed_error(DataModel::Graph, "add_node_labels"));
        }
        Ok(state.node_labels.insert_all(labels.iter().map(String::as_str)))
    }

    pub fn add_edge_labels(&self, labels: &[String]) -> StorageResult<bool> {
        let mut state = self.state.write();
        if !state.open {
            return Err(closed_error(DataModel::Graph, "add_edge_labels"));
        }
        Ok(state.edge_labels.insert_all(labels.iter().map(String::as_str)))
    }

    pub fn node_labels(&self) -> Vec<String> {
        self.state.read().node_labels.names.clone()
    }

    pub fn edge_labels(&self) -> Vec<String> {
        self.state.read().edge_labels.names.clone()
    }

    pub fn is_complete(&self) -> bool {
        let state = self.state.read();
        !state.node_labels.truncated && !state.edge_labels.truncated
    }

    pub fn is_open(&self) -> bool {
        self.state.read().open
    }

    pub fn close(&self) {
        self.state.write().open = false;
    }

    /// Close as the result of a failed or aborted write; the checkpoint holds no data
    pub fn discard(&self) {
        let mut state = self.state.write();
        state.open = false;
        state.discarded = true;
    }

    pub fn is_discarded(&self) -> bool {
        self.state.read().discarded
    }
}

/// Serializable summary of what a checkpoint contains
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "model", rename_all = "lowercase")]
pub enum TypePreview {
    Relational {
        fields: Vec<Field>,
    },
    Document {
        fields: Vec<String>,
        complete: bool,
    },
    Graph {
        node_labels: Vec<String>,
        edge_labels: Vec<String>,
        complete: bool,
    },
}

/// Metadata of any checkpoint
#[derive(Debug, Clone)]
pub enum CheckpointMetadata {
    Relational(Arc<RelMetadata>),
    Document(Arc<DocMetadata>),
    Graph(Arc<LpgMetadata>),
}

impl CheckpointMetadata {
    pub fn data_model(&self) -> DataModel {
        match self {
            CheckpointMetadata::Relational(_) => DataModel::Relational,
            CheckpointMetadata::Document(_) => DataModel::Document,
            CheckpointMetadata::Graph(_) => DataModel::Graph,
        }
    }

    pub fn tuple_count(&self) -> u64 {
        match self {
            CheckpointMetadata::Relational(m) => m.tuple_count(),
            CheckpointMetadata::Document(m) => m.tuple_count(),
            CheckpointMetadata::Graph(m) => m.tuple_count(),
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            CheckpointMetadata::Relational(m) => m.is_open(),
            CheckpointMetadata::Document(m) => m.is_open(),
            CheckpointMetadata::Graph(m) => m.is_open(),
        }
    }

    pub fn close(&self) {
        match self {
            CheckpointMetadata::Relational(m) => m.close(),
            CheckpointMetadata::Document(m) => m.close(),
            CheckpointMetadata::Graph(m) => m.close(),
        }
    }

    /// True once the writer failed or was aborted
    pub fn is_discarded(&self) -> bool {
        match self {
            CheckpointMetadata::Relational(m) => m.is_discarded(),
            CheckpointMetadata::Document(m) => m.is_discarded(),
            CheckpointMetadata::Graph(m) => m.is_discarded(),
        }
    }

    pub fn as_rel(&self) -> StorageResult<&Arc<RelMetadata>> {
        match self {
            CheckpointMetadata::Relational(m) => Ok(m),
            other => Err(other.mismatch(DataModel::Relational)),
        }
    }

    pub fn as_doc(&self) -> StorageResult<&Arc<DocMetadata>> {
        match self {
            CheckpointMetadata::Document(m) => Ok(m),
            other => Err(other.mismatch(DataModel::Document)),
        }
    }

    pub fn as_lpg(&self) -> StorageResult<&Arc<LpgMetadata>> {
        match self {
            CheckpointMetadata::Graph(m) => Ok(m),
            other => Err(other.mismatch(DataModel::Graph)),
        }
    }

    pub fn preview(&self) -> TypePreview {
        match self {
            CheckpointMetadata::Relational(m) => TypePreview::Relational {
                fields: m.row_type().fields.clone(),
            },
            CheckpointMetadata::Document(m) => TypePreview::Document {
                fields: m.field_names(),
                complete: m.is_complete(),
            },
            CheckpointMetadata::Graph(m) => TypePreview::Graph {
                node_labels: m.node_labels(),
                edge_labels: m.edge_labels(),
                complete: m.is_complete(),
            },
        }
    }

    fn mismatch(&self, expected: DataModel) -> StorageError {
        StorageError::TypeMismatch {
            expected: format!("{} metadata", expected),
            actual: format!("{} metadata", self.data_model()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldType;
    use serde_json::json;

    #[test]
    fn test_relational_count_first_write_wins() {
        let meta = RelMetadata::new(RowType::new(vec![Field::primary_key()]));
        meta.set_tuple_count(5).unwrap();
        meta.set_tuple_count(9).unwrap();
        assert_eq!(meta.tuple_count(), 5);
    }

    #[test]
    fn test_field_cap_truncation() {
        let meta = DocMetadata::new();
        for i in 0..MAX_PREVIEW_ENTRIES {
            assert!(meta.add_field(&format!("f{}", i)).unwrap());
        }
        // Re-offering a retained name is not a truncation
        assert!(meta.add_field("f0").unwrap());
        assert!(meta.is_complete());

        assert!(!meta.add_field("f20").unwrap());
        let names = meta.field_names();
        assert_eq!(names.len(), MAX_PREVIEW_ENTRIES);
        let earliest: Vec<String> = (0..MAX_PREVIEW_ENTRIES).map(|i| format!("f{}", i)).collect();
        assert!(names.iter().all(|n| earliest.contains(n)));
        assert!(!meta.is_complete());
    }

    #[test]
    fn test_add_fields_reports_partial_retention() {
        let meta = DocMetadata::new();
        let wide: serde_json::Map<String, Value> =
            (0..25).map(|i| (format!("k{:02}", i), json!(i))).collect();
        assert!(!meta.add_fields(&Value::Object(wide)).unwrap());
        assert_eq!(meta.field_names().len(), MAX_PREVIEW_ENTRIES);
        assert!(meta.add_fields(&json!("not an object")).unwrap());
    }

    #[test]
    fn test_metadata_freeze() {
        let rel = CheckpointMetadata::Relational(Arc::new(RelMetadata::new(RowType::new(vec![
            Field::primary_key(),
            Field::new("value", FieldType::Text),
        ]))));
        let doc = CheckpointMetadata::Document(Arc::new(DocMetadata::new()));
        let lpg = CheckpointMetadata::Graph(Arc::new(LpgMetadata::new()));

        for meta in [&rel, &doc, &lpg] {
            assert!(meta.is_open());
            meta.close();
            meta.close();
            assert!(!meta.is_open());
        }

        assert!(matches!(rel.as_rel().unwrap().set_tuple_count(1), Err(StorageError::IllegalState(_))));
        assert!(matches!(doc.as_doc().unwrap().add_field("x"), Err(StorageError::IllegalState(_))));
        assert!(matches!(doc.as_doc().unwrap().set_tuple_count(1), Err(StorageError::IllegalState(_))));
        let graph = lpg.as_lpg().unwrap();
        assert!(matches!(graph.set_node_count(1), Err(StorageError::IllegalState(_))));
        assert!(matches!(
            graph.add_edge_labels(&["KNOWS".to_string()]),
            Err(StorageError::IllegalState(_))
        ));
        assert!(!lpg.is_open());
    }

    #[test]
    fn test_graph_counts_and_labels() {
        let meta = LpgMetadata::new();
        meta.set_node_count(3).unwrap();
        meta.set_node_count(4).unwrap();
        meta.set_edge_count(2).unwrap();
        assert_eq!(meta.tuple_count(), 6);

        assert!(meta.add_node_labels(&["Person".to_string(), "City".to_string()]).unwrap());
        assert!(meta.add_edge_labels(&["LIVES_IN".to_string()]).unwrap());
        assert_eq!(meta.node_labels(), vec!["Person", "City"]);
        assert_eq!(meta.edge_labels(), vec!["LIVES_IN"]);
    }

    #[test]
    fn test_downcast_mismatch() {
        let doc = CheckpointMetadata::Document(Arc::new(DocMetadata::new()));
        assert!(matches!(doc.as_rel(), Err(StorageError::TypeMismatch { .. })));
        assert!(matches!(doc.as_lpg(), Err(StorageError::TypeMismatch { .. })));
        assert!(doc.as_doc().is_ok());
    }
}
