/// Core data model for checkpoint contents
///
/// Defines the data models, relational row types, graph elements and the tuple union
/// that flows through batch writers and checkpoint readers. Field values are plain
/// JSON values so every data model shares one value representation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;

/// Name of the surrogate primary-key column every relational checkpoint starts with
pub const PK_COL: &str = "_key";

/// The data model of a checkpoint, namespace or entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataModel {
    /// Tables with a fixed row type
    Relational,
    /// Schemaless JSON document collections
    Document,
    /// Labeled property graphs
    Graph,
}

impl DataModel {
    pub const ALL: [DataModel; 3] = [DataModel::Relational, DataModel::Document, DataModel::Graph];
}

impl fmt::Display for DataModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataModel::Relational => write!(f, "RELATIONAL"),
            DataModel::Document => write!(f, "DOCUMENT"),
            DataModel::Graph => write!(f, "GRAPH"),
        }
    }
}

/// Column types supported in checkpoint tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    BigInt,
    Integer,
    Double,
    Boolean,
    Text,
    /// Bounded string with maximum length
    Varchar(u32),
    Json,
    Timestamp,
}

impl FieldType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::BigInt | FieldType::Integer | FieldType::Double)
    }

    pub fn is_integral(&self) -> bool {
        matches!(self, FieldType::BigInt | FieldType::Integer)
    }
}

/// A single named column of a row type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

impl Field {
    /// Create a nullable field
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
        }
    }

    /// Create the surrogate primary-key field (`_key BIGINT NOT NULL`)
    pub fn primary_key() -> Self {
        Self {
            name: PK_COL.to_string(),
            field_type: FieldType::BigInt,
            nullable: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Whether this field can act as the single-column numeric primary key
    pub fn is_pk_col(&self) -> bool {
        self.name == PK_COL && self.field_type.is_integral()
    }
}

/// Ordered list of fields describing a relational tuple
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RowType {
    pub fields: Vec<Field>,
}

impl RowType {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Returns the first field name that occurs more than once
    pub fn find_duplicate(&self) -> Option<&str> {
        let mut seen = HashSet::new();
        self.fields
            .iter()
            .map(|f| f.name.as_str())
            .find(|name| !seen.insert(*name))
    }

    /// Copy of this row type with double quotes stripped from all field names
    pub fn without_quotes(&self) -> RowType {
        RowType {
            fields: self
                .fields
                .iter()
                .map(|f| Field {
                    name: f.name.replace('"', ""),
                    ..f.clone()
                })
                .collect(),
        }
    }
}

/// A node of a labeled property graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub labels: Vec<String>,
    pub properties: Map<String, Value>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            labels: Vec::new(),
            properties: Map::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// A directed edge of a labeled property graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub labels: Vec<String>,
    pub properties: Map<String, Value>,
}

impl GraphEdge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            labels: Vec::new(),
            properties: Map::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// Schema of the tuples stored in a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", content = "fields", rename_all = "lowercase")]
pub enum TupleType {
    Relational(RowType),
    /// Documents are schemaless, field inventories live in the metadata
    Document,
    /// Graph elements carry labels and properties, inventories live in the metadata
    Graph,
}

impl TupleType {
    pub fn data_model(&self) -> DataModel {
        match self {
            TupleType::Relational(_) => DataModel::Relational,
            TupleType::Document => DataModel::Document,
            TupleType::Graph => DataModel::Graph,
        }
    }
}

/// One stored element of any data model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Tuple {
    Row(Vec<Value>),
    Document(Value),
    Node(GraphNode),
    Edge(GraphEdge),
}

impl Tuple {
    pub fn data_model(&self) -> DataModel {
        match self {
            Tuple::Row(_) => DataModel::Relational,
            Tuple::Document(_) => DataModel::Document,
            Tuple::Node(_) | Tuple::Edge(_) => DataModel::Graph,
        }
    }

    pub fn as_row(&self) -> Option<&[Value]> {
        match self {
            Tuple::Row(row) => Some(row),
            _ => None,
        }
    }

    pub fn into_row(self) -> Option<Vec<Value>> {
        match self {
            Tuple::Row(row) => Some(row),
            _ => None,
        }
    }

    pub fn into_document(self) -> Option<Value> {
        match self {
            Tuple::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn into_node(self) -> Option<GraphNode> {
        match self {
            Tuple::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn into_edge(self) -> Option<GraphEdge> {
        match self {
            Tuple::Edge(edge) => Some(edge),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pk_col_requires_integral_type() {
        assert!(Field::primary_key().is_pk_col());
        assert!(Field::new(PK_COL, FieldType::Integer).is_pk_col());
        assert!(!Field::new(PK_COL, FieldType::Text).is_pk_col());
        assert!(!Field::new("id", FieldType::BigInt).is_pk_col());
    }

    #[test]
    fn test_row_type_duplicates_and_quotes() {
        let row_type = RowType::new(vec![
            Field::primary_key(),
            Field::new("\"name\"", FieldType::Text),
            Field::new("name", FieldType::Text),
        ]);
        assert_eq!(row_type.find_duplicate(), None);

        let unquoted = row_type.without_quotes();
        assert_eq!(unquoted.find_duplicate(), Some("name"));
        assert_eq!(unquoted.index_of("name"), Some(1));
    }
}
