/// Plan evaluation for the in-process engine
///
/// Dispatches on the algebra node type: read operators produce an in-memory relation,
/// insert operators validate the whole batch first and then apply it, returning the
/// undo entry the owning transaction has to keep.

use super::state::{EngineState, TableData, UndoEntry};
use super::WriteFault;
use crate::engine::{AlgebraNode, CompareOp, GraphElement, LogicalEntity, Predicate};
use crate::error::{StorageError, StorageResult};
use crate::model::{RowType, Tuple};
use serde_json::Value;
use std::cmp::Ordering;

/// Intermediate result of a read operator
#[derive(Debug)]
pub(crate) struct Relation {
    pub(crate) row_type: Option<RowType>,
    pub(crate) tuples: Vec<Tuple>,
}

/// Evaluate a read-only operator tree
pub(crate) fn evaluate(node: &AlgebraNode, state: &EngineState) -> StorageResult<Relation> {
    match node {
        AlgebraNode::Scan { entity } => scan(entity, state),
        AlgebraNode::ScanGraph { graph, element, label } => {
            let data = state
                .graph(graph.id)
                .ok_or_else(|| missing_entity(&graph.name))?;
            let has_label = |labels: &[String]| label.as_ref().map_or(true, |l| labels.contains(l));
            let tuples = match element {
                GraphElement::Nodes => data
                    .nodes
                    .iter()
                    .filter(|n| has_label(&n.labels))
                    .cloned()
                    .map(Tuple::Node)
                    .collect(),
                GraphElement::Edges => data
                    .edges
                    .iter()
                    .filter(|e| has_label(&e.labels))
                    .cloned()
                    .map(Tuple::Edge)
                    .collect(),
            };
            Ok(Relation { row_type: None, tuples })
        }
        AlgebraNode::Filter { input, predicates } => {
            let Relation { row_type, tuples } = evaluate(input, state)?;
            let tuples = tuples
                .into_iter()
                .filter(|t| {
                    predicates
                        .iter()
                        .all(|p| matches_predicate(t, row_type.as_ref(), p))
                })
                .collect();
            Ok(Relation { row_type, tuples })
        }
        AlgebraNode::Project { input, fields } => {
            let Relation { row_type, tuples } = evaluate(input, state)?;
            project(row_type, tuples, fields)
        }
        AlgebraNode::Sort { input, field, descending } => {
            let Relation { row_type, mut tuples } = evaluate(input, state)?;
            tuples.sort_by(|a, b| {
                let left = field_value(a, row_type.as_ref(), field);
                let right = field_value(b, row_type.as_ref(), field);
                let ordering = match (&left, &right) {
                    (None, None) => Ordering::Equal,
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (Some(l), Some(r)) => compare_values(l, r).unwrap_or(Ordering::Equal),
                };
                if *descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
            Ok(Relation { row_type, tuples })
        }
        AlgebraNode::Limit { input, count } => {
            let mut relation = evaluate(input, state)?;
            relation.tuples.truncate(*count);
            Ok(relation)
        }
        AlgebraNode::InsertRows { .. }
        | AlgebraNode::InsertDocuments { .. }
        | AlgebraNode::InsertNodes { .. }
        | AlgebraNode::InsertEdges { .. } => Err(StorageError::IllegalState(
            "insert operator evaluated as a query".to_string(),
        )),
    }
}

fn scan(entity: &LogicalEntity, state: &EngineState) -> StorageResult<Relation> {
    match entity {
        LogicalEntity::Table(table) => {
            let data = state
                .table(table.namespace_id, &table.name)
                .ok_or_else(|| missing_entity(&table.name))?;
            Ok(Relation {
                row_type: Some(data.table.row_type.clone()),
                tuples: data.rows.iter().cloned().map(Tuple::Row).collect(),
            })
        }
        LogicalEntity::Collection(collection) => {
            let data = state
                .collection(collection.namespace_id, &collection.name)
                .ok_or_else(|| missing_entity(&collection.name))?;
            Ok(Relation {
                row_type: None,
                tuples: data.documents.iter().cloned().map(Tuple::Document).collect(),
            })
        }
        LogicalEntity::Graph(graph) => {
            let data = state
                .graph(graph.id)
                .ok_or_else(|| missing_entity(&graph.name))?;
            let mut tuples: Vec<Tuple> = data.nodes.iter().cloned().map(Tuple::Node).collect();
            tuples.extend(data.edges.iter().cloned().map(Tuple::Edge));
            Ok(Relation { row_type: None, tuples })
        }
    }
}

fn project(row_type: Option<RowType>, tuples: Vec<Tuple>, fields: &[String]) -> StorageResult<Relation> {
    match row_type {
        Some(row_type) => {
            let indices = fields
                .iter()
                .map(|f| {
                    row_type
                        .index_of(f)
                        .ok_or_else(|| StorageError::execution("projection", format!("unknown column '{}'", f)))
                })
                .collect::<StorageResult<Vec<usize>>>()?;
            let projected_type = RowType::new(indices.iter().map(|&i| row_type.fields[i].clone()).collect());
            let tuples = tuples
                .into_iter()
                .map(|t| match t {
                    Tuple::Row(row) => Tuple::Row(indices.iter().map(|&i| row[i].clone()).collect()),
                    other => other,
                })
                .collect();
            Ok(Relation {
                row_type: Some(projected_type),
                tuples,
            })
        }
        None => {
            let tuples = tuples
                .into_iter()
                .map(|t| match t {
                    Tuple::Document(Value::Object(doc)) => Tuple::Document(Value::Object(
                        doc.into_iter().filter(|(k, _)| fields.contains(k)).collect(),
                    )),
                    other => other,
                })
                .collect();
            Ok(Relation { row_type: None, tuples })
        }
    }
}

/// Value of a named field; documents accept dotted paths
pub(crate) fn field_value(tuple: &Tuple, row_type: Option<&RowType>, field: &str) -> Option<Value> {
    match tuple {
        Tuple::Row(row) => row_type
            .and_then(|rt| rt.index_of(field))
            .and_then(|i| row.get(i).cloned()),
        Tuple::Document(doc) => {
            let mut current = doc;
            for part in field.split('.') {
                current = current.as_object()?.get(part)?;
            }
            Some(current.clone())
        }
        Tuple::Node(node) => match field {
            "id" => Some(Value::String(node.id.clone())),
            _ => node.properties.get(field).cloned(),
        },
        Tuple::Edge(edge) => match field {
            "id" => Some(Value::String(edge.id.clone())),
            "source" => Some(Value::String(edge.source.clone())),
            "target" => Some(Value::String(edge.target.clone())),
            _ => edge.properties.get(field).cloned(),
        },
    }
}

/// Ordering between two JSON scalars of the same kind
pub(crate) fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        (Value::Number(l), Value::Number(r)) => match (l.as_i64(), r.as_i64()) {
            (Some(l), Some(r)) => Some(l.cmp(&r)),
            _ => l.as_f64()?.partial_cmp(&r.as_f64()?),
        },
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn matches_predicate(tuple: &Tuple, row_type: Option<&RowType>, predicate: &Predicate) -> bool {
    let value = match field_value(tuple, row_type, &predicate.field) {
        Some(value) => value,
        None => return predicate.op == CompareOp::NotEq && !predicate.value.is_null(),
    };
    if value.is_null() || predicate.value.is_null() {
        // Comparisons with NULL only hold for (NOT) equality against NULL itself
        return match predicate.op {
            CompareOp::Eq => value.is_null() && predicate.value.is_null(),
            CompareOp::NotEq => value.is_null() != predicate.value.is_null(),
            _ => false,
        };
    }
    let ordering = match compare_values(&value, &predicate.value) {
        Some(ordering) => ordering,
        None => return predicate.op == CompareOp::NotEq,
    };
    match predicate.op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::NotEq => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::LtEq => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::GtEq => ordering != Ordering::Less,
    }
}

/// Apply an insert operator and return (affected tuples, undo entry)
pub(crate) fn apply_insert(
    node: &AlgebraNode,
    state: &mut EngineState,
    fault: Option<WriteFault>,
) -> StorageResult<(u64, UndoEntry)> {
    if let Some(WriteFault::Fail(message)) = &fault {
        return Err(StorageError::execution("injected write fault", message.clone()));
    }
    let dropped = match fault {
        Some(WriteFault::Truncate(count)) => count,
        _ => 0,
    };

    match node {
        AlgebraNode::InsertRows { table, rows } => {
            let data = state
                .table_mut(table.namespace_id, &table.name)
                .map_err(|_| missing_entity(&table.name))?;
            validate_rows(data, rows)?;

            let pk_indices = data.pk_indices();
            let applied = rows.len().saturating_sub(dropped);
            for row in rows.iter().take(applied) {
                data.keys.insert(TableData::key_of(row, &pk_indices));
                data.rows.push(row.clone());
            }
            Ok((
                applied as u64,
                UndoEntry::InsertedRows {
                    namespace: table.namespace_id,
                    table: table.name.clone(),
                    count: applied,
                },
            ))
        }
        AlgebraNode::InsertDocuments { collection, documents } => {
            let data = state
                .collection_mut(collection.namespace_id, &collection.name)
                .map_err(|_| missing_entity(&collection.name))?;
            if let Some(bad) = documents.iter().find(|d| !d.is_object()) {
                return Err(StorageError::execution(
                    format!("insert into {}", collection.name),
                    format!("documents must be JSON objects, got {}", bad),
                ));
            }
            let applied = documents.len().saturating_sub(dropped);
            data.documents.extend(documents.iter().take(applied).cloned());
            Ok((
                applied as u64,
                UndoEntry::InsertedDocuments {
                    namespace: collection.namespace_id,
                    collection: collection.name.clone(),
                    count: applied,
                },
            ))
        }
        AlgebraNode::InsertNodes { graph, nodes } => {
            let data = state.graph_mut(graph.id).map_err(|_| missing_entity(&graph.name))?;
            let mut incoming = std::collections::HashSet::new();
            for node in nodes {
                if data.node_ids.contains(&node.id) || !incoming.insert(node.id.as_str()) {
                    return Err(StorageError::execution(
                        format!("insert into graph {}", graph.name),
                        format!("duplicate node id '{}'", node.id),
                    ));
                }
            }
            let applied = nodes.len().saturating_sub(dropped);
            for node in nodes.iter().take(applied) {
                data.node_ids.insert(node.id.clone());
                data.nodes.push(node.clone());
            }
            Ok((
                applied as u64,
                UndoEntry::InsertedNodes {
                    namespace: graph.id,
                    count: applied,
                },
            ))
        }
        AlgebraNode::InsertEdges { graph, edges } => {
            let data = state.graph_mut(graph.id).map_err(|_| missing_entity(&graph.name))?;
            let applied = edges.len().saturating_sub(dropped);
            data.edges.extend(edges.iter().take(applied).cloned());
            Ok((
                applied as u64,
                UndoEntry::InsertedEdges {
                    namespace: graph.id,
                    count: applied,
                },
            ))
        }
        _ => Err(StorageError::IllegalState(
            "read operator executed as an insert".to_string(),
        )),
    }
}

/// Arity, NOT NULL and primary-key checks for a whole batch
fn validate_rows(data: &TableData, rows: &[Vec<Value>]) -> StorageResult<()> {
    let context = format!("insert into {}", data.table.name);
    let row_type = &data.table.row_type;
    let pk_indices = data.pk_indices();
    let mut batch_keys = std::collections::HashSet::new();

    for row in rows {
        if row.len() != row_type.field_count() {
            return Err(StorageError::execution(
                context,
                format!("expected {} values per row, got {}", row_type.field_count(), row.len()),
            ));
        }
        for (field, value) in row_type.fields.iter().zip(row) {
            if !field.nullable && value.is_null() {
                return Err(StorageError::execution(
                    context,
                    format!("NULL value for NOT NULL column '{}'", field.name),
                ));
            }
        }
        if !pk_indices.is_empty() {
            let key = TableData::key_of(row, &pk_indices);
            if data.keys.contains(&key) || !batch_keys.insert(key.clone()) {
                return Err(StorageError::execution(
                    context,
                    format!("duplicate primary key {}", key),
                ));
            }
        }
    }
    Ok(())
}

fn missing_entity(name: &str) -> StorageError {
    StorageError::execution("plan execution", format!("entity '{}' no longer exists", name))
}
