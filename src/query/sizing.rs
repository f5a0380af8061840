/// Byte-size estimation and batch sizing
///
/// The batch threshold of a writer is derived once from a sample item. Estimates are
/// coarse on purpose: they only have to keep a batch roughly under the byte budget.

use crate::model::{GraphEdge, GraphNode, Tuple};
use serde_json::Value;

/// Estimate used when an item estimates to zero bytes
pub const FALLBACK_ITEM_BYTES: usize = 32;

/// Estimated in-memory size of a single value
pub fn estimate_value_bytes(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(estimate_value_bytes).sum(),
        Value::Object(fields) => fields
            .iter()
            .map(|(key, value)| key.len() + estimate_value_bytes(value))
            .sum(),
    }
}

fn estimate_node_bytes(node: &GraphNode) -> usize {
    node.id.len()
        + node.labels.iter().map(String::len).sum::<usize>()
        + node
            .properties
            .iter()
            .map(|(key, value)| key.len() + estimate_value_bytes(value))
            .sum::<usize>()
}

fn estimate_edge_bytes(edge: &GraphEdge) -> usize {
    edge.id.len()
        + edge.source.len()
        + edge.target.len()
        + edge.labels.iter().map(String::len).sum::<usize>()
        + edge
            .properties
            .iter()
            .map(|(key, value)| key.len() + estimate_value_bytes(value))
            .sum::<usize>()
}

/// Estimated size of a tuple, never zero
pub fn estimate_byte_size(tuple: &Tuple) -> usize {
    let estimate = match tuple {
        Tuple::Row(row) => row.iter().map(estimate_value_bytes).sum(),
        Tuple::Document(doc) => estimate_value_bytes(doc),
        Tuple::Node(node) => estimate_node_bytes(node),
        Tuple::Edge(edge) => estimate_edge_bytes(edge),
    };
    if estimate == 0 {
        FALLBACK_ITEM_BYTES
    } else {
        estimate
    }
}

/// `max(1, min(max_rows, max_bytes / estimated_bytes(sample)))`
///
/// Deterministic for a given sample and limits; the result is never zero and never
/// exceeds `max_rows` (unless `max_rows` itself is zero).
pub fn compute_batch_size(sample: &Tuple, max_bytes: usize, max_rows: usize) -> usize {
    let per_item = estimate_byte_size(sample);
    (max_bytes / per_item).min(max_rows).max(1)
}
