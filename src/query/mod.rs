/// Query execution bridge
///
/// Plan translation and execution on behalf of writers and readers, plus the byte-size
/// heuristics used to size write batches.

// Plan translation/execution adapter
pub mod bridge;

// Batch sizing heuristics
pub mod sizing;

pub use bridge::{quoted_identifier, validate_read_only, QueryBridge};
pub use sizing::{compute_batch_size, estimate_byte_size};
