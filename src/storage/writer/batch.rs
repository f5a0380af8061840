/// Pending-item buffer shared by all writers

use crate::model::Tuple;
use crate::query::compute_batch_size;
use serde::{Deserialize, Serialize};

/// Default row ceiling of a single flush
pub const MAX_TUPLES_PER_BATCH: usize = 10_000;

/// Default byte budget of a single flush
pub const MAX_BYTES_PER_BATCH: usize = 16 * 1024 * 1024;

/// Limits a batch threshold is derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    pub max_bytes: usize,
    pub max_rows: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_bytes: MAX_BYTES_PER_BATCH,
            max_rows: MAX_TUPLES_PER_BATCH,
        }
    }
}

/// Items awaiting flush
///
/// The threshold is computed from the first item ever pushed and never changes
/// afterwards, even when later items are much larger or smaller.
#[derive(Debug)]
pub(crate) struct Batch<T> {
    items: Vec<T>,
    threshold: Option<usize>,
    limits: BatchLimits,
}

impl<T> Batch<T> {
    pub(crate) fn new(limits: BatchLimits) -> Self {
        Self {
            items: Vec::new(),
            threshold: None,
            limits,
        }
    }

    /// Append an item; returns true once the batch is full
    ///
    /// `sample` converts the first item into a tuple for size estimation.
    pub(crate) fn push(&mut self, item: T, sample: impl FnOnce(&T) -> Tuple) -> bool {
        let threshold = match self.threshold {
            Some(threshold) => threshold,
            None => {
                let threshold = compute_batch_size(&sample(&item), self.limits.max_bytes, self.limits.max_rows);
                tracing::debug!("📦 Batch threshold fixed at {} items", threshold);
                self.items.reserve(threshold.min(self.limits.max_rows));
                self.threshold = Some(threshold);
                threshold
            }
        };
        self.items.push(item);
        self.items.len() >= threshold
    }

    pub(crate) fn threshold(&self) -> Option<usize> {
        self.threshold
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn take(&mut self) -> Vec<T> {
        std::mem::take(&mut self.items)
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }
}
