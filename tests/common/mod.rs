//! Shared fixtures for the integration tests
#![allow(dead_code)]

use stagestore::engine::memory::{MemoryEngine, DEFAULT_STORE};
use stagestore::storage::{BatchLimits, ManagerOptions, StorageManager};
use stagestore::{Field, FieldType, RowType};
use std::time::Duration;
use uuid::Uuid;

pub struct Fixture {
    pub engine: MemoryEngine,
    pub manager: StorageManager,
}

/// Engine with a short lock timeout so deadlocks surface quickly
pub fn engine() -> MemoryEngine {
    MemoryEngine::new(
        vec![DEFAULT_STORE.to_string(), "archive".to_string()],
        Duration::from_millis(200),
    )
}

pub async fn manager_on(engine: &MemoryEngine, options: ManagerOptions) -> StorageManager {
    StorageManager::new(Uuid::new_v4(), engine.handles(), options)
        .await
        .unwrap()
}

pub async fn fixture() -> Fixture {
    fixture_with(BatchLimits::default()).await
}

pub async fn fixture_with(batch_limits: BatchLimits) -> Fixture {
    let engine = engine();
    let manager = manager_on(
        &engine,
        ManagerOptions {
            batch_limits,
            ..ManagerOptions::default()
        },
    )
    .await;
    Fixture { engine, manager }
}

/// Limits that fix the batch threshold at `rows` for small tuples
pub fn rows_per_batch(rows: usize) -> BatchLimits {
    BatchLimits {
        max_bytes: usize::MAX / 2,
        max_rows: rows,
    }
}

/// `(_key BIGINT PK, value TEXT)`
pub fn key_value() -> RowType {
    RowType::new(vec![Field::primary_key(), Field::new("value", FieldType::Text)])
}

/// Sum of tuples in every recorded insert into `entity`
pub fn flushed_into(engine: &MemoryEngine, entity: &str) -> Vec<usize> {
    engine
        .write_history()
        .into_iter()
        .filter(|w| w.entity == entity)
        .map(|w| w.tuples)
        .collect()
}
