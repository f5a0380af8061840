#![cfg(feature = "memory-engine")]

mod common;

use futures::TryStreamExt;
use serde_json::{json, Value};
use stagestore::{Field, FieldType, RowType, StorageError, Tuple};
use uuid::Uuid;

const ROWS: i64 = 37;

/// Table with keys {1, 3, 5, ...} written in scrambled order
async fn odd_keys(fx: &common::Fixture, activity: Uuid) {
    let row_type = RowType::new(vec![
        Field::primary_key(),
        Field::new("label", FieldType::Text),
        Field::new("rank", FieldType::BigInt),
    ]);
    let mut writer = fx
        .manager
        .create_rel_checkpoint(activity, 0, &row_type, false, None)
        .await
        .unwrap();
    let mut keys: Vec<i64> = (0..ROWS).map(|i| 2 * i + 1).collect();
    keys.reverse();
    keys.rotate_left(11);
    for key in keys {
        writer
            .write(vec![json!(key), json!(format!("row {}", key)), json!(1_000 - key)])
            .await
            .unwrap();
    }
    writer.close().await.unwrap();
}

fn column(rows: &[Tuple], index: usize) -> Vec<i64> {
    rows.iter()
        .map(|t| t.as_row().unwrap()[index].as_i64().unwrap())
        .collect()
}

fn strictly_increasing(values: &[i64]) -> bool {
    values.windows(2).all(|w| w[0] < w[1])
}

#[tokio::test]
async fn test_pages_are_strictly_increasing_and_complete() {
    let fx = common::fixture_with(common::rows_per_batch(8)).await;
    let activity = Uuid::new_v4();
    odd_keys(&fx, activity).await;

    let reader = fx.manager.read_checkpoint(activity, 0).await.unwrap();
    let rel = reader.as_rel().unwrap();
    for page_size in [1, 4, 5, 36, 37, 100] {
        let rows: Vec<Tuple> = rel.iter_batched(page_size).unwrap().try_collect().await.unwrap();
        let keys = column(&rows, 0);
        assert_eq!(keys.len() as i64, ROWS, "page size {}", page_size);
        assert!(strictly_increasing(&keys), "page size {}", page_size);
        assert_eq!(keys[0], 1);
    }
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_async_pages_match_sync_pages() {
    let fx = common::fixture().await;
    let activity = Uuid::new_v4();
    odd_keys(&fx, activity).await;

    let reader = fx.manager.read_checkpoint(activity, 0).await.unwrap();
    let rel = reader.as_rel().unwrap();
    let sync: Vec<Tuple> = rel.iter_batched(6).unwrap().try_collect().await.unwrap();
    let background: Vec<Tuple> = rel.iter_batched_async(6).unwrap().try_collect().await.unwrap();
    assert_eq!(sync, background);
    reader.close().await.unwrap();
}

#[test]
fn test_async_pages_need_a_runtime() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (fx, reader) = runtime.block_on(async {
        let fx = common::fixture().await;
        let activity = Uuid::new_v4();
        odd_keys(&fx, activity).await;
        let reader = fx.manager.read_checkpoint(activity, 0).await.unwrap();
        (fx, reader)
    });

    let outside = reader.as_rel().unwrap().iter_batched_async(6);
    assert!(matches!(outside, Err(StorageError::IllegalState(_))));

    runtime.block_on(async {
        let rows: Vec<Tuple> = reader.as_rel().unwrap().iter_batched_async(6).unwrap().try_collect().await.unwrap();
        assert_eq!(rows.len() as i64, ROWS);
        reader.close().await.unwrap();
        fx.manager.close().await.unwrap();
    });
}

#[tokio::test]
async fn test_paging_by_other_unique_column() {
    let fx = common::fixture().await;
    let activity = Uuid::new_v4();
    odd_keys(&fx, activity).await;

    let reader = fx.manager.read_checkpoint(activity, 0).await.unwrap();
    let rel = reader.as_rel().unwrap();
    let rows: Vec<Tuple> = rel.iter_batched_by("rank", 10).unwrap().try_collect().await.unwrap();
    let ranks = column(&rows, 2);
    assert_eq!(ranks.len() as i64, ROWS);
    assert!(strictly_increasing(&ranks));

    assert!(matches!(rel.iter_batched_by("missing", 10), Err(StorageError::InvalidArgument(_))));
    assert!(matches!(rel.iter_batched(0), Err(StorageError::InvalidArgument(_))));
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_sql_pushdown_is_restricted_to_the_checkpoint() {
    let fx = common::fixture().await;
    let activity = Uuid::new_v4();
    odd_keys(&fx, activity).await;

    let reader = fx.manager.read_checkpoint(activity, 0).await.unwrap();
    let rel = reader.as_rel().unwrap();
    let sql = format!(
        "SELECT _key, label FROM {} WHERE _key < 10 ORDER BY _key DESC",
        rel.table().name
    );
    let rows: Vec<Tuple> = reader.iter_from_query(&sql).await.unwrap().try_collect().await.unwrap();
    assert_eq!(column(&rows, 0), vec![9, 7, 5, 3, 1]);
    assert_eq!(rows[0].as_row().unwrap()[1], Value::from("row 9"));

    // Another table of the same session is not visible through this reader
    let mut other = fx
        .manager
        .create_rel_checkpoint(activity, 1, &common::key_value(), true, None)
        .await
        .unwrap();
    other.close().await.unwrap();
    let foreign = format!("SELECT * FROM {}", other.table().name);
    let err = reader.iter_from_query(&foreign).await.err().unwrap();
    assert!(matches!(err.root(), StorageError::Validation(_)));

    reader.close().await.unwrap();
    assert!(matches!(reader.iter().await.err().unwrap(), StorageError::IllegalState(_)));
}
