#![cfg(feature = "memory-engine")]

mod common;

use serde_json::json;
use stagestore::engine::LogicalEntity;
use stagestore::{GraphEdge, GraphNode};
use uuid::Uuid;

const BATCH: usize = 4;

fn sizes() -> [usize; 6] {
    [0, 1, BATCH - 1, BATCH, BATCH + 1, 3 * BATCH]
}

#[tokio::test]
async fn test_relational_flushes_account_for_every_row() {
    let fx = common::fixture_with(common::rows_per_batch(BATCH)).await;
    let activity = Uuid::new_v4();

    for (output, n) in sizes().into_iter().enumerate() {
        let mut writer = fx
            .manager
            .create_rel_checkpoint(activity, output, &common::key_value(), true, None)
            .await
            .unwrap();
        for i in 0..n {
            writer.write(vec![json!(0), json!(i.to_string())]).await.unwrap();
        }
        writer.close().await.unwrap();

        let table = writer.table().clone();
        let flushes = common::flushed_into(&fx.engine, &table.name);
        assert_eq!(flushes.iter().sum::<usize>(), n, "N = {}", n);
        assert_eq!(flushes.len(), n.div_ceil(BATCH), "N = {}", n);
        assert_eq!(writer.metadata().tuple_count(), n as u64);
        assert_eq!(fx.engine.stored_count(&LogicalEntity::Table(table)), Some(n));
    }
}

#[tokio::test]
async fn test_document_flushes_account_for_every_document() {
    let fx = common::fixture_with(common::rows_per_batch(BATCH)).await;
    let activity = Uuid::new_v4();

    for (output, n) in sizes().into_iter().enumerate() {
        let mut writer = fx.manager.create_doc_checkpoint(activity, output, None).await.unwrap();
        for i in 0..n {
            writer.write(json!({ "i": i })).await.unwrap();
        }
        writer.close().await.unwrap();

        let collection = writer.collection().clone();
        assert_eq!(common::flushed_into(&fx.engine, &collection.name).iter().sum::<usize>(), n);
        assert_eq!(writer.metadata().tuple_count(), n as u64);
        assert_eq!(fx.engine.stored_count(&LogicalEntity::Collection(collection)), Some(n));
    }
}

#[tokio::test]
async fn test_graph_nodes_and_edges_flush_independently() {
    let fx = common::fixture_with(common::rows_per_batch(BATCH)).await;
    let activity = Uuid::new_v4();

    for (output, n) in sizes().into_iter().enumerate() {
        let mut writer = fx.manager.create_lpg_checkpoint(activity, output, None).await.unwrap();
        for i in 0..n {
            writer.write_node(GraphNode::new(format!("n{}", i)).with_label("Item")).await.unwrap();
        }
        // A chain over the nodes: n - 1 edges
        for i in 1..n {
            writer
                .write_edge(GraphEdge::new(format!("e{}", i), format!("n{}", i - 1), format!("n{}", i)))
                .await
                .unwrap();
        }
        writer.close().await.unwrap();

        let edges = n.saturating_sub(1);
        let metadata = writer.metadata();
        assert_eq!(metadata.node_count(), n as u64);
        assert_eq!(metadata.edge_count(), edges as u64);
        assert_eq!(metadata.tuple_count(), (n + edges) as u64);

        let graph = writer.graph().clone();
        assert_eq!(common::flushed_into(&fx.engine, &graph.name).iter().sum::<usize>(), n + edges);
        assert_eq!(fx.engine.stored_count(&LogicalEntity::Graph(graph)), Some(n + edges));
    }
}
