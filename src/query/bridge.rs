/// Thin adapter over the engine's query service
///
/// Every writer and reader goes through `QueryBridge`: it turns text or algebra into
/// executable plans and runs them inside the caller's transaction. It never commits or
/// rolls back; that stays with whoever owns the transaction.

use crate::engine::{
    AlgebraNode, EntityId, ExecutablePlan, LogicalEntity, PlanKind, Query, QueryEngine, ResultIterator,
    Transaction,
};
use crate::error::{StorageError, StorageResult};
use std::sync::Arc;

#[derive(Clone)]
pub struct QueryBridge {
    queries: Arc<dyn QueryEngine>,
}

impl std::fmt::Debug for QueryBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBridge").finish_non_exhaustive()
    }
}

impl QueryBridge {
    pub fn new(queries: Arc<dyn QueryEngine>) -> Self {
        Self { queries }
    }

    /// Parse, validate and translate without touching any store
    pub async fn parse_and_translate(&self, query: Query, tx: &dyn Transaction) -> StorageResult<ExecutablePlan> {
        self.queries.parse_and_translate(query, tx).await
    }

    /// Execute a plan inside `tx`
    ///
    /// Engine failures are wrapped as `Execution` errors carrying the plan source.
    pub async fn execute(&self, plan: &ExecutablePlan, tx: &dyn Transaction) -> StorageResult<ResultIterator> {
        self.queries.execute(plan, tx).await.map_err(|e| match e {
            StorageError::Execution { .. } => e,
            other => StorageError::execution(describe(plan), other),
        })
    }

    pub async fn parse_and_execute(&self, query: Query, tx: &dyn Transaction) -> StorageResult<ResultIterator> {
        let plan = self.parse_and_translate(query, tx).await?;
        self.execute(&plan, tx).await
    }

    /// Translate and run an algebra tree built by a writer or reader
    pub async fn execute_algebra(&self, root: AlgebraNode, tx: &dyn Transaction) -> StorageResult<ResultIterator> {
        self.parse_and_execute(Query::Algebra(root), tx).await
    }
}

fn describe(plan: &ExecutablePlan) -> String {
    match &plan.source {
        Some(text) => format!("executing '{}'", text),
        None => match plan.kind {
            PlanKind::Dml => "executing insert plan".to_string(),
            PlanKind::Query => "executing query plan".to_string(),
        },
    }
}

/// Reject plans that modify data or read entities outside `allowed`
pub fn validate_read_only(plan: &ExecutablePlan, allowed: &[EntityId]) -> StorageResult<()> {
    let mut pending = vec![&plan.root];
    while let Some(node) = pending.pop() {
        if node.is_dml() {
            return Err(StorageError::Validation(
                "read queries must not modify data".to_string(),
            ));
        }
        if let Some(entity) = node.scanned_entity() {
            if !allowed.contains(&entity) {
                return Err(StorageError::Validation(format!(
                    "query reads entity {} which does not back this checkpoint",
                    entity
                )));
            }
        }
        pending.extend(node.inputs());
    }
    Ok(())
}

/// Fully qualified, quoted name of an entity as used in query text and messages
pub fn quoted_identifier(entity: &LogicalEntity) -> String {
    match entity {
        LogicalEntity::Table(t) => format!("\"{}\".\"{}\"", t.namespace_name, t.name),
        LogicalEntity::Collection(c) => format!("\"{}\".\"{}\"", c.namespace_name, c.name),
        LogicalEntity::Graph(g) => format!("\"{}\"", g.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LogicalTable;
    use crate::model::{Field, RowType};

    fn table(id: EntityId) -> LogicalTable {
        LogicalTable {
            id,
            namespace_id: 1,
            namespace_name: "rel_abc".to_string(),
            name: format!("t_{}", id),
            row_type: RowType::new(vec![Field::primary_key()]),
            primary_key: vec!["_key".to_string()],
        }
    }

    #[test]
    fn test_validate_read_only() {
        let scan = AlgebraNode::scan(LogicalEntity::Table(table(7))).limit(3);
        let plan = ExecutablePlan::new(scan, None);
        assert!(validate_read_only(&plan, &[7]).is_ok());
        assert!(matches!(validate_read_only(&plan, &[8]), Err(StorageError::Validation(_))));

        let insert = ExecutablePlan::new(
            AlgebraNode::InsertRows {
                table: table(7),
                rows: vec![],
            },
            None,
        );
        assert!(matches!(validate_read_only(&insert, &[7]), Err(StorageError::Validation(_))));
    }

    #[test]
    fn test_quoted_identifier() {
        assert_eq!(
            quoted_identifier(&LogicalEntity::Table(table(2))),
            "\"rel_abc\".\"t_2\""
        );
    }
}
