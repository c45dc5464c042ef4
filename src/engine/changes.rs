//! Change-set compilation for the relational adapters
//!
//! A [`TableChangeSet`] compiles to inserts, then updates, then deletes,
//! followed by one snapshot SELECT per update. The whole plan runs through
//! `execute_atomic`, so a failing statement leaves no trace.

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::sql::{self, CompiledStatement, SqlDialect};
use crate::engine::traits::ClientAdapter;
use crate::engine::types::{KeyValue, QueryResult, TableChangeSet, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct ChangePlan {
    pub statements: Vec<CompiledStatement>,
    /// Index of the first snapshot SELECT in `statements`
    pub snapshot_start: usize,
}

impl ChangePlan {
    pub fn snapshot_count(&self) -> usize {
        self.statements.len() - self.snapshot_start
    }
}

/// Compiles a change set, running every bound value through `coerce`.
pub fn compile_changes<F>(dialect: SqlDialect, changes: &TableChangeSet, coerce: F) -> EngineResult<ChangePlan>
where
    F: Fn(Value, Option<&str>) -> Value,
{
    let mut statements = Vec::new();

    for insert in &changes.inserts {
        let schema = insert.schema.as_deref();
        let mut batch_columns: Option<Vec<String>> = None;
        let mut batch_rows: Vec<Vec<Value>> = Vec::new();

        for row in &insert.rows {
            let columns: Vec<String> = row.columns.keys().cloned().collect();
            let values: Vec<Value> = row.columns.values().map(|v| coerce(v.clone(), None)).collect();

            // An all-default row cannot share a VALUES list.
            if columns.is_empty() {
                if let Some(cols) = batch_columns.take() {
                    statements.push(sql::insert(dialect, schema, &insert.table, &cols, &batch_rows));
                    batch_rows.clear();
                }
                statements.push(sql::insert(dialect, schema, &insert.table, &[], &[]));
                continue;
            }

            let params_after = (batch_rows.len() + 1) * columns.len().max(1);
            let same_shape = batch_columns.as_ref() == Some(&columns);
            if !same_shape || params_after > dialect.max_params() {
                if let Some(cols) = batch_columns.take() {
                    statements.push(sql::insert(dialect, schema, &insert.table, &cols, &batch_rows));
                    batch_rows.clear();
                }
                batch_columns = Some(columns);
            }
            batch_rows.push(values);
        }

        if let Some(cols) = batch_columns {
            statements.push(sql::insert(dialect, schema, &insert.table, &cols, &batch_rows));
        }
    }

    for update in &changes.updates {
        let value = coerce(update.value.clone(), update.column_type.as_deref());
        let keys = coerce_keys(&update.primary_keys, &coerce);
        statements.push(sql::update(
            dialect,
            update.schema.as_deref(),
            &update.table,
            &update.column,
            value,
            &keys,
        )?);
    }

    for delete in &changes.deletes {
        let keys = coerce_keys(&delete.primary_keys, &coerce);
        statements.push(sql::delete(dialect, delete.schema.as_deref(), &delete.table, &keys)?);
    }

    let snapshot_start = statements.len();
    for update in &changes.updates {
        // The row is found by its post-update key when the edit touched a key column.
        let keys: Vec<KeyValue> = coerce_keys(&update.primary_keys, &coerce)
            .into_iter()
            .map(|key| {
                if key.column == update.column {
                    KeyValue {
                        column: key.column,
                        value: coerce(update.value.clone(), update.column_type.as_deref()),
                    }
                } else {
                    key
                }
            })
            .collect();
        statements.push(sql::select_by_key(
            dialect,
            update.schema.as_deref(),
            &update.table,
            &keys,
        )?);
    }

    Ok(ChangePlan {
        statements,
        snapshot_start,
    })
}

fn coerce_keys<F>(keys: &[KeyValue], coerce: &F) -> Vec<KeyValue>
where
    F: Fn(Value, Option<&str>) -> Value,
{
    keys.iter()
        .map(|key| KeyValue {
            column: key.column.clone(),
            value: coerce(key.value.clone(), None),
        })
        .collect()
}

/// Compiles and atomically applies `changes`, returning one snapshot per
/// update entry in update order.
pub async fn apply_sql_changes<A>(
    adapter: &A,
    dialect: SqlDialect,
    changes: &TableChangeSet,
) -> EngineResult<Vec<QueryResult>>
where
    A: ClientAdapter + ?Sized,
{
    if changes.is_empty() {
        return Ok(Vec::new());
    }

    let plan = compile_changes(dialect, changes, |value, column_type| {
        adapter.coerce_value(value, column_type)
    })?;
    tracing::debug!(
        statements = plan.statements.len(),
        snapshots = plan.snapshot_count(),
        "Applying change set"
    );

    let mut results = adapter.execute_atomic(&plan.statements).await?;
    if results.len() != plan.statements.len() {
        return Err(EngineError::internal(format!(
            "Atomic execution returned {} results for {} statements",
            results.len(),
            plan.statements.len()
        )));
    }
    Ok(results.split_off(plan.snapshot_start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{RowData, TableDelete, TableInsert, TableUpdate};

    fn identity(value: Value, _column_type: Option<&str>) -> Value {
        value
    }

    #[test]
    fn plan_orders_inserts_updates_deletes_then_snapshots() {
        let changes = TableChangeSet {
            inserts: vec![TableInsert {
                table: "people".into(),
                schema: None,
                rows: vec![
                    RowData::new().with_column("id", 1).with_column("firstName", "Terry"),
                    RowData::new().with_column("id", 2).with_column("firstName", "Ann"),
                ],
            }],
            updates: vec![TableUpdate {
                table: "people".into(),
                schema: None,
                column: "firstName".into(),
                value: "Theo".into(),
                column_type: None,
                primary_keys: vec![KeyValue::new("id", 1)],
            }],
            deletes: vec![TableDelete {
                table: "people".into(),
                schema: None,
                primary_keys: vec![KeyValue::new("id", 2)],
            }],
        };

        let plan = compile_changes(SqlDialect::Sqlite, &changes, identity).expect("compile");

        assert_eq!(plan.statements.len(), 4);
        assert!(plan.statements[0].sql.starts_with("INSERT INTO \"people\""));
        assert!(plan.statements[0].sql.ends_with("VALUES (?, ?), (?, ?)"));
        assert!(plan.statements[1].sql.starts_with("UPDATE"));
        assert!(plan.statements[2].sql.starts_with("DELETE"));
        assert!(plan.statements[3].returns_rows);
        assert_eq!(plan.snapshot_start, 3);
        assert_eq!(plan.snapshot_count(), 1);
    }

    #[test]
    fn rows_with_different_columns_split_batches() {
        let changes = TableChangeSet {
            inserts: vec![TableInsert {
                table: "t".into(),
                schema: None,
                rows: vec![
                    RowData::new().with_column("a", 1),
                    RowData::new().with_column("a", 2).with_column("b", 3),
                    RowData::new().with_column("a", 4).with_column("b", 5),
                ],
            }],
            ..Default::default()
        };

        let plan = compile_changes(SqlDialect::MySql, &changes, identity).expect("compile");
        assert_eq!(plan.statements.len(), 2);
        assert_eq!(plan.statements[1].params.len(), 4);
    }

    #[test]
    fn default_rows_insert_one_statement_each() {
        let changes = TableChangeSet {
            inserts: vec![TableInsert {
                table: "t".into(),
                schema: None,
                rows: vec![
                    RowData::new(),
                    RowData::new(),
                    RowData::new().with_column("a", 1),
                    RowData::new(),
                ],
            }],
            ..Default::default()
        };

        let plan = compile_changes(SqlDialect::Sqlite, &changes, identity).expect("compile");
        let sql: Vec<&str> = plan.statements.iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(
            sql,
            vec![
                "INSERT INTO \"t\" DEFAULT VALUES",
                "INSERT INTO \"t\" DEFAULT VALUES",
                "INSERT INTO \"t\" (\"a\") VALUES (?)",
                "INSERT INTO \"t\" DEFAULT VALUES",
            ]
        );

        let mysql = compile_changes(SqlDialect::MySql, &changes, identity).expect("compile");
        assert_eq!(mysql.statements.len(), 4);
        assert_eq!(mysql.statements[0].sql, "INSERT INTO `t` () VALUES ()");
    }

    #[test]
    fn empty_key_tuple_fails_before_execution() {
        let changes = TableChangeSet {
            deletes: vec![TableDelete {
                table: "t".into(),
                schema: None,
                primary_keys: Vec::new(),
            }],
            ..Default::default()
        };
        assert!(compile_changes(SqlDialect::Postgres, &changes, identity).is_err());
    }

    #[test]
    fn coercion_applies_to_values_and_snapshot_follows_key_edits() {
        let changes = TableChangeSet {
            updates: vec![TableUpdate {
                table: "flags".into(),
                schema: None,
                column: "code".into(),
                value: "B".into(),
                column_type: Some("text".into()),
                primary_keys: vec![KeyValue::new("tenant", 1), KeyValue::new("code", "A")],
            }],
            ..Default::default()
        };
        let lower = |value: Value, _: Option<&str>| match value {
            Value::Text(s) => Value::Text(s.to_lowercase()),
            other => other,
        };

        let plan = compile_changes(SqlDialect::Postgres, &changes, lower).expect("compile");
        assert_eq!(
            plan.statements[0].sql,
            "UPDATE \"flags\" SET \"code\" = $1 WHERE \"tenant\" = $2 AND \"code\" = $3"
        );
        assert_eq!(
            plan.statements[0].params,
            vec![Value::Text("b".into()), Value::Int(1), Value::Text("a".into())]
        );
        assert_eq!(
            plan.statements[1].params,
            vec![Value::Int(1), Value::Text("b".into())]
        );
    }
}
