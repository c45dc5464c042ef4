//! Helpers shared by the sqlx-backed adapters

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::engine::classifier::{self, CommandKind};
use crate::engine::types::{ColumnInfo, QueryId, QueryResult, ResultMode, Row, Value};

pub fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_micros() as f64 / 1000.0
}

/// Strips the trailing terminator so the text can be embedded in another
/// statement.
pub fn bare_statement(query: &str) -> &str {
    query.trim().trim_end_matches(';').trim_end()
}

/// Folds a raw multi-statement stream into one result per statement.
///
/// Drivers report rows as they arrive and call [`ResultCollector::end_statement`]
/// on every completion packet. A statement that returned no rows is reported
/// as a row set when it was classified as a query, otherwise as an affected
/// row count.
pub struct ResultCollector {
    produces_rows: Vec<bool>,
    statement: usize,
    columns: Vec<ColumnInfo>,
    rows: Vec<Row>,
    results: Vec<QueryResult>,
    started: Instant,
}

impl ResultCollector {
    pub fn new(driver_id: &str, query: &str) -> Self {
        let produces_rows = classifier::classify(driver_id, query)
            .kinds()
            .into_iter()
            .map(|kind| matches!(kind, CommandKind::Select | CommandKind::Show | CommandKind::Explain))
            .collect();
        Self {
            produces_rows,
            statement: 0,
            columns: Vec::new(),
            rows: Vec::new(),
            results: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn push_row(&mut self, row: Row, columns: impl FnOnce() -> Vec<ColumnInfo>) {
        if self.rows.is_empty() && self.columns.is_empty() {
            self.columns = columns();
        }
        self.rows.push(row);
    }

    pub fn end_statement(&mut self, rows_affected: u64) {
        let returns_rows =
            !self.rows.is_empty() || self.produces_rows.get(self.statement).copied().unwrap_or(false);
        let elapsed = elapsed_ms(self.started);

        let result = if returns_rows {
            QueryResult::with_rows(
                std::mem::take(&mut self.columns),
                std::mem::take(&mut self.rows),
                elapsed,
            )
        } else {
            QueryResult::with_affected_rows(rows_affected, elapsed)
        };
        self.results.push(result);
        self.statement += 1;
    }

    pub fn finish(mut self, mode: ResultMode) -> Vec<QueryResult> {
        if !self.rows.is_empty() {
            self.end_statement(0);
        }
        if mode == ResultMode::Single {
            self.results.truncate(1);
        }
        self.results
    }
}

/// How a backend stores booleans on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolStorage {
    Native,
    Integer,
}

/// Normalizes an edited value for its declared column type.
///
/// Grids send most edits as text; numeric and boolean columns get the typed
/// value so the bind matches the column. Unparseable text is left alone and
/// the backend reports the mismatch.
pub fn coerce_for_column(value: Value, column_type: Option<&str>, bools: BoolStorage) -> Value {
    let Some(column_type) = column_type else {
        return value;
    };
    let ty = column_type.trim().to_ascii_lowercase();

    if ty.starts_with("bool") || ty == "tinyint(1)" || ty == "bit(1)" {
        return match value.as_bool() {
            Some(b) if bools == BoolStorage::Native => Value::Bool(b),
            Some(b) => Value::Int(b as i64),
            None => value,
        };
    }

    let Value::Text(text) = &value else {
        return value;
    };
    let base = ty.split(['(', ' ']).next().unwrap_or_default();
    let is_integer = matches!(
        base,
        "int" | "int2" | "int4" | "int8" | "integer" | "bigint" | "smallint" | "tinyint" | "mediumint"
            | "serial" | "bigserial" | "smallserial"
    );
    let is_float = matches!(
        base,
        "float" | "float4" | "float8" | "double" | "real" | "numeric" | "decimal"
    );

    if is_integer {
        if let Ok(n) = text.trim().parse::<i64>() {
            return Value::Int(n);
        }
    } else if is_float {
        if let Ok(n) = text.trim().parse::<f64>() {
            return Value::Float(n);
        }
    }
    value
}

/// Groups rows already ordered by `key` into consecutive runs.
pub fn group_consecutive<T, K: PartialEq>(rows: Vec<T>, key: impl Fn(&T) -> K) -> Vec<Vec<T>> {
    let mut groups: Vec<Vec<T>> = Vec::new();
    for row in rows {
        let continues = groups
            .last()
            .and_then(|group| group.first())
            .is_some_and(|first| key(first) == key(&row));
        match groups.last_mut() {
            Some(group) if continues => group.push(row),
            _ => groups.push(vec![row]),
        }
    }
    groups
}

/// Maps in-flight query ids to the native backend session running them
#[derive(Clone, Default)]
pub struct ActiveQueries {
    inner: Arc<Mutex<HashMap<QueryId, i64>>>,
}

impl ActiveQueries {
    pub fn track(&self, query_id: QueryId, backend_id: i64) -> ActiveQuery {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(query_id, backend_id);
        ActiveQuery {
            queries: self.clone(),
            query_id,
        }
    }

    pub fn backend_for(&self, query_id: QueryId) -> Option<i64> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&query_id)
            .copied()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Removes its entry when the query finishes or its future is dropped
pub struct ActiveQuery {
    queries: ActiveQueries,
    query_id: QueryId,
}

impl Drop for ActiveQuery {
    fn drop(&mut self) {
        self.queries
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.query_id);
    }
}
