//! SQLite Driver
//!
//! File-backed (or in-memory) adapter over SQLx. Metadata comes from the
//! `pragma_*` table-valued functions; SQLite has no schemas or routines and
//! no way to interrupt a running statement from another connection.

use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Either, Row, TypeInfo};
use tokio::sync::RwLock;

use crate::engine::capabilities::Capabilities;
use crate::engine::cursor::{OffsetPageSource, PagedCursor, StatementRunner, StreamingCursor};
use crate::engine::drivers::common::{
    self, bare_statement, elapsed_ms, group_consecutive, BoolStorage, ResultCollector,
};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::lifecycle::LifecycleCell;
use crate::engine::registry::ConnectContext;
use crate::engine::sql::{self, CompiledStatement, SqlDialect};
use crate::engine::traits::{ClientAdapter, ReservedConnection};
use crate::engine::types::{
    ColumnInfo, ConnectionConfig, ConnectionState, EntityType, QueryId, QueryResult, ResultMode,
    Row as QRow, SelectOptions, TableColumn, TableIndex, TableKey, TableOrView, TableTrigger, Value,
};

const MEMORY: &str = ":memory:";

/// SQLite adapter for one database file
pub struct SqliteAdapter {
    config: ConnectionConfig,
    lifecycle: LifecycleCell,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteAdapter {
    /// Tunnels and credential providers do not apply to local files.
    pub fn new(config: ConnectionConfig, _ctx: ConnectContext) -> Self {
        Self {
            config,
            lifecycle: LifecycleCell::new(),
            pool: RwLock::new(None),
        }
    }

    fn path(&self) -> &str {
        self.config.database.as_deref().unwrap_or(MEMORY)
    }

    fn connect_options(&self) -> EngineResult<SqliteConnectOptions> {
        let options = if self.path() == MEMORY {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(self.path())
                .create_if_missing(true)
        };
        Ok(options.foreign_keys(true).busy_timeout(Duration::from_secs(5)))
    }

    async fn pool(&self) -> EngineResult<SqlitePool> {
        self.pool.read().await.clone().ok_or(EngineError::NotConnected)
    }

    fn convert_row(sqlite_row: &SqliteRow) -> QRow {
        let values: Vec<Value> = sqlite_row
            .columns()
            .iter()
            .map(|col| Self::extract_value(sqlite_row, col.ordinal()))
            .collect();

        QRow { values }
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
        value: &'q Value,
    ) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
        match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b as i64),
            Value::Int(i) => query.bind(i),
            Value::Float(f) => query.bind(f),
            Value::Text(s) => query.bind(s),
            Value::Bytes(b) => query.bind(b),
            Value::Json(j) => query.bind(j.to_string()),
            Value::Array(items) => query.bind(serde_json::to_string(items).unwrap_or_default()),
        }
    }

    /// Storage classes map directly; declared BOOLEAN columns come back as Bool.
    fn extract_value(row: &SqliteRow, idx: usize) -> Value {
        let declared = row.columns()[idx].type_info().name().to_ascii_uppercase();
        if declared == "BOOLEAN" || declared == "BOOL" {
            if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
                return v.map(Value::Bool).unwrap_or(Value::Null);
            }
        }
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        Value::Null
    }

    fn get_column_info(row: &SqliteRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                data_type: col.type_info().name().to_string(),
                nullable: true,
            })
            .collect()
    }

    async fn run_raw(conn: &mut SqliteConnection, query: &str, mode: ResultMode) -> EngineResult<Vec<QueryResult>> {
        let mut collector = ResultCollector::new("sqlite", query);
        let mut stream = sqlx::raw_sql(query).fetch_many(&mut *conn);
        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(done) => collector.end_statement(done.rows_affected()),
                Either::Right(row) => {
                    collector.push_row(Self::convert_row(&row), || Self::get_column_info(&row))
                }
            }
        }
        Ok(collector.finish(mode))
    }

    async fn run_compiled(conn: &mut SqliteConnection, statement: &CompiledStatement) -> EngineResult<QueryResult> {
        let start = Instant::now();
        let mut query = sqlx::query(&statement.sql);
        for value in &statement.params {
            query = Self::bind_param(query, value);
        }

        if statement.returns_rows {
            let rows = query.fetch_all(&mut *conn).await?;
            let columns = rows.first().map(Self::get_column_info).unwrap_or_default();
            let values = rows.iter().map(Self::convert_row).collect();
            Ok(QueryResult::with_rows(columns, values, elapsed_ms(start)))
        } else {
            let done = query.execute(&mut *conn).await?;
            Ok(QueryResult::with_affected_rows(done.rows_affected(), elapsed_ms(start)))
        }
    }

    async fn open_cursor(&self, statement: CompiledStatement, chunk_size: usize) -> EngineResult<Box<dyn StreamingCursor>> {
        let runner = SqliteRunner { pool: self.pool().await? };
        Ok(Box::new(PagedCursor::new(OffsetPageSource::new(runner, statement), chunk_size)))
    }

    async fn list_master(&self, object_type: &str, entity_type: EntityType) -> EngineResult<Vec<TableOrView>> {
        let pool = self.pool().await?;
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = ?1 AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .bind(object_type)
        .fetch_all(&pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name,)| TableOrView {
                schema: None,
                name,
                entity_type,
            })
            .collect())
    }
}

/// Pulls timing and event out of a `CREATE TRIGGER` statement.
fn trigger_parts(sql: &str) -> (Option<String>, Option<String>) {
    let upper = sql.to_ascii_uppercase();
    let words: Vec<&str> = upper.split_whitespace().collect();

    let timing = if upper.contains(" INSTEAD OF ") {
        Some("INSTEAD OF")
    } else if words.contains(&"BEFORE") {
        Some("BEFORE")
    } else if words.contains(&"AFTER") {
        Some("AFTER")
    } else {
        None
    };
    let event = ["INSERT", "UPDATE", "DELETE"]
        .into_iter()
        .find(|event| words.contains(event));

    (timing.map(str::to_string), event.map(str::to_string))
}

#[async_trait]
impl ClientAdapter for SqliteAdapter {
    fn driver_id(&self) -> &'static str {
        "sqlite"
    }

    fn driver_name(&self) -> &'static str {
        "SQLite"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::SQLITE
    }

    fn sql_dialect(&self) -> Option<SqlDialect> {
        Some(SqlDialect::Sqlite)
    }

    fn state(&self) -> ConnectionState {
        self.lifecycle.get()
    }

    #[tracing::instrument(skip(self), fields(path = %self.path()))]
    async fn connect(&self) -> EngineResult<()> {
        let Some(guard) = self.lifecycle.begin_connect()? else {
            return Ok(());
        };

        let mut pool_options =
            SqlitePoolOptions::new().max_connections(self.config.option_u32("max_connections").unwrap_or(5));
        if self.path() == MEMORY {
            // The shared in-memory database lives as long as one connection does
            pool_options = pool_options.min_connections(1).idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(self.connect_options()?)
            .await
            .map_err(|e| EngineError::from_connect(e.to_string()))?;

        *self.pool.write().await = Some(pool);
        guard.complete();
        tracing::info!("SQLite database opened");
        Ok(())
    }

    async fn disconnect(&self) -> EngineResult<()> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
        self.lifecycle.set_disconnected();
        Ok(())
    }

    async fn ping(&self) -> EngineResult<()> {
        let pool = self.pool().await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(())
    }

    /// Attached databases (`main`, `temp`, and any `ATTACH`ed file)
    async fn list_databases(&self) -> EngineResult<Vec<String>> {
        let pool = self.pool().await?;
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM pragma_database_list ORDER BY seq")
            .fetch_all(&pool)
            .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn list_tables(&self, _schema: Option<&str>) -> EngineResult<Vec<TableOrView>> {
        self.list_master("table", EntityType::Table).await
    }

    async fn list_views(&self, _schema: Option<&str>) -> EngineResult<Vec<TableOrView>> {
        self.list_master("view", EntityType::View).await
    }

    async fn list_table_columns(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<TableColumn>> {
        let pool = self.pool().await?;
        let rows: Vec<(i64, String, String, i64, Option<String>, i64)> = sqlx::query_as(
            r#"SELECT cid, name, type, "notnull", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid"#,
        )
        .bind(table)
        .fetch_all(&pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(cid, name, data_type, not_null, default_value, pk)| TableColumn {
                name,
                data_type,
                nullable: not_null == 0 && pk == 0,
                default_value,
                is_primary_key: pk > 0,
                ordinal_position: (cid + 1).max(0) as u32,
            })
            .collect())
    }

    async fn get_primary_keys(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<String>> {
        let pool = self.pool().await?;
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk")
                .bind(table)
                .fetch_all(&pool)
                .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn list_table_indexes(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<TableIndex>> {
        let pool = self.pool().await?;
        let indexes: Vec<(String, i64, String)> =
            sqlx::query_as(r#"SELECT name, "unique", origin FROM pragma_index_list(?1) ORDER BY name"#)
                .bind(table)
                .fetch_all(&pool)
                .await?;

        let mut result = Vec::with_capacity(indexes.len());
        for (name, unique, origin) in indexes {
            let columns: Vec<(Option<String>,)> =
                sqlx::query_as("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
                    .bind(&name)
                    .fetch_all(&pool)
                    .await?;
            result.push(TableIndex {
                columns: columns.into_iter().filter_map(|(column,)| column).collect(),
                name,
                table: table.to_string(),
                schema: None,
                unique: unique != 0,
                primary: origin == "pk",
            });
        }
        Ok(result)
    }

    async fn list_table_keys(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<TableKey>> {
        let pool = self.pool().await?;
        #[allow(clippy::type_complexity)]
        let rows: Vec<(i64, String, String, Option<String>, String, String)> = sqlx::query_as(
            r#"
            SELECT id, "table", "from", "to", on_update, on_delete
            FROM pragma_foreign_key_list(?1)
            ORDER BY id, seq
            "#,
        )
        .bind(table)
        .fetch_all(&pool)
        .await?;

        Ok(group_consecutive(rows, |row| row.0)
            .into_iter()
            .filter_map(|group| {
                let first = group.first()?.clone();
                Some(TableKey {
                    name: None,
                    from_schema: None,
                    from_table: table.to_string(),
                    from_columns: group.iter().map(|row| row.2.clone()).collect(),
                    to_schema: None,
                    to_table: first.1,
                    // NULL when the key references the parent's primary key
                    to_columns: group.iter().filter_map(|row| row.3.clone()).collect(),
                    on_update: Some(first.4),
                    on_delete: Some(first.5),
                })
            })
            .collect())
    }

    async fn list_table_triggers(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<TableTrigger>> {
        let pool = self.pool().await?;
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT name, sql FROM sqlite_master WHERE type = 'trigger' AND tbl_name = ?1 ORDER BY name",
        )
        .bind(table)
        .fetch_all(&pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, statement)| {
                let (timing, event) = statement.as_deref().map(trigger_parts).unwrap_or((None, None));
                TableTrigger {
                    name,
                    table: table.to_string(),
                    schema: None,
                    timing,
                    event,
                    statement,
                }
            })
            .collect())
    }

    async fn execute_query(&self, query: &str, _query_id: QueryId, mode: ResultMode) -> EngineResult<Vec<QueryResult>> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await?;
        Self::run_raw(&mut conn, query, mode).await
    }

    async fn run_statement(&self, statement: &CompiledStatement) -> EngineResult<QueryResult> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await?;
        Self::run_compiled(&mut conn, statement).await
    }

    async fn select_top_stream(
        &self,
        table: &str,
        schema: Option<&str>,
        options: &SelectOptions,
        chunk_size: usize,
    ) -> EngineResult<Box<dyn StreamingCursor>> {
        let statement = sql::select_top(SqlDialect::Sqlite, schema, table, options)?;
        self.open_cursor(statement, chunk_size).await
    }

    async fn query_stream(&self, query: &str, chunk_size: usize) -> EngineResult<Box<dyn StreamingCursor>> {
        let statement = CompiledStatement {
            sql: bare_statement(query).to_string(),
            params: Vec::new(),
            returns_rows: true,
        };
        self.open_cursor(statement, chunk_size).await
    }

    fn coerce_value(&self, value: Value, column_type: Option<&str>) -> Value {
        common::coerce_for_column(value, column_type, BoolStorage::Integer)
    }

    async fn execute_atomic(&self, statements: &[CompiledStatement]) -> EngineResult<Vec<QueryResult>> {
        let pool = self.pool().await?;
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| EngineError::transaction_error(format!("Failed to begin transaction: {}", e)))?;

        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            match Self::run_compiled(&mut *tx, statement).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        tracing::warn!("Rollback after failed statement failed: {}", rollback);
                    }
                    return Err(e);
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| EngineError::transaction_error(format!("Failed to commit transaction: {}", e)))?;
        Ok(results)
    }

    async fn reserve_connection(&self) -> EngineResult<Box<dyn ReservedConnection>> {
        let pool = self.pool().await?;
        let conn = pool.acquire().await?;
        Ok(Box::new(SqliteReservedConnection {
            conn: Some(conn),
            in_transaction: false,
        }))
    }
}

struct SqliteRunner {
    pool: SqlitePool,
}

#[async_trait]
impl StatementRunner for SqliteRunner {
    async fn run(&self, statement: &CompiledStatement) -> EngineResult<QueryResult> {
        let mut conn = self.pool.acquire().await?;
        SqliteAdapter::run_compiled(&mut conn, statement).await
    }
}

pub struct SqliteReservedConnection {
    conn: Option<PoolConnection<Sqlite>>,
    in_transaction: bool,
}

impl SqliteReservedConnection {
    fn conn(&mut self) -> EngineResult<&mut SqliteConnection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| EngineError::internal("Reserved connection already released"))
    }

    async fn finish(&mut self, statement: &str) -> EngineResult<()> {
        if !self.in_transaction {
            return Err(EngineError::transaction_error("No active transaction"));
        }
        sqlx::Executor::execute(self.conn()?, sqlx::raw_sql(statement))
            .await
            .map_err(|e| EngineError::transaction_error(format!("{} failed: {}", statement, e)))?;
        self.in_transaction = false;
        Ok(())
    }
}

#[async_trait]
impl ReservedConnection for SqliteReservedConnection {
    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn begin(&mut self) -> EngineResult<()> {
        if self.in_transaction {
            return Err(EngineError::transaction_error("Transaction already active"));
        }
        sqlx::Executor::execute(self.conn()?, sqlx::raw_sql("BEGIN"))
            .await
            .map_err(|e| EngineError::transaction_error(format!("Failed to begin transaction: {}", e)))?;
        self.in_transaction = true;
        Ok(())
    }

    async fn execute(&mut self, query: &str, _query_id: QueryId, mode: ResultMode) -> EngineResult<Vec<QueryResult>> {
        SqliteAdapter::run_raw(self.conn()?, query, mode).await
    }

    async fn commit(mut self: Box<Self>) -> EngineResult<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(mut self: Box<Self>) -> EngineResult<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for SqliteReservedConnection {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Some(conn) = self.conn.take() {
                drop(conn.detach());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::ElementKind;

    async fn memory_adapter() -> SqliteAdapter {
        let mut config = ConnectionConfig::new("sqlite", "", 0);
        config.database = Some(MEMORY.into());
        let adapter = SqliteAdapter::new(config, ConnectContext::default());
        adapter.connect().await.expect("open in-memory database");
        adapter
    }

    #[test]
    fn trigger_timing_and_event_are_parsed() {
        let (timing, event) = trigger_parts("CREATE TRIGGER audit AFTER UPDATE ON users BEGIN SELECT 1; END");
        assert_eq!(timing.as_deref(), Some("AFTER"));
        assert_eq!(event.as_deref(), Some("UPDATE"));

        let (timing, _) = trigger_parts("create trigger v_ins instead of insert on v begin select 1; end");
        assert_eq!(timing.as_deref(), Some("INSTEAD OF"));
    }

    #[tokio::test]
    async fn multi_statement_text_yields_one_result_each() {
        let adapter = memory_adapter().await;
        let results = adapter
            .execute_query(
                "CREATE TABLE t (id INTEGER PRIMARY KEY, done BOOLEAN); \
                 INSERT INTO t (id, done) VALUES (1, 1), (2, 0); \
                 SELECT id, done FROM t ORDER BY id",
                QueryId::new(),
                ResultMode::Multiple,
            )
            .await
            .expect("execute");

        assert_eq!(results.len(), 3);
        assert_eq!(results[1].affected_rows, Some(2));
        assert_eq!(results[2].row_count, 2);
        assert_eq!(results[2].value(0, "done"), Some(&Value::Bool(true)));
        assert_eq!(results[2].value(1, "id"), Some(&Value::Int(2)));
    }

    #[tokio::test]
    async fn metadata_reflects_pragmas() {
        let adapter = memory_adapter().await;
        adapter
            .execute_query(
                "CREATE TABLE parent (a INTEGER, b TEXT, PRIMARY KEY (b, a)); \
                 CREATE TABLE child (id INTEGER PRIMARY KEY, pa INTEGER, pb TEXT, \
                   FOREIGN KEY (pb, pa) REFERENCES parent (b, a) ON DELETE CASCADE); \
                 CREATE INDEX child_pa ON child (pa)",
                QueryId::new(),
                ResultMode::Multiple,
            )
            .await
            .expect("schema");

        assert_eq!(adapter.get_primary_keys("parent", None).await.expect("pk"), vec!["b", "a"]);

        let keys = adapter.list_table_keys("child", None).await.expect("keys");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].from_columns, vec!["pb", "pa"]);
        assert_eq!(keys[0].to_columns, vec!["b", "a"]);
        assert_eq!(keys[0].on_delete.as_deref(), Some("CASCADE"));

        let indexes = adapter.list_table_indexes("child", None).await.expect("indexes");
        assert!(indexes.iter().any(|i| i.name == "child_pa" && i.columns == vec!["pa"]));

        assert!(adapter.list_routines(None).await.expect("routines").is_empty());
        assert!(adapter.list_schemas().await.expect("schemas").is_empty());
    }

    #[tokio::test]
    async fn cancel_and_unsupported_drops_are_reported() {
        let adapter = memory_adapter().await;
        let err = adapter.cancel(QueryId::new()).await.expect_err("no cancel");
        assert!(matches!(err, EngineError::NotSupported { .. }));

        let err = adapter
            .drop_element(ElementKind::Schema, None, "main")
            .await
            .expect_err("no schemas");
        assert!(matches!(err, EngineError::NotSupported { .. }));
    }
}
