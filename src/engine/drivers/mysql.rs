//! MySQL Driver
//!
//! Implements the ClientAdapter contract for MySQL/MariaDB using SQLx.
//!
//! Same connection architecture as PostgreSQL: pooled calls acquire per
//! operation, reserved sessions hold a dedicated connection. Streaming
//! re-issues the base query with `LIMIT/OFFSET` for each chunk, and
//! cancellation runs `KILL QUERY` against the recorded connection id.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::TryStreamExt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::mysql::{MySql, MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::pool::PoolConnection;
use sqlx::{Column, Either, Row, TypeInfo};
use tokio::sync::RwLock;

use crate::engine::capabilities::Capabilities;
use crate::engine::credentials::CredentialHandle;
use crate::engine::cursor::{OffsetPageSource, PagedCursor, StatementRunner, StreamingCursor};
use crate::engine::drivers::common::{
    self, bare_statement, elapsed_ms, group_consecutive, ActiveQueries, BoolStorage, ResultCollector,
};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::lifecycle::LifecycleCell;
use crate::engine::registry::ConnectContext;
use crate::engine::sql::{self, CompiledStatement, SqlDialect};
use crate::engine::ssh_tunnel::TunnelLease;
use crate::engine::traits::{ClientAdapter, ReservedConnection};
use crate::engine::types::{
    ColumnInfo, ConnectionConfig, ConnectionState, EntityType, QueryId, QueryResult, ResultMode,
    Routine, RoutineType, Row as QRow, SelectOptions, TableColumn, TableIndex, TableKey, TableOrView,
    TableTrigger, Value,
};

struct MySqlConnectionState {
    pool: MySqlPool,
    tunnel: Option<TunnelLease>,
    host: String,
    port: u16,
}

/// MySQL adapter for one connection config
pub struct MySqlAdapter {
    config: ConnectionConfig,
    ctx: ConnectContext,
    lifecycle: LifecycleCell,
    credentials: CredentialHandle,
    inner: RwLock<Option<MySqlConnectionState>>,
    active_queries: ActiveQueries,
}

impl MySqlAdapter {
    pub fn new(config: ConnectionConfig, ctx: ConnectContext) -> Self {
        let credentials = CredentialHandle::new(ctx.credentials.clone(), config.clone());
        Self {
            config,
            ctx,
            lifecycle: LifecycleCell::new(),
            credentials,
            inner: RwLock::new(None),
            active_queries: ActiveQueries::default(),
        }
    }

    fn connect_options(&self, host: &str, port: u16, username: &str, password: &str) -> MySqlConnectOptions {
        let ssl_mode = if self.config.ssl {
            MySqlSslMode::Required
        } else {
            MySqlSslMode::Disabled
        };
        let mut options = MySqlConnectOptions::new()
            .host(host)
            .port(port)
            .username(username)
            .password(password)
            .ssl_mode(ssl_mode);
        if let Some(database) = self.config.database.as_deref() {
            options = options.database(database);
        }
        options
    }

    async fn pool(&self) -> EngineResult<MySqlPool> {
        let guard = self.inner.read().await;
        let state = guard.as_ref().ok_or(EngineError::NotConnected)?;
        if let Some((username, password)) = self.credentials.refreshed().await? {
            tracing::debug!(host = %state.host, "Rotating MySQL pool credentials");
            state
                .pool
                .set_connect_options(self.connect_options(&state.host, state.port, &username, &password));
        }
        Ok(state.pool.clone())
    }

    fn convert_row(mysql_row: &MySqlRow) -> QRow {
        let values: Vec<Value> = mysql_row
            .columns()
            .iter()
            .map(|col| Self::extract_value(mysql_row, col.ordinal()))
            .collect();

        QRow { values }
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, MySql, MySqlArguments>,
        value: &'q Value,
    ) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
        match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(b),
            Value::Int(i) => query.bind(i),
            Value::Float(f) => query.bind(f),
            Value::Text(s) => query.bind(s),
            Value::Bytes(b) => query.bind(b),
            Value::Json(j) => query.bind(j),
            Value::Array(items) => query.bind(serde_json::to_value(items).unwrap_or_default()),
        }
    }

    /// Extracts a value from a MySqlRow at the given index
    fn extract_value(row: &MySqlRow, idx: usize) -> Value {
        // TINYINT(1) is reported as BOOLEAN
        if row.columns()[idx].type_info().name() == "BOOLEAN" {
            if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
                return v.map(Value::Bool).unwrap_or(Value::Null);
            }
        }
        // u64 first for BIGINT UNSIGNED
        if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u32>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u16>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i8>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u8>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Decimal>, _>(idx) {
            return v
                .map(|d| d.to_f64().map(Value::Float).unwrap_or_else(|| Value::Text(d.to_string())))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
            return v.map(|dt| Value::Text(dt.to_rfc3339())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return v
                .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return v.map(|d| Value::Text(d.format("%Y-%m-%d").to_string())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
            return v.map(|t| Value::Text(t.format("%H:%M:%S").to_string())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(Value::Json).unwrap_or(Value::Null);
        }

        Value::Null
    }

    fn get_column_info(row: &MySqlRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                data_type: col.type_info().name().to_string(),
                nullable: true,
            })
            .collect()
    }

    async fn fetch_connection_id(conn: &mut MySqlConnection) -> EngineResult<u64> {
        sqlx::query_scalar("SELECT CONNECTION_ID()")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))
    }

    async fn run_raw(conn: &mut MySqlConnection, query: &str, mode: ResultMode) -> EngineResult<Vec<QueryResult>> {
        let mut collector = ResultCollector::new("mysql", query);
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

    async fn run_compiled(conn: &mut MySqlConnection, statement: &CompiledStatement) -> EngineResult<QueryResult> {
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
        let runner = MySqlRunner { pool: self.pool().await? };
        Ok(Box::new(PagedCursor::new(OffsetPageSource::new(runner, statement), chunk_size)))
    }

    async fn list_relations(&self, schema: Option<&str>, table_type: &str, entity_type: EntityType) -> EngineResult<Vec<TableOrView>> {
        let pool = self.pool().await?;
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT CAST(TABLE_SCHEMA AS CHAR), CAST(TABLE_NAME AS CHAR)
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_TYPE = ?
            ORDER BY TABLE_NAME
            "#,
        )
        .bind(schema)
        .bind(table_type)
        .fetch_all(&pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(schema, name)| TableOrView {
                schema: Some(schema),
                name,
                entity_type,
            })
            .collect())
    }
}

#[async_trait]
impl ClientAdapter for MySqlAdapter {
    fn driver_id(&self) -> &'static str {
        "mysql"
    }

    fn driver_name(&self) -> &'static str {
        "MySQL / MariaDB"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::MYSQL
    }

    fn sql_dialect(&self) -> Option<SqlDialect> {
        Some(SqlDialect::MySql)
    }

    fn state(&self) -> ConnectionState {
        self.lifecycle.get()
    }

    #[tracing::instrument(skip(self), fields(host = %self.config.host, port = self.config.port))]
    async fn connect(&self) -> EngineResult<()> {
        let Some(guard) = self.lifecycle.begin_connect()? else {
            return Ok(());
        };

        let tunnel = match &self.config.ssh_tunnel {
            Some(ssh) => Some(
                self.ctx
                    .tunnels
                    .acquire(ssh, &self.config.host, self.config.port)
                    .await?,
            ),
            None => None,
        };
        let (host, port) = match &tunnel {
            Some(lease) => (lease.local_host().to_string(), lease.local_port()),
            None => (self.config.host.clone(), self.config.port),
        };

        let (username, password) = self.credentials.resolve().await?;
        let pool = MySqlPoolOptions::new()
            .max_connections(self.config.option_u32("max_connections").unwrap_or(5))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(self.connect_options(&host, port, &username, &password))
            .await
            .map_err(|e| EngineError::from_connect(e.to_string()))?;

        *self.inner.write().await = Some(MySqlConnectionState {
            pool,
            tunnel,
            host,
            port,
        });
        guard.complete();
        tracing::info!("MySQL connection established");
        Ok(())
    }

    async fn disconnect(&self) -> EngineResult<()> {
        let state = self.inner.write().await.take();
        if let Some(state) = state {
            state.pool.close().await;
            if let Some(tunnel) = state.tunnel {
                tunnel.release().await;
            }
        }
        self.active_queries.clear();
        self.lifecycle.set_disconnected();
        Ok(())
    }

    async fn ping(&self) -> EngineResult<()> {
        let pool = self.pool().await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(())
    }

    async fn list_databases(&self) -> EngineResult<Vec<String>> {
        let pool = self.pool().await?;
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT CAST(SCHEMA_NAME AS CHAR)
            FROM information_schema.SCHEMATA
            WHERE SCHEMA_NAME NOT IN ('information_schema', 'mysql', 'performance_schema', 'sys')
            ORDER BY SCHEMA_NAME
            "#,
        )
        .fetch_all(&pool)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn list_tables(&self, schema: Option<&str>) -> EngineResult<Vec<TableOrView>> {
        self.list_relations(schema, "BASE TABLE", EntityType::Table).await
    }

    async fn list_views(&self, schema: Option<&str>) -> EngineResult<Vec<TableOrView>> {
        self.list_relations(schema, "VIEW", EntityType::View).await
    }

    async fn list_routines(&self, schema: Option<&str>) -> EngineResult<Vec<Routine>> {
        let pool = self.pool().await?;
        let rows: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT
                CAST(ROUTINE_SCHEMA AS CHAR),
                CAST(ROUTINE_NAME AS CHAR),
                CAST(ROUTINE_TYPE AS CHAR),
                CAST(DTD_IDENTIFIER AS CHAR)
            FROM information_schema.ROUTINES
            WHERE ROUTINE_SCHEMA = COALESCE(?, DATABASE())
            ORDER BY ROUTINE_NAME
            "#,
        )
        .bind(schema)
        .fetch_all(&pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(schema, name, routine_type, return_type)| Routine {
                schema: Some(schema),
                name,
                routine_type: if routine_type.eq_ignore_ascii_case("PROCEDURE") {
                    RoutineType::Procedure
                } else {
                    RoutineType::Function
                },
                return_type,
            })
            .collect())
    }

    async fn list_table_columns(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableColumn>> {
        let pool = self.pool().await?;
        let rows: Vec<(String, String, String, Option<String>, String, i64)> = sqlx::query_as(
            r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR),
                CAST(COLUMN_TYPE AS CHAR),
                CAST(IS_NULLABLE AS CHAR),
                CAST(COLUMN_DEFAULT AS CHAR),
                CAST(COLUMN_KEY AS CHAR),
                CAST(ORDINAL_POSITION AS SIGNED)
            FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, data_type, is_nullable, default_value, column_key, position)| TableColumn {
                name,
                data_type,
                nullable: is_nullable == "YES",
                default_value,
                is_primary_key: column_key == "PRI",
                ordinal_position: position.max(0) as u32,
            })
            .collect())
    }

    async fn get_primary_keys(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        let pool = self.pool().await?;
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT CAST(COLUMN_NAME AS CHAR)
            FROM information_schema.KEY_COLUMN_USAGE
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE())
              AND TABLE_NAME = ?
              AND CONSTRAINT_NAME = 'PRIMARY'
            ORDER BY ORDINAL_POSITION
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn list_table_indexes(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableIndex>> {
        let pool = self.pool().await?;
        let rows: Vec<(String, String, i64, String)> = sqlx::query_as(
            r#"
            SELECT
                CAST(TABLE_SCHEMA AS CHAR),
                CAST(INDEX_NAME AS CHAR),
                CAST(NON_UNIQUE AS SIGNED),
                CAST(COLUMN_NAME AS CHAR)
            FROM information_schema.STATISTICS
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
            ORDER BY INDEX_NAME, SEQ_IN_INDEX
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await?;

        Ok(group_consecutive(rows, |row| row.1.clone())
            .into_iter()
            .filter_map(|group| {
                let (schema, name, non_unique, _) = group.first()?.clone();
                Some(TableIndex {
                    primary: name == "PRIMARY",
                    columns: group.into_iter().map(|row| row.3).collect(),
                    name,
                    table: table.to_string(),
                    schema: Some(schema),
                    unique: non_unique == 0,
                })
            })
            .collect())
    }

    async fn list_table_keys(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableKey>> {
        let pool = self.pool().await?;
        #[allow(clippy::type_complexity)]
        let rows: Vec<(String, String, String, String, String, String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT
                CAST(k.CONSTRAINT_NAME AS CHAR),
                CAST(k.TABLE_SCHEMA AS CHAR),
                CAST(k.TABLE_NAME AS CHAR),
                CAST(k.COLUMN_NAME AS CHAR),
                CAST(k.REFERENCED_TABLE_SCHEMA AS CHAR),
                CAST(k.REFERENCED_TABLE_NAME AS CHAR),
                CAST(k.REFERENCED_COLUMN_NAME AS CHAR),
                CAST(r.UPDATE_RULE AS CHAR),
                CAST(r.DELETE_RULE AS CHAR)
            FROM information_schema.KEY_COLUMN_USAGE k
            JOIN information_schema.REFERENTIAL_CONSTRAINTS r
              ON r.CONSTRAINT_SCHEMA = k.CONSTRAINT_SCHEMA
             AND r.CONSTRAINT_NAME = k.CONSTRAINT_NAME
             AND r.TABLE_NAME = k.TABLE_NAME
            WHERE k.TABLE_SCHEMA = COALESCE(?, DATABASE())
              AND k.TABLE_NAME = ?
              AND k.REFERENCED_TABLE_NAME IS NOT NULL
            ORDER BY k.CONSTRAINT_NAME, k.ORDINAL_POSITION
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await?;

        Ok(group_consecutive(rows, |row| row.0.clone())
            .into_iter()
            .filter_map(|group| {
                let first = group.first()?.clone();
                Some(TableKey {
                    name: Some(first.0),
                    from_schema: Some(first.1),
                    from_table: first.2,
                    from_columns: group.iter().map(|row| row.3.clone()).collect(),
                    to_schema: Some(first.4),
                    to_table: first.5,
                    to_columns: group.iter().map(|row| row.6.clone()).collect(),
                    on_update: Some(first.7),
                    on_delete: Some(first.8),
                })
            })
            .collect())
    }

    async fn list_table_triggers(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableTrigger>> {
        let pool = self.pool().await?;
        let rows: Vec<(String, String, Option<String>, Option<String>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT
                CAST(TRIGGER_SCHEMA AS CHAR),
                CAST(TRIGGER_NAME AS CHAR),
                CAST(ACTION_TIMING AS CHAR),
                CAST(EVENT_MANIPULATION AS CHAR),
                CAST(ACTION_STATEMENT AS CHAR)
            FROM information_schema.TRIGGERS
            WHERE EVENT_OBJECT_SCHEMA = COALESCE(?, DATABASE()) AND EVENT_OBJECT_TABLE = ?
            ORDER BY TRIGGER_NAME
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(schema, name, timing, event, statement)| TableTrigger {
                name,
                table: table.to_string(),
                schema: Some(schema),
                timing,
                event,
                statement,
            })
            .collect())
    }

    async fn execute_query(&self, query: &str, query_id: QueryId, mode: ResultMode) -> EngineResult<Vec<QueryResult>> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await?;
        let connection_id = Self::fetch_connection_id(&mut conn).await?;
        let _active = self.active_queries.track(query_id, connection_id as i64);

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
        let statement = sql::select_top(SqlDialect::MySql, schema, table, options)?;
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

    async fn cancel(&self, query_id: QueryId) -> EngineResult<()> {
        let Some(connection_id) = self.active_queries.backend_for(query_id) else {
            tracing::debug!("Cancel requested for a query that is no longer running");
            return Ok(());
        };

        let pool = self.pool().await?;
        let kill = format!("KILL QUERY {}", connection_id);
        sqlx::raw_sql(&kill).execute(&pool).await?;
        Ok(())
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
        let mut conn = pool.acquire().await?;
        let connection_id = Self::fetch_connection_id(&mut conn).await?;
        Ok(Box::new(MySqlReservedConnection {
            conn: Some(conn),
            connection_id,
            active_queries: self.active_queries.clone(),
            in_transaction: false,
        }))
    }
}

/// Pages through the pool for offset cursors
struct MySqlRunner {
    pool: MySqlPool,
}

#[async_trait]
impl StatementRunner for MySqlRunner {
    async fn run(&self, statement: &CompiledStatement) -> EngineResult<QueryResult> {
        let mut conn = self.pool.acquire().await?;
        MySqlAdapter::run_compiled(&mut conn, statement).await
    }
}

/// A pooled connection held for one caller session
pub struct MySqlReservedConnection {
    conn: Option<PoolConnection<MySql>>,
    connection_id: u64,
    active_queries: ActiveQueries,
    in_transaction: bool,
}

impl MySqlReservedConnection {
    fn conn(&mut self) -> EngineResult<&mut MySqlConnection> {
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
impl ReservedConnection for MySqlReservedConnection {
    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn begin(&mut self) -> EngineResult<()> {
        if self.in_transaction {
            return Err(EngineError::transaction_error("Transaction already active"));
        }
        sqlx::Executor::execute(self.conn()?, sqlx::raw_sql("START TRANSACTION"))
            .await
            .map_err(|e| EngineError::transaction_error(format!("Failed to begin transaction: {}", e)))?;
        self.in_transaction = true;
        Ok(())
    }

    async fn execute(&mut self, query: &str, query_id: QueryId, mode: ResultMode) -> EngineResult<Vec<QueryResult>> {
        let _active = self.active_queries.track(query_id, self.connection_id as i64);
        MySqlAdapter::run_raw(self.conn()?, query, mode).await
    }

    async fn commit(mut self: Box<Self>) -> EngineResult<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(mut self: Box<Self>) -> EngineResult<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for MySqlReservedConnection {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Some(conn) = self.conn.take() {
                tracing::debug!(
                    connection_id = self.connection_id,
                    "Discarding connection with an open transaction"
                );
                drop(conn.detach());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> MySqlAdapter {
        let mut config = ConnectionConfig::new("mysql", "db.internal", 3306);
        config.database = Some("shop".into());
        MySqlAdapter::new(config, ConnectContext::default())
    }

    #[test]
    fn booleans_are_bound_as_integers() {
        let adapter = adapter();
        assert_eq!(adapter.coerce_value(Value::Bool(true), Some("tinyint(1)")), Value::Int(1));
        assert_eq!(adapter.coerce_value(Value::Text("false".into()), Some("boolean")), Value::Int(0));
        assert_eq!(adapter.coerce_value(Value::Text("x".into()), Some("varchar(20)")), Value::Text("x".into()));
    }

    #[test]
    fn connect_options_follow_config() {
        let adapter = adapter();
        let options = adapter.connect_options("127.0.0.1", 13306, "app", "secret");
        assert_eq!(options.get_host(), "127.0.0.1");
        assert_eq!(options.get_port(), 13306);
        assert_eq!(options.get_database(), Some("shop"));
    }

    #[tokio::test]
    async fn streaming_requires_a_connection() {
        let adapter = adapter();
        let err = adapter
            .query_stream("SELECT * FROM orders", 100)
            .await
            .err()
            .expect("not connected");
        assert!(matches!(err, EngineError::NotConnected));
        assert_eq!(adapter.list_schemas().await.expect("schemas"), Vec::<String>::new());
    }
}
