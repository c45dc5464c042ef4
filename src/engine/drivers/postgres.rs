//! PostgreSQL Driver
//!
//! Implements the ClientAdapter contract for PostgreSQL using SQLx.
//!
//! ## Connections
//!
//! Pooled operations acquire a connection per call. Reserved sessions and
//! streaming cursors check out a dedicated connection and hold it until they
//! are released; a connection dropped mid-transaction is detached from the
//! pool instead of being returned with an open transaction.
//!
//! ## Cancellation
//!
//! Every execution records the backend pid of its connection so that
//! `cancel()` can issue `pg_cancel_backend` from another connection.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::TryStreamExt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgPool, PgPoolOptions, PgRow, PgSslMode, Postgres};
use sqlx::{Column, Either, Row, TypeInfo};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::engine::capabilities::Capabilities;
use crate::engine::credentials::CredentialHandle;
use crate::engine::cursor::{PageSource, PagedCursor, StreamingCursor};
use crate::engine::drivers::common::{
    self, bare_statement, elapsed_ms, ActiveQueries, BoolStorage, ResultCollector,
};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::lifecycle::LifecycleCell;
use crate::engine::registry::ConnectContext;
use crate::engine::sql::{self, CompiledStatement, SqlDialect};
use crate::engine::ssh_tunnel::TunnelLease;
use crate::engine::traits::{ClientAdapter, ReservedConnection};
use crate::engine::types::{
    ColumnInfo, ConnectionConfig, ConnectionState, ElementKind, EntityType, QueryId, QueryResult,
    ResultMode, Routine, RoutineType, Row as QRow, SelectOptions, TableColumn, TableIndex, TableKey,
    TableOrView, TableTrigger, Value,
};

const DEFAULT_SCHEMA: &str = "public";

struct PgConnectionState {
    pool: PgPool,
    tunnel: Option<TunnelLease>,
    /// Address the pool dials; the tunnel's local end when tunnelled
    host: String,
    port: u16,
}

/// PostgreSQL adapter for one connection config
pub struct PostgresAdapter {
    config: ConnectionConfig,
    ctx: ConnectContext,
    lifecycle: LifecycleCell,
    credentials: CredentialHandle,
    inner: RwLock<Option<PgConnectionState>>,
    active_queries: ActiveQueries,
}

impl PostgresAdapter {
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

    fn connect_options(&self, host: &str, port: u16, username: &str, password: &str) -> PgConnectOptions {
        let ssl_mode = if self.config.ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Disable
        };
        let mut options = PgConnectOptions::new()
            .host(host)
            .port(port)
            .username(username)
            .password(password)
            .database(self.config.database.as_deref().unwrap_or("postgres"))
            .ssl_mode(ssl_mode);
        if let Some(name) = self.config.options.get("application_name") {
            options = options.application_name(name);
        }
        options
    }

    /// Pool handle, rotating credentials first when the provider issued new ones.
    async fn pool(&self) -> EngineResult<PgPool> {
        let guard = self.inner.read().await;
        let state = guard.as_ref().ok_or(EngineError::NotConnected)?;
        if let Some((username, password)) = self.credentials.refreshed().await? {
            tracing::debug!(host = %state.host, "Rotating PostgreSQL pool credentials");
            state
                .pool
                .set_connect_options(self.connect_options(&state.host, state.port, &username, &password));
        }
        Ok(state.pool.clone())
    }

    async fn open_cursor(&self, statement: CompiledStatement, chunk_size: usize) -> EngineResult<Box<dyn StreamingCursor>> {
        let pool = self.pool().await?;
        let conn = pool.acquire().await?;
        let source = PgCursorSource {
            conn: Some(conn),
            name: format!("unidb_cursor_{}", Uuid::new_v4().simple()),
            statement,
            open: false,
        };
        Ok(Box::new(PagedCursor::new(source, chunk_size)))
    }

    /// Converts a SQLx row to our universal Row type
    fn convert_row(pg_row: &PgRow) -> QRow {
        let values: Vec<Value> = pg_row
            .columns()
            .iter()
            .map(|col| Self::extract_value(pg_row, col.ordinal()))
            .collect();

        QRow { values }
    }

    /// Helper to bind a Value to a Postgres query
    fn bind_param<'q>(
        query: sqlx::query::Query<'q, Postgres, PgArguments>,
        value: &'q Value,
    ) -> sqlx::query::Query<'q, Postgres, PgArguments> {
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

    /// Extracts a value from a PgRow at the given index
    fn extract_value(row: &PgRow, idx: usize) -> Value {
        // Integers before bool
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
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
        // Date/time as ISO 8601 text
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

        // Simple-protocol results arrive as text; keep whatever the server sent
        if let Ok(raw) = row.try_get_raw(idx) {
            if let Ok(text) = raw.as_str() {
                return Value::Text(text.to_string());
            }
        }
        Value::Null
    }

    /// Gets column info from a PgRow
    fn get_column_info(row: &PgRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                data_type: col.type_info().name().to_string(),
                nullable: true,
            })
            .collect()
    }

    async fn fetch_backend_pid(conn: &mut PgConnection) -> EngineResult<i32> {
        sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))
    }

    /// Runs raw, possibly multi-statement text over the simple protocol.
    async fn run_raw(conn: &mut PgConnection, query: &str, mode: ResultMode) -> EngineResult<Vec<QueryResult>> {
        let mut collector = ResultCollector::new("postgres", query);
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

    async fn run_compiled(conn: &mut PgConnection, statement: &CompiledStatement) -> EngineResult<QueryResult> {
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

    async fn list_relations(&self, schema: Option<&str>, table_type: &str, entity_type: EntityType) -> EngineResult<Vec<TableOrView>> {
        let pool = self.pool().await?;
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT table_name::text
            FROM information_schema.tables
            WHERE table_schema = $1 AND table_type = $2
            ORDER BY table_name
            "#,
        )
        .bind(schema)
        .bind(table_type)
        .fetch_all(&pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name,)| TableOrView {
                schema: Some(schema.to_string()),
                name,
                entity_type,
            })
            .collect())
    }
}

/// `pg_constraint` action codes
fn referential_action(code: &str) -> Option<String> {
    let action = match code {
        "a" => "NO ACTION",
        "r" => "RESTRICT",
        "c" => "CASCADE",
        "n" => "SET NULL",
        "d" => "SET DEFAULT",
        _ => return None,
    };
    Some(action.to_string())
}

#[async_trait]
impl ClientAdapter for PostgresAdapter {
    fn driver_id(&self) -> &'static str {
        "postgres"
    }

    fn driver_name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::POSTGRES
    }

    fn sql_dialect(&self) -> Option<SqlDialect> {
        Some(SqlDialect::Postgres)
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
        let pool = PgPoolOptions::new()
            .max_connections(self.config.option_u32("max_connections").unwrap_or(5))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(self.connect_options(&host, port, &username, &password))
            .await
            .map_err(|e| EngineError::from_connect(e.to_string()))?;

        *self.inner.write().await = Some(PgConnectionState {
            pool,
            tunnel,
            host,
            port,
        });
        guard.complete();
        tracing::info!("PostgreSQL connection established");
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
            "SELECT datname::text FROM pg_database WHERE NOT datistemplate ORDER BY datname",
        )
        .fetch_all(&pool)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn list_schemas(&self) -> EngineResult<Vec<String>> {
        let pool = self.pool().await?;
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT schema_name::text
            FROM information_schema.schemata
            WHERE schema_name NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
              AND schema_name NOT LIKE 'pg_temp_%'
              AND schema_name NOT LIKE 'pg_toast_temp_%'
            ORDER BY schema_name
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

    async fn list_materialized_views(&self, schema: Option<&str>) -> EngineResult<Vec<TableOrView>> {
        let pool = self.pool().await?;
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT matviewname::text FROM pg_matviews WHERE schemaname = $1 ORDER BY matviewname",
        )
        .bind(schema)
        .fetch_all(&pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name,)| TableOrView {
                schema: Some(schema.to_string()),
                name,
                entity_type: EntityType::MaterializedView,
            })
            .collect())
    }

    async fn list_routines(&self, schema: Option<&str>) -> EngineResult<Vec<Routine>> {
        let pool = self.pool().await?;
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT routine_name::text, routine_type::text, data_type::text
            FROM information_schema.routines
            WHERE routine_schema = $1
            ORDER BY routine_name
            "#,
        )
        .bind(schema)
        .fetch_all(&pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, routine_type, return_type)| Routine {
                schema: Some(schema.to_string()),
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
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);

        let column_rows: Vec<(String, String, String, Option<String>, i32)> = sqlx::query_as(
            r#"
            SELECT
                column_name::text,
                data_type::text,
                is_nullable::text,
                column_default::text,
                ordinal_position::int4
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await?;

        let pk_columns = self.get_primary_keys(table, Some(schema)).await?;

        Ok(column_rows
            .into_iter()
            .map(|(name, data_type, is_nullable, default_value, position)| TableColumn {
                is_primary_key: pk_columns.contains(&name),
                name,
                data_type,
                nullable: is_nullable == "YES",
                default_value,
                ordinal_position: position.max(0) as u32,
            })
            .collect())
    }

    async fn get_primary_keys(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        let pool = self.pool().await?;
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT a.attname::text
            FROM pg_index i
            JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
            JOIN pg_class c ON c.oid = i.indrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE i.indisprimary
              AND n.nspname = $1
              AND c.relname = $2
            ORDER BY array_position(i.indkey, a.attnum)
            "#,
        )
        .bind(schema.unwrap_or(DEFAULT_SCHEMA))
        .bind(table)
        .fetch_all(&pool)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn list_table_indexes(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableIndex>> {
        let pool = self.pool().await?;
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let rows: Vec<(String, bool, bool, Vec<String>)> = sqlx::query_as(
            r#"
            SELECT
                ic.relname::text,
                ix.indisunique,
                ix.indisprimary,
                array_agg(a.attname::text ORDER BY array_position(ix.indkey::int2[], a.attnum))
            FROM pg_index ix
            JOIN pg_class tc ON tc.oid = ix.indrelid
            JOIN pg_class ic ON ic.oid = ix.indexrelid
            JOIN pg_namespace n ON n.oid = tc.relnamespace
            JOIN pg_attribute a ON a.attrelid = tc.oid AND a.attnum = ANY(ix.indkey)
            WHERE n.nspname = $1 AND tc.relname = $2
            GROUP BY ic.relname, ix.indisunique, ix.indisprimary
            ORDER BY ic.relname
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, unique, primary, columns)| TableIndex {
                name,
                table: table.to_string(),
                schema: Some(schema.to_string()),
                columns,
                unique,
                primary,
            })
            .collect())
    }

    async fn list_table_keys(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableKey>> {
        let pool = self.pool().await?;
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        #[allow(clippy::type_complexity)]
        let rows: Vec<(String, String, String, Vec<String>, String, String, Vec<String>, String, String)> =
            sqlx::query_as(
                r#"
                SELECT
                    c.conname::text,
                    tn.nspname::text,
                    tc.relname::text,
                    ARRAY(
                        SELECT a.attname::text
                        FROM unnest(c.conkey) WITH ORDINALITY AS k(attnum, ord)
                        JOIN pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = k.attnum
                        ORDER BY k.ord
                    ),
                    fn.nspname::text,
                    fc.relname::text,
                    ARRAY(
                        SELECT a.attname::text
                        FROM unnest(c.confkey) WITH ORDINALITY AS k(attnum, ord)
                        JOIN pg_attribute a ON a.attrelid = c.confrelid AND a.attnum = k.attnum
                        ORDER BY k.ord
                    ),
                    c.confupdtype::text,
                    c.confdeltype::text
                FROM pg_constraint c
                JOIN pg_class tc ON tc.oid = c.conrelid
                JOIN pg_namespace tn ON tn.oid = tc.relnamespace
                JOIN pg_class fc ON fc.oid = c.confrelid
                JOIN pg_namespace fn ON fn.oid = fc.relnamespace
                WHERE c.contype = 'f' AND tn.nspname = $1 AND tc.relname = $2
                ORDER BY c.conname
                "#,
            )
            .bind(schema)
            .bind(table)
            .fetch_all(&pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(name, from_schema, from_table, from_columns, to_schema, to_table, to_columns, on_update, on_delete)| {
                    TableKey {
                        name: Some(name),
                        from_schema: Some(from_schema),
                        from_table,
                        from_columns,
                        to_schema: Some(to_schema),
                        to_table,
                        to_columns,
                        on_update: referential_action(&on_update),
                        on_delete: referential_action(&on_delete),
                    }
                },
            )
            .collect())
    }

    async fn list_table_triggers(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableTrigger>> {
        let pool = self.pool().await?;
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let rows: Vec<(String, Option<String>, Option<String>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT
                trigger_name::text,
                action_timing::text,
                string_agg(event_manipulation::text, ' OR ' ORDER BY event_manipulation),
                max(action_statement::text)
            FROM information_schema.triggers
            WHERE event_object_schema = $1 AND event_object_table = $2
            GROUP BY trigger_name, action_timing
            ORDER BY trigger_name
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, timing, event, statement)| TableTrigger {
                name,
                table: table.to_string(),
                schema: Some(schema.to_string()),
                timing,
                event,
                statement,
            })
            .collect())
    }

    async fn execute_query(&self, query: &str, query_id: QueryId, mode: ResultMode) -> EngineResult<Vec<QueryResult>> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await?;
        let backend_pid = Self::fetch_backend_pid(&mut conn).await?;
        let _active = self.active_queries.track(query_id, backend_pid as i64);

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
        let statement = sql::select_top(SqlDialect::Postgres, schema, table, options)?;
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
        let Some(backend_pid) = self.active_queries.backend_for(query_id) else {
            tracing::debug!("Cancel requested for a query that is no longer running");
            return Ok(());
        };

        let pool = self.pool().await?;
        sqlx::query("SELECT pg_cancel_backend($1)")
            .bind(backend_pid as i32)
            .execute(&pool)
            .await?;
        Ok(())
    }

    async fn drop_element(&self, kind: ElementKind, schema: Option<&str>, name: &str) -> EngineResult<()> {
        let statement = sql::drop_element(SqlDialect::Postgres, kind, schema, name)?;
        if kind == ElementKind::Database {
            // DROP DATABASE cannot run inside a transaction block
            return self.run_statement(&CompiledStatement::command(statement)).await.map(|_| ());
        }
        self.run_ddl(vec![statement]).await
    }

    fn coerce_value(&self, value: Value, column_type: Option<&str>) -> Value {
        common::coerce_for_column(value, column_type, BoolStorage::Native)
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
        let backend_pid = Self::fetch_backend_pid(&mut conn).await?;
        Ok(Box::new(PgReservedConnection {
            conn: Some(conn),
            backend_pid,
            active_queries: self.active_queries.clone(),
            in_transaction: false,
        }))
    }
}

/// Server-side `DECLARE ... CURSOR` on a dedicated connection
struct PgCursorSource {
    conn: Option<PoolConnection<Postgres>>,
    name: String,
    statement: CompiledStatement,
    /// Transaction and cursor are open on `conn`
    open: bool,
}

impl PgCursorSource {
    fn conn(&mut self) -> EngineResult<&mut PgConnection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| EngineError::internal("Cursor connection already released"))
    }
}

#[async_trait]
impl PageSource for PgCursorSource {
    async fn prepare(&mut self) -> EngineResult<()> {
        let declare = format!("DECLARE {} NO SCROLL CURSOR FOR {}", self.name, self.statement.sql);
        let params = self.statement.params.clone();
        let conn = self.conn()?;

        sqlx::Executor::execute(&mut *conn, sqlx::raw_sql("BEGIN")).await?;
        let mut query = sqlx::query(&declare).persistent(false);
        for value in &params {
            query = PostgresAdapter::bind_param(query, value);
        }
        self.open = true;
        query.execute(&mut *self.conn()?).await?;
        Ok(())
    }

    async fn fetch(&mut self, _offset: u64, limit: usize) -> EngineResult<QueryResult> {
        let start = Instant::now();
        let fetch = format!("FETCH FORWARD {} FROM {}", limit, self.name);
        let rows = sqlx::query(&fetch).persistent(false).fetch_all(self.conn()?).await?;
        let columns = rows.first().map(PostgresAdapter::get_column_info).unwrap_or_default();
        let values = rows.iter().map(PostgresAdapter::convert_row).collect();
        Ok(QueryResult::with_rows(columns, values, elapsed_ms(start)))
    }

    async fn release(&mut self) -> EngineResult<()> {
        if !self.open {
            self.conn.take();
            return Ok(());
        }
        let close = format!("CLOSE {}; COMMIT", self.name);
        let result = sqlx::Executor::execute(self.conn()?, sqlx::raw_sql(&close)).await;
        if result.is_ok() {
            self.open = false;
            self.conn.take();
        }
        result.map(|_| ()).map_err(EngineError::from)
    }
}

impl Drop for PgCursorSource {
    fn drop(&mut self) {
        if self.open {
            if let Some(conn) = self.conn.take() {
                drop(conn.detach());
            }
        }
    }
}

/// A pooled connection held for one caller session
pub struct PgReservedConnection {
    conn: Option<PoolConnection<Postgres>>,
    backend_pid: i32,
    active_queries: ActiveQueries,
    in_transaction: bool,
}

impl PgReservedConnection {
    fn conn(&mut self) -> EngineResult<&mut PgConnection> {
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
impl ReservedConnection for PgReservedConnection {
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

    async fn execute(&mut self, query: &str, query_id: QueryId, mode: ResultMode) -> EngineResult<Vec<QueryResult>> {
        let _active = self.active_queries.track(query_id, self.backend_pid as i64);
        PostgresAdapter::run_raw(self.conn()?, query, mode).await
    }

    async fn commit(mut self: Box<Self>) -> EngineResult<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(mut self: Box<Self>) -> EngineResult<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PgReservedConnection {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Some(conn) = self.conn.take() {
                tracing::debug!(backend_pid = self.backend_pid, "Discarding connection with an open transaction");
                drop(conn.detach());
            }
        }
    }
}
