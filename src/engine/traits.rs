//! ClientAdapter trait definition
//!
//! This is the core abstraction that every backend adapter implements.
//! One adapter instance owns one configured connection (pool, client or
//! file handle) and maps native results into the canonical types.

use async_trait::async_trait;

use crate::engine::capabilities::Capabilities;
use crate::engine::changes;
use crate::engine::cursor::StreamingCursor;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::sql::{self, CompiledStatement, SqlDialect};
use crate::engine::types::{
    AlterIndexSpec, AlterRelationSpec, AlterTableSpec, ConnectionState, ElementKind, QueryId,
    QueryResult, ResultMode, Routine, SelectOptions, TableChangeSet, TableColumn, TableIndex,
    TableKey, TableOrView, TableTrigger, Value,
};

/// Core contract implemented by every backend adapter
///
/// Listing methods return an empty list when the backend has no such
/// concept. Optional operations fail with `NotSupported`; callers can check
/// [`ClientAdapter::capabilities`] first.
#[async_trait]
pub trait ClientAdapter: Send + Sync {
    /// Returns the unique identifier for this driver (e.g., "postgres", "mysql", "mongodb")
    fn driver_id(&self) -> &'static str;

    /// Returns a human-readable name for this driver
    fn driver_name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// SQL dialect used by the shared statement builder, if relational.
    fn sql_dialect(&self) -> Option<SqlDialect> {
        None
    }

    fn state(&self) -> ConnectionState;

    // ==================== Lifecycle ====================

    /// Opens the native connection. Fails with `ConnectInProgress` while
    /// another connect on the same instance is pending.
    async fn connect(&self) -> EngineResult<()>;

    /// Releases native resources. Idempotent.
    async fn disconnect(&self) -> EngineResult<()>;

    /// Round-trips a trivial command over an open connection.
    async fn ping(&self) -> EngineResult<()>;

    /// Connects, pings, and disconnects again.
    async fn test_connection(&self) -> EngineResult<()> {
        self.connect().await?;
        let result = self.ping().await;
        if let Err(e) = self.disconnect().await {
            tracing::warn!("Disconnect after connection test failed: {}", e);
        }
        result
    }

    // ==================== Metadata ====================

    async fn list_databases(&self) -> EngineResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn list_schemas(&self) -> EngineResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn list_tables(&self, schema: Option<&str>) -> EngineResult<Vec<TableOrView>>;

    async fn list_views(&self, schema: Option<&str>) -> EngineResult<Vec<TableOrView>> {
        let _ = schema;
        Ok(Vec::new())
    }

    async fn list_materialized_views(&self, schema: Option<&str>) -> EngineResult<Vec<TableOrView>> {
        let _ = schema;
        Ok(Vec::new())
    }

    async fn list_routines(&self, schema: Option<&str>) -> EngineResult<Vec<Routine>> {
        let _ = schema;
        Ok(Vec::new())
    }

    async fn list_table_columns(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableColumn>>;

    async fn list_table_indexes(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableIndex>> {
        let _ = (table, schema);
        Ok(Vec::new())
    }

    async fn list_table_keys(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableKey>> {
        let _ = (table, schema);
        Ok(Vec::new())
    }

    async fn list_table_triggers(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableTrigger>> {
        let _ = (table, schema);
        Ok(Vec::new())
    }

    /// Primary key column names in key order.
    async fn get_primary_keys(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        let columns = self.list_table_columns(table, schema).await?;
        Ok(columns
            .into_iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name)
            .collect())
    }

    // ==================== Data access ====================

    /// Native execution primitive. SQL text for relational backends, a JSON
    /// command document for MongoDB.
    async fn execute_query(
        &self,
        query: &str,
        query_id: QueryId,
        mode: ResultMode,
    ) -> EngineResult<Vec<QueryResult>>;

    /// Executes one parameterized statement on the pool.
    async fn run_statement(&self, statement: &CompiledStatement) -> EngineResult<QueryResult> {
        let _ = statement;
        Err(EngineError::not_supported(
            "Parameterized statements are not supported by this driver",
        ))
    }

    async fn select_top(
        &self,
        table: &str,
        schema: Option<&str>,
        options: &SelectOptions,
    ) -> EngineResult<QueryResult> {
        let dialect = self
            .sql_dialect()
            .ok_or_else(|| EngineError::not_supported("select_top is not supported by this driver"))?;
        let statement = sql::select_top(dialect, schema, table, options)?;
        self.run_statement(&statement).await
    }

    async fn select_top_stream(
        &self,
        table: &str,
        schema: Option<&str>,
        options: &SelectOptions,
        chunk_size: usize,
    ) -> EngineResult<Box<dyn StreamingCursor>> {
        let _ = (table, schema, options, chunk_size);
        Err(EngineError::not_supported("Streaming is not supported by this driver"))
    }

    async fn query_stream(&self, query: &str, chunk_size: usize) -> EngineResult<Box<dyn StreamingCursor>> {
        let _ = (query, chunk_size);
        Err(EngineError::not_supported("Streaming is not supported by this driver"))
    }

    /// Cancels a running query
    async fn cancel(&self, query_id: QueryId) -> EngineResult<()> {
        let _ = query_id;
        Err(EngineError::not_supported(
            "Query cancellation is not supported by this driver",
        ))
    }

    // ==================== Structural mutation ====================
    // SQL adapters get these through the shared builder; the compiled
    // statements run through `execute_atomic`.

    async fn alter_table(&self, spec: &AlterTableSpec) -> EngineResult<()> {
        let dialect = self.structural_dialect(self.capabilities().alter_table, "Altering tables")?;
        let statements = sql::alter_table(dialect, spec)?;
        self.run_ddl(statements).await
    }

    async fn alter_index(&self, spec: &AlterIndexSpec) -> EngineResult<()> {
        let dialect = self.structural_dialect(self.capabilities().indexes, "Altering indexes")?;
        let statements = sql::alter_index(dialect, spec)?;
        self.run_ddl(statements).await
    }

    async fn alter_relation(&self, spec: &AlterRelationSpec) -> EngineResult<()> {
        let dialect = self.structural_dialect(self.capabilities().alter_relation, "Altering relations")?;
        let statements = sql::alter_relation(dialect, spec)?;
        self.run_ddl(statements).await
    }

    async fn drop_element(&self, kind: ElementKind, schema: Option<&str>, name: &str) -> EngineResult<()> {
        let dialect = self.structural_dialect(true, "Dropping elements")?;
        let statement = sql::drop_element(dialect, kind, schema, name)?;
        self.run_ddl(vec![statement]).await
    }

    async fn truncate_element(&self, table: &str, schema: Option<&str>) -> EngineResult<()> {
        let dialect = self.structural_dialect(self.capabilities().truncate, "Truncating tables")?;
        self.run_ddl(vec![sql::truncate(dialect, schema, table)]).await
    }

    async fn duplicate_table(&self, table: &str, schema: Option<&str>, new_name: &str) -> EngineResult<()> {
        let dialect = self.structural_dialect(self.capabilities().duplicate_table, "Duplicating tables")?;
        self.run_ddl(sql::duplicate_table(dialect, schema, table, new_name)).await
    }

    #[doc(hidden)]
    fn structural_dialect(&self, supported: bool, what: &str) -> EngineResult<SqlDialect> {
        match self.sql_dialect() {
            Some(dialect) if supported => Ok(dialect),
            _ => Err(EngineError::not_supported(format!(
                "{} is not supported by {}",
                what,
                self.driver_name()
            ))),
        }
    }

    #[doc(hidden)]
    async fn run_ddl(&self, statements: Vec<String>) -> EngineResult<()> {
        if statements.is_empty() {
            return Ok(());
        }
        let compiled: Vec<CompiledStatement> = statements.into_iter().map(CompiledStatement::command).collect();
        self.execute_atomic(&compiled).await.map(|_| ())
    }

    // ==================== Change application ====================

    /// Normalizes a value for the declared column type before it is bound.
    fn coerce_value(&self, value: Value, column_type: Option<&str>) -> Value {
        let _ = column_type;
        value
    }

    /// Runs every statement inside one transaction, rolling back on the first
    /// failure. Returns one result per statement.
    async fn execute_atomic(&self, statements: &[CompiledStatement]) -> EngineResult<Vec<QueryResult>> {
        let _ = statements;
        Err(EngineError::not_supported(
            "Atomic execution is not supported by this driver",
        ))
    }

    /// Applies a change set atomically and returns one snapshot per update.
    async fn apply_changes(&self, changes: &TableChangeSet) -> EngineResult<Vec<QueryResult>> {
        let dialect = self
            .sql_dialect()
            .ok_or_else(|| EngineError::not_supported("Change sets are not supported by this driver"))?;
        changes::apply_sql_changes(self, dialect, changes).await
    }

    // ==================== Session reservation ====================

    /// Checks out a dedicated connection for a caller session.
    async fn reserve_connection(&self) -> EngineResult<Box<dyn ReservedConnection>> {
        Err(EngineError::not_supported(
            "Reserved connections are not supported by this driver",
        ))
    }
}

/// A dedicated connection held for one caller session
///
/// `commit` and `rollback` consume the handle; the session manager acquires
/// a fresh one afterwards.
#[async_trait]
pub trait ReservedConnection: Send {
    fn in_transaction(&self) -> bool;

    async fn begin(&mut self) -> EngineResult<()>;

    async fn execute(
        &mut self,
        query: &str,
        query_id: QueryId,
        mode: ResultMode,
    ) -> EngineResult<Vec<QueryResult>>;

    async fn commit(self: Box<Self>) -> EngineResult<()>;

    async fn rollback(self: Box<Self>) -> EngineResult<()>;
}
