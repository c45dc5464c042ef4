//! Query requests
//!
//! Execution, metadata listings, host-side cursors and per-tab sessions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{field, instrument};
use uuid::Uuid;

use crate::commands::host::HostState;
use crate::commands::{CursorChunk, HistoryEntry, Listing, Response};
use crate::engine::connection_manager::ActiveConnection;
use crate::engine::cursor::StreamingCursor;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::pipeline::QueryOptions;
use crate::engine::types::{ConnectionId, QueryId, SelectOptions, SessionId};
use crate::Engine;

const TRANSACTIONS_NOT_SUPPORTED: &str = "Transactions are not supported by this driver";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorId(pub Uuid);

impl CursorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CursorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a cursor reads from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CursorSource {
    Table {
        table: String,
        schema: Option<String>,
        #[serde(default)]
        options: SelectOptions,
    },
    Query {
        query: String,
    },
}

type SharedCursor = Arc<Mutex<Box<dyn StreamingCursor>>>;

struct CursorEntry {
    connection_id: ConnectionId,
    cursor: SharedCursor,
}

/// Open cursors keyed by id
#[derive(Default)]
pub struct CursorTable {
    cursors: RwLock<HashMap<CursorId, CursorEntry>>,
}

impl CursorTable {
    async fn insert(&self, connection_id: ConnectionId, cursor: Box<dyn StreamingCursor>) -> CursorId {
        let id = CursorId::new();
        let entry = CursorEntry {
            connection_id,
            cursor: Arc::new(Mutex::new(cursor)),
        };
        self.cursors.write().await.insert(id, entry);
        id
    }

    async fn get(&self, id: CursorId) -> EngineResult<SharedCursor> {
        self.cursors
            .read()
            .await
            .get(&id)
            .map(|entry| Arc::clone(&entry.cursor))
            .ok_or_else(|| EngineError::execution_error(format!("Cursor not found: {}", id)))
    }

    async fn remove(&self, id: CursorId) -> Option<SharedCursor> {
        self.cursors.write().await.remove(&id).map(|entry| entry.cursor)
    }

    pub async fn len(&self) -> usize {
        self.cursors.read().await.len()
    }

    /// Closes every cursor opened on `connection_id`; returns how many.
    pub async fn close_for_connection(&self, connection_id: ConnectionId) -> usize {
        let drained: Vec<SharedCursor> = {
            let mut cursors = self.cursors.write().await;
            let ids: Vec<CursorId> = cursors
                .iter()
                .filter(|(_, entry)| entry.connection_id == connection_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| cursors.remove(&id))
                .map(|entry| entry.cursor)
                .collect()
        };
        let count = drained.len();
        close_cursors(drained).await;
        count
    }

    pub async fn close_all(&self) {
        let drained: Vec<SharedCursor> = {
            let mut cursors = self.cursors.write().await;
            cursors.drain().map(|(_, entry)| entry.cursor).collect()
        };
        close_cursors(drained).await;
    }
}

async fn close_cursors(cursors: Vec<SharedCursor>) {
    for cursor in cursors {
        if let Err(e) = cursor.lock().await.close().await {
            tracing::warn!("Failed to close cursor: {}", e);
        }
    }
}

async fn connection(engine: &Engine, id: ConnectionId) -> EngineResult<Arc<ActiveConnection>> {
    engine.connections().get(id).await
}

fn required<'a>(table: Option<&'a str>, listing: Listing) -> EngineResult<&'a str> {
    table.ok_or_else(|| EngineError::execution_error(format!("{:?} requires a table name", listing)))
}

#[instrument(
    skip(engine, query, options),
    fields(
        connection_id = %connection_id,
        query_len = query.len(),
        driver = field::Empty
    )
)]
pub async fn execute(
    engine: &Engine,
    connection_id: ConnectionId,
    query: &str,
    options: QueryOptions,
    multiple: bool,
) -> EngineResult<Response> {
    let connection = connection(engine, connection_id).await?;
    tracing::Span::current().record("driver", &field::display(connection.adapter.driver_id()));

    if multiple {
        let results = connection.pipeline.execute_multiple(query, options).await?;
        Ok(Response::Results(results))
    } else {
        let result = connection.pipeline.execute_single(query, options).await?;
        Ok(Response::Result(result))
    }
}

/// Cancels `query_id`, or the connection's most recent query when omitted.
#[instrument(skip(engine), fields(connection_id = %connection_id, query_id = ?query_id))]
pub async fn cancel(engine: &Engine, connection_id: ConnectionId, query_id: Option<QueryId>) -> EngineResult<Response> {
    let connection = connection(engine, connection_id).await?;
    let cancelled = connection.pipeline.cancel(query_id).await?;
    Ok(Response::Cancelled(cancelled))
}

pub async fn describe(
    engine: &Engine,
    connection_id: ConnectionId,
    listing: Listing,
    schema: Option<&str>,
    table: Option<&str>,
) -> EngineResult<Response> {
    let adapter = &connection(engine, connection_id).await?.adapter;

    let response = match listing {
        Listing::Databases => Response::Names(adapter.list_databases().await?),
        Listing::Schemas => Response::Names(adapter.list_schemas().await?),
        Listing::Tables => Response::Tables(adapter.list_tables(schema).await?),
        Listing::Views => Response::Tables(adapter.list_views(schema).await?),
        Listing::MaterializedViews => Response::Tables(adapter.list_materialized_views(schema).await?),
        Listing::Routines => Response::Routines(adapter.list_routines(schema).await?),
        Listing::TableColumns => {
            Response::Columns(adapter.list_table_columns(required(table, listing)?, schema).await?)
        }
        Listing::TableIndexes => {
            Response::Indexes(adapter.list_table_indexes(required(table, listing)?, schema).await?)
        }
        Listing::TableKeys => Response::Keys(adapter.list_table_keys(required(table, listing)?, schema).await?),
        Listing::TableTriggers => {
            Response::Triggers(adapter.list_table_triggers(required(table, listing)?, schema).await?)
        }
        Listing::PrimaryKeys => Response::Names(adapter.get_primary_keys(required(table, listing)?, schema).await?),
    };
    Ok(response)
}

pub async fn select_top(
    engine: &Engine,
    connection_id: ConnectionId,
    table: &str,
    schema: Option<&str>,
    options: &SelectOptions,
) -> EngineResult<Response> {
    let adapter = &connection(engine, connection_id).await?.adapter;
    Ok(Response::Result(adapter.select_top(table, schema, options).await?))
}

/// The newest `limit` history entries, oldest first.
pub fn history(engine: &Engine, limit: Option<usize>) -> Response {
    let entries = engine.history().entries();
    let skip = limit.map(|limit| entries.len().saturating_sub(limit)).unwrap_or(0);
    Response::History(
        entries
            .into_iter()
            .skip(skip)
            .map(|(log_id, entry)| HistoryEntry { log_id, entry })
            .collect(),
    )
}

// ==================== Cursors ====================

#[instrument(skip(state, source), fields(connection_id = %connection_id))]
pub async fn open_cursor(
    state: &HostState,
    connection_id: ConnectionId,
    source: CursorSource,
    chunk_size: Option<usize>,
) -> EngineResult<Response> {
    let connection = connection(&state.engine, connection_id).await?;
    let chunk_size = match chunk_size {
        Some(size) => size.max(1),
        None => state.engine.connections().settings().await.default_chunk_size,
    };

    let adapter = &connection.adapter;
    let mut cursor = match &source {
        CursorSource::Table { table, schema, options } => {
            adapter
                .select_top_stream(table, schema.as_deref(), options, chunk_size)
                .await?
        }
        CursorSource::Query { query } => {
            // Cursors bypass the pipeline, so gate writes here
            if connection.pipeline.is_read_only() {
                let classification = crate::engine::classifier::classify(adapter.driver_id(), query);
                if let Some(kind) = classification.first_write() {
                    return Err(EngineError::read_only(kind.as_str()));
                }
            }
            adapter.query_stream(query, chunk_size).await?
        }
    };
    cursor.start().await?;

    let cursor_state = cursor.state().clone();
    let cursor_id = state.cursors.insert(connection_id, cursor).await;
    tracing::debug!(cursor_id = %cursor_id, chunk_size, "Cursor opened");
    Ok(Response::CursorOpened {
        cursor_id,
        state: cursor_state,
    })
}

/// Reads the next chunk. An exhausted cursor keeps answering with empty
/// chunks until it is closed.
pub async fn read_cursor(state: &HostState, cursor_id: CursorId) -> EngineResult<Response> {
    let cursor = state.cursors.get(cursor_id).await?;
    let mut cursor = cursor.lock().await;
    let rows = cursor.read().await?;
    Ok(Response::Chunk(CursorChunk {
        cursor_id,
        columns: cursor.columns().to_vec(),
        rows,
        state: cursor.state().clone(),
    }))
}

/// Closing an unknown cursor is a no-op.
pub async fn close_cursor(state: &HostState, cursor_id: CursorId) -> EngineResult<Response> {
    if let Some(cursor) = state.cursors.remove(cursor_id).await {
        cursor.lock().await.close().await?;
    }
    Ok(Response::Ok)
}

// ==================== Sessions ====================

pub async fn reserve_session(
    engine: &Engine,
    connection_id: ConnectionId,
    session_id: SessionId,
) -> EngineResult<Response> {
    let connection = connection(engine, connection_id).await?;
    connection.sessions.reserve_connection(session_id).await?;
    Ok(Response::Ok)
}

pub async fn release_session(
    engine: &Engine,
    connection_id: ConnectionId,
    session_id: SessionId,
) -> EngineResult<Response> {
    let connection = connection(engine, connection_id).await?;
    connection.sessions.release_connection(&session_id).await?;
    Ok(Response::Ok)
}

async fn transactional(engine: &Engine, connection_id: ConnectionId) -> EngineResult<Arc<ActiveConnection>> {
    let connection = connection(engine, connection_id).await?;
    if !connection.adapter.capabilities().transactions {
        return Err(EngineError::not_supported(TRANSACTIONS_NOT_SUPPORTED));
    }
    Ok(connection)
}

/// Begins a transaction on the session's reserved connection.
#[instrument(skip(engine), fields(connection_id = %connection_id, session = %session_id))]
pub async fn begin_transaction(
    engine: &Engine,
    connection_id: ConnectionId,
    session_id: SessionId,
) -> EngineResult<Response> {
    let connection = transactional(engine, connection_id).await?;
    connection.sessions.start_transaction(&session_id).await?;
    Ok(Response::Ok)
}

/// The session stays reserved after commit.
#[instrument(skip(engine), fields(connection_id = %connection_id, session = %session_id))]
pub async fn commit_transaction(
    engine: &Engine,
    connection_id: ConnectionId,
    session_id: SessionId,
) -> EngineResult<Response> {
    let connection = transactional(engine, connection_id).await?;
    connection.sessions.commit_transaction(&session_id).await?;
    Ok(Response::Ok)
}

#[instrument(skip(engine), fields(connection_id = %connection_id, session = %session_id))]
pub async fn rollback_transaction(
    engine: &Engine,
    connection_id: ConnectionId,
    session_id: SessionId,
) -> EngineResult<Response> {
    let connection = transactional(engine, connection_id).await?;
    connection.sessions.rollback_transaction(&session_id).await?;
    Ok(Response::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::engine::types::ConnectionConfig;

    async fn state_with_table() -> (HostState, ConnectionId) {
        let engine = Arc::new(Engine::new(EngineSettings::default()).await);
        let mut config = ConnectionConfig::new("sqlite", "", 0);
        config.database = Some(":memory:".into());
        let id = engine.connections().connect(config).await.expect("connect");

        let setup = "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT);
                     INSERT INTO items (label) VALUES ('a'), ('b'), ('c');";
        execute(&engine, id, setup, QueryOptions::default(), true)
            .await
            .expect("setup");

        let state = HostState {
            engine,
            cursors: CursorTable::default(),
        };
        (state, id)
    }

    fn rows(response: Response) -> usize {
        match response {
            Response::Chunk(chunk) => chunk.rows.len(),
            other => panic!("expected a chunk, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn table_cursor_reads_in_chunks() {
        let (state, id) = state_with_table().await;
        let source = CursorSource::Table {
            table: "items".into(),
            schema: None,
            options: SelectOptions::default(),
        };
        let Response::CursorOpened { cursor_id, .. } = open_cursor(&state, id, source, Some(2)).await.expect("open")
        else {
            panic!("expected an opened cursor");
        };

        assert_eq!(rows(read_cursor(&state, cursor_id).await.expect("read")), 2);
        assert_eq!(rows(read_cursor(&state, cursor_id).await.expect("read")), 1);
        assert_eq!(rows(read_cursor(&state, cursor_id).await.expect("read")), 0);

        close_cursor(&state, cursor_id).await.expect("close");
        assert_eq!(state.cursors.len().await, 0);
        assert!(read_cursor(&state, cursor_id).await.is_err());
    }

    #[tokio::test]
    async fn disconnect_closes_open_cursors() {
        let (state, id) = state_with_table().await;
        let source = CursorSource::Query {
            query: "SELECT * FROM items".into(),
        };
        open_cursor(&state, id, source, None).await.expect("open");
        assert_eq!(state.cursors.close_for_connection(id).await, 1);
        assert_eq!(state.cursors.len().await, 0);
    }

    #[tokio::test]
    async fn table_listings_need_a_table() {
        let (state, id) = state_with_table().await;
        let err = describe(&state.engine, id, Listing::TableColumns, None, None)
            .await
            .expect_err("missing table");
        assert!(err.to_string().contains("requires a table name"));

        let Response::Names(keys) = describe(&state.engine, id, Listing::PrimaryKeys, None, Some("items"))
            .await
            .expect("primary keys")
        else {
            panic!("expected names");
        };
        assert_eq!(keys, vec!["id".to_string()]);
    }

    #[tokio::test]
    async fn history_keeps_the_newest_entries() {
        let (state, id) = state_with_table().await;
        execute(&state.engine, id, "SELECT 1", QueryOptions::default(), false)
            .await
            .expect("select");

        let Response::History(entries) = history(&state.engine, Some(1)) else {
            panic!("expected history");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry.text, "SELECT 1");
    }
}
