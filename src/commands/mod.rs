//! Request host
//!
//! Callers drive the engine with typed [`Request`] messages. Each request is
//! sent to the host task with a correlation id and answered exactly once
//! with a [`Response`]; see [`host`] for the transport.

pub mod connection;
pub mod host;
pub mod mutation;
pub mod policy;
pub mod query;
pub mod vault;

use serde::{Deserialize, Serialize};

use crate::config::SafetyPolicy;
use crate::engine::connection_manager::ConnectionSummary;
use crate::engine::cursor::CursorState;
use crate::engine::error::{EngineError, EngineResult, ErrorKind};
use crate::engine::pipeline::QueryOptions;
use crate::engine::query_log::{LogId, QueryLogEntry};
use crate::engine::types::{
    AlterIndexSpec, AlterRelationSpec, AlterTableSpec, ColumnInfo, ConnectionConfig, ConnectionId, ElementKind,
    QueryId, QueryResult, Routine, Row, SelectOptions, SessionId, TableChangeSet, TableColumn, TableIndex,
    TableKey, TableOrView, TableTrigger,
};

pub use connection::DriverInfo;
pub use host::{EngineClient, EngineHost};
pub use query::{CursorId, CursorSource};

/// Metadata listings served by [`Request::Describe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Listing {
    Databases,
    Schemas,
    Tables,
    Views,
    MaterializedViews,
    Routines,
    TableColumns,
    TableIndexes,
    TableKeys,
    TableTriggers,
    PrimaryKeys,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    // Connections
    ListDrivers,
    TestConnection {
        config: ConnectionConfig,
    },
    Connect {
        config: ConnectionConfig,
    },
    Disconnect {
        connection_id: ConnectionId,
    },
    ListConnections,

    // Queries
    Execute {
        connection_id: ConnectionId,
        query: String,
        #[serde(default)]
        options: QueryOptions,
        /// One result per statement instead of the first only
        #[serde(default)]
        multiple: bool,
    },
    Cancel {
        connection_id: ConnectionId,
        query_id: Option<QueryId>,
    },
    Describe {
        connection_id: ConnectionId,
        listing: Listing,
        schema: Option<String>,
        /// Required by the table-level listings
        table: Option<String>,
    },
    SelectTop {
        connection_id: ConnectionId,
        table: String,
        schema: Option<String>,
        #[serde(default)]
        options: SelectOptions,
    },
    QueryHistory {
        limit: Option<usize>,
    },

    // Cursors
    OpenCursor {
        connection_id: ConnectionId,
        source: CursorSource,
        chunk_size: Option<usize>,
    },
    ReadCursor {
        cursor_id: CursorId,
    },
    CloseCursor {
        cursor_id: CursorId,
    },

    // Sessions
    ReserveSession {
        connection_id: ConnectionId,
        session_id: SessionId,
    },
    ReleaseSession {
        connection_id: ConnectionId,
        session_id: SessionId,
    },
    BeginTransaction {
        connection_id: ConnectionId,
        session_id: SessionId,
    },
    CommitTransaction {
        connection_id: ConnectionId,
        session_id: SessionId,
    },
    RollbackTransaction {
        connection_id: ConnectionId,
        session_id: SessionId,
    },

    // Mutations
    ApplyChanges {
        connection_id: ConnectionId,
        changes: TableChangeSet,
        #[serde(default)]
        allow_writes: bool,
    },
    AlterTable {
        connection_id: ConnectionId,
        spec: AlterTableSpec,
        /// Needed in production when the change drops columns
        #[serde(default)]
        acknowledged_dangerous: bool,
    },
    AlterIndex {
        connection_id: ConnectionId,
        spec: AlterIndexSpec,
    },
    AlterRelation {
        connection_id: ConnectionId,
        spec: AlterRelationSpec,
    },
    DropElement {
        connection_id: ConnectionId,
        kind: ElementKind,
        schema: Option<String>,
        name: String,
        #[serde(default)]
        acknowledged_dangerous: bool,
    },
    TruncateTable {
        connection_id: ConnectionId,
        table: String,
        schema: Option<String>,
        #[serde(default)]
        acknowledged_dangerous: bool,
    },
    DuplicateTable {
        connection_id: ConnectionId,
        table: String,
        schema: Option<String>,
        new_name: String,
    },

    // Policy
    GetSafetyPolicy,
    SetSafetyPolicy {
        policy: SafetyPolicy,
    },

    // Vault
    SaveSecret {
        service: Option<String>,
        account: String,
        secret: String,
    },
    DeleteSecret {
        service: Option<String>,
        account: String,
    },
}

impl Request {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Request::ListDrivers => "list_drivers",
            Request::TestConnection { .. } => "test_connection",
            Request::Connect { .. } => "connect",
            Request::Disconnect { .. } => "disconnect",
            Request::ListConnections => "list_connections",
            Request::Execute { .. } => "execute",
            Request::Cancel { .. } => "cancel",
            Request::Describe { .. } => "describe",
            Request::SelectTop { .. } => "select_top",
            Request::QueryHistory { .. } => "query_history",
            Request::OpenCursor { .. } => "open_cursor",
            Request::ReadCursor { .. } => "read_cursor",
            Request::CloseCursor { .. } => "close_cursor",
            Request::ReserveSession { .. } => "reserve_session",
            Request::ReleaseSession { .. } => "release_session",
            Request::BeginTransaction { .. } => "begin_transaction",
            Request::CommitTransaction { .. } => "commit_transaction",
            Request::RollbackTransaction { .. } => "rollback_transaction",
            Request::ApplyChanges { .. } => "apply_changes",
            Request::AlterTable { .. } => "alter_table",
            Request::AlterIndex { .. } => "alter_index",
            Request::AlterRelation { .. } => "alter_relation",
            Request::DropElement { .. } => "drop_element",
            Request::TruncateTable { .. } => "truncate_table",
            Request::DuplicateTable { .. } => "duplicate_table",
            Request::GetSafetyPolicy => "get_safety_policy",
            Request::SetSafetyPolicy { .. } => "set_safety_policy",
            Request::SaveSecret { .. } => "save_secret",
            Request::DeleteSecret { .. } => "delete_secret",
        }
    }
}

/// A chunk handed out by a host-side cursor
#[derive(Debug, Clone, Serialize)]
pub struct CursorChunk {
    pub cursor_id: CursorId,
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
    pub state: CursorState,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub log_id: LogId,
    #[serde(flatten)]
    pub entry: QueryLogEntry,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Drivers(Vec<DriverInfo>),
    Connected(ConnectionId),
    Connections(Vec<ConnectionSummary>),
    Result(QueryResult),
    Results(Vec<QueryResult>),
    Cancelled(QueryId),
    Names(Vec<String>),
    Tables(Vec<TableOrView>),
    Routines(Vec<Routine>),
    Columns(Vec<TableColumn>),
    Indexes(Vec<TableIndex>),
    Keys(Vec<TableKey>),
    Triggers(Vec<TableTrigger>),
    History(Vec<HistoryEntry>),
    CursorOpened { cursor_id: CursorId, state: CursorState },
    Chunk(CursorChunk),
    SafetyPolicy(SafetyPolicy),
    Error { kind: ErrorKind, message: String },
}

impl Response {
    pub fn from_error(error: &EngineError) -> Self {
        Response::Error {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

impl From<EngineResult<Response>> for Response {
    fn from(result: EngineResult<Response>) -> Self {
        match result {
            Ok(response) => response,
            Err(e) => Response::from_error(&e),
        }
    }
}
