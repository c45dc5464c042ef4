//! Canonical data types for the unidb engine
//!
//! These types are the only shapes callers depend on. Every adapter maps its
//! native results into them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::credentials::AuthConfig;

/// Identifier of an opened adapter in the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for a running query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(pub Uuid);

impl QueryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-supplied logical session, e.g. one open editor tab
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub driver: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    /// Database name; for SQLite the file path (or `:memory:`)
    pub database: Option<String>,
    pub ssl: bool,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub read_only: bool,
    pub ssh_tunnel: Option<SshTunnelConfig>,
    /// Resolve username/secret through a credential provider at connect time
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// Backend-specific options (e.g. `max_connections`, `application_name`)
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn default_environment() -> String {
    "development".to_string()
}

impl ConnectionConfig {
    pub fn new(driver: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            driver: driver.into(),
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
            database: None,
            ssl: false,
            environment: default_environment(),
            read_only: false,
            ssh_tunnel: None,
            auth: None,
            options: BTreeMap::new(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn option_u32(&self, key: &str) -> Option<u32> {
        self.options.get(key).and_then(|v| v.trim().parse().ok())
    }
}

/// SSH tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTunnelConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,

    /// Host key verification policy (security-critical).
    pub host_key_policy: SshHostKeyPolicy,

    /// Optional path to an app-owned known_hosts file.
    /// If not provided, a per-user default is used.
    pub known_hosts_path: Option<String>,

    /// Optional SSH jump host/bastion, formatted like `user@host:port`.
    pub proxy_jump: Option<String>,

    /// Connection timeout in seconds for the SSH TCP handshake.
    pub connect_timeout_secs: u32,

    /// SSH keepalive interval in seconds.
    pub keepalive_interval_secs: u32,

    /// Max number of keepalive failures before disconnect.
    pub keepalive_count_max: u32,
}

/// Host key verification policy for SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshHostKeyPolicy {
    /// Trust on first use: auto-add new hosts to an app-owned known_hosts file.
    AcceptNew,
    /// Strict: require the host key to already be present in known_hosts.
    Strict,
    /// Insecure: disable host key checking (dev-only).
    InsecureNoCheck,
}

/// SSH authentication method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SshAuth {
    Password { password: String },
    Key { private_key_path: String, passphrase: Option<String> },
}

/// Lifecycle state of one adapter instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Query cancellation support level for a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelSupport {
    None,
    BestEffort,
    Driver,
}

/// Whether the caller wants one result or one per statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultMode {
    Single,
    Multiple,
}

/// Namespace represents the hierarchy level above tables
/// - For PostgreSQL: database + schema
/// - For MySQL / SQLite: database
/// - For MongoDB: database
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Namespace {
    pub database: String,
    pub schema: Option<String>,
}

impl Namespace {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            schema: None,
        }
    }

    pub fn with_schema(database: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            schema: Some(schema.into()),
        }
    }
}

/// A table, view, or document collection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableOrView {
    pub schema: Option<String>,
    pub name: String,
    pub entity_type: EntityType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Table,
    View,
    MaterializedView,
    Collection,
}

/// Universal value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
    Array(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Interprets 0/1, "true"/"false", "t"/"f" and native booleans.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(0) => Some(false),
            Value::Int(1) => Some(true),
            Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" | "yes" => Some(true),
                "false" | "f" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};
    use base64::{Engine, engine::general_purpose::STANDARD};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Column metadata of a result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// A single row of data (indexed by column order)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

/// Row data for inserts (indexed by column name, deterministic order)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowData {
    pub columns: BTreeMap<String, Value>,
}

impl RowData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.insert(name.into(), value.into());
        self
    }
}

/// Canonical query execution result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    /// Number of affected rows (for INSERT/UPDATE/DELETE)
    pub affected_rows: Option<u64>,
    /// Execution time in milliseconds
    pub execution_time_ms: f64,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            affected_rows: None,
            execution_time_ms: 0.0,
        }
    }

    pub fn with_rows(columns: Vec<ColumnInfo>, rows: Vec<Row>, time_ms: f64) -> Self {
        Self {
            row_count: rows.len(),
            columns,
            rows,
            affected_rows: None,
            execution_time_ms: time_ms,
        }
    }

    pub fn with_affected_rows(affected: u64, time_ms: f64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            affected_rows: Some(affected),
            execution_time_ms: time_ms,
        }
    }

    /// Value of `column` in row `row`, if both exist.
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c.name == column)?;
        self.rows.get(row).and_then(|r| r.values.get(idx))
    }
}

/// Column metadata for table schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    /// Data type (database-specific)
    pub data_type: String,
    pub nullable: bool,
    /// Default value expression (if any)
    pub default_value: Option<String>,
    pub is_primary_key: bool,
    pub ordinal_position: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableIndex {
    pub name: String,
    pub table: String,
    pub schema: Option<String>,
    pub columns: Vec<String>,
    pub unique: bool,
    pub primary: bool,
}

/// A foreign-key relation between two tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableKey {
    pub name: Option<String>,
    pub from_schema: Option<String>,
    pub from_table: String,
    pub from_columns: Vec<String>,
    pub to_schema: Option<String>,
    pub to_table: String,
    pub to_columns: Vec<String>,
    pub on_update: Option<String>,
    pub on_delete: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutineType {
    Function,
    Procedure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    pub schema: Option<String>,
    pub name: String,
    pub routine_type: RoutineType,
    pub return_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableTrigger {
    pub name: String,
    pub table: String,
    pub schema: Option<String>,
    pub timing: Option<String>,
    pub event: Option<String>,
    pub statement: Option<String>,
}

/// One primary-key column/value pair; tuples keep their declared order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub column: String,
    pub value: Value,
}

impl KeyValue {
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

pub type PrimaryKeyTuple = Vec<KeyValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInsert {
    pub table: String,
    pub schema: Option<String>,
    pub rows: Vec<RowData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableUpdate {
    pub table: String,
    pub schema: Option<String>,
    pub column: String,
    pub value: Value,
    /// Declared column type, used by value coercion
    #[serde(default)]
    pub column_type: Option<String>,
    pub primary_keys: PrimaryKeyTuple,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDelete {
    pub table: String,
    pub schema: Option<String>,
    pub primary_keys: PrimaryKeyTuple,
}

/// A structured batch of edits applied as one atomic unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableChangeSet {
    #[serde(default)]
    pub inserts: Vec<TableInsert>,
    #[serde(default)]
    pub updates: Vec<TableUpdate>,
    #[serde(default)]
    pub deletes: Vec<TableDelete>,
}

impl TableChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Number of native operations the set expands to (one per inserted row).
    pub fn operation_count(&self) -> usize {
        self.inserts.iter().map(|i| i.rows.len()).sum::<usize>()
            + self.updates.len()
            + self.deletes.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Desc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Like,
    ILike,
    In,
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableFilter {
    pub column: String,
    pub operator: FilterOperator,
    /// Ignored for null checks; an `Array` for `In`
    #[serde(default = "null_value")]
    pub value: Value,
}

fn null_value() -> Value {
    Value::Null
}

/// Options for `select_top` / `select_top_stream`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectOptions {
    #[serde(default)]
    pub offset: u64,
    pub limit: Option<u64>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub filters: Vec<TableFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    pub default_value: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnAlteration {
    pub column: String,
    pub new_name: Option<String>,
    pub new_type: Option<String>,
    pub nullable: Option<bool>,
    /// `Some(None)` drops the default
    pub default_value: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlterTableSpec {
    pub table: String,
    pub schema: Option<String>,
    #[serde(default)]
    pub adds: Vec<ColumnDefinition>,
    #[serde(default)]
    pub alterations: Vec<ColumnAlteration>,
    #[serde(default)]
    pub drops: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub columns: Vec<OrderBy>,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlterIndexSpec {
    pub table: String,
    pub schema: Option<String>,
    #[serde(default)]
    pub additions: Vec<IndexDefinition>,
    #[serde(default)]
    pub drops: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub name: Option<String>,
    pub columns: Vec<String>,
    pub to_schema: Option<String>,
    pub to_table: String,
    pub to_columns: Vec<String>,
    pub on_update: Option<String>,
    pub on_delete: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlterRelationSpec {
    pub table: String,
    pub schema: Option<String>,
    #[serde(default)]
    pub additions: Vec<RelationDefinition>,
    #[serde(default)]
    pub drops: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Table,
    View,
    MaterializedView,
    Schema,
    Database,
}

impl ElementKind {
    pub fn sql_keyword(&self) -> &'static str {
        match self {
            ElementKind::Table => "TABLE",
            ElementKind::View => "VIEW",
            ElementKind::MaterializedView => "MATERIALIZED VIEW",
            ElementKind::Schema => "SCHEMA",
            ElementKind::Database => "DATABASE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_auth_deserializes_from_externally_tagged_enum() {
        let json = r#"{"Key":{"private_key_path":"/tmp/id_ed25519","passphrase":"p"}}"#;
        let auth: SshAuth = serde_json::from_str(json).expect("should parse");

        match auth {
            SshAuth::Key {
                private_key_path,
                passphrase,
            } => {
                assert_eq!(private_key_path, "/tmp/id_ed25519");
                assert_eq!(passphrase.as_deref(), Some("p"));
            }
            other => panic!("unexpected auth variant: {other:?}"),
        }
    }

    #[test]
    fn password_is_never_serialized() {
        let mut config = ConnectionConfig::new("postgres", "db.internal", 5432);
        config.password = "hunter2".to_string();

        let json = serde_json::to_string(&config).expect("serialize");
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn value_bool_interpretation() {
        assert_eq!(Value::Int(1).as_bool(), Some(true));
        assert_eq!(Value::Text("f".into()).as_bool(), Some(false));
        assert_eq!(Value::Int(7).as_bool(), None);
    }

    #[test]
    fn change_set_counts_inserted_rows() {
        let set = TableChangeSet {
            inserts: vec![TableInsert {
                table: "people".into(),
                schema: None,
                rows: vec![RowData::new().with_column("id", 1), RowData::new().with_column("id", 2)],
            }],
            updates: Vec::new(),
            deletes: vec![TableDelete {
                table: "people".into(),
                schema: None,
                primary_keys: vec![KeyValue::new("id", 9)],
            }],
        };

        assert_eq!(set.operation_count(), 3);
        assert!(!set.is_empty());
    }
}
