//! MongoDB Driver
//!
//! Implements the ClientAdapter contract for MongoDB using the official driver.
//!
//! Queries are JSON command documents:
//!
//! ```json
//! {"database": "app", "collection": "users", "operation": "find",
//!  "filter": {"age": {"$gt": 30}}, "options": {"limit": 10, "sort": {"age": -1}}}
//! ```
//!
//! `database` defaults to the configured database and `operation` to `find`.
//! The short form `database.collection` lists the collection. Wherever the
//! adapter API takes a schema, MongoDB reads it as the database name.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{doc, oid::ObjectId, Binary, Bson, Document};
use mongodb::options::{ClientOptions, Credential, FindOptions, IndexOptions, ServerAddress, Tls, TlsOptions};
use mongodb::results::CollectionType;
use mongodb::{Client, Collection, Cursor, IndexModel};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::engine::capabilities::Capabilities;
use crate::engine::credentials::CredentialHandle;
use crate::engine::cursor::{PageSource, PagedCursor, StreamingCursor};
use crate::engine::drivers::common::elapsed_ms;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::lifecycle::LifecycleCell;
use crate::engine::registry::ConnectContext;
use crate::engine::ssh_tunnel::TunnelLease;
use crate::engine::traits::ClientAdapter;
use crate::engine::types::{
    ColumnInfo, ConnectionConfig, ConnectionState, ElementKind, EntityType, FilterOperator, KeyValue,
    QueryId, QueryResult, ResultMode, Row as QRow, SelectOptions, SortDirection, TableChangeSet,
    TableColumn, TableDelete, TableFilter, TableIndex, TableInsert, TableOrView, TableUpdate, Value,
};

const SYSTEM_DATABASES: &[&str] = &["admin", "config", "local"];
/// Cap for `find` commands that do not set their own limit
const DEFAULT_FIND_LIMIT: i64 = 1000;
const SCHEMA_SAMPLE_SIZE: i64 = 100;

struct MongoState {
    client: Client,
    tunnel: Option<TunnelLease>,
    host: String,
    port: u16,
}

/// MongoDB adapter for one connection config
pub struct MongoAdapter {
    config: ConnectionConfig,
    ctx: ConnectContext,
    lifecycle: LifecycleCell,
    credentials: CredentialHandle,
    inner: RwLock<Option<MongoState>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CommandOptions {
    limit: Option<i64>,
    skip: Option<u64>,
    sort: Option<serde_json::Value>,
    projection: Option<serde_json::Value>,
}

/// One parsed JSON command
#[derive(Debug, Deserialize)]
struct DocumentCommand {
    database: Option<String>,
    collection: Option<String>,
    #[serde(default = "default_operation")]
    operation: String,
    #[serde(alias = "query")]
    filter: Option<serde_json::Value>,
    document: Option<serde_json::Value>,
    #[serde(default)]
    documents: Vec<serde_json::Value>,
    update: Option<serde_json::Value>,
    replacement: Option<serde_json::Value>,
    #[serde(default)]
    pipeline: Vec<serde_json::Value>,
    field: Option<String>,
    keys: Option<serde_json::Value>,
    name: Option<String>,
    unique: Option<bool>,
    #[serde(default)]
    options: CommandOptions,
}

fn default_operation() -> String {
    "find".to_string()
}

impl DocumentCommand {
    fn parse(query: &str) -> EngineResult<Self> {
        let trimmed = query.trim();

        if trimmed.starts_with('{') {
            return serde_json::from_str(trimmed)
                .map_err(|e| EngineError::syntax_error(format!("Invalid JSON: {}", e)));
        }

        // Short form: database.collection
        match trimmed.split_once('.') {
            Some((database, collection)) if !database.is_empty() && !collection.is_empty() => Ok(Self {
                database: Some(database.to_string()),
                collection: Some(collection.to_string()),
                operation: default_operation(),
                filter: None,
                document: None,
                documents: Vec::new(),
                update: None,
                replacement: None,
                pipeline: Vec::new(),
                field: None,
                keys: None,
                name: None,
                unique: None,
                options: CommandOptions::default(),
            }),
            _ => Err(EngineError::syntax_error(
                "Invalid query format. Use JSON: {\"database\": \"db\", \"collection\": \"col\", \"operation\": \"find\", \"filter\": {...}}",
            )),
        }
    }

    fn collection_name(&self) -> EngineResult<&str> {
        self.collection
            .as_deref()
            .ok_or_else(|| EngineError::syntax_error("Missing 'collection' field"))
    }

    fn filter(&self) -> EngineResult<Document> {
        self.filter.clone().map(json_to_document).unwrap_or_else(|| Ok(Document::new()))
    }

    fn required(value: &Option<serde_json::Value>, field: &str) -> EngineResult<Document> {
        value
            .clone()
            .ok_or_else(|| EngineError::syntax_error(format!("Missing '{}' field", field)))
            .and_then(json_to_document)
    }

    fn pipeline(&self) -> EngineResult<Vec<Document>> {
        self.pipeline.iter().cloned().map(json_to_document).collect()
    }

    fn find_options(&self, default_limit: Option<i64>) -> EngineResult<FindOptions> {
        let mut options = FindOptions::default();
        options.limit = self.options.limit.or(default_limit);
        options.skip = self.options.skip;
        options.sort = self.options.sort.clone().map(json_to_document).transpose()?;
        options.projection = self.options.projection.clone().map(json_to_document).transpose()?;
        Ok(options)
    }
}

/// Parses relaxed or canonical extended JSON into a document.
fn json_to_document(value: serde_json::Value) -> EngineResult<Document> {
    match Bson::try_from(value) {
        Ok(Bson::Document(document)) => Ok(document),
        Ok(other) => Err(EngineError::syntax_error(format!(
            "Expected a JSON object, got {:?}",
            other.element_type()
        ))),
        Err(e) => Err(EngineError::syntax_error(format!("Invalid extended JSON: {}", e))),
    }
}

/// Converts a BSON value to the universal Value type
fn bson_to_value(bson: &Bson) -> Value {
    match bson {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::Int(*i as i64),
        Bson::Int64(i) => Value::Int(*i),
        Bson::Double(f) => Value::Float(*f),
        Bson::String(s) => Value::Text(s.clone()),
        Bson::Binary(b) => Value::Bytes(b.bytes.clone()),
        Bson::ObjectId(oid) => Value::Text(oid.to_hex()),
        Bson::DateTime(dt) => Value::Text(dt.to_string()),
        Bson::Array(arr) => Value::Array(arr.iter().map(bson_to_value).collect()),
        Bson::Document(_) => Value::Json(bson.clone().into_relaxed_extjson()),
        _ => Value::Text(bson.to_string()),
    }
}

/// `_id` text that looks like an ObjectId is matched as one, since reads
/// render ObjectIds as hex.
fn value_to_bson(field: &str, value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Int(i) => Bson::Int64(*i),
        Value::Float(f) => Bson::Double(*f),
        Value::Text(s) if field == "_id" => match ObjectId::parse_str(s) {
            Ok(oid) => Bson::ObjectId(oid),
            Err(_) => Bson::String(s.clone()),
        },
        Value::Text(s) => Bson::String(s.clone()),
        Value::Bytes(bytes) => Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: bytes.clone(),
        }),
        Value::Json(json) => Bson::try_from(json.clone()).unwrap_or_else(|_| Bson::String(json.to_string())),
        Value::Array(items) => Bson::Array(items.iter().map(|item| value_to_bson(field, item)).collect()),
    }
}

fn bson_type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Null => "null",
        Bson::Boolean(_) => "boolean",
        Bson::Int32(_) => "int32",
        Bson::Int64(_) => "int64",
        Bson::Double(_) => "double",
        Bson::Decimal128(_) => "decimal",
        Bson::String(_) => "string",
        Bson::ObjectId(_) => "ObjectId",
        Bson::DateTime(_) => "datetime",
        Bson::Array(_) => "array",
        Bson::Document(_) => "document",
        Bson::Binary(_) => "binary",
        _ => "mixed",
    }
}

/// Field names across all documents, in first-seen order
fn document_columns(documents: &[Document]) -> Vec<ColumnInfo> {
    let mut columns: Vec<ColumnInfo> = Vec::new();
    for document in documents {
        for (key, value) in document {
            if !columns.iter().any(|c| &c.name == key) {
                columns.push(ColumnInfo {
                    name: key.clone(),
                    data_type: bson_type_name(value).to_string(),
                    nullable: true,
                });
            }
        }
    }
    columns
}

/// Projects a document onto `columns`; missing fields become NULL.
fn document_to_row(document: &Document, columns: &[ColumnInfo]) -> QRow {
    QRow {
        values: columns
            .iter()
            .map(|c| document.get(&c.name).map(bson_to_value).unwrap_or(Value::Null))
            .collect(),
    }
}

fn documents_result(documents: &[Document], started: Instant) -> QueryResult {
    let columns = document_columns(documents);
    let rows = documents.iter().map(|d| document_to_row(d, &columns)).collect();
    QueryResult::with_rows(columns, rows, elapsed_ms(started))
}

fn scalar_result(column: &str, values: Vec<Value>, started: Instant) -> QueryResult {
    let columns = vec![ColumnInfo {
        name: column.to_string(),
        data_type: "mixed".to_string(),
        nullable: true,
    }];
    let rows = values.into_iter().map(|v| QRow { values: vec![v] }).collect();
    QueryResult::with_rows(columns, rows, elapsed_ms(started))
}

fn acknowledged(started: Instant) -> QueryResult {
    let mut result = QueryResult::empty();
    result.execution_time_ms = elapsed_ms(started);
    result
}

fn key_filter(keys: &[KeyValue]) -> EngineResult<Document> {
    if keys.is_empty() {
        return Err(EngineError::execution_error(
            "Refusing to modify a document without a key",
        ));
    }
    Ok(keys
        .iter()
        .map(|key| (key.column.clone(), value_to_bson(&key.column, &key.value)))
        .collect())
}

struct DocumentUpdate<'a> {
    target: &'a TableUpdate,
    filter: Document,
    value: Bson,
}

impl DocumentUpdate<'_> {
    /// Finds the document by its post-update key when the edit touched a key field.
    fn snapshot_filter(&self) -> Document {
        let mut filter = self.filter.clone();
        if filter.contains_key(&self.target.column) {
            filter.insert(self.target.column.clone(), self.value.clone());
        }
        filter
    }
}

/// A change set with every value coerced and converted, keys validated
struct DocumentPlan<'a> {
    inserts: Vec<(&'a TableInsert, Vec<Document>)>,
    updates: Vec<DocumentUpdate<'a>>,
    deletes: Vec<(&'a TableDelete, Document)>,
}

fn compile_document_changes<F>(changes: &TableChangeSet, coerce: F) -> EngineResult<DocumentPlan<'_>>
where
    F: Fn(Value, Option<&str>) -> Value,
{
    let coerced_filter = |keys: &[KeyValue]| {
        let keys: Vec<KeyValue> = keys
            .iter()
            .map(|key| KeyValue {
                column: key.column.clone(),
                value: coerce(key.value.clone(), None),
            })
            .collect();
        key_filter(&keys)
    };

    let inserts = changes
        .inserts
        .iter()
        .map(|insert| {
            let documents = insert
                .rows
                .iter()
                .map(|row| {
                    row.columns
                        .iter()
                        .map(|(column, value)| (column.clone(), value_to_bson(column, &coerce(value.clone(), None))))
                        .collect::<Document>()
                })
                .collect();
            (insert, documents)
        })
        .collect();
    let updates = changes
        .updates
        .iter()
        .map(|update| {
            let value = coerce(update.value.clone(), update.column_type.as_deref());
            Ok::<_, EngineError>(DocumentUpdate {
                target: update,
                filter: coerced_filter(&update.primary_keys)?,
                value: value_to_bson(&update.column, &value),
            })
        })
        .collect::<EngineResult<Vec<_>>>()?;
    let deletes = changes
        .deletes
        .iter()
        .map(|delete| coerced_filter(&delete.primary_keys).map(|filter| (delete, filter)))
        .collect::<EngineResult<Vec<_>>>()?;

    Ok(DocumentPlan {
        inserts,
        updates,
        deletes,
    })
}

fn filter_clause(filter: &TableFilter) -> EngineResult<Document> {
    let value = value_to_bson(&filter.column, &filter.value);
    let condition = match filter.operator {
        FilterOperator::Equals => value,
        FilterOperator::NotEquals => Bson::Document(doc! { "$ne": value }),
        FilterOperator::GreaterThan => Bson::Document(doc! { "$gt": value }),
        FilterOperator::GreaterOrEqual => Bson::Document(doc! { "$gte": value }),
        FilterOperator::LessThan => Bson::Document(doc! { "$lt": value }),
        FilterOperator::LessOrEqual => Bson::Document(doc! { "$lte": value }),
        FilterOperator::In => match value {
            Bson::Array(_) => Bson::Document(doc! { "$in": value }),
            other => Bson::Document(doc! { "$in": [other] }),
        },
        FilterOperator::IsNull => Bson::Null,
        FilterOperator::IsNotNull => Bson::Document(doc! { "$ne": Bson::Null }),
        FilterOperator::Like | FilterOperator::ILike => {
            return Err(EngineError::not_supported(
                "LIKE filters are not supported by MongoDB",
            ))
        }
    };
    let mut clause = Document::new();
    clause.insert(filter.column.clone(), condition);
    Ok(clause)
}

/// Translates table filters into one query document
fn filters_to_document(filters: &[TableFilter]) -> EngineResult<Document> {
    let mut clauses = filters.iter().map(filter_clause).collect::<EngineResult<Vec<_>>>()?;
    Ok(match clauses.len() {
        0 => Document::new(),
        1 => clauses.remove(0),
        _ => doc! { "$and": clauses },
    })
}

fn select_find_options(options: &SelectOptions) -> FindOptions {
    let mut find = FindOptions::default();
    if !options.order_by.is_empty() {
        find.sort = Some(
            options
                .order_by
                .iter()
                .map(|order| {
                    let direction = match order.direction {
                        SortDirection::Asc => 1,
                        SortDirection::Desc => -1,
                    };
                    (order.column.clone(), Bson::Int32(direction))
                })
                .collect(),
        );
    }
    if options.offset > 0 {
        find.skip = Some(options.offset);
    }
    find.limit = options.limit.map(|limit| limit as i64);
    find
}

impl MongoAdapter {
    pub fn new(config: ConnectionConfig, ctx: ConnectContext) -> Self {
        let credentials = CredentialHandle::new(ctx.credentials.clone(), config.clone());
        Self {
            config,
            ctx,
            lifecycle: LifecycleCell::new(),
            credentials,
            inner: RwLock::new(None),
        }
    }

    fn client_options(&self, host: &str, port: u16, username: &str, password: &str, tunnelled: bool) -> ClientOptions {
        let mut options = ClientOptions::default();
        options.hosts = vec![ServerAddress::Tcp {
            host: host.to_string(),
            port: Some(port),
        }];
        options.app_name = self.config.options.get("application_name").cloned();
        options.server_selection_timeout = Some(Duration::from_secs(10));
        options.connect_timeout = Some(Duration::from_secs(10));
        if tunnelled {
            // Topology discovery would bypass the forwarded port
            options.direct_connection = Some(true);
        }
        if self.config.ssl {
            options.tls = Some(Tls::Enabled(TlsOptions::default()));
        }
        if !username.is_empty() {
            let mut credential = Credential::default();
            credential.username = Some(username.to_string());
            credential.password = Some(password.to_string());
            credential.source = Some(
                self.config
                    .options
                    .get("auth_source")
                    .cloned()
                    .unwrap_or_else(|| "admin".to_string()),
            );
            options.credential = Some(credential);
        }
        options
    }

    /// Client handle, rebuilt when the credential provider issued new secrets.
    async fn client(&self) -> EngineResult<Client> {
        if let Some((username, password)) = self.credentials.refreshed().await? {
            let mut inner = self.inner.write().await;
            let state = inner.as_mut().ok_or(EngineError::NotConnected)?;
            let options = self.client_options(&state.host, state.port, &username, &password, state.tunnel.is_some());
            tracing::debug!(host = %state.host, "Rotating MongoDB client credentials");
            state.client = Client::with_options(options)?;
            return Ok(state.client.clone());
        }

        self.inner
            .read()
            .await
            .as_ref()
            .map(|state| state.client.clone())
            .ok_or(EngineError::NotConnected)
    }

    fn database_name<'a>(&'a self, requested: Option<&'a str>) -> EngineResult<&'a str> {
        requested
            .or(self.config.database.as_deref())
            .ok_or_else(|| EngineError::syntax_error("Missing 'database' field"))
    }

    async fn collection(&self, database: Option<&str>, name: &str) -> EngineResult<Collection<Document>> {
        let client = self.client().await?;
        Ok(client.database(self.database_name(database)?).collection::<Document>(name))
    }

    async fn list_by_type(&self, schema: Option<&str>, wanted: EntityType) -> EngineResult<Vec<TableOrView>> {
        let client = self.client().await?;
        let database = self.database_name(schema)?;
        let specs: Vec<_> = client.database(database).list_collections().await?.try_collect().await?;

        let mut result: Vec<TableOrView> = specs
            .into_iter()
            .filter_map(|spec| {
                let entity_type = match spec.collection_type {
                    CollectionType::View => EntityType::View,
                    _ => EntityType::Collection,
                };
                (entity_type == wanted && !spec.name.starts_with("system.")).then(|| TableOrView {
                    schema: Some(database.to_string()),
                    name: spec.name,
                    entity_type,
                })
            })
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn run_command(&self, command: DocumentCommand) -> EngineResult<QueryResult> {
        let started = Instant::now();
        let client = self.client().await?;
        let db = client.database(self.database_name(command.database.as_deref())?);
        let operation = command.operation.to_ascii_lowercase();

        if operation == "drop_database" {
            db.drop().await?;
            return Ok(acknowledged(started));
        }

        let name = command.collection_name()?;
        if operation == "create_collection" {
            db.create_collection(name).await?;
            return Ok(acknowledged(started));
        }

        let collection = db.collection::<Document>(name);
        let result = match operation.as_str() {
            "find" => {
                let options = command.find_options(Some(DEFAULT_FIND_LIMIT))?;
                let documents: Vec<Document> = collection
                    .find(command.filter()?)
                    .with_options(options)
                    .await?
                    .try_collect()
                    .await?;
                documents_result(&documents, started)
            }
            "find_one" => {
                let document = collection.find_one(command.filter()?).await?;
                documents_result(document.as_slice(), started)
            }
            "aggregate" => {
                let documents: Vec<Document> =
                    collection.aggregate(command.pipeline()?).await?.try_collect().await?;
                documents_result(&documents, started)
            }
            "count" | "count_documents" => {
                let count = collection.count_documents(command.filter()?).await?;
                scalar_result("count", vec![Value::Int(count as i64)], started)
            }
            "distinct" => {
                let field = command
                    .field
                    .as_deref()
                    .ok_or_else(|| EngineError::syntax_error("Missing 'field' field"))?;
                let values = collection.distinct(field, command.filter()?).await?;
                scalar_result(field, values.iter().map(bson_to_value).collect(), started)
            }
            "insert_one" => {
                collection
                    .insert_one(DocumentCommand::required(&command.document, "document")?)
                    .await?;
                QueryResult::with_affected_rows(1, elapsed_ms(started))
            }
            "insert_many" => {
                let documents = command
                    .documents
                    .iter()
                    .cloned()
                    .map(json_to_document)
                    .collect::<EngineResult<Vec<_>>>()?;
                let inserted = collection.insert_many(documents).await?;
                QueryResult::with_affected_rows(inserted.inserted_ids.len() as u64, elapsed_ms(started))
            }
            "update_one" | "update_many" => {
                let update = DocumentCommand::required(&command.update, "update")?;
                let outcome = if operation == "update_one" {
                    collection.update_one(command.filter()?, update).await?
                } else {
                    collection.update_many(command.filter()?, update).await?
                };
                QueryResult::with_affected_rows(outcome.modified_count, elapsed_ms(started))
            }
            "replace_one" => {
                let replacement = DocumentCommand::required(&command.replacement, "replacement")?;
                let outcome = collection.replace_one(command.filter()?, replacement).await?;
                QueryResult::with_affected_rows(outcome.modified_count, elapsed_ms(started))
            }
            "delete_one" => {
                let outcome = collection.delete_one(command.filter()?).await?;
                QueryResult::with_affected_rows(outcome.deleted_count, elapsed_ms(started))
            }
            "delete_many" => {
                let outcome = collection.delete_many(command.filter()?).await?;
                QueryResult::with_affected_rows(outcome.deleted_count, elapsed_ms(started))
            }
            "create_index" => {
                let mut index_options = IndexOptions::default();
                index_options.name = command.name.clone();
                index_options.unique = command.unique;
                let model = IndexModel::builder()
                    .keys(DocumentCommand::required(&command.keys, "keys")?)
                    .options(index_options)
                    .build();
                collection.create_index(model).await?;
                acknowledged(started)
            }
            "drop_index" => {
                let index = command
                    .name
                    .as_deref()
                    .ok_or_else(|| EngineError::syntax_error("Missing 'name' field"))?;
                collection.drop_index(index).await?;
                acknowledged(started)
            }
            "drop_collection" => {
                collection.drop().await?;
                acknowledged(started)
            }
            other => {
                return Err(EngineError::syntax_error(format!(
                    "Unsupported operation: {}",
                    other
                )))
            }
        };
        Ok(result)
    }
}

#[async_trait]
impl ClientAdapter for MongoAdapter {
    fn driver_id(&self) -> &'static str {
        "mongodb"
    }

    fn driver_name(&self) -> &'static str {
        "MongoDB"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::MONGODB
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

        let connected = async {
            let (username, password) = self.credentials.resolve().await?;
            let options = self.client_options(&host, port, &username, &password, tunnel.is_some());
            let client = Client::with_options(options).map_err(|e| EngineError::connection_failed(e.to_string()))?;
            // The driver connects lazily; ping to surface bad hosts and credentials now
            client
                .database("admin")
                .run_command(doc! { "ping": 1 })
                .await
                .map_err(|e| EngineError::from_connect(e.to_string()))?;
            Ok::<_, EngineError>(client)
        }
        .await;

        let client = match connected {
            Ok(client) => client,
            Err(e) => {
                if let Some(tunnel) = tunnel {
                    tunnel.release().await;
                }
                return Err(e);
            }
        };

        *self.inner.write().await = Some(MongoState {
            client,
            tunnel,
            host,
            port,
        });
        guard.complete();
        tracing::info!("MongoDB connection established");
        Ok(())
    }

    async fn disconnect(&self) -> EngineResult<()> {
        let state = self.inner.write().await.take();
        if let Some(state) = state {
            state.client.shutdown().await;
            if let Some(tunnel) = state.tunnel {
                tunnel.release().await;
            }
        }
        self.lifecycle.set_disconnected();
        Ok(())
    }

    async fn ping(&self) -> EngineResult<()> {
        let client = self.client().await?;
        client.database("admin").run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    async fn list_databases(&self) -> EngineResult<Vec<String>> {
        let client = self.client().await?;
        let mut databases: Vec<String> = client
            .list_database_names()
            .await?
            .into_iter()
            .filter(|db| !SYSTEM_DATABASES.contains(&db.as_str()))
            .collect();
        databases.sort();
        Ok(databases)
    }

    async fn list_tables(&self, schema: Option<&str>) -> EngineResult<Vec<TableOrView>> {
        self.list_by_type(schema, EntityType::Collection).await
    }

    async fn list_views(&self, schema: Option<&str>) -> EngineResult<Vec<TableOrView>> {
        self.list_by_type(schema, EntityType::View).await
    }

    /// Fields inferred from a sample of documents, `_id` first.
    async fn list_table_columns(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableColumn>> {
        let collection = self.collection(schema, table).await?;
        let documents: Vec<Document> = collection
            .find(doc! {})
            .limit(SCHEMA_SAMPLE_SIZE)
            .await?
            .try_collect()
            .await?;

        let mut fields: HashMap<String, String> = HashMap::new();
        for document in &documents {
            for (key, value) in document {
                fields
                    .entry(key.clone())
                    .or_insert_with(|| bson_type_name(value).to_string());
            }
        }

        let mut names: Vec<String> = fields.keys().cloned().collect();
        names.sort_by(|a, b| match (a == "_id", b == "_id") {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.cmp(b),
        });

        Ok(names
            .into_iter()
            .enumerate()
            .map(|(i, name)| TableColumn {
                data_type: fields.get(&name).cloned().unwrap_or_else(|| "mixed".to_string()),
                nullable: true,
                default_value: None,
                is_primary_key: name == "_id",
                ordinal_position: i as u32 + 1,
                name,
            })
            .collect())
    }

    async fn get_primary_keys(&self, _table: &str, _schema: Option<&str>) -> EngineResult<Vec<String>> {
        Ok(vec!["_id".to_string()])
    }

    async fn list_table_indexes(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableIndex>> {
        let collection = self.collection(schema, table).await?;
        let models: Vec<IndexModel> = collection.list_indexes().await?.try_collect().await?;

        Ok(models
            .into_iter()
            .map(|model| {
                let name = model
                    .options
                    .as_ref()
                    .and_then(|o| o.name.clone())
                    .unwrap_or_default();
                TableIndex {
                    columns: model.keys.keys().cloned().collect(),
                    table: table.to_string(),
                    schema: schema.map(str::to_string),
                    unique: model.options.as_ref().and_then(|o| o.unique).unwrap_or(false) || name == "_id_",
                    primary: name == "_id_",
                    name,
                }
            })
            .collect())
    }

    async fn execute_query(&self, query: &str, _query_id: QueryId, _mode: ResultMode) -> EngineResult<Vec<QueryResult>> {
        let command = DocumentCommand::parse(query)?;
        Ok(vec![self.run_command(command).await?])
    }

    async fn select_top(&self, table: &str, schema: Option<&str>, options: &SelectOptions) -> EngineResult<QueryResult> {
        let started = Instant::now();
        let collection = self.collection(schema, table).await?;
        let documents: Vec<Document> = collection
            .find(filters_to_document(&options.filters)?)
            .with_options(select_find_options(options))
            .await?
            .try_collect()
            .await?;
        Ok(documents_result(&documents, started))
    }

    async fn select_top_stream(
        &self,
        table: &str,
        schema: Option<&str>,
        options: &SelectOptions,
        chunk_size: usize,
    ) -> EngineResult<Box<dyn StreamingCursor>> {
        let source = MongoCursorSource {
            collection: self.collection(schema, table).await?,
            request: CursorRequest::Find {
                filter: filters_to_document(&options.filters)?,
                options: select_find_options(options),
            },
            batch_size: chunk_size as u32,
            cursor: None,
            columns: Vec::new(),
        };
        Ok(Box::new(PagedCursor::new(source, chunk_size)))
    }

    /// Streams `find` and `aggregate` commands; other operations are not
    /// cursor-backed.
    async fn query_stream(&self, query: &str, chunk_size: usize) -> EngineResult<Box<dyn StreamingCursor>> {
        let command = DocumentCommand::parse(query)?;
        let request = match command.operation.to_ascii_lowercase().as_str() {
            "find" => CursorRequest::Find {
                filter: command.filter()?,
                options: command.find_options(None)?,
            },
            "aggregate" => CursorRequest::Aggregate {
                pipeline: command.pipeline()?,
            },
            other => {
                return Err(EngineError::not_supported(format!(
                    "Streaming is not supported for '{}'",
                    other
                )))
            }
        };
        let source = MongoCursorSource {
            collection: self
                .collection(command.database.as_deref(), command.collection_name()?)
                .await?,
            request,
            batch_size: chunk_size as u32,
            cursor: None,
            columns: Vec::new(),
        };
        Ok(Box::new(PagedCursor::new(source, chunk_size)))
    }

    async fn drop_element(&self, kind: ElementKind, schema: Option<&str>, name: &str) -> EngineResult<()> {
        let client = self.client().await?;
        match kind {
            ElementKind::Table | ElementKind::View => {
                client
                    .database(self.database_name(schema)?)
                    .collection::<Document>(name)
                    .drop()
                    .await?
            }
            ElementKind::Database => client.database(name).drop().await?,
            ElementKind::Schema | ElementKind::MaterializedView => {
                return Err(EngineError::not_supported(format!(
                    "Dropping a {} is not supported by MongoDB",
                    kind.sql_keyword().to_ascii_lowercase()
                )))
            }
        }
        Ok(())
    }

    async fn truncate_element(&self, table: &str, schema: Option<&str>) -> EngineResult<()> {
        self.collection(schema, table).await?.delete_many(doc! {}).await?;
        Ok(())
    }

    async fn duplicate_table(&self, table: &str, schema: Option<&str>, new_name: &str) -> EngineResult<()> {
        let collection = self.collection(schema, table).await?;
        // $out writes the copy; the returned cursor is empty
        collection
            .aggregate(vec![doc! { "$match": {} }, doc! { "$out": new_name }])
            .await?;
        Ok(())
    }

    /// Applies the set operation by operation. Nothing is rolled back, so a
    /// failure after the first applied operation reports how far it got.
    async fn apply_changes(&self, changes: &TableChangeSet) -> EngineResult<Vec<QueryResult>> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        // Validate every key before touching data
        let DocumentPlan {
            inserts,
            updates,
            deletes,
        } = compile_document_changes(changes, |value, column_type| self.coerce_value(value, column_type))?;

        let total = changes.operation_count();
        let mut applied = 0usize;

        let outcome: EngineResult<()> = async {
            for (insert, documents) in inserts {
                let collection = self.collection(insert.schema.as_deref(), &insert.table).await?;
                for document in documents {
                    collection.insert_one(document).await?;
                    applied += 1;
                }
            }
            for update in &updates {
                let collection = self
                    .collection(update.target.schema.as_deref(), &update.target.table)
                    .await?;
                let mut set = Document::new();
                set.insert(update.target.column.clone(), update.value.clone());
                collection.update_one(update.filter.clone(), doc! { "$set": set }).await?;
                applied += 1;
            }
            for (delete, filter) in deletes {
                let collection = self.collection(delete.schema.as_deref(), &delete.table).await?;
                collection.delete_one(filter).await?;
                applied += 1;
            }
            Ok(())
        }
        .await;

        if let Err(e) = outcome {
            tracing::warn!(applied, total, "Change set failed part way: {}", e);
            if applied == 0 {
                return Err(e);
            }
            return Err(EngineError::PartialFailure {
                applied,
                total,
                message: e.to_string(),
            });
        }

        let mut snapshots = Vec::with_capacity(updates.len());
        for update in &updates {
            let started = Instant::now();
            let collection = self
                .collection(update.target.schema.as_deref(), &update.target.table)
                .await?;
            let document = collection.find_one(update.snapshot_filter()).await?;
            snapshots.push(documents_result(document.as_slice(), started));
        }
        Ok(snapshots)
    }
}

enum CursorRequest {
    Find { filter: Document, options: FindOptions },
    Aggregate { pipeline: Vec<Document> },
}

/// Native driver cursor read in chunks
///
/// Columns are fixed by the first chunk; fields that first appear in a
/// later chunk are not reported.
struct MongoCursorSource {
    collection: Collection<Document>,
    request: CursorRequest,
    batch_size: u32,
    cursor: Option<Cursor<Document>>,
    columns: Vec<ColumnInfo>,
}

#[async_trait]
impl PageSource for MongoCursorSource {
    async fn prepare(&mut self) -> EngineResult<()> {
        let cursor = match &self.request {
            CursorRequest::Find { filter, options } => {
                let mut options = options.clone();
                options.batch_size = Some(self.batch_size);
                self.collection.find(filter.clone()).with_options(options).await?
            }
            CursorRequest::Aggregate { pipeline } => {
                self.collection
                    .aggregate(pipeline.clone())
                    .batch_size(self.batch_size)
                    .await?
            }
        };
        self.cursor = Some(cursor);
        Ok(())
    }

    async fn fetch(&mut self, _offset: u64, limit: usize) -> EngineResult<QueryResult> {
        let started = Instant::now();
        let cursor = self
            .cursor
            .as_mut()
            .ok_or_else(|| EngineError::internal("Cursor used before it was opened"))?;

        let mut documents = Vec::with_capacity(limit);
        while documents.len() < limit {
            match cursor.try_next().await? {
                Some(document) => documents.push(document),
                None => break,
            }
        }

        if self.columns.is_empty() {
            self.columns = document_columns(&documents);
        }
        let rows = documents.iter().map(|d| document_to_row(d, &self.columns)).collect();
        Ok(QueryResult::with_rows(self.columns.clone(), rows, elapsed_ms(started)))
    }

    async fn release(&mut self) -> EngineResult<()> {
        // Dropping the cursor kills it server-side
        self.cursor = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{OrderBy, RowData};

    fn adapter() -> MongoAdapter {
        let mut config = ConnectionConfig::new("mongodb", "db.internal", 27017);
        config.database = Some("app".into());
        MongoAdapter::new(config, ConnectContext::default())
    }

    #[test]
    fn commands_default_to_find_on_the_configured_database() {
        let command = DocumentCommand::parse(r#"{"collection": "users", "query": {"age": 30}}"#).expect("parse");
        assert_eq!(command.operation, "find");
        assert_eq!(command.collection_name().expect("collection"), "users");
        let filter = command.filter().expect("filter");
        assert!(matches!(filter.get("age"), Some(Bson::Int32(30)) | Some(Bson::Int64(30))));
        assert_eq!(adapter().database_name(command.database.as_deref()).expect("db"), "app");

        let short = DocumentCommand::parse("shop.orders").expect("short form");
        assert_eq!(short.database.as_deref(), Some("shop"));
        assert_eq!(short.collection.as_deref(), Some("orders"));

        assert!(matches!(
            DocumentCommand::parse("orders"),
            Err(EngineError::SyntaxError { .. })
        ));
    }

    #[test]
    fn extended_json_object_ids_are_parsed() {
        let command = DocumentCommand::parse(
            r#"{"collection": "users", "filter": {"_id": {"$oid": "507f1f77bcf86cd799439011"}}}"#,
        )
        .expect("parse");
        let filter = command.filter().expect("filter");
        assert!(matches!(filter.get("_id"), Some(Bson::ObjectId(_))));
    }

    #[test]
    fn key_values_match_object_ids() {
        let keys = vec![KeyValue::new("_id", "507f1f77bcf86cd799439011")];
        let filter = key_filter(&keys).expect("filter");
        assert!(matches!(filter.get("_id"), Some(Bson::ObjectId(_))));

        let filter = key_filter(&[KeyValue::new("_id", "user-1")]).expect("filter");
        assert_eq!(filter.get("_id"), Some(&Bson::String("user-1".into())));

        assert!(key_filter(&[]).is_err());
    }

    #[test]
    fn change_values_pass_through_coercion() {
        let changes = TableChangeSet {
            inserts: vec![TableInsert {
                table: "users".into(),
                schema: None,
                rows: vec![RowData::new().with_column("name", "Terry")],
            }],
            updates: vec![TableUpdate {
                table: "users".into(),
                schema: None,
                column: "_id".into(),
                value: "user-2".into(),
                column_type: Some("string".into()),
                primary_keys: vec![KeyValue::new("_id", "user-1")],
            }],
            deletes: vec![TableDelete {
                table: "users".into(),
                schema: None,
                primary_keys: vec![KeyValue::new("_id", "user-3")],
            }],
        };
        let upper = |value: Value, _: Option<&str>| match value {
            Value::Text(s) => Value::Text(s.to_uppercase()),
            other => other,
        };

        let plan = compile_document_changes(&changes, upper).expect("compile");
        assert_eq!(plan.inserts[0].1, vec![doc! { "name": "TERRY" }]);
        assert_eq!(plan.updates[0].filter, doc! { "_id": "USER-1" });
        assert_eq!(plan.updates[0].value, Bson::String("USER-2".into()));
        assert_eq!(plan.updates[0].snapshot_filter(), doc! { "_id": "USER-2" });
        assert_eq!(plan.deletes[0].1, doc! { "_id": "USER-3" });
    }

    #[test]
    fn change_sets_without_keys_are_refused_up_front() {
        let changes = TableChangeSet {
            deletes: vec![TableDelete {
                table: "users".into(),
                schema: None,
                primary_keys: Vec::new(),
            }],
            ..Default::default()
        };
        assert!(compile_document_changes(&changes, |value, _| value).is_err());
    }

    #[test]
    fn filters_become_one_query_document() {
        let filters = vec![
            TableFilter {
                column: "age".into(),
                operator: FilterOperator::GreaterOrEqual,
                value: Value::Int(18),
            },
            TableFilter {
                column: "email".into(),
                operator: FilterOperator::IsNotNull,
                value: Value::Null,
            },
        ];
        assert_eq!(
            filters_to_document(&filters).expect("filters"),
            doc! { "$and": [ { "age": { "$gte": 18i64 } }, { "email": { "$ne": Bson::Null } } ] }
        );

        let like = vec![TableFilter {
            column: "name".into(),
            operator: FilterOperator::Like,
            value: Value::Text("a%".into()),
        }];
        assert!(matches!(
            filters_to_document(&like),
            Err(EngineError::NotSupported { .. })
        ));
    }

    #[test]
    fn select_options_map_to_find_options() {
        let options = SelectOptions {
            offset: 20,
            limit: Some(10),
            order_by: vec![OrderBy::desc("created_at")],
            filters: Vec::new(),
        };
        let find = select_find_options(&options);
        assert_eq!(find.skip, Some(20));
        assert_eq!(find.limit, Some(10));
        assert_eq!(find.sort, Some(doc! { "created_at": -1 }));
    }

    #[test]
    fn rows_are_projected_onto_the_union_of_fields() {
        let documents = vec![doc! { "_id": 1, "name": "Terry" }, doc! { "_id": 2, "email": "t@example.com" }];
        let columns = document_columns(&documents);
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["_id", "name", "email"]);

        let row = document_to_row(&documents[1], &columns);
        assert_eq!(row.values, vec![Value::Int(2), Value::Null, Value::Text("t@example.com".into())]);
    }

    #[test]
    fn client_options_follow_config() {
        let mut adapter = adapter();
        adapter.config.ssl = true;
        adapter.config.options.insert("auth_source".into(), "app".into());

        let options = adapter.client_options("127.0.0.1", 40000, "terry", "s3cret", true);
        assert_eq!(options.direct_connection, Some(true));
        assert!(matches!(options.tls, Some(Tls::Enabled(_))));
        let credential = options.credential.expect("credential");
        assert_eq!(credential.source.as_deref(), Some("app"));

        let anonymous = adapter.client_options("db.internal", 27017, "", "", false);
        assert!(anonymous.credential.is_none());
        assert_eq!(anonymous.direct_connection, None);
    }

    #[tokio::test]
    async fn operations_require_a_connection() {
        let adapter = adapter();
        let err = adapter.list_tables(None).await.expect_err("not connected");
        assert!(matches!(err, EngineError::NotConnected));

        let err = adapter.reserve_connection().await.err().expect("no sessions");
        assert!(matches!(err, EngineError::NotSupported { .. }));
    }
}
