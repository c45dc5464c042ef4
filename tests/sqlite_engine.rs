//! End-to-end requests against a SQLite file through the engine host.

use std::sync::Arc;

use tempfile::TempDir;
use unidb::commands::{CursorSource, EngineClient, Listing, Request, Response};
use unidb::engine::pipeline::QueryOptions;
use unidb::engine::types::{
    ConnectionConfig, ConnectionId, KeyValue, QueryResult, RowData, SelectOptions, SessionId, TableChangeSet,
    TableDelete, TableInsert, TableUpdate, Value,
};
use unidb::engine::ErrorKind;
use unidb::{Engine, EngineSettings};

struct Harness {
    _dir: TempDir,
    client: EngineClient,
    config: ConnectionConfig,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = ConnectionConfig::new("sqlite", "", 0);
    config.database = Some(dir.path().join("app.db").to_string_lossy().into_owned());

    let engine = Arc::new(Engine::new(EngineSettings::default()).await);
    Harness {
        _dir: dir,
        client: engine.spawn_host().await,
        config,
    }
}

impl Harness {
    async fn connect(&self, read_only: bool) -> ConnectionId {
        let mut config = self.config.clone();
        config.read_only = read_only;
        match self.client.call(Request::Connect { config }).await {
            Response::Connected(id) => id,
            other => panic!("connect failed: {:?}", other),
        }
    }

    async fn execute(&self, connection_id: ConnectionId, query: &str, options: QueryOptions) -> Response {
        self.client
            .call(Request::Execute {
                connection_id,
                query: query.into(),
                options,
                multiple: false,
            })
            .await
    }

    async fn select(&self, connection_id: ConnectionId, query: &str) -> QueryResult {
        match self.execute(connection_id, query, QueryOptions::default()).await {
            Response::Result(result) => result,
            other => panic!("query failed: {:?}", other),
        }
    }

    async fn ok(&self, request: Request) {
        let response = self.client.call(request).await;
        assert!(matches!(response, Response::Ok), "unexpected response: {:?}", response);
    }
}

async fn with_people(h: &Harness) -> ConnectionId {
    let id = h.connect(false).await;
    let response = h
        .client
        .call(Request::Execute {
            connection_id: id,
            query: "CREATE TABLE people (id INTEGER PRIMARY KEY, firstName TEXT NOT NULL, lastName TEXT, active BOOLEAN);".into(),
            options: QueryOptions::default(),
            multiple: true,
        })
        .await;
    assert!(!response.is_error(), "{:?}", response);
    id
}

fn insert(first_name: &str, id: i64) -> TableInsert {
    TableInsert {
        table: "people".into(),
        schema: None,
        rows: vec![RowData::new()
            .with_column("id", id)
            .with_column("firstName", first_name)
            .with_column("lastName", "Tester")
            .with_column("active", true)],
    }
}

#[tokio::test]
async fn change_sets_round_trip() {
    let h = harness().await;
    let id = with_people(&h).await;

    let changes = TableChangeSet {
        inserts: vec![insert("Terry", 1)],
        ..Default::default()
    };
    let response = h
        .client
        .call(Request::ApplyChanges {
            connection_id: id,
            changes,
            allow_writes: false,
        })
        .await;
    assert!(!response.is_error(), "{:?}", response);

    let row = h.select(id, "SELECT id, firstName, lastName FROM people").await;
    assert_eq!(row.row_count, 1);
    assert_eq!(row.value(0, "id"), Some(&Value::Int(1)));
    assert_eq!(row.value(0, "firstName"), Some(&Value::Text("Terry".into())));
    assert_eq!(row.value(0, "lastName"), Some(&Value::Text("Tester".into())));

    let changes = TableChangeSet {
        updates: vec![TableUpdate {
            table: "people".into(),
            schema: None,
            column: "lastName".into(),
            value: Value::Text("Tested".into()),
            column_type: Some("TEXT".into()),
            primary_keys: vec![KeyValue::new("id", 1)],
        }],
        ..Default::default()
    };
    let Response::Results(snapshots) = h
        .client
        .call(Request::ApplyChanges {
            connection_id: id,
            changes,
            allow_writes: false,
        })
        .await
    else {
        panic!("expected snapshots");
    };
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].value(0, "lastName"), Some(&Value::Text("Tested".into())));
    assert_eq!(snapshots[0].value(0, "active"), Some(&Value::Bool(true)));

    let changes = TableChangeSet {
        deletes: vec![TableDelete {
            table: "people".into(),
            schema: None,
            primary_keys: vec![KeyValue::new("id", 1)],
        }],
        ..Default::default()
    };
    let response = h
        .client
        .call(Request::ApplyChanges {
            connection_id: id,
            changes,
            allow_writes: false,
        })
        .await;
    assert!(!response.is_error(), "{:?}", response);
    assert_eq!(h.select(id, "SELECT * FROM people").await.row_count, 0);
}

#[tokio::test]
async fn failing_change_sets_leave_no_trace() {
    let h = harness().await;
    let id = with_people(&h).await;

    // The second insert reuses the primary key
    let changes = TableChangeSet {
        inserts: vec![insert("First", 1), insert("Duplicate", 1)],
        ..Default::default()
    };
    let response = h
        .client
        .call(Request::ApplyChanges {
            connection_id: id,
            changes,
            allow_writes: false,
        })
        .await;
    assert!(response.is_error());
    assert_eq!(h.select(id, "SELECT * FROM people").await.row_count, 0);
}

#[tokio::test]
async fn cursors_hand_out_chunks_until_exhausted() {
    let h = harness().await;
    let id = with_people(&h).await;
    let mut changes = TableChangeSet::default();
    for n in 1..=6 {
        changes.inserts.push(insert(&format!("person {}", n), n));
    }
    let response = h
        .client
        .call(Request::ApplyChanges {
            connection_id: id,
            changes,
            allow_writes: false,
        })
        .await;
    assert!(!response.is_error(), "{:?}", response);

    let source = CursorSource::Table {
        table: "people".into(),
        schema: None,
        options: SelectOptions::default(),
    };
    let Response::CursorOpened { cursor_id, .. } = h
        .client
        .call(Request::OpenCursor {
            connection_id: id,
            source,
            chunk_size: Some(5),
        })
        .await
    else {
        panic!("expected an opened cursor");
    };

    let mut sizes = Vec::new();
    for _ in 0..3 {
        match h.client.call(Request::ReadCursor { cursor_id }).await {
            Response::Chunk(chunk) => {
                assert_eq!(chunk.columns.len(), 4);
                sizes.push(chunk.rows.len());
            }
            other => panic!("read failed: {:?}", other),
        }
    }
    assert_eq!(sizes, vec![5, 1, 0]);

    h.ok(Request::CloseCursor { cursor_id }).await;
    assert!(h.client.call(Request::ReadCursor { cursor_id }).await.is_error());
}

#[tokio::test]
async fn sessions_outlive_their_transactions() {
    let h = harness().await;
    let id = with_people(&h).await;
    let tab = SessionId::new("tab-1");
    let in_session = || QueryOptions {
        session: Some(tab.clone()),
        ..Default::default()
    };

    h.ok(Request::ReserveSession {
        connection_id: id,
        session_id: tab.clone(),
    })
    .await;
    h.ok(Request::BeginTransaction {
        connection_id: id,
        session_id: tab.clone(),
    })
    .await;
    let response = h
        .execute(id, "INSERT INTO people (id, firstName) VALUES (1, 'Committed')", in_session())
        .await;
    assert!(!response.is_error(), "{:?}", response);
    h.ok(Request::CommitTransaction {
        connection_id: id,
        session_id: tab.clone(),
    })
    .await;

    // Still reserved: a second transaction starts on the same session
    h.ok(Request::BeginTransaction {
        connection_id: id,
        session_id: tab.clone(),
    })
    .await;
    let response = h
        .execute(id, "INSERT INTO people (id, firstName) VALUES (2, 'Rolled back')", in_session())
        .await;
    assert!(!response.is_error(), "{:?}", response);
    h.ok(Request::RollbackTransaction {
        connection_id: id,
        session_id: tab.clone(),
    })
    .await;

    let rows = h.select(id, "SELECT firstName FROM people").await;
    assert_eq!(rows.row_count, 1);
    assert_eq!(rows.value(0, "firstName"), Some(&Value::Text("Committed".into())));

    let response = h
        .client
        .call(Request::CommitTransaction {
            connection_id: id,
            session_id: tab.clone(),
        })
        .await;
    assert!(matches!(
        response,
        Response::Error {
            kind: ErrorKind::TransactionError,
            ..
        }
    ));
    h.ok(Request::ReleaseSession {
        connection_id: id,
        session_id: tab,
    })
    .await;
}

#[tokio::test]
async fn sqlite_has_no_schemas_or_routines() {
    let h = harness().await;
    let id = with_people(&h).await;

    for listing in [Listing::Schemas, Listing::Routines] {
        let response = h
            .client
            .call(Request::Describe {
                connection_id: id,
                listing,
                schema: None,
                table: None,
            })
            .await;
        match response {
            Response::Names(names) => assert!(names.is_empty()),
            Response::Routines(routines) => assert!(routines.is_empty()),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    let Response::Triggers(triggers) = h
        .client
        .call(Request::Describe {
            connection_id: id,
            listing: Listing::TableTriggers,
            schema: None,
            table: Some("people".into()),
        })
        .await
    else {
        panic!("expected triggers");
    };
    assert!(triggers.is_empty());
}

#[tokio::test]
async fn read_only_connections_refuse_writes() {
    let h = harness().await;
    let writer = with_people(&h).await;
    let reader = h.connect(true).await;

    let response = h
        .execute(reader, "DELETE FROM people", QueryOptions::default())
        .await;
    assert!(matches!(
        response,
        Response::Error {
            kind: ErrorKind::ReadOnlyViolation,
            ..
        }
    ));

    let changes = TableChangeSet {
        inserts: vec![insert("Nope", 9)],
        ..Default::default()
    };
    let response = h
        .client
        .call(Request::ApplyChanges {
            connection_id: reader,
            changes,
            allow_writes: false,
        })
        .await;
    assert!(response.is_error());

    // Reads still work and see the writer's table
    assert_eq!(h.select(reader, "SELECT * FROM people").await.row_count, 0);
    h.ok(Request::Disconnect { connection_id: writer }).await;
    h.ok(Request::Disconnect { connection_id: reader }).await;
}
