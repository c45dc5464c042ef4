//! Mutation requests
//!
//! Change sets and structural operations. Both go through the connection's
//! pipeline so read-only and production gating match plain queries.

use tracing::instrument;

use crate::commands::Response;
use crate::engine::error::EngineResult;
use crate::engine::types::{AlterIndexSpec, AlterRelationSpec, AlterTableSpec, ConnectionId, ElementKind, TableChangeSet};
use crate::Engine;

fn qualified(schema: Option<&str>, name: &str) -> String {
    match schema {
        Some(schema) => format!("{}.{}", schema, name),
        None => name.to_string(),
    }
}

#[instrument(
    skip(engine, changes),
    fields(connection_id = %connection_id, operations = changes.operation_count())
)]
pub async fn apply_changes(
    engine: &Engine,
    connection_id: ConnectionId,
    changes: &TableChangeSet,
    allow_writes: bool,
) -> EngineResult<Response> {
    let connection = engine.connections().get(connection_id).await?;
    let snapshots = connection.pipeline.apply_changes(changes, allow_writes).await?;
    Ok(Response::Results(snapshots))
}

pub async fn alter_table(
    engine: &Engine,
    connection_id: ConnectionId,
    spec: &AlterTableSpec,
    acknowledged_dangerous: bool,
) -> EngineResult<Response> {
    let connection = engine.connections().get(connection_id).await?;
    let text = format!(
        "-- alter table {}: {} added, {} altered, {} dropped",
        qualified(spec.schema.as_deref(), &spec.table),
        spec.adds.len(),
        spec.alterations.len(),
        spec.drops.len()
    );
    // Dropping columns loses data
    let dangerous = !spec.drops.is_empty();
    connection
        .pipeline
        .run_structural(
            text,
            "ALTER",
            dangerous,
            acknowledged_dangerous,
            connection.adapter.alter_table(spec),
        )
        .await?;
    Ok(Response::Ok)
}

pub async fn alter_index(engine: &Engine, connection_id: ConnectionId, spec: &AlterIndexSpec) -> EngineResult<Response> {
    let connection = engine.connections().get(connection_id).await?;
    let text = format!(
        "-- alter indexes on {}: {} added, {} dropped",
        qualified(spec.schema.as_deref(), &spec.table),
        spec.additions.len(),
        spec.drops.len()
    );
    connection
        .pipeline
        .run_structural(text, "ALTER", false, false, connection.adapter.alter_index(spec))
        .await?;
    Ok(Response::Ok)
}

pub async fn alter_relation(
    engine: &Engine,
    connection_id: ConnectionId,
    spec: &AlterRelationSpec,
) -> EngineResult<Response> {
    let connection = engine.connections().get(connection_id).await?;
    let text = format!(
        "-- alter relations on {}: {} added, {} dropped",
        qualified(spec.schema.as_deref(), &spec.table),
        spec.additions.len(),
        spec.drops.len()
    );
    connection
        .pipeline
        .run_structural(text, "ALTER", false, false, connection.adapter.alter_relation(spec))
        .await?;
    Ok(Response::Ok)
}

#[instrument(skip(engine), fields(connection_id = %connection_id))]
pub async fn drop_element(
    engine: &Engine,
    connection_id: ConnectionId,
    kind: ElementKind,
    schema: Option<&str>,
    name: &str,
    acknowledged_dangerous: bool,
) -> EngineResult<Response> {
    let connection = engine.connections().get(connection_id).await?;
    let text = format!("DROP {} {}", kind.sql_keyword(), qualified(schema, name));
    connection
        .pipeline
        .run_structural(
            text,
            "DROP",
            true,
            acknowledged_dangerous,
            connection.adapter.drop_element(kind, schema, name),
        )
        .await?;
    Ok(Response::Ok)
}

#[instrument(skip(engine), fields(connection_id = %connection_id))]
pub async fn truncate_table(
    engine: &Engine,
    connection_id: ConnectionId,
    table: &str,
    schema: Option<&str>,
    acknowledged_dangerous: bool,
) -> EngineResult<Response> {
    let connection = engine.connections().get(connection_id).await?;
    let text = format!("TRUNCATE {}", qualified(schema, table));
    connection
        .pipeline
        .run_structural(
            text,
            "TRUNCATE",
            true,
            acknowledged_dangerous,
            connection.adapter.truncate_element(table, schema),
        )
        .await?;
    Ok(Response::Ok)
}

pub async fn duplicate_table(
    engine: &Engine,
    connection_id: ConnectionId,
    table: &str,
    schema: Option<&str>,
    new_name: &str,
) -> EngineResult<Response> {
    let connection = engine.connections().get(connection_id).await?;
    let text = format!("-- duplicate {} as {}", qualified(schema, table), new_name);
    connection
        .pipeline
        .run_structural(
            text,
            "CREATE",
            false,
            false,
            connection.adapter.duplicate_table(table, schema, new_name),
        )
        .await?;
    Ok(Response::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::query;
    use crate::config::EngineSettings;
    use crate::engine::error::EngineError;
    use crate::engine::pipeline::QueryOptions;
    use crate::engine::types::ConnectionConfig;

    async fn engine_with(read_only: bool, environment: &str) -> (Engine, ConnectionId) {
        let engine = Engine::new(EngineSettings::default()).await;
        let mut config = ConnectionConfig::new("sqlite", "", 0);
        config.database = Some(":memory:".into());
        config.environment = environment.into();
        config.read_only = read_only;
        let id = engine.connections().connect(config).await.expect("connect");
        if !read_only {
            query::execute(
                &engine,
                id,
                "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT); INSERT INTO notes (body) VALUES ('x');",
                QueryOptions::default(),
                true,
            )
            .await
            .expect("setup");
        }
        (engine, id)
    }

    #[tokio::test]
    async fn truncate_in_production_needs_acknowledgement() {
        let (engine, id) = engine_with(false, "production").await;

        let err = truncate_table(&engine, id, "notes", None, false)
            .await
            .expect_err("unacknowledged");
        assert!(matches!(err, EngineError::DangerousQueryBlocked { .. }));

        truncate_table(&engine, id, "notes", None, true)
            .await
            .expect("acknowledged");
        let Response::Result(result) =
            query::execute(&engine, id, "SELECT COUNT(*) AS n FROM notes", QueryOptions::default(), false)
                .await
                .expect("count")
        else {
            panic!("expected a result");
        };
        assert_eq!(result.value(0, "n"), Some(&crate::engine::types::Value::Int(0)));
    }

    #[tokio::test]
    async fn read_only_connections_reject_structural_changes() {
        let (engine, id) = engine_with(true, "development").await;
        let err = drop_element(&engine, id, ElementKind::Table, None, "notes", true)
            .await
            .expect_err("read-only");
        assert!(matches!(err, EngineError::ReadOnlyViolation { .. }));
    }

    #[tokio::test]
    async fn duplicate_copies_rows() {
        let (engine, id) = engine_with(false, "development").await;
        duplicate_table(&engine, id, "notes", None, "notes_copy")
            .await
            .expect("duplicate");
        let Response::Result(result) =
            query::execute(&engine, id, "SELECT body FROM notes_copy", QueryOptions::default(), false)
                .await
                .expect("select")
        else {
            panic!("expected a result");
        };
        assert_eq!(result.row_count, 1);
    }
}
