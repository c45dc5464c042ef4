//! Host task and client handle
//!
//! The host owns the engine and the open cursors. Every request runs in its
//! own task so a slow query does not hold up the others; the client aborts
//! that task when its deadline passes, which drops the in-flight query.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{timeout, Duration};

use crate::commands::query::CursorTable;
use crate::commands::{connection, mutation, policy, query, vault, Request, Response};
use crate::engine::error::EngineError;
use crate::Engine;

const CHANNEL_CAPACITY: usize = 64;

/// Reply to one request, tagged with its correlation id
#[derive(Debug)]
pub struct Reply {
    pub id: u64,
    pub response: Response,
}

enum HostMessage {
    Call {
        id: u64,
        request: Request,
        reply: oneshot::Sender<Reply>,
    },
    Abort {
        id: u64,
    },
}

/// State shared by all request tasks
pub struct HostState {
    pub engine: Arc<Engine>,
    pub cursors: CursorTable,
}

type InFlight = Arc<Mutex<HashMap<u64, AbortHandle>>>;

pub struct EngineHost {
    state: Arc<HostState>,
    receiver: mpsc::Receiver<HostMessage>,
    in_flight: InFlight,
}

impl EngineHost {
    /// Spawns the host task and returns a client for it.
    pub fn spawn(engine: Arc<Engine>, request_timeout: Duration) -> EngineClient {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let host = EngineHost {
            state: Arc::new(HostState {
                engine,
                cursors: CursorTable::default(),
            }),
            receiver,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        };
        tokio::spawn(host.run());

        EngineClient {
            sender,
            next_id: Arc::new(AtomicU64::new(1)),
            request_timeout,
        }
    }

    async fn run(mut self) {
        while let Some(message) = self.receiver.recv().await {
            match message {
                HostMessage::Call { id, request, reply } => self.start(id, request, reply),
                HostMessage::Abort { id } => {
                    let handle = self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                    if let Some(handle) = handle {
                        tracing::warn!(request_id = id, "Aborting timed out request");
                        handle.abort();
                    }
                }
            }
        }

        // All clients are gone
        self.state.cursors.close_all().await;
        tracing::debug!("Engine host stopped");
    }

    fn start(&self, id: u64, request: Request, reply: oneshot::Sender<Reply>) {
        let state = Arc::clone(&self.state);
        let in_flight = Arc::clone(&self.in_flight);
        // Registration happens under the lock so a fast task cannot remove
        // its entry before it was inserted.
        let mut tasks = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let task = tokio::spawn(async move {
            let name = request.name();
            let response = dispatch(&state, request).await;
            if let Response::Error { kind, message } = &response {
                tracing::debug!(request_id = id, request = name, ?kind, "Request failed: {}", message);
            }
            in_flight.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            // The caller may have given up already
            let _ = reply.send(Reply { id, response });
        });
        tasks.insert(id, task.abort_handle());
    }
}

async fn dispatch(state: &HostState, request: Request) -> Response {
    let engine = &state.engine;
    let result = match request {
        Request::ListDrivers => connection::list_drivers(engine),
        Request::TestConnection { config } => connection::test_connection(engine, config).await,
        Request::Connect { config } => connection::connect(engine, config).await,
        Request::Disconnect { connection_id } => connection::disconnect(state, connection_id).await,
        Request::ListConnections => connection::list_connections(engine).await,

        Request::Execute {
            connection_id,
            query,
            options,
            multiple,
        } => query::execute(engine, connection_id, &query, options, multiple).await,
        Request::Cancel {
            connection_id,
            query_id,
        } => query::cancel(engine, connection_id, query_id).await,
        Request::Describe {
            connection_id,
            listing,
            schema,
            table,
        } => query::describe(engine, connection_id, listing, schema.as_deref(), table.as_deref()).await,
        Request::SelectTop {
            connection_id,
            table,
            schema,
            options,
        } => query::select_top(engine, connection_id, &table, schema.as_deref(), &options).await,
        Request::QueryHistory { limit } => Ok(query::history(engine, limit)),

        Request::OpenCursor {
            connection_id,
            source,
            chunk_size,
        } => query::open_cursor(state, connection_id, source, chunk_size).await,
        Request::ReadCursor { cursor_id } => query::read_cursor(state, cursor_id).await,
        Request::CloseCursor { cursor_id } => query::close_cursor(state, cursor_id).await,

        Request::ReserveSession {
            connection_id,
            session_id,
        } => query::reserve_session(engine, connection_id, session_id).await,
        Request::ReleaseSession {
            connection_id,
            session_id,
        } => query::release_session(engine, connection_id, session_id).await,
        Request::BeginTransaction {
            connection_id,
            session_id,
        } => query::begin_transaction(engine, connection_id, session_id).await,
        Request::CommitTransaction {
            connection_id,
            session_id,
        } => query::commit_transaction(engine, connection_id, session_id).await,
        Request::RollbackTransaction {
            connection_id,
            session_id,
        } => query::rollback_transaction(engine, connection_id, session_id).await,

        Request::ApplyChanges {
            connection_id,
            changes,
            allow_writes,
        } => mutation::apply_changes(engine, connection_id, &changes, allow_writes).await,
        Request::AlterTable {
            connection_id,
            spec,
            acknowledged_dangerous,
        } => mutation::alter_table(engine, connection_id, &spec, acknowledged_dangerous).await,
        Request::AlterIndex { connection_id, spec } => mutation::alter_index(engine, connection_id, &spec).await,
        Request::AlterRelation { connection_id, spec } => {
            mutation::alter_relation(engine, connection_id, &spec).await
        }
        Request::DropElement {
            connection_id,
            kind,
            schema,
            name,
            acknowledged_dangerous,
        } => {
            mutation::drop_element(engine, connection_id, kind, schema.as_deref(), &name, acknowledged_dangerous)
                .await
        }
        Request::TruncateTable {
            connection_id,
            table,
            schema,
            acknowledged_dangerous,
        } => mutation::truncate_table(engine, connection_id, &table, schema.as_deref(), acknowledged_dangerous).await,
        Request::DuplicateTable {
            connection_id,
            table,
            schema,
            new_name,
        } => mutation::duplicate_table(engine, connection_id, &table, schema.as_deref(), &new_name).await,

        Request::GetSafetyPolicy => policy::get_safety_policy(engine).await,
        Request::SetSafetyPolicy { policy } => policy::set_safety_policy(engine, policy).await,

        Request::SaveSecret {
            service,
            account,
            secret,
        } => vault::save_secret(service, account, secret).await,
        Request::DeleteSecret { service, account } => vault::delete_secret(service, account).await,
    };
    result.into()
}

/// Cloneable handle for sending requests to the host
#[derive(Clone)]
pub struct EngineClient {
    sender: mpsc::Sender<HostMessage>,
    next_id: Arc<AtomicU64>,
    request_timeout: Duration,
}

impl EngineClient {
    /// Sends `request` with the default timeout.
    pub async fn call(&self, request: Request) -> Response {
        self.call_with_timeout(request, self.request_timeout).await
    }

    /// Sends `request` and waits up to `limit` for its reply. On timeout the
    /// host aborts the request task.
    pub async fn call_with_timeout(&self, request: Request, limit: Duration) -> Response {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        let message = HostMessage::Call {
            id,
            request,
            reply: reply_tx,
        };
        if self.sender.send(message).await.is_err() {
            return Response::from_error(&EngineError::internal("Engine host is not running"));
        }

        match timeout(limit, reply_rx).await {
            Ok(Ok(reply)) => {
                debug_assert_eq!(reply.id, id);
                reply.response
            }
            Ok(Err(_)) => Response::from_error(&EngineError::Cancelled),
            Err(_) => {
                let _ = self.sender.send(HostMessage::Abort { id }).await;
                Response::from_error(&EngineError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::engine::types::ConnectionConfig;
    use crate::engine::ErrorKind;

    async fn client() -> EngineClient {
        let engine = Arc::new(Engine::new(EngineSettings::default()).await);
        EngineHost::spawn(engine, Duration::from_secs(5))
    }

    fn memory_config() -> ConnectionConfig {
        let mut config = ConnectionConfig::new("sqlite", "", 0);
        config.database = Some(":memory:".into());
        config
    }

    #[tokio::test]
    async fn requests_are_answered_in_turn() {
        let client = client().await;

        let Response::Drivers(drivers) = client.call(Request::ListDrivers).await else {
            panic!("expected drivers");
        };
        assert_eq!(drivers.len(), 4);

        let Response::Connected(connection_id) = client.call(Request::Connect { config: memory_config() }).await
        else {
            panic!("expected a connection id");
        };

        let response = client
            .call(Request::Execute {
                connection_id,
                query: "SELECT 1 AS one".into(),
                options: Default::default(),
                multiple: false,
            })
            .await;
        let Response::Result(result) = response else {
            panic!("expected a result, got {:?}", response);
        };
        assert_eq!(result.row_count, 1);

        let Response::Connections(connections) = client.call(Request::ListConnections).await else {
            panic!("expected connections");
        };
        assert_eq!(connections.len(), 1);
    }

    #[tokio::test]
    async fn errors_carry_their_kind() {
        let client = client().await;
        let response = client
            .call(Request::Disconnect {
                connection_id: crate::engine::types::ConnectionId::new(),
            })
            .await;
        assert!(matches!(
            response,
            Response::Error {
                kind: ErrorKind::ConnectionNotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn slow_requests_time_out() {
        let client = client().await;
        let Response::Connected(connection_id) = client.call(Request::Connect { config: memory_config() }).await
        else {
            panic!("expected a connection id");
        };

        let recursive =
            "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 50000000) SELECT count(*) FROM n";
        let response = client
            .call_with_timeout(
                Request::Execute {
                    connection_id,
                    query: recursive.into(),
                    options: Default::default(),
                    multiple: false,
                },
                Duration::from_millis(50),
            )
            .await;
        assert!(matches!(response, Response::Error { kind: ErrorKind::Timeout, .. }));
    }
}
