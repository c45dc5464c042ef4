//! Connection Manager
//!
//! Opens adapters from connection configs and owns everything that lives as
//! long as one opened connection: the adapter, its pipeline and its session
//! manager. This is the single source of truth for open connections.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};
use tracing::instrument;

use crate::config::{EngineSettings, SafetyPolicy};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::pipeline::QueryPipeline;
use crate::engine::query_log::QueryLogger;
use crate::engine::query_manager::QueryManager;
use crate::engine::registry::{ConnectContext, DriverRegistry};
use crate::engine::session_manager::SessionManager;
use crate::engine::traits::ClientAdapter;
use crate::engine::types::{ConnectionConfig, ConnectionId};

/// One opened connection and the components bound to it
pub struct ActiveConnection {
    pub id: ConnectionId,
    pub config: ConnectionConfig,
    pub display_name: String,
    pub adapter: Arc<dyn ClientAdapter>,
    pub pipeline: QueryPipeline,
    pub sessions: Arc<SessionManager>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub driver: String,
    pub display_name: String,
    pub environment: String,
    pub read_only: bool,
}

pub fn display_name(config: &ConnectionConfig) -> String {
    if config.driver == "sqlite" {
        return format!("sqlite:{}", config.database.as_deref().unwrap_or(":memory:"));
    }
    format!(
        "{}@{}:{}{}",
        config.username,
        config.host,
        config.database.as_deref().unwrap_or("default"),
        if config.ssh_tunnel.is_some() { " (SSH)" } else { "" }
    )
}

pub struct ConnectionManager {
    registry: Arc<DriverRegistry>,
    ctx: ConnectContext,
    logger: Arc<dyn QueryLogger>,
    query_manager: Arc<QueryManager>,
    settings: RwLock<EngineSettings>,
    connections: RwLock<HashMap<ConnectionId, Arc<ActiveConnection>>>,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<DriverRegistry>,
        ctx: ConnectContext,
        logger: Arc<dyn QueryLogger>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry,
            ctx,
            logger,
            query_manager: Arc::new(QueryManager::new()),
            settings: RwLock::new(settings),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    pub fn query_manager(&self) -> &Arc<QueryManager> {
        &self.query_manager
    }

    pub async fn settings(&self) -> EngineSettings {
        self.settings.read().await.clone()
    }

    /// Applies to connections opened afterwards.
    pub async fn set_safety_policy(&self, policy: SafetyPolicy) {
        self.settings.write().await.safety = policy;
    }

    fn create_adapter(&self, config: &ConnectionConfig) -> EngineResult<Arc<dyn ClientAdapter>> {
        self.registry
            .create(config.clone(), self.ctx.clone())
            .ok_or_else(|| EngineError::driver_not_found(&config.driver))
    }

    /// Tests a connection without persisting it
    #[instrument(
        skip(self, config),
        fields(
            driver = %config.driver,
            host = %config.host,
            port = config.port,
            database = ?config.database,
            ssh = config.ssh_tunnel.is_some()
        )
    )]
    pub async fn test_connection(&self, config: &ConnectionConfig) -> EngineResult<()> {
        let adapter = self.create_adapter(config)?;
        let timeout_ms = self.settings.read().await.test_timeout_ms;

        match timeout(Duration::from_millis(timeout_ms), adapter.test_connection()).await {
            Ok(result) => result,
            Err(_) => {
                let _ = adapter.disconnect().await;
                Err(EngineError::Timeout { timeout_ms })
            }
        }
    }

    /// Opens a connection and returns its id
    #[instrument(
        skip(self, config),
        fields(
            driver = %config.driver,
            host = %config.host,
            port = config.port,
            database = ?config.database,
            ssh = config.ssh_tunnel.is_some()
        )
    )]
    pub async fn connect(&self, config: ConnectionConfig) -> EngineResult<ConnectionId> {
        let adapter = self.create_adapter(&config)?;
        let settings = self.settings().await;
        let timeout_ms = settings.connect_timeout_ms;

        match timeout(Duration::from_millis(timeout_ms), adapter.connect()).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = adapter.disconnect().await;
                return Err(EngineError::Timeout { timeout_ms });
            }
        }

        let id = ConnectionId::new();
        let sessions = Arc::new(SessionManager::new(Arc::clone(&adapter)));
        let pipeline = QueryPipeline::new(
            Arc::clone(&adapter),
            Arc::clone(&sessions),
            Arc::clone(&self.logger),
            Arc::clone(&self.query_manager),
            id,
            config.read_only,
            config.is_production(),
            settings.safety,
        );
        let connection = ActiveConnection {
            id,
            display_name: display_name(&config),
            config,
            adapter,
            pipeline,
            sessions,
        };
        tracing::info!(connection_id = %id, name = %connection.display_name, "Connection opened");

        let mut connections = self.connections.write().await;
        connections.insert(id, Arc::new(connection));
        Ok(id)
    }

    /// Releases reserved sessions, then closes the adapter
    #[instrument(skip(self), fields(connection_id = %id))]
    pub async fn disconnect(&self, id: ConnectionId) -> EngineResult<()> {
        let connection = {
            let mut connections = self.connections.write().await;
            connections
                .remove(&id)
                .ok_or_else(|| EngineError::connection_not_found(id.to_string()))?
        };

        connection.sessions.release_all().await;
        connection.adapter.disconnect().await
    }

    pub async fn disconnect_all(&self) {
        let ids: Vec<ConnectionId> = self.connections.read().await.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.disconnect(id).await {
                tracing::warn!(connection_id = %id, "Disconnect failed: {}", e);
            }
        }
    }

    pub async fn get(&self, id: ConnectionId) -> EngineResult<Arc<ActiveConnection>> {
        let connections = self.connections.read().await;
        connections
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::connection_not_found(id.to_string()))
    }

    pub async fn list(&self) -> Vec<ConnectionSummary> {
        let connections = self.connections.read().await;
        let mut summaries: Vec<ConnectionSummary> = connections
            .values()
            .map(|c| ConnectionSummary {
                id: c.id,
                driver: c.config.driver.clone(),
                display_name: c.display_name.clone(),
                environment: c.config.environment.clone(),
                read_only: c.config.read_only,
            })
            .collect();
        summaries.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::capabilities::Capabilities;
    use crate::engine::query_log::MemoryQueryLogger;
    use crate::engine::registry::DriverEntry;
    use crate::engine::testing::FakeAdapter;
    use crate::engine::types::{ConnectionState, SessionId};

    fn manager() -> ConnectionManager {
        let mut registry = DriverRegistry::new();
        registry.register(DriverEntry {
            id: "fake",
            name: "Fake",
            capabilities: Capabilities::MINIMAL,
            constructor: |_, _| Arc::new(FakeAdapter::new()),
        });
        ConnectionManager::new(
            Arc::new(registry),
            ConnectContext::default(),
            Arc::new(MemoryQueryLogger::new(10)),
            EngineSettings::default(),
        )
    }

    fn config() -> ConnectionConfig {
        let mut config = ConnectionConfig::new("fake", "db.internal", 5432);
        config.username = "app".into();
        config.database = Some("orders".into());
        config
    }

    #[tokio::test]
    async fn connect_registers_and_disconnect_releases() {
        let manager = manager();
        let id = manager.connect(config()).await.expect("connect");

        let connection = manager.get(id).await.expect("get");
        assert_eq!(connection.adapter.state(), ConnectionState::Connected);
        assert_eq!(connection.display_name, "app@db.internal:orders");
        connection
            .sessions
            .reserve_connection(SessionId::new("tab-1"))
            .await
            .expect("reserve");

        manager.disconnect(id).await.expect("disconnect");
        assert!(connection.sessions.list_sessions().await.is_empty());
        assert_eq!(connection.adapter.state(), ConnectionState::Disconnected);
        assert!(matches!(
            manager.get(id).await,
            Err(EngineError::ConnectionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_driver_is_reported() {
        let manager = manager();
        let err = manager
            .connect(ConnectionConfig::new("oracle", "h", 1521))
            .await
            .expect_err("unknown driver");
        assert!(matches!(err, EngineError::DriverNotFound { .. }));
    }

    #[tokio::test]
    async fn list_reports_open_connections() {
        let manager = manager();
        manager.connect(config()).await.expect("connect");
        let mut read_only = config();
        read_only.read_only = true;
        read_only.username = "reader".into();
        manager.connect(read_only).await.expect("connect");

        let list = manager.list().await;
        assert_eq!(list.len(), 2);
        assert!(list.iter().any(|c| c.read_only && c.display_name.starts_with("reader@")));

        manager.disconnect_all().await;
        assert!(manager.list().await.is_empty());
    }
}
