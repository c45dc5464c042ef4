// unidb - unified client engine for relational and document databases
// Core library

pub mod commands;
pub mod config;
pub mod engine;
pub mod observability;
pub mod vault;

use std::sync::Arc;

use engine::credentials::{CredentialCache, StaticCredentialProvider};
use engine::query_log::{FanoutQueryLogger, MemoryQueryLogger, QueryLogger, TracingQueryLogger};
use engine::ssh_tunnel::TunnelRegistry;
use engine::{ConnectContext, ConnectionManager, DriverRegistry};
use tokio::time::Duration;

use commands::{EngineClient, EngineHost};

pub use config::{EngineSettings, SafetyPolicy};
pub use engine::{EngineError, EngineResult};

/// Process-wide engine state shared by every request
pub struct Engine {
    context: ConnectContext,
    history: Arc<MemoryQueryLogger>,
    connections: ConnectionManager,
}

impl Engine {
    /// Builds the engine with the built-in drivers and credential providers.
    pub async fn new(settings: EngineSettings) -> Self {
        let credentials = Arc::new(CredentialCache::new(chrono::Duration::seconds(
            settings.credential_refresh_secs,
        )));
        credentials.register(Arc::new(StaticCredentialProvider)).await;
        credentials
            .register(Arc::new(vault::KeyringCredentialProvider))
            .await;

        let context = ConnectContext {
            tunnels: Arc::new(TunnelRegistry::default()),
            credentials,
        };

        let history = Arc::new(MemoryQueryLogger::new(settings.query_history_limit));
        let logger: Arc<dyn QueryLogger> = Arc::new(FanoutQueryLogger::new(vec![
            Arc::new(TracingQueryLogger::default()),
            history.clone(),
        ]));

        let connections = ConnectionManager::new(
            Arc::new(DriverRegistry::with_builtin_drivers()),
            context.clone(),
            logger,
            settings,
        );

        Self {
            context,
            history,
            connections,
        }
    }

    /// Loads the user settings, installs file logging and builds the engine.
    pub async fn bootstrap() -> Self {
        observability::init_tracing(&observability::default_log_directory());
        let settings = EngineSettings::load();
        tracing::info!(
            connect_timeout_ms = settings.connect_timeout_ms,
            history = settings.query_history_limit,
            "Engine starting"
        );
        Self::new(settings).await
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn context(&self) -> &ConnectContext {
        &self.context
    }

    /// Recent queries across all connections, newest last
    pub fn history(&self) -> &MemoryQueryLogger {
        &self.history
    }

    /// Starts the request host; requests time out after the configured
    /// `request_timeout_ms`.
    pub async fn spawn_host(self: Arc<Self>) -> EngineClient {
        let timeout_ms = self.connections.settings().await.request_timeout_ms;
        EngineHost::spawn(self, Duration::from_millis(timeout_ms))
    }

    /// Closes every connection, then drops shared tunnels and cached secrets.
    pub async fn shutdown(&self) {
        self.connections.disconnect_all().await;
        self.context.tunnels.clear().await;
        self.context.credentials.clear().await;
        tracing::info!("Engine stopped");
    }
}
