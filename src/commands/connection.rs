//! Connection requests
//!
//! Validates incoming connection configs before they reach a driver.

use serde::Serialize;
use tracing::instrument;

use crate::commands::host::HostState;
use crate::commands::Response;
use crate::engine::capabilities::Capabilities;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{ConnectionConfig, ConnectionId, SshAuth};
use crate::Engine;

/// A registered driver as reported to callers
#[derive(Debug, Clone, Serialize)]
pub struct DriverInfo {
    pub id: String,
    pub name: String,
    pub capabilities: Capabilities,
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::connection_failed(message)
}

fn normalize_environment(env: &str) -> EngineResult<String> {
    let normalized = env.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return Ok("development".to_string());
    }

    match normalized.as_str() {
        "development" | "staging" | "production" => Ok(normalized),
        _ => Err(invalid(format!("Invalid environment: {}", env))),
    }
}

/// Trims the config and rejects missing required fields.
///
/// SQLite only needs a database path. MongoDB may connect without a
/// username. Everything else needs host, port and username unless the
/// credentials come from a provider.
pub fn normalize_config(mut config: ConnectionConfig) -> EngineResult<ConnectionConfig> {
    let driver = config.driver.trim().to_ascii_lowercase();
    if driver.is_empty() {
        return Err(invalid("Driver is required"));
    }
    config.driver = driver;

    if let Some(database) = config.database.take() {
        let trimmed = database.trim();
        if !trimmed.is_empty() {
            config.database = Some(trimmed.to_string());
        }
    }
    config.environment = normalize_environment(&config.environment)?;

    if config.driver == "sqlite" {
        if config.database.is_none() {
            return Err(invalid("Database path is required"));
        }
        if config.ssh_tunnel.is_some() {
            return Err(invalid("SSH tunnels are not available for SQLite"));
        }
        return Ok(config);
    }

    let host = config.host.trim();
    if host.is_empty() {
        return Err(invalid("Host is required"));
    }
    config.host = host.to_string();

    config.username = config.username.trim().to_string();
    if config.username.is_empty() && config.auth.is_none() && config.driver != "mongodb" {
        return Err(invalid("Username is required"));
    }

    if config.port == 0 {
        return Err(invalid("Port must be greater than 0"));
    }

    if let Some(ref mut ssh) = config.ssh_tunnel {
        let host = ssh.host.trim();
        if host.is_empty() {
            return Err(invalid("SSH host is required"));
        }
        ssh.host = host.to_string();

        let username = ssh.username.trim();
        if username.is_empty() {
            return Err(invalid("SSH username is required"));
        }
        ssh.username = username.to_string();

        if ssh.port == 0 {
            return Err(invalid("SSH port must be greater than 0"));
        }

        match &ssh.auth {
            SshAuth::Password { password } if password.trim().is_empty() => {
                return Err(invalid("SSH password is required"));
            }
            SshAuth::Key { private_key_path, .. } if private_key_path.trim().is_empty() => {
                return Err(invalid("SSH key path is required"));
            }
            _ => {}
        }
    }

    Ok(config)
}

pub fn list_drivers(engine: &Engine) -> EngineResult<Response> {
    let registry = engine.connections().registry();
    let drivers = registry
        .list()
        .into_iter()
        .filter_map(|id| registry.get(id))
        .map(|entry| DriverInfo {
            id: entry.id.to_string(),
            name: entry.name.to_string(),
            capabilities: entry.capabilities,
        })
        .collect();
    Ok(Response::Drivers(drivers))
}

pub async fn test_connection(engine: &Engine, config: ConnectionConfig) -> EngineResult<Response> {
    let config = normalize_config(config)?;
    engine.connections().test_connection(&config).await?;
    Ok(Response::Ok)
}

pub async fn connect(engine: &Engine, config: ConnectionConfig) -> EngineResult<Response> {
    let config = normalize_config(config)?;
    let id = engine.connections().connect(config).await?;
    Ok(Response::Connected(id))
}

/// Closes the connection's cursors first so their reserved connections go
/// back before the pool shuts down.
#[instrument(skip(state), fields(connection_id = %id))]
pub async fn disconnect(state: &HostState, id: ConnectionId) -> EngineResult<Response> {
    let closed = state.cursors.close_for_connection(id).await;
    if closed > 0 {
        tracing::debug!(cursors = closed, "Closed cursors of disconnected connection");
    }
    state.engine.connections().disconnect(id).await?;
    Ok(Response::Ok)
}

pub async fn list_connections(engine: &Engine) -> EngineResult<Response> {
    Ok(Response::Connections(engine.connections().list().await))
}
