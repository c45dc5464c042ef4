//! Driver Registry
//!
//! Central registry for all available database drivers.
//! Each entry maps a driver id to its static capabilities and a constructor
//! producing an unconnected adapter for one connection config.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::capabilities::Capabilities;
use crate::engine::credentials::CredentialCache;
use crate::engine::drivers::{mongodb::MongoAdapter, mysql::MySqlAdapter, postgres::PostgresAdapter, sqlite::SqliteAdapter};
use crate::engine::ssh_tunnel::TunnelRegistry;
use crate::engine::traits::ClientAdapter;
use crate::engine::types::ConnectionConfig;

/// Process-wide collaborators handed to every adapter
#[derive(Clone, Default)]
pub struct ConnectContext {
    pub tunnels: Arc<TunnelRegistry>,
    pub credentials: Arc<CredentialCache>,
}

pub type AdapterConstructor = fn(ConnectionConfig, ConnectContext) -> Arc<dyn ClientAdapter>;

#[derive(Clone)]
pub struct DriverEntry {
    pub id: &'static str,
    pub name: &'static str,
    pub capabilities: Capabilities,
    pub constructor: AdapterConstructor,
}

/// Registry that holds all available database drivers
pub struct DriverRegistry {
    drivers: HashMap<String, DriverEntry>,
}

impl DriverRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Registry with PostgreSQL, MySQL, SQLite and MongoDB
    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();
        registry.register(DriverEntry {
            id: "postgres",
            name: "PostgreSQL",
            capabilities: Capabilities::POSTGRES,
            constructor: |config, ctx| Arc::new(PostgresAdapter::new(config, ctx)),
        });
        registry.register(DriverEntry {
            id: "mysql",
            name: "MySQL / MariaDB",
            capabilities: Capabilities::MYSQL,
            constructor: |config, ctx| Arc::new(MySqlAdapter::new(config, ctx)),
        });
        registry.register(DriverEntry {
            id: "sqlite",
            name: "SQLite",
            capabilities: Capabilities::SQLITE,
            constructor: |config, ctx| Arc::new(SqliteAdapter::new(config, ctx)),
        });
        registry.register(DriverEntry {
            id: "mongodb",
            name: "MongoDB",
            capabilities: Capabilities::MONGODB,
            constructor: |config, ctx| Arc::new(MongoAdapter::new(config, ctx)),
        });
        registry
    }

    /// Registers a new driver, replacing any entry with the same id
    pub fn register(&mut self, entry: DriverEntry) {
        self.drivers.insert(entry.id.to_string(), entry);
    }

    /// Gets a driver by its ID
    pub fn get(&self, driver_id: &str) -> Option<&DriverEntry> {
        self.drivers.get(driver_id)
    }

    /// Builds an unconnected adapter for `config`
    pub fn create(&self, config: ConnectionConfig, ctx: ConnectContext) -> Option<Arc<dyn ClientAdapter>> {
        let entry = self.drivers.get(&config.driver)?;
        Some((entry.constructor)(config, ctx))
    }

    /// Lists all registered driver IDs
    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.drivers.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the number of registered drivers
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    /// Returns true if no drivers are registered
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_drivers_are_registered() {
        let registry = DriverRegistry::with_builtin_drivers();
        assert_eq!(registry.list(), vec!["mongodb", "mysql", "postgres", "sqlite"]);
        assert!(!registry.get("mongodb").expect("mongo").capabilities.transactions);
    }

    #[test]
    fn created_adapter_matches_driver_id() {
        let registry = DriverRegistry::with_builtin_drivers();
        let mut config = ConnectionConfig::new("sqlite", "", 0);
        config.database = Some(":memory:".into());

        let adapter = registry.create(config, ConnectContext::default()).expect("sqlite adapter");
        assert_eq!(adapter.driver_id(), "sqlite");
        assert!(registry
            .create(ConnectionConfig::new("oracle", "h", 1), ConnectContext::default())
            .is_none());
    }
}
