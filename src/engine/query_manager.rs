//! Query Manager
//!
//! Tracks active queries per connection so that the most recent one can be
//! cancelled without knowing its id.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{ConnectionId, QueryId};

#[derive(Default)]
struct Registry {
    active: HashMap<QueryId, ConnectionId>,
    by_connection: HashMap<ConnectionId, HashSet<QueryId>>,
    last_by_connection: HashMap<ConnectionId, QueryId>,
}

/// Locks are never held across an await, so registration also works from
/// `Drop` of an in-flight query.
pub struct QueryManager {
    inner: RwLock<Registry>,
}

impl QueryManager {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Registry::default()),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, connection_id: ConnectionId) -> QueryId {
        let query_id = QueryId::new();
        let _ = self.register_with_id(connection_id, query_id);
        query_id
    }

    pub fn register_with_id(&self, connection_id: ConnectionId, query_id: QueryId) -> EngineResult<QueryId> {
        let mut registry = self.write();
        if registry.active.contains_key(&query_id) {
            return Err(EngineError::execution_error("Query ID already registered"));
        }
        registry.active.insert(query_id, connection_id);
        registry
            .by_connection
            .entry(connection_id)
            .or_default()
            .insert(query_id);
        registry.last_by_connection.insert(connection_id, query_id);
        Ok(query_id)
    }

    pub fn finish(&self, query_id: QueryId) {
        let mut registry = self.write();
        let Some(connection_id) = registry.active.remove(&query_id) else {
            return;
        };

        if let Some(set) = registry.by_connection.get_mut(&connection_id) {
            set.remove(&query_id);
            if set.is_empty() {
                registry.by_connection.remove(&connection_id);
            }
        }
        if registry.last_by_connection.get(&connection_id) == Some(&query_id) {
            registry.last_by_connection.remove(&connection_id);
        }
    }

    pub fn contains(&self, query_id: QueryId) -> bool {
        self.read().active.contains_key(&query_id)
    }

    pub fn connection_for(&self, query_id: QueryId) -> Option<ConnectionId> {
        self.read().active.get(&query_id).copied()
    }

    pub fn last_for_connection(&self, connection_id: ConnectionId) -> Option<QueryId> {
        self.read().last_by_connection.get(&connection_id).copied()
    }

    pub fn active_for_connection(&self, connection_id: ConnectionId) -> Vec<QueryId> {
        self.read()
            .by_connection
            .get(&connection_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for QueryManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Unregisters the query when dropped
pub struct QueryRegistration {
    manager: Arc<QueryManager>,
    query_id: QueryId,
}

impl QueryRegistration {
    pub fn new(manager: Arc<QueryManager>, connection_id: ConnectionId, query_id: QueryId) -> EngineResult<Self> {
        manager.register_with_id(connection_id, query_id)?;
        Ok(Self { manager, query_id })
    }
}

impl Drop for QueryRegistration {
    fn drop(&mut self) {
        self.manager.finish(self.query_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_finishes_queries() {
        let manager = QueryManager::new();
        let connection = ConnectionId::new();
        let query_id = manager.register(connection);

        assert!(manager.contains(query_id));
        assert_eq!(manager.connection_for(query_id), Some(connection));
        assert_eq!(manager.last_for_connection(connection), Some(query_id));

        manager.finish(query_id);
        assert!(!manager.contains(query_id));
        assert!(manager.active_for_connection(connection).is_empty());
    }

    #[test]
    fn rejects_duplicate_query_id() {
        let manager = QueryManager::new();
        let connection = ConnectionId::new();
        let query_id = QueryId::new();

        manager
            .register_with_id(connection, query_id)
            .expect("first registration should succeed");

        let err = manager
            .register_with_id(connection, query_id)
            .expect_err("duplicate should fail");

        assert!(err.to_string().contains("already"));
    }

    #[test]
    fn registration_guard_unregisters_on_drop() {
        let manager = Arc::new(QueryManager::new());
        let connection = ConnectionId::new();
        let query_id = QueryId::new();
        {
            let _registration =
                QueryRegistration::new(Arc::clone(&manager), connection, query_id).expect("register");
            assert!(manager.contains(query_id));
        }
        assert!(!manager.contains(query_id));
    }
}
