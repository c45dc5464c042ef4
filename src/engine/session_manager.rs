//! Session Manager
//!
//! Maps caller session ids (e.g. one per editor tab) to a connection reserved
//! from the adapter. Commit and rollback consume the reserved handle; a fresh
//! one is acquired under the same id right away, or lazily on next use when
//! that acquisition fails.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::{ClientAdapter, ReservedConnection};
use crate::engine::types::{QueryId, QueryResult, ResultMode, SessionId};

type Slot = Arc<Mutex<Option<Box<dyn ReservedConnection>>>>;

pub struct SessionManager {
    adapter: Arc<dyn ClientAdapter>,
    slots: RwLock<HashMap<SessionId, Slot>>,
}

impl SessionManager {
    pub fn new(adapter: Arc<dyn ClientAdapter>) -> Self {
        Self {
            adapter,
            slots: RwLock::new(HashMap::new()),
        }
    }

    #[instrument(skip(self), fields(session = %session_id, driver = self.adapter.driver_id()))]
    pub async fn reserve_connection(&self, session_id: SessionId) -> EngineResult<()> {
        if self.is_reserved(&session_id).await {
            return Err(EngineError::session_already_reserved(session_id.0));
        }

        let handle = self.adapter.reserve_connection().await?;

        let mut slots = self.slots.write().await;
        if slots.contains_key(&session_id) {
            // Another caller reserved the id while we were acquiring.
            return Err(EngineError::session_already_reserved(session_id.0));
        }
        slots.insert(session_id, Arc::new(Mutex::new(Some(handle))));
        Ok(())
    }

    async fn slot(&self, session_id: &SessionId) -> EngineResult<Slot> {
        let slots = self.slots.read().await;
        slots
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::session_not_found(session_id.0.clone()))
    }

    async fn ensure_handle<'a>(
        &self,
        handle: &'a mut Option<Box<dyn ReservedConnection>>,
    ) -> EngineResult<&'a mut Box<dyn ReservedConnection>> {
        if handle.is_none() {
            tracing::debug!("Re-reserving connection for session");
            *handle = Some(self.adapter.reserve_connection().await?);
        }
        handle
            .as_mut()
            .ok_or_else(|| EngineError::internal("Reserved connection missing"))
    }

    #[instrument(skip(self), fields(session = %session_id))]
    pub async fn start_transaction(&self, session_id: &SessionId) -> EngineResult<()> {
        let slot = self.slot(session_id).await?;
        let mut guard = slot.lock().await;
        let handle = self.ensure_handle(&mut guard).await?;
        handle.begin().await
    }

    #[instrument(skip(self), fields(session = %session_id))]
    pub async fn commit_transaction(&self, session_id: &SessionId) -> EngineResult<()> {
        self.finish_transaction(session_id, true).await
    }

    #[instrument(skip(self), fields(session = %session_id))]
    pub async fn rollback_transaction(&self, session_id: &SessionId) -> EngineResult<()> {
        self.finish_transaction(session_id, false).await
    }

    async fn finish_transaction(&self, session_id: &SessionId, commit: bool) -> EngineResult<()> {
        let slot = self.slot(session_id).await?;
        let mut guard = slot.lock().await;

        let handle = match guard.take() {
            Some(handle) if handle.in_transaction() => handle,
            other => {
                *guard = other;
                return Err(EngineError::transaction_error("No active transaction"));
            }
        };

        let result = if commit {
            handle.commit().await
        } else {
            handle.rollback().await
        };

        match self.adapter.reserve_connection().await {
            Ok(fresh) => *guard = Some(fresh),
            Err(e) => tracing::warn!("Deferred re-reservation after transaction end: {}", e),
        }

        result
    }

    /// Executes on the session's reserved connection.
    pub async fn execute(
        &self,
        session_id: &SessionId,
        query: &str,
        query_id: QueryId,
        mode: ResultMode,
    ) -> EngineResult<Vec<QueryResult>> {
        let slot = self.slot(session_id).await?;
        let mut guard = slot.lock().await;
        let handle = self.ensure_handle(&mut guard).await?;
        handle.execute(query, query_id, mode).await
    }

    pub async fn in_transaction(&self, session_id: &SessionId) -> EngineResult<bool> {
        let slot = self.slot(session_id).await?;
        let guard = slot.lock().await;
        Ok(guard.as_ref().map(|h| h.in_transaction()).unwrap_or(false))
    }

    pub async fn is_reserved(&self, session_id: &SessionId) -> bool {
        self.slots.read().await.contains_key(session_id)
    }

    pub async fn list_sessions(&self) -> Vec<SessionId> {
        let slots = self.slots.read().await;
        let mut ids: Vec<SessionId> = slots.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Rolls back any open transaction and discards the handle.
    #[instrument(skip(self), fields(session = %session_id))]
    pub async fn release_connection(&self, session_id: &SessionId) -> EngineResult<()> {
        let slot = {
            let mut slots = self.slots.write().await;
            slots
                .remove(session_id)
                .ok_or_else(|| EngineError::session_not_found(session_id.0.clone()))?
        };
        Self::release_slot(slot).await;
        Ok(())
    }

    async fn release_slot(slot: Slot) {
        let mut guard = slot.lock().await;
        if let Some(handle) = guard.take() {
            if handle.in_transaction() {
                if let Err(e) = handle.rollback().await {
                    tracing::warn!("Rollback on session release failed: {}", e);
                }
            }
        }
    }

    /// Releases every reserved session; used on disconnect.
    pub async fn release_all(&self) {
        let drained: Vec<(SessionId, Slot)> = {
            let mut slots = self.slots.write().await;
            slots.drain().collect()
        };
        for (session_id, slot) in drained {
            tracing::debug!(session = %session_id, "Releasing session");
            Self::release_slot(slot).await;
        }
    }
}
