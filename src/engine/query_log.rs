//! Query logging collaborator
//!
//! The pipeline hands every finished call to a [`QueryLogger`]. Logging is
//! fire-and-forget: a failing logger is traced and never fails the query.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::engine::error::ErrorKind;
use crate::engine::types::{ConnectionId, QueryId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LogId(pub u64);

#[derive(Debug, Error)]
pub enum QueryLogError {
    #[error("Query log unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Completed,
    Failed,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext {
    pub connection_id: ConnectionId,
    pub driver: String,
    pub session: Option<SessionId>,
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryLogEntry {
    pub query_id: QueryId,
    pub context: ExecutionContext,
    pub text: String,
    /// Classified command kinds, one per statement
    pub kinds: Vec<String>,
    pub status: QueryStatus,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub duration_ms: f64,
    pub row_count: Option<usize>,
    pub affected_rows: Option<u64>,
    pub started_at: DateTime<Utc>,
}

pub trait QueryLogger: Send + Sync {
    fn log_query(&self, entry: &QueryLogEntry) -> Result<LogId, QueryLogError>;
}

/// Emits one `tracing` event per query
#[derive(Default)]
pub struct TracingQueryLogger {
    next_id: AtomicU64,
}

impl QueryLogger for TracingQueryLogger {
    fn log_query(&self, entry: &QueryLogEntry) -> Result<LogId, QueryLogError> {
        let id = LogId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        match entry.status {
            QueryStatus::Completed => tracing::info!(
                log_id = id.0,
                connection_id = %entry.context.connection_id,
                driver = %entry.context.driver,
                kinds = ?entry.kinds,
                duration_ms = entry.duration_ms,
                row_count = ?entry.row_count,
                affected_rows = ?entry.affected_rows,
                "Query completed"
            ),
            status => tracing::warn!(
                log_id = id.0,
                connection_id = %entry.context.connection_id,
                driver = %entry.context.driver,
                kinds = ?entry.kinds,
                duration_ms = entry.duration_ms,
                status = ?status,
                error_kind = ?entry.error_kind,
                error = entry.error.as_deref().unwrap_or(""),
                "Query did not complete"
            ),
        }
        Ok(id)
    }
}

/// Bounded in-memory history, newest last
pub struct MemoryQueryLogger {
    capacity: usize,
    next_id: AtomicU64,
    entries: Mutex<VecDeque<(LogId, QueryLogEntry)>>,
}

impl MemoryQueryLogger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(0),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn entries(&self) -> Vec<(LogId, QueryLogEntry)> {
        match self.entries.lock() {
            Ok(entries) => entries.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

impl QueryLogger for MemoryQueryLogger {
    fn log_query(&self, entry: &QueryLogEntry) -> Result<LogId, QueryLogError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| QueryLogError::Unavailable("history lock poisoned".into()))?;
        let id = LogId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back((id, entry.clone()));
        Ok(id)
    }
}

/// Forwards to several loggers; the first failure is reported after all ran.
pub struct FanoutQueryLogger {
    loggers: Vec<std::sync::Arc<dyn QueryLogger>>,
}

impl FanoutQueryLogger {
    pub fn new(loggers: Vec<std::sync::Arc<dyn QueryLogger>>) -> Self {
        Self { loggers }
    }
}

impl QueryLogger for FanoutQueryLogger {
    fn log_query(&self, entry: &QueryLogEntry) -> Result<LogId, QueryLogError> {
        let mut id = None;
        let mut failure = None;
        for logger in &self.loggers {
            match logger.log_query(entry) {
                Ok(logged) => {
                    id.get_or_insert(logged);
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(id.unwrap_or(LogId(0))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(text: &str) -> QueryLogEntry {
        QueryLogEntry {
            query_id: QueryId::new(),
            context: ExecutionContext {
                connection_id: ConnectionId::new(),
                driver: "sqlite".into(),
                session: None,
                read_only: false,
            },
            text: text.into(),
            kinds: vec!["SELECT".into()],
            status: QueryStatus::Completed,
            error_kind: None,
            error: None,
            duration_ms: 1.0,
            row_count: Some(1),
            affected_rows: None,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn memory_history_is_bounded_and_ids_increase() {
        let logger = MemoryQueryLogger::new(2);
        let a = logger.log_query(&entry("SELECT 1")).expect("log");
        let b = logger.log_query(&entry("SELECT 2")).expect("log");
        let c = logger.log_query(&entry("SELECT 3")).expect("log");

        assert!(a.0 < b.0 && b.0 < c.0);
        let texts: Vec<String> = logger.entries().into_iter().map(|(_, e)| e.text).collect();
        assert_eq!(texts, vec!["SELECT 2", "SELECT 3"]);
    }

    #[test]
    fn fanout_reaches_every_logger() {
        let first = std::sync::Arc::new(MemoryQueryLogger::new(10));
        let second = std::sync::Arc::new(MemoryQueryLogger::new(10));
        let fanout = FanoutQueryLogger::new(vec![first.clone(), second.clone()]);

        fanout.log_query(&entry("SELECT 1")).expect("log");
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }
}
