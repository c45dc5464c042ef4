//! Query execution pipeline
//!
//! Every statement sent through a connection passes here: classify, gate
//! (read-only and production policy), execute on the adapter or the caller's
//! reserved session, time, log, and normalize the result shape.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Duration};
use tracing::instrument;

use crate::config::SafetyPolicy;
use crate::engine::classifier::{self, StatementClassification};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::query_log::{ExecutionContext, QueryLogEntry, QueryLogger, QueryStatus};
use crate::engine::query_manager::{QueryManager, QueryRegistration};
use crate::engine::session_manager::SessionManager;
use crate::engine::traits::ClientAdapter;
use crate::engine::types::{ConnectionId, QueryId, QueryResult, ResultMode, SessionId, TableChangeSet};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Bypasses read-only gating for this call
    #[serde(default)]
    pub allow_writes: bool,
    pub query_id: Option<QueryId>,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub acknowledged_dangerous: bool,
    /// Run on this session's reserved connection
    pub session: Option<SessionId>,
}

/// Logs the call exactly once, including when the future is dropped.
struct LogGuard {
    logger: Arc<dyn QueryLogger>,
    entry: Option<QueryLogEntry>,
    started: Instant,
}

impl LogGuard {
    fn new(logger: Arc<dyn QueryLogger>, entry: QueryLogEntry) -> Self {
        Self {
            logger,
            entry: Some(entry),
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_micros() as f64 / 1000.0
    }

    fn completed(&mut self, results: &[QueryResult]) {
        let duration_ms = self.elapsed_ms();
        if let Some(entry) = self.entry.as_mut() {
            entry.status = QueryStatus::Completed;
            entry.duration_ms = duration_ms;
            entry.row_count = Some(results.iter().map(|r| r.row_count).sum());
            entry.affected_rows = results.iter().filter_map(|r| r.affected_rows).reduce(|a, b| a + b);
        }
        self.flush();
    }

    fn failed(&mut self, status: QueryStatus, error: &EngineError) {
        let duration_ms = self.elapsed_ms();
        if let Some(entry) = self.entry.as_mut() {
            entry.status = status;
            entry.duration_ms = duration_ms;
            entry.error_kind = Some(error.kind());
            entry.error = Some(error.to_string());
        }
        self.flush();
    }

    fn flush(&mut self) {
        if let Some(entry) = self.entry.take() {
            if let Err(e) = self.logger.log_query(&entry) {
                tracing::warn!("Query logger failed: {}", e);
            }
        }
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if self.entry.is_some() {
            let duration_ms = self.elapsed_ms();
            if let Some(entry) = self.entry.as_mut() {
                entry.status = QueryStatus::Cancelled;
                entry.duration_ms = duration_ms;
            }
            self.flush();
        }
    }
}

pub struct QueryPipeline {
    adapter: Arc<dyn ClientAdapter>,
    sessions: Arc<SessionManager>,
    logger: Arc<dyn QueryLogger>,
    query_manager: Arc<QueryManager>,
    connection_id: ConnectionId,
    read_only: bool,
    is_production: bool,
    policy: SafetyPolicy,
}

impl QueryPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapter: Arc<dyn ClientAdapter>,
        sessions: Arc<SessionManager>,
        logger: Arc<dyn QueryLogger>,
        query_manager: Arc<QueryManager>,
        connection_id: ConnectionId,
        read_only: bool,
        is_production: bool,
        policy: SafetyPolicy,
    ) -> Self {
        Self {
            adapter,
            sessions,
            logger,
            query_manager,
            connection_id,
            read_only,
            is_production,
            policy,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn log_entry(&self, query_id: QueryId, text: &str, kinds: Vec<String>, session: Option<SessionId>) -> QueryLogEntry {
        QueryLogEntry {
            query_id,
            context: ExecutionContext {
                connection_id: self.connection_id,
                driver: self.adapter.driver_id().to_string(),
                session,
                read_only: self.read_only,
            },
            text: text.to_string(),
            kinds,
            status: QueryStatus::Cancelled,
            error_kind: None,
            error: None,
            duration_ms: 0.0,
            row_count: None,
            affected_rows: None,
            started_at: Utc::now(),
        }
    }

    fn gate(&self, classification: &StatementClassification, options: &QueryOptions) -> EngineResult<()> {
        if self.read_only && !options.allow_writes {
            if let Some(kind) = classification.first_write() {
                return Err(EngineError::read_only(kind.as_str()));
            }
        }

        if self.is_production {
            let dangerous = classification.is_dangerous() || classification.parse_error.is_some();
            if dangerous {
                if self.policy.prod_block_dangerous_sql {
                    return Err(EngineError::DangerousQueryBlocked {
                        reason: "blocked by production policy".into(),
                    });
                }
                if self.policy.prod_require_confirmation && !options.acknowledged_dangerous {
                    return Err(EngineError::DangerousQueryBlocked {
                        reason: "confirmation required".into(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Executes `text` and returns its first result set.
    pub async fn execute_single(&self, text: &str, options: QueryOptions) -> EngineResult<QueryResult> {
        let results = self.run(text, options, ResultMode::Single).await?;
        Ok(results.into_iter().next().unwrap_or_else(QueryResult::empty))
    }

    /// Executes `text` and returns one result per statement, in order.
    pub async fn execute_multiple(&self, text: &str, options: QueryOptions) -> EngineResult<Vec<QueryResult>> {
        self.run(text, options, ResultMode::Multiple).await
    }

    #[instrument(
        skip(self, text, options, mode),
        fields(
            connection_id = %self.connection_id,
            driver = self.adapter.driver_id(),
            query_len = text.len(),
            mode = ?mode
        )
    )]
    async fn run(&self, text: &str, options: QueryOptions, mode: ResultMode) -> EngineResult<Vec<QueryResult>> {
        let query_id = options.query_id.unwrap_or_default();
        let classification = classifier::classify(self.adapter.driver_id(), text);
        let kinds = classification.kinds().iter().map(|k| k.as_str().to_string()).collect();
        let mut log = LogGuard::new(
            Arc::clone(&self.logger),
            self.log_entry(query_id, text, kinds, options.session.clone()),
        );

        if let Err(e) = self.gate(&classification, &options) {
            log.failed(QueryStatus::Rejected, &e);
            return Err(e);
        }

        let _registration =
            match QueryRegistration::new(Arc::clone(&self.query_manager), self.connection_id, query_id) {
                Ok(registration) => registration,
                Err(e) => {
                    log.failed(QueryStatus::Rejected, &e);
                    return Err(e);
                }
            };

        let started = Instant::now();
        let execution = async {
            match &options.session {
                Some(session) => self.sessions.execute(session, text, query_id, mode).await,
                None => self.adapter.execute_query(text, query_id, mode).await,
            }
        };

        let outcome = match options.timeout_ms {
            Some(timeout_ms) => match timeout(Duration::from_millis(timeout_ms), execution).await {
                Ok(result) => result,
                Err(_) => {
                    if let Err(e) = self.adapter.cancel(query_id).await {
                        tracing::debug!("Cancel after timeout failed: {}", e);
                    }
                    Err(EngineError::Timeout { timeout_ms })
                }
            },
            None => execution.await,
        };
        let elapsed = started.elapsed().as_micros() as f64 / 1000.0;

        match outcome {
            Ok(mut results) => {
                if results.is_empty() {
                    results.push(QueryResult::empty());
                }
                for result in results.iter_mut() {
                    result.execution_time_ms = elapsed;
                }
                log.completed(&results);
                Ok(results)
            }
            Err(e) => {
                log.failed(QueryStatus::Failed, &e);
                Err(e)
            }
        }
    }

    /// Cancels `query_id`, or the most recent query on this connection.
    pub async fn cancel(&self, query_id: Option<QueryId>) -> EngineResult<QueryId> {
        let query_id = match query_id {
            Some(id) => id,
            None => self
                .query_manager
                .last_for_connection(self.connection_id)
                .ok_or_else(|| EngineError::execution_error("No active query found"))?,
        };
        self.adapter.cancel(query_id).await?;
        Ok(query_id)
    }

    /// Applies a change set through the adapter, gated and logged like a query.
    pub async fn apply_changes(&self, changes: &TableChangeSet, allow_writes: bool) -> EngineResult<Vec<QueryResult>> {
        let text = format!("-- change set: {} operations", changes.operation_count());
        let mut kinds = Vec::new();
        if !changes.inserts.is_empty() {
            kinds.push("INSERT".to_string());
        }
        if !changes.updates.is_empty() {
            kinds.push("UPDATE".to_string());
        }
        if !changes.deletes.is_empty() {
            kinds.push("DELETE".to_string());
        }
        let mut log = LogGuard::new(
            Arc::clone(&self.logger),
            self.log_entry(QueryId::new(), &text, kinds.clone(), None),
        );

        if self.read_only && !allow_writes && !changes.is_empty() {
            let e = EngineError::read_only(kinds.first().map(String::as_str).unwrap_or("CHANGE_SET"));
            log.failed(QueryStatus::Rejected, &e);
            return Err(e);
        }

        match self.adapter.apply_changes(changes).await {
            Ok(snapshots) => {
                log.completed(&snapshots);
                Ok(snapshots)
            }
            Err(e) => {
                log.failed(QueryStatus::Failed, &e);
                Err(e)
            }
        }
    }

    /// Runs a structural operation (alter, drop, truncate, duplicate).
    ///
    /// Read-only connections reject it outright. `dangerous` operations on a
    /// production connection follow the safety policy. `operation` is not
    /// polled when the gate rejects.
    pub async fn run_structural<F>(
        &self,
        text: String,
        kind: &'static str,
        dangerous: bool,
        acknowledged_dangerous: bool,
        operation: F,
    ) -> EngineResult<()>
    where
        F: Future<Output = EngineResult<()>> + Send,
    {
        let mut log = LogGuard::new(
            Arc::clone(&self.logger),
            self.log_entry(QueryId::new(), &text, vec![kind.to_string()], None),
        );

        let rejection = if self.read_only {
            Some(EngineError::read_only(kind))
        } else if self.is_production && dangerous && self.policy.prod_block_dangerous_sql {
            Some(EngineError::DangerousQueryBlocked {
                reason: "blocked by production policy".into(),
            })
        } else if self.is_production && dangerous && self.policy.prod_require_confirmation && !acknowledged_dangerous {
            Some(EngineError::DangerousQueryBlocked {
                reason: "confirmation required".into(),
            })
        } else {
            None
        };
        if let Some(e) = rejection {
            log.failed(QueryStatus::Rejected, &e);
            return Err(e);
        }

        match operation.await {
            Ok(()) => {
                log.completed(&[]);
                Ok(())
            }
            Err(e) => {
                log.failed(QueryStatus::Failed, &e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::query_log::MemoryQueryLogger;
    use crate::engine::testing::{one_row_result, FakeAdapter};
    use std::sync::atomic::Ordering;

    struct Harness {
        adapter: Arc<FakeAdapter>,
        logger: Arc<MemoryQueryLogger>,
        sessions: Arc<SessionManager>,
        pipeline: QueryPipeline,
    }

    fn harness(adapter: FakeAdapter, read_only: bool, is_production: bool, policy: SafetyPolicy) -> Harness {
        let adapter = Arc::new(adapter);
        let logger = Arc::new(MemoryQueryLogger::new(100));
        let sessions = Arc::new(SessionManager::new(adapter.clone()));
        let pipeline = QueryPipeline::new(
            adapter.clone(),
            Arc::clone(&sessions),
            logger.clone(),
            Arc::new(QueryManager::new()),
            ConnectionId::new(),
            read_only,
            is_production,
            policy,
        );
        Harness {
            adapter,
            logger,
            sessions,
            pipeline,
        }
    }

    fn statuses(logger: &MemoryQueryLogger) -> Vec<QueryStatus> {
        logger.entries().into_iter().map(|(_, e)| e.status).collect()
    }

    #[tokio::test]
    async fn read_only_rejects_writes_without_touching_adapter() {
        let h = harness(FakeAdapter::new(), true, false, SafetyPolicy::default());

        let err = h
            .pipeline
            .execute_single("INSERT INTO t VALUES (1)", QueryOptions::default())
            .await
            .expect_err("write must be rejected");

        assert!(matches!(err, EngineError::ReadOnlyViolation { ref kind } if kind == "INSERT"));
        assert_eq!(h.adapter.executions(), 0);
        assert_eq!(statuses(&h.logger), vec![QueryStatus::Rejected]);
    }

    #[tokio::test]
    async fn read_only_rejects_writes_hidden_in_ctes() {
        let h = harness(FakeAdapter::new(), true, false, SafetyPolicy::default());

        let err = h
            .pipeline
            .execute_single(
                "WITH d AS (DELETE FROM users RETURNING *) SELECT * FROM d",
                QueryOptions::default(),
            )
            .await
            .expect_err("a writing CTE must be rejected");

        assert!(matches!(err, EngineError::ReadOnlyViolation { ref kind } if kind == "DELETE"));
        assert_eq!(h.adapter.executions(), 0);
        assert_eq!(statuses(&h.logger), vec![QueryStatus::Rejected]);
    }

    #[tokio::test]
    async fn unparseable_text_counts_as_write_in_read_only_mode() {
        let h = harness(FakeAdapter::new(), true, false, SafetyPolicy::default());

        let err = h
            .pipeline
            .execute_single("SELEC * FROMM t", QueryOptions::default())
            .await
            .expect_err("unknown kind is a write risk");

        assert!(matches!(err, EngineError::ReadOnlyViolation { .. }));
        assert_eq!(h.adapter.executions(), 0);
    }

    #[tokio::test]
    async fn read_only_allows_selects_and_escape_flag() {
        let h = harness(FakeAdapter::new(), true, false, SafetyPolicy::default());

        h.pipeline
            .execute_single("SELECT 1", QueryOptions::default())
            .await
            .expect("select is allowed");
        h.pipeline
            .execute_single(
                "DELETE FROM t WHERE id = 1",
                QueryOptions {
                    allow_writes: true,
                    ..Default::default()
                },
            )
            .await
            .expect("escape flag lets writes through");

        assert_eq!(h.adapter.executions(), 2);
        assert_eq!(statuses(&h.logger), vec![QueryStatus::Completed, QueryStatus::Completed]);
    }

    #[tokio::test]
    async fn single_mode_takes_first_result_and_sets_timing() {
        let mut second = one_row_result();
        second.row_count = 42;
        let h = harness(
            FakeAdapter::with_results(vec![one_row_result(), second]),
            false,
            false,
            SafetyPolicy::default(),
        );

        let result = h
            .pipeline
            .execute_single("SELECT 1; SELECT 2", QueryOptions::default())
            .await
            .expect("execute");
        assert_eq!(result.row_count, 1);
        assert!(result.execution_time_ms >= 0.0);

        let all = h
            .pipeline
            .execute_multiple("SELECT 1; SELECT 2", QueryOptions::default())
            .await
            .expect("execute");
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].row_count, 42);
    }

    #[tokio::test]
    async fn zero_result_sets_become_one_empty_result() {
        let h = harness(FakeAdapter::with_results(Vec::new()), false, false, SafetyPolicy::default());

        let all = h
            .pipeline
            .execute_multiple("SET search_path TO public", QueryOptions::default())
            .await
            .expect("execute");
        assert_eq!(all.len(), 1);
        assert!(all[0].rows.is_empty());
    }

    #[tokio::test]
    async fn execution_errors_pass_through_and_are_logged() {
        let adapter = FakeAdapter::new();
        *adapter.fail_with.lock().unwrap() = Some(EngineError::execution_error("relation \"nope\" does not exist"));
        let h = harness(adapter, false, false, SafetyPolicy::default());

        let err = h
            .pipeline
            .execute_single("SELECT * FROM nope", QueryOptions::default())
            .await
            .expect_err("native error");

        assert_eq!(err.to_string(), "relation \"nope\" does not exist");
        let entries = h.logger.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.status, QueryStatus::Failed);
        assert_eq!(entries[0].1.error.as_deref(), Some("relation \"nope\" does not exist"));
    }

    #[tokio::test]
    async fn timeout_cancels_on_the_adapter() {
        let adapter = FakeAdapter::new();
        *adapter.delay.lock().unwrap() = Some(Duration::from_millis(500));
        let h = harness(adapter, false, false, SafetyPolicy::default());

        let err = h
            .pipeline
            .execute_single(
                "SELECT pg_sleep(1)",
                QueryOptions {
                    timeout_ms: Some(20),
                    ..Default::default()
                },
            )
            .await
            .expect_err("timeout");

        assert!(matches!(err, EngineError::Timeout { timeout_ms: 20 }));
        assert_eq!(h.adapter.counters.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(statuses(&h.logger), vec![QueryStatus::Failed]);
    }

    #[tokio::test]
    async fn dropped_call_is_logged_once_as_cancelled() {
        let adapter = FakeAdapter::new();
        *adapter.delay.lock().unwrap() = Some(Duration::from_millis(500));
        let h = harness(adapter, false, false, SafetyPolicy::default());

        let call = h.pipeline.execute_single("SELECT 1", QueryOptions::default());
        let outcome = timeout(Duration::from_millis(20), call).await;

        assert!(outcome.is_err());
        assert_eq!(statuses(&h.logger), vec![QueryStatus::Cancelled]);
    }

    #[tokio::test]
    async fn production_policy_requires_acknowledgement() {
        let h = harness(FakeAdapter::new(), false, true, SafetyPolicy::default());

        let err = h
            .pipeline
            .execute_single("DROP TABLE users", QueryOptions::default())
            .await
            .expect_err("needs confirmation");
        assert!(matches!(err, EngineError::DangerousQueryBlocked { .. }));
        assert_eq!(h.adapter.executions(), 0);

        h.pipeline
            .execute_single(
                "DROP TABLE users",
                QueryOptions {
                    acknowledged_dangerous: true,
                    ..Default::default()
                },
            )
            .await
            .expect("acknowledged");
        assert_eq!(h.adapter.executions(), 1);
    }

    #[tokio::test]
    async fn blocking_policy_ignores_acknowledgement() {
        let policy = SafetyPolicy {
            prod_require_confirmation: true,
            prod_block_dangerous_sql: true,
        };
        let h = harness(FakeAdapter::new(), false, true, policy);

        let err = h
            .pipeline
            .execute_single(
                "TRUNCATE TABLE users",
                QueryOptions {
                    acknowledged_dangerous: true,
                    ..Default::default()
                },
            )
            .await
            .expect_err("blocked");
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn session_option_routes_to_reserved_connection() {
        let h = harness(FakeAdapter::new(), false, false, SafetyPolicy::default());
        let tab = SessionId::new("tab-1");
        h.sessions.reserve_connection(tab.clone()).await.expect("reserve");

        h.pipeline
            .execute_single(
                "SELECT 1",
                QueryOptions {
                    session: Some(tab),
                    ..Default::default()
                },
            )
            .await
            .expect("execute");

        assert_eq!(h.adapter.executions(), 0);
        assert_eq!(h.adapter.counters.session_executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn read_only_rejects_change_sets() {
        let h = harness(FakeAdapter::new(), true, false, SafetyPolicy::default());
        let changes = TableChangeSet {
            deletes: vec![crate::engine::types::TableDelete {
                table: "t".into(),
                schema: None,
                primary_keys: vec![crate::engine::types::KeyValue::new("id", 1)],
            }],
            ..Default::default()
        };

        let err = h.pipeline.apply_changes(&changes, false).await.expect_err("read-only");
        assert!(matches!(err, EngineError::ReadOnlyViolation { .. }));
    }

    #[tokio::test]
    async fn structural_operations_follow_the_production_policy() {
        let h = harness(FakeAdapter::new(), false, true, SafetyPolicy::default());
        let counter = std::sync::atomic::AtomicUsize::new(0);
        let ran = &counter;
        let op = move || async move {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok::<(), EngineError>(())
        };

        let err = h
            .pipeline
            .run_structural("DROP TABLE users".into(), "DROP", true, false, op())
            .await
            .expect_err("needs confirmation");
        assert!(matches!(err, EngineError::DangerousQueryBlocked { .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        h.pipeline
            .run_structural("DROP TABLE users".into(), "DROP", true, true, op())
            .await
            .expect("acknowledged");
        h.pipeline
            .run_structural("ALTER TABLE users".into(), "ALTER", false, false, op())
            .await
            .expect("not dangerous");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(
            statuses(&h.logger),
            vec![QueryStatus::Rejected, QueryStatus::Completed, QueryStatus::Completed]
        );
    }

    #[tokio::test]
    async fn read_only_rejects_structural_operations() {
        let h = harness(FakeAdapter::new(), true, false, SafetyPolicy::default());
        let err = h
            .pipeline
            .run_structural("ALTER TABLE t".into(), "ALTER", false, true, async { Ok(()) })
            .await
            .expect_err("read-only");
        assert!(matches!(err, EngineError::ReadOnlyViolation { ref kind } if kind == "ALTER"));
    }
}
