//! In-memory adapter used by unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::capabilities::Capabilities;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::lifecycle::LifecycleCell;
use crate::engine::traits::{ClientAdapter, ReservedConnection};
use crate::engine::types::{
    ColumnInfo, ConnectionState, QueryId, QueryResult, ResultMode, Row, TableColumn, TableOrView, Value,
};

#[derive(Default)]
pub struct FakeCounters {
    pub executions: AtomicUsize,
    pub reservations: AtomicUsize,
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub cancels: AtomicUsize,
    pub session_executions: AtomicUsize,
}

pub struct FakeAdapter {
    pub counters: Arc<FakeCounters>,
    lifecycle: LifecycleCell,
    /// Result sets returned by `execute_query`
    pub results: Mutex<Vec<QueryResult>>,
    pub fail_with: Mutex<Option<EngineError>>,
    pub delay: Mutex<Option<Duration>>,
    pub fail_reserve: AtomicBool,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(FakeCounters::default()),
            lifecycle: LifecycleCell::new(),
            results: Mutex::new(vec![one_row_result()]),
            fail_with: Mutex::new(None),
            delay: Mutex::new(None),
            fail_reserve: AtomicBool::new(false),
        }
    }

    pub fn with_results(results: Vec<QueryResult>) -> Self {
        let adapter = Self::new();
        *adapter.results.lock().unwrap() = results;
        adapter
    }

    pub fn executions(&self) -> usize {
        self.counters.executions.load(Ordering::SeqCst)
    }
}

pub fn one_row_result() -> QueryResult {
    QueryResult::with_rows(
        vec![ColumnInfo {
            name: "n".into(),
            data_type: "integer".into(),
            nullable: false,
        }],
        vec![Row { values: vec![Value::Int(1)] }],
        0.0,
    )
}

#[async_trait]
impl ClientAdapter for FakeAdapter {
    fn driver_id(&self) -> &'static str {
        "postgres"
    }

    fn driver_name(&self) -> &'static str {
        "Fake"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::MINIMAL
    }

    fn state(&self) -> ConnectionState {
        self.lifecycle.get()
    }

    async fn connect(&self) -> EngineResult<()> {
        if let Some(guard) = self.lifecycle.begin_connect()? {
            guard.complete();
        }
        Ok(())
    }

    async fn disconnect(&self) -> EngineResult<()> {
        self.lifecycle.set_disconnected();
        Ok(())
    }

    async fn ping(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn list_tables(&self, _schema: Option<&str>) -> EngineResult<Vec<TableOrView>> {
        Ok(Vec::new())
    }

    async fn list_table_columns(&self, _table: &str, _schema: Option<&str>) -> EngineResult<Vec<TableColumn>> {
        Ok(Vec::new())
    }

    async fn execute_query(
        &self,
        _query: &str,
        _query_id: QueryId,
        _mode: ResultMode,
    ) -> EngineResult<Vec<QueryResult>> {
        self.counters.executions.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.results.lock().unwrap().clone())
    }

    async fn cancel(&self, _query_id: QueryId) -> EngineResult<()> {
        self.counters.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reserve_connection(&self) -> EngineResult<Box<dyn ReservedConnection>> {
        if self.fail_reserve.load(Ordering::SeqCst) {
            return Err(EngineError::connection_failed("pool exhausted"));
        }
        self.counters.reservations.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeReserved {
            counters: Arc::clone(&self.counters),
            in_transaction: false,
        }))
    }
}

pub struct FakeReserved {
    counters: Arc<FakeCounters>,
    in_transaction: bool,
}

#[async_trait]
impl ReservedConnection for FakeReserved {
    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn begin(&mut self) -> EngineResult<()> {
        if self.in_transaction {
            return Err(EngineError::transaction_error("Transaction already active"));
        }
        self.counters.begins.fetch_add(1, Ordering::SeqCst);
        self.in_transaction = true;
        Ok(())
    }

    async fn execute(
        &mut self,
        _query: &str,
        _query_id: QueryId,
        _mode: ResultMode,
    ) -> EngineResult<Vec<QueryResult>> {
        self.counters.session_executions.fetch_add(1, Ordering::SeqCst);
        Ok(vec![one_row_result()])
    }

    async fn commit(self: Box<Self>) -> EngineResult<()> {
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> EngineResult<()> {
        self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
