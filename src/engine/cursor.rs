//! Streaming cursors
//!
//! A cursor reads a large result forward-only in fixed-size chunks. Every
//! adapter builds its cursor from a [`PageSource`] wrapped in [`PagedCursor`],
//! which owns the state machine: `created -> started -> closed`.

use async_trait::async_trait;
use serde::Serialize;

use crate::engine::error::EngineResult;
use crate::engine::sql::{self, CompiledStatement};
use crate::engine::types::{ColumnInfo, QueryResult, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorPhase {
    Created,
    Started,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CursorState {
    /// Rows handed out so far
    pub position: u64,
    pub chunk_size: usize,
    pub finished: bool,
    pub phase: CursorPhase,
}

#[async_trait]
pub trait StreamingCursor: Send {
    fn state(&self) -> &CursorState;

    /// Known once the first chunk has been fetched.
    fn columns(&self) -> &[ColumnInfo];

    async fn start(&mut self) -> EngineResult<()>;

    /// Next chunk, or an empty vec once exhausted or closed.
    async fn read(&mut self) -> EngineResult<Vec<Row>>;

    async fn close(&mut self) -> EngineResult<()>;

    async fn cancel(&mut self) -> EngineResult<()>;
}

/// Backend half of a cursor
#[async_trait]
pub trait PageSource: Send {
    async fn prepare(&mut self) -> EngineResult<()> {
        Ok(())
    }

    /// Rows `offset..offset + limit`. Sources that keep a server-side
    /// position may ignore `offset`.
    async fn fetch(&mut self, offset: u64, limit: usize) -> EngineResult<QueryResult>;

    async fn release(&mut self) -> EngineResult<()> {
        Ok(())
    }
}

pub struct PagedCursor<S: PageSource> {
    source: S,
    state: CursorState,
    columns: Vec<ColumnInfo>,
    released: bool,
}

impl<S: PageSource> PagedCursor<S> {
    pub fn new(source: S, chunk_size: usize) -> Self {
        Self {
            source,
            state: CursorState {
                position: 0,
                chunk_size: chunk_size.max(1),
                finished: false,
                phase: CursorPhase::Created,
            },
            columns: Vec::new(),
            released: false,
        }
    }

    async fn release_source(&mut self) -> EngineResult<()> {
        if self.released || self.state.phase == CursorPhase::Created {
            self.released = true;
            return Ok(());
        }
        self.released = true;
        self.source.release().await
    }
}

#[async_trait]
impl<S: PageSource> StreamingCursor for PagedCursor<S> {
    fn state(&self) -> &CursorState {
        &self.state
    }

    fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    async fn start(&mut self) -> EngineResult<()> {
        if self.state.phase != CursorPhase::Created {
            return Ok(());
        }
        self.source.prepare().await?;
        self.state.phase = CursorPhase::Started;
        Ok(())
    }

    async fn read(&mut self) -> EngineResult<Vec<Row>> {
        if self.state.phase == CursorPhase::Created {
            self.start().await?;
        }
        if self.state.phase == CursorPhase::Closed || self.state.finished {
            return Ok(Vec::new());
        }

        let chunk = self.source.fetch(self.state.position, self.state.chunk_size).await?;
        if self.columns.is_empty() {
            self.columns = chunk.columns;
        }
        let rows = chunk.rows;
        self.state.position += rows.len() as u64;

        if rows.len() < self.state.chunk_size {
            self.state.finished = true;
            if let Err(e) = self.release_source().await {
                tracing::warn!("Failed to release exhausted cursor: {}", e);
            }
        }
        Ok(rows)
    }

    async fn close(&mut self) -> EngineResult<()> {
        if self.state.phase == CursorPhase::Closed {
            return Ok(());
        }
        let result = self.release_source().await;
        self.state.phase = CursorPhase::Closed;
        result
    }

    async fn cancel(&mut self) -> EngineResult<()> {
        self.close().await
    }
}

/// Executes one parameterized statement; implemented by the SQL pools.
#[async_trait]
pub trait StatementRunner: Send + Sync {
    async fn run(&self, statement: &CompiledStatement) -> EngineResult<QueryResult>;
}

/// Re-issues the base query with `LIMIT/OFFSET` for every chunk
pub struct OffsetPageSource<R: StatementRunner> {
    runner: R,
    base: CompiledStatement,
}

impl<R: StatementRunner> OffsetPageSource<R> {
    pub fn new(runner: R, base: CompiledStatement) -> Self {
        Self { runner, base }
    }
}

#[async_trait]
impl<R: StatementRunner> PageSource for OffsetPageSource<R> {
    async fn fetch(&mut self, offset: u64, limit: usize) -> EngineResult<QueryResult> {
        let page = CompiledStatement {
            sql: sql::paginate(&self.base.sql, offset, limit as u64),
            params: self.base.params.clone(),
            returns_rows: true,
        };
        self.runner.run(&page).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct VecSource {
        rows: Vec<Row>,
        releases: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PageSource for VecSource {
        async fn fetch(&mut self, offset: u64, limit: usize) -> EngineResult<QueryResult> {
            let start = (offset as usize).min(self.rows.len());
            let end = (start + limit).min(self.rows.len());
            let columns = vec![ColumnInfo {
                name: "n".into(),
                data_type: "int".into(),
                nullable: false,
            }];
            Ok(QueryResult::with_rows(columns, self.rows[start..end].to_vec(), 0.0))
        }

        async fn release(&mut self) -> EngineResult<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn source(n: i64, releases: &Arc<AtomicUsize>) -> VecSource {
        VecSource {
            rows: (0..n).map(|i| Row { values: vec![Value::Int(i)] }).collect(),
            releases: Arc::clone(releases),
        }
    }

    #[tokio::test]
    async fn chunks_then_empty_forever() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut cursor = PagedCursor::new(source(6, &releases), 5);

        assert_eq!(cursor.read().await.expect("first").len(), 5);
        assert_eq!(cursor.state().phase, CursorPhase::Started);
        assert_eq!(cursor.read().await.expect("second").len(), 1);
        assert!(cursor.state().finished);
        assert!(cursor.read().await.expect("third").is_empty());
        assert!(cursor.read().await.expect("fourth").is_empty());
        assert_eq!(cursor.state().position, 6);
        assert_eq!(cursor.columns().len(), 1);

        cursor.close().await.expect("close");
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn read_after_close_is_empty() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut cursor = PagedCursor::new(source(20, &releases), 5);

        cursor.start().await.expect("start");
        assert_eq!(cursor.read().await.expect("read").len(), 5);
        cursor.close().await.expect("close");
        cursor.close().await.expect("close is idempotent");

        assert!(cursor.read().await.expect("closed").is_empty());
        assert_eq!(cursor.state().phase, CursorPhase::Closed);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_before_start_releases_nothing() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut cursor = PagedCursor::new(source(3, &releases), 2);

        cursor.cancel().await.expect("cancel");
        assert!(cursor.read().await.expect("read").is_empty());
        assert_eq!(releases.load(Ordering::SeqCst), 0);
    }
}
