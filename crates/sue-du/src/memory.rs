//! In-memory [`Reader`] with scripted rows and failure injection.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{is_newer, row_channel, DuError, ReadOutcome, Reader, Row, RunDate};

const MEMORY_ROW_BUFFER: usize = 16;

/// Streams a fixed set of rows for a fixed run date.
///
/// Every `read` with a strictly older previous run date replays all rows from
/// a fresh producer task, so the same reader can back repeated invocations.
#[derive(Debug, Default)]
pub struct MemoryReader {
    run_date: Option<RunDate>,
    rows: Vec<Row>,
    fail_on_start: Option<String>,
    fail_after: Option<(usize, String)>,
    reads: AtomicUsize,
}

impl MemoryReader {
    /// `None` behaves like a backend in which no run was ever found.
    pub fn new(run_date: Option<RunDate>) -> Self {
        Self {
            run_date,
            ..Self::default()
        }
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = rows;
        self
    }

    /// Fail `read` itself, before any streaming starts.
    pub fn failing_on_start(mut self, msg: impl Into<String>) -> Self {
        self.fail_on_start = Some(msg.into());
        self
    }

    /// Stream the first `rows` rows, then deliver a terminal error.
    pub fn failing_after(mut self, rows: usize, msg: impl Into<String>) -> Self {
        self.fail_after = Some((rows, msg.into()));
        self
    }

    /// Number of `read` calls that started a stream.
    pub fn streams_started(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Reader for MemoryReader {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn storage_account_name(&self) -> String {
        "memory".to_string()
    }

    async fn read(&self, previous: Option<RunDate>) -> Result<ReadOutcome, DuError> {
        if let Some(msg) = &self.fail_on_start {
            return Err(DuError::Other(msg.clone()));
        }
        let run_date = self.run_date.ok_or(DuError::NoRunFound)?;
        if !is_newer(run_date, previous) {
            return Ok(ReadOutcome::NoNewData { run_date });
        }
        self.reads.fetch_add(1, Ordering::SeqCst);

        let (sink, stream) = row_channel(MEMORY_ROW_BUFFER);
        let (rows, failure) = match &self.fail_after {
            Some((n, msg)) => (
                self.rows.iter().take(*n).cloned().collect::<Vec<_>>(),
                Some(msg.clone()),
            ),
            None => (self.rows.clone(), None),
        };
        tokio::spawn(async move {
            for row in rows {
                if !sink.send(row).await {
                    return;
                }
            }
            if let Some(msg) = failure {
                sink.fail(DuError::Other(msg)).await;
            }
        });

        Ok(ReadOutcome::Streaming { run_date, stream })
    }
}
