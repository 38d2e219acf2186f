//! sue-du
//!
//! The link between a storage backend and "du" (disk usage) data.
//!
//! This crate owns the supplier abstraction ([`Reader`]), the raw [`Row`]
//! type it streams, run discovery ([`run`]) and the concrete suppliers:
//! - [`local::LocalInventoryReader`]: blob-inventory reports on a filesystem
//! - [`memory::MemoryReader`]: scripted rows for tests and demos
//!
//! It does **not** classify or merge rows; that is `sue-agg`.

pub mod local;
pub mod memory;
pub mod run;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Storage usage/size in bytes.
pub type StorageUsage = u64;

/// Identifies one completed inventory run.
pub type RunDate = DateTime<Utc>;

/// Returned by [`Reader::storage_account_name`] when nothing better is known.
pub const UNKNOWN_STORAGE_ACCOUNT: &str = "_unknown";

// ---------------------------------------------------------------------------
// Row
// ---------------------------------------------------------------------------

/// Aggregated size of a specific dir (or prefix if you will) in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub dir: String,
    /// `None` when the backend does not report soft-deletion state.
    pub deleted: Option<bool>,
    pub bytes: StorageUsage,
    /// Number of objects under `dir`. Informational only.
    pub count: u64,
}

impl Row {
    pub fn new(dir: impl Into<String>, deleted: Option<bool>, bytes: StorageUsage) -> Self {
        Self {
            dir: dir.into(),
            deleted,
            bytes,
            count: 0,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors a [`Reader`] may return up front or push through [`RowStream::errors`].
#[derive(Debug, thiserror::Error)]
pub enum DuError {
    #[error("no run date found")]
    NoRunFound,

    #[error("artifact '{name}' has an unparseable run date: {source}")]
    InvalidRunDate {
        name: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("io error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("csv error in '{}': {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("du rows count sanity limit was reached ({count} > {limit})")]
    RowLimitExceeded { count: usize, limit: usize },

    #[error("reader task failed: {0}")]
    Task(String),

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Streaming contract
// ---------------------------------------------------------------------------

/// Consumer half of a supplier's output.
///
/// `rows` yields rows until the producer drops its sender. `errors` yields at
/// most one terminal error before closing, or closes empty on success. The two
/// close independently; consumers must drain both.
#[derive(Debug)]
pub struct RowStream {
    pub rows: mpsc::Receiver<Row>,
    pub errors: mpsc::Receiver<DuError>,
}

/// Producer half matching a [`RowStream`].
///
/// Dropping the sink closes both channels. Sends fail once the consumer has
/// dropped its stream; producers treat that as cancellation.
#[derive(Debug, Clone)]
pub struct RowSink {
    rows: mpsc::Sender<Row>,
    errors: mpsc::Sender<DuError>,
}

/// Create a bounded row channel (capacity `row_buffer`) plus its error channel.
pub fn row_channel(row_buffer: usize) -> (RowSink, RowStream) {
    let (rows_tx, rows_rx) = mpsc::channel(row_buffer.max(1));
    let (errors_tx, errors_rx) = mpsc::channel(1);
    (
        RowSink {
            rows: rows_tx,
            errors: errors_tx,
        },
        RowStream {
            rows: rows_rx,
            errors: errors_rx,
        },
    )
}

impl RowSink {
    /// Returns `false` when the consumer is gone.
    pub async fn send(&self, row: Row) -> bool {
        self.rows.send(row).await.is_ok()
    }

    /// Blocking variant for producers running on `spawn_blocking` threads.
    pub fn blocking_send(&self, row: Row) -> bool {
        self.rows.blocking_send(row).is_ok()
    }

    /// Deliver the terminal error and close the sink.
    pub async fn fail(self, err: DuError) {
        let _ = self.errors.send(err).await;
    }

    /// Blocking variant of [`RowSink::fail`].
    pub fn blocking_fail(self, err: DuError) {
        let _ = self.errors.blocking_send(err);
    }
}

/// Run a blocking producer on the blocking pool.
///
/// A panicking producer would otherwise just drop its sink, which the
/// consumer cannot tell apart from a complete stream. The join error is
/// forwarded as [`DuError::Task`] instead.
pub fn spawn_blocking_producer<F>(sink: RowSink, produce: F)
where
    F: FnOnce(RowSink) + Send + 'static,
{
    let watcher = sink.clone();
    let handle = tokio::task::spawn_blocking(move || produce(sink));
    tokio::spawn(async move {
        if let Err(err) = handle.await {
            watcher.fail(DuError::Task(err.to_string())).await;
        }
    });
}

/// Result of [`Reader::read`].
#[derive(Debug)]
pub enum ReadOutcome {
    /// The newest run is not after the previous run date.
    NoNewData { run_date: RunDate },
    /// A newer run was found and its rows are being streamed.
    Streaming { run_date: RunDate, stream: RowStream },
}

impl ReadOutcome {
    pub fn run_date(&self) -> RunDate {
        match self {
            ReadOutcome::NoNewData { run_date } | ReadOutcome::Streaming { run_date, .. } => {
                *run_date
            }
        }
    }
}

/// `true` when `run_date` is strictly after `previous` (or nothing ran before).
pub fn is_newer(run_date: RunDate, previous: Option<RunDate>) -> bool {
    previous.map_or(true, |prev| run_date > prev)
}

// ---------------------------------------------------------------------------
// Reader trait
// ---------------------------------------------------------------------------

/// Provides [`Row`]s from a storage provider.
///
/// The run date indicates the actuality of the data. Implementations must
/// determine it with the policy in [`run`] (newest matched artifact date) and
/// must report [`ReadOutcome::NoNewData`] when it is not strictly after
/// `previous`.
#[async_trait::async_trait]
pub trait Reader: Send + Sync {
    /// Short identifier used in logs (e.g. `"local-inventory"`).
    fn name(&self) -> &'static str;

    /// Storage account the data belongs to, used as a constant metric label.
    fn storage_account_name(&self) -> String {
        UNKNOWN_STORAGE_ACCOUNT.to_string()
    }

    /// Cheap reachability check run once at startup.
    async fn test_connection(&self) -> Result<(), DuError> {
        Ok(())
    }

    async fn read(&self, previous: Option<RunDate>) -> Result<ReadOutcome, DuError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn absent_deleted_flag_reads_as_false() {
        assert!(!Row::new("a", None, 1).is_deleted());
        assert!(Row::new("a", Some(true), 1).is_deleted());
    }

    #[test]
    fn newer_is_strict() {
        let d = Utc.with_ymd_and_hms(2024, 4, 20, 0, 0, 0).unwrap();
        assert!(is_newer(d, None));
        assert!(!is_newer(d, Some(d)));
        assert!(is_newer(d, Some(d - chrono::Duration::seconds(1))));
        assert!(!is_newer(d, Some(d + chrono::Duration::seconds(1))));
    }

    #[test]
    fn row_limit_error_mentions_limit() {
        let err = DuError::RowLimitExceeded {
            count: 11,
            limit: 10,
        };
        assert_eq!(
            err.to_string(),
            "du rows count sanity limit was reached (11 > 10)"
        );
    }

    #[tokio::test]
    async fn panicking_producer_surfaces_task_error() {
        let (sink, mut stream) = row_channel(4);
        spawn_blocking_producer(sink, |sink| {
            assert!(sink.blocking_send(Row::new("x", None, 1)));
            panic!("producer blew up");
        });
        assert_eq!(stream.rows.recv().await, Some(Row::new("x", None, 1)));
        assert!(stream.rows.recv().await.is_none());
        let err = stream.errors.recv().await.expect("task error delivered");
        assert!(matches!(err, DuError::Task(_)), "{err}");
    }

    #[tokio::test]
    async fn finished_producer_closes_stream_without_error() {
        let (sink, mut stream) = row_channel(4);
        spawn_blocking_producer(sink, |sink| {
            sink.blocking_send(Row::new("x", None, 1));
        });
        assert_eq!(stream.rows.recv().await, Some(Row::new("x", None, 1)));
        assert!(stream.rows.recv().await.is_none());
        assert!(stream.errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_sink_closes_both_channels() {
        let (sink, mut stream) = row_channel(4);
        assert!(sink.send(Row::new("x", None, 3)).await);
        drop(sink);
        assert_eq!(stream.rows.recv().await, Some(Row::new("x", None, 3)));
        assert!(stream.rows.recv().await.is_none());
        assert!(stream.errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_reports_gone_consumer() {
        let (sink, stream) = row_channel(1);
        drop(stream);
        assert!(!sink.send(Row::new("x", None, 3)).await);
    }
}
