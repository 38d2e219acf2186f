//! Blob-inventory reports read from a local (or mounted) directory tree.
//!
//! Layout under `<root>/<container>`:
//!
//! ```text
//! 2024/04/20/01-23-45/<rule-name>/<prefix>_<n>_<n>.csv
//! ```
//!
//! Each CSV file lists one object per record. Only three columns are read
//! (case-sensitive, order-independent, extra columns ignored):
//!
//! | Column           | Example                 | Notes                        |
//! |------------------|-------------------------|------------------------------|
//! | `Name`           | `data/x/y/file.tif`     | object name, `/`-separated   |
//! | `Content-Length` | `12345`                 | empty = 0                    |
//! | `Deleted`        | `true` / `false` / ``   | optional; empty = unknown    |
//!
//! Objects are grouped to at most `depth` directory levels (the file name is
//! stripped) on a blocking thread, and the grouped rows are streamed to the
//! consumer in descending byte order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::run::{self, format_run_date};
use crate::{
    is_newer, row_channel, spawn_blocking_producer, DuError, ReadOutcome, Reader, Row, RowSink,
    RunDate, StorageUsage, UNKNOWN_STORAGE_ACCOUNT,
};

/// 10 million. If breached, consider a lower `depth`.
pub const DEFAULT_MAX_ROWS: usize = 10_000_000;
/// Aggregate object usage 4 dirs deep.
pub const DEFAULT_DEPTH: usize = 4;
pub const DEFAULT_ROW_BUFFER: usize = DEFAULT_MAX_ROWS / 100;
pub const DEFAULT_CONTAINER: &str = "blob-inventory";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalInventoryConfig {
    /// Directory holding the inventory container(s).
    pub root: PathBuf,
    #[serde(default = "default_container")]
    pub container: String,
    /// Overrides the account name derived from `root`.
    #[serde(default)]
    pub storage_account: Option<String>,
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_row_buffer")]
    pub row_buffer: usize,
}

fn default_container() -> String {
    DEFAULT_CONTAINER.to_string()
}

fn default_depth() -> usize {
    DEFAULT_DEPTH
}

fn default_max_rows() -> usize {
    DEFAULT_MAX_ROWS
}

fn default_row_buffer() -> usize {
    DEFAULT_ROW_BUFFER
}

impl LocalInventoryConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            container: default_container(),
            storage_account: None,
            depth: DEFAULT_DEPTH,
            max_rows: DEFAULT_MAX_ROWS,
            row_buffer: DEFAULT_ROW_BUFFER,
        }
    }

    pub fn container_dir(&self) -> PathBuf {
        self.root.join(&self.container)
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LocalInventoryReader {
    config: LocalInventoryConfig,
}

impl LocalInventoryReader {
    pub fn new(config: LocalInventoryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LocalInventoryConfig {
        &self.config
    }

    async fn list_artifacts(&self) -> Result<Vec<String>, DuError> {
        let dir = self.config.container_dir();
        tokio::task::spawn_blocking(move || list_relative_files(&dir))
            .await
            .map_err(|e| DuError::Task(e.to_string()))?
    }
}

#[async_trait::async_trait]
impl Reader for LocalInventoryReader {
    fn name(&self) -> &'static str {
        "local-inventory"
    }

    fn storage_account_name(&self) -> String {
        if let Some(account) = self.config.storage_account.as_deref() {
            if !account.is_empty() {
                return account.to_string();
            }
        }
        self.config
            .root
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .unwrap_or(UNKNOWN_STORAGE_ACCOUNT)
            .to_string()
    }

    async fn test_connection(&self) -> Result<(), DuError> {
        let dir = self.config.container_dir();
        tokio::fs::read_dir(&dir)
            .await
            .map(|_| ())
            .map_err(|source| DuError::Io { path: dir, source })
    }

    async fn read(&self, previous: Option<RunDate>) -> Result<ReadOutcome, DuError> {
        info!("finding newest inventory run");
        let names = self.list_artifacts().await?;
        let runs = run::find_runs(&names)?;
        let run_date = run::last_run_date(&runs).ok_or(DuError::NoRunFound)?;
        if !is_newer(run_date, previous) {
            return Ok(ReadOutcome::NoNewData { run_date });
        }
        info!(
            run_date = %run_date,
            rules = ?runs.get(&run_date),
            "found newest inventory run"
        );

        let container_dir = self.config.container_dir();
        let files: Vec<PathBuf> = run::files_for_run(&names, run_date)
            .into_iter()
            .filter(|name| {
                let is_csv = name.ends_with(".csv");
                if !is_csv {
                    warn!(file = %name, "skipping inventory file that is not csv");
                }
                is_csv
            })
            .map(|name| container_dir.join(name))
            .collect();

        let (sink, stream) = row_channel(self.config.row_buffer);
        let depth = self.config.depth;
        let max_rows = self.config.max_rows;
        debug!(
            run = %format_run_date(run_date),
            files = files.len(),
            depth,
            "start reading inventory report (might take a while)"
        );
        spawn_blocking_producer(sink, move |sink| {
            read_rows_from_inventory_report(&files, depth, max_rows, sink)
        });

        Ok(ReadOutcome::Streaming { run_date, stream })
    }
}

// ---------------------------------------------------------------------------
// Producer (runs on a blocking thread)
// ---------------------------------------------------------------------------

fn read_rows_from_inventory_report(
    files: &[PathBuf],
    depth: usize,
    max_rows: usize,
    sink: RowSink,
) {
    let rows = match group_by_dir(files, depth, max_rows) {
        Ok(rows) => rows,
        Err(err) => return sink.blocking_fail(err),
    };

    let total = rows.len();
    for (i, row) in rows.into_iter().enumerate() {
        if !sink.blocking_send(row) {
            debug!(sent = i, "consumer went away; stop reading inventory");
            return;
        }
    }
    info!(rows = total, "done reading inventory report");
}

#[derive(Debug, Deserialize)]
struct InventoryRecord {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Content-Length", default)]
    content_length: Option<u64>,
    #[serde(rename = "Deleted", default)]
    deleted: Option<bool>,
}

/// Group all objects in `files` by (dir prefix, deleted), sorted by bytes desc.
///
/// Fails as soon as more than `max_rows` groups exist; the remaining
/// records are not read.
pub fn group_by_dir(
    files: &[PathBuf],
    depth: usize,
    max_rows: usize,
) -> Result<Vec<Row>, DuError> {
    let mut groups: HashMap<(String, Option<bool>), (StorageUsage, u64)> = HashMap::new();

    for path in files {
        let mut rdr = csv::Reader::from_path(path).map_err(|source| DuError::Csv {
            path: path.clone(),
            source,
        })?;
        for rec in rdr.deserialize::<InventoryRecord>() {
            let rec = rec.map_err(|source| DuError::Csv {
                path: path.clone(),
                source,
            })?;
            let entry = groups
                .entry((dir_prefix(&rec.name, depth), rec.deleted))
                .or_insert((0, 0));
            entry.0 = entry.0.saturating_add(rec.content_length.unwrap_or(0));
            entry.1 += 1;
            if groups.len() > max_rows {
                return Err(DuError::RowLimitExceeded {
                    count: groups.len(),
                    limit: max_rows,
                });
            }
        }
    }

    let mut rows: Vec<Row> = groups
        .into_iter()
        .map(|((dir, deleted), (bytes, count))| Row {
            dir,
            deleted,
            bytes,
            count,
        })
        .collect();
    rows.sort_by(|a, b| {
        b.bytes
            .cmp(&a.bytes)
            .then_with(|| a.dir.cmp(&b.dir))
            .then_with(|| a.deleted.cmp(&b.deleted))
    });
    Ok(rows)
}

/// First `depth` directory components of an object name, file name stripped.
///
/// `dir_prefix("a/b/c/d/e/f.txt", 4) == "a/b/c/d"`, `dir_prefix("f.txt", 4) == ""`.
pub fn dir_prefix(name: &str, depth: usize) -> String {
    let mut parts: Vec<&str> = name.split('/').collect();
    parts.pop();
    parts.truncate(depth);
    parts.join("/")
}

fn list_relative_files(dir: &Path) -> Result<Vec<String>, DuError> {
    let mut out = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current).map_err(|source| DuError::Io {
            path: current.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| DuError::Io {
                path: current.clone(),
                source,
            })?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|source| DuError::Io {
                path: path.clone(),
                source,
            })?;
            if file_type.is_dir() {
                pending.push(path);
            } else if let Ok(rel) = path.strip_prefix(dir) {
                let name: Option<Vec<&str>> =
                    rel.components().map(|c| c.as_os_str().to_str()).collect();
                match name {
                    Some(parts) => out.push(parts.join("/")),
                    None => warn!(path = %path.display(), "skipping non-utf8 inventory entry"),
                }
            }
        }
    }
    out.sort();
    Ok(out)
}
