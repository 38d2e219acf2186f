//! Streaming merge of supplier rows into sorted per-group totals.
//!
//! One `aggregate` call:
//! 1. asks the reader for the newest run (or learns there is no new data)
//! 2. drains the row and error channels concurrently, classifying and summing
//! 3. decodes the merge keys and sorts the totals by usage, descending
//!
//! The aggregator keeps no state between calls. The previous run date is
//! owned by the caller and passed in explicitly.

use std::collections::HashMap;
use std::sync::Arc;

use sue_du::{is_newer, DuError, ReadOutcome, Reader, RowStream, RunDate, StorageUsage};
use tracing::{debug, info};

use crate::classify::Classifier;
use crate::labels::{AggregationGroup, AggregationResult, Labels, DELETED};
use crate::rule::AggregationRule;

/// Engine-side row ceiling, matching the local reader's default.
pub const DEFAULT_MAX_ROWS: usize = sue_du::local::DEFAULT_MAX_ROWS;

const PROGRESS_EVERY: usize = 10_000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Construction-time configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("label '{0}' is reserved and cannot be configured")]
    ReservedLabel(String),
}

/// Failures of a single `aggregate` invocation. Partial totals are discarded.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    /// The reader could not determine or open a run.
    #[error("finding inventory run failed: {0}")]
    Discovery(#[source] DuError),

    /// The reader failed mid-stream.
    #[error("reading du rows failed: {0}")]
    Stream(#[source] DuError),

    #[error("du rows count sanity limit of {limit} was reached")]
    RowLimitExceeded { limit: usize },

    #[error("aggregation group key could not be encoded or decoded: {0}")]
    CorruptGroupKey(#[source] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateOutcome {
    /// A strictly newer run was aggregated. `results` is sorted by usage desc.
    Fresh {
        run_date: RunDate,
        results: Vec<AggregationResult>,
    },
    /// The newest run is not after the previous run date. Not an error.
    NoNewData { run_date: RunDate },
}

impl AggregateOutcome {
    pub fn run_date(&self) -> RunDate {
        match self {
            AggregateOutcome::Fresh { run_date, .. } | AggregateOutcome::NoNewData { run_date } => {
                *run_date
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

pub struct Aggregator {
    reader: Arc<dyn Reader>,
    classifier: Classifier,
    max_rows: usize,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("reader", &self.reader.name())
            .field("classifier", &self.classifier)
            .field("max_rows", &self.max_rows)
            .finish()
    }
}

impl Aggregator {
    pub fn new(
        reader: Arc<dyn Reader>,
        labels_with_defaults: Labels,
        rules: Vec<AggregationRule>,
    ) -> Result<Self, AggregatorError> {
        Ok(Self {
            reader,
            classifier: Classifier::new(labels_with_defaults, rules)?,
            max_rows: DEFAULT_MAX_ROWS,
        })
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    /// Configured label names plus [`DELETED`], sorted.
    pub fn label_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .classifier
            .labels_with_defaults()
            .keys()
            .cloned()
            .collect();
        names.push(DELETED.to_string());
        names.sort();
        names
    }

    pub fn storage_account_name(&self) -> String {
        self.reader.storage_account_name()
    }

    pub async fn aggregate(
        &self,
        previous: Option<RunDate>,
    ) -> Result<AggregateOutcome, AggregateError> {
        info!(reader = self.reader.name(), previous = ?previous, "finding newest inventory run");
        let outcome = self
            .reader
            .read(previous)
            .await
            .map_err(AggregateError::Discovery)?;

        let (run_date, stream) = match outcome {
            ReadOutcome::NoNewData { run_date } => {
                info!(run_date = %run_date, "no newer inventory run found");
                return Ok(AggregateOutcome::NoNewData { run_date });
            }
            // A reader streaming a run that is not newer is still stale.
            ReadOutcome::Streaming { run_date, .. } if !is_newer(run_date, previous) => {
                info!(run_date = %run_date, "no newer inventory run found");
                return Ok(AggregateOutcome::NoNewData { run_date });
            }
            ReadOutcome::Streaming { run_date, stream } => (run_date, stream),
        };

        info!(run_date = %run_date, "starting aggregation");
        let totals = self.merge(stream).await?;
        let results = finalize(totals)?;
        info!(run_date = %run_date, groups = results.len(), "done aggregating");

        Ok(AggregateOutcome::Fresh { run_date, results })
    }

    /// Drain both channels until both are closed or an error arrives.
    ///
    /// Returning early drops the stream, which makes the producer's next send
    /// fail and stops it.
    async fn merge(
        &self,
        mut stream: RowStream,
    ) -> Result<HashMap<String, StorageUsage>, AggregateError> {
        let mut totals: HashMap<String, StorageUsage> = HashMap::new();
        let mut rows_open = true;
        let mut errors_open = true;
        let mut processed: usize = 0;

        while rows_open || errors_open {
            tokio::select! {
                row = stream.rows.recv(), if rows_open => match row {
                    Some(row) => {
                        if processed >= self.max_rows {
                            return Err(AggregateError::RowLimitExceeded { limit: self.max_rows });
                        }
                        let key = self
                            .classifier
                            .classify(&row)
                            .canonical_key()
                            .map_err(AggregateError::CorruptGroupKey)?;
                        let total = totals.entry(key).or_insert(0);
                        *total = total.saturating_add(row.bytes);
                        if processed % PROGRESS_EVERY == 0 {
                            info!(processed, "du rows processed so far");
                        }
                        processed += 1;
                    }
                    None => {
                        debug!(processed, "row stream closed");
                        rows_open = false;
                    }
                },
                err = stream.errors.recv(), if errors_open => match err {
                    Some(err) => return Err(AggregateError::Stream(err)),
                    None => errors_open = false,
                },
            }
        }

        info!(processed, groups = totals.len(), "done merging du rows");
        Ok(totals)
    }
}

/// Decode merge keys and sort by usage desc. Ties are ordered by key so the
/// result is identical for identical input.
pub fn finalize(
    totals: HashMap<String, StorageUsage>,
) -> Result<Vec<AggregationResult>, AggregateError> {
    let mut entries: Vec<(String, StorageUsage)> = totals.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries
        .into_iter()
        .map(|(key, storage_usage)| {
            Ok(AggregationResult {
                group: AggregationGroup::from_canonical_key(&key)
                    .map_err(AggregateError::CorruptGroupKey)?,
                storage_usage,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(level1: &str, deleted: bool) -> String {
        let mut labels = Labels::new();
        labels.insert("level1".to_string(), level1.to_string());
        AggregationGroup::new(labels, deleted).canonical_key().unwrap()
    }

    #[test]
    fn finalize_sorts_desc_with_deterministic_ties() {
        let mut totals = HashMap::new();
        totals.insert(key("b", false), 10);
        totals.insert(key("a", false), 10);
        totals.insert(key("c", true), 30);
        totals.insert(key("d", false), 1);

        let results = finalize(totals).unwrap();
        let order: Vec<(&str, bool, u64)> = results
            .iter()
            .map(|r| (r.group.labels["level1"].as_str(), r.group.deleted, r.storage_usage))
            .collect();
        assert_eq!(
            order,
            vec![("c", true, 30), ("a", false, 10), ("b", false, 10), ("d", false, 1)]
        );
    }

    #[test]
    fn finalize_rejects_corrupt_key() {
        let mut totals = HashMap::new();
        totals.insert("not json".to_string(), 1);
        assert!(matches!(
            finalize(totals),
            Err(AggregateError::CorruptGroupKey(_))
        ));
    }

    #[test]
    fn empty_totals_finalize_to_empty_list() {
        assert!(finalize(HashMap::new()).unwrap().is_empty());
    }
}
