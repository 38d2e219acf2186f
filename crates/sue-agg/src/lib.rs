//! sue-agg
//!
//! Inventory aggregation engine.
//!
//! Turns the coarse du rows streamed by a [`sue_du::Reader`] into a small,
//! deterministically ordered list of labeled storage totals:
//! - [`classify`]: ordered first-match regex rules with default fallback
//! - [`aggregator`]: streaming merge into per-group totals, then sort desc
//!
//! Cardinality capping is left to the caller (the metrics updater); the
//! returned list is fully sorted so truncation yields the top-N by usage.

pub mod aggregator;
pub mod classify;
pub mod labels;
pub mod rule;

pub use aggregator::{AggregateError, AggregateOutcome, Aggregator, AggregatorError};
pub use classify::Classifier;
pub use labels::{deserialize_labels, AggregationGroup, AggregationResult, Labels, DELETED};
pub use rule::{AggregationRule, Pattern};
pub use sue_du::{RunDate, StorageUsage};
