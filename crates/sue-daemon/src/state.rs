//! Shared runtime state for sue-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The scheduler task is
//! the only writer of [`StatusSnapshot`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use prometheus::Registry;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// StatusSnapshot
// ---------------------------------------------------------------------------

/// Outcome of the most recent metrics update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastOutcome {
    Published,
    NoNewData,
    Failed,
}

/// Point-in-time view of the exporter, returned by GET /v1/status.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub daemon_uptime_secs: u64,
    /// "idle" | "aggregating"
    pub state: String,
    /// Run date of the inventory currently published.
    pub last_run_date: Option<DateTime<Utc>>,
    pub last_outcome: Option<LastOutcome>,
    pub last_error: Option<String>,
    pub last_update_finished_at: Option<DateTime<Utc>>,
    /// Usage series currently exposed (at most the configured limit).
    pub published_series: usize,
    /// Groups produced by the last aggregation, before the limit.
    pub total_series: usize,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            daemon_uptime_secs: uptime_secs(),
            state: "idle".to_string(),
            last_run_date: None,
            last_outcome: None,
            last_error: None,
            last_update_finished_at: None,
            published_series: 0,
            total_series: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub build: BuildInfo,
    /// Registry rendered by GET /metrics.
    pub registry: Registry,
    pub status: Arc<RwLock<StatusSnapshot>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(Registry::new())
    }
}

impl AppState {
    pub fn new(registry: Registry) -> Self {
        Self {
            build: BuildInfo {
                service: "sue-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            registry,
            status: Arc::new(RwLock::new(StatusSnapshot::default())),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}
