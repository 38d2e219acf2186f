//! Single-flight update loop.
//!
//! One task owns the [`MetricsUpdater`] and awaits every update inline, so
//! two updates never overlap. Ticks that fall due while an update is still
//! running are delayed, not queued. The first update runs immediately.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::metrics::{MetricsUpdater, UpdateOutcome};
use crate::state::{AppState, LastOutcome};

pub fn spawn_scheduler(
    updater: MetricsUpdater,
    state: Arc<AppState>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_scheduler(updater, state, interval, shutdown))
}

pub async fn run_scheduler(
    mut updater: MetricsUpdater,
    state: Arc<AppState>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = interval.as_secs(), "metrics scheduler started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            // a dropped sender also means stop
            _ = shutdown.changed() => break,
        }
        run_once(&mut updater, &state).await;
    }

    info!("metrics scheduler stopped");
}

/// One update, with the status snapshot kept in step.
pub async fn run_once(updater: &mut MetricsUpdater, state: &AppState) {
    {
        let mut st = state.status.write().await;
        st.state = "aggregating".to_string();
    }

    let result = updater.update_prom_metrics().await;

    let mut st = state.status.write().await;
    st.state = "idle".to_string();
    st.last_update_finished_at = Some(Utc::now());
    match result {
        Ok(UpdateOutcome::Published {
            run_date,
            published,
            total,
        }) => {
            st.last_outcome = Some(LastOutcome::Published);
            st.last_error = None;
            st.last_run_date = Some(run_date);
            st.published_series = published;
            st.total_series = total;
        }
        Ok(UpdateOutcome::NoNewData { .. }) => {
            st.last_outcome = Some(LastOutcome::NoNewData);
            st.last_error = None;
        }
        Err(err) => {
            let msg = format!("{err:#}");
            error!(error = %msg, "error updating metrics");
            st.last_outcome = Some(LastOutcome::Failed);
            st.last_error = Some(msg);
        }
    }
}
