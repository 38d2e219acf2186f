//! Publishes aggregation results as Prometheus gauges.
//!
//! The updater owns the previous run date. It only advances after a fresh
//! run has been published; `NoNewData` and failures leave both the gauges
//! and the baseline as they were.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{Gauge, GaugeVec, Opts, Registry};
use sue_agg::{AggregateOutcome, Aggregator, AggregationResult, RunDate};
use sue_config::MetricsConfig;
use tracing::info;

pub const STORAGE_ACCOUNT_LABEL: &str = "storage_account";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Published {
        run_date: RunDate,
        published: usize,
        total: usize,
    },
    NoNewData {
        run_date: RunDate,
    },
}

pub struct MetricsUpdater {
    aggregator: Arc<Aggregator>,
    usage_gauge: GaugeVec,
    last_run_date_gauge: Gauge,
    last_run_date: Option<RunDate>,
    limit: usize,
}

impl MetricsUpdater {
    /// Creates both gauges and registers them with `registry`.
    pub fn new(
        aggregator: Arc<Aggregator>,
        config: &MetricsConfig,
        registry: &Registry,
    ) -> Result<Self> {
        let label_names = aggregator.label_names();
        let label_refs: Vec<&str> = label_names.iter().map(String::as_str).collect();

        let usage_gauge = GaugeVec::new(
            Opts::new("usage", "Storage usage in bytes per aggregation group")
                .namespace(config.metric_namespace.as_str())
                .subsystem(config.metric_subsystem.as_str()),
            &label_refs,
        )
        .context("usage gauge definition is invalid")?;

        let last_run_date_gauge = Gauge::with_opts(
            Opts::new(
                "last_run_date",
                "Date of the inventory run behind the published usage, as unix seconds",
            )
            .namespace(config.metric_namespace.as_str())
            .subsystem(config.metric_subsystem.as_str())
            .const_label(STORAGE_ACCOUNT_LABEL.to_string(), aggregator.storage_account_name()),
        )
        .context("last run date gauge definition is invalid")?;

        registry
            .register(Box::new(usage_gauge.clone()))
            .context("registering usage gauge failed")?;
        registry
            .register(Box::new(last_run_date_gauge.clone()))
            .context("registering last run date gauge failed")?;

        Ok(Self {
            aggregator,
            usage_gauge,
            last_run_date_gauge,
            last_run_date: None,
            limit: config.limit,
        })
    }

    pub fn last_run_date(&self) -> Option<RunDate> {
        self.last_run_date
    }

    pub async fn update_prom_metrics(&mut self) -> Result<UpdateOutcome> {
        info!(previous = ?self.last_run_date, "start updating metrics");
        let outcome = self
            .aggregator
            .aggregate(self.last_run_date)
            .await
            .context("aggregating storage usage failed")?;

        match outcome {
            AggregateOutcome::NoNewData { run_date } => {
                info!(run_date = %run_date, "no newer blob inventory run found");
                Ok(UpdateOutcome::NoNewData { run_date })
            }
            AggregateOutcome::Fresh { run_date, results } => {
                let published = self.publish(run_date, &results)?;
                self.last_run_date = Some(run_date);
                info!(run_date = %run_date, published, "done updating metrics");
                Ok(UpdateOutcome::Published {
                    run_date,
                    published,
                    total: results.len(),
                })
            }
        }
    }

    fn publish(&self, run_date: RunDate, results: &[AggregationResult]) -> Result<usize> {
        if results.len() > self.limit {
            info!(
                limit = self.limit,
                total = results.len(),
                "metrics count will be limited"
            );
        }

        self.usage_gauge.reset();
        for result in results.iter().take(self.limit) {
            let metric_labels = result.group.metric_labels();
            let labels: HashMap<&str, &str> = metric_labels
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            self.usage_gauge
                .get_metric_with(&labels)
                .context("usage labels do not match the gauge")?
                // precision loss only affects the least significant digits
                .set(result.storage_usage as f64);
        }
        self.last_run_date_gauge.set(unix_seconds(run_date));

        Ok(results.len().min(self.limit))
    }
}

fn unix_seconds(run_date: RunDate) -> f64 {
    run_date.timestamp() as f64 + f64::from(run_date.timestamp_subsec_nanos()) / 1e9
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn unix_seconds_keeps_fraction() {
        let d = Utc.with_ymd_and_hms(2024, 4, 20, 0, 0, 0).unwrap()
            + chrono::Duration::milliseconds(500);
        assert_eq!(unix_seconds(d), 1_713_571_200.5);
    }
}
