//! In-process scenario tests for sue-daemon HTTP endpoints.
//!
//! The router is driven via `tower::ServiceExt::oneshot`; no socket is bound.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{Request, StatusCode};
use chrono::{TimeZone, Utc};
use http_body_util::BodyExt;
use prometheus::Registry;
use sue_agg::{AggregationRule, Aggregator, Labels, Pattern};
use sue_config::MetricsConfig;
use sue_daemon::{metrics::MetricsUpdater, routes, scheduler, state};
use sue_du::memory::MemoryReader;
use sue_du::Row;
use tokio::sync::watch;
use tower::ServiceExt; // oneshot

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn make_updater(reader: MemoryReader, registry: &Registry) -> MetricsUpdater {
    let aggregator = Aggregator::new(
        Arc::new(reader),
        labels(&[("level1", "default1"), ("level2", "default2")]),
        vec![
            AggregationRule::new(
                Pattern::new(r"^(?<level1>special)(/|$)").unwrap(),
                labels(&[("level2", "sauce")]),
            ),
            AggregationRule::new(
                Pattern::new(r"^(?<level1>[^/]+)/(?<level2>[^/]+)").unwrap(),
                Labels::new(),
            ),
        ],
    )
    .unwrap();
    MetricsUpdater::new(Arc::new(aggregator), &MetricsConfig::default(), registry).unwrap()
}

fn scenario_reader() -> MemoryReader {
    MemoryReader::new(Some(Utc.with_ymd_and_hms(2024, 4, 20, 0, 0, 0).unwrap())).with_rows(vec![
        Row::new("dir1/dir2", Some(false), 100),
        Row::new("unallocatable", Some(false), 666),
        Row::new("dir1/dir2", Some(true), 200),
        Row::new("special/delivery", Some(false), 321),
    ])
}

/// Drive the router with a single GET and return (status, body_bytes).
async fn get(router: axum::Router, uri: &str) -> (StatusCode, bytes::Bytes) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    (status, body)
}

fn parse_json(b: bytes::Bytes) -> serde_json::Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_ok_true() {
    let router = routes::build_router(Arc::new(state::AppState::default()));
    let (status, body) = get(router, "/v1/health").await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "sue-daemon");
    assert!(json["version"].is_string());
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_before_first_update_is_idle_and_empty() {
    let router = routes::build_router(Arc::new(state::AppState::default()));
    let (status, body) = get(router, "/v1/status").await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["state"], "idle");
    assert!(json["last_run_date"].is_null());
    assert!(json["last_outcome"].is_null());
    assert_eq!(json["published_series"], 0);
}

#[tokio::test]
async fn status_reflects_published_then_no_new_data() {
    let registry = Registry::new();
    let mut updater = make_updater(scenario_reader(), &registry);
    let shared = Arc::new(state::AppState::new(registry));

    scheduler::run_once(&mut updater, &shared).await;
    let (_, body) = get(routes::build_router(Arc::clone(&shared)), "/v1/status").await;
    let json = parse_json(body);
    assert_eq!(json["state"], "idle");
    assert_eq!(json["last_outcome"], "published");
    assert_eq!(json["last_run_date"], "2024-04-20T00:00:00Z");
    assert_eq!(json["published_series"], 4);
    assert_eq!(json["total_series"], 4);
    assert!(json["last_error"].is_null());

    scheduler::run_once(&mut updater, &shared).await;
    let (_, body) = get(routes::build_router(Arc::clone(&shared)), "/v1/status").await;
    let json = parse_json(body);
    assert_eq!(json["last_outcome"], "no_new_data");
    assert_eq!(json["last_run_date"], "2024-04-20T00:00:00Z");
    assert_eq!(json["published_series"], 4);
}

#[tokio::test]
async fn status_reports_failed_update() {
    let registry = Registry::new();
    let reader = scenario_reader().failing_after(1, "error while reading");
    let mut updater = make_updater(reader, &registry);
    let shared = Arc::new(state::AppState::new(registry));

    scheduler::run_once(&mut updater, &shared).await;
    let (_, body) = get(routes::build_router(Arc::clone(&shared)), "/v1/status").await;
    let json = parse_json(body);
    assert_eq!(json["state"], "idle");
    assert_eq!(json["last_outcome"], "failed");
    assert!(json["last_run_date"].is_null());
    assert!(json["last_error"]
        .as_str()
        .unwrap()
        .contains("error while reading"));
}

// ---------------------------------------------------------------------------
// GET /metrics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn metrics_expose_usage_after_update() {
    let registry = Registry::new();
    let mut updater = make_updater(scenario_reader(), &registry);
    let shared = Arc::new(state::AppState::new(registry));
    scheduler::run_once(&mut updater, &shared).await;

    let (status, body) = get(routes::build_router(shared), "/metrics").await;
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("# TYPE azure_storage_usage gauge"), "{text}");
    assert_eq!(
        sample(&text, r#"azure_storage_usage{deleted="false",level1="default1",level2="default2"}"#),
        Some(666.0)
    );
    assert_eq!(
        sample(&text, r#"azure_storage_usage{deleted="true",level1="dir1",level2="dir2"}"#),
        Some(200.0)
    );
    assert_eq!(
        sample(&text, r#"azure_storage_last_run_date{storage_account="memory"}"#),
        Some(1_713_571_200.0)
    );
}

/// Value of the exposition line starting with `series`.
fn sample(text: &str, series: &str) -> Option<f64> {
    text.lines()
        .find_map(|line| line.strip_prefix(series))
        .and_then(|rest| rest.trim().parse().ok())
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scheduler_runs_immediately_and_stops_on_shutdown() {
    let registry = Registry::new();
    let updater = make_updater(scenario_reader(), &registry);
    let shared = Arc::new(state::AppState::new(registry));
    let (tx, rx) = watch::channel(false);

    let handle = scheduler::spawn_scheduler(
        updater,
        Arc::clone(&shared),
        Duration::from_secs(3600),
        rx,
    );

    let mut published = false;
    for _ in 0..200 {
        if shared.status.read().await.last_outcome.is_some() {
            published = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(published, "first update did not run");

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();
}
