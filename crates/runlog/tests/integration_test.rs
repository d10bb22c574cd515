// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use mockito::{Matcher, Server};
use runlog::record::Metrics;
use runlog::store::LocalStore;
use runlog::sync::{record_id, SyncReconciler};
use runlog::{
    Alert, AlertLevel, DeliveryClient, DeliveryError, MetricRecord, Pipeline, PipelineConfig,
    PipelineError, RetryStrategy, RunKey, RunOptions, WebhookOutcome,
};
use serde_json::json;
use std::time::Duration;

fn metrics(value: serde_json::Value) -> Metrics {
    value.as_object().cloned().expect("metrics must be an object")
}

/// Remote-enabled config whose timer never fires on its own during a test.
fn remote_config(server_url: String) -> PipelineConfig {
    PipelineConfig {
        server_url: Some(server_url),
        timeout: Duration::from_secs(2),
        max_retries: 1,
        retry_base: Duration::from_millis(1),
        flush_interval: Duration::from_secs(3600),
        flush_timeout: Duration::from_secs(10),
        shutdown_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn start(config: PipelineConfig) -> (Pipeline, LocalStore) {
    let store = LocalStore::open_temporary().expect("temporary store");
    let pipeline = Pipeline::start(config, store.clone()).expect("pipeline starts");
    (pipeline, store)
}

#[tokio::test]
async fn flush_ships_one_batch_per_run() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/bulk_log")
        .match_header("content-type", "application/json")
        .match_body(Matcher::PartialJson(json!({
            "project": "p",
            "run": "r1",
            "metrics_list": [{"loss": 0.5}, {"loss": 0.4}],
            "steps": [0, 1],
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let (pipeline, store) = start(remote_config(server.url()));
    let run = pipeline
        .init_run(RunOptions::new("p").with_name("r1"))
        .await
        .expect("run created");
    run.log_at(metrics(json!({"loss": 0.5})), 0);
    run.log_at(metrics(json!({"loss": 0.4})), 1);

    let report = pipeline.flush().await.expect("flush succeeds");
    assert_eq!(report.persisted, 2);
    assert_eq!(report.delivered, 2);
    mock.assert_async().await;

    let stored = store.records("p", "r1").expect("records");
    assert_eq!(stored.len(), 2);
    assert_eq!(store.outbox_len(stored[0].run_id), 0);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn empty_flush_makes_no_requests() {
    let mut server = Server::new_async().await;
    let any = server
        .mock("POST", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let (pipeline, _store) = start(remote_config(server.url()));
    let report = pipeline.flush().await.expect("flush succeeds");
    assert_eq!(report, runlog::FlushReport::default());
    pipeline.shutdown().await;
    any.assert_async().await;
}

#[tokio::test]
async fn fallback_path_is_resolved_once_and_cached() {
    let mut server = Server::new_async().await;
    let primary = server
        .mock("POST", "/api/bulk_log")
        .with_status(404)
        .expect(1)
        .create_async()
        .await;
    let fallback = server
        .mock("POST", "/gradio_api/bulk_log")
        .with_status(200)
        .expect(2)
        .create_async()
        .await;

    let (pipeline, _store) = start(remote_config(server.url()));
    let run = pipeline
        .init_run(RunOptions::new("p").with_name("r"))
        .await
        .expect("run created");

    run.log_at(metrics(json!({"a": 1})), 0);
    assert_eq!(run.flush().await.expect("first flush").delivered, 1);
    run.log_at(metrics(json!({"a": 2})), 1);
    assert_eq!(run.flush().await.expect("second flush").delivered, 1);

    primary.assert_async().await;
    fallback.assert_async().await;
    pipeline.shutdown().await;
}

#[tokio::test]
async fn single_redirect_is_followed() {
    let mut server = Server::new_async().await;
    let redirect = server
        .mock("POST", "/api/bulk_log")
        .with_status(307)
        .with_header("location", "/moved/bulk_log")
        .expect(1)
        .create_async()
        .await;
    let moved = server
        .mock("POST", "/moved/bulk_log")
        .match_body(Matcher::PartialJson(json!({"steps": [3]})))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let (pipeline, _store) = start(remote_config(server.url()));
    let run = pipeline
        .init_run(RunOptions::new("p").with_name("r"))
        .await
        .expect("run created");
    run.log_at(metrics(json!({"a": 1})), 3);
    assert_eq!(run.flush().await.expect("flush").delivered, 1);

    redirect.assert_async().await;
    moved.assert_async().await;
    pipeline.shutdown().await;
}

#[tokio::test]
async fn chained_redirects_are_not_followed() {
    let mut server = Server::new_async().await;
    for (path, location) in [
        ("/api/bulk_log", "/hop-one"),
        ("/gradio_api/bulk_log", "/hop-one"),
        ("/hop-one", "/hop-two"),
    ] {
        server
            .mock("POST", path)
            .with_status(302)
            .with_header("location", location)
            .create_async()
            .await;
    }
    let second_hop = server
        .mock("POST", "/hop-two")
        .expect(0)
        .create_async()
        .await;

    let (pipeline, store) = start(remote_config(server.url()));
    let run = pipeline
        .init_run(RunOptions::new("p").with_name("r"))
        .await
        .expect("run created");
    run.log_at(metrics(json!({"a": 1})), 0);

    let err = run.flush().await.expect_err("delivery must fail");
    match err {
        PipelineError::Delivery(DeliveryError::EndpointNotFound { last, .. }) => {
            assert!(matches!(*last, DeliveryError::TooManyRedirects { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    second_hop.assert_async().await;

    // The record is durable and still waiting for delivery.
    let stored = store.records("p", "r").expect("records");
    assert_eq!(stored.len(), 1);
    assert_eq!(store.outbox_len(stored[0].run_id), 1);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn transient_failures_are_retried_with_backoff() {
    let mut server = Server::new_async().await;
    let failing = server
        .mock("POST", "/api/bulk_log")
        .with_status(503)
        .expect(2)
        .create_async()
        .await;
    let healthy = server
        .mock("POST", "/api/bulk_log")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let config = PipelineConfig {
        max_retries: 3,
        ..remote_config(server.url())
    };
    let (pipeline, _store) = start(config);
    let run = pipeline
        .init_run(RunOptions::new("p").with_name("r"))
        .await
        .expect("run created");
    run.log_at(metrics(json!({"a": 1})), 0);
    assert_eq!(run.flush().await.expect("flush").delivered, 1);

    failing.assert_async().await;
    healthy.assert_async().await;
    pipeline.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_report_the_last_response() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/ingest")
        .with_status(503)
        .with_body("overloaded")
        .expect(3)
        .create_async()
        .await;

    let client = DeliveryClient::new(
        Duration::from_secs(2),
        RetryStrategy::ExponentialBackoff {
            attempts: 3,
            base_delay_ms: 1,
        },
    )
    .expect("client builds");
    let err = client
        .post(&format!("{}/ingest", server.url()), None, &json!({}))
        .await
        .expect_err("all attempts fail");

    assert_eq!(err.status(), Some(503));
    assert!(err.to_string().contains("overloaded"));
    mock.assert_async().await;
}

#[tokio::test]
async fn undelivered_records_are_sent_after_restart() {
    let store = LocalStore::open_temporary().expect("temporary store");

    let offline = remote_config("http://127.0.0.1:1".to_string());
    let pipeline = Pipeline::start(offline, store.clone()).expect("pipeline starts");
    let run = pipeline
        .init_run(RunOptions::new("p").with_name("r"))
        .await
        .expect("run created");
    run.log_at(metrics(json!({"a": 1})), 0);
    run.log_at(metrics(json!({"a": 2})), 1);
    assert!(run.flush().await.is_err());
    pipeline.shutdown().await;
    assert_eq!(store.records("p", "r").expect("records").len(), 2);

    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/bulk_log")
        .match_body(Matcher::PartialJson(json!({"steps": [0, 1]})))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let pipeline = Pipeline::start(remote_config(server.url()), store.clone())
        .expect("pipeline restarts");
    let report = pipeline.flush().await.expect("backlog delivered");
    assert_eq!(report.persisted, 0);
    assert_eq!(report.delivered, 2);
    mock.assert_async().await;
    pipeline.shutdown().await;
}

#[tokio::test]
async fn webhook_threshold_filters_low_severity_alerts() {
    let mut server = Server::new_async().await;
    let hook = server
        .mock("POST", "/hook")
        .match_body(Matcher::PartialJson(json!({"level": "warn", "title": "slow"})))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let config = PipelineConfig {
        webhook_url: Some(format!("{}/hook", server.url())),
        webhook_min_level: AlertLevel::Warn,
        flush_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let (pipeline, store) = start(config);

    let info = pipeline
        .alert(Alert::new(AlertLevel::Info, "started", "p"))
        .expect("info alert persisted");
    assert_eq!(info.webhook, WebhookOutcome::Suppressed);
    let warn = pipeline
        .alert(Alert::new(AlertLevel::Warn, "slow", "p"))
        .expect("warn alert persisted");
    assert_eq!(warn.webhook, WebhookOutcome::Pending);

    pipeline.shutdown().await;
    hook.assert_async().await;

    let alerts = store.alerts(Some("p")).expect("alerts");
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[0].webhook, WebhookOutcome::Suppressed);
    assert_eq!(alerts[1].webhook, WebhookOutcome::Delivered);
}

#[tokio::test]
async fn interrupted_sync_resumes_without_duplicates() {
    let store = LocalStore::open_temporary().expect("temporary store");
    let run = RunKey::new("p", "r");
    let records: Vec<MetricRecord> = (0..5)
        .map(|step| MetricRecord::new(run.clone(), metrics(json!({"x": step}))).with_step(step))
        .collect();
    let outcome = store
        .append_batch(&run, &records, false)
        .expect("records persisted");
    let ids: Vec<String> = outcome
        .stored
        .iter()
        .map(|record| record_id("p", "r", record.seq))
        .collect();

    let mut server = Server::new_async().await;
    let first_chunk = server
        .mock("POST", "/api/bulk_log")
        .match_body(Matcher::PartialJson(json!({
            "steps": [0, 1],
            "record_ids": [ids[0], ids[1]],
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let second_chunk_fails = server
        .mock("POST", "/api/bulk_log")
        .match_body(Matcher::PartialJson(json!({"steps": [2, 3]})))
        .with_status(500)
        .expect(1)
        .create_async()
        .await;
    let second_chunk = server
        .mock("POST", "/api/bulk_log")
        .match_body(Matcher::PartialJson(json!({
            "steps": [2, 3],
            "record_ids": [ids[2], ids[3]],
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let last_chunk = server
        .mock("POST", "/api/bulk_log")
        .match_body(Matcher::PartialJson(json!({"steps": [4]})))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let client = DeliveryClient::new(Duration::from_secs(2), RetryStrategy::Immediate(1))
        .expect("client builds");
    let reconciler = SyncReconciler::new(
        store.clone(),
        client,
        runlog::RemoteTarget::new(server.url(), None),
    )
    .with_chunk_size(2);

    assert!(reconciler.sync_project("p").await.is_err());
    let report = reconciler.sync_project("p").await.expect("sync resumes");
    assert_eq!(report.records, 3);

    first_chunk.assert_async().await;
    second_chunk_fails.assert_async().await;
    second_chunk.assert_async().await;
    last_chunk.assert_async().await;

    // A completed sync has nothing left to send.
    assert_eq!(
        reconciler.sync_project("p").await.expect("no-op sync").records,
        0
    );
}
