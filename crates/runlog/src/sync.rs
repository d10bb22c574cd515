// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Full-history upload of a project to a remote target.
//!
//! Progress is tracked per target in the store's sync ledger as the highest
//! sequence number the target acknowledged, per run and for the project's
//! alerts. The ledger only moves after an acknowledgement, so an interrupted
//! sync resumes at the first unacknowledged chunk. Every record and alert
//! also carries a stable identity derived from its sequence number, which
//! lets the collector drop a replayed chunk whose acknowledgement was lost.

use crate::alerts::Alert;
use crate::constants::DEFAULT_SYNC_CHUNK_SIZE;
use crate::delivery::{BulkPayload, DeliveryClient, RemoteTarget};
use crate::endpoint::EndpointResolver;
use crate::errors::{PipelineError, StoreError};
use crate::record::Metrics;
use crate::store::{alert_scope, config_scope, on_blocking_pool, run_scope, LocalStore, Run};
use async_trait::async_trait;
use hex::encode as hex_encode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

/// Creates the remote target when it does not exist yet.
#[async_trait]
pub trait TargetProvisioner: Send + Sync {
    async fn ensure_target(&self, target: &RemoteTarget, project: &str) -> Result<(), String>;
}

/// Assumes the target already exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExistingTarget;

#[async_trait]
impl TargetProvisioner for ExistingTarget {
    async fn ensure_target(&self, _target: &RemoteTarget, _project: &str) -> Result<(), String> {
        Ok(())
    }
}

/// What a sync uploaded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub runs: usize,
    pub records: usize,
    pub alerts: usize,
}

#[derive(Debug, Serialize)]
struct AlertUpload<'a> {
    project: &'a str,
    alerts: Vec<&'a Alert>,
    alert_ids: Vec<String>,
}

/// Stable identity of a record: `sha256(project \0 run \0 seq)`.
pub fn record_id(project: &str, run: &str, seq: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project.as_bytes());
    hasher.update([0]);
    hasher.update(run.as_bytes());
    hasher.update([0]);
    hasher.update(seq.to_be_bytes());
    hex_encode(hasher.finalize())
}

/// Nonzero digest of a config; 0 is the ledger's "nothing synced" value.
fn config_fingerprint(config: &Metrics) -> u64 {
    let digest = Sha256::digest(serde_json::Value::Object(config.clone()).to_string());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes).max(1)
}

fn alert_id(project: &str, seq: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"alert\0");
    hasher.update(project.as_bytes());
    hasher.update([0]);
    hasher.update(seq.to_be_bytes());
    hex_encode(hasher.finalize())
}

pub struct SyncReconciler {
    store: LocalStore,
    client: DeliveryClient,
    target: RemoteTarget,
    records: EndpointResolver,
    alerts: EndpointResolver,
    provisioner: Arc<dyn TargetProvisioner>,
    chunk_size: usize,
}

impl SyncReconciler {
    pub fn new(store: LocalStore, client: DeliveryClient, target: RemoteTarget) -> Self {
        Self {
            store,
            client,
            target,
            records: EndpointResolver::for_metrics(),
            alerts: EndpointResolver::for_alerts(),
            provisioner: Arc::new(ExistingTarget),
            chunk_size: DEFAULT_SYNC_CHUNK_SIZE,
        }
    }

    #[must_use]
    pub fn with_provisioner(mut self, provisioner: Arc<dyn TargetProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    /// Uploads everything `project` holds locally that the target has not
    /// acknowledged yet.
    pub async fn sync_project(&self, project: &str) -> Result<SyncReport, PipelineError> {
        self.provisioner
            .ensure_target(&self.target, project)
            .await
            .map_err(PipelineError::Provision)?;

        let name = project.to_string();
        let runs = self.blocking(move |store| store.runs(&name)).await?;
        let mut report = SyncReport::default();
        for run in &runs {
            report.records += self.sync_run(run).await?;
            report.runs += 1;
        }
        report.alerts = self.sync_alerts(project).await?;
        info!(
            "SYNC | {project} -> {}: {} runs, {} records, {} alerts uploaded",
            self.target.base_url(),
            report.runs,
            report.records,
            report.alerts
        );
        Ok(report)
    }

    async fn sync_run(&self, run: &Run) -> Result<usize, PipelineError> {
        let key = run.key();
        let target = self.target.base_url().to_string();
        let scope = run_scope(run.id);
        let mut watermark = {
            let (target, scope) = (target.clone(), scope.clone());
            self.blocking(move |store| store.sync_watermark(&target, &scope))
                .await?
        };
        let mut pending_config = self.pending_config(run).await?;
        let mut uploaded = 0;

        loop {
            let (run_id, after, limit) = (run.id, watermark, self.chunk_size);
            let chunk = self
                .blocking(move |store| store.records_after(run_id, after, limit))
                .await?;
            if chunk.is_empty() {
                break;
            }

            let mut payload = BulkPayload::from_records(&key, &chunk)
                .with_config(pending_config.and_then(|_| run.config.clone()));
            payload.record_ids = Some(
                chunk
                    .iter()
                    .map(|record| record_id(&run.project, &run.name, record.seq))
                    .collect(),
            );
            self.records
                .deliver(&self.client, &self.target, &payload)
                .await?;
            if let Some(fingerprint) = pending_config.take() {
                self.mark_config_synced(run, fingerprint).await?;
            }

            let last = chunk.last().map_or(watermark, |record| record.seq);
            {
                let (target, scope) = (target.clone(), scope.clone());
                self.blocking(move |store| store.advance_sync_watermark(&target, &scope, last))
                    .await?;
            }
            debug!("SYNC | {key}: {} records acknowledged up to seq {last}", chunk.len());
            uploaded += chunk.len();
            watermark = last;
        }

        if let Some(fingerprint) = pending_config {
            // New or amended config with no records left to carry it.
            let payload = BulkPayload::from_records(&key, &[]).with_config(run.config.clone());
            self.records
                .deliver(&self.client, &self.target, &payload)
                .await?;
            self.mark_config_synced(run, fingerprint).await?;
            debug!("SYNC | {key}: config acknowledged");
        }
        Ok(uploaded)
    }

    /// Fingerprint of the run's config when the target has not accepted that
    /// exact config yet.
    async fn pending_config(&self, run: &Run) -> Result<Option<u64>, PipelineError> {
        let Some(config) = &run.config else {
            return Ok(None);
        };
        let fingerprint = config_fingerprint(config);
        let (target, scope) = (self.target.base_url().to_string(), config_scope(run.id));
        let synced = self
            .blocking(move |store| store.sync_watermark(&target, &scope))
            .await?;
        Ok((synced != fingerprint).then_some(fingerprint))
    }

    async fn mark_config_synced(&self, run: &Run, fingerprint: u64) -> Result<(), PipelineError> {
        let (target, scope) = (self.target.base_url().to_string(), config_scope(run.id));
        self.blocking(move |store| store.set_sync_marker(&target, &scope, fingerprint))
            .await
    }

    async fn sync_alerts(&self, project: &str) -> Result<usize, PipelineError> {
        let target = self.target.base_url().to_string();
        let scope = alert_scope(project);
        let mut watermark = {
            let (target, scope) = (target.clone(), scope.clone());
            self.blocking(move |store| store.sync_watermark(&target, &scope))
                .await?
        };
        let mut uploaded = 0;

        loop {
            let (name, after, limit) = (project.to_string(), watermark, self.chunk_size);
            let chunk = self
                .blocking(move |store| store.alerts_after(Some(name.as_str()), after, limit))
                .await?;
            let Some(last) = chunk.last().map(|stored| stored.seq) else {
                break;
            };
            let payload = AlertUpload {
                project,
                alerts: chunk.iter().map(|stored| &stored.alert).collect(),
                alert_ids: chunk
                    .iter()
                    .map(|stored| alert_id(project, stored.seq))
                    .collect(),
            };
            self.alerts
                .deliver(&self.client, &self.target, &payload)
                .await?;
            {
                let (target, scope) = (target.clone(), scope.clone());
                self.blocking(move |store| store.advance_sync_watermark(&target, &scope, last))
                    .await?;
            }
            uploaded += chunk.len();
            watermark = last;
        }
        Ok(uploaded)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, PipelineError>
    where
        F: FnOnce(&LocalStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        on_blocking_pool(&self.store, f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertLevel, WebhookOutcome};
    use crate::delivery::RetryStrategy;
    use crate::record::{MetricRecord, Metrics, RunKey};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn client() -> DeliveryClient {
        DeliveryClient::new(Duration::from_secs(2), RetryStrategy::Immediate(1)).unwrap()
    }

    fn seed(store: &LocalStore, run: &RunKey, steps: std::ops::Range<i64>) {
        let records: Vec<MetricRecord> = steps
            .map(|step| {
                let mut metrics = Metrics::new();
                metrics.insert("loss".into(), json!(step));
                MetricRecord::new(run.clone(), metrics).with_step(step)
            })
            .collect();
        store.append_batch(run, &records, false).unwrap();
    }

    #[test]
    fn test_record_ids_are_stable_and_distinct() {
        assert_eq!(record_id("p", "r", 1), record_id("p", "r", 1));
        assert_ne!(record_id("p", "r", 1), record_id("p", "r", 2));
        // The separator keeps `p/ra` and `pr/a` apart.
        assert_ne!(record_id("p", "ra", 1), record_id("pr", "a", 1));
        assert_eq!(record_id("p", "r", 1).len(), 64);
    }

    struct CountingProvisioner(AtomicUsize);

    #[async_trait]
    impl TargetProvisioner for CountingProvisioner {
        async fn ensure_target(&self, _target: &RemoteTarget, project: &str) -> Result<(), String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if project == "forbidden" {
                return Err("quota exceeded".to_string());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_provisioner_failure_aborts_sync() {
        let store = LocalStore::open_temporary().unwrap();
        let provisioner = Arc::new(CountingProvisioner(AtomicUsize::new(0)));
        let reconciler = SyncReconciler::new(
            store,
            client(),
            RemoteTarget::new("http://127.0.0.1:1", None),
        )
        .with_provisioner(provisioner.clone());

        let err = reconciler.sync_project("forbidden").await.unwrap_err();
        assert!(matches!(err, PipelineError::Provision(ref m) if m == "quota exceeded"));
        assert_eq!(provisioner.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sync_uploads_runs_config_and_alerts() {
        let mut server = mockito::Server::new_async().await;
        let records = server
            .mock("POST", "/api/bulk_log")
            .match_body(mockito::Matcher::PartialJson(json!({
                "project": "p",
                "run": "r",
                "steps": [0, 1, 2],
                "config": {"lr": 0.1},
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let config_only = server
            .mock("POST", "/api/bulk_log")
            .match_body(mockito::Matcher::PartialJson(json!({
                "run": "empty",
                "metrics_list": [],
                "config": {"batch": 32},
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let alerts = server
            .mock("POST", "/api/bulk_alerts")
            .match_body(mockito::Matcher::PartialJson(json!({"project": "p"})))
            .match_request(|request| {
                let body = request.utf8_lossy_body().unwrap_or_default();
                body.contains("\"diverged\"") && body.contains("\"alert_ids\"")
            })
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let store = LocalStore::open_temporary().unwrap();
        let run = RunKey::new("p", "r");
        seed(&store, &run, 0..3);
        let mut config = Metrics::new();
        config.insert("lr".into(), json!(0.1));
        store.ensure_run("p", "r", None, Some(config)).unwrap();
        let mut config = Metrics::new();
        config.insert("batch".into(), json!(32));
        store.ensure_run("p", "empty", None, Some(config)).unwrap();
        store
            .append_alert(
                &Alert::new(AlertLevel::Error, "diverged", "p"),
                WebhookOutcome::NotConfigured,
            )
            .unwrap();

        let reconciler = SyncReconciler::new(store, client(), RemoteTarget::new(server.url(), None));
        let report = reconciler.sync_project("p").await.unwrap();
        assert_eq!(
            report,
            SyncReport {
                runs: 2,
                records: 3,
                alerts: 1,
            }
        );
        records.assert_async().await;
        config_only.assert_async().await;
        alerts.assert_async().await;

        // Nothing new: nothing is re-sent, config-only runs included.
        let report = reconciler.sync_project("p").await.unwrap();
        assert_eq!(report.records, 0);
        assert_eq!(report.alerts, 0);
        records.assert_async().await;
        config_only.assert_async().await;
    }

    #[tokio::test]
    async fn test_amended_config_is_uploaded_once() {
        let mut server = mockito::Server::new_async().await;
        let original = server
            .mock("POST", "/api/bulk_log")
            .match_body(mockito::Matcher::PartialJson(json!({
                "steps": [0, 1],
                "config": {"lr": 0.1},
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let amended = server
            .mock("POST", "/api/bulk_log")
            .match_body(mockito::Matcher::PartialJson(json!({
                "metrics_list": [],
                "config": {"lr": 0.01},
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let store = LocalStore::open_temporary().unwrap();
        let run = RunKey::new("p", "r");
        seed(&store, &run, 0..2);
        let mut config = Metrics::new();
        config.insert("lr".into(), json!(0.1));
        store.ensure_run("p", "r", None, Some(config)).unwrap();

        let reconciler =
            SyncReconciler::new(store.clone(), client(), RemoteTarget::new(server.url(), None));
        assert_eq!(reconciler.sync_project("p").await.unwrap().records, 2);
        original.assert_async().await;

        let mut config = Metrics::new();
        config.insert("lr".into(), json!(0.01));
        store.ensure_run("p", "r", None, Some(config)).unwrap();
        assert_eq!(reconciler.sync_project("p").await.unwrap().records, 0);
        // Already accepted; a third sync sends nothing.
        reconciler.sync_project("p").await.unwrap();
        original.assert_async().await;
        amended.assert_async().await;
    }
}
