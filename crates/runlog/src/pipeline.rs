// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry point tying the queue, drainer, alert dispatcher and sync together.

use crate::alerts::{Alert, AlertDispatcher, AlertDispatcherService, AlertLevel};
use crate::config::PipelineConfig;
use crate::delivery::DeliveryClient;
use crate::drainer::{BatchDrainer, DrainContext, DrainerHandle, FlushReport, RemoteSink};
use crate::endpoint::EndpointResolver;
use crate::errors::{ConfigError, PipelineError, StoreError};
use crate::names::generate_run_name;
use crate::queue::RecordQueue;
use crate::record::{now_iso, MetricRecord, Metrics, RunKey};
use crate::store::{on_blocking_pool, LocalStore, Run, StoredAlert};
use crate::sync::{SyncReconciler, SyncReport, TargetProvisioner};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What `init_run` does when the requested run already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResumeMode {
    /// Always start a new run; a taken name is replaced by a generated one.
    #[default]
    Never,
    /// Resume the run if it exists, otherwise create it.
    Allow,
    /// Resume the run; fail if it does not exist.
    Must,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub project: String,
    pub name: Option<String>,
    pub group: Option<String>,
    pub config: Option<Metrics>,
    /// Webhook used by this run's alerts instead of the pipeline default.
    pub webhook_url: Option<String>,
    pub webhook_min_level: Option<AlertLevel>,
    pub resume: ResumeMode,
}

impl RunOptions {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: Metrics) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn with_webhook(mut self, url: impl Into<String>, min_level: Option<AlertLevel>) -> Self {
        self.webhook_url = Some(url.into());
        self.webhook_min_level = min_level;
        self
    }

    #[must_use]
    pub fn with_resume(mut self, resume: ResumeMode) -> Self {
        self.resume = resume;
        self
    }
}

struct Inner {
    config: PipelineConfig,
    store: LocalStore,
    client: DeliveryClient,
    ctx: Arc<DrainContext>,
    drainer: DrainerHandle,
    alerts: AlertDispatcher,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Cloneable handle on a running pipeline.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    /// Opens the store under `config.store_dir` and starts the pipeline.
    pub fn open(config: PipelineConfig) -> Result<Self, PipelineError> {
        let store = LocalStore::open(&config.store_dir)?;
        Self::start(config, store)
    }

    /// Starts the background services on the current tokio runtime.
    pub fn start(config: PipelineConfig, store: LocalStore) -> Result<Self, PipelineError> {
        config.validate()?;
        let client = DeliveryClient::new(config.timeout, config.retry_strategy())?;
        let remote = config.remote_target().map(|target| RemoteSink {
            client: client.clone(),
            target,
            resolver: EndpointResolver::for_metrics(),
        });
        let remote_url = remote
            .as_ref()
            .map_or("none", |sink| sink.target.base_url())
            .to_string();

        let queue = Arc::new(RecordQueue::new(config.max_batch));
        let ctx = Arc::new(DrainContext::new(
            queue,
            store.clone(),
            remote,
            config.max_batch,
        ));
        let cancel = CancellationToken::new();
        let (drainer, drainer_handle) =
            BatchDrainer::new(Arc::clone(&ctx), config.flush_interval, cancel.clone());
        let (alert_service, alerts) = AlertDispatcherService::new(
            store.clone(),
            client.clone(),
            config.webhook_url.clone(),
            config.webhook_min_level,
        );
        let tasks = vec![tokio::spawn(drainer.run()), tokio::spawn(alert_service.run())];

        info!(
            "PIPELINE | started; store at {}, remote collector {remote_url}",
            store.path().display()
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                client,
                ctx,
                drainer: drainer_handle,
                alerts,
                cancel,
                tasks: Mutex::new(tasks),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Creates or resumes a run according to `options.resume`.
    pub async fn init_run(&self, options: RunOptions) -> Result<RunHandle, PipelineError> {
        let RunOptions {
            project,
            name,
            group,
            config,
            webhook_url,
            webhook_min_level,
            resume,
        } = options;
        let name = name.filter(|n| !n.is_empty());

        let resolve = move |store: &LocalStore| -> Result<(Run, bool), PipelineError> {
            let existing = match &name {
                Some(name) => store.run(&project, name)?,
                None => None,
            };
            let name = match (resume, name, existing) {
                (ResumeMode::Must, None, _) => return Err(PipelineError::MissingRunName),
                (ResumeMode::Must, Some(name), None) => {
                    return Err(PipelineError::Store(StoreError::UnknownRun {
                        project,
                        run: name,
                    }))
                }
                (ResumeMode::Never, Some(_), Some(_)) | (_, None, _) => {
                    let runs = store.runs(&project)?;
                    generate_run_name(runs.iter().map(|run| run.name.as_str()))
                }
                (_, Some(name), _) => name,
            };
            Ok(store.ensure_run(&project, &name, group, config)?)
        };
        let (run, created) = on_blocking_pool(&self.inner.store, resolve).await?;

        let key = run.key();
        if created {
            info!("PIPELINE | run {key} initialised");
        } else {
            info!("PIPELINE | resuming run {key}");
            // A resumed run's config may have changed; send it again.
            self.inner.ctx.rearm_config(&key);
        }
        Ok(RunHandle {
            pipeline: self.clone(),
            key,
            run,
            resumed: !created,
            webhook_url: webhook_url.filter(|u| !u.is_empty()),
            webhook_min_level,
        })
    }

    /// Buffers a record without blocking. A drain is scheduled as soon as
    /// the run has another full batch waiting.
    pub fn enqueue(&self, record: MetricRecord) {
        if self.inner.shut_down.load(Ordering::Acquire) {
            warn!(
                "PIPELINE | record for {} dropped: pipeline is shut down",
                record.run
            );
            return;
        }
        let run = record.run.clone();
        if self.inner.ctx.queue().enqueue(record) {
            self.inner.drainer.schedule(run);
        }
    }

    /// Drains every run and waits at most the configured flush timeout.
    pub async fn flush(&self) -> Result<FlushReport, PipelineError> {
        self.inner
            .drainer
            .flush(None, self.inner.config.flush_timeout)
            .await
    }

    pub async fn flush_run(&self, run: &RunKey) -> Result<FlushReport, PipelineError> {
        self.inner
            .drainer
            .flush(Some(run.clone()), self.inner.config.flush_timeout)
            .await
    }

    /// Prints and persists an alert, then hands it to the webhook service.
    pub fn alert(&self, alert: Alert) -> Result<StoredAlert, PipelineError> {
        Ok(self.inner.alerts.dispatch(alert, None, None)?)
    }

    /// Like [`Pipeline::alert`], with `url` replacing the default webhook.
    pub fn alert_to(&self, alert: Alert, url: &str) -> Result<StoredAlert, PipelineError> {
        Ok(self.inner.alerts.dispatch(alert, Some(url), None)?)
    }

    /// Uploads everything `project` holds locally to the configured remote
    /// collector, skipping what it already acknowledged.
    pub async fn sync(
        &self,
        project: &str,
        provisioner: Option<Arc<dyn TargetProvisioner>>,
    ) -> Result<SyncReport, PipelineError> {
        let target = self.inner.config.remote_target().ok_or_else(|| {
            PipelineError::Config(ConfigError::Invalid("sync needs a server url".to_string()))
        })?;
        let mut reconciler =
            SyncReconciler::new(self.inner.store.clone(), self.inner.client.clone(), target);
        if let Some(provisioner) = provisioner {
            reconciler = reconciler.with_provisioner(provisioner);
        }
        reconciler.sync_project(project).await
    }

    /// Deletes a run locally along with anything still buffered for it.
    pub async fn delete_run(&self, run: &RunKey) -> Result<bool, PipelineError> {
        // Wait out an in-flight drain so it cannot recreate the run.
        let lock = self.inner.ctx.run_lock(run);
        let _guard = lock.lock().await;
        self.inner.ctx.forget(run);
        let (project, name) = (run.project.clone(), run.run.clone());
        let deleted =
            on_blocking_pool(&self.inner.store, move |store| store.delete_run(&project, &name))
                .await?;
        if deleted {
            info!("PIPELINE | run {run} deleted");
        }
        Ok(deleted)
    }

    /// Flushes for at most the shutdown timeout, then stops the background
    /// services. Failures are logged; whatever was not delivered stays in
    /// the store's outbox for the next start. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let timeout = self.inner.config.shutdown_timeout;
        match self.inner.drainer.flush(None, timeout).await {
            Ok(report) => debug!(
                "PIPELINE | final flush persisted {}, delivered {}",
                report.persisted, report.delivered
            ),
            Err(err) => warn!("PIPELINE | final flush incomplete: {err}"),
        }
        self.inner.drainer.shutdown();
        self.inner.cancel.cancel();
        self.inner.alerts.shutdown(timeout).await;

        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(err) = task.await {
                error!("PIPELINE | background task failed: {err}");
            }
        }
        if let Err(err) = self.inner.store.flush() {
            error!("PIPELINE | failed to flush the store: {err}");
        }
        info!("PIPELINE | stopped");
    }
}

/// Handle on one initialised run.
#[derive(Clone)]
pub struct RunHandle {
    pipeline: Pipeline,
    key: RunKey,
    run: Run,
    resumed: bool,
    webhook_url: Option<String>,
    webhook_min_level: Option<AlertLevel>,
}

impl RunHandle {
    pub fn key(&self) -> &RunKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.key.run
    }

    pub fn project(&self) -> &str {
        &self.key.project
    }

    /// The run as it was stored when the handle was created.
    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Logs metrics without a step, timestamped now.
    pub fn log(&self, metrics: Metrics) {
        self.pipeline.enqueue(
            MetricRecord::new(self.key.clone(), metrics).with_timestamp(now_iso()),
        );
    }

    pub fn log_at(&self, metrics: Metrics, step: i64) {
        self.pipeline.enqueue(
            MetricRecord::new(self.key.clone(), metrics)
                .with_step(step)
                .with_timestamp(now_iso()),
        );
    }

    /// Raises an alert attributed to this run.
    pub fn alert(
        &self,
        level: AlertLevel,
        title: impl Into<String>,
        text: Option<String>,
        step: Option<i64>,
    ) -> Result<StoredAlert, PipelineError> {
        let alert = self.build_alert(level, title, text, step);
        Ok(self.pipeline.inner.alerts.dispatch(
            alert,
            self.webhook_url.as_deref(),
            self.webhook_min_level,
        )?)
    }

    /// Raises an alert sent to `url` instead of the run's webhook.
    pub fn alert_to(
        &self,
        url: &str,
        level: AlertLevel,
        title: impl Into<String>,
        text: Option<String>,
    ) -> Result<StoredAlert, PipelineError> {
        let alert = self.build_alert(level, title, text, None);
        Ok(self
            .pipeline
            .inner
            .alerts
            .dispatch(alert, Some(url), self.webhook_min_level)?)
    }

    /// Replaces the run's stored config; the next delivery carries it.
    pub async fn set_config(&mut self, config: Metrics) -> Result<(), PipelineError> {
        let (project, name) = (self.key.project.clone(), self.key.run.clone());
        let (run, _) = on_blocking_pool(self.pipeline.store(), move |store| {
            store.ensure_run(&project, &name, None, Some(config))
        })
        .await?;
        self.run = run;
        self.pipeline.inner.ctx.rearm_config(&self.key);
        Ok(())
    }

    pub async fn flush(&self) -> Result<FlushReport, PipelineError> {
        self.pipeline.flush_run(&self.key).await
    }

    /// Flushes whatever the run still buffers. The pipeline keeps running.
    pub async fn finish(self) -> Result<FlushReport, PipelineError> {
        let report = self.flush().await?;
        info!(
            "PIPELINE | run {} finished; {} records persisted in the final flush",
            self.key, report.persisted
        );
        Ok(report)
    }

    fn build_alert(
        &self,
        level: AlertLevel,
        title: impl Into<String>,
        text: Option<String>,
        step: Option<i64>,
    ) -> Alert {
        let mut alert = Alert::new(level, title, self.key.project.clone()).with_run(self.key.run.clone());
        if let Some(text) = text {
            alert = alert.with_text(text);
        }
        if let Some(step) = step {
            alert = alert.with_step(step);
        }
        alert
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::WebhookOutcome;
    use serde_json::json;
    use std::time::Duration;

    fn metrics(value: serde_json::Value) -> Metrics {
        value.as_object().cloned().unwrap()
    }

    fn local_config() -> PipelineConfig {
        PipelineConfig {
            flush_interval: Duration::from_millis(20),
            flush_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            max_retries: 1,
            ..Default::default()
        }
    }

    fn start() -> Pipeline {
        Pipeline::start(local_config(), LocalStore::open_temporary().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_log_and_flush_persists_in_order() {
        let pipeline = start();
        let run = pipeline
            .init_run(RunOptions::new("p").with_name("r"))
            .await
            .unwrap();
        for step in 0..5 {
            run.log_at(metrics(json!({"loss": 1.0 / (step + 1) as f64})), step);
        }
        run.log(metrics(json!({"final": true})));
        let report = run.flush().await.unwrap();
        assert_eq!(report.persisted, 6);

        let stored = pipeline.store().records("p", "r").unwrap();
        let steps: Vec<Option<i64>> = stored.iter().map(|r| r.step).collect();
        assert_eq!(steps, vec![Some(0), Some(1), Some(2), Some(3), Some(4), None]);
        assert!(stored.iter().all(|r| !r.timestamp.is_empty()));
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_resume_modes() {
        let pipeline = start();
        let first = pipeline
            .init_run(RunOptions::new("p").with_name("r"))
            .await
            .unwrap();
        assert_eq!(first.name(), "r");
        assert!(!first.resumed());

        // Never: the taken name is replaced.
        let fresh = pipeline
            .init_run(RunOptions::new("p").with_name("r"))
            .await
            .unwrap();
        assert_ne!(fresh.name(), "r");
        assert!(fresh.name().ends_with("-2"));

        let resumed = pipeline
            .init_run(
                RunOptions::new("p")
                    .with_name("r")
                    .with_resume(ResumeMode::Allow),
            )
            .await
            .unwrap();
        assert_eq!(resumed.name(), "r");
        assert!(resumed.resumed());
        assert_eq!(resumed.run().id, first.run().id);

        let err = pipeline
            .init_run(
                RunOptions::new("p")
                    .with_name("missing")
                    .with_resume(ResumeMode::Must),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            PipelineError::Store(StoreError::UnknownRun { ref run, .. }) if run == "missing"
        ));

        let err = pipeline
            .init_run(RunOptions::new("p").with_resume(ResumeMode::Must))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::MissingRunName));
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_generated_name_when_missing() {
        let pipeline = start();
        let run = pipeline.init_run(RunOptions::new("p")).await.unwrap();
        assert_eq!(run.name().split('-').count(), 3);
        assert!(pipeline.store().run("p", run.name()).unwrap().is_some());
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_config_updates_store() {
        let pipeline = start();
        let mut run = pipeline
            .init_run(
                RunOptions::new("p")
                    .with_name("r")
                    .with_group("sweep")
                    .with_config(metrics(json!({"lr": 0.1}))),
            )
            .await
            .unwrap();
        run.set_config(metrics(json!({"lr": 0.01}))).await.unwrap();

        let stored = pipeline.store().run("p", "r").unwrap().unwrap();
        assert_eq!(stored.config, Some(metrics(json!({"lr": 0.01}))));
        assert_eq!(stored.group.as_deref(), Some("sweep"));
        assert_eq!(run.run().config, stored.config);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_timer_drains_without_explicit_flush() {
        let pipeline = start();
        let run = pipeline
            .init_run(RunOptions::new("p").with_name("r"))
            .await
            .unwrap();
        run.log_at(metrics(json!({"a": 1})), 0);

        let mut persisted = 0;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            persisted = pipeline.store().records("p", "r").unwrap().len();
            if persisted == 1 {
                break;
            }
        }
        assert_eq!(persisted, 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_is_idempotent() {
        let store = LocalStore::open_temporary().unwrap();
        let config = PipelineConfig {
            // Long enough that only the final flush can persist.
            flush_interval: Duration::from_secs(3600),
            ..local_config()
        };
        let pipeline = Pipeline::start(config, store.clone()).unwrap();
        let run = pipeline
            .init_run(RunOptions::new("p").with_name("r"))
            .await
            .unwrap();
        run.log_at(metrics(json!({"a": 1})), 0);
        run.log_at(metrics(json!({"a": 2})), 1);

        pipeline.shutdown().await;
        pipeline.shutdown().await;
        assert_eq!(store.records("p", "r").unwrap().len(), 2);
        assert!(matches!(pipeline.flush().await, Err(PipelineError::ShutDown)));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_records_after_shutdown_are_dropped_with_a_warning() {
        let store = LocalStore::open_temporary().unwrap();
        let pipeline = Pipeline::start(local_config(), store.clone()).unwrap();
        let run = pipeline
            .init_run(RunOptions::new("p").with_name("late"))
            .await
            .unwrap();
        pipeline.shutdown().await;

        run.log_at(metrics(json!({"a": 1})), 0);
        assert!(pipeline.inner.ctx.queue().is_empty());
        assert!(store.records("p", "late").unwrap().is_empty());
        assert!(logs_contain("record for p/late dropped: pipeline is shut down"));
    }

    #[tokio::test]
    async fn test_run_alert_is_attributed_and_persisted() {
        let pipeline = start();
        let run = pipeline
            .init_run(RunOptions::new("p").with_name("r"))
            .await
            .unwrap();
        let stored = run
            .alert(AlertLevel::Warn, "plateau", Some("no progress".into()), Some(7))
            .unwrap();
        assert_eq!(stored.webhook, WebhookOutcome::NotConfigured);

        let alerts = pipeline.store().alerts(Some("p")).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert.run.as_deref(), Some("r"));
        assert_eq!(alerts[0].alert.step, Some(7));
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_run_drops_buffer_and_records() {
        let pipeline = start();
        let run = pipeline
            .init_run(RunOptions::new("p").with_name("r"))
            .await
            .unwrap();
        run.log_at(metrics(json!({"a": 1})), 0);
        run.flush().await.unwrap();
        run.log_at(metrics(json!({"a": 2})), 1);

        assert!(pipeline.delete_run(run.key()).await.unwrap());
        assert!(pipeline.store().run("p", "r").unwrap().is_none());
        assert_eq!(pipeline.flush().await.unwrap().persisted, 0);
        assert!(!pipeline.delete_run(run.key()).await.unwrap());
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_without_server_is_a_config_error() {
        let pipeline = start();
        let err = pipeline.sync("p", None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        pipeline.shutdown().await;
    }
}
