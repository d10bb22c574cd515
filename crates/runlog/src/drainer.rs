// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Moves records from the in-memory queue into the store, then on to the
//! remote collector.
//!
//! A drain of one run is: swap the run's buffer out, persist it in one
//! transaction, then deliver the run's outbox in insertion order. Drains of
//! the same run are serialised by a per-run async lock so batches reach the
//! collector in the order they were enqueued; different runs drain in
//! parallel. Timer and size-triggered drains are fire-and-forget and only
//! log failures. `flush()` waits for its drains and returns their outcome.

use crate::delivery::{BulkPayload, DeliveryClient, RemoteTarget};
use crate::endpoint::EndpointResolver;
use crate::errors::{PipelineError, StoreError};
use crate::queue::RecordQueue;
use crate::record::RunKey;
use crate::store::{on_blocking_pool, LocalStore};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Outcome of one or more drains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Records committed to the local store.
    pub persisted: usize,
    /// Records acknowledged by the remote collector.
    pub delivered: usize,
    /// Records refused for violating the schema.
    pub rejected: usize,
}

impl FlushReport {
    fn merge(&mut self, other: FlushReport) {
        self.persisted += other.persisted;
        self.delivered += other.delivered;
        self.rejected += other.rejected;
    }
}

/// Where delivered batches go.
pub struct RemoteSink {
    pub client: DeliveryClient,
    pub target: RemoteTarget,
    pub resolver: EndpointResolver,
}

/// State shared by every drain task.
pub struct DrainContext {
    queue: Arc<RecordQueue>,
    store: LocalStore,
    remote: Option<RemoteSink>,
    max_batch: usize,
    run_locks: Mutex<HashMap<RunKey, Arc<tokio::sync::Mutex<()>>>>,
    config_sent: Mutex<HashSet<RunKey>>,
}

impl DrainContext {
    pub fn new(
        queue: Arc<RecordQueue>,
        store: LocalStore,
        remote: Option<RemoteSink>,
        max_batch: usize,
    ) -> Self {
        Self {
            queue,
            store,
            remote,
            max_batch: max_batch.max(1),
            run_locks: Mutex::new(HashMap::new()),
            config_sent: Mutex::new(HashSet::new()),
        }
    }

    pub fn queue(&self) -> &Arc<RecordQueue> {
        &self.queue
    }

    pub fn remote(&self) -> Option<&RemoteSink> {
        self.remote.as_ref()
    }

    /// Makes the next delivery of `run` carry its config again.
    pub fn rearm_config(&self, run: &RunKey) {
        self.config_sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run);
    }

    /// Drops per-run state of a deleted run.
    pub fn forget(&self, run: &RunKey) {
        self.queue.forget(run);
        self.rearm_config(run);
        self.run_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run);
    }

    pub(crate) fn run_lock(&self, run: &RunKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.run_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(run.clone()).or_default())
    }

    /// Drains one run. With `wait` unset, returns immediately when another
    /// drain of the same run is already in flight; that drain or the next
    /// tick picks up whatever is buffered.
    pub async fn drain_run(&self, run: &RunKey, wait: bool) -> Result<FlushReport, PipelineError> {
        let lock = self.run_lock(run);
        let _guard = if wait {
            lock.lock().await
        } else {
            match lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => return Ok(FlushReport::default()),
            }
        };

        let mut report = self.persist(run).await?;
        if self.remote.is_some() {
            report.delivered = self.deliver_outbox(run).await?;
        }
        Ok(report)
    }

    /// Runs a drain and logs its failure instead of returning it.
    pub async fn drain_logged(&self, run: &RunKey) {
        match self.drain_run(run, false).await {
            Ok(report) if report != FlushReport::default() => {
                debug!(
                    "DRAIN | {run}: persisted {}, delivered {}, rejected {}",
                    report.persisted, report.delivered, report.rejected
                );
            }
            Ok(_) => {}
            Err(err) => error!("DRAIN | background drain of {run} failed: {err}"),
        }
    }

    async fn persist(&self, run: &RunKey) -> Result<FlushReport, PipelineError> {
        let batch = self.queue.swap(run);
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }
        let store = self.store.clone();
        let key = run.clone();
        let enqueue_outbox = self.remote.is_some();
        let (result, batch) = tokio::task::spawn_blocking(move || {
            let result = store.append_batch(&key, &batch, enqueue_outbox);
            (result, batch)
        })
        .await
        .map_err(|err| PipelineError::Join(err.to_string()))?;

        match result {
            Ok(outcome) => {
                for rejected in &outcome.rejected {
                    warn!(
                        "DRAIN | {run}: rejected record {} of batch: {}",
                        rejected.index, rejected.violation
                    );
                }
                Ok(FlushReport {
                    persisted: outcome.stored.len(),
                    delivered: 0,
                    rejected: outcome.rejected.len(),
                })
            }
            Err(err) => {
                // Nothing committed; the next drain retries the same batch.
                self.queue.restore(run, batch);
                Err(err.into())
            }
        }
    }

    async fn deliver_outbox(&self, run: &RunKey) -> Result<usize, PipelineError> {
        let Some(remote) = &self.remote else {
            return Ok(0);
        };
        let (project, name) = (run.project.clone(), run.run.clone());
        let Some(stored_run) = self.blocking(move |store| store.run(&project, &name)).await? else {
            return Ok(0);
        };

        let mut delivered = 0;
        loop {
            let (run_id, limit) = (stored_run.id, self.max_batch);
            let chunk = self
                .blocking(move |store| store.outbox_batch(run_id, limit))
                .await?;
            if chunk.is_empty() {
                break;
            }

            let send_config = stored_run.config.is_some() && !self.config_already_sent(run);
            let payload = BulkPayload::from_records(run, &chunk).with_config(if send_config {
                stored_run.config.clone()
            } else {
                None
            });
            remote
                .resolver
                .deliver(&remote.client, &remote.target, &payload)
                .await?;
            if send_config {
                self.config_sent
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(run.clone());
            }

            let seqs: Vec<u64> = chunk.iter().map(|record| record.seq).collect();
            delivered += seqs.len();
            self.blocking(move |store| store.ack_outbox(run_id, &seqs))
                .await?;
        }
        Ok(delivered)
    }

    fn config_already_sent(&self, run: &RunKey) -> bool {
        self.config_sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(run)
    }

    /// Every run with buffered records, plus runs with undelivered records
    /// when a remote target is configured.
    async fn flushable_runs(&self) -> Result<Vec<RunKey>, PipelineError> {
        let mut runs = self.queue.pending_runs();
        if self.remote.is_some() {
            let backlog = self.blocking(|store| store.outbox_runs()).await?;
            for stored in backlog {
                let key = stored.key();
                if !runs.contains(&key) {
                    runs.push(key);
                }
            }
        }
        runs.sort();
        Ok(runs)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, PipelineError>
    where
        F: FnOnce(&LocalStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        on_blocking_pool(&self.store, f).await
    }
}

/// Drains `run`, or every flushable run, concurrently and waits for all of
/// them. Every drain runs to completion; the first error is returned.
pub async fn flush(
    ctx: &Arc<DrainContext>,
    run: Option<RunKey>,
) -> Result<FlushReport, PipelineError> {
    let runs = match run {
        Some(run) => vec![run],
        None => ctx.flushable_runs().await?,
    };
    if runs.is_empty() {
        return Ok(FlushReport::default());
    }

    let handles: Vec<_> = runs
        .into_iter()
        .map(|run| {
            let ctx = Arc::clone(ctx);
            tokio::spawn(async move { ctx.drain_run(&run, true).await })
        })
        .collect();

    let mut report = FlushReport::default();
    let mut first_error = None;
    for handle in handles {
        let result = handle
            .await
            .map_err(|err| PipelineError::Join(err.to_string()))
            .and_then(|result| result);
        match result {
            Ok(partial) => report.merge(partial),
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(report),
    }
}

#[derive(Debug)]
enum DrainCommand {
    Drain(RunKey),
    Flush {
        run: Option<RunKey>,
        reply: oneshot::Sender<Result<FlushReport, PipelineError>>,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct DrainerHandle {
    tx: mpsc::UnboundedSender<DrainCommand>,
}

impl DrainerHandle {
    /// Schedules a background drain of `run`.
    pub fn schedule(&self, run: RunKey) {
        if self.tx.send(DrainCommand::Drain(run)).is_err() {
            debug!("DRAIN | drainer stopped; drain left to the next flush");
        }
    }

    /// Drains and waits at most `timeout` for the outcome.
    pub async fn flush(
        &self,
        run: Option<RunKey>,
        timeout: Duration,
    ) -> Result<FlushReport, PipelineError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(DrainCommand::Flush { run, reply })
            .map_err(|_| PipelineError::ShutDown)?;
        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PipelineError::ShutDown),
            Err(_) => Err(PipelineError::Timeout(timeout)),
        }
    }

    pub fn shutdown(&self) {
        // Already stopped is fine.
        let _ = self.tx.send(DrainCommand::Shutdown);
    }
}

/// Owns the periodic timer and the command loop.
pub struct BatchDrainer {
    ctx: Arc<DrainContext>,
    rx: mpsc::UnboundedReceiver<DrainCommand>,
    interval: Duration,
    cancel: CancellationToken,
}

impl BatchDrainer {
    pub fn new(
        ctx: Arc<DrainContext>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> (Self, DrainerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                ctx,
                rx,
                interval,
                cancel,
            },
            DrainerHandle { tx },
        )
    }

    pub async fn run(mut self) {
        debug!("DRAIN | drainer started, interval {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => spawn_tick(&self.ctx),
                command = self.rx.recv() => match command {
                    Some(DrainCommand::Drain(run)) => spawn_drain(&self.ctx, run),
                    Some(DrainCommand::Flush { run, reply }) => {
                        let ctx = Arc::clone(&self.ctx);
                        tokio::spawn(async move {
                            let result = flush(&ctx, run).await;
                            if reply.send(result).is_err() {
                                debug!("DRAIN | flush caller stopped waiting");
                            }
                        });
                    }
                    Some(DrainCommand::Shutdown) | None => break,
                },
            }
        }
        debug!("DRAIN | drainer stopped");
    }
}

/// Drains every run with buffered records, and with a remote target every
/// run whose outbox still holds undelivered records.
fn spawn_tick(ctx: &Arc<DrainContext>) {
    if ctx.remote.is_none() {
        for run in ctx.queue().pending_runs() {
            spawn_drain(ctx, run);
        }
        return;
    }
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        match ctx.flushable_runs().await {
            Ok(runs) => {
                for run in runs {
                    spawn_drain(&ctx, run);
                }
            }
            Err(err) => warn!("DRAIN | could not list runs awaiting delivery: {err}"),
        }
    });
}

fn spawn_drain(ctx: &Arc<DrainContext>, run: RunKey) {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move { ctx.drain_logged(&run).await });
}
