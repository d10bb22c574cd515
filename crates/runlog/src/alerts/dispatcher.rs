// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{Alert, AlertLevel, WebhookFormat, WebhookOutcome};
use crate::delivery::DeliveryClient;
use crate::errors::AlertError;
use crate::store::{LocalStore, StoredAlert};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// An alert waiting to be posted to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookJob {
    pub seq: u64,
    pub alert: Alert,
    pub url: String,
}

#[derive(Debug)]
enum DispatcherCommand {
    Send(WebhookJob),
    Drain(oneshot::Sender<()>),
    Shutdown,
}

/// Caller side of the alert channel.
#[derive(Clone)]
pub struct AlertDispatcher {
    tx: mpsc::UnboundedSender<DispatcherCommand>,
    store: LocalStore,
    default_url: Option<String>,
    min_level: AlertLevel,
}

impl AlertDispatcher {
    /// Prints and persists `alert`, then queues it for the webhook.
    ///
    /// `url` overrides the default webhook for this call only, and
    /// `min_level` overrides the default threshold. Persistence failures are
    /// returned; webhook failures only show up on the stored alert.
    pub fn dispatch(
        &self,
        alert: Alert,
        url: Option<&str>,
        min_level: Option<AlertLevel>,
    ) -> Result<StoredAlert, AlertError> {
        eprintln!("{}", alert.terminal_line());

        let url = url
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_url.clone());
        let min_level = min_level.unwrap_or(self.min_level);
        let outcome = match &url {
            None => WebhookOutcome::NotConfigured,
            Some(_) if alert.level < min_level => WebhookOutcome::Suppressed,
            Some(_) => WebhookOutcome::Pending,
        };

        let stored = self.store.append_alert(&alert, outcome)?;
        if let (Some(url), WebhookOutcome::Pending) = (url, &stored.webhook) {
            let job = WebhookJob {
                seq: stored.seq,
                alert,
                url,
            };
            if self.tx.send(DispatcherCommand::Send(job)).is_err() {
                warn!("ALERTS | dispatcher is shut down; alert {} not sent", stored.seq);
                let failed = WebhookOutcome::Failed {
                    message: "dispatcher shut down".to_string(),
                };
                self.store.set_alert_outcome(stored.seq, failed.clone())?;
                return Ok(StoredAlert {
                    webhook: failed,
                    ..stored
                });
            }
        }
        Ok(stored)
    }

    /// Waits until every webhook queued so far has been attempted.
    pub async fn drain(&self) -> Result<(), AlertError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DispatcherCommand::Drain(reply_tx))
            .map_err(|_| AlertError::ShutDown)?;
        reply_rx.await.map_err(|_| AlertError::ShutDown)
    }

    /// Drains queued webhooks for at most `timeout`, then stops the service.
    pub async fn shutdown(&self, timeout: Duration) {
        match tokio::time::timeout(timeout, self.drain()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!("ALERTS | {err}"),
            Err(_) => warn!("ALERTS | pending webhooks not sent within {timeout:?}"),
        }
        // Already stopped is fine.
        let _ = self.tx.send(DispatcherCommand::Shutdown);
    }
}

/// Background side of the alert channel: posts webhooks one at a time and
/// records their outcome.
pub struct AlertDispatcherService {
    rx: mpsc::UnboundedReceiver<DispatcherCommand>,
    client: DeliveryClient,
    store: LocalStore,
}

impl AlertDispatcherService {
    pub fn new(
        store: LocalStore,
        client: DeliveryClient,
        default_url: Option<String>,
        min_level: AlertLevel,
    ) -> (Self, AlertDispatcher) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            rx,
            client,
            store: store.clone(),
        };
        let handle = AlertDispatcher {
            tx,
            store,
            default_url: default_url.filter(|u| !u.is_empty()),
            min_level,
        };
        (service, handle)
    }

    pub async fn run(mut self) {
        debug!("ALERTS | dispatcher started");
        while let Some(command) = self.rx.recv().await {
            match command {
                DispatcherCommand::Send(job) => self.send(job).await,
                DispatcherCommand::Drain(reply) => {
                    if reply.send(()).is_err() {
                        debug!("ALERTS | drain requester went away");
                    }
                }
                DispatcherCommand::Shutdown => {
                    debug!("ALERTS | dispatcher stopped");
                    break;
                }
            }
        }
    }

    async fn send(&self, job: WebhookJob) {
        let format = WebhookFormat::for_url(&job.url);
        let payload = format.format(&job.alert);
        let outcome = match self.client.post(&job.url, None, &payload).await {
            Ok(()) => {
                debug!("ALERTS | alert {} delivered as {format:?}", job.seq);
                WebhookOutcome::Delivered
            }
            Err(err) => {
                error!("ALERTS | webhook for alert {} failed: {err}", job.seq);
                WebhookOutcome::Failed {
                    message: err.to_string(),
                }
            }
        };
        if let Err(err) = self.store.set_alert_outcome(job.seq, outcome) {
            error!("ALERTS | failed to record outcome of alert {}: {err}", job.seq);
        }
    }
}
