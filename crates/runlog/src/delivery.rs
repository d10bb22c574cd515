// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP delivery to a remote collector.

use crate::constants::{MAX_DIAGNOSTIC_BODY, WRITE_TOKEN_HEADER};
use crate::errors::DeliveryError;
use crate::record::{wire_step, Metrics, RunKey};
use crate::store::StoredRecord;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{redirect, StatusCode, Url};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A remote collector, identified by its base address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteTarget {
    base_url: String,
    write_token: Option<String>,
}

impl RemoteTarget {
    pub fn new(base_url: impl Into<String>, write_token: Option<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            write_token: write_token.filter(|token| !token.is_empty()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn write_token(&self) -> Option<&str> {
        self.write_token.as_deref()
    }

    /// `base_url` joined with an absolute path.
    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// How many attempts a request gets and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    Immediate(u32),
    ExponentialBackoff { attempts: u32, base_delay_ms: u64 },
}

impl RetryStrategy {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Immediate(attempts) | Self::ExponentialBackoff { attempts, .. } => {
                (*attempts).max(1)
            }
        }
    }

    /// Delay before the `retry`-th retry (1-based): `base * 2^(retry-1)` plus
    /// up to half of that again as jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Self::Immediate(_) => Duration::ZERO,
            Self::ExponentialBackoff { base_delay_ms, .. } => {
                let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
                let delay = base_delay_ms.saturating_mul(factor);
                let jitter = fastrand::u64(0..=delay / 2);
                Duration::from_millis(delay.saturating_add(jitter))
            }
        }
    }
}

/// One ingestion request. The arrays are parallel and keep enqueue order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkPayload {
    pub project: String,
    pub run: String,
    pub metrics_list: Vec<Metrics>,
    pub steps: Vec<i64>,
    pub timestamps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Metrics>,
    /// Stable identities, only sent by sync uploads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_ids: Option<Vec<String>>,
}

impl BulkPayload {
    pub fn from_records(run: &RunKey, records: &[StoredRecord]) -> Self {
        let mut payload = Self {
            project: run.project.clone(),
            run: run.run.clone(),
            metrics_list: Vec::with_capacity(records.len()),
            steps: Vec::with_capacity(records.len()),
            timestamps: Vec::with_capacity(records.len()),
            config: None,
            record_ids: None,
        };
        for record in records {
            payload.metrics_list.push(record.metrics.clone());
            payload.steps.push(wire_step(record.step));
            payload.timestamps.push(record.timestamp.clone());
        }
        payload
    }

    #[must_use]
    pub fn with_config(mut self, config: Option<Metrics>) -> Self {
        self.config = config;
        self
    }

    pub fn len(&self) -> usize {
        self.metrics_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics_list.is_empty()
    }
}

/// POSTs JSON payloads with a bounded timeout, one manual redirect hop and
/// retries.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    retry_strategy: RetryStrategy,
}

impl DeliveryClient {
    pub fn new(timeout: Duration, retry_strategy: RetryStrategy) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            // Redirects are followed by hand so the hop count stays at one.
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|err| DeliveryError::Network {
                url: String::new(),
                message: format!("failed to build HTTP client: {err}"),
            })?;
        Ok(Self {
            client,
            retry_strategy,
        })
    }

    pub fn retry_strategy(&self) -> RetryStrategy {
        self.retry_strategy
    }

    /// Serialises `payload` once and sends it, retrying transient failures.
    pub async fn post<T: Serialize + ?Sized>(
        &self,
        url: &str,
        write_token: Option<&str>,
        payload: &T,
    ) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(payload)?;
        let attempts = self.retry_strategy.attempts();
        let mut attempt = 1;
        loop {
            match self.post_once(url, write_token, &body).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let delay = self.retry_strategy.delay(attempt);
                    warn!(
                        "DELIVERY | attempt {attempt}/{attempts} to {url} failed: {err}; retrying in {} ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if attempt > 1 {
                        warn!("DELIVERY | giving up on {url} after {attempt} attempts: {err}");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// One attempt: the request plus at most one redirect hop.
    async fn post_once(
        &self,
        url: &str,
        write_token: Option<&str>,
        body: &[u8],
    ) -> Result<(), DeliveryError> {
        let start = Instant::now();
        let response = self.send(url, write_token, body).await?;
        let status = response.status();
        if !status.is_redirection() {
            return check_response(url, response, start).await;
        }

        let Some(location) = redirect_location(url, &response) else {
            return Err(failure(url, status, read_body(response).await));
        };
        debug!("DELIVERY | {url} redirected ({status}) to {location}");
        let write_token = if same_origin(url, &location) {
            write_token
        } else {
            debug!("DELIVERY | redirect leaves {url}'s origin; write token withheld");
            None
        };
        let response = self.send(&location, write_token, body).await?;
        if response.status().is_redirection() {
            let next = redirect_location(&location, &response)
                .unwrap_or_else(|| "<no location>".to_string());
            return Err(DeliveryError::TooManyRedirects {
                url: url.to_string(),
                location: next,
            });
        }
        check_response(&location, response, start).await
    }

    async fn send(
        &self,
        url: &str,
        write_token: Option<&str>,
        body: &[u8],
    ) -> Result<reqwest::Response, DeliveryError> {
        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec());
        if let Some(token) = write_token {
            request = request.header(WRITE_TOKEN_HEADER, token);
        }
        request.send().await.map_err(|err| {
            if err.is_timeout() {
                DeliveryError::Timeout {
                    url: url.to_string(),
                }
            } else {
                DeliveryError::Network {
                    url: url.to_string(),
                    message: err.to_string(),
                }
            }
        })
    }
}

fn redirect_location(url: &str, response: &reqwest::Response) -> Option<String> {
    if !matches!(
        response.status(),
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    ) {
        return None;
    }
    let location = response.headers().get(LOCATION)?.to_str().ok()?;
    let base = Url::parse(url).ok()?;
    base.join(location).ok().map(String::from)
}

fn same_origin(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => {
            a.scheme() == b.scheme()
                && a.host_str() == b.host_str()
                && a.port_or_known_default() == b.port_or_known_default()
        }
        _ => false,
    }
}

async fn check_response(
    url: &str,
    response: reqwest::Response,
    start: Instant,
) -> Result<(), DeliveryError> {
    let status = response.status();
    if status.is_success() {
        debug!(
            "DELIVERY | POST {url} accepted ({status}) in {} ms",
            start.elapsed().as_millis()
        );
        return Ok(());
    }
    Err(failure(url, status, read_body(response).await))
}

async fn read_body(response: reqwest::Response) -> String {
    let body = response.text().await.unwrap_or_default();
    body.chars().take(MAX_DIAGNOSTIC_BODY).collect()
}

fn failure(url: &str, status: StatusCode, body: String) -> DeliveryError {
    let url = url.to_string();
    let status = status.as_u16();
    match status {
        401 | 403 => DeliveryError::AuthRejected { url, status, body },
        _ => DeliveryError::Status { url, status, body },
    }
}
