// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-target cache of the ingestion path that accepts batches.
//!
//! The first delivery to a target walks the candidate paths in order, using
//! the real payload as the probe. The first path to accept it is cached for
//! the life of the resolver; if none does, nothing is cached and the next
//! delivery probes again.

use crate::constants::{BULK_ALERT_PATHS, BULK_LOG_PATHS};
use crate::delivery::{DeliveryClient, RemoteTarget};
use crate::errors::DeliveryError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub struct EndpointResolver {
    candidates: Vec<&'static str>,
    targets: RwLock<HashMap<String, Arc<OnceCell<&'static str>>>>,
}

impl EndpointResolver {
    #[must_use]
    pub fn new(candidates: &[&'static str]) -> Self {
        Self {
            candidates: candidates.to_vec(),
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Resolver over the metric ingestion paths.
    #[must_use]
    pub fn for_metrics() -> Self {
        Self::new(&BULK_LOG_PATHS)
    }

    /// Resolver over the alert upload paths.
    #[must_use]
    pub fn for_alerts() -> Self {
        Self::new(&BULK_ALERT_PATHS)
    }

    /// The path cached for `target`, if one has been resolved.
    pub fn cached(&self, target: &RemoteTarget) -> Option<&'static str> {
        let targets = self.targets.read().unwrap_or_else(PoisonError::into_inner);
        targets
            .get(target.base_url())
            .and_then(|cell| cell.get().copied())
    }

    /// Delivers `payload` to `target`, resolving the ingestion path first if
    /// needed. Returns the path that accepted it.
    pub async fn deliver<T>(
        &self,
        client: &DeliveryClient,
        target: &RemoteTarget,
        payload: &T,
    ) -> Result<&'static str, DeliveryError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let cell = self.cell(target);
        if let Some(&path) = cell.get() {
            client
                .post(&target.url_for(path), target.write_token(), payload)
                .await?;
            return Ok(path);
        }

        let delivered_flag = AtomicBool::new(false);
        let delivered = &delivered_flag;
        let candidates = &self.candidates;
        let path = *cell
            .get_or_try_init(move || async move {
                let mut last = None;
                for candidate in candidates {
                    let url = target.url_for(candidate);
                    match client.post(&url, target.write_token(), payload).await {
                        Ok(()) => {
                            delivered.store(true, Ordering::Release);
                            info!("DELIVERY | resolved ingestion path {url}");
                            return Ok(*candidate);
                        }
                        Err(err @ DeliveryError::AuthRejected { .. }) => return Err(err),
                        Err(err) => {
                            debug!("DELIVERY | candidate {url} refused the batch: {err}");
                            last = Some(err);
                        }
                    }
                }
                Err(DeliveryError::EndpointNotFound {
                    target: target.base_url().to_string(),
                    last: Box::new(last.unwrap_or_else(|| {
                        DeliveryError::InvalidTarget("no candidate paths".to_string())
                    })),
                })
            })
            .await?;

        // Another task won the race to resolve; our payload still has to go.
        if !delivered_flag.load(Ordering::Acquire) {
            client
                .post(&target.url_for(path), target.write_token(), payload)
                .await?;
        }
        Ok(path)
    }

    fn cell(&self, target: &RemoteTarget) -> Arc<OnceCell<&'static str>> {
        {
            let targets = self.targets.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(cell) = targets.get(target.base_url()) {
                return Arc::clone(cell);
            }
        }
        let mut targets = self.targets.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            targets
                .entry(target.base_url().to_string())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::RetryStrategy;
    use serde_json::json;
    use std::time::Duration;

    fn client() -> DeliveryClient {
        DeliveryClient::new(Duration::from_secs(2), RetryStrategy::Immediate(1)).unwrap()
    }

    #[tokio::test]
    async fn test_canonical_path_is_cached() {
        let mut server = mockito::Server::new_async().await;
        let canonical = server
            .mock("POST", "/api/bulk_log")
            .with_status(200)
            .expect(2)
            .create_async()
            .await;
        let legacy = server
            .mock("POST", "/gradio_api/bulk_log")
            .expect(0)
            .create_async()
            .await;

        let resolver = EndpointResolver::for_metrics();
        let target = RemoteTarget::new(server.url(), None);
        assert_eq!(resolver.cached(&target), None);
        for _ in 0..2 {
            let path = resolver
                .deliver(&client(), &target, &json!({"n": 1}))
                .await
                .unwrap();
            assert_eq!(path, "/api/bulk_log");
        }
        assert_eq!(resolver.cached(&target), Some("/api/bulk_log"));
        canonical.assert_async().await;
        legacy.assert_async().await;
    }

    #[tokio::test]
    async fn test_all_candidates_failing_caches_nothing() {
        let mut server = mockito::Server::new_async().await;
        let canonical = server
            .mock("POST", "/api/bulk_log")
            .with_status(404)
            .expect(2)
            .create_async()
            .await;
        let legacy = server
            .mock("POST", "/gradio_api/bulk_log")
            .with_status(404)
            .with_body("gone")
            .expect(2)
            .create_async()
            .await;

        let resolver = EndpointResolver::for_metrics();
        let target = RemoteTarget::new(server.url(), None);
        for _ in 0..2 {
            let err = resolver
                .deliver(&client(), &target, &json!({}))
                .await
                .unwrap_err();
            match err {
                DeliveryError::EndpointNotFound { last, .. } => {
                    assert_eq!(last.status(), Some(404));
                    assert!(last.to_string().contains("gradio_api"));
                }
                other => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(resolver.cached(&target), None);
        canonical.assert_async().await;
        legacy.assert_async().await;
    }

    #[tokio::test]
    async fn test_auth_rejection_stops_probing() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/bulk_log")
            .with_status(403)
            .create_async()
            .await;
        let legacy = server
            .mock("POST", "/gradio_api/bulk_log")
            .expect(0)
            .create_async()
            .await;

        let resolver = EndpointResolver::for_metrics();
        let target = RemoteTarget::new(server.url(), Some("bad".into()));
        let err = resolver
            .deliver(&client(), &target, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::AuthRejected { status: 403, .. }));
        legacy.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_first_deliveries_resolve_once() {
        let mut server = mockito::Server::new_async().await;
        let canonical = server
            .mock("POST", "/api/bulk_log")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;
        let mut fallback = Vec::new();
        for n in [1, 2] {
            fallback.push(
                server
                    .mock("POST", "/gradio_api/bulk_log")
                    .match_body(mockito::Matcher::Json(json!({"n": n})))
                    .with_status(200)
                    .expect(1)
                    .create_async()
                    .await,
            );
        }

        let resolver = EndpointResolver::for_metrics();
        let client = client();
        let target = RemoteTarget::new(server.url(), None);
        let (first, second) = (json!({"n": 1}), json!({"n": 2}));
        let (a, b) = tokio::join!(
            resolver.deliver(&client, &target, &first),
            resolver.deliver(&client, &target, &second)
        );
        assert_eq!(a.unwrap(), "/gradio_api/bulk_log");
        assert_eq!(b.unwrap(), "/gradio_api/bulk_log");
        assert_eq!(resolver.cached(&target), Some("/gradio_api/bulk_log"));

        canonical.assert_async().await;
        for mock in &fallback {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn test_targets_are_independent() {
        let mut first = mockito::Server::new_async().await;
        let mut second = mockito::Server::new_async().await;
        first
            .mock("POST", "/api/bulk_log")
            .with_status(200)
            .create_async()
            .await;
        second
            .mock("POST", "/api/bulk_log")
            .with_status(404)
            .create_async()
            .await;
        second
            .mock("POST", "/gradio_api/bulk_log")
            .with_status(200)
            .create_async()
            .await;

        let resolver = EndpointResolver::for_metrics();
        let client = client();
        let payload = json!({});
        let a = RemoteTarget::new(first.url(), None);
        let b = RemoteTarget::new(second.url(), None);
        let (ra, rb) = tokio::join!(
            resolver.deliver(&client, &a, &payload),
            resolver.deliver(&client, &b, &payload)
        );
        assert_eq!(ra.unwrap(), "/api/bulk_log");
        assert_eq!(rb.unwrap(), "/gradio_api/bulk_log");
    }
}
