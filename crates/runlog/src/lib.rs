// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Local-first metrics pipeline.
//!
//! Records emitted by a long-running workload are buffered per run without
//! blocking the caller, drained on a timer (or on demand) into an embedded
//! durable store, and forwarded best-effort to a remote collector. Alerts
//! travel through a side channel that prints and persists synchronously and
//! fans out to webhooks in the background.
//!
//! ```text
//!   caller ──enqueue──> RecordQueue ──swap──> BatchDrainer
//!                                               │
//!                                   persist     │     deliver
//!                              ┌────────────────┴───────────────┐
//!                              v                                v
//!                         LocalStore                  EndpointResolver
//!                      (system of record)             + DeliveryClient
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod alerts;
pub mod config;
pub mod constants;
pub mod delivery;
pub mod drainer;
pub mod endpoint;
pub mod errors;
pub mod names;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod store;
pub mod sync;

pub use alerts::{Alert, AlertLevel, WebhookOutcome};
pub use config::PipelineConfig;
pub use delivery::{DeliveryClient, RemoteTarget, RetryStrategy};
pub use drainer::FlushReport;
pub use errors::{AlertError, ConfigError, DeliveryError, PipelineError, StoreError};
pub use pipeline::{Pipeline, ResumeMode, RunHandle, RunOptions};
pub use record::{MetricRecord, RunKey};
pub use store::LocalStore;
pub use sync::{SyncReconciler, SyncReport, TargetProvisioner};
