// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the pipeline.

use std::time::Duration;

/// Errors raised by the local durable store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("run '{run}' does not exist in project '{project}'")]
    UnknownRun { project: String, run: String },
    #[error("alert {0} does not exist")]
    UnknownAlert(u64),
    #[error("migration to schema version {version} failed: {reason}")]
    Migration { version: u32, reason: String },
    #[error("corrupt entry in tree '{tree}': {reason}")]
    Corrupt { tree: &'static str, reason: String },
}

/// A single record refused at persistence time. The rest of its batch commits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaViolation {
    #[error("metric key '{0}' is reserved")]
    ReservedKey(String),
    #[error("record carries no metrics")]
    EmptyMetrics,
    #[error("step -1 is reserved for unset steps; pass no step instead")]
    ReservedStep,
}

/// Errors raised while shipping a payload to a remote collector.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("network error posting to {url}: {message}")]
    Network { url: String, message: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("POST {url} -> {status}; body: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("POST {url} rejected with {status}: write token refused; body: {body}")]
    AuthRejected {
        url: String,
        status: u16,
        body: String,
    },
    #[error("POST {url} redirected twice (second hop to {location}); refusing to follow")]
    TooManyRedirects { url: String, location: String },
    #[error("no ingestion path accepted the batch at {target}; last error: {last}")]
    EndpointNotFound {
        target: String,
        last: Box<DeliveryError>,
    },
    #[error("invalid target address '{0}'")]
    InvalidTarget(String),
    #[error("failed to encode payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Network errors, timeouts and server errors are worth another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// HTTP status of the last response seen, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } | Self::AuthRejected { status, .. } => Some(*status),
            Self::EndpointNotFound { last, .. } => last.status(),
            _ => None,
        }
    }
}

/// Errors raised by the alert side channel.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("failed to persist alert: {0}")]
    Persist(#[from] StoreError),
    #[error("alert dispatcher is shut down")]
    ShutDown,
}

/// Errors raised while building configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced by explicit pipeline calls (`flush`, `sync`, `init_run`).
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Alert(#[from] AlertError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("flush did not complete within {0:?}")]
    Timeout(Duration),
    #[error("run '{run}' already exists in project '{project}'")]
    RunExists { project: String, run: String },
    #[error("a run name is required when resuming")]
    MissingRunName,
    #[error("failed to provision remote target: {0}")]
    Provision(String),
    #[error("pipeline is shut down")]
    ShutDown,
    #[error("background task failed: {0}")]
    Join(String),
}
