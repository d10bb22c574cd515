// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::{RESERVED_KEYS, UNSET_STEP};
use crate::errors::SchemaViolation;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Schemaless metric values keyed by name.
pub type Metrics = serde_json::Map<String, serde_json::Value>;

/// Identifies one run inside one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
    pub project: String,
    pub run: String,
}

impl RunKey {
    pub fn new(project: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            run: run.into(),
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.run)
    }
}

/// A record as emitted by the caller, before it reaches the store.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub run: RunKey,
    /// `None` means the caller never set a step.
    pub step: Option<i64>,
    /// ISO-8601; empty means the collector assigns the time.
    pub timestamp: String,
    pub metrics: Metrics,
}

impl MetricRecord {
    pub fn new(run: RunKey, metrics: Metrics) -> Self {
        Self {
            run,
            step: None,
            timestamp: String::new(),
            metrics,
        }
    }

    #[must_use]
    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    /// Checks the record against the rules enforced at persistence time.
    pub fn validate(&self) -> Result<(), SchemaViolation> {
        validate_metrics(&self.metrics)?;
        if self.step == Some(UNSET_STEP) {
            return Err(SchemaViolation::ReservedStep);
        }
        Ok(())
    }
}

pub(crate) fn validate_metrics(metrics: &Metrics) -> Result<(), SchemaViolation> {
    if metrics.is_empty() {
        return Err(SchemaViolation::EmptyMetrics);
    }
    if let Some(key) = metrics
        .keys()
        .find(|k| RESERVED_KEYS.contains(&k.as_str()) || k.starts_with("__"))
    {
        return Err(SchemaViolation::ReservedKey(key.clone()));
    }
    Ok(())
}

/// Current UTC time as RFC 3339.
pub fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Maps an optional step onto the wire representation.
pub(crate) fn wire_step(step: Option<i64>) -> i64 {
    step.unwrap_or(UNSET_STEP)
}
