// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Alert side channel.
//!
//! An alert is printed and persisted on the caller's path, then handed to a
//! background service that fans it out to a webhook. Webhook delivery is
//! best-effort and filtered by a minimum level; printing and persistence are
//! not.

pub mod dispatcher;
pub mod format;

pub use dispatcher::{AlertDispatcher, AlertDispatcherService, WebhookJob};
pub use format::WebhookFormat;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Alert severity. Ordered `Info < Warn < Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warn,
    Error,
}

impl AlertLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Self::Info => "\x1b[94m",
            Self::Warn => "\x1b[93m",
            Self::Error => "\x1b[91m",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!(
                "unknown alert level '{other}', expected one of: info, warn, error"
            )),
        }
    }
}

/// An alert raised by the workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub title: String,
    pub text: Option<String>,
    pub project: String,
    pub run: Option<String>,
    pub step: Option<i64>,
    pub timestamp: String,
}

impl Alert {
    pub fn new(level: AlertLevel, title: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            text: None,
            project: project.into(),
            run: None,
            step: None,
            timestamp: crate::record::now_iso(),
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_run(mut self, run: impl Into<String>) -> Self {
        self.run = Some(run.into());
        self
    }

    #[must_use]
    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    /// Coloured single-line rendering used on the terminal.
    #[must_use]
    pub fn terminal_line(&self) -> String {
        const RESET: &str = "\x1b[0m";
        let step = self
            .step
            .map(|s| format!(" (step {s})"))
            .unwrap_or_default();
        let label = self.level.as_str().to_uppercase();
        match self.text.as_deref().filter(|t| !t.is_empty()) {
            Some(text) => format!(
                "{}[RUNLOG {label}]{RESET} {}: {text}{step}",
                self.level.color(),
                self.title
            ),
            None => format!(
                "{}[RUNLOG {label}]{RESET} {}{step}",
                self.level.color(),
                self.title
            ),
        }
    }
}

/// What happened to an alert on its way to a webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Queued for the background sender.
    Pending,
    Delivered,
    Failed { message: String },
    /// Below the configured minimum level.
    Suppressed,
    /// No webhook address for this alert.
    NotConfigured,
}
