// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One JSON object per stdin line, tagged by `type`.
//!
//! ```text
//! {"type":"log","project":"mnist","run":"r1","step":3,"metrics":{"loss":0.4}}
//! {"type":"alert","level":"warn","title":"plateau","text":"no progress"}
//! {"type":"flush"}
//! {"type":"sync","project":"mnist"}
//! ```

use runlog::record::Metrics;
use runlog::{AlertLevel, RunKey};
use serde::Deserialize;

#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputLine {
    Log {
        project: Option<String>,
        run: Option<String>,
        step: Option<i64>,
        timestamp: Option<String>,
        metrics: Metrics,
    },
    Alert {
        project: Option<String>,
        run: Option<String>,
        level: AlertLevel,
        title: String,
        text: Option<String>,
        step: Option<i64>,
        webhook_url: Option<String>,
    },
    Flush,
    Sync {
        project: Option<String>,
    },
}

/// Parses a line; blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<InputLine>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

/// Picks the run a log line belongs to: the line's own project and run, or
/// the default run when the line names neither.
pub fn resolve_run(
    default: Option<&RunKey>,
    project: Option<String>,
    run: Option<String>,
) -> Option<RunKey> {
    match (project, run) {
        (Some(project), Some(run)) => Some(RunKey::new(project, run)),
        (None, None) => default.cloned(),
        (None, Some(run)) => default.map(|key| RunKey::new(key.project.clone(), run)),
        (Some(_), None) => None,
    }
}
