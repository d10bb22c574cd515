// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod input;

use input::InputLine;
use runlog::record::now_iso;
use runlog::{
    Alert, MetricRecord, Pipeline, PipelineConfig, ResumeMode, RunHandle, RunKey, RunOptions,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
pub async fn main() {
    let config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error creating config on runlog agent startup: {e}");
            return;
        }
    };

    let env_filter = format!(
        "h2=off,hyper=off,rustls=off,reqwest=off,sled=off,{}",
        config.log_level
    );

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let pipeline = match Pipeline::open(config.clone()) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("AGENT | failed to start pipeline: {e}");
            return;
        }
    };

    let default_run = match &config.project {
        Some(project) => {
            let mut options = RunOptions::new(project.clone()).with_resume(ResumeMode::Allow);
            if let Some(run) = &config.run {
                options = options.with_name(run.clone());
            }
            match pipeline.init_run(options).await {
                Ok(handle) => {
                    info!("AGENT | default run {}", handle.key());
                    Some(handle)
                }
                Err(e) => {
                    error!("AGENT | failed to initialise run: {e}");
                    pipeline.shutdown().await;
                    return;
                }
            }
        }
        None => None,
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("AGENT | interrupted, shutting down");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&pipeline, default_run.as_ref(), &line).await,
                Ok(None) => {
                    debug!("AGENT | end of input");
                    break;
                }
                Err(e) => {
                    error!("AGENT | failed to read stdin: {e}");
                    break;
                }
            },
        }
    }

    pipeline.shutdown().await;
}

async fn handle_line(pipeline: &Pipeline, default_run: Option<&RunHandle>, line: &str) {
    let parsed = match input::parse(line) {
        Ok(Some(parsed)) => parsed,
        Ok(None) => return,
        Err(e) => {
            warn!("AGENT | skipping malformed line: {e}");
            return;
        }
    };
    let default_key = default_run.map(RunHandle::key);

    match parsed {
        InputLine::Log {
            project,
            run,
            step,
            timestamp,
            metrics,
        } => {
            let Some(key) = input::resolve_run(default_key, project, run) else {
                warn!("AGENT | log line names no run and there is no default run; dropped");
                return;
            };
            let mut record = MetricRecord::new(key, metrics)
                .with_timestamp(timestamp.unwrap_or_else(now_iso));
            if let Some(step) = step {
                record = record.with_step(step);
            }
            pipeline.enqueue(record);
        }
        InputLine::Alert {
            project,
            run,
            level,
            title,
            text,
            step,
            webhook_url,
        } => {
            let Some(project) = project.or_else(|| default_key.map(|k| k.project.clone())) else {
                warn!("AGENT | alert names no project and there is no default run; dropped");
                return;
            };
            let mut alert = Alert::new(level, title, project.clone());
            let run = run.or_else(|| {
                default_key
                    .filter(|k| k.project == project)
                    .map(|k| k.run.clone())
            });
            if let Some(run) = run {
                alert = alert.with_run(run);
            }
            if let Some(text) = text {
                alert = alert.with_text(text);
            }
            if let Some(step) = step {
                alert = alert.with_step(step);
            }
            let result = match webhook_url.as_deref() {
                Some(url) => pipeline.alert_to(alert, url),
                None => pipeline.alert(alert),
            };
            if let Err(e) = result {
                error!("AGENT | failed to record alert: {e}");
            }
        }
        InputLine::Flush => match pipeline.flush().await {
            Ok(report) => info!(
                "AGENT | flushed: persisted {}, delivered {}, rejected {}",
                report.persisted, report.delivered, report.rejected
            ),
            Err(e) => error!("AGENT | flush failed: {e}"),
        },
        InputLine::Sync { project } => {
            let Some(project) = project.or_else(|| default_key.map(|k: &RunKey| k.project.clone()))
            else {
                warn!("AGENT | sync names no project and there is no default run; ignored");
                return;
            };
            if let Err(e) = pipeline.flush().await {
                warn!("AGENT | flush before sync failed: {e}");
            }
            match pipeline.sync(&project, None).await {
                Ok(report) => info!(
                    "AGENT | synced {project}: {} runs, {} records, {} alerts",
                    report.runs, report.records, report.alerts
                ),
                Err(e) => error!("AGENT | sync of {project} failed: {e}"),
            }
        }
    }
}
