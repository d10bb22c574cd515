// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Buffered records per run that trigger an immediate drain.
pub const DEFAULT_MAX_BATCH: usize = 128;

/// Periodic drain interval, in milliseconds.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 200;

/// Per-attempt request timeout, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Delivery attempts per batch (first try included).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay of the exponential backoff, in milliseconds.
pub const DEFAULT_RETRY_BASE_MS: u64 = 50;

/// Upper bound for an explicit `flush()`, in milliseconds.
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 30_000;

/// Upper bound for the final flush on shutdown, in milliseconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 3_000;

/// Records per upload request during a sync.
pub const DEFAULT_SYNC_CHUNK_SIZE: usize = 500;

/// Ingestion paths tried in order; the first to accept a batch is cached.
pub const BULK_LOG_PATHS: [&str; 2] = ["/api/bulk_log", "/gradio_api/bulk_log"];

/// Alert upload paths used by the sync reconciler.
pub const BULK_ALERT_PATHS: [&str; 2] = ["/api/bulk_alerts", "/gradio_api/bulk_alerts"];

/// Header carrying the optional write token.
pub const WRITE_TOKEN_HEADER: &str = "X-Runlog-Write-Token";

/// Wire value for a record whose step was never set.
pub const UNSET_STEP: i64 = -1;

/// Metric keys owned by the pipeline itself.
pub const RESERVED_KEYS: [&str; 5] = ["project", "run", "timestamp", "step", "time"];

/// Longest response body kept for diagnostics.
pub const MAX_DIAGNOSTIC_BODY: usize = 2_048;
