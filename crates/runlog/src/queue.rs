// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-run, in-memory buffer of records waiting for the next drain.
//!
//! Every run owns its own shard so draining one run never contends with
//! enqueues on another. Draining swaps the shard's vector for an empty one:
//! records enqueued while a batch is in flight land in the fresh vector and
//! are picked up by the next drain.

use crate::record::{MetricRecord, RunKey};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

type Shard = Arc<Mutex<Vec<MetricRecord>>>;

pub struct RecordQueue {
    shards: RwLock<HashMap<RunKey, Shard>>,
    max_batch: usize,
}

impl RecordQueue {
    #[must_use]
    pub fn new(max_batch: usize) -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            max_batch: max_batch.max(1),
        }
    }

    /// Appends a record to its run's shard.
    ///
    /// Returns `true` each time the shard grows by another `max_batch`
    /// records, signalling that an immediate drain should be scheduled.
    pub fn enqueue(&self, record: MetricRecord) -> bool {
        let shard = self.shard(&record.run);
        let mut buffer = shard.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.push(record);
        buffer.len() % self.max_batch == 0
    }

    /// Takes every buffered record of `run`, leaving an empty buffer behind.
    pub fn swap(&self, run: &RunKey) -> Vec<MetricRecord> {
        let Some(shard) = self.existing_shard(run) else {
            return Vec::new();
        };
        let mut buffer = shard.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *buffer)
    }

    /// Puts a batch back in front of anything enqueued since it was swapped out.
    pub fn restore(&self, run: &RunKey, mut batch: Vec<MetricRecord>) {
        if batch.is_empty() {
            return;
        }
        let shard = self.shard(run);
        let mut buffer = shard.lock().unwrap_or_else(PoisonError::into_inner);
        batch.append(&mut buffer);
        *buffer = batch;
    }

    /// Runs that currently hold at least one record.
    pub fn pending_runs(&self) -> Vec<RunKey> {
        let shards = self.shards.read().unwrap_or_else(PoisonError::into_inner);
        shards
            .iter()
            .filter(|(_, shard)| {
                !shard
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_empty()
            })
            .map(|(run, _)| run.clone())
            .collect()
    }

    pub fn len(&self, run: &RunKey) -> usize {
        self.existing_shard(run).map_or(0, |shard| {
            shard.lock().unwrap_or_else(PoisonError::into_inner).len()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.pending_runs().is_empty()
    }

    /// Drops the shard of a deleted run along with anything still buffered.
    pub fn forget(&self, run: &RunKey) {
        let mut shards = self.shards.write().unwrap_or_else(PoisonError::into_inner);
        shards.remove(run);
    }

    fn existing_shard(&self, run: &RunKey) -> Option<Shard> {
        let shards = self.shards.read().unwrap_or_else(PoisonError::into_inner);
        shards.get(run).map(Arc::clone)
    }

    fn shard(&self, run: &RunKey) -> Shard {
        if let Some(shard) = self.existing_shard(run) {
            return shard;
        }
        let mut shards = self.shards.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(shards.entry(run.clone()).or_default())
    }
}
