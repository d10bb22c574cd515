// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ordered, one-way schema migrations.
//!
//! Version 1 is the flat layout: a single `metrics` tree holding one row per
//! record with the project and run names inline, plus a `configs` tree keyed by
//! `project \0 run`. Version 2 splits that into a `runs` tree and run-scoped
//! record trees. Each step is safe to re-run after an interruption because it
//! clears its own outputs before rebuilding them, and the version marker is
//! only bumped once a step has completed.

use super::{
    allocate_ids, bump_next_id, keys, Run, StoredRecord, EMPTY, META_TREE, RECORDS_TREE, RUNS_TREE,
    RUN_INDEX_TREE, SCHEMA_VERSION_KEY, STEP_INDEX_TREE,
};
use crate::constants::UNSET_STEP;
use crate::errors::StoreError;
use crate::record::Metrics;
use serde::{Deserialize, Serialize};
use sled::{Batch, Db, Tree};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Schema version written by this release.
pub const SCHEMA_VERSION: u32 = 2;

pub(crate) const LEGACY_METRICS_TREE: &str = "metrics";
pub(crate) const LEGACY_CONFIGS_TREE: &str = "configs";

const WRITE_CHUNK: usize = 1_000;

type Migration = fn(&Db) -> Result<(), StoreError>;

const MIGRATIONS: [(u32, Migration); 2] = [(1, create_flat_layout), (2, split_runs_and_records)];

/// One row of the flat layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LegacyRow {
    pub(crate) timestamp: String,
    pub(crate) project_name: String,
    pub(crate) run_name: String,
    pub(crate) step: i64,
    pub(crate) metrics: Metrics,
}

/// Per-run configuration in the flat layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LegacyConfig {
    pub(crate) config: Metrics,
    pub(crate) created_at: String,
}

/// Brings `db` up to [`SCHEMA_VERSION`] and returns the resulting version.
pub(crate) fn migrate(db: &Db) -> Result<u32, StoreError> {
    let meta = db.open_tree(META_TREE)?;
    let mut version = current_version(db, &meta)?;
    if version > SCHEMA_VERSION {
        return Err(StoreError::Migration {
            version,
            reason: format!("store was written by a newer release (supports up to {SCHEMA_VERSION})"),
        });
    }

    for (target, step) in MIGRATIONS {
        if version >= target {
            continue;
        }
        info!("STORE | migrating schema from version {version} to {target}");
        step(db).map_err(|err| StoreError::Migration {
            version: target,
            reason: err.to_string(),
        })?;
        meta.insert(SCHEMA_VERSION_KEY, &target.to_be_bytes()[..])?;
        db.flush()?;
        version = target;
    }

    // Leftovers of an interrupted migration whose version bump did land.
    drop_flat_layout(db)?;
    Ok(version)
}

fn current_version(db: &Db, meta: &Tree) -> Result<u32, StoreError> {
    if let Some(bytes) = meta.get(SCHEMA_VERSION_KEY)? {
        let buf: [u8; 4] = bytes.as_ref().try_into().map_err(|_| StoreError::Corrupt {
            tree: META_TREE,
            reason: "schema version is not a u32".to_string(),
        })?;
        return Ok(u32::from_be_bytes(buf));
    }
    // Flat stores predate the version marker.
    let has_flat_layout = db
        .tree_names()
        .iter()
        .any(|name| &name[..] == LEGACY_METRICS_TREE.as_bytes());
    Ok(if has_flat_layout { 1 } else { 0 })
}

fn create_flat_layout(db: &Db) -> Result<(), StoreError> {
    db.open_tree(LEGACY_METRICS_TREE)?;
    db.open_tree(LEGACY_CONFIGS_TREE)?;
    Ok(())
}

struct RunDraft {
    first_seq: u64,
    created_at: Option<String>,
    config: Option<Metrics>,
}

fn split_runs_and_records(db: &Db) -> Result<(), StoreError> {
    let meta = db.open_tree(META_TREE)?;
    let legacy = db.open_tree(LEGACY_METRICS_TREE)?;
    let legacy_configs = db.open_tree(LEGACY_CONFIGS_TREE)?;
    let runs = db.open_tree(RUNS_TREE)?;
    let run_index = db.open_tree(RUN_INDEX_TREE)?;
    let records = db.open_tree(RECORDS_TREE)?;
    let step_index = db.open_tree(STEP_INDEX_TREE)?;

    // Partial output of an earlier attempt.
    for tree in [&runs, &run_index, &records, &step_index] {
        tree.clear()?;
    }

    let mut drafts: BTreeMap<(String, String), RunDraft> = BTreeMap::new();
    let mut max_seq = 0u64;
    for entry in legacy.iter() {
        let (key, value) = entry?;
        let seq = legacy_seq(&key)?;
        max_seq = max_seq.max(seq);
        let row: LegacyRow = serde_json::from_slice(&value)?;
        let draft = drafts
            .entry((row.project_name, row.run_name))
            .or_insert(RunDraft {
                first_seq: seq,
                created_at: None,
                config: None,
            });
        draft.first_seq = draft.first_seq.min(seq);
        if !row.timestamp.is_empty()
            && draft
                .created_at
                .as_ref()
                .map_or(true, |current| row.timestamp < *current)
        {
            draft.created_at = Some(row.timestamp);
        }
    }

    for entry in legacy_configs.iter() {
        let (key, value) = entry?;
        let Some((project, name)) = keys::split_run_key(&key) else {
            return Err(StoreError::Corrupt {
                tree: LEGACY_CONFIGS_TREE,
                reason: "config key is not 'project\\0run'".to_string(),
            });
        };
        let legacy_config: LegacyConfig = serde_json::from_slice(&value)?;
        let draft = drafts.entry((project, name)).or_insert(RunDraft {
            first_seq: u64::MAX,
            created_at: None,
            config: None,
        });
        if draft.created_at.is_none() && !legacy_config.created_at.is_empty() {
            draft.created_at = Some(legacy_config.created_at);
        }
        draft.config = Some(legacy_config.config);
    }

    // Carried-over sequence numbers must never be handed out again.
    bump_next_id(&meta, max_seq.saturating_add(1))?;

    let mut ordered: Vec<((String, String), RunDraft)> = drafts.into_iter().collect();
    ordered.sort_by_key(|(_, draft)| draft.first_seq);
    let first_id = allocate_ids(&meta, ordered.len() as u64)?;

    let mut run_ids: BTreeMap<(String, String), u64> = BTreeMap::new();
    let mut runs_batch = Batch::default();
    let mut index_batch = Batch::default();
    for (offset, ((project, name), draft)) in ordered.into_iter().enumerate() {
        let run = Run {
            id: first_id + offset as u64,
            project,
            name,
            group: None,
            created_at: draft.created_at.unwrap_or_else(crate::record::now_iso),
            config: draft.config,
        };
        let key = keys::run_key(&run.project, &run.name);
        runs_batch.insert(key.clone(), serde_json::to_vec(&run)?);
        index_batch.insert(&keys::id_key(run.id)[..], key);
        run_ids.insert((run.project, run.name), run.id);
    }
    runs.apply_batch(runs_batch)?;
    run_index.apply_batch(index_batch)?;
    debug!("STORE | migrated {} runs", run_ids.len());

    let mut records_batch = Batch::default();
    let mut steps_batch = Batch::default();
    let mut pending = 0usize;
    let mut migrated = 0usize;
    for entry in legacy.iter() {
        let (key, value) = entry?;
        let seq = legacy_seq(&key)?;
        let row: LegacyRow = serde_json::from_slice(&value)?;
        let Some(&run_id) = run_ids.get(&(row.project_name, row.run_name)) else {
            continue;
        };
        let step = (row.step != UNSET_STEP).then_some(row.step);
        let record = StoredRecord {
            seq,
            run_id,
            step,
            inserted_at: row.timestamp.clone(),
            timestamp: row.timestamp,
            metrics: row.metrics,
        };
        records_batch.insert(
            &keys::record_key(run_id, seq)[..],
            serde_json::to_vec(&record)?,
        );
        steps_batch.insert(&keys::step_index_key(run_id, step, seq)[..], EMPTY);
        pending += 1;
        migrated += 1;
        if pending == WRITE_CHUNK {
            records.apply_batch(std::mem::take(&mut records_batch))?;
            step_index.apply_batch(std::mem::take(&mut steps_batch))?;
            pending = 0;
        }
    }
    records.apply_batch(records_batch)?;
    step_index.apply_batch(steps_batch)?;
    debug!("STORE | migrated {migrated} records");
    Ok(())
}

fn legacy_seq(key: &[u8]) -> Result<u64, StoreError> {
    keys::decode_u64(key).ok_or_else(|| StoreError::Corrupt {
        tree: LEGACY_METRICS_TREE,
        reason: "row key is not a u64".to_string(),
    })
}

fn drop_flat_layout(db: &Db) -> Result<(), StoreError> {
    for name in [LEGACY_METRICS_TREE, LEGACY_CONFIGS_TREE] {
        match db.drop_tree(name) {
            Ok(_) => {}
            Err(sled::Error::CollectionNotFound(_)) => {}
            Err(err) => return Err(StoreError::Db(err)),
        }
    }
    Ok(())
}
