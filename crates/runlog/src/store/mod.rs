// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sled-backed local durable store.
//!
//! Layout:
//!
//! | tree          | key                      | value            |
//! |---------------|--------------------------|------------------|
//! | `__meta`      | `schema_version`/`next_id` | big-endian ints |
//! | `runs`        | `project \0 name`        | [`Run`] JSON     |
//! | `run_index`   | `run_id`                 | runs key         |
//! | `records`     | `run_id \| seq`          | [`StoredRecord`] |
//! | `step_index`  | `run_id \| step \| seq`  | empty            |
//! | `outbox`      | `run_id \| seq`          | empty            |
//! | `alerts`      | `seq`                    | [`StoredAlert`]  |
//! | `sync_ledger` | `target \0 scope`        | last synced seq  |
//!
//! Sequence numbers come from one store-wide counter, so they are unique
//! across runs and alerts and increase in insertion order.

pub(crate) mod keys;
pub mod migrations;

use crate::alerts::{Alert, WebhookOutcome};
use crate::errors::{PipelineError, SchemaViolation, StoreError};
use crate::record::{now_iso, MetricRecord, Metrics, RunKey};
use serde::{Deserialize, Serialize};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError, Transactional,
};
use sled::{Batch, Config as SledConfig, Db, Tree};
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::debug;

pub(crate) const META_TREE: &str = "__meta";
pub(crate) const RUNS_TREE: &str = "runs";
pub(crate) const RUN_INDEX_TREE: &str = "run_index";
pub(crate) const RECORDS_TREE: &str = "records";
pub(crate) const STEP_INDEX_TREE: &str = "step_index";
const OUTBOX_TREE: &str = "outbox";
const ALERTS_TREE: &str = "alerts";
const LEDGER_TREE: &str = "sync_ledger";

pub(crate) const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";
const NEXT_ID_KEY: &[u8] = b"next_id";

pub(crate) const EMPTY: &[u8] = &[];

/// A run as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: u64,
    pub project: String,
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub config: Option<Metrics>,
}

impl Run {
    #[must_use]
    pub fn key(&self) -> RunKey {
        RunKey::new(self.project.clone(), self.name.clone())
    }
}

/// A record as persisted. `seq` is its durable identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub seq: u64,
    pub run_id: u64,
    pub step: Option<i64>,
    pub timestamp: String,
    pub inserted_at: String,
    pub metrics: Metrics,
}

/// An alert as persisted, with what happened on its way to a webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAlert {
    pub seq: u64,
    #[serde(flatten)]
    pub alert: Alert,
    pub webhook: WebhookOutcome,
}

/// A record refused by [`LocalStore::append_batch`], by position in its batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    pub index: usize,
    pub violation: SchemaViolation,
}

#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// `None` when every record was rejected and the run did not exist yet.
    pub run: Option<Run>,
    pub stored: Vec<StoredRecord>,
    pub rejected: Vec<RejectedRecord>,
}

/// Durable store for runs, records, alerts and sync progress.
#[derive(Debug, Clone)]
pub struct LocalStore {
    db: Db,
    path: PathBuf,
    schema_version: u32,
    meta: Tree,
    runs: Tree,
    run_index: Tree,
    records: Tree,
    step_index: Tree,
    outbox: Tree,
    alerts: Tree,
    ledger: Tree,
}

impl LocalStore {
    /// Opens (or creates) the store at `path`, migrating it to the current
    /// schema first.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                // sled does not create intermediate directories.
                fs::create_dir_all(parent)?;
            }
        }
        let db = SledConfig::new()
            .path(&path)
            .cache_capacity(64 * 1024 * 1024)
            .open()?;
        Self::from_db(db, path)
    }

    /// Opens an in-memory store that disappears when dropped.
    pub fn open_temporary() -> Result<Self, StoreError> {
        let db = SledConfig::new().temporary(true).open()?;
        Self::from_db(db, PathBuf::new())
    }

    fn from_db(db: Db, path: PathBuf) -> Result<Self, StoreError> {
        let schema_version = migrations::migrate(&db)?;
        Ok(Self {
            meta: db.open_tree(META_TREE)?,
            runs: db.open_tree(RUNS_TREE)?,
            run_index: db.open_tree(RUN_INDEX_TREE)?,
            records: db.open_tree(RECORDS_TREE)?,
            step_index: db.open_tree(STEP_INDEX_TREE)?,
            outbox: db.open_tree(OUTBOX_TREE)?,
            alerts: db.open_tree(ALERTS_TREE)?,
            ledger: db.open_tree(LEDGER_TREE)?,
            db,
            path,
            schema_version,
        })
    }

    /// Filesystem path backing the store; empty for temporary stores.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ---------------------------------------------------------------- runs

    pub fn run(&self, project: &str, name: &str) -> Result<Option<Run>, StoreError> {
        self.runs
            .get(keys::run_key(project, name))?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .map_err(StoreError::from)
    }

    pub fn run_by_id(&self, id: u64) -> Result<Option<Run>, StoreError> {
        let Some(key) = self.run_index.get(keys::id_key(id))? else {
            return Ok(None);
        };
        self.runs
            .get(key)?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .map_err(StoreError::from)
    }

    fn require_run(&self, project: &str, name: &str) -> Result<Run, StoreError> {
        self.run(project, name)?.ok_or_else(|| StoreError::UnknownRun {
            project: project.to_string(),
            run: name.to_string(),
        })
    }

    /// Runs of a project in creation order.
    pub fn runs(&self, project: &str) -> Result<Vec<Run>, StoreError> {
        let mut runs = Vec::new();
        for entry in self.runs.scan_prefix(keys::project_prefix(project)) {
            let (_, value) = entry?;
            runs.push(serde_json::from_slice::<Run>(&value)?);
        }
        runs.sort_by_key(|run| run.id);
        Ok(runs)
    }

    /// Every project holding at least one run, sorted by name.
    pub fn projects(&self) -> Result<Vec<String>, StoreError> {
        let mut projects: Vec<String> = Vec::new();
        for entry in self.runs.iter() {
            let (key, _) = entry?;
            let Some((project, _)) = keys::split_run_key(&key) else {
                return Err(StoreError::Corrupt {
                    tree: RUNS_TREE,
                    reason: "run key is not 'project\\0name'".to_string(),
                });
            };
            if projects.last() != Some(&project) {
                projects.push(project);
            }
        }
        Ok(projects)
    }

    /// Creates the run if absent, otherwise updates whichever of `group` and
    /// `config` are given. Returns the run and whether it was created.
    pub fn ensure_run(
        &self,
        project: &str,
        name: &str,
        group: Option<String>,
        config: Option<Metrics>,
    ) -> Result<(Run, bool), StoreError> {
        let id = allocate_ids(&self.meta, 1)?;
        let candidate = Run {
            id,
            project: project.to_string(),
            name: name.to_string(),
            group: group.clone(),
            created_at: now_iso(),
            config: config.clone(),
        };
        let key = keys::run_key(project, name);
        let result = (&self.runs, &self.run_index).transaction(
            |(runs, run_index)| -> ConflictableTransactionResult<(Run, bool), StoreError> {
                match runs.get(key.as_slice())? {
                    Some(bytes) => {
                        let mut run: Run = serde_json::from_slice(&bytes).map_err(abort)?;
                        if group.is_some() {
                            run.group = group.clone();
                        }
                        if config.is_some() {
                            run.config = config.clone();
                        }
                        runs.insert(key.as_slice(), serde_json::to_vec(&run).map_err(abort)?)?;
                        Ok((run, false))
                    }
                    None => {
                        runs.insert(
                            key.as_slice(),
                            serde_json::to_vec(&candidate).map_err(abort)?,
                        )?;
                        run_index.insert(&keys::id_key(candidate.id)[..], key.as_slice())?;
                        Ok((candidate.clone(), true))
                    }
                }
            },
        );
        let outcome = result.map_err(tx_error)?;
        self.db.flush()?;
        Ok(outcome)
    }

    /// Deletes a run with its records, pending deliveries and sync progress.
    /// Returns `false` when the run did not exist.
    pub fn delete_run(&self, project: &str, name: &str) -> Result<bool, StoreError> {
        let Some(run) = self.run(project, name)? else {
            return Ok(false);
        };
        let prefix = keys::id_key(run.id);
        let record_keys = collect_keys(&self.records, &prefix)?;
        let step_keys = collect_keys(&self.step_index, &prefix)?;
        let outbox_keys = collect_keys(&self.outbox, &prefix)?;
        let scopes = [run_scope(run.id), config_scope(run.id)];
        let mut ledger_keys = Vec::new();
        for entry in self.ledger.iter() {
            let (key, _) = entry?;
            let owned = scopes.iter().any(|scope| {
                key.ends_with(scope.as_bytes())
                    && key.len() > scope.len()
                    && key[key.len() - scope.len() - 1] == 0
            });
            if owned {
                ledger_keys.push(key.to_vec());
            }
        }
        let run_key = keys::run_key(project, name);

        (
            &self.runs,
            &self.run_index,
            &self.records,
            &self.step_index,
            &self.outbox,
            &self.ledger,
        )
            .transaction(
                |(runs, run_index, records, step_index, outbox, ledger)| -> ConflictableTransactionResult<(), StoreError> {
                    runs.remove(run_key.as_slice())?;
                    run_index.remove(&prefix[..])?;
                    for key in &record_keys {
                        records.remove(key.as_slice())?;
                    }
                    for key in &step_keys {
                        step_index.remove(key.as_slice())?;
                    }
                    for key in &outbox_keys {
                        outbox.remove(key.as_slice())?;
                    }
                    for key in &ledger_keys {
                        ledger.remove(key.as_slice())?;
                    }
                    Ok(())
                },
            )
            .map_err(tx_error)?;
        self.db.flush()?;
        debug!(
            "STORE | deleted run {project}/{name} with {} records",
            record_keys.len()
        );
        Ok(true)
    }

    // ------------------------------------------------------------- records

    /// Persists a batch for one run in a single transaction.
    ///
    /// Records that violate the schema are reported back and left out; the
    /// rest commit together or not at all. The run is created on first use.
    /// With `enqueue_outbox`, every stored record is also queued for delivery.
    pub fn append_batch(
        &self,
        run: &RunKey,
        records: &[MetricRecord],
        enqueue_outbox: bool,
    ) -> Result<AppendOutcome, StoreError> {
        let mut accepted = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();
        for (index, record) in records.iter().enumerate() {
            match record.validate() {
                Ok(()) => accepted.push(record),
                Err(violation) => rejected.push(RejectedRecord { index, violation }),
            }
        }
        if accepted.is_empty() {
            return Ok(AppendOutcome {
                run: self.run(&run.project, &run.run)?,
                stored: Vec::new(),
                rejected,
            });
        }

        // One id for a run that may need creating, then one per record.
        let first_id = allocate_ids(&self.meta, accepted.len() as u64 + 1)?;
        let inserted_at = now_iso();
        let candidate = Run {
            id: first_id,
            project: run.project.clone(),
            name: run.run.clone(),
            group: None,
            created_at: accepted
                .iter()
                .map(|r| r.timestamp.as_str())
                .find(|ts| !ts.is_empty())
                .map_or_else(|| inserted_at.clone(), str::to_string),
            config: None,
        };
        let run_key = keys::run_key(&run.project, &run.run);

        let (run, stored) = (
            &self.runs,
            &self.run_index,
            &self.records,
            &self.step_index,
            &self.outbox,
        )
            .transaction(
                |(runs, run_index, records, step_index, outbox)| -> ConflictableTransactionResult<(Run, Vec<StoredRecord>), StoreError> {
                    let run = match runs.get(run_key.as_slice())? {
                        Some(bytes) => serde_json::from_slice::<Run>(&bytes).map_err(abort)?,
                        None => {
                            runs.insert(
                                run_key.as_slice(),
                                serde_json::to_vec(&candidate).map_err(abort)?,
                            )?;
                            run_index.insert(&keys::id_key(candidate.id)[..], run_key.as_slice())?;
                            candidate.clone()
                        }
                    };
                    let mut stored = Vec::with_capacity(accepted.len());
                    for (offset, record) in accepted.iter().enumerate() {
                        let seq = first_id + 1 + offset as u64;
                        let row = StoredRecord {
                            seq,
                            run_id: run.id,
                            step: record.step,
                            timestamp: if record.timestamp.is_empty() {
                                inserted_at.clone()
                            } else {
                                record.timestamp.clone()
                            },
                            inserted_at: inserted_at.clone(),
                            metrics: record.metrics.clone(),
                        };
                        let key = keys::record_key(run.id, seq);
                        records.insert(&key[..], serde_json::to_vec(&row).map_err(abort)?)?;
                        step_index.insert(&keys::step_index_key(run.id, record.step, seq)[..], EMPTY)?;
                        if enqueue_outbox {
                            outbox.insert(&key[..], EMPTY)?;
                        }
                        stored.push(row);
                    }
                    Ok((run, stored))
                },
            )
            .map_err(tx_error)?;
        self.db.flush()?;

        Ok(AppendOutcome {
            run: Some(run),
            stored,
            rejected,
        })
    }

    /// Every record of a run in insertion order.
    pub fn records(&self, project: &str, name: &str) -> Result<Vec<StoredRecord>, StoreError> {
        let run = self.require_run(project, name)?;
        self.records_after(run.id, 0, usize::MAX)
    }

    /// Up to `limit` records of a run with `seq > after`, in insertion order.
    pub fn records_after(
        &self,
        run_id: u64,
        after: u64,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let Some(start) = after.checked_add(1) else {
            return Ok(Vec::new());
        };
        let range = keys::record_key(run_id, start)..=keys::record_key(run_id, u64::MAX);
        let mut out = Vec::new();
        for entry in self.records.range(range).take(limit) {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    /// Records with a step inside `steps`, ordered by step then insertion.
    pub fn records_in_step_range(
        &self,
        project: &str,
        name: &str,
        steps: RangeInclusive<i64>,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let run = self.require_run(project, name)?;
        let range = keys::step_index_key(run.id, Some(*steps.start()), 0)
            ..=keys::step_index_key(run.id, Some(*steps.end()), u64::MAX);
        self.resolve_step_entries(run.id, self.step_index.range(range))
    }

    /// Records logged at exactly `step`; `None` selects records without a step.
    pub fn records_at_step(
        &self,
        project: &str,
        name: &str,
        step: Option<i64>,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let run = self.require_run(project, name)?;
        let prefix = keys::step_prefix(run.id, step);
        self.resolve_step_entries(run.id, self.step_index.scan_prefix(prefix))
    }

    /// Highest step logged for a run, if any record carries one.
    pub fn last_step(&self, project: &str, name: &str) -> Result<Option<i64>, StoreError> {
        let Some(run) = self.run(project, name)? else {
            return Ok(None);
        };
        let Some(entry) = self.step_index.scan_prefix(keys::id_key(run.id)).next_back() else {
            return Ok(None);
        };
        let (key, _) = entry?;
        let (step, _) = keys::split_step_index_key(&key).ok_or_else(|| StoreError::Corrupt {
            tree: STEP_INDEX_TREE,
            reason: "malformed step index key".to_string(),
        })?;
        Ok(step)
    }

    fn resolve_step_entries(
        &self,
        run_id: u64,
        entries: sled::Iter,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let mut out = Vec::new();
        for entry in entries {
            let (key, _) = entry?;
            let (_, seq) =
                keys::split_step_index_key(&key).ok_or_else(|| StoreError::Corrupt {
                    tree: STEP_INDEX_TREE,
                    reason: "malformed step index key".to_string(),
                })?;
            if let Some(value) = self.records.get(keys::record_key(run_id, seq))? {
                out.push(serde_json::from_slice(&value)?);
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------- outbox

    /// Runs with at least one record awaiting delivery.
    pub fn outbox_runs(&self) -> Result<Vec<Run>, StoreError> {
        let mut runs = Vec::new();
        let mut from = 0u64;
        loop {
            let Some(entry) = self.outbox.range(keys::id_key(from)..).next() else {
                break;
            };
            let (key, _) = entry?;
            let Some(run_id) = keys::run_id_of(&key) else {
                return Err(StoreError::Corrupt {
                    tree: OUTBOX_TREE,
                    reason: "malformed outbox key".to_string(),
                });
            };
            if let Some(run) = self.run_by_id(run_id)? {
                runs.push(run);
            }
            match run_id.checked_add(1) {
                Some(next) => from = next,
                None => break,
            }
        }
        Ok(runs)
    }

    /// The oldest `limit` undelivered records of a run.
    pub fn outbox_batch(&self, run_id: u64, limit: usize) -> Result<Vec<StoredRecord>, StoreError> {
        let mut out = Vec::new();
        let mut orphans = Batch::default();
        for entry in self.outbox.scan_prefix(keys::id_key(run_id)) {
            if out.len() >= limit {
                break;
            }
            let (key, _) = entry?;
            match self.records.get(&key)? {
                Some(value) => out.push(serde_json::from_slice(&value)?),
                None => orphans.remove(key),
            }
        }
        self.outbox.apply_batch(orphans)?;
        Ok(out)
    }

    pub fn outbox_len(&self, run_id: u64) -> usize {
        self.outbox.scan_prefix(keys::id_key(run_id)).count()
    }

    /// Marks records as delivered.
    pub fn ack_outbox(&self, run_id: u64, seqs: &[u64]) -> Result<(), StoreError> {
        let mut batch = Batch::default();
        for seq in seqs {
            batch.remove(&keys::record_key(run_id, *seq)[..]);
        }
        self.outbox.apply_batch(batch)?;
        self.outbox.flush()?;
        Ok(())
    }

    // -------------------------------------------------------------- alerts

    pub fn append_alert(
        &self,
        alert: &Alert,
        webhook: WebhookOutcome,
    ) -> Result<StoredAlert, StoreError> {
        let seq = allocate_ids(&self.meta, 1)?;
        let stored = StoredAlert {
            seq,
            alert: alert.clone(),
            webhook,
        };
        self.alerts
            .insert(keys::id_key(seq), serde_json::to_vec(&stored)?)?;
        self.alerts.flush()?;
        Ok(stored)
    }

    pub fn set_alert_outcome(&self, seq: u64, webhook: WebhookOutcome) -> Result<(), StoreError> {
        let Some(bytes) = self.alerts.get(keys::id_key(seq))? else {
            return Err(StoreError::UnknownAlert(seq));
        };
        let mut stored: StoredAlert = serde_json::from_slice(&bytes)?;
        stored.webhook = webhook;
        self.alerts
            .insert(keys::id_key(seq), serde_json::to_vec(&stored)?)?;
        Ok(())
    }

    /// Alerts in insertion order, optionally narrowed to a project.
    pub fn alerts(&self, project: Option<&str>) -> Result<Vec<StoredAlert>, StoreError> {
        self.alerts_after(project, 0, usize::MAX)
    }

    /// Up to `limit` alerts with `seq > after`.
    pub fn alerts_after(
        &self,
        project: Option<&str>,
        after: u64,
        limit: usize,
    ) -> Result<Vec<StoredAlert>, StoreError> {
        let Some(start) = after.checked_add(1) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for entry in self.alerts.range(keys::id_key(start)..) {
            if out.len() >= limit {
                break;
            }
            let (_, value) = entry?;
            let stored: StoredAlert = serde_json::from_slice(&value)?;
            if project.map_or(true, |p| stored.alert.project == p) {
                out.push(stored);
            }
        }
        Ok(out)
    }

    // ---------------------------------------------------------- sync ledger

    /// Highest seq already accepted by `target` within `scope`; 0 when none.
    pub fn sync_watermark(&self, target: &str, scope: &str) -> Result<u64, StoreError> {
        let Some(bytes) = self.ledger.get(keys::ledger_key(target, scope))? else {
            return Ok(0);
        };
        keys::decode_u64(&bytes).ok_or_else(|| StoreError::Corrupt {
            tree: LEDGER_TREE,
            reason: "watermark is not a u64".to_string(),
        })
    }

    /// Raises the watermark; never lowers it.
    pub fn advance_sync_watermark(
        &self,
        target: &str,
        scope: &str,
        seq: u64,
    ) -> Result<(), StoreError> {
        self.ledger
            .fetch_and_update(keys::ledger_key(target, scope), |old| {
                let current = old.and_then(keys::decode_u64).unwrap_or(0);
                Some(current.max(seq).to_be_bytes().to_vec())
            })?;
        self.ledger.flush()?;
        Ok(())
    }

    /// Overwrites the ledger entry for `scope`. Used for markers that are not
    /// monotonic, such as the fingerprint of the last config a target accepted.
    pub fn set_sync_marker(&self, target: &str, scope: &str, value: u64) -> Result<(), StoreError> {
        self.ledger
            .insert(keys::ledger_key(target, scope), &value.to_be_bytes()[..])?;
        self.ledger.flush()?;
        Ok(())
    }
}

/// Runs a store call on the blocking pool so sled I/O never stalls a runtime
/// worker.
pub(crate) async fn on_blocking_pool<T, E, F>(store: &LocalStore, f: F) -> Result<T, PipelineError>
where
    F: FnOnce(&LocalStore) -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    PipelineError: From<E>,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|err| PipelineError::Join(err.to_string()))?
        .map_err(PipelineError::from)
}

/// Ledger scope covering a run's records.
pub(crate) fn run_scope(run_id: u64) -> String {
    format!("run:{run_id}")
}

/// Ledger scope covering a run's config.
pub(crate) fn config_scope(run_id: u64) -> String {
    format!("config:{run_id}")
}

/// Ledger scope covering a project's alerts.
pub(crate) fn alert_scope(project: &str) -> String {
    format!("alerts:{project}")
}

/// Reserves `count` consecutive ids and returns the first.
pub(crate) fn allocate_ids(meta: &Tree, count: u64) -> Result<u64, StoreError> {
    let mut first = 1;
    meta.fetch_and_update(NEXT_ID_KEY, |old| {
        let current = old.and_then(keys::decode_u64).unwrap_or(1);
        first = current;
        Some(current.saturating_add(count).to_be_bytes().to_vec())
    })?;
    Ok(first)
}

/// Makes sure no id below `floor` is handed out again.
pub(crate) fn bump_next_id(meta: &Tree, floor: u64) -> Result<(), StoreError> {
    meta.fetch_and_update(NEXT_ID_KEY, |old| {
        let current = old.and_then(keys::decode_u64).unwrap_or(1);
        Some(current.max(floor).to_be_bytes().to_vec())
    })?;
    Ok(())
}

fn collect_keys(tree: &Tree, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
    let mut out = Vec::new();
    for entry in tree.scan_prefix(prefix) {
        let (key, _) = entry?;
        out.push(key.to_vec());
    }
    Ok(out)
}

fn abort<E: Into<StoreError>>(err: E) -> ConflictableTransactionError<StoreError> {
    ConflictableTransactionError::Abort(err.into())
}

fn tx_error(err: TransactionError<StoreError>) -> StoreError {
    match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => StoreError::Db(err),
    }
}
