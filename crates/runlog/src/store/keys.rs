// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte layouts of sled keys. All integers are big-endian so that sled's
//! lexicographic order matches numeric order.

const SEP: u8 = 0;

/// `project \0 name`
pub(crate) fn run_key(project: &str, name: &str) -> Vec<u8> {
    let mut key = project_prefix(project);
    key.extend_from_slice(name.as_bytes());
    key
}

/// `project \0`
pub(crate) fn project_prefix(project: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(project.len() + 1);
    key.extend_from_slice(project.as_bytes());
    key.push(SEP);
    key
}

/// Splits a run key back into `(project, name)`.
pub(crate) fn split_run_key(key: &[u8]) -> Option<(String, String)> {
    let pos = key.iter().position(|b| *b == SEP)?;
    let project = std::str::from_utf8(&key[..pos]).ok()?;
    let name = std::str::from_utf8(&key[pos + 1..]).ok()?;
    Some((project.to_string(), name.to_string()))
}

pub(crate) fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// `run_id | seq`, used by the records and outbox trees.
pub(crate) fn record_key(run_id: u64, seq: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&run_id.to_be_bytes());
    key[8..].copy_from_slice(&seq.to_be_bytes());
    key
}

/// Unset steps sort before every set step.
fn encode_step(step: Option<i64>) -> [u8; 9] {
    let mut out = [0u8; 9];
    if let Some(step) = step {
        out[0] = 1;
        // Flip the sign bit so negative steps sort before positive ones.
        out[1..].copy_from_slice(&((step as u64) ^ (1 << 63)).to_be_bytes());
    }
    out
}

fn decode_step(bytes: &[u8]) -> Option<Option<i64>> {
    if bytes.len() != 9 {
        return None;
    }
    if bytes[0] == 0 {
        return Some(None);
    }
    let raw = decode_u64(&bytes[1..])?;
    Some(Some((raw ^ (1 << 63)) as i64))
}

/// `run_id | step | seq`
pub(crate) fn step_index_key(run_id: u64, step: Option<i64>, seq: u64) -> [u8; 25] {
    let mut key = [0u8; 25];
    key[..8].copy_from_slice(&run_id.to_be_bytes());
    key[8..17].copy_from_slice(&encode_step(step));
    key[17..].copy_from_slice(&seq.to_be_bytes());
    key
}

/// `run_id | step`
pub(crate) fn step_prefix(run_id: u64, step: Option<i64>) -> [u8; 17] {
    let mut key = [0u8; 17];
    key[..8].copy_from_slice(&run_id.to_be_bytes());
    key[8..].copy_from_slice(&encode_step(step));
    key
}

/// Extracts `(step, seq)` from a step index key.
pub(crate) fn split_step_index_key(key: &[u8]) -> Option<(Option<i64>, u64)> {
    if key.len() != 25 {
        return None;
    }
    let step = decode_step(&key[8..17])?;
    let seq = decode_u64(&key[17..])?;
    Some((step, seq))
}

/// Second half of a `run_id | seq` key.
pub(crate) fn seq_of(key: &[u8]) -> Option<u64> {
    if key.len() != 16 {
        return None;
    }
    decode_u64(&key[8..])
}

/// First half of any run-scoped key.
pub(crate) fn run_id_of(key: &[u8]) -> Option<u64> {
    key.get(..8).and_then(decode_u64)
}

/// `target \0 scope`
pub(crate) fn ledger_key(target: &str, scope: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(target.len() + scope.len() + 1);
    key.extend_from_slice(target.as_bytes());
    key.push(SEP);
    key.extend_from_slice(scope.as_bytes());
    key
}

pub(crate) fn decode_u64(bytes: &[u8]) -> Option<u64> {
    let buf: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(buf))
}
