//! Append-only execution ledger with SHA-256 hash chaining.
//!
//! Each step-execution status change is appended as one entry. Entries are
//! never rewritten; an execution that reached a terminal status accepts no
//! further entries.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::error::{SequenceError, SequenceResult};
use crate::state_machine::Lifecycle;
use crate::types::{ExecutionStatus, StepExecution};

const GENESIS: &str = "genesis";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub execution_id: Uuid,
    pub enrollment_id: Uuid,
    pub step_id: Uuid,
    pub attempt: u32,
    /// `None` for the row that created the execution.
    pub from: Option<ExecutionStatus>,
    pub to: ExecutionStatus,
    pub at: DateTime<Utc>,
    pub detail: serde_json::Value,
    pub entry_hash: String,
    pub previous_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainVerification {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub broken_at: Vec<u64>,
    pub chain_intact: bool,
}

#[derive(Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    last_status: HashMap<Uuid, ExecutionStatus>,
}

pub struct ExecutionLedger {
    state: RwLock<LedgerState>,
}

impl Default for ExecutionLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionLedger {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
        }
    }

    /// Record `execution` moving from `from` to its current status.
    pub fn append(
        &self,
        execution: &StepExecution,
        from: Option<ExecutionStatus>,
        at: DateTime<Utc>,
        detail: serde_json::Value,
    ) -> SequenceResult<u64> {
        let mut state = self.state.write();
        if let Some(last) = state.last_status.get(&execution.id) {
            if last.is_terminal() {
                return Err(SequenceError::InvalidTransition {
                    entity: ExecutionStatus::ENTITY,
                    from: format!("{:?}", last),
                    to: format!("{:?}", execution.status),
                });
            }
        }

        let seq = state.entries.len() as u64 + 1;
        let previous_hash = state
            .entries
            .last()
            .map(|e| e.entry_hash.clone())
            .unwrap_or_else(|| GENESIS.to_string());

        let mut entry = LedgerEntry {
            seq,
            execution_id: execution.id,
            enrollment_id: execution.enrollment_id,
            step_id: execution.step_id,
            attempt: execution.attempt,
            from,
            to: execution.status,
            at,
            detail,
            entry_hash: String::new(),
            previous_hash,
        };
        entry.entry_hash = sha256_hex(&entry_content(&entry));

        debug!(
            seq,
            execution_id = %execution.id,
            from = ?from,
            to = ?execution.status,
            "Ledger entry appended"
        );

        state.last_status.insert(execution.id, execution.status);
        state.entries.push(entry);
        Ok(seq)
    }

    pub fn entries_for_enrollment(&self, enrollment_id: &Uuid) -> Vec<LedgerEntry> {
        self.state
            .read()
            .entries
            .iter()
            .filter(|e| e.enrollment_id == *enrollment_id)
            .cloned()
            .collect()
    }

    pub fn entries_for_execution(&self, execution_id: &Uuid) -> Vec<LedgerEntry> {
        self.state
            .read()
            .entries
            .iter()
            .filter(|e| e.execution_id == *execution_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Re-hash every entry and check the links.
    pub fn verify_chain(&self) -> ChainVerification {
        let state = self.state.read();
        let mut expected_prev = GENESIS.to_string();
        let mut valid = 0;
        let mut broken = Vec::new();

        for entry in &state.entries {
            if entry.previous_hash == expected_prev
                && sha256_hex(&entry_content(entry)) == entry.entry_hash
            {
                valid += 1;
            } else {
                broken.push(entry.seq);
            }
            expected_prev = entry.entry_hash.clone();
        }

        ChainVerification {
            total_entries: state.entries.len(),
            valid_entries: valid,
            broken_at: broken,
            chain_intact: valid == state.entries.len(),
        }
    }

    #[cfg(test)]
    fn tamper(&self, seq: u64, detail: serde_json::Value) {
        let mut state = self.state.write();
        if let Some(entry) = state.entries.iter_mut().find(|e| e.seq == seq) {
            entry.detail = detail;
        }
    }
}

fn entry_content(entry: &LedgerEntry) -> String {
    format!(
        "{}:{}:{}:{}:{:?}:{:?}:{}:{}:{}",
        entry.seq,
        entry.execution_id,
        entry.enrollment_id,
        entry.attempt,
        entry.from,
        entry.to,
        entry.at.to_rfc3339(),
        entry.detail,
        entry.previous_hash,
    )
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
