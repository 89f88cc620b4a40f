//! StepExecution rows. The row is the only mutual-exclusion point between
//! duplicate deliveries: [`ExecutionStore::claim`] is a compare-and-set on
//! status under the map's write guard.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::{SequenceError, SequenceResult};
use crate::ledger::ExecutionLedger;
use crate::state_machine::{ensure_transition, Lifecycle};
use crate::types::{ExecutionStatus, StepExecution};

#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(StepExecution),
    /// Someone else moved the row out of SCHEDULED first.
    AlreadyClaimed(ExecutionStatus),
}

/// Terminal result written by [`ExecutionStore::finish`].
#[derive(Debug, Clone)]
pub struct Finish {
    pub status: ExecutionStatus,
    pub result: serde_json::Value,
    pub error: Option<String>,
    pub provider_message_id: Option<String>,
}

impl Finish {
    pub fn completed(result: serde_json::Value, provider_message_id: Option<String>) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            result,
            error: None,
            provider_message_id,
        }
    }

    pub fn failed(error: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            result,
            error: Some(error.into()),
            provider_message_id: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            status: ExecutionStatus::Skipped,
            result: serde_json::json!({ "skipped": reason }),
            error: None,
            provider_message_id: None,
        }
    }
}

pub struct ExecutionStore {
    executions: DashMap<Uuid, StepExecution>,
    by_enrollment: DashMap<Uuid, Vec<Uuid>>,
    ledger: Arc<ExecutionLedger>,
}

impl ExecutionStore {
    pub fn new(ledger: Arc<ExecutionLedger>) -> Self {
        Self {
            executions: DashMap::new(),
            by_enrollment: DashMap::new(),
            ledger,
        }
    }

    pub fn ledger(&self) -> &Arc<ExecutionLedger> {
        &self.ledger
    }

    /// Creates a SCHEDULED row. Fails with `ExecutionPending` when the
    /// enrollment already has a non-terminal execution.
    pub fn create_scheduled(
        &self,
        enrollment_id: Uuid,
        sequence_id: Uuid,
        step_id: Uuid,
        attempt: u32,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SequenceResult<StepExecution> {
        // Held for the whole check-and-insert so two schedulers racing on the
        // same enrollment serialize here.
        let mut ids = self.by_enrollment.entry(enrollment_id).or_default();
        let pending = ids.iter().any(|id| {
            self.executions
                .get(id)
                .map(|e| !e.status.is_terminal())
                .unwrap_or(false)
        });
        if pending {
            return Err(SequenceError::ExecutionPending(enrollment_id));
        }

        let execution = StepExecution {
            id: Uuid::new_v4(),
            enrollment_id,
            sequence_id,
            step_id,
            attempt,
            status: ExecutionStatus::Scheduled,
            scheduled_at,
            started_at: None,
            executed_at: None,
            result: serde_json::json!({}),
            error: None,
            provider_message_id: None,
        };
        self.ledger.append(
            &execution,
            None,
            now,
            serde_json::json!({ "scheduled_at": scheduled_at }),
        )?;
        self.executions.insert(execution.id, execution.clone());
        ids.push(execution.id);
        Ok(execution)
    }

    /// SCHEDULED -> EXECUTING, atomically. Any other current status means a
    /// duplicate delivery and is reported without touching the row.
    pub fn claim(&self, id: &Uuid, now: DateTime<Utc>) -> SequenceResult<ClaimOutcome> {
        let mut row = self
            .executions
            .get_mut(id)
            .ok_or_else(|| SequenceError::not_found("step execution", *id))?;
        if row.status != ExecutionStatus::Scheduled {
            debug!(execution_id = %id, status = ?row.status, "Execution already claimed");
            return Ok(ClaimOutcome::AlreadyClaimed(row.status));
        }

        let mut claimed = row.clone();
        claimed.status = ExecutionStatus::Executing;
        claimed.started_at = Some(now);
        self.ledger.append(
            &claimed,
            Some(ExecutionStatus::Scheduled),
            now,
            serde_json::json!({}),
        )?;
        *row = claimed.clone();
        Ok(ClaimOutcome::Claimed(claimed))
    }

    /// EXECUTING -> terminal.
    pub fn finish(&self, id: &Uuid, finish: Finish, now: DateTime<Utc>) -> SequenceResult<StepExecution> {
        let mut row = self
            .executions
            .get_mut(id)
            .ok_or_else(|| SequenceError::not_found("step execution", *id))?;
        ensure_transition(row.status, finish.status)?;

        let mut done = row.clone();
        let from = done.status;
        done.status = finish.status;
        done.executed_at = Some(now);
        done.result = finish.result;
        done.error = finish.error;
        done.provider_message_id = finish.provider_message_id;

        let detail = serde_json::json!({
            "result": done.result,
            "error": done.error,
        });
        self.ledger.append(&done, Some(from), now, detail)?;
        *row = done.clone();
        Ok(done)
    }

    /// Claims the enrollment's SCHEDULED row, if it has one, and records it
    /// SKIPPED. A row another worker is already running is left alone.
    pub fn skip_pending(
        &self,
        enrollment_id: &Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SequenceResult<Option<StepExecution>> {
        let Some(pending) = self
            .pending_for(enrollment_id)
            .filter(|e| e.status == ExecutionStatus::Scheduled)
        else {
            return Ok(None);
        };
        match self.claim(&pending.id, now)? {
            ClaimOutcome::Claimed(_) => self
                .finish(&pending.id, Finish::skipped(reason), now)
                .map(Some),
            ClaimOutcome::AlreadyClaimed(_) => Ok(None),
        }
    }

    pub fn get(&self, id: &Uuid) -> SequenceResult<StepExecution> {
        self.executions
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| SequenceError::not_found("step execution", *id))
    }

    /// All executions of the enrollment in creation order.
    pub fn for_enrollment(&self, enrollment_id: &Uuid) -> Vec<StepExecution> {
        let ids = self
            .by_enrollment
            .get(enrollment_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id).ok()).collect()
    }

    /// The enrollment's non-terminal execution, if any.
    pub fn pending_for(&self, enrollment_id: &Uuid) -> Option<StepExecution> {
        self.for_enrollment(enrollment_id)
            .into_iter()
            .find(|e| !e.status.is_terminal())
    }

    pub fn latest_for(&self, enrollment_id: &Uuid) -> Option<StepExecution> {
        self.for_enrollment(enrollment_id).into_iter().last()
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}
