//! Transition tables for sequences, enrollments and step executions.
//!
//! Every status change in the engine goes through [`ensure_transition`];
//! anything not listed in the entity's table is rejected.

use std::fmt::Debug;

use crate::error::{SequenceError, SequenceResult};
use crate::types::{EnrollmentStatus, ExecutionStatus, SequenceStatus};

/// Describes a single valid state transition.
#[derive(Debug, Clone, Copy)]
pub struct StateTransition<S> {
    pub from: S,
    pub to: S,
    pub trigger: &'static str,
}

pub trait Lifecycle: Copy + PartialEq + Debug + 'static {
    const ENTITY: &'static str;

    fn transitions() -> &'static [StateTransition<Self>];

    fn is_terminal(&self) -> bool;

    fn can_transition(&self, to: Self) -> bool {
        Self::transitions()
            .iter()
            .any(|t| t.from == *self && t.to == to)
    }

    /// Trigger name for a permitted transition.
    fn trigger_for(&self, to: Self) -> Option<&'static str> {
        Self::transitions()
            .iter()
            .find(|t| t.from == *self && t.to == to)
            .map(|t| t.trigger)
    }
}

/// Returns an `InvalidTransition` error unless `from -> to` is in the table.
pub fn ensure_transition<S: Lifecycle>(from: S, to: S) -> SequenceResult<()> {
    if from.can_transition(to) {
        Ok(())
    } else {
        Err(SequenceError::InvalidTransition {
            entity: S::ENTITY,
            from: format!("{:?}", from),
            to: format!("{:?}", to),
        })
    }
}

const fn t<S>(from: S, to: S, trigger: &'static str) -> StateTransition<S> {
    StateTransition { from, to, trigger }
}

static SEQUENCE_TRANSITIONS: [StateTransition<SequenceStatus>; 9] = [
    t(SequenceStatus::Draft, SequenceStatus::Active, "activate"),
    t(SequenceStatus::Active, SequenceStatus::Paused, "pause"),
    t(SequenceStatus::Paused, SequenceStatus::Active, "resume"),
    t(SequenceStatus::Active, SequenceStatus::Completed, "complete"),
    t(SequenceStatus::Paused, SequenceStatus::Completed, "complete"),
    t(SequenceStatus::Draft, SequenceStatus::Archived, "archive"),
    t(SequenceStatus::Active, SequenceStatus::Archived, "archive"),
    t(SequenceStatus::Paused, SequenceStatus::Archived, "archive"),
    t(SequenceStatus::Completed, SequenceStatus::Archived, "archive"),
];

static ENROLLMENT_TRANSITIONS: [StateTransition<EnrollmentStatus>; 8] = [
    t(EnrollmentStatus::Active, EnrollmentStatus::Paused, "pause"),
    t(EnrollmentStatus::Paused, EnrollmentStatus::Active, "resume"),
    t(EnrollmentStatus::Active, EnrollmentStatus::Completed, "last_step_done"),
    t(EnrollmentStatus::Active, EnrollmentStatus::Exited, "exit"),
    t(EnrollmentStatus::Active, EnrollmentStatus::Failed, "unrecoverable_error"),
    t(EnrollmentStatus::Paused, EnrollmentStatus::Completed, "last_step_done"),
    t(EnrollmentStatus::Paused, EnrollmentStatus::Exited, "exit"),
    t(EnrollmentStatus::Paused, EnrollmentStatus::Failed, "unrecoverable_error"),
];

static EXECUTION_TRANSITIONS: [StateTransition<ExecutionStatus>; 4] = [
    t(ExecutionStatus::Scheduled, ExecutionStatus::Executing, "claim"),
    t(ExecutionStatus::Executing, ExecutionStatus::Completed, "handler_ok"),
    t(ExecutionStatus::Executing, ExecutionStatus::Failed, "handler_error"),
    t(ExecutionStatus::Executing, ExecutionStatus::Skipped, "exit_or_inactive"),
];

impl Lifecycle for SequenceStatus {
    const ENTITY: &'static str = "sequence";

    fn transitions() -> &'static [StateTransition<Self>] {
        &SEQUENCE_TRANSITIONS
    }

    fn is_terminal(&self) -> bool {
        matches!(self, SequenceStatus::Archived)
    }
}

impl Lifecycle for EnrollmentStatus {
    const ENTITY: &'static str = "enrollment";

    fn transitions() -> &'static [StateTransition<Self>] {
        &ENROLLMENT_TRANSITIONS
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnrollmentStatus::Completed | EnrollmentStatus::Exited | EnrollmentStatus::Failed
        )
    }
}

impl Lifecycle for ExecutionStatus {
    const ENTITY: &'static str = "step execution";

    fn transitions() -> &'static [StateTransition<Self>] {
        &EXECUTION_TRANSITIONS
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Skipped
        )
    }
}
