//! Sequence definition store: sequences, their ordered steps, lifecycle
//! transitions and the shared counters.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use crate::error::{SequenceError, SequenceResult};
use crate::state_machine::ensure_transition;
use crate::types::{Sequence, SequenceStats, SequenceStatus, Step, StepStats};

#[derive(Debug, Default)]
struct SequenceCounters {
    enrolled: AtomicU64,
    completed: AtomicU64,
    converted: AtomicU64,
}

#[derive(Debug, Default)]
struct StepCounters {
    sent: AtomicU64,
    opened: AtomicU64,
    clicked: AtomicU64,
    replied: AtomicU64,
}

/// Which per-step counter an engagement bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCounter {
    Sent,
    Opened,
    Clicked,
    Replied,
}

#[derive(Default)]
pub struct SequenceStore {
    sequences: DashMap<Uuid, Sequence>,
    /// Steps per sequence, kept sorted by `order`.
    steps: DashMap<Uuid, Vec<Step>>,
    step_index: DashMap<Uuid, Uuid>,
    sequence_counters: DashMap<Uuid, Arc<SequenceCounters>>,
    step_counters: DashMap<Uuid, Arc<StepCounters>>,
}

impl SequenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Definitions ────────────────────────────────────────────────────

    pub fn create_sequence(&self, mut sequence: Sequence) -> SequenceResult<Uuid> {
        if sequence.name.trim().is_empty() {
            return Err(SequenceError::Validation("sequence name is required".into()));
        }
        if sequence.send_window.optimal_send_hour > 23 {
            return Err(SequenceError::Validation(format!(
                "optimal send hour {} is outside 0-23",
                sequence.send_window.optimal_send_hour
            )));
        }
        let id = sequence.id;
        sequence.status = SequenceStatus::Draft;
        sequence.config_locked = false;
        info!(sequence_id = %id, name = %sequence.name, "Creating sequence");
        self.sequence_counters.insert(id, Arc::default());
        self.steps.insert(id, Vec::new());
        self.sequences.insert(id, sequence);
        Ok(id)
    }

    /// Returns the sequence with a fresh counter snapshot.
    pub fn get_sequence(&self, id: &Uuid) -> SequenceResult<Sequence> {
        let mut sequence = self
            .sequences
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| SequenceError::not_found("sequence", *id))?;
        sequence.stats = self.sequence_stats(id);
        Ok(sequence)
    }

    pub fn list_sequences(&self) -> Vec<Sequence> {
        let ids: Vec<Uuid> = self.sequences.iter().map(|s| *s.key()).collect();
        ids.iter().filter_map(|id| self.get_sequence(id).ok()).collect()
    }

    /// Steps added after activation are validated here, since activation
    /// will not see them.
    pub fn add_step(&self, sequence_id: &Uuid, mut step: Step) -> SequenceResult<Uuid> {
        self.ensure_editable(sequence_id)?;
        self.validate_if_live(sequence_id, &step)?;
        step.sequence_id = *sequence_id;
        step.stats = StepStats::default();

        let mut steps = self
            .steps
            .get_mut(sequence_id)
            .ok_or_else(|| SequenceError::not_found("sequence", *sequence_id))?;
        if steps.iter().any(|s| s.order == step.order) {
            return Err(SequenceError::Validation(format!(
                "step order {} already used in sequence {}",
                step.order, sequence_id
            )));
        }

        let id = step.id;
        info!(sequence_id = %sequence_id, step_id = %id, order = step.order, step_type = %step.step_type(), "Adding step");
        self.step_index.insert(id, *sequence_id);
        self.step_counters.insert(id, Arc::default());
        steps.push(step);
        steps.sort_by_key(|s| s.order);
        Ok(id)
    }

    /// Replaces a step's configuration. Identity and sequence are kept.
    pub fn update_step(&self, step: Step) -> SequenceResult<()> {
        let sequence_id = self.sequence_of(&step.id)?;
        self.ensure_editable(&sequence_id)?;
        self.validate_if_live(&sequence_id, &step)?;

        let mut steps = self
            .steps
            .get_mut(&sequence_id)
            .ok_or_else(|| SequenceError::not_found("sequence", sequence_id))?;
        if steps.iter().any(|s| s.order == step.order && s.id != step.id) {
            return Err(SequenceError::Validation(format!(
                "step order {} already used in sequence {}",
                step.order, sequence_id
            )));
        }
        let slot = steps
            .iter_mut()
            .find(|s| s.id == step.id)
            .ok_or_else(|| SequenceError::not_found("step", step.id))?;
        *slot = Step {
            sequence_id,
            ..step
        };
        steps.sort_by_key(|s| s.order);
        Ok(())
    }

    pub fn remove_step(&self, step_id: &Uuid) -> SequenceResult<()> {
        let sequence_id = self.sequence_of(step_id)?;
        self.ensure_editable(&sequence_id)?;
        if let Some(mut steps) = self.steps.get_mut(&sequence_id) {
            steps.retain(|s| s.id != *step_id);
        }
        self.step_index.remove(step_id);
        self.step_counters.remove(step_id);
        info!(sequence_id = %sequence_id, step_id = %step_id, "Removed step");
        Ok(())
    }

    /// Renumbers the sequence's steps 0..n in the order given.
    pub fn reorder_steps(&self, sequence_id: &Uuid, step_ids: &[Uuid]) -> SequenceResult<()> {
        self.ensure_editable(sequence_id)?;
        let mut steps = self
            .steps
            .get_mut(sequence_id)
            .ok_or_else(|| SequenceError::not_found("sequence", *sequence_id))?;

        let current: HashSet<Uuid> = steps.iter().map(|s| s.id).collect();
        let requested: HashSet<Uuid> = step_ids.iter().copied().collect();
        if current != requested || requested.len() != step_ids.len() {
            return Err(SequenceError::Validation(
                "reorder must list every step of the sequence exactly once".into(),
            ));
        }

        for step in steps.iter_mut() {
            if let Some(pos) = step_ids.iter().position(|id| *id == step.id) {
                step.order = pos as u32;
            }
        }
        steps.sort_by_key(|s| s.order);
        info!(sequence_id = %sequence_id, steps = step_ids.len(), "Reordered steps");
        Ok(())
    }

    /// Copies the sequence and its steps into a new DRAFT with zeroed counters.
    pub fn duplicate_sequence(&self, id: &Uuid, name: Option<String>) -> SequenceResult<Uuid> {
        let source = self.get_sequence(id)?;
        let now = Utc::now();
        let copy = Sequence {
            id: Uuid::new_v4(),
            name: name.unwrap_or_else(|| format!("{} (Copy)", source.name)),
            status: SequenceStatus::Draft,
            config_locked: false,
            stats: SequenceStats::default(),
            created_at: now,
            updated_at: now,
            ..source
        };
        let new_id = self.create_sequence(copy)?;
        for step in self.steps(id) {
            self.add_step(
                &new_id,
                Step {
                    id: Uuid::new_v4(),
                    ..step
                },
            )?;
        }
        info!(source_id = %id, sequence_id = %new_id, "Duplicated sequence");
        Ok(new_id)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// DRAFT -> ACTIVE after validating every step.
    pub fn activate(&self, id: &Uuid) -> SequenceResult<()> {
        let steps = self.steps(id);
        if steps.is_empty() {
            return Err(SequenceError::Validation(format!(
                "sequence {} has no steps",
                id
            )));
        }
        let errors: Vec<String> = steps.iter().filter_map(|s| s.validate().err()).collect();
        if !errors.is_empty() {
            return Err(SequenceError::Validation(errors.join("; ")));
        }
        self.transition(id, SequenceStatus::Active)
    }

    pub fn pause(&self, id: &Uuid) -> SequenceResult<()> {
        self.transition(id, SequenceStatus::Paused)
    }

    pub fn resume(&self, id: &Uuid) -> SequenceResult<()> {
        self.transition(id, SequenceStatus::Active)
    }

    pub fn complete(&self, id: &Uuid) -> SequenceResult<()> {
        self.transition(id, SequenceStatus::Completed)
    }

    pub fn archive(&self, id: &Uuid) -> SequenceResult<()> {
        self.transition(id, SequenceStatus::Archived)
    }

    fn transition(&self, id: &Uuid, to: SequenceStatus) -> SequenceResult<()> {
        let mut sequence = self
            .sequences
            .get_mut(id)
            .ok_or_else(|| SequenceError::not_found("sequence", *id))?;
        ensure_transition(sequence.status, to)?;
        info!(sequence_id = %id, from = ?sequence.status, to = ?to, "Sequence status change");
        sequence.status = to;
        sequence.updated_at = Utc::now();
        Ok(())
    }

    /// Freezes step configuration. Called when the first step executes.
    pub fn lock_configuration(&self, id: &Uuid) {
        if let Some(mut sequence) = self.sequences.get_mut(id) {
            if !sequence.config_locked {
                sequence.config_locked = true;
                info!(sequence_id = %id, "Sequence configuration locked");
            }
        }
    }

    fn ensure_editable(&self, id: &Uuid) -> SequenceResult<()> {
        let sequence = self
            .sequences
            .get(id)
            .ok_or_else(|| SequenceError::not_found("sequence", *id))?;
        if sequence.config_locked {
            return Err(SequenceError::SequenceLocked(*id));
        }
        Ok(())
    }

    fn validate_if_live(&self, id: &Uuid, step: &Step) -> SequenceResult<()> {
        let status = self
            .sequences
            .get(id)
            .map(|s| s.status)
            .ok_or_else(|| SequenceError::not_found("sequence", *id))?;
        if status == SequenceStatus::Draft {
            return Ok(());
        }
        step.validate().map_err(SequenceError::Validation)
    }

    // ─── Step lookups ───────────────────────────────────────────────────

    /// Steps with counter snapshots, ordered by `order`.
    pub fn steps(&self, sequence_id: &Uuid) -> Vec<Step> {
        let mut steps = self
            .steps
            .get(sequence_id)
            .map(|s| s.clone())
            .unwrap_or_default();
        for step in steps.iter_mut() {
            step.stats = self.step_stats(&step.id);
        }
        steps
    }

    pub fn step(&self, step_id: &Uuid) -> SequenceResult<Step> {
        let sequence_id = self.sequence_of(step_id)?;
        self.steps(&sequence_id)
            .into_iter()
            .find(|s| s.id == *step_id)
            .ok_or_else(|| SequenceError::not_found("step", *step_id))
    }

    pub fn first_step(&self, sequence_id: &Uuid) -> Option<Step> {
        self.steps(sequence_id).into_iter().next()
    }

    /// The step with the smallest order strictly greater than `order`.
    pub fn next_step_after(&self, sequence_id: &Uuid, order: u32) -> Option<Step> {
        self.steps(sequence_id)
            .into_iter()
            .find(|s| s.order > order)
    }

    /// 0-based position of the step in the ordered list.
    pub fn position_of(&self, sequence_id: &Uuid, step_id: &Uuid) -> Option<u32> {
        self.steps
            .get(sequence_id)
            .and_then(|steps| steps.iter().position(|s| s.id == *step_id))
            .map(|p| p as u32)
    }

    fn sequence_of(&self, step_id: &Uuid) -> SequenceResult<Uuid> {
        self.step_index
            .get(step_id)
            .map(|s| *s)
            .ok_or_else(|| SequenceError::not_found("step", *step_id))
    }

    // ─── Counters ───────────────────────────────────────────────────────

    pub fn record_enrolled(&self, sequence_id: &Uuid) {
        if let Some(c) = self.sequence_counters.get(sequence_id) {
            c.enrolled.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_completed(&self, sequence_id: &Uuid, converted: bool) {
        if let Some(c) = self.sequence_counters.get(sequence_id) {
            c.completed.fetch_add(1, Ordering::Relaxed);
            if converted {
                c.converted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_converted(&self, sequence_id: &Uuid) {
        if let Some(c) = self.sequence_counters.get(sequence_id) {
            c.converted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_step(&self, step_id: &Uuid, counter: StepCounter) {
        if let Some(c) = self.step_counters.get(step_id) {
            let target = match counter {
                StepCounter::Sent => &c.sent,
                StepCounter::Opened => &c.opened,
                StepCounter::Clicked => &c.clicked,
                StepCounter::Replied => &c.replied,
            };
            target.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn sequence_stats(&self, sequence_id: &Uuid) -> SequenceStats {
        self.sequence_counters
            .get(sequence_id)
            .map(|c| SequenceStats {
                total_enrolled: c.enrolled.load(Ordering::Relaxed),
                total_completed: c.completed.load(Ordering::Relaxed),
                total_converted: c.converted.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    pub fn step_stats(&self, step_id: &Uuid) -> StepStats {
        self.step_counters
            .get(step_id)
            .map(|c| StepStats {
                total_sent: c.sent.load(Ordering::Relaxed),
                total_opened: c.opened.load(Ordering::Relaxed),
                total_clicked: c.clicked.load(Ordering::Relaxed),
                total_replied: c.replied.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }
}
