//! Per-contact enrollment lifecycle and the sequence-level operations that
//! cascade to enrollments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use outreach_core::collaborators::ContactStore;
use outreach_core::event_bus::{make_event, EventSink};
use outreach_core::types::SequenceEventType;
use outreach_core::CollaboratorError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{SequenceError, SequenceResult};
use crate::executions::ExecutionStore;
use crate::repo::EnrollmentRepo;
use crate::scheduler::{NextStep, Scheduler};
use crate::state_machine::{ensure_transition, Lifecycle};
use crate::store::SequenceStore;
use crate::types::{
    Conversion, Enrollment, EnrollmentContext, EnrollmentStatus, ExecutionStatus, ExitReason,
    ExitRecord, SequenceStatus,
};

/// Who enrolled the contact and through which channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollOptions {
    pub enrolled_by: String,
    pub method: String,
}

impl Default for EnrollOptions {
    fn default() -> Self {
        Self {
            enrolled_by: "system".to_string(),
            method: "manual".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkEnrollment {
    pub enrolled: Vec<Uuid>,
    /// Contact id and the reason it was not enrolled.
    pub skipped: Vec<(Uuid, String)>,
}

pub struct EnrollmentManager {
    store: Arc<SequenceStore>,
    enrollments: Arc<EnrollmentRepo>,
    executions: Arc<ExecutionStore>,
    scheduler: Arc<Scheduler>,
    contacts: Arc<dyn ContactStore>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    call_timeout: Duration,
}

impl EnrollmentManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SequenceStore>,
        enrollments: Arc<EnrollmentRepo>,
        executions: Arc<ExecutionStore>,
        scheduler: Arc<Scheduler>,
        contacts: Arc<dyn ContactStore>,
        clock: Arc<dyn Clock>,
        event_sink: Arc<dyn EventSink>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            enrollments,
            executions,
            scheduler,
            contacts,
            clock,
            event_sink,
            call_timeout,
        }
    }

    // ─── Sequence lifecycle ─────────────────────────────────────────────

    pub fn activate_sequence(&self, sequence_id: &Uuid) -> SequenceResult<()> {
        self.store.activate(sequence_id)?;
        self.emit(SequenceEventType::SequenceActivated, *sequence_id, None, serde_json::json!({}));
        Ok(())
    }

    /// Pauses the sequence and every ACTIVE enrollment in it.
    pub fn pause_sequence(&self, sequence_id: &Uuid) -> SequenceResult<usize> {
        self.store.pause(sequence_id)?;
        let mut paused = 0;
        for enrollment in self.enrollments.for_sequence(sequence_id) {
            if enrollment.status == EnrollmentStatus::Active {
                self.pause(&enrollment.id)?;
                paused += 1;
            }
        }
        info!(sequence_id = %sequence_id, enrollments = paused, "Sequence paused");
        self.emit(
            SequenceEventType::SequencePaused,
            *sequence_id,
            None,
            serde_json::json!({ "enrollments_paused": paused }),
        );
        Ok(paused)
    }

    /// Resumes the sequence and every PAUSED enrollment in it.
    pub fn resume_sequence(&self, sequence_id: &Uuid) -> SequenceResult<usize> {
        self.store.resume(sequence_id)?;
        let mut resumed = 0;
        for enrollment in self.enrollments.for_sequence(sequence_id) {
            if enrollment.status == EnrollmentStatus::Paused {
                self.resume(&enrollment.id)?;
                resumed += 1;
            }
        }
        info!(sequence_id = %sequence_id, enrollments = resumed, "Sequence resumed");
        self.emit(
            SequenceEventType::SequenceResumed,
            *sequence_id,
            None,
            serde_json::json!({ "enrollments_resumed": resumed }),
        );
        Ok(resumed)
    }

    // ─── Enrollment ─────────────────────────────────────────────────────

    pub async fn enroll(
        &self,
        sequence_id: &Uuid,
        contact_id: &Uuid,
        custom_variables: HashMap<String, serde_json::Value>,
    ) -> SequenceResult<Enrollment> {
        self.enroll_with_context(sequence_id, contact_id, custom_variables, EnrollOptions::default())
            .await
    }

    /// Creates the enrollment and schedules its first step.
    pub async fn enroll_with_context(
        &self,
        sequence_id: &Uuid,
        contact_id: &Uuid,
        custom_variables: HashMap<String, serde_json::Value>,
        options: EnrollOptions,
    ) -> SequenceResult<Enrollment> {
        if self.enrollments.find(sequence_id, contact_id).is_some() {
            return Err(SequenceError::AlreadyEnrolled {
                sequence_id: *sequence_id,
                contact_id: *contact_id,
            });
        }
        let sequence = self.store.get_sequence(sequence_id)?;
        if sequence.status != SequenceStatus::Active {
            return Err(SequenceError::SequenceNotActive(*sequence_id));
        }
        self.require_contact(*contact_id).await?;

        let now = self.clock.now();
        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            sequence_id: *sequence_id,
            contact_id: *contact_id,
            status: EnrollmentStatus::Active,
            current_step_id: None,
            current_step_order: None,
            current_step_index: 0,
            next_fire_at: None,
            exit: None,
            conversion: None,
            context: EnrollmentContext {
                enrolled_by: options.enrolled_by,
                method: options.method,
                enrolled_at: now,
            },
            custom_variables,
            variant_assignments: HashMap::new(),
            enrolled_at: now,
            updated_at: now,
        };
        let id = self.enrollments.insert_unique(enrollment.clone())?;
        self.store.record_enrolled(sequence_id);

        info!(
            enrollment_id = %id,
            sequence_id = %sequence_id,
            contact_id = %contact_id,
            "Contact enrolled"
        );
        metrics::counter!("sequence.enrollments").increment(1);
        self.emit(
            SequenceEventType::ContactEnrolled,
            *sequence_id,
            Some(id),
            serde_json::json!({ "contact_id": contact_id, "method": enrollment.context.method }),
        );

        if let NextStep::Exhausted = self.scheduler.schedule_first_step(&enrollment).await? {
            self.complete(&id)?;
        }
        self.enrollments.get(&id)
    }

    /// Enrolls each contact with the same variables. Contacts that cannot be
    /// enrolled are reported instead of aborting the batch.
    pub async fn enroll_many(
        &self,
        sequence_id: &Uuid,
        contact_ids: &[Uuid],
        custom_variables: HashMap<String, serde_json::Value>,
        options: EnrollOptions,
    ) -> SequenceResult<BulkEnrollment> {
        let sequence = self.store.get_sequence(sequence_id)?;
        if sequence.status != SequenceStatus::Active {
            return Err(SequenceError::SequenceNotActive(*sequence_id));
        }

        let mut outcome = BulkEnrollment::default();
        for contact_id in contact_ids {
            match self
                .enroll_with_context(sequence_id, contact_id, custom_variables.clone(), options.clone())
                .await
            {
                Ok(enrollment) => outcome.enrolled.push(enrollment.id),
                Err(e) => outcome.skipped.push((*contact_id, e.to_string())),
            }
        }
        info!(
            sequence_id = %sequence_id,
            enrolled = outcome.enrolled.len(),
            skipped = outcome.skipped.len(),
            "Bulk enrollment finished"
        );
        Ok(outcome)
    }

    async fn require_contact(&self, contact_id: Uuid) -> SequenceResult<()> {
        match tokio::time::timeout(self.call_timeout, self.contacts.get_contact(contact_id)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(CollaboratorError::Timeout {
                service: "contact store",
                millis: self.call_timeout.as_millis() as u64,
            }
            .into()),
        }
    }

    // ─── Status changes ─────────────────────────────────────────────────

    /// ACTIVE -> PAUSED. An in-flight execution finishes; nothing new fires.
    pub fn pause(&self, enrollment_id: &Uuid) -> SequenceResult<Enrollment> {
        let now = self.clock.now();
        let enrollment = self.enrollments.update(enrollment_id, |e| {
            ensure_transition(e.status, EnrollmentStatus::Paused)?;
            e.status = EnrollmentStatus::Paused;
            e.next_fire_at = None;
            e.updated_at = now;
            Ok(())
        })?;
        info!(enrollment_id = %enrollment_id, "Enrollment paused");
        Ok(enrollment)
    }

    /// PAUSED -> ACTIVE, re-enqueueing the pending execution.
    pub fn resume(&self, enrollment_id: &Uuid) -> SequenceResult<Enrollment> {
        let now = self.clock.now();
        self.enrollments.update(enrollment_id, |e| {
            ensure_transition(e.status, EnrollmentStatus::Active)?;
            e.status = EnrollmentStatus::Active;
            e.updated_at = now;
            Ok(())
        })?;
        let pending = self.scheduler.enqueue_pending(enrollment_id)?;
        info!(
            enrollment_id = %enrollment_id,
            requeued = pending.is_some(),
            "Enrollment resumed"
        );
        self.enrollments.get(enrollment_id)
    }

    /// ACTIVE|PAUSED -> EXITED. Already-terminal enrollments are returned
    /// unchanged.
    pub fn exit(
        &self,
        enrollment_id: &Uuid,
        reason: ExitReason,
        details: impl Into<String>,
    ) -> SequenceResult<Enrollment> {
        let details = details.into();
        let (enrollment, changed) = self.finish(enrollment_id, EnrollmentStatus::Exited, reason, &details)?;
        if changed {
            info!(
                enrollment_id = %enrollment_id,
                reason = ?reason,
                details = %details,
                "Enrollment exited"
            );
            metrics::counter!("sequence.exits", "reason" => format!("{:?}", reason)).increment(1);
            self.emit(
                SequenceEventType::EnrollmentExited,
                enrollment.sequence_id,
                Some(enrollment.id),
                serde_json::json!({ "reason": reason, "details": details }),
            );
        }
        Ok(enrollment)
    }

    /// Marks the enrollment COMPLETED after its last step.
    pub fn complete(&self, enrollment_id: &Uuid) -> SequenceResult<Enrollment> {
        let (enrollment, changed) = self.finish(
            enrollment_id,
            EnrollmentStatus::Completed,
            ExitReason::Completed,
            "Sequence completed",
        )?;
        if changed {
            // A converted enrollment that reaches the end counts toward
            // total_converted again here.
            self.store
                .record_completed(&enrollment.sequence_id, enrollment.is_converted());
            info!(enrollment_id = %enrollment_id, "Enrollment completed");
            metrics::counter!("sequence.completions").increment(1);
            self.emit(
                SequenceEventType::EnrollmentCompleted,
                enrollment.sequence_id,
                Some(enrollment.id),
                serde_json::json!({ "converted": enrollment.is_converted() }),
            );
        }
        Ok(enrollment)
    }

    /// Unrecoverable error for this enrollment, e.g. its contact is gone.
    pub fn fail(&self, enrollment_id: &Uuid, details: impl Into<String>) -> SequenceResult<Enrollment> {
        let details = details.into();
        let (enrollment, changed) =
            self.finish(enrollment_id, EnrollmentStatus::Failed, ExitReason::Error, &details)?;
        if changed {
            warn!(enrollment_id = %enrollment_id, details = %details, "Enrollment failed");
            self.emit(
                SequenceEventType::EnrollmentExited,
                enrollment.sequence_id,
                Some(enrollment.id),
                serde_json::json!({ "reason": ExitReason::Error, "details": details }),
            );
        }
        Ok(enrollment)
    }

    /// Records a conversion once. Exits the enrollment when the sequence
    /// exits on conversion.
    pub fn mark_converted(
        &self,
        enrollment_id: &Uuid,
        value: Option<Decimal>,
    ) -> SequenceResult<Enrollment> {
        let now = self.clock.now();
        let mut newly_converted = false;
        let enrollment = self.enrollments.update(enrollment_id, |e| {
            if e.conversion.is_none() {
                e.conversion = Some(Conversion { at: now, value });
                e.updated_at = now;
                newly_converted = true;
            }
            Ok(())
        })?;
        if !newly_converted {
            return Ok(enrollment);
        }

        self.store.record_converted(&enrollment.sequence_id);
        info!(enrollment_id = %enrollment_id, value = ?value, "Enrollment converted");
        self.emit(
            SequenceEventType::EnrollmentConverted,
            enrollment.sequence_id,
            Some(enrollment.id),
            serde_json::json!({ "value": value }),
        );

        let sequence = self.store.get_sequence(&enrollment.sequence_id)?;
        if sequence.exit_rules.on_conversion && !enrollment.status.is_terminal() {
            return self.exit(enrollment_id, ExitReason::Converted, "Contact converted");
        }
        Ok(enrollment)
    }

    /// Gives a stalled enrollment a fresh attempt at its current step.
    pub async fn retry_stalled(&self, enrollment_id: &Uuid) -> SequenceResult<NextStep> {
        let enrollment = self.enrollments.get(enrollment_id)?;
        if enrollment.status != EnrollmentStatus::Active {
            return Err(SequenceError::Validation(format!(
                "enrollment {} is {:?}, only ACTIVE enrollments can be retried",
                enrollment_id, enrollment.status
            )));
        }
        let stalled = self
            .executions
            .latest_for(enrollment_id)
            .map(|e| e.status == ExecutionStatus::Failed)
            .unwrap_or(false);
        if !stalled {
            return Err(SequenceError::Validation(format!(
                "enrollment {} is not stalled",
                enrollment_id
            )));
        }
        info!(enrollment_id = %enrollment_id, "Retrying stalled enrollment");
        self.scheduler.reschedule_current(enrollment_id).await
    }

    pub fn get(&self, enrollment_id: &Uuid) -> SequenceResult<Enrollment> {
        self.enrollments.get(enrollment_id)
    }

    pub fn find(&self, sequence_id: &Uuid, contact_id: &Uuid) -> Option<Enrollment> {
        self.enrollments.find(sequence_id, contact_id)
    }

    pub fn for_sequence(&self, sequence_id: &Uuid) -> Vec<Enrollment> {
        self.enrollments.for_sequence(sequence_id)
    }

    /// Moves a live enrollment into a terminal status. Returns whether the
    /// row changed.
    fn finish(
        &self,
        enrollment_id: &Uuid,
        to: EnrollmentStatus,
        reason: ExitReason,
        details: &str,
    ) -> SequenceResult<(Enrollment, bool)> {
        let now = self.clock.now();
        let mut changed = false;
        let enrollment = self.enrollments.update(enrollment_id, |e| {
            if e.status.is_terminal() {
                return Ok(());
            }
            ensure_transition(e.status, to)?;
            e.status = to;
            e.next_fire_at = None;
            e.exit = Some(ExitRecord {
                reason,
                details: details.to_string(),
                at: now,
            });
            e.updated_at = now;
            changed = true;
            Ok(())
        })?;
        if changed {
            let skipped = self
                .executions
                .skip_pending(enrollment_id, reason.as_str(), now)?;
            if let Some(execution) = skipped {
                debug!(
                    enrollment_id = %enrollment_id,
                    execution_id = %execution.id,
                    reason = reason.as_str(),
                    "Pending execution skipped"
                );
            }
        }
        Ok((enrollment, changed))
    }

    fn emit(
        &self,
        event_type: SequenceEventType,
        sequence_id: Uuid,
        enrollment_id: Option<Uuid>,
        detail: serde_json::Value,
    ) {
        self.event_sink
            .emit(make_event(event_type, sequence_id, enrollment_id, None, detail));
    }
}
