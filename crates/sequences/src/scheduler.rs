//! Fire-time computation and step scheduling.
//!
//! The scheduler is the only writer of an enrollment's step pointer and
//! `next_fire_at`, and it guarantees at most one pending execution per
//! enrollment by going through [`ExecutionStore::create_scheduled`].

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone, Utc, Weekday};
use outreach_core::collaborators::ContactStore;
use outreach_core::event_bus::{make_event, EventSink};
use outreach_core::types::SequenceEventType;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{SequenceError, SequenceResult};
use crate::executions::{ExecutionStore, Finish};
use crate::queue::DeferredQueue;
use crate::repo::EnrollmentRepo;
use crate::state_machine::Lifecycle;
use crate::store::SequenceStore;
use crate::types::{
    DayType, Enrollment, EnrollmentStatus, ExecutionStatus, SendWindow, Step, StepExecution,
};

/// Longest delay accepted before a step is considered malformed.
const MAX_DELAY_DAYS: u32 = 3650;

/// What happened when the scheduler looked for the next step.
#[derive(Debug, Clone)]
pub enum NextStep {
    /// A SCHEDULED execution exists for the step.
    Scheduled(StepExecution),
    /// The fire time could not be computed; the row was recorded FAILED and
    /// the enrollment is left ACTIVE without a pending execution.
    Stalled(StepExecution),
    /// No step with a greater order remains.
    Exhausted,
    /// The enrollment is terminal; nothing was scheduled.
    Halted,
}

pub struct Scheduler {
    store: Arc<SequenceStore>,
    enrollments: Arc<EnrollmentRepo>,
    executions: Arc<ExecutionStore>,
    queue: Arc<dyn DeferredQueue>,
    clock: Arc<dyn Clock>,
    contacts: Arc<dyn ContactStore>,
    event_sink: Arc<dyn EventSink>,
    default_utc_offset: String,
    call_timeout: StdDuration,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SequenceStore>,
        enrollments: Arc<EnrollmentRepo>,
        executions: Arc<ExecutionStore>,
        queue: Arc<dyn DeferredQueue>,
        clock: Arc<dyn Clock>,
        contacts: Arc<dyn ContactStore>,
        event_sink: Arc<dyn EventSink>,
        default_utc_offset: String,
        call_timeout: StdDuration,
    ) -> Self {
        Self {
            store,
            enrollments,
            executions,
            queue,
            clock,
            contacts,
            event_sink,
            default_utc_offset,
            call_timeout,
        }
    }

    /// Fire time for `step` relative to now, in the recipient's zone when it
    /// resolves and the org default otherwise.
    pub fn compute_next_fire_time(
        &self,
        window: &SendWindow,
        step: &Step,
        recipient_zone: Option<&str>,
    ) -> SequenceResult<DateTime<Utc>> {
        let offset = self.resolve_offset(recipient_zone)?;
        compute_fire_time(self.clock.now(), step, window, offset)
    }

    fn resolve_offset(&self, recipient_zone: Option<&str>) -> SequenceResult<FixedOffset> {
        if let Some(offset) = recipient_zone.and_then(parse_utc_offset) {
            return Ok(offset);
        }
        parse_utc_offset(&self.default_utc_offset).ok_or_else(|| {
            SequenceError::Scheduling(format!(
                "unresolvable default zone '{}'",
                self.default_utc_offset
            ))
        })
    }

    async fn recipient_zone(&self, contact_id: Uuid) -> Option<String> {
        match tokio::time::timeout(self.call_timeout, self.contacts.get_contact(contact_id)).await {
            Ok(Ok(contact)) => contact.timezone,
            Ok(Err(e)) => {
                warn!(contact_id = %contact_id, error = %e, "Contact lookup failed, using default zone");
                None
            }
            Err(_) => {
                warn!(contact_id = %contact_id, "Contact lookup timed out, using default zone");
                None
            }
        }
    }

    /// Schedules the step with the smallest order.
    pub async fn schedule_first_step(&self, enrollment: &Enrollment) -> SequenceResult<NextStep> {
        match self.store.first_step(&enrollment.sequence_id) {
            Some(step) => self.schedule_step(enrollment.id, &step, 1).await,
            None => Ok(NextStep::Exhausted),
        }
    }

    /// Schedules the step after the enrollment's current one.
    pub async fn schedule_next(&self, enrollment_id: &Uuid) -> SequenceResult<NextStep> {
        let enrollment = self.enrollments.get(enrollment_id)?;
        if enrollment.status.is_terminal() {
            return Ok(NextStep::Halted);
        }
        let next = match enrollment.current_step_order {
            Some(order) => self.store.next_step_after(&enrollment.sequence_id, order),
            None => self.store.first_step(&enrollment.sequence_id),
        };
        match next {
            Some(step) => self.schedule_step(enrollment.id, &step, 1).await,
            None => Ok(NextStep::Exhausted),
        }
    }

    /// Fresh first attempt at the enrollment's current step.
    pub async fn reschedule_current(&self, enrollment_id: &Uuid) -> SequenceResult<NextStep> {
        let enrollment = self.enrollments.get(enrollment_id)?;
        if enrollment.status.is_terminal() {
            return Ok(NextStep::Halted);
        }
        let step_id = enrollment
            .current_step_id
            .ok_or_else(|| SequenceError::Validation(format!(
                "enrollment {} has no current step",
                enrollment_id
            )))?;
        let step = self.store.step(&step_id)?;
        self.schedule_step(enrollment.id, &step, 1).await
    }

    /// Next attempt of a failed execution at `at`.
    pub fn schedule_retry(
        &self,
        failed: &StepExecution,
        at: DateTime<Utc>,
    ) -> SequenceResult<StepExecution> {
        let now = self.clock.now();
        let execution = self.executions.create_scheduled(
            failed.enrollment_id,
            failed.sequence_id,
            failed.step_id,
            failed.attempt + 1,
            at,
            now,
        )?;
        let enrollment = self.enrollments.update(&failed.enrollment_id, |e| {
            e.next_fire_at = (e.status == EnrollmentStatus::Active).then_some(at);
            e.updated_at = now;
            Ok(())
        })?;
        if enrollment.status == EnrollmentStatus::Active {
            self.queue.schedule_at(execution.id, at);
        }
        info!(
            enrollment_id = %failed.enrollment_id,
            execution_id = %execution.id,
            attempt = execution.attempt,
            fire_at = %at,
            "Retry scheduled"
        );
        Ok(execution)
    }

    /// Re-enqueues the enrollment's SCHEDULED execution, no earlier than now.
    pub fn enqueue_pending(&self, enrollment_id: &Uuid) -> SequenceResult<Option<StepExecution>> {
        let pending = self
            .executions
            .pending_for(enrollment_id)
            .filter(|e| e.status == ExecutionStatus::Scheduled);
        let Some(pending) = pending else {
            return Ok(None);
        };
        let now = self.clock.now();
        let at = pending.scheduled_at.max(now);
        self.enrollments.update(enrollment_id, |e| {
            e.next_fire_at = Some(at);
            e.updated_at = now;
            Ok(())
        })?;
        self.queue.schedule_at(pending.id, at);
        Ok(Some(pending))
    }

    /// Clears `next_fire_at`; the enrollment stays in its current status.
    pub fn mark_stalled(&self, enrollment_id: &Uuid) -> SequenceResult<()> {
        let now = self.clock.now();
        self.enrollments.update(enrollment_id, |e| {
            e.next_fire_at = None;
            e.updated_at = now;
            Ok(())
        })?;
        Ok(())
    }

    async fn schedule_step(
        &self,
        enrollment_id: Uuid,
        step: &Step,
        attempt: u32,
    ) -> SequenceResult<NextStep> {
        let enrollment = self.enrollments.get(&enrollment_id)?;
        let sequence = self.store.get_sequence(&enrollment.sequence_id)?;
        let zone = self.recipient_zone(enrollment.contact_id).await;
        let position = self
            .store
            .position_of(&sequence.id, &step.id)
            .unwrap_or(enrollment.current_step_index);
        let now = self.clock.now();

        let fire_at = match self.compute_next_fire_time(&sequence.send_window, step, zone.as_deref()) {
            Ok(at) => at,
            Err(SequenceError::Scheduling(reason)) => {
                return self.record_scheduling_failure(&enrollment, step, attempt, position, reason);
            }
            Err(e) => return Err(e),
        };

        let execution = self.executions.create_scheduled(
            enrollment.id,
            sequence.id,
            step.id,
            attempt,
            fire_at,
            now,
        )?;
        let updated = self.enrollments.update(&enrollment.id, |e| {
            e.current_step_id = Some(step.id);
            e.current_step_order = Some(step.order);
            e.current_step_index = e.current_step_index.max(position);
            e.next_fire_at = (e.status == EnrollmentStatus::Active).then_some(fire_at);
            e.updated_at = now;
            Ok(())
        })?;
        if updated.status == EnrollmentStatus::Active {
            self.queue.schedule_at(execution.id, fire_at);
        }

        info!(
            enrollment_id = %enrollment.id,
            step_id = %step.id,
            order = step.order,
            fire_at = %fire_at,
            "Step scheduled"
        );
        metrics::counter!("sequence.steps_scheduled").increment(1);
        self.event_sink.emit(make_event(
            SequenceEventType::StepScheduled,
            sequence.id,
            Some(enrollment.id),
            Some(step.id),
            serde_json::json!({ "fire_at": fire_at, "attempt": attempt }),
        ));
        Ok(NextStep::Scheduled(execution))
    }

    /// Records the step FAILED with a scheduling error and leaves the
    /// enrollment ACTIVE with no pending execution.
    fn record_scheduling_failure(
        &self,
        enrollment: &Enrollment,
        step: &Step,
        attempt: u32,
        position: u32,
        reason: String,
    ) -> SequenceResult<NextStep> {
        let now = self.clock.now();
        let execution = self.executions.create_scheduled(
            enrollment.id,
            enrollment.sequence_id,
            step.id,
            attempt,
            now,
            now,
        )?;
        self.executions.claim(&execution.id, now)?;
        let failed = self.executions.finish(
            &execution.id,
            Finish::failed(
                format!("scheduling error: {}", reason),
                serde_json::json!({ "phase": "scheduling" }),
            ),
            now,
        )?;
        self.enrollments.update(&enrollment.id, |e| {
            e.current_step_id = Some(step.id);
            e.current_step_order = Some(step.order);
            e.current_step_index = e.current_step_index.max(position);
            e.next_fire_at = None;
            e.updated_at = now;
            Ok(())
        })?;

        warn!(
            enrollment_id = %enrollment.id,
            step_id = %step.id,
            reason = %reason,
            "Step could not be scheduled"
        );
        metrics::counter!("sequence.scheduling_failures").increment(1);
        self.event_sink.emit(make_event(
            SequenceEventType::StepFailed,
            enrollment.sequence_id,
            Some(enrollment.id),
            Some(step.id),
            serde_json::json!({ "phase": "scheduling", "error": reason }),
        ));
        Ok(NextStep::Stalled(failed))
    }
}

/// Exact fire time for a step, evaluated in `offset`'s local time.
///
/// BUSINESS delays advance one day at a time and skip Saturdays and Sundays;
/// CALENDAR delays add whole days. Hours are added after the days. With a
/// timezone-optimized window the time of day snaps to the optimal hour, and
/// a result at or before `now` moves to the next day (and on to Monday when
/// that day is a weekend and weekends are skipped).
pub fn compute_fire_time(
    now: DateTime<Utc>,
    step: &Step,
    window: &SendWindow,
    offset: FixedOffset,
) -> SequenceResult<DateTime<Utc>> {
    if step.delay.days > MAX_DELAY_DAYS || step.delay.hours > MAX_DELAY_DAYS * 24 {
        return Err(SequenceError::Scheduling(format!(
            "malformed delay on step {}: {} days {} hours",
            step.id, step.delay.days, step.delay.hours
        )));
    }
    if window.optimal_send_hour > 23 {
        return Err(SequenceError::Scheduling(format!(
            "optimal send hour {} is outside 0-23",
            window.optimal_send_hour
        )));
    }
    let overflow = || SequenceError::Scheduling(format!("fire time for step {} overflows", step.id));

    let mut local = now.with_timezone(&offset);
    match step.day_type {
        DayType::Business => {
            let mut added = 0;
            while added < step.delay.days {
                local = local.checked_add_signed(Duration::days(1)).ok_or_else(overflow)?;
                if is_weekend(local.weekday()) {
                    continue;
                }
                added += 1;
            }
        }
        DayType::Calendar => {
            local = local
                .checked_add_signed(Duration::days(step.delay.days as i64))
                .ok_or_else(overflow)?;
        }
    }
    local = local
        .checked_add_signed(Duration::hours(step.delay.hours as i64))
        .ok_or_else(overflow)?;

    if window.timezone_optimized {
        let naive = local
            .date_naive()
            .and_hms_opt(window.optimal_send_hour as u32, 0, 0)
            .ok_or_else(overflow)?;
        local = offset
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(overflow)?;
        if local.with_timezone(&Utc) <= now {
            local = local.checked_add_signed(Duration::days(1)).ok_or_else(overflow)?;
            if window.skip_weekends && is_weekend(local.weekday()) {
                local = roll_to_monday(local).ok_or_else(overflow)?;
            }
        }
    }

    if step.day_type == DayType::Business && window.skip_weekends && is_weekend(local.weekday()) {
        local = roll_to_monday(local).ok_or_else(overflow)?;
    }

    Ok(local.with_timezone(&Utc))
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

fn roll_to_monday(at: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    let days = 7 - at.weekday().num_days_from_monday() as i64;
    at.checked_add_signed(Duration::days(days))
}

/// Parses `UTC`, `Z`, `GMT`, `+HH:MM`, `+HHMM`, `+HH` and the same with a
/// `UTC`/`GMT` prefix. Region names are not resolvable here and yield `None`.
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let trimmed = raw.trim();
    let upper = trimmed.to_ascii_uppercase();
    if matches!(upper.as_str(), "UTC" | "Z" | "GMT") {
        return FixedOffset::east_opt(0);
    }
    let body = upper
        .strip_prefix("UTC")
        .or_else(|| upper.strip_prefix("GMT"))
        .unwrap_or(&upper);

    let (sign, digits) = match body.chars().next()? {
        '+' => (1, &body[1..]),
        '-' => (-1, &body[1..]),
        _ => return None,
    };
    if !digits.is_ascii() {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits, "00"),
        4 => (&digits[..2], &digits[2..]),
        5 if digits.as_bytes()[2] == b':' => (&digits[..2], &digits[3..]),
        _ => return None,
    };
    if !hours.bytes().chain(minutes.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 18 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
