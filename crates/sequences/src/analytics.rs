//! Sequence reports, enrollment timelines and engagement roll-up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use outreach_core::collaborators::EngagementSource;
use outreach_core::event_bus::{make_event, EventSink};
use outreach_core::types::{EngagementEvent, EngagementKind, SequenceEventType};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{SequenceError, SequenceResult};
use crate::executions::ExecutionStore;
use crate::repo::EnrollmentRepo;
use crate::store::{SequenceStore, StepCounter};
use crate::types::{
    EnrollmentStatus, ExecutionStatus, ExitReason, SequenceStatus, StepType,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceReport {
    pub sequence_id: Uuid,
    pub sequence_name: String,
    pub status: SequenceStatus,
    pub total_enrolled: u64,
    pub total_active: u64,
    pub total_completed: u64,
    pub total_converted: u64,
    /// Percent of enrolled, 2 dp.
    pub conversion_rate: f64,
    pub average_days_to_complete: Option<f64>,
    /// Display-only length of the whole sequence.
    pub estimated_duration_hours: f64,
    pub step_performance: Vec<StepPerformance>,
    pub conversion_funnel: Vec<FunnelStage>,
    /// Sorted by count, descending.
    pub exit_reasons: Vec<ExitReasonCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPerformance {
    pub step_id: Uuid,
    pub step_name: String,
    pub step_order: u32,
    pub total_sent: u64,
    pub total_opened: u64,
    pub total_clicked: u64,
    pub total_replied: u64,
    pub open_rate: f64,
    pub click_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelStage {
    pub step_name: String,
    pub step_order: u32,
    pub contacts_reached: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitReasonCount {
    pub reason: ExitReason,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeline {
    pub enrollment_id: Uuid,
    pub sequence_name: String,
    pub status: EnrollmentStatus,
    pub entries: Vec<TimelineEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub execution_id: Uuid,
    pub step_name: String,
    pub step_type: Option<StepType>,
    pub attempt: u32,
    pub status: ExecutionStatus,
    pub scheduled_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub result: serde_json::Value,
    pub error: Option<String>,
    /// Every status the ledger recorded for this execution, in order.
    pub transitions: Vec<(ExecutionStatus, DateTime<Utc>)>,
}

pub struct SequenceAnalytics {
    store: Arc<SequenceStore>,
    enrollments: Arc<EnrollmentRepo>,
    executions: Arc<ExecutionStore>,
    engagement: Arc<dyn EngagementSource>,
    event_sink: Arc<dyn EventSink>,
    call_timeout: Duration,
}

impl SequenceAnalytics {
    pub fn new(
        store: Arc<SequenceStore>,
        enrollments: Arc<EnrollmentRepo>,
        executions: Arc<ExecutionStore>,
        engagement: Arc<dyn EngagementSource>,
        event_sink: Arc<dyn EventSink>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            enrollments,
            executions,
            engagement,
            event_sink,
            call_timeout,
        }
    }

    /// Hands the event to the ingestion pipeline and, for a new correlated
    /// open/click/reply, bumps the step's counter. Returns whether the event
    /// was new.
    pub async fn record_engagement(&self, event: EngagementEvent) -> SequenceResult<bool> {
        let correlation = event.step_id.zip(event.enrollment_id);
        let kind = event.kind;
        let recorded = tokio::time::timeout(self.call_timeout, self.engagement.record_event(event))
            .await
            .map_err(|_| {
                SequenceError::TransientExecution("engagement ingestion timed out".into())
            })??;
        if !recorded {
            return Ok(false);
        }

        let counter = match kind {
            EngagementKind::Opened => Some(StepCounter::Opened),
            EngagementKind::Clicked => Some(StepCounter::Clicked),
            EngagementKind::Replied => Some(StepCounter::Replied),
            _ => None,
        };
        if let (Some(counter), Some((step_id, enrollment_id))) = (counter, correlation) {
            self.store.record_step(&step_id, counter);
            if let Ok(enrollment) = self.enrollments.get(&enrollment_id) {
                self.event_sink.emit(make_event(
                    SequenceEventType::EngagementRecorded,
                    enrollment.sequence_id,
                    Some(enrollment_id),
                    Some(step_id),
                    serde_json::json!({ "kind": kind }),
                ));
            }
            debug!(step_id = %step_id, kind = ?kind, "Engagement rolled up");
        }
        Ok(true)
    }

    pub fn report(&self, sequence_id: &Uuid) -> SequenceResult<SequenceReport> {
        let sequence = self.store.get_sequence(sequence_id)?;
        let steps = self.store.steps(sequence_id);
        let enrollments = self.enrollments.for_sequence(sequence_id);
        let stats = &sequence.stats;

        let step_performance = steps
            .iter()
            .filter(|s| s.step_type() == StepType::Email)
            .map(|s| StepPerformance {
                step_id: s.id,
                step_name: s.name.clone(),
                step_order: s.order,
                total_sent: s.stats.total_sent,
                total_opened: s.stats.total_opened,
                total_clicked: s.stats.total_clicked,
                total_replied: s.stats.total_replied,
                open_rate: percent(s.stats.total_opened, s.stats.total_sent),
                click_rate: percent(s.stats.total_clicked, s.stats.total_sent),
            })
            .collect();

        let conversion_funnel = if stats.total_enrolled > 0 {
            steps
                .iter()
                .enumerate()
                .map(|(position, s)| {
                    let reached = enrollments
                        .iter()
                        .filter(|e| e.current_step_index as usize >= position)
                        .count() as u64;
                    FunnelStage {
                        step_name: s.name.clone(),
                        step_order: s.order,
                        contacts_reached: reached,
                        percentage: percent(reached, stats.total_enrolled),
                    }
                })
                .collect()
        } else {
            Vec::new()
        };

        let mut reason_counts: HashMap<ExitReason, u64> = HashMap::new();
        for enrollment in &enrollments {
            if let Some(exit) = &enrollment.exit {
                *reason_counts.entry(exit.reason).or_default() += 1;
            }
        }
        let mut exit_reasons: Vec<ExitReasonCount> = reason_counts
            .into_iter()
            .map(|(reason, count)| ExitReasonCount { reason, count })
            .collect();
        exit_reasons.sort_by(|a, b| b.count.cmp(&a.count));

        let completion_days: Vec<f64> = enrollments
            .iter()
            .filter(|e| e.status == EnrollmentStatus::Completed)
            .filter_map(|e| e.exit.as_ref().map(|x| x.at - e.enrolled_at))
            .map(|d| d.num_seconds() as f64 / 86_400.0)
            .collect();
        let average_days_to_complete = if completion_days.is_empty() {
            None
        } else {
            Some(round2(
                completion_days.iter().sum::<f64>() / completion_days.len() as f64,
            ))
        };

        Ok(SequenceReport {
            sequence_id: sequence.id,
            sequence_name: sequence.name.clone(),
            status: sequence.status,
            total_enrolled: stats.total_enrolled,
            total_active: enrollments
                .iter()
                .filter(|e| e.status == EnrollmentStatus::Active)
                .count() as u64,
            total_completed: stats.total_completed,
            total_converted: stats.total_converted,
            conversion_rate: percent(stats.total_converted, stats.total_enrolled),
            average_days_to_complete,
            estimated_duration_hours: steps
                .iter()
                .map(|s| s.delay.approximate_hours(s.day_type))
                .sum(),
            step_performance,
            conversion_funnel,
            exit_reasons,
        })
    }

    /// Executions of one enrollment ordered by scheduled time, with the
    /// ledger's transition history for each.
    pub fn timeline(&self, enrollment_id: &Uuid) -> SequenceResult<Timeline> {
        let enrollment = self.enrollments.get(enrollment_id)?;
        let sequence = self.store.get_sequence(&enrollment.sequence_id)?;
        let steps: HashMap<Uuid, (String, StepType)> = self
            .store
            .steps(&sequence.id)
            .into_iter()
            .map(|s| (s.id, (s.name.clone(), s.step_type())))
            .collect();

        let mut executions = self.executions.for_enrollment(enrollment_id);
        executions.sort_by_key(|e| e.scheduled_at);
        let ledger = self.executions.ledger();

        let entries = executions
            .into_iter()
            .map(|e| {
                let (step_name, step_type) = match steps.get(&e.step_id) {
                    Some((name, kind)) => (name.clone(), Some(*kind)),
                    None => ("(removed step)".to_string(), None),
                };
                TimelineEntry {
                    execution_id: e.id,
                    step_name,
                    step_type,
                    attempt: e.attempt,
                    status: e.status,
                    scheduled_at: e.scheduled_at,
                    executed_at: e.executed_at,
                    transitions: ledger
                        .entries_for_execution(&e.id)
                        .into_iter()
                        .map(|entry| (entry.to, entry.at))
                        .collect(),
                    result: e.result,
                    error: e.error,
                }
            })
            .collect();

        Ok(Timeline {
            enrollment_id: enrollment.id,
            sequence_name: sequence.name,
            status: enrollment.status,
            entries,
        })
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round2(part as f64 / whole as f64 * 100.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
