//! Runs one delivered StepExecution: claim, exit check, handler dispatch,
//! outcome recording and hand-off to the scheduler.
//!
//! Handler failures never escape as errors. They are written to the
//! execution row and reported through [`ExecutionOutcome`] so one
//! enrollment's failure cannot abort a worker batch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use outreach_core::collaborators::ContactStore;
use outreach_core::config::ExecutorConfig;
use outreach_core::event_bus::{make_event, EventSink};
use outreach_core::types::{Contact, SequenceEventType};
use outreach_core::CollaboratorError;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::enrollment::EnrollmentManager;
use crate::error::SequenceResult;
use crate::executions::{ClaimOutcome, ExecutionStore, Finish};
use crate::exit::ExitEvaluator;
use crate::handlers::{HandlerError, HandlerRegistry, StepContext};
use crate::repo::EnrollmentRepo;
use crate::scheduler::{NextStep, Scheduler};
use crate::state_machine::Lifecycle;
use crate::store::{SequenceStore, StepCounter};
use crate::types::{EnrollmentStatus, ExecutionStatus, ExitReason, StepExecution};

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// The handler succeeded; `next` says what the scheduler did afterwards.
    Completed {
        execution: StepExecution,
        next: NextStep,
    },
    Skipped {
        execution: StepExecution,
        reason: String,
    },
    /// `retry` holds the next attempt when one was scheduled.
    Failed {
        execution: StepExecution,
        retry: Option<StepExecution>,
        retryable: bool,
    },
    /// Duplicate delivery: the row had already left SCHEDULED.
    NoOp { status: ExecutionStatus },
    /// The enrollment is paused; the row stays SCHEDULED until resume.
    Deferred,
}

pub struct StepExecutor {
    store: Arc<SequenceStore>,
    enrollments: Arc<EnrollmentRepo>,
    executions: Arc<ExecutionStore>,
    scheduler: Arc<Scheduler>,
    manager: Arc<EnrollmentManager>,
    exit_evaluator: Arc<ExitEvaluator>,
    handlers: HandlerRegistry,
    contacts: Arc<dyn ContactStore>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    config: ExecutorConfig,
}

impl StepExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SequenceStore>,
        enrollments: Arc<EnrollmentRepo>,
        executions: Arc<ExecutionStore>,
        scheduler: Arc<Scheduler>,
        manager: Arc<EnrollmentManager>,
        exit_evaluator: Arc<ExitEvaluator>,
        handlers: HandlerRegistry,
        contacts: Arc<dyn ContactStore>,
        clock: Arc<dyn Clock>,
        event_sink: Arc<dyn EventSink>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            enrollments,
            executions,
            scheduler,
            manager,
            exit_evaluator,
            handlers,
            contacts,
            clock,
            event_sink,
            config,
        }
    }

    fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.config.handler_timeout_ms)
    }

    pub async fn execute(&self, execution_id: &Uuid) -> SequenceResult<ExecutionOutcome> {
        let pending = self.executions.get(execution_id)?;
        if pending.status != ExecutionStatus::Scheduled {
            debug!(execution_id = %execution_id, status = ?pending.status, "Duplicate delivery ignored");
            return Ok(ExecutionOutcome::NoOp {
                status: pending.status,
            });
        }
        if self.enrollments.get(&pending.enrollment_id)?.status == EnrollmentStatus::Paused {
            debug!(
                execution_id = %execution_id,
                enrollment_id = %pending.enrollment_id,
                "Enrollment paused, execution deferred"
            );
            return Ok(ExecutionOutcome::Deferred);
        }

        let execution = match self.executions.claim(execution_id, self.clock.now())? {
            ClaimOutcome::Claimed(execution) => execution,
            ClaimOutcome::AlreadyClaimed(status) => {
                debug!(execution_id = %execution_id, status = ?status, "Lost claim race");
                return Ok(ExecutionOutcome::NoOp { status });
            }
        };

        let enrollment = self.enrollments.get(&execution.enrollment_id)?;
        if enrollment.status.is_terminal() {
            let reason = format!("enrollment {:?}", enrollment.status).to_lowercase();
            return self.skip(execution, reason, json!({}));
        }

        let sequence = self.store.get_sequence(&execution.sequence_id)?;
        let step = match self.store.step(&execution.step_id) {
            Ok(step) => step,
            Err(e) => {
                return self
                    .handle_failure(execution, HandlerError::Permanent(e.to_string()))
                    .await
            }
        };
        self.store.lock_configuration(&sequence.id);

        let contact = match self.fetch_contact(enrollment.contact_id).await {
            Ok(contact) => contact,
            Err(CollaboratorError::NotFound { .. }) => {
                let failed = self.executions.finish(
                    &execution.id,
                    Finish::failed("contact not found", json!({ "retryable": false })),
                    self.clock.now(),
                )?;
                self.manager.fail(&enrollment.id, "Contact no longer exists")?;
                return Ok(ExecutionOutcome::Failed {
                    execution: failed,
                    retry: None,
                    retryable: false,
                });
            }
            Err(e) => return self.handle_failure(execution, e.into()).await,
        };

        match self
            .exit_evaluator
            .evaluate(&sequence, &enrollment, &contact)
            .await
        {
            Ok(Some(signal)) => {
                let details = signal.describe();
                let skipped = self.skip(
                    execution,
                    "exit_condition".to_string(),
                    json!({ "signal": signal }),
                )?;
                self.manager
                    .exit(&enrollment.id, ExitReason::ConditionMet, details)?;
                return Ok(skipped);
            }
            Ok(None) => {}
            Err(e) => return self.handle_failure(execution, e).await,
        }

        let Some(handler) = self.handlers.get(step.step_type()) else {
            let err = HandlerError::Misconfigured(format!("no handler for {} steps", step.step_type()));
            return self.handle_failure(execution, err).await;
        };

        let ctx = StepContext {
            sequence,
            execution: execution.clone(),
            contact,
            now: self.clock.now(),
        };
        let limit = self.handler_timeout();
        let result = match tokio::time::timeout(limit, handler.execute(&ctx, &enrollment, &step)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::Timeout {
                millis: limit.as_millis() as u64,
            }),
        };

        let output = match result {
            Ok(output) => output,
            Err(e) => return self.handle_failure(execution, e).await,
        };

        if let Some((group, label)) = &output.variant_assignment {
            self.enrollments.update(&enrollment.id, |e| {
                e.variant_assignments
                    .entry(group.clone())
                    .or_insert_with(|| label.clone());
                Ok(())
            })?;
        }

        let completed = self.executions.finish(
            &execution.id,
            Finish::completed(output.payload.clone(), output.provider_message_id.clone()),
            self.clock.now(),
        )?;
        if output.sent {
            self.store.record_step(&step.id, StepCounter::Sent);
        }
        info!(
            execution_id = %completed.id,
            enrollment_id = %enrollment.id,
            step_id = %step.id,
            step_type = %step.step_type(),
            attempt = completed.attempt,
            "Step completed"
        );
        metrics::counter!("sequence.steps_completed", "step_type" => step.step_type().to_string())
            .increment(1);
        self.emit(SequenceEventType::StepCompleted, &completed, output.payload);

        let next = self.scheduler.schedule_next(&enrollment.id).await?;
        if let NextStep::Exhausted = next {
            self.manager.complete(&enrollment.id)?;
        }
        Ok(ExecutionOutcome::Completed {
            execution: completed,
            next,
        })
    }

    async fn fetch_contact(&self, contact_id: Uuid) -> Result<Contact, CollaboratorError> {
        let limit = self.handler_timeout();
        match tokio::time::timeout(limit, self.contacts.get_contact(contact_id)).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout {
                service: "contact store",
                millis: limit.as_millis() as u64,
            }),
        }
    }

    fn skip(
        &self,
        execution: StepExecution,
        reason: String,
        extra: serde_json::Value,
    ) -> SequenceResult<ExecutionOutcome> {
        let mut finish = Finish::skipped(reason.clone());
        if let (Some(result), serde_json::Value::Object(extra)) = (finish.result.as_object_mut(), extra) {
            result.extend(extra);
        }
        let skipped = self
            .executions
            .finish(&execution.id, finish, self.clock.now())?;
        info!(
            execution_id = %skipped.id,
            enrollment_id = %skipped.enrollment_id,
            reason = %reason,
            "Step skipped"
        );
        self.emit(SequenceEventType::StepSkipped, &skipped, skipped.result.clone());
        Ok(ExecutionOutcome::Skipped {
            execution: skipped,
            reason,
        })
    }

    /// Records the failure and either schedules the next attempt or leaves
    /// the enrollment ACTIVE without a pending execution.
    async fn handle_failure(
        &self,
        execution: StepExecution,
        err: HandlerError,
    ) -> SequenceResult<ExecutionOutcome> {
        let now = self.clock.now();
        let retryable = err.is_retryable();
        let failed = self.executions.finish(
            &execution.id,
            Finish::failed(
                err.to_string(),
                json!({ "retryable": retryable, "attempt": execution.attempt }),
            ),
            now,
        )?;
        metrics::counter!("sequence.steps_failed").increment(1);
        self.emit(
            SequenceEventType::StepFailed,
            &failed,
            json!({ "error": err.to_string(), "attempt": failed.attempt }),
        );

        let enrollment = self.enrollments.get(&failed.enrollment_id)?;
        let can_retry = retryable
            && failed.attempt <= self.config.max_retries
            && !enrollment.status.is_terminal();
        if can_retry {
            let backoff = self.config.retry_backoff_secs as i64 * failed.attempt as i64;
            let retry_at = now + ChronoDuration::seconds(backoff);
            warn!(
                execution_id = %failed.id,
                enrollment_id = %failed.enrollment_id,
                attempt = failed.attempt,
                error = %err,
                retry_at = %retry_at,
                "Step failed, retrying"
            );
            let retry = self.scheduler.schedule_retry(&failed, retry_at)?;
            return Ok(ExecutionOutcome::Failed {
                execution: failed,
                retry: Some(retry),
                retryable,
            });
        }

        self.scheduler.mark_stalled(&failed.enrollment_id)?;
        error!(
            execution_id = %failed.id,
            enrollment_id = %failed.enrollment_id,
            attempt = failed.attempt,
            error = %err,
            "Step failed permanently, enrollment stalled"
        );
        Ok(ExecutionOutcome::Failed {
            execution: failed,
            retry: None,
            retryable,
        })
    }

    fn emit(&self, event_type: SequenceEventType, execution: &StepExecution, detail: serde_json::Value) {
        self.event_sink.emit(make_event(
            event_type,
            execution.sequence_id,
            Some(execution.enrollment_id),
            Some(execution.step_id),
            detail,
        ));
    }
}
