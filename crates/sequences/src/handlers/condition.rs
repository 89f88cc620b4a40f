use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use outreach_core::collaborators::EngagementSource;
use outreach_core::types::{Contact, EngagementKind};
use parking_lot::RwLock;
use serde_json::json;
use tracing::debug;

use super::{with_timeout, HandlerError, StepContext, StepHandler, StepOutput};
use crate::types::{Enrollment, Predicate, Step, StepKind, StepType};

/// A named predicate registered by the host application.
pub type CustomPredicate =
    Arc<dyn Fn(&Contact, &Enrollment, &serde_json::Value) -> bool + Send + Sync>;

/// Evaluates a predicate against live contact and engagement data. The
/// outcome is recorded in the payload; it never changes which step runs
/// next.
pub struct ConditionHandler {
    engagement: Arc<dyn EngagementSource>,
    custom: RwLock<HashMap<String, CustomPredicate>>,
    call_timeout: Duration,
}

impl ConditionHandler {
    pub fn new(engagement: Arc<dyn EngagementSource>, call_timeout: Duration) -> Self {
        Self {
            engagement,
            custom: RwLock::new(HashMap::new()),
            call_timeout,
        }
    }

    pub fn register_custom(&self, key: impl Into<String>, predicate: CustomPredicate) {
        self.custom.write().insert(key.into(), predicate);
    }

    async fn evaluate(
        &self,
        predicate: &Predicate,
        contact: &Contact,
        enrollment: &Enrollment,
    ) -> Result<bool, HandlerError> {
        match predicate {
            Predicate::HasTag { tag } => Ok(contact.has_tag(tag)),
            Predicate::ScoreAbove { threshold } => Ok(contact.lead_score >= *threshold),
            Predicate::HasOpened => self.engaged(contact, EngagementKind::Opened).await,
            Predicate::HasClicked => self.engaged(contact, EngagementKind::Clicked).await,
            Predicate::Custom { key, params } => {
                let predicate = self.custom.read().get(key).cloned().ok_or_else(|| {
                    HandlerError::Misconfigured(format!("unknown custom condition '{}'", key))
                })?;
                Ok(predicate(contact, enrollment, params))
            }
        }
    }

    /// Any message to the contact counts, not only this enrollment's.
    async fn engaged(&self, contact: &Contact, kind: EngagementKind) -> Result<bool, HandlerError> {
        with_timeout(
            self.call_timeout,
            self.engagement.has_event(contact.id, kind, None),
        )
        .await
    }
}

#[async_trait]
impl StepHandler for ConditionHandler {
    fn step_type(&self) -> StepType {
        StepType::Condition
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        enrollment: &Enrollment,
        step: &Step,
    ) -> Result<StepOutput, HandlerError> {
        let StepKind::Condition(config) = &step.kind else {
            return Err(HandlerError::Misconfigured(format!(
                "step {} is not a condition step",
                step.id
            )));
        };

        let matched = self
            .evaluate(&config.predicate, &ctx.contact, enrollment)
            .await?;
        debug!(
            enrollment_id = %enrollment.id,
            condition = %config.predicate.name(),
            matched,
            "Condition evaluated"
        );
        Ok(StepOutput::payload(json!({
            "condition": config.predicate.name(),
            "result": matched,
        })))
    }
}
