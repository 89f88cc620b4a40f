use async_trait::async_trait;
use serde_json::json;

use super::{HandlerError, StepContext, StepHandler, StepOutput};
use crate::types::{Enrollment, Step, StepType};

/// The delay already elapsed before the step fired; this only leaves a
/// typed entry in the ledger.
pub struct WaitHandler;

#[async_trait]
impl StepHandler for WaitHandler {
    fn step_type(&self) -> StepType {
        StepType::Wait
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        _enrollment: &Enrollment,
        step: &Step,
    ) -> Result<StepOutput, HandlerError> {
        Ok(StepOutput::payload(json!({
            "waited": {
                "days": step.delay.days,
                "hours": step.delay.hours,
                "day_type": step.day_type,
            },
            "completed_at": ctx.now,
        })))
    }
}
