use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tracing::debug;

use super::{HandlerError, StepContext, StepHandler, StepOutput};
use crate::types::{AbTestStep, Enrollment, Step, StepKind, StepType};

/// Assigns the enrollment to a variant by weighted draw. An enrollment that
/// already holds an assignment for the group keeps it.
pub struct AbTestHandler {
    rng: Mutex<StdRng>,
}

impl AbTestHandler {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic draws.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn draw(&self, config: &AbTestStep) -> Option<String> {
        let total = config.total_weight();
        if total == 0 {
            return None;
        }
        let roll = self.rng.lock().gen_range(0..total);
        let mut cumulative = 0u64;
        for variant in &config.variants {
            cumulative += u64::from(variant.weight);
            if roll < cumulative {
                return Some(variant.label.clone());
            }
        }
        None
    }
}

impl Default for AbTestHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepHandler for AbTestHandler {
    fn step_type(&self) -> StepType {
        StepType::AbTest
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        enrollment: &Enrollment,
        step: &Step,
    ) -> Result<StepOutput, HandlerError> {
        let StepKind::AbTest(config) = &step.kind else {
            return Err(HandlerError::Misconfigured(format!(
                "step {} is not an A/B test step",
                step.id
            )));
        };

        if let Some(existing) = enrollment.variant_assignments.get(&config.group) {
            return Ok(StepOutput {
                payload: json!({ "group": config.group, "variant": existing, "reused": true }),
                variant_assignment: Some((config.group.clone(), existing.clone())),
                ..StepOutput::default()
            });
        }

        let label = self.draw(config).ok_or_else(|| {
            HandlerError::Misconfigured(format!("A/B step {} has no positive weights", step.id))
        })?;
        debug!(
            enrollment_id = %enrollment.id,
            group = %config.group,
            variant = %label,
            "Variant assigned"
        );
        Ok(StepOutput {
            payload: json!({ "group": config.group, "variant": label, "reused": false }),
            variant_assignment: Some((config.group.clone(), label)),
            ..StepOutput::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Variant;

    fn split(weights: &[(&str, u32)]) -> AbTestStep {
        AbTestStep {
            group: "subject_line".into(),
            variants: weights
                .iter()
                .map(|(label, weight)| Variant {
                    label: label.to_string(),
                    weight: *weight,
                })
                .collect(),
        }
    }

    #[test]
    fn test_weighted_draw_roughly_even() {
        let handler = AbTestHandler::with_seed(42);
        let config = split(&[("a", 50), ("b", 50)]);
        let a = (0..1000)
            .filter(|_| handler.draw(&config).as_deref() == Some("a"))
            .count();
        assert!((400..=600).contains(&a), "a = {}", a);
    }

    #[test]
    fn test_zero_weight_variant_never_drawn() {
        let handler = AbTestHandler::with_seed(7);
        let config = split(&[("a", 0), ("b", 10)]);
        for _ in 0..100 {
            assert_eq!(handler.draw(&config).as_deref(), Some("b"));
        }
        assert!(handler.draw(&split(&[("a", 0)])).is_none());
    }

    #[tokio::test]
    async fn test_existing_assignment_is_reused() {
        let handler = AbTestHandler::with_seed(11);
        let step = Step::new(0, "Split", StepKind::AbTest(split(&[("a", 50), ("b", 50)])));
        let (ctx, mut enrollment, step) =
            crate::handlers::fixtures::firing(outreach_core::types::Contact::new("ada@example.com"), step);

        let first = handler.execute(&ctx, &enrollment, &step).await.unwrap();
        assert_eq!(first.payload["reused"], false);
        let (group, label) = first.variant_assignment.unwrap();
        enrollment.variant_assignments.insert(group, label.clone());

        for _ in 0..20 {
            let again = handler.execute(&ctx, &enrollment, &step).await.unwrap();
            assert_eq!(again.payload["reused"], true);
            assert_eq!(again.payload["variant"], label.as_str());
            assert_eq!(
                again.variant_assignment,
                Some(("subject_line".to_string(), label.clone()))
            );
        }
    }

    #[test]
    fn test_huge_weights_draw_without_overflow() {
        let handler = AbTestHandler::with_seed(3);
        let config = split(&[("a", u32::MAX), ("b", u32::MAX)]);
        for _ in 0..50 {
            assert!(handler.draw(&config).is_some());
        }
    }
}
