use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use outreach_core::collaborators::{MessageTransport, TemplateRenderer};
use outreach_core::config::EmailConfig;
use outreach_core::types::{OutboundMessage, RenderRequest};
use serde_json::json;
use tracing::{debug, info};

use super::{with_timeout, HandlerError, StepContext, StepHandler, StepOutput};
use crate::types::{Enrollment, Step, StepKind, StepType};

/// Renders the step's template for the contact and hands it to the
/// transport. Outbound metadata carries the ids inbound engagement events
/// are correlated by.
pub struct EmailHandler {
    renderer: Arc<dyn TemplateRenderer>,
    transport: Arc<dyn MessageTransport>,
    email: EmailConfig,
    call_timeout: Duration,
}

impl EmailHandler {
    pub fn new(
        renderer: Arc<dyn TemplateRenderer>,
        transport: Arc<dyn MessageTransport>,
        email: EmailConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            renderer,
            transport,
            email,
            call_timeout,
        }
    }

    fn template_context(
        &self,
        ctx: &StepContext,
        enrollment: &Enrollment,
    ) -> HashMap<String, serde_json::Value> {
        let contact = &ctx.contact;
        let mut vars = HashMap::new();
        vars.insert("first_name".to_string(), json!(contact.first_name));
        vars.insert("last_name".to_string(), json!(contact.last_name));
        vars.insert("full_name".to_string(), json!(contact.full_name()));
        vars.insert("email".to_string(), json!(contact.email));
        vars.insert("company".to_string(), json!(contact.company));
        vars.insert("title".to_string(), json!(contact.title));
        for (key, value) in &enrollment.custom_variables {
            vars.insert(key.clone(), value.clone());
        }
        vars.insert("sequence_name".to_string(), json!(ctx.sequence.name));
        vars.insert(
            "unsubscribe_url".to_string(),
            json!(format!(
                "{}/{}",
                self.email.unsubscribe_base_url.trim_end_matches('/'),
                contact.id
            )),
        );
        vars
    }
}

#[async_trait]
impl StepHandler for EmailHandler {
    fn step_type(&self) -> StepType {
        StepType::Email
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        enrollment: &Enrollment,
        step: &Step,
    ) -> Result<StepOutput, HandlerError> {
        let StepKind::Email(config) = &step.kind else {
            return Err(HandlerError::Misconfigured(format!(
                "step {} is not an email step",
                step.id
            )));
        };

        if let Some(variant) = &config.variant {
            let assigned = enrollment.variant_assignments.get(&variant.group);
            if assigned != Some(&variant.label) {
                debug!(
                    enrollment_id = %enrollment.id,
                    group = %variant.group,
                    expected = %variant.label,
                    assigned = ?assigned,
                    "Email step not for this variant"
                );
                return Ok(StepOutput::payload(json!({
                    "sent": false,
                    "skipped": "variant_mismatch",
                    "group": variant.group,
                    "expected": variant.label,
                    "assigned": assigned,
                })));
            }
        }

        let request = RenderRequest {
            template_id: config.template_id.clone(),
            context: self.template_context(ctx, enrollment),
            subject_override: config.subject_override.clone(),
        };
        let rendered = with_timeout(self.call_timeout, self.renderer.render(&request)).await?;

        let mut metadata = HashMap::new();
        metadata.insert("sequence_id".to_string(), ctx.sequence.id.to_string());
        metadata.insert("enrollment_id".to_string(), enrollment.id.to_string());
        metadata.insert("step_id".to_string(), step.id.to_string());
        metadata.insert("execution_id".to_string(), ctx.execution.id.to_string());

        let message = OutboundMessage {
            to: ctx.contact.email.clone(),
            from_email: self.email.from_email.clone(),
            from_name: self.email.from_name.clone(),
            subject: rendered.subject.clone(),
            html_body: rendered.html_body,
            text_body: rendered.text_body,
            metadata,
            tags: vec![
                "sequence".to_string(),
                "outreach".to_string(),
                ctx.sequence.name.clone(),
            ],
        };
        let receipt = with_timeout(self.call_timeout, self.transport.send(&message)).await?;

        info!(
            enrollment_id = %enrollment.id,
            step_id = %step.id,
            to = %message.to,
            message_id = %receipt.provider_message_id,
            "Sequence email sent"
        );

        Ok(StepOutput {
            payload: json!({
                "sent": true,
                "template_id": rendered.template_id,
                "subject": rendered.subject,
                "provider": receipt.provider,
                "provider_message_id": receipt.provider_message_id,
            }),
            sent: true,
            provider_message_id: Some(receipt.provider_message_id),
            variant_assignment: None,
        })
    }
}
