use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use outreach_core::collaborators::{ContactStore, WebhookClient};
use outreach_core::types::{ContactTask, WebhookRequest};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{with_timeout, HandlerError, StepContext, StepHandler, StepOutput};
use crate::types::{Enrollment, Step, StepAction, StepKind, StepType};

/// Side-effecting contact mutations. Every mutation is keyed by
/// `enrollment:step` so a retried or redelivered firing applies it once.
pub struct ActionHandler {
    contacts: Arc<dyn ContactStore>,
    webhooks: Arc<dyn WebhookClient>,
    call_timeout: Duration,
}

impl ActionHandler {
    pub fn new(
        contacts: Arc<dyn ContactStore>,
        webhooks: Arc<dyn WebhookClient>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            contacts,
            webhooks,
            call_timeout,
        }
    }
}

#[async_trait]
impl StepHandler for ActionHandler {
    fn step_type(&self) -> StepType {
        StepType::Action
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        enrollment: &Enrollment,
        step: &Step,
    ) -> Result<StepOutput, HandlerError> {
        let StepKind::Action(config) = &step.kind else {
            return Err(HandlerError::Misconfigured(format!(
                "step {} is not an action step",
                step.id
            )));
        };
        let contact_id = enrollment.contact_id;
        let key = ctx.idempotency_key();

        let payload = match &config.action {
            StepAction::AddTag { tag } => {
                let added =
                    with_timeout(self.call_timeout, self.contacts.add_tag(contact_id, tag)).await?;
                json!({ "action": "add_tag", "tag": tag, "added": added })
            }
            StepAction::AdjustScore { delta } => {
                let score = with_timeout(
                    self.call_timeout,
                    self.contacts.adjust_score(contact_id, *delta, &key),
                )
                .await?;
                json!({ "action": "adjust_score", "delta": delta, "score": score })
            }
            StepAction::AssignOwner { owner_id } => {
                with_timeout(
                    self.call_timeout,
                    self.contacts.assign_owner(contact_id, *owner_id),
                )
                .await?;
                json!({ "action": "assign_owner", "owner_id": owner_id })
            }
            StepAction::CreateTask {
                subject,
                notes,
                due_days,
            } => {
                let task = ContactTask {
                    id: Uuid::new_v4(),
                    contact_id,
                    subject: subject.clone(),
                    notes: notes.clone(),
                    assigned_to: ctx.contact.owner_id,
                    due_at: ctx.now + ChronoDuration::days(*due_days as i64),
                    idempotency_key: key.clone(),
                };
                let created =
                    with_timeout(self.call_timeout, self.contacts.create_task(task)).await?;
                json!({ "action": "create_task", "subject": subject, "created": created })
            }
            StepAction::Webhook { url, payload } => {
                let request = WebhookRequest {
                    url: url.clone(),
                    payload: json!({
                        "sequence_id": ctx.sequence.id,
                        "enrollment_id": enrollment.id,
                        "contact_id": contact_id,
                        "step_id": step.id,
                        "data": payload,
                    }),
                    idempotency_key: key.clone(),
                };
                let response =
                    with_timeout(self.call_timeout, self.webhooks.call(&request)).await?;
                json!({ "action": "webhook", "url": url, "status": response.status })
            }
        };

        info!(
            enrollment_id = %enrollment.id,
            step_id = %step.id,
            action = config.action.name(),
            "Sequence action performed"
        );
        Ok(StepOutput::payload(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::fixtures::firing;
    use crate::types::ActionStep;
    use outreach_channels::{InMemoryContactStore, RecordingWebhookClient};
    use outreach_core::types::Contact;

    struct Fixture {
        handler: ActionHandler,
        contacts: Arc<InMemoryContactStore>,
        webhooks: Arc<RecordingWebhookClient>,
        contact: Contact,
    }

    fn fixture() -> Fixture {
        let contacts = Arc::new(InMemoryContactStore::new());
        let webhooks = Arc::new(RecordingWebhookClient::new());
        let contact = Contact::new("ada@example.com");
        contacts.upsert(contact.clone());
        Fixture {
            handler: ActionHandler::new(contacts.clone(), webhooks.clone(), Duration::from_millis(200)),
            contacts,
            webhooks,
            contact,
        }
    }

    fn action(action: StepAction) -> Step {
        Step::new(0, "Act", StepKind::Action(ActionStep { action }))
    }

    #[tokio::test]
    async fn test_add_tag_applies_once() {
        let f = fixture();
        let (ctx, enrollment, step) = firing(
            f.contact.clone(),
            action(StepAction::AddTag { tag: "engaged".into() }),
        );
        let first = f.handler.execute(&ctx, &enrollment, &step).await.unwrap();
        let again = f.handler.execute(&ctx, &enrollment, &step).await.unwrap();
        assert_eq!(first.payload["added"], true);
        assert_eq!(again.payload["added"], false);
        assert!(f.contacts.get(&f.contact.id).unwrap().has_tag("engaged"));
    }

    #[tokio::test]
    async fn test_replayed_score_adjustment_applies_once() {
        let f = fixture();
        let (ctx, enrollment, step) =
            firing(f.contact.clone(), action(StepAction::AdjustScore { delta: 15 }));
        for _ in 0..3 {
            let output = f.handler.execute(&ctx, &enrollment, &step).await.unwrap();
            assert_eq!(output.payload["score"], 15);
        }
        assert_eq!(f.contacts.get(&f.contact.id).unwrap().lead_score, 15);

        // A different step of the same enrollment has its own key.
        let other = Step::new(1, "Bump", step.kind.clone());
        let mut ctx = ctx;
        ctx.execution.step_id = other.id;
        let output = f.handler.execute(&ctx, &enrollment, &other).await.unwrap();
        assert_eq!(output.payload["score"], 30);
    }

    #[tokio::test]
    async fn test_create_task_dues_from_now_and_dedupes() {
        let f = fixture();
        let (ctx, enrollment, step) = firing(
            f.contact.clone(),
            action(StepAction::CreateTask {
                subject: "Call Ada".into(),
                notes: String::new(),
                due_days: 2,
            }),
        );
        let first = f.handler.execute(&ctx, &enrollment, &step).await.unwrap();
        let again = f.handler.execute(&ctx, &enrollment, &step).await.unwrap();
        assert_eq!(first.payload["created"], true);
        assert_eq!(again.payload["created"], false);

        let tasks = f.contacts.tasks_for(&f.contact.id);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].due_at, ctx.now + ChronoDuration::days(2));
        assert_eq!(tasks[0].idempotency_key, ctx.idempotency_key());
    }

    #[tokio::test]
    async fn test_webhook_carries_ids_and_rejects_bad_urls() {
        let f = fixture();
        let (ctx, enrollment, step) = firing(
            f.contact.clone(),
            action(StepAction::Webhook {
                url: "https://hooks.example.com/lead".into(),
                payload: serde_json::json!({ "stage": "warm" }),
            }),
        );
        f.handler.execute(&ctx, &enrollment, &step).await.unwrap();
        f.handler.execute(&ctx, &enrollment, &step).await.unwrap();
        let delivered = f.webhooks.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload["enrollment_id"], json!(enrollment.id));
        assert_eq!(delivered[0].payload["data"]["stage"], "warm");

        let (ctx, enrollment, step) = firing(
            f.contact.clone(),
            action(StepAction::Webhook {
                url: "ftp://hooks.example.com".into(),
                payload: serde_json::Value::Null,
            }),
        );
        let err = f.handler.execute(&ctx, &enrollment, &step).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
