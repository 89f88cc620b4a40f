//! Early-exit rules, evaluated fresh immediately before every firing.

use std::sync::Arc;
use std::time::Duration;

use outreach_core::collaborators::EngagementSource;
use outreach_core::types::{Contact, EngagementKind};
use serde::{Deserialize, Serialize};

use crate::handlers::{with_timeout, HandlerError};
use crate::types::{Enrollment, Sequence};

/// The first rule that matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "signal", content = "value")]
pub enum ExitSignal {
    Unsubscribed,
    ExitTag(String),
    Converted,
    Clicked,
    Replied,
}

impl ExitSignal {
    pub fn describe(&self) -> String {
        match self {
            ExitSignal::Unsubscribed => "contact unsubscribed".to_string(),
            ExitSignal::ExitTag(tag) => format!("contact tagged '{}'", tag),
            ExitSignal::Converted => "enrollment converted".to_string(),
            ExitSignal::Clicked => "contact clicked a sequence email".to_string(),
            ExitSignal::Replied => "contact replied to a sequence email".to_string(),
        }
    }
}

pub struct ExitEvaluator {
    engagement: Arc<dyn EngagementSource>,
    call_timeout: Duration,
}

impl ExitEvaluator {
    pub fn new(engagement: Arc<dyn EngagementSource>, call_timeout: Duration) -> Self {
        Self {
            engagement,
            call_timeout,
        }
    }

    /// Checks, in order: global unsubscribe, exit tags, conversion, then
    /// correlated click and reply events. Engagement lookups only happen
    /// for rules the sequence enables.
    pub async fn evaluate(
        &self,
        sequence: &Sequence,
        enrollment: &Enrollment,
        contact: &Contact,
    ) -> Result<Option<ExitSignal>, HandlerError> {
        if contact.unsubscribed {
            return Ok(Some(ExitSignal::Unsubscribed));
        }
        if let Some(tag) = sequence
            .exit_rules
            .exit_tags
            .iter()
            .find(|t| contact.has_tag(t))
        {
            return Ok(Some(ExitSignal::ExitTag(tag.clone())));
        }
        if sequence.exit_rules.on_conversion && enrollment.is_converted() {
            return Ok(Some(ExitSignal::Converted));
        }
        if sequence.exit_rules.on_click
            && self
                .correlated(contact, enrollment, EngagementKind::Clicked)
                .await?
        {
            return Ok(Some(ExitSignal::Clicked));
        }
        if sequence.exit_rules.on_reply
            && self
                .correlated(contact, enrollment, EngagementKind::Replied)
                .await?
        {
            return Ok(Some(ExitSignal::Replied));
        }
        Ok(None)
    }

    pub async fn should_exit(
        &self,
        sequence: &Sequence,
        enrollment: &Enrollment,
        contact: &Contact,
    ) -> Result<bool, HandlerError> {
        Ok(self.evaluate(sequence, enrollment, contact).await?.is_some())
    }

    async fn correlated(
        &self,
        contact: &Contact,
        enrollment: &Enrollment,
        kind: EngagementKind,
    ) -> Result<bool, HandlerError> {
        with_timeout(
            self.call_timeout,
            self.engagement
                .has_event(contact.id, kind, Some(enrollment.id)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use outreach_core::collaborators::CollaboratorResult;
    use outreach_core::types::EngagementEvent;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use uuid::Uuid;

    use crate::types::{Conversion, EnrollmentContext, EnrollmentStatus};

    #[derive(Default)]
    struct Events {
        present: Vec<EngagementKind>,
        queries: Mutex<usize>,
    }

    #[async_trait]
    impl EngagementSource for Events {
        async fn record_event(&self, _event: EngagementEvent) -> CollaboratorResult<bool> {
            Ok(true)
        }

        async fn has_event(
            &self,
            _contact_id: Uuid,
            kind: EngagementKind,
            _enrollment_id: Option<Uuid>,
        ) -> CollaboratorResult<bool> {
            *self.queries.lock() += 1;
            Ok(self.present.contains(&kind))
        }
    }

    fn enrollment(sequence: &Sequence, contact: &Contact) -> Enrollment {
        let now = Utc::now();
        Enrollment {
            id: Uuid::new_v4(),
            sequence_id: sequence.id,
            contact_id: contact.id,
            status: EnrollmentStatus::Active,
            current_step_id: None,
            current_step_order: None,
            current_step_index: 0,
            next_fire_at: None,
            exit: None,
            conversion: None,
            context: EnrollmentContext {
                enrolled_by: "test".into(),
                method: "manual".into(),
                enrolled_at: now,
            },
            custom_variables: HashMap::new(),
            variant_assignments: HashMap::new(),
            enrolled_at: now,
            updated_at: now,
        }
    }

    fn evaluator(present: Vec<EngagementKind>) -> (ExitEvaluator, Arc<Events>) {
        let events = Arc::new(Events {
            present,
            queries: Mutex::new(0),
        });
        (
            ExitEvaluator::new(events.clone(), Duration::from_millis(100)),
            events,
        )
    }

    #[tokio::test]
    async fn test_unsubscribe_and_exit_tags() {
        let (eval, _) = evaluator(vec![]);
        let mut sequence = Sequence::new("S");
        sequence.exit_rules.exit_tags.insert("customer".into());
        let mut contact = Contact::new("ada@example.com");
        let enr = enrollment(&sequence, &contact);

        assert_eq!(eval.evaluate(&sequence, &enr, &contact).await.unwrap(), None);

        contact.tags.insert("customer".into());
        assert_eq!(
            eval.evaluate(&sequence, &enr, &contact).await.unwrap(),
            Some(ExitSignal::ExitTag("customer".into()))
        );

        contact.unsubscribed = true;
        assert_eq!(
            eval.evaluate(&sequence, &enr, &contact).await.unwrap(),
            Some(ExitSignal::Unsubscribed)
        );
    }

    #[tokio::test]
    async fn test_conversion_only_when_rule_enabled() {
        let (eval, _) = evaluator(vec![]);
        let mut sequence = Sequence::new("S");
        let contact = Contact::new("ada@example.com");
        let mut enr = enrollment(&sequence, &contact);
        enr.conversion = Some(Conversion {
            at: Utc::now(),
            value: None,
        });

        assert!(eval.should_exit(&sequence, &enr, &contact).await.unwrap());
        sequence.exit_rules.on_conversion = false;
        assert!(!eval.should_exit(&sequence, &enr, &contact).await.unwrap());
    }

    #[tokio::test]
    async fn test_click_rule_disabled_by_default_skips_lookup() {
        let (eval, events) = evaluator(vec![EngagementKind::Clicked]);
        let mut sequence = Sequence::new("S");
        sequence.exit_rules.on_reply = false;
        let contact = Contact::new("ada@example.com");
        let enr = enrollment(&sequence, &contact);

        assert!(!eval.should_exit(&sequence, &enr, &contact).await.unwrap());
        assert_eq!(*events.queries.lock(), 0);

        sequence.exit_rules.on_click = true;
        assert_eq!(
            eval.evaluate(&sequence, &enr, &contact).await.unwrap(),
            Some(ExitSignal::Clicked)
        );
    }

    #[tokio::test]
    async fn test_reply_exits_by_default() {
        let (eval, _) = evaluator(vec![EngagementKind::Replied]);
        let sequence = Sequence::new("S");
        let contact = Contact::new("ada@example.com");
        let enr = enrollment(&sequence, &contact);
        assert_eq!(
            eval.evaluate(&sequence, &enr, &contact).await.unwrap(),
            Some(ExitSignal::Replied)
        );
    }
}
