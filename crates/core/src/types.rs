use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Contact snapshot as read from the contact/tag store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub lead_score: i64,
    #[serde(default)]
    pub owner_id: Option<Uuid>,
    /// Global unsubscribe / opt-out flag.
    #[serde(default)]
    pub unsubscribed: bool,
    /// Recipient zone as a UTC offset (`+05:30`, `-08:00`, `UTC`).
    #[serde(default)]
    pub timezone: Option<String>,
}

impl Contact {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            first_name: String::new(),
            last_name: String::new(),
            company: String::new(),
            title: String::new(),
            tags: BTreeSet::new(),
            lead_score: 0,
            owner_id: None,
            unsubscribed: false,
            timezone: None,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// Inbound engagement signal kinds correlated back to outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementKind {
    Delivered,
    Opened,
    Clicked,
    Replied,
    Bounced,
    Unsubscribed,
}

/// An inbound open/click/reply event. `enrollment_id` and `step_id` come from
/// the metadata embedded in the outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementEvent {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub kind: EngagementKind,
    pub enrollment_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
    pub provider_message_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl EngagementEvent {
    pub fn new(contact_id: Uuid, kind: EngagementKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            contact_id,
            kind,
            enrollment_id: None,
            step_id: None,
            provider_message_id: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn correlated(mut self, enrollment_id: Uuid, step_id: Uuid) -> Self {
        self.enrollment_id = Some(enrollment_id);
        self.step_id = Some(step_id);
        self
    }
}

/// Request handed to the template rendering collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderRequest {
    pub template_id: String,
    pub context: HashMap<String, serde_json::Value>,
    /// Per-step subject line that replaces the template's own subject.
    pub subject_override: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub template_id: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    pub rendered_at: DateTime<Utc>,
}

/// A fully rendered message ready for the transport collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: String,
    pub from_email: String,
    pub from_name: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    /// Correlation identifiers echoed back on engagement events.
    pub metadata: HashMap<String, String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub provider: String,
    pub provider_message_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Follow-up task created by an ACTION step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactTask {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub subject: String,
    pub notes: String,
    pub assigned_to: Option<Uuid>,
    pub due_at: DateTime<Utc>,
    /// Stable key so a re-run of the same execution creates no second task.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub url: String,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: u16,
}

/// Analytics event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceEvent {
    pub event_id: Uuid,
    pub event_type: SequenceEventType,
    pub sequence_id: Uuid,
    pub enrollment_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
    pub node_id: String,
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SequenceEventType {
    SequenceActivated,
    SequencePaused,
    SequenceResumed,
    ContactEnrolled,
    StepScheduled,
    StepCompleted,
    StepFailed,
    StepSkipped,
    EnrollmentExited,
    EnrollmentCompleted,
    EnrollmentConverted,
    EngagementRecorded,
}
