//! Boundary contracts for the services the sequence engine talks to but does
//! not own: rendering, transport, contact/tag storage, engagement ingestion
//! and outbound webhooks.
//!
//! Implementations may block on the network; callers wrap every call in a
//! timeout and treat [`CollaboratorError::Timeout`] like any other transient
//! failure.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::CollaboratorError;
use crate::types::{
    Contact, ContactTask, DeliveryReceipt, EngagementEvent, EngagementKind, OutboundMessage,
    RenderRequest, RenderedMessage, WebhookRequest, WebhookResponse,
};

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// `(templateId, context) -> rendered subject/body/text`.
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(&self, request: &RenderRequest) -> CollaboratorResult<RenderedMessage>;
}

/// Delivers a rendered message. A rejected message is a
/// [`CollaboratorError::Permanent`]; provider hiccups are transient.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> CollaboratorResult<DeliveryReceipt>;
}

/// Read/write access to contacts and their tags, scores and owners.
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn get_contact(&self, contact_id: Uuid) -> CollaboratorResult<Contact>;

    /// Returns `false` when the tag was already present.
    async fn add_tag(&self, contact_id: Uuid, tag: &str) -> CollaboratorResult<bool>;

    /// Applies `delta` at most once per `idempotency_key`; returns the score.
    async fn adjust_score(
        &self,
        contact_id: Uuid,
        delta: i64,
        idempotency_key: &str,
    ) -> CollaboratorResult<i64>;

    async fn assign_owner(&self, contact_id: Uuid, owner_id: Uuid) -> CollaboratorResult<()>;

    /// Returns `false` when a task with the same idempotency key exists.
    async fn create_task(&self, task: ContactTask) -> CollaboratorResult<bool>;
}

/// The inbound event ingestion pipeline.
#[async_trait]
pub trait EngagementSource: Send + Sync {
    /// Stores an inbound event. Returns `false` for an event id already seen.
    async fn record_event(&self, event: EngagementEvent) -> CollaboratorResult<bool>;

    /// Whether the contact produced an event of `kind`. When `enrollment_id`
    /// is given only events correlated to that enrollment count.
    async fn has_event(
        &self,
        contact_id: Uuid,
        kind: EngagementKind,
        enrollment_id: Option<Uuid>,
    ) -> CollaboratorResult<bool>;
}

#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn call(&self, request: &WebhookRequest) -> CollaboratorResult<WebhookResponse>;
}
