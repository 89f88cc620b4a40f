//! Engagement ingestion: keeps inbound open/click/reply events correlated
//! to the enrollment and step that produced the outbound message.

use async_trait::async_trait;
use dashmap::DashMap;
use outreach_core::collaborators::{CollaboratorResult, EngagementSource};
use outreach_core::types::{EngagementEvent, EngagementKind};
use tracing::debug;
use uuid::Uuid;

/// Engagement events indexed by contact.
#[derive(Default)]
pub struct EngagementLog {
    by_contact: DashMap<Uuid, Vec<EngagementEvent>>,
}

impl EngagementLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an inbound event. Duplicate event ids are ignored.
    pub fn ingest(&self, event: EngagementEvent) -> bool {
        let mut events = self.by_contact.entry(event.contact_id).or_default();
        if events.iter().any(|e| e.id == event.id) {
            return false;
        }
        debug!(
            contact_id = %event.contact_id,
            kind = ?event.kind,
            enrollment_id = ?event.enrollment_id,
            "Engagement event ingested"
        );
        metrics::counter!("engagement.events", "kind" => format!("{:?}", event.kind))
            .increment(1);
        events.push(event);
        true
    }

    pub fn events_for_contact(&self, contact_id: &Uuid) -> Vec<EngagementEvent> {
        self.by_contact
            .get(contact_id)
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EngagementSource for EngagementLog {
    async fn record_event(&self, event: EngagementEvent) -> CollaboratorResult<bool> {
        Ok(self.ingest(event))
    }

    async fn has_event(
        &self,
        contact_id: Uuid,
        kind: EngagementKind,
        enrollment_id: Option<Uuid>,
    ) -> CollaboratorResult<bool> {
        let Some(events) = self.by_contact.get(&contact_id) else {
            return Ok(false);
        };
        Ok(events.iter().any(|e| {
            e.kind == kind && enrollment_id.map_or(true, |id| e.enrollment_id == Some(id))
        }))
    }
}
