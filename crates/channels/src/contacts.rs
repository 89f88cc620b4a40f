//! In-memory contact/tag store.

use async_trait::async_trait;
use dashmap::DashMap;
use outreach_core::collaborators::{CollaboratorResult, ContactStore};
use outreach_core::types::{Contact, ContactTask};
use outreach_core::CollaboratorError;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryContactStore {
    contacts: DashMap<Uuid, Contact>,
    /// Idempotency keys of score adjustments already applied.
    score_adjustments: DashMap<String, i64>,
    tasks: DashMap<String, ContactTask>,
}

impl InMemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, contact: Contact) -> Uuid {
        let id = contact.id;
        self.contacts.insert(id, contact);
        id
    }

    pub fn get(&self, contact_id: &Uuid) -> Option<Contact> {
        self.contacts.get(contact_id).map(|c| c.clone())
    }

    pub fn set_unsubscribed(&self, contact_id: &Uuid, unsubscribed: bool) {
        if let Some(mut contact) = self.contacts.get_mut(contact_id) {
            contact.unsubscribed = unsubscribed;
        }
    }

    pub fn tasks_for(&self, contact_id: &Uuid) -> Vec<ContactTask> {
        self.tasks
            .iter()
            .filter(|t| t.value().contact_id == *contact_id)
            .map(|t| t.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    fn not_found(contact_id: Uuid) -> CollaboratorError {
        CollaboratorError::NotFound {
            kind: "contact",
            id: contact_id.to_string(),
        }
    }
}

#[async_trait]
impl ContactStore for InMemoryContactStore {
    async fn get_contact(&self, contact_id: Uuid) -> CollaboratorResult<Contact> {
        self.get(&contact_id)
            .ok_or_else(|| Self::not_found(contact_id))
    }

    async fn add_tag(&self, contact_id: Uuid, tag: &str) -> CollaboratorResult<bool> {
        let mut contact = self
            .contacts
            .get_mut(&contact_id)
            .ok_or_else(|| Self::not_found(contact_id))?;
        let added = contact.tags.insert(tag.to_string());
        debug!(contact_id = %contact_id, tag = %tag, added, "Tag applied");
        Ok(added)
    }

    async fn adjust_score(
        &self,
        contact_id: Uuid,
        delta: i64,
        idempotency_key: &str,
    ) -> CollaboratorResult<i64> {
        let mut contact = self
            .contacts
            .get_mut(&contact_id)
            .ok_or_else(|| Self::not_found(contact_id))?;
        if self.score_adjustments.contains_key(idempotency_key) {
            return Ok(contact.lead_score);
        }
        contact.lead_score += delta;
        self.score_adjustments
            .insert(idempotency_key.to_string(), delta);
        Ok(contact.lead_score)
    }

    async fn assign_owner(&self, contact_id: Uuid, owner_id: Uuid) -> CollaboratorResult<()> {
        let mut contact = self
            .contacts
            .get_mut(&contact_id)
            .ok_or_else(|| Self::not_found(contact_id))?;
        contact.owner_id = Some(owner_id);
        info!(contact_id = %contact_id, owner_id = %owner_id, "Contact reassigned");
        Ok(())
    }

    async fn create_task(&self, task: ContactTask) -> CollaboratorResult<bool> {
        if !self.contacts.contains_key(&task.contact_id) {
            return Err(Self::not_found(task.contact_id));
        }
        if self.tasks.contains_key(&task.idempotency_key) {
            return Ok(false);
        }
        self.tasks.insert(task.idempotency_key.clone(), task);
        Ok(true)
    }
}
