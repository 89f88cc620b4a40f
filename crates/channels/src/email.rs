//! Loopback email transport.
//!
//! Accepts rendered messages, assigns a provider message id and keeps the
//! outbox in memory. Failures and latency can be scripted so callers can
//! exercise retry and timeout paths without a real provider.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use outreach_core::collaborators::{CollaboratorResult, MessageTransport};
use outreach_core::types::{DeliveryReceipt, OutboundMessage};
use outreach_core::CollaboratorError;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// A message accepted by the loopback transport.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub provider_message_id: String,
    pub message: OutboundMessage,
}

pub struct LoopbackTransport {
    provider: String,
    outbox: DashMap<String, SentMessage>,
    scripted_failures: Mutex<VecDeque<CollaboratorError>>,
    latency: Mutex<Option<Duration>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        info!("Loopback transport initialized");
        Self {
            provider: "loopback".to_string(),
            outbox: DashMap::new(),
            scripted_failures: Mutex::new(VecDeque::new()),
            latency: Mutex::new(None),
        }
    }

    /// The next `send` calls fail with the queued errors, in order.
    pub fn fail_next(&self, error: CollaboratorError) {
        self.scripted_failures.lock().push_back(error);
    }

    /// Delay every send; used to trigger caller-side timeouts.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    pub fn sent_count(&self) -> usize {
        self.outbox.len()
    }

    pub fn sent_to(&self, email: &str) -> Vec<SentMessage> {
        self.outbox
            .iter()
            .filter(|m| m.value().message.to == email)
            .map(|m| m.value().clone())
            .collect()
    }

    pub fn outbox(&self) -> Vec<SentMessage> {
        self.outbox.iter().map(|m| m.value().clone()).collect()
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageTransport for LoopbackTransport {
    async fn send(&self, message: &OutboundMessage) -> CollaboratorResult<DeliveryReceipt> {
        let latency = *self.latency.lock();
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.scripted_failures.lock().pop_front();
        if let Some(err) = scripted {
            warn!(to = %message.to, error = %err, "Loopback send failed");
            metrics::counter!("transport.send_failures").increment(1);
            return Err(err);
        }

        if !message.to.contains('@') {
            metrics::counter!("transport.send_failures").increment(1);
            return Err(CollaboratorError::Permanent(format!(
                "invalid recipient address: {}",
                message.to
            )));
        }

        let provider_message_id = format!("lb-{}", uuid::Uuid::new_v4());
        debug!(
            to = %message.to,
            subject = %message.subject,
            message_id = %provider_message_id,
            "Message accepted"
        );
        metrics::counter!("transport.messages_sent").increment(1);

        self.outbox.insert(
            provider_message_id.clone(),
            SentMessage {
                provider_message_id: provider_message_id.clone(),
                message: message.clone(),
            },
        );

        Ok(DeliveryReceipt {
            provider: self.provider.clone(),
            provider_message_id,
            accepted_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn message(to: &str) -> OutboundMessage {
        OutboundMessage {
            to: to.to_string(),
            from_email: "noreply@outreach.local".into(),
            from_name: "Outreach".into(),
            subject: "Hello".into(),
            html_body: "<p>Hi</p>".into(),
            text_body: "Hi".into(),
            metadata: HashMap::new(),
            tags: vec!["sequence".into()],
        }
    }

    #[tokio::test]
    async fn test_send_records_outbox() {
        let transport = LoopbackTransport::new();
        let receipt = transport.send(&message("ada@example.com")).await.unwrap();
        assert_eq!(receipt.provider, "loopback");
        assert!(receipt.provider_message_id.starts_with("lb-"));
        assert_eq!(transport.sent_to("ada@example.com").len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failure_then_success() {
        let transport = LoopbackTransport::new();
        transport.fail_next(CollaboratorError::Transient("provider 503".into()));

        let err = transport.send(&message("ada@example.com")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(transport.send(&message("ada@example.com")).await.is_ok());
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_permanent() {
        let transport = LoopbackTransport::new();
        let err = transport.send(&message("not-an-address")).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
