//! Webhook client that records calls instead of performing HTTP requests.

use async_trait::async_trait;
use dashmap::DashMap;
use outreach_core::collaborators::{CollaboratorResult, WebhookClient};
use outreach_core::types::{WebhookRequest, WebhookResponse};
use outreach_core::CollaboratorError;
use tracing::info;

/// Deduplicates on the request's idempotency key, so a replayed ACTION step
/// produces one delivery.
#[derive(Default)]
pub struct RecordingWebhookClient {
    delivered: DashMap<String, WebhookRequest>,
}

impl RecordingWebhookClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<WebhookRequest> {
        self.delivered.iter().map(|r| r.value().clone()).collect()
    }
}

#[async_trait]
impl WebhookClient for RecordingWebhookClient {
    async fn call(&self, request: &WebhookRequest) -> CollaboratorResult<WebhookResponse> {
        if !(request.url.starts_with("http://") || request.url.starts_with("https://")) {
            return Err(CollaboratorError::Permanent(format!(
                "unsupported webhook url: {}",
                request.url
            )));
        }
        if self.delivered.contains_key(&request.idempotency_key) {
            return Ok(WebhookResponse { status: 200 });
        }
        info!(url = %request.url, key = %request.idempotency_key, "Webhook delivered");
        metrics::counter!("webhook.calls").increment(1);
        self.delivered
            .insert(request.idempotency_key.clone(), request.clone());
        Ok(WebhookResponse { status: 200 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replayed_call_delivers_once() {
        let client = RecordingWebhookClient::new();
        let request = WebhookRequest {
            url: "https://hooks.example.com/lead".into(),
            payload: serde_json::json!({"lead": 1}),
            idempotency_key: "exec-1".into(),
        };
        client.call(&request).await.unwrap();
        client.call(&request).await.unwrap();
        assert_eq!(client.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_scheme_rejected() {
        let client = RecordingWebhookClient::new();
        let request = WebhookRequest {
            url: "ftp://example.com".into(),
            payload: serde_json::Value::Null,
            idempotency_key: "k".into(),
        };
        assert!(client.call(&request).await.is_err());
    }
}
