//! Step handlers: one strategy per step type, dispatched through
//! [`HandlerRegistry`].

pub mod ab_test;
pub mod action;
pub mod condition;
pub mod email;
pub mod wait;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_core::collaborators::CollaboratorResult;
use outreach_core::types::Contact;
use outreach_core::CollaboratorError;
use thiserror::Error;

use crate::types::{Enrollment, Sequence, Step, StepExecution, StepType};

pub use ab_test::AbTestHandler;
pub use action::ActionHandler;
pub use condition::{ConditionHandler, CustomPredicate};
pub use email::EmailHandler;
pub use wait::WaitHandler;

/// Everything a handler may read about the firing.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub sequence: Sequence,
    pub execution: StepExecution,
    /// Fetched fresh for this firing.
    pub contact: Contact,
    pub now: DateTime<Utc>,
}

impl StepContext {
    /// Key that makes a side effect apply once per (enrollment, step).
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.execution.enrollment_id, self.execution.step_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub payload: serde_json::Value,
    /// A message was handed to the transport.
    pub sent: bool,
    pub provider_message_id: Option<String>,
    /// `(group, label)` to persist on the enrollment.
    pub variant_assignment: Option<(String, String)>,
}

impl StepOutput {
    pub fn payload(payload: serde_json::Value) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum HandlerError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("timed out after {millis}ms")]
    Timeout { millis: u64 },

    /// The step's configuration does not fit its handler.
    #[error("misconfigured step: {0}")]
    Misconfigured(String),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Transient(_) | HandlerError::Timeout { .. })
    }
}

impl From<CollaboratorError> for HandlerError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Timeout { millis, .. } => HandlerError::Timeout { millis },
            CollaboratorError::Transient(msg) => HandlerError::Transient(msg),
            CollaboratorError::Permanent(msg) => HandlerError::Permanent(msg),
            e @ CollaboratorError::NotFound { .. } => HandlerError::Permanent(e.to_string()),
        }
    }
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    fn step_type(&self) -> StepType;

    async fn execute(
        &self,
        ctx: &StepContext,
        enrollment: &Enrollment,
        step: &Step,
    ) -> Result<StepOutput, HandlerError>;
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<StepType, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any handler already registered for the same step type.
    pub fn register(&mut self, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(handler.step_type(), handler);
    }

    pub fn get(&self, step_type: StepType) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(&step_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Runs one collaborator call under `limit`; an elapsed timer is a
/// retryable [`HandlerError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, HandlerError>
where
    F: Future<Output = CollaboratorResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(HandlerError::from),
        Err(_) => Err(HandlerError::Timeout {
            millis: limit.as_millis() as u64,
        }),
    }
}
