//! In-process implementations of the collaborators the sequence engine
//! depends on: template rendering, message transport, contact/tag storage,
//! engagement event ingestion and outbound webhooks.

pub mod contacts;
pub mod email;
pub mod ingest;
pub mod templates;
pub mod webhook;

pub use contacts::InMemoryContactStore;
pub use email::LoopbackTransport;
pub use ingest::EngagementLog;
pub use templates::{EmailTemplate, TemplateRegistry};
pub use webhook::RecordingWebhookClient;
