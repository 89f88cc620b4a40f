//! Shared types, collaborator contracts and configuration for the outreach
//! sequence engine.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod types;

pub use config::AppConfig;
pub use error::{CollaboratorError, CoreError, CoreResult};
