//! Message template registry and `{{variable}}` renderer.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use outreach_core::collaborators::{CollaboratorResult, TemplateRenderer};
use outreach_core::types::{RenderRequest, RenderedMessage};
use outreach_core::CollaboratorError;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTemplate {
    /// Stable reference used by EMAIL steps.
    pub slug: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    pub active: bool,
}

impl EmailTemplate {
    pub fn new(slug: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            slug: slug.into(),
            subject: subject.into(),
            html_body: body.clone(),
            text_body: body,
            active: true,
        }
    }
}

/// Template store keyed by slug; renders with `{{variable}}` substitution.
/// Placeholders with no matching context key are left untouched.
#[derive(Default)]
pub struct TemplateRegistry {
    templates: DashMap<String, EmailTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self {
            templates: DashMap::new(),
        }
    }

    pub fn register(&self, template: EmailTemplate) {
        self.templates.insert(template.slug.clone(), template);
    }

    pub fn get(&self, slug: &str) -> Option<EmailTemplate> {
        self.templates.get(slug).map(|t| t.clone())
    }

    pub fn deactivate(&self, slug: &str) -> bool {
        match self.templates.get_mut(slug) {
            Some(mut t) => {
                t.active = false;
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<EmailTemplate> {
        self.templates.iter().map(|t| t.value().clone()).collect()
    }
}

#[async_trait]
impl TemplateRenderer for TemplateRegistry {
    async fn render(&self, request: &RenderRequest) -> CollaboratorResult<RenderedMessage> {
        let template = self
            .get(&request.template_id)
            .ok_or_else(|| CollaboratorError::NotFound {
                kind: "template",
                id: request.template_id.clone(),
            })?;
        if !template.active {
            return Err(CollaboratorError::Permanent(format!(
                "template {} is inactive",
                template.slug
            )));
        }

        let subject_source = request
            .subject_override
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&template.subject);

        debug!(template = %template.slug, "Rendering template");

        Ok(RenderedMessage {
            template_id: template.slug.clone(),
            subject: substitute(subject_source, &request.context),
            html_body: substitute(&template.html_body, &request.context),
            text_body: substitute(&template.text_body, &request.context),
            rendered_at: Utc::now(),
        })
    }
}

/// Replaces every `{{ name }}` whose trimmed name is present in `variables`.
pub fn substitute(source: &str, variables: &HashMap<String, serde_json::Value>) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                match variables.get(name) {
                    Some(serde_json::Value::String(s)) => out.push_str(s),
                    Some(serde_json::Value::Null) => {}
                    Some(other) => out.push_str(&other.to_string()),
                    None => out.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
