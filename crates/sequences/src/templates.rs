//! Reusable sequence blueprints.
//!
//! A template stores a complete sequence configuration as JSON-friendly
//! data. Instantiating one creates a fresh DRAFT sequence with its steps and
//! bumps the template's usage counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{SequenceError, SequenceResult};
use crate::store::SequenceStore;
use crate::types::{
    ActionStep, ConditionStep, DayType, Delay, EmailStep, ExitRules, Predicate, SendWindow,
    Sequence, Step, StepAction, StepKind, TriggerType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateCategory {
    ColdOutreach,
    LeadNurture,
    Onboarding,
    ReEngagement,
    EventInvite,
    FollowUp,
    Custom,
}

/// Sequence-level settings plus the ordered step list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceBlueprint {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub goal_description: String,
    #[serde(default = "default_trigger")]
    pub trigger: TriggerType,
    #[serde(default)]
    pub exit_rules: ExitRules,
    #[serde(default)]
    pub send_window: SendWindow,
    pub steps: Vec<StepBlueprint>,
}

fn default_trigger() -> TriggerType {
    TriggerType::Manual
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepBlueprint {
    pub name: String,
    #[serde(default)]
    pub delay: Delay,
    #[serde(default = "default_day_type")]
    pub day_type: DayType,
    pub kind: StepKind,
}

fn default_day_type() -> DayType {
    DayType::Business
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceTemplate {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub category: TemplateCategory,
    pub is_public: bool,
    pub configuration: SequenceBlueprint,
    pub times_used: u64,
    pub created_at: DateTime<Utc>,
}

impl SequenceTemplate {
    pub fn new(
        name: impl Into<String>,
        category: TemplateCategory,
        configuration: SequenceBlueprint,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: configuration.description.clone(),
            category,
            is_public: false,
            configuration,
            times_used: 0,
            created_at: Utc::now(),
        }
    }
}

struct Entry {
    template: SequenceTemplate,
    times_used: AtomicU64,
}

pub struct TemplateLibrary {
    store: Arc<SequenceStore>,
    templates: DashMap<Uuid, Arc<Entry>>,
}

impl TemplateLibrary {
    pub fn new(store: Arc<SequenceStore>) -> Self {
        Self {
            store,
            templates: DashMap::new(),
        }
    }

    /// Stores a template after checking its configuration has a name and at
    /// least one named step.
    pub fn register(&self, template: SequenceTemplate) -> SequenceResult<Uuid> {
        let config = &template.configuration;
        if config.name.trim().is_empty() {
            return Err(SequenceError::Validation(
                "template configuration must include a name".into(),
            ));
        }
        if config.steps.is_empty() {
            return Err(SequenceError::Validation(
                "template configuration must include steps".into(),
            ));
        }
        if let Some(i) = config.steps.iter().position(|s| s.name.trim().is_empty()) {
            return Err(SequenceError::Validation(format!("step {} must have a name", i)));
        }

        let id = template.id;
        info!(template_id = %id, name = %template.name, category = ?template.category, "Registering sequence template");
        let times_used = AtomicU64::new(template.times_used);
        self.templates
            .insert(id, Arc::new(Entry { template, times_used }));
        Ok(id)
    }

    pub fn get(&self, id: &Uuid) -> SequenceResult<SequenceTemplate> {
        self.templates
            .get(id)
            .map(|e| snapshot(e.value()))
            .ok_or_else(|| SequenceError::not_found("sequence template", *id))
    }

    /// Most-used first, then by name. Filtered by category when given.
    pub fn list(&self, category: Option<TemplateCategory>) -> Vec<SequenceTemplate> {
        let mut templates: Vec<SequenceTemplate> = self
            .templates
            .iter()
            .filter(|e| category.map_or(true, |c| e.template.category == c))
            .map(|e| snapshot(e.value()))
            .collect();
        templates.sort_by(|a, b| b.times_used.cmp(&a.times_used).then_with(|| a.name.cmp(&b.name)));
        templates
    }

    /// Creates a DRAFT sequence with the template's steps, numbered in
    /// blueprint order.
    pub fn instantiate(&self, template_id: &Uuid, name: Option<String>) -> SequenceResult<Uuid> {
        let entry = self
            .templates
            .get(template_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SequenceError::not_found("sequence template", *template_id))?;
        let config = &entry.template.configuration;

        let mut sequence = Sequence::new(name.unwrap_or_else(|| config.name.clone()));
        sequence.description = config.description.clone();
        sequence.goal_description = config.goal_description.clone();
        sequence.trigger = config.trigger;
        sequence.exit_rules = config.exit_rules.clone();
        sequence.send_window = config.send_window.clone();
        let sequence_id = self.store.create_sequence(sequence)?;

        for (order, blueprint) in config.steps.iter().enumerate() {
            let step = Step::new(order as u32, blueprint.name.clone(), blueprint.kind.clone())
                .with_delay(blueprint.delay.days, blueprint.delay.hours, blueprint.day_type);
            self.store.add_step(&sequence_id, step)?;
        }

        let used = entry.times_used.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            template_id = %template_id,
            sequence_id = %sequence_id,
            times_used = used,
            "Sequence created from template"
        );
        Ok(sequence_id)
    }

    /// Registers the built-in cold outreach and follow-up templates.
    pub fn seed_builtin(&self) -> SequenceResult<Vec<Uuid>> {
        Ok(vec![
            self.register(cold_outreach_template())?,
            self.register(follow_up_template())?,
        ])
    }
}

fn snapshot(entry: &Entry) -> SequenceTemplate {
    SequenceTemplate {
        times_used: entry.times_used.load(Ordering::Relaxed),
        ..entry.template.clone()
    }
}

fn email(template_id: &str) -> StepKind {
    StepKind::Email(EmailStep {
        template_id: template_id.to_string(),
        subject_override: None,
        variant: None,
    })
}

fn step(name: &str, days: u32, kind: StepKind) -> StepBlueprint {
    StepBlueprint {
        name: name.to_string(),
        delay: Delay { days, hours: 0 },
        day_type: DayType::Business,
        kind,
    }
}

pub fn cold_outreach_template() -> SequenceTemplate {
    let mut template = SequenceTemplate::new(
        "Cold Outreach (3 touch)",
        TemplateCategory::ColdOutreach,
        SequenceBlueprint {
            name: "Cold Outreach".to_string(),
            description: "Intro email, two follow-ups and a hand-off task for sales".to_string(),
            goal_description: "Book a discovery call".to_string(),
            trigger: TriggerType::Manual,
            exit_rules: ExitRules::default(),
            send_window: SendWindow::default(),
            steps: vec![
                step("Introduction", 0, email("cold_intro")),
                step("First follow-up", 3, email("cold_follow_up")),
                step(
                    "Engaged?",
                    0,
                    StepKind::Condition(ConditionStep {
                        predicate: Predicate::HasOpened,
                    }),
                ),
                step("Break-up email", 4, email("cold_breakup")),
                step(
                    "Hand off to owner",
                    1,
                    StepKind::Action(ActionStep {
                        action: StepAction::CreateTask {
                            subject: "Call {{first_name}} after outreach".to_string(),
                            notes: "Sequence finished without a reply".to_string(),
                            due_days: 2,
                        },
                    }),
                ),
            ],
        },
    );
    template.is_public = true;
    template
}

pub fn follow_up_template() -> SequenceTemplate {
    let mut template = SequenceTemplate::new(
        "Meeting Follow-up",
        TemplateCategory::FollowUp,
        SequenceBlueprint {
            name: "Meeting Follow-up".to_string(),
            description: "Recap after a meeting, then a nudge a week later".to_string(),
            goal_description: "Move the deal to proposal".to_string(),
            trigger: TriggerType::TagAdded,
            exit_rules: ExitRules {
                on_click: true,
                ..ExitRules::default()
            },
            send_window: SendWindow::default(),
            steps: vec![
                step("Recap", 0, email("meeting_recap")),
                step("Pause", 2, StepKind::Wait),
                step("Check in", 3, email("meeting_check_in")),
                step(
                    "Tag as nurtured",
                    0,
                    StepKind::Action(ActionStep {
                        action: StepAction::AddTag {
                            tag: "nurtured".to_string(),
                        },
                    }),
                ),
            ],
        },
    );
    template.is_public = true;
    template
}
